//! Response source backed by a `llama-cli` child process.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parley_core::config::ParleyConfig;

use crate::error::ChatError;
use crate::gguf;
use crate::prompt::{PromptMessage, PromptRole};
use crate::source::{GenerationRequest, ResponseSource, TokenStream};

const READ_CHUNK: usize = 256;

/// Runs the configured `llama-cli` binary once per generation and streams
/// its stdout.
///
/// The child is spawned with `kill_on_drop`, so when the pipeline drops the
/// receiver the reader task exits and the process is killed.
#[derive(Debug, Clone)]
pub struct LlamaCliSource {
    binary: PathBuf,
    model_path: PathBuf,
    name: String,
    context_size: u32,
    batch_size: u32,
    gpu_layers: u32,
    mmap: bool,
    mlock: bool,
}

impl LlamaCliSource {
    /// Prepare a source for `model_dir/model_name`.
    ///
    /// Fails when the model file does not exist.
    pub fn new(config: &ParleyConfig) -> Result<Self, ChatError> {
        let model_path = Path::new(&config.model.model_dir).join(&config.model.model_name);
        if config.model.model_name.trim().is_empty() || !model_path.is_file() {
            return Err(ChatError::Generation(format!(
                "Model file '{}' not found.",
                model_path.display()
            )));
        }

        let gpu_layers = if config.backend.backend_type.eq_ignore_ascii_case("CPU Only") {
            0
        } else if config.model.dynamic_gpu_layers {
            dynamic_gpu_layers(&model_path, config.model.vram_size)
        } else {
            config.model.gpu_layers
        };

        info!(
            model = %model_path.display(),
            backend = %config.backend.backend_type,
            gpu_layers,
            "llama-cli source prepared"
        );
        Ok(Self {
            binary: PathBuf::from(&config.backend.llama_bin_path),
            name: config.model.model_name.clone(),
            model_path,
            context_size: config.model.context_size,
            batch_size: config.model.batch_size,
            gpu_layers,
            mmap: config.model.mmap,
            mlock: config.model.mlock,
        })
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    fn args(&self, request: &GenerationRequest) -> Vec<String> {
        let mut args = vec![
            "-m".to_string(),
            self.model_path.display().to_string(),
            "-p".to_string(),
            render_prompt(&request.messages),
            "-n".to_string(),
            request.params.max_tokens.to_string(),
            "--temp".to_string(),
            request.params.temperature.to_string(),
            "--repeat-penalty".to_string(),
            request.params.repeat_penalty.to_string(),
            "-c".to_string(),
            self.context_size.to_string(),
            "-b".to_string(),
            self.batch_size.to_string(),
            "-no-cnv".to_string(),
            "--no-display-prompt".to_string(),
        ];
        if self.gpu_layers > 0 {
            args.push("-ngl".to_string());
            args.push(self.gpu_layers.to_string());
        }
        if self.mlock {
            args.push("--mlock".to_string());
        }
        if !self.mmap {
            args.push("--no-mmap".to_string());
        }
        args
    }
}

#[async_trait]
impl ResponseSource for LlamaCliSource {
    fn name(&self) -> &str {
        &self.name
    }

    /// Stdout reads carry the model's own spacing.
    fn joins_with_space(&self) -> Option<bool> {
        Some(false)
    }

    async fn generate(&self, request: GenerationRequest) -> Result<TokenStream, ChatError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.args(&request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            ChatError::Generation(format!(
                "failed to start {}: {e}",
                self.binary.display()
            ))
        })?;
        let Some(mut stdout) = child.stdout.take() else {
            return Err(ChatError::Generation("llama-cli stdout unavailable".to_string()));
        };

        let (tx, rx) = mpsc::channel(request.queue_capacity.max(1));
        let streaming = request.params.stream;

        tokio::spawn(async move {
            let mut buf = [0u8; READ_CHUNK];
            let mut pending: Vec<u8> = Vec::new();
            let mut collected = String::new();

            loop {
                let n = match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ChatError::Generation(format!("read failed: {e}"))))
                            .await;
                        return;
                    }
                };
                pending.extend_from_slice(&buf[..n]);
                let text = take_utf8(&mut pending);
                if text.is_empty() {
                    continue;
                }
                if streaming {
                    if tx.send(Ok(text)).await.is_err() {
                        debug!("llama-cli receiver dropped, stopping");
                        return;
                    }
                } else {
                    collected.push_str(&text);
                }
            }

            if !pending.is_empty() {
                collected.push_str(&String::from_utf8_lossy(&pending));
            }
            if !collected.is_empty() && tx.send(Ok(collected)).await.is_err() {
                return;
            }

            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    warn!(%status, "llama-cli exited with failure");
                    let _ = tx
                        .send(Err(ChatError::Generation(format!(
                            "llama-cli exited with {status}"
                        ))))
                        .await;
                }
                Err(e) => {
                    let _ = tx
                        .send(Err(ChatError::Generation(format!("wait failed: {e}"))))
                        .await;
                }
            }
        });

        Ok(rx)
    }
}

/// Layers of the model at `path` that fit into `vram_mb`.
///
/// Unreadable headers offload nothing.
fn dynamic_gpu_layers(path: &Path, vram_mb: u32) -> u32 {
    let size_mb = match std::fs::metadata(path) {
        Ok(meta) => meta.len() as f64 / (1024.0 * 1024.0),
        Err(e) => {
            warn!(model = %path.display(), error = %e, "Cannot stat model file");
            return 0;
        }
    };
    match gguf::read_header(path) {
        Ok(gguf::ModelHeader {
            block_count: Some(blocks),
            ..
        }) => {
            let layers = gguf::fit_gpu_layers(size_mb, blocks, vram_mb);
            debug!(size_mb, blocks, vram_mb, layers, "GPU layers sized");
            layers
        }
        Ok(_) => {
            warn!(model = %path.display(), "Model header has no block count");
            0
        }
        Err(e) => {
            warn!(model = %path.display(), error = %e, "Cannot read model header");
            0
        }
    }
}

/// Flatten chat messages into a single prompt.
fn render_prompt(messages: &[PromptMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        let speaker = match message.role {
            PromptRole::System => "System",
            PromptRole::User => "User",
            PromptRole::Assistant => "Assistant",
        };
        prompt.push_str(speaker);
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push('\n');
    }
    prompt.push_str("Assistant:");
    prompt
}

/// Drain the longest valid UTF-8 prefix of `pending`, keeping an incomplete
/// trailing sequence for the next read. Invalid bytes are replaced.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(e) => {
            let valid = e.valid_up_to();
            let consumed = match e.error_len() {
                Some(bad) => valid + bad,
                None => valid,
            };
            let text = String::from_utf8_lossy(&pending[..consumed]).into_owned();
            pending.drain(..consumed);
            text
        }
    }
}
