//! The response source boundary: anything that turns a prompt into a stream
//! of text increments.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use parley_core::config::ParleyConfig;

use crate::error::ChatError;
use crate::profile::ModelProfile;
use crate::prompt::PromptMessage;

/// Increments produced by a source. A single `Err` ends the stream.
pub type TokenStream = mpsc::Receiver<Result<String, ChatError>>;

/// Sampling parameters for one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub repeat_penalty: f32,
    pub stream: bool,
}

impl GenerationParams {
    pub fn from_config(config: &ParleyConfig) -> Self {
        Self {
            max_tokens: config.model.context_size,
            temperature: config.model.temperature,
            repeat_penalty: config.model.repeat_penalty,
            stream: config.model.stream_output,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub messages: Vec<PromptMessage>,
    pub params: GenerationParams,
    /// Capacity of the channel the source writes increments into.
    pub queue_capacity: usize,
}

/// A loaded model.
///
/// Implementations push increments into a bounded channel and stop when the
/// receiver is dropped; the caller may stop consuming at any point.
#[async_trait]
pub trait ResponseSource: Send + Sync {
    /// Display name of the loaded model.
    fn name(&self) -> &str;

    fn profile(&self) -> ModelProfile {
        ModelProfile::from_model_name(self.name())
    }

    /// Whether a space goes after each increment. `None` defers to the
    /// pipeline's `join_with_space` setting.
    fn joins_with_space(&self) -> Option<bool> {
        None
    }

    async fn generate(&self, request: GenerationRequest) -> Result<TokenStream, ChatError>;
}

// =============================================================================
// Scripted source
// =============================================================================

/// A source that replays a fixed list of increments.
///
/// Used by tests and demos in place of a real model. Every request is
/// recorded so callers can inspect the assembled prompt.
pub struct ScriptedSource {
    name: String,
    tokens: Vec<String>,
    fail_after: Option<(usize, String)>,
    reject_with: Option<String>,
    token_delay: Duration,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedSource {
    pub fn new(name: impl Into<String>, tokens: &[&str]) -> Self {
        Self {
            name: name.into(),
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            fail_after: None,
            reject_with: None,
            token_delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Emit an error after `count` increments instead of finishing.
    pub fn failing_after(mut self, count: usize, message: impl Into<String>) -> Self {
        self.fail_after = Some((count, message.into()));
        self
    }

    /// Fail the `generate` call itself.
    pub fn rejecting(mut self, message: impl Into<String>) -> Self {
        self.reject_with = Some(message.into());
        self
    }

    /// Sleep between increments.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn into_shared(self) -> Arc<dyn ResponseSource> {
        Arc::new(self)
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ResponseSource for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: GenerationRequest) -> Result<TokenStream, ChatError> {
        let capacity = request.queue_capacity.max(1);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        if let Some(message) = &self.reject_with {
            return Err(ChatError::Generation(message.clone()));
        }

        let (tx, rx) = mpsc::channel(capacity);
        let tokens = self.tokens.clone();
        let fail_after = self.fail_after.clone();
        let delay = self.token_delay;

        tokio::spawn(async move {
            for (i, token) in tokens.into_iter().enumerate() {
                if let Some((count, message)) = &fail_after {
                    if i == *count {
                        let _ = tx.send(Err(ChatError::Generation(message.clone()))).await;
                        return;
                    }
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(token)).await.is_err() {
                    tracing::debug!("Scripted stream receiver dropped");
                    return;
                }
            }
            if let Some((_, message)) = fail_after {
                let _ = tx.send(Err(ChatError::Generation(message))).await;
            }
        });

        Ok(rx)
    }
}
