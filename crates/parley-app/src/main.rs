//! Parley application binary - composition root.
//!
//! 1. Parse CLI args and load configuration from TOML
//! 2. Initialise tracing
//! 3. Open the session store and attachment slots under the data directory
//! 4. Build the retrieval context and the interaction controller
//! 5. Run the line-based terminal loop until `/quit` or end of input

mod cli;
mod commands;

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};

use parley_chat::{ChatError, DisabledWebSearch, InteractionController};
use parley_core::config::ParleyConfig;
use parley_core::events::PipelineEvent;
use parley_retrieval::{RetrievalContext, TermHashEmbedding};
use parley_storage::{AttachmentSlots, SessionStore};

use cli::CliArgs;
use commands::{Command, InputBuffer, HELP};

/// Renders pipeline events to stdout.
#[derive(Default)]
struct Renderer {
    /// Assistant text already printed for the current turn.
    shown: String,
}

impl Renderer {
    fn render(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::AssistantContent { content, .. } => {
                match content.strip_prefix(self.shown.as_str()) {
                    Some(delta) if !self.shown.is_empty() => print!("{delta}"),
                    // Single-line content such as the countdown is redrawn in place.
                    _ if !self.shown.contains('\n') => print!("\r\x1b[2K{content}"),
                    _ => print!("\n{content}"),
                }
                let _ = std::io::stdout().flush();
                self.shown = content;
            }
            PipelineEvent::TurnStarted { .. } => self.shown.clear(),
            PipelineEvent::TurnCompleted { .. }
            | PipelineEvent::TurnCancelled { .. }
            | PipelineEvent::TurnFailed { .. } => {
                println!();
                self.shown.clear();
            }
            PipelineEvent::Status { message } => println!("[{message}]"),
            PipelineEvent::PersistFailed { reason, .. } => {
                println!("[History not saved: {reason}]")
            }
            PipelineEvent::RetrievalRebuilt {
                file_count,
                chunk_count,
            } => tracing::debug!(file_count, chunk_count, "Retrieval index ready"),
            other => tracing::trace!(event = other.event_name(), "Pipeline event"),
        }
    }
}

/// Execute one command. Returns `false` when the loop should stop.
async fn handle(
    controller: &InteractionController,
    command: Command,
    config_path: &Path,
) -> bool {
    match command {
        Command::Submit(text) => {
            // Output and status arrive through the event stream.
            let _ = controller.submit(&text).await;
        }
        Command::Cancel => {
            controller.cancel();
        }
        Command::NewSession => report(controller.start_session()),
        Command::Attach(paths) => {
            if let Err(e) = controller.attach_files(&paths).await {
                println!("[Error: {}]", e.detail());
            }
        }
        Command::Eject(index) => {
            controller.eject_file(index).await;
        }
        Command::DetachAll => {
            controller.remove_all_attachments().await;
        }
        Command::Sessions => match controller.list_sessions() {
            Ok(sessions) if sessions.is_empty() => println!("No stored sessions."),
            Ok(sessions) => {
                for (slot, s) in sessions.iter().enumerate() {
                    println!(
                        "{:>2}. {} ({} turns, {})",
                        slot + 1,
                        s.label,
                        s.turn_count,
                        s.modified_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
            Err(e) => println!("[Error: {}]", e.detail()),
        },
        Command::Load(slot) => match controller.load_session(slot).await {
            Ok(_) => {
                if let Some(session) = controller.session() {
                    for turn in &session.log {
                        println!("{}: {}", turn.role, turn.content);
                    }
                }
            }
            Err(e) => println!("[Error: {}]", e.detail()),
        },
        Command::Mode(mode) => {
            controller.set_mode(mode);
            println!("[Mode: {mode}]");
        }
        Command::Web(enabled) => {
            controller.set_web_search(enabled);
            println!("[Web search {}]", if enabled { "on" } else { "off" });
        }
        Command::Think(enabled) => {
            controller.set_disable_think(!enabled);
            println!("[Thinking {}]", if enabled { "on" } else { "off" });
        }
        Command::Copy => {
            if let Some(text) = controller.copy_last_response() {
                println!("{text}");
            }
        }
        Command::ClearHistory => match controller.delete_all_history() {
            Ok(deleted) => println!("[{deleted} sessions deleted]"),
            Err(e) => println!("[Error: {}]", e.detail()),
        },
        Command::LoadModel => {
            // Failures are published as status.
            let _ = controller.load_configured_model();
        }
        Command::UnloadModel => report(controller.unload_model()),
        Command::Set { key, value } => match controller.apply_setting(&key, &value).await {
            Ok(true) => println!("[{key} updated; reload the model with /model to apply]"),
            Ok(false) => println!("[{key} updated]"),
            Err(e) => println!("[Error: {}]", e.detail()),
        },
        Command::SaveConfig => match controller.config().save(config_path) {
            Ok(()) => println!("[Settings saved to {}]", config_path.display()),
            Err(e) => println!("[Error: {e}]"),
        },
        Command::Help => println!("{HELP}"),
        Command::Invalid(line) => println!("[Unknown command: {line}. Type /help.]"),
        Command::Quit => {
            if !controller.phase().is_idle() {
                controller.cancel();
            }
            return false;
        }
    }
    true
}

fn report(result: Result<String, ChatError>) {
    match result {
        Ok(_) => {}
        Err(ChatError::Busy) => println!("[Wait for the current response or cancel it first.]"),
        Err(e) => println!("[Error: {}]", e.detail()),
    }
}

/// Forward stdin lines into a channel so the main loop can select on them.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read stdin");
                    break;
                }
            }
        }
    });
    rx
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_path = args.resolve_config_path();
    let mut config = ParleyConfig::load_or_default(&config_path);
    if let Some(ref model) = args.model {
        config.model.model_name = model.clone();
    }

    // Tracing.
    let log_level = args.resolve_log_level(&config.general.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting Parley v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(path = %config_path.display(), "Configuration loaded");

    // Storage.
    let data_dir = args.resolve_data_dir(&config.general.data_dir);
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }
    let store = Arc::new(SessionStore::open(
        data_dir.join("history"),
        config.model.max_history_slots,
    )?);
    let slots = AttachmentSlots::new(data_dir.join("temp"), config.model.max_attach_slots)?;
    tracing::info!(path = %data_dir.display(), "Data directory ready");

    // Retrieval.
    let retrieval = Arc::new(RetrievalContext::new(
        Arc::new(TermHashEmbedding::new()),
        config.retrieval.clone(),
    ));

    let model_configured = !config.model.model_name.trim().is_empty();
    let controller = InteractionController::new(
        config,
        store,
        retrieval,
        slots,
        Arc::new(DisabledWebSearch),
    );
    let mut events = controller.subscribe();
    let mut renderer = Renderer::default();

    if model_configured {
        // Failures are published as status; the user can fix the path and retry.
        let _ = controller.load_configured_model();
    } else {
        println!("[No model configured. Use /set model_name <file> then /model.]");
    }
    println!("Type /help for commands.");

    let mut lines = spawn_stdin_reader();
    let mut buffer = InputBuffer::default();
    let mut input_closed = false;

    loop {
        tokio::select! {
            line = lines.recv(), if !input_closed => {
                let Some(line) = line else {
                    tracing::info!("Input closed");
                    input_closed = true;
                    if commands::input_drained(input_closed, controller.phase()) {
                        break;
                    }
                    continue;
                };
                let Some(input) = buffer.push(&line) else {
                    continue;
                };
                if !handle(&controller, commands::parse(&input), &config_path).await {
                    break;
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => renderer.render(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Renderer lagged behind events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                if commands::input_drained(input_closed, controller.phase()) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if controller.phase().is_idle() {
                    break;
                }
                controller.cancel();
            }
        }
    }

    tracing::info!("Parley stopped");
    Ok(())
}
