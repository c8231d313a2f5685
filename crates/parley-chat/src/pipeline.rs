//! The turn pipeline: one user input from submit to persisted response.
//!
//! A turn runs in two steps. `begin` validates the input, claims the
//! interaction phase and appends the user turn and an assistant placeholder to
//! the session log. `drive` then runs the afterthought countdown, the optional
//! thinking delay and the token stream, and finally persists the session.
//! Every suspension point races against the cancel flag.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use parley_core::config::ParleyConfig;
use parley_core::events::PipelineEvent;
use parley_core::types::{OperationMode, PipelinePhase, Session, SessionId, Turn};
use parley_storage::SessionStore;

use crate::augment::Augmentor;
use crate::cancel::CancelFlag;
use crate::error::ChatError;
use crate::prompt::{build_messages, PromptInputs};
use crate::source::{GenerationParams, GenerationRequest, ResponseSource};
use crate::state::{cancel_decision, CancelDecision, PhaseMachine, FINALIZING_CANCEL};

pub const COUNTDOWN_PLACEHOLDER: &str = "Afterthought countdown... ";
pub const INPUT_CANCELLED: &str = "Input cancelled.";
pub const GENERATION_CANCELLED: &str = "Generation cancelled.";
pub const THINKING_INDICATOR: &str = "Thinking...\n█ █ █ █ █";
pub const RESPONSE_GENERATED: &str = "Response generated";

/// Per-turn switches the user toggles between turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TurnSettings {
    pub mode: OperationMode,
    pub web_search: bool,
    /// Suppress the thinking phase and the reasoning instruction.
    pub disable_think: bool,
}

// =============================================================================
// Runtime context
// =============================================================================

/// Mutable state of the single interaction stream.
///
/// The controller owns one of these and hands it to the pipeline. Locks are
/// held only for short synchronous sections, never across an await.
#[derive(Default)]
pub struct RuntimeContext {
    session: Mutex<Option<Session>>,
    phase: PhaseMachine,
    cancel: CancelFlag,
    source: RwLock<Option<Arc<dyn ResponseSource>>>,
    settings: Mutex<TurnSettings>,
    /// Set while a completed turn is being persisted.
    finalizing: Mutex<bool>,
}

impl RuntimeContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn session_guard(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn phase(&self) -> &PhaseMachine {
        &self.phase
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    fn finalizing_guard(&self) -> MutexGuard<'_, bool> {
        self.finalizing.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Decide and apply a cancel request.
    ///
    /// Requests arriving after a completed turn has started persisting
    /// change nothing.
    pub fn request_cancel(&self) -> CancelDecision {
        let finalizing = self.finalizing_guard();
        let decision = if *finalizing {
            FINALIZING_CANCEL
        } else {
            cancel_decision(self.phase.current())
        };
        if decision.set_flag {
            self.cancel.set();
        }
        decision
    }

    /// Enter the persisting step unless a cancel request got there first.
    fn try_begin_finalize(&self) -> bool {
        let mut finalizing = self.finalizing_guard();
        if self.cancel.is_set() {
            return false;
        }
        *finalizing = true;
        true
    }

    /// Leave the persisting step. `settle` runs before cancel requests are
    /// accepted again.
    fn end_finalize(&self, settle: impl FnOnce()) {
        let mut finalizing = self.finalizing_guard();
        settle();
        *finalizing = false;
    }

    /// Copy of the active session, if any.
    pub fn session(&self) -> Option<Session> {
        self.session_guard().clone()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_guard().as_ref().map(|s| s.id.clone())
    }

    /// Replace the active session.
    pub fn set_session(&self, session: Option<Session>) {
        *self.session_guard() = session;
    }

    /// Run `f` against the active session.
    pub fn with_session<R>(&self, f: impl FnOnce(&mut Option<Session>) -> R) -> R {
        f(&mut self.session_guard())
    }

    pub fn source(&self) -> Option<Arc<dyn ResponseSource>> {
        match self.source.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_source(&self, source: Option<Arc<dyn ResponseSource>>) {
        match self.source.write() {
            Ok(mut guard) => *guard = source,
            Err(poisoned) => *poisoned.into_inner() = source,
        }
    }

    pub fn settings(&self) -> TurnSettings {
        *self.settings.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn update_settings(&self, f: impl FnOnce(&mut TurnSettings)) {
        f(&mut self.settings.lock().unwrap_or_else(|p| p.into_inner()));
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// A turn accepted by `begin` and waiting to be driven.
pub struct PreparedTurn {
    pub session_id: SessionId,
    pub countdown_ticks: u32,
    input: String,
    /// Completed turns before this input.
    history: Vec<Turn>,
    /// Position of the placeholder assistant turn in the log.
    assistant_index: usize,
    source: Arc<dyn ResponseSource>,
    settings: TurnSettings,
    config: ParleyConfig,
}

impl std::fmt::Debug for PreparedTurn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedTurn")
            .field("session_id", &self.session_id)
            .field("countdown_ticks", &self.countdown_ticks)
            .field("source", &self.source.name())
            .finish_non_exhaustive()
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed { content: String, persisted: bool },
    Cancelled { notice: String },
    Failed { error: String },
}

enum Interrupt {
    Cancelled,
    Failed(String),
}

#[derive(Clone)]
pub struct TurnPipeline {
    ctx: Arc<RuntimeContext>,
    store: Arc<SessionStore>,
    augmentor: Arc<Augmentor>,
    events: broadcast::Sender<PipelineEvent>,
    config: Arc<RwLock<ParleyConfig>>,
}

impl TurnPipeline {
    pub fn new(
        ctx: Arc<RuntimeContext>,
        store: Arc<SessionStore>,
        augmentor: Arc<Augmentor>,
        events: broadcast::Sender<PipelineEvent>,
        config: Arc<RwLock<ParleyConfig>>,
    ) -> Self {
        Self {
            ctx,
            store,
            augmentor,
            events,
            config,
        }
    }

    fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn status(&self, message: impl Into<String>) {
        self.emit(PipelineEvent::Status {
            message: message.into(),
        });
    }

    fn config_snapshot(&self) -> ParleyConfig {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn move_to(&self, target: PipelinePhase) {
        match self.ctx.phase.transition(target) {
            Ok(from) => self.emit(PipelineEvent::PhaseChanged { from, to: target }),
            Err(e) => {
                warn!(error = %e, target = %target, "Unexpected phase transition, resetting");
                let from = self.ctx.phase.current();
                self.ctx.phase.reset();
                self.emit(PipelineEvent::PhaseChanged {
                    from,
                    to: PipelinePhase::WaitingForInput,
                });
            }
        }
    }

    /// Validate `input` and open a turn.
    ///
    /// On error nothing changes: the phase stays `WaitingForInput` and the
    /// session log is untouched.
    pub fn begin(&self, input: &str) -> Result<PreparedTurn, ChatError> {
        let source = self.ctx.source().ok_or(ChatError::NoModelLoaded)?;
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ChatError::EmptyInput);
        }
        self.ctx.phase.begin_turn()?;
        self.ctx.cancel.clear();

        let config = self.config_snapshot();
        let countdown_ticks = config
            .pipeline
            .countdown_ticks(input.lines().count(), config.model.afterthought_time);

        let (session_id, history, assistant_index) = self.ctx.with_session(|slot| {
            let session = slot.get_or_insert_with(|| {
                let session = Session::new();
                info!(session_id = %session.id, "New session created");
                session
            });
            let history = session.log.clone();
            session.log.push(Turn::user(trimmed));
            session.log.push(Turn::assistant(COUNTDOWN_PLACEHOLDER));
            (session.id.clone(), history, session.log.len() - 1)
        });

        debug!(session_id = %session_id, countdown_ticks, "Turn accepted");
        self.emit(PipelineEvent::PhaseChanged {
            from: PipelinePhase::WaitingForInput,
            to: PipelinePhase::AfterthoughtCountdown,
        });
        self.emit(PipelineEvent::TurnStarted {
            session_id: session_id.clone(),
            countdown_ticks,
        });

        Ok(PreparedTurn {
            session_id,
            countdown_ticks,
            input: trimmed.to_string(),
            history,
            assistant_index,
            source,
            settings: self.ctx.settings(),
            config,
        })
    }

    /// Validate and run a full turn.
    pub async fn run(&self, input: &str) -> Result<TurnOutcome, ChatError> {
        let prepared = self.begin(input)?;
        Ok(self.drive(prepared).await)
    }

    /// Run an accepted turn to completion, cancellation or failure.
    pub async fn drive(&self, turn: PreparedTurn) -> TurnOutcome {
        if self.countdown(&turn).await.is_err() {
            return self.finish_cancelled(&turn, INPUT_CANCELLED, INPUT_CANCELLED);
        }
        self.move_to(PipelinePhase::GeneratingResponse);

        match self.generate(&turn).await {
            Ok(content) if self.ctx.try_begin_finalize() => {
                self.finish_completed(&turn, content).await
            }
            Ok(_) | Err(Interrupt::Cancelled) => self.finish_cancelled(
                &turn,
                GENERATION_CANCELLED,
                "Response generation cancelled.",
            ),
            Err(Interrupt::Failed(message)) => self.finish_failed(&turn, message),
        }
    }

    fn set_assistant_content(&self, turn: &PreparedTurn, content: &str) {
        let updated = self.ctx.with_session(|slot| match slot {
            Some(session) if session.id == turn.session_id => {
                match session.log.get_mut(turn.assistant_index) {
                    Some(t) => {
                        t.content = content.to_string();
                        true
                    }
                    None => false,
                }
            }
            _ => false,
        });
        if updated {
            self.emit(PipelineEvent::AssistantContent {
                session_id: turn.session_id.clone(),
                content: content.to_string(),
            });
        } else {
            warn!(session_id = %turn.session_id, "Active session changed during turn");
        }
    }

    /// Sleep for `duration` unless the cancel flag is raised first.
    async fn pause(&self, duration: Duration) -> Result<(), Interrupt> {
        if self.ctx.cancel.is_set() {
            return Err(Interrupt::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    async fn countdown(&self, turn: &PreparedTurn) -> Result<(), Interrupt> {
        let tick = Duration::from_millis(turn.config.pipeline.tick_millis);
        for remaining in (1..=turn.countdown_ticks).rev() {
            if self.ctx.cancel.is_set() {
                return Err(Interrupt::Cancelled);
            }
            self.set_assistant_content(turn, &format!("{COUNTDOWN_PLACEHOLDER}{remaining}s"));
            self.pause(tick).await?;
        }
        if self.ctx.cancel.is_set() {
            return Err(Interrupt::Cancelled);
        }
        Ok(())
    }

    async fn generate(&self, turn: &PreparedTurn) -> Result<String, Interrupt> {
        let cancel = &self.ctx.cancel;
        let pipeline = &turn.config.pipeline;

        let augmentation = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Interrupt::Cancelled),
            aug = self.augmentor.gather(&turn.input, turn.settings.mode, turn.settings.web_search) => aug,
        };

        let profile = turn.source.profile();
        let messages = build_messages(&PromptInputs {
            mode: turn.settings.mode,
            input: &turn.input,
            history: &turn.history,
            passages: &augmentation.passages,
            web_results: augmentation.web_results.as_deref(),
            is_uncensored: profile.is_uncensored,
            disable_think: turn.settings.disable_think,
            roleplay: &turn.config.roleplay,
        });

        if profile.is_reasoning && !turn.settings.disable_think {
            let started = Instant::now();
            self.set_assistant_content(turn, THINKING_INDICATOR);
            self.pause(Duration::from_millis(pipeline.thinking_millis)).await?;
            let secs = started.elapsed().as_secs_f64();
            self.set_assistant_content(turn, &format!("{THINKING_INDICATOR}\nThought for {secs:.1}s.\n"));
        }

        let request = GenerationRequest {
            messages,
            params: GenerationParams::from_config(&turn.config),
            queue_capacity: pipeline.token_queue_capacity,
        };
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Interrupt::Cancelled),
            result = turn.source.generate(request) => result.map_err(|e| Interrupt::Failed(e.detail()))?,
        };

        let join_with_space = turn
            .source
            .joins_with_space()
            .unwrap_or(pipeline.join_with_space);
        let timeout = (pipeline.generation_timeout_secs > 0)
            .then(|| Duration::from_secs(pipeline.generation_timeout_secs));
        let mut response = String::new();
        loop {
            if cancel.is_set() {
                return Err(Interrupt::Cancelled);
            }
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Interrupt::Cancelled),
                next = recv_with_timeout(&mut stream, timeout) => next?,
            };
            let Some(increment) = next else {
                break;
            };
            let token = increment.map_err(|e| Interrupt::Failed(e.detail()))?;
            if cancel.is_set() {
                return Err(Interrupt::Cancelled);
            }
            response.push_str(&token);
            if join_with_space {
                response.push(' ');
            }
            self.set_assistant_content(turn, response.trim());
        }
        Ok(response.trim().to_string())
    }

    fn finish_cancelled(&self, turn: &PreparedTurn, notice: &str, status: &str) -> TurnOutcome {
        self.set_assistant_content(turn, notice);
        self.ctx.cancel.clear();
        info!(session_id = %turn.session_id, notice, "Turn cancelled");
        self.move_to(PipelinePhase::WaitingForInput);
        self.emit(PipelineEvent::TurnCancelled {
            session_id: turn.session_id.clone(),
            notice: notice.to_string(),
        });
        self.status(status);
        TurnOutcome::Cancelled {
            notice: notice.to_string(),
        }
    }

    fn finish_failed(&self, turn: &PreparedTurn, message: String) -> TurnOutcome {
        let content = format!("Error generating response: {message}");
        self.set_assistant_content(turn, &content);
        self.ctx.cancel.clear();
        error!(session_id = %turn.session_id, error = %message, "Generation failed");
        self.move_to(PipelinePhase::WaitingForInput);
        self.emit(PipelineEvent::TurnFailed {
            session_id: turn.session_id.clone(),
            error: message,
        });
        self.status(content.clone());
        TurnOutcome::Failed { error: content }
    }

    async fn finish_completed(&self, turn: &PreparedTurn, content: String) -> TurnOutcome {
        self.set_assistant_content(turn, &content);
        self.ctx.cancel.clear();

        let persisted = self.persist_active(turn).await;
        info!(
            session_id = %turn.session_id,
            length = content.len(),
            persisted,
            "Turn completed"
        );
        self.ctx
            .end_finalize(|| self.move_to(PipelinePhase::WaitingForInput));
        self.emit(PipelineEvent::TurnCompleted {
            session_id: turn.session_id.clone(),
            content_length: content.len(),
        });
        self.status(RESPONSE_GENERATED);
        TurnOutcome::Completed { content, persisted }
    }

    /// Persist the active session. Failures keep the in-memory log.
    async fn persist_active(&self, turn: &PreparedTurn) -> bool {
        let Some(session) = self.ctx.session().filter(|s| s.id == turn.session_id) else {
            warn!(session_id = %turn.session_id, "Session gone before persist");
            return false;
        };

        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut session = session;
            store.persist(&mut session).map(|_| session)
        })
        .await;

        let reason = match result {
            Ok(Ok(saved)) => {
                self.ctx.with_session(|slot| {
                    if let Some(active) = slot.as_mut().filter(|s| s.id == saved.id) {
                        active.label = saved.label.clone();
                        active.modified_at = saved.modified_at;
                    }
                });
                self.emit(PipelineEvent::SessionPersisted {
                    session_id: saved.id.clone(),
                    label: saved.label,
                });
                return true;
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("persist task failed: {e}"),
        };

        error!(session_id = %turn.session_id, error = %reason, "Failed to save session");
        self.emit(PipelineEvent::PersistFailed {
            session_id: turn.session_id.clone(),
            reason: reason.clone(),
        });
        self.status(format!("Failed to save session: {reason}"));
        false
    }
}

async fn recv_with_timeout(
    stream: &mut crate::source::TokenStream,
    timeout: Option<Duration>,
) -> Result<Option<Result<String, ChatError>>, Interrupt> {
    match timeout {
        None => Ok(stream.recv().await),
        Some(limit) => tokio::time::timeout(limit, stream.recv())
            .await
            .map_err(|_| Interrupt::Failed(format!("no output for {}s", limit.as_secs()))),
    }
}
