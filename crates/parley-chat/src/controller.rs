//! The interaction controller: the one object a front-end talks to.
//!
//! It owns the runtime context, routes the single action button to either a
//! new turn or a cancel request, and mediates attachment, history and model
//! changes. Every attachment change triggers exactly one retrieval rebuild.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use parley_core::config::ParleyConfig;
use parley_core::events::PipelineEvent;
use parley_core::types::{OperationMode, PipelinePhase, Session, SessionSummary};
use parley_retrieval::RetrievalContext;
use parley_storage::{AttachReport, AttachmentSlots, SessionStore};

use crate::augment::{Augmentor, WebSearch};
use crate::error::ChatError;
use crate::llama::LlamaCliSource;
use crate::pipeline::{RuntimeContext, TurnOutcome, TurnPipeline};
use crate::prompt::{filter_operational_content, strip_markup};
use crate::source::ResponseSource;
use crate::state::CancelDecision;

const EVENT_CAPACITY: usize = 1024;

/// Result of pressing the action button.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// A turn was accepted and is running on the returned task.
    Started(JoinHandle<TurnOutcome>),
    /// The input was refused; the message has been published as status.
    Rejected(String),
    /// A turn was already running, so the press became a cancel request.
    CancelRequested(CancelDecision),
}

pub struct InteractionController {
    ctx: Arc<RuntimeContext>,
    pipeline: TurnPipeline,
    store: Arc<SessionStore>,
    retrieval: Arc<RetrievalContext>,
    attachments: Mutex<AttachmentSlots>,
    config: Arc<RwLock<ParleyConfig>>,
    events: broadcast::Sender<PipelineEvent>,
}

impl InteractionController {
    pub fn new(
        config: ParleyConfig,
        store: Arc<SessionStore>,
        retrieval: Arc<RetrievalContext>,
        attachments: AttachmentSlots,
        web: Arc<dyn WebSearch>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let config = Arc::new(RwLock::new(config));
        let ctx = Arc::new(RuntimeContext::new());
        let augmentor = Arc::new(Augmentor::new(retrieval.clone(), web));
        let pipeline = TurnPipeline::new(
            ctx.clone(),
            store.clone(),
            augmentor,
            events.clone(),
            config.clone(),
        );
        Self {
            ctx,
            pipeline,
            store,
            retrieval,
            attachments: Mutex::new(attachments),
            config,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    fn status(&self, message: impl Into<String>) -> String {
        let message = message.into();
        let _ = self.events.send(PipelineEvent::Status {
            message: message.clone(),
        });
        message
    }

    fn ensure_idle(&self) -> Result<(), ChatError> {
        if self.ctx.phase().current().is_idle() {
            Ok(())
        } else {
            Err(ChatError::Busy)
        }
    }

    pub fn runtime(&self) -> &Arc<RuntimeContext> {
        &self.ctx
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn retrieval(&self) -> &Arc<RetrievalContext> {
        &self.retrieval
    }

    pub fn phase(&self) -> PipelinePhase {
        self.ctx.phase().current()
    }

    pub fn action_label(&self) -> &'static str {
        self.phase().action_label()
    }

    /// Copy of the active session, if one exists.
    pub fn session(&self) -> Option<Session> {
        self.ctx.session()
    }

    pub fn config(&self) -> ParleyConfig {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    // =========================================================================
    // Turns
    // =========================================================================

    /// Drop the active session so the next input starts a new one.
    ///
    /// Attachments stay in place.
    pub fn start_session(&self) -> Result<String, ChatError> {
        self.ensure_idle()?;
        if let Some(id) = self.ctx.session_id() {
            info!(session_id = %id, "Active session closed");
        }
        self.ctx.set_session(None);
        self.ctx.cancel_flag().clear();
        Ok(self.status("New session started."))
    }

    /// Handle the action button with `input`.
    pub async fn submit(&self, input: &str) -> SubmitOutcome {
        if !self.phase().is_idle() {
            return SubmitOutcome::CancelRequested(self.cancel());
        }

        let turn = match self.pipeline.begin(input) {
            Ok(turn) => turn,
            Err(e) => {
                let message = match e {
                    ChatError::Busy => "A response is already in progress.".to_string(),
                    other => other.to_string(),
                };
                return SubmitOutcome::Rejected(self.status(message));
            }
        };

        let files = self.attachments.lock().await.files().to_vec();
        let vector_files = self.indexed_files().await;
        self.ctx.with_session(|slot| {
            if let Some(session) = slot.as_mut() {
                session.attachments = files;
                session.vector_files = vector_files;
            }
        });

        let pipeline = self.pipeline.clone();
        SubmitOutcome::Started(tokio::spawn(async move { pipeline.drive(turn).await }))
    }

    /// Raise the cancel flag if a turn is running. Never waits.
    pub fn cancel(&self) -> CancelDecision {
        let decision = self.ctx.request_cancel();
        self.status(decision.status);
        decision
    }

    // =========================================================================
    // Attachments
    // =========================================================================

    async fn indexed_files(&self) -> Vec<PathBuf> {
        self.retrieval
            .current()
            .await
            .map(|index| index.files().to_vec())
            .unwrap_or_default()
    }

    /// Rebuild retrieval over `files` and record the result on the session.
    async fn rebuild_retrieval(&self, files: &[PathBuf]) {
        let context_size = self.config().model.context_size;
        let vector_files = match self.retrieval.rebuild(files, context_size).await {
            Ok(handle) => {
                let (file_count, chunk_count) = handle
                    .as_ref()
                    .map(|h| (h.files().len(), h.chunk_count()))
                    .unwrap_or((0, 0));
                let _ = self.events.send(PipelineEvent::RetrievalRebuilt {
                    file_count,
                    chunk_count,
                });
                handle.map(|h| h.files().to_vec()).unwrap_or_default()
            }
            Err(e) => {
                warn!(error = %e, "Retrieval rebuild failed");
                self.status(format!("Failed to index attachments: {e}"));
                Vec::new()
            }
        };

        let files = files.to_vec();
        self.ctx.with_session(|slot| {
            if let Some(session) = slot.as_mut() {
                session.attachments = files;
                session.vector_files = vector_files;
            }
        });
    }

    /// Copy files into free attachment slots.
    pub async fn attach_files(&self, paths: &[PathBuf]) -> Result<AttachReport, ChatError> {
        if self.ctx.source().is_none() {
            return Err(ChatError::Attachment("Load a model first.".to_string()));
        }
        let mut slots = self.attachments.lock().await;
        let report = slots.add(paths);
        if !report.added.is_empty() {
            let files = slots.files().to_vec();
            self.rebuild_retrieval(&files).await;
        }
        self.status(report.status());
        Ok(report)
    }

    /// Eject the attachment in slot `index`.
    pub async fn eject_file(&self, index: usize) -> String {
        let mut slots = self.attachments.lock().await;
        match slots.remove(index) {
            Some(path) => {
                let files = slots.files().to_vec();
                self.rebuild_retrieval(&files).await;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                self.status(format!("Ejected {name}"))
            }
            None => self.status("No file to eject"),
        }
    }

    pub async fn remove_all_attachments(&self) -> String {
        let mut slots = self.attachments.lock().await;
        if slots.clear() > 0 {
            self.rebuild_retrieval(&[]).await;
        }
        self.status("All attachments removed.")
    }

    pub async fn attachments(&self) -> Vec<PathBuf> {
        self.attachments.lock().await.files().to_vec()
    }

    // =========================================================================
    // History
    // =========================================================================

    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>, ChatError> {
        Ok(self.store.list_all()?)
    }

    /// Make the session in history slot `slot` active and restore its
    /// attachments.
    pub async fn load_session(&self, slot: usize) -> Result<String, ChatError> {
        self.ensure_idle()?;
        let session = self
            .store
            .load_slot(slot)
            .ok_or_else(|| ChatError::Storage(format!("No session in slot {}", slot + 1)))?;
        let label = session.label.clone();
        let archived = self.store.archived_attachments(&session);
        info!(
            session_id = %session.id,
            %label,
            attachments = archived.len(),
            "Session restored"
        );
        self.ctx.set_session(Some(session));

        let mut slots = self.attachments.lock().await;
        slots.restore(&archived);
        let files = slots.files().to_vec();
        self.rebuild_retrieval(&files).await;
        Ok(self.status(format!("Loaded session: {label}")))
    }

    /// Delete every stored session and drop the active one.
    pub fn delete_all_history(&self) -> Result<usize, ChatError> {
        self.ensure_idle()?;
        let deleted = self.store.delete_all()?;
        self.ctx.set_session(None);
        self.status("All history deleted.");
        Ok(deleted)
    }

    /// Text of the last assistant turn, without markup or operational tags.
    pub fn copy_last_response(&self) -> Option<String> {
        let text = self
            .ctx
            .session()
            .and_then(|s| s.last_assistant_turn().map(|t| t.content.clone()))
            .map(|content| strip_markup(&filter_operational_content(&content)))
            .filter(|text| !text.trim().is_empty());
        match &text {
            Some(_) => self.status("AI Response copied to clipboard."),
            None => self.status("No response available to copy."),
        };
        text
    }

    // =========================================================================
    // Model and settings
    // =========================================================================

    /// Install `source` as the loaded model and switch to its recommended mode.
    pub fn load_model(&self, source: Arc<dyn ResponseSource>) -> Result<String, ChatError> {
        self.ensure_idle()?;
        let profile = source.profile();
        self.ctx
            .update_settings(|s| s.mode = profile.recommended_mode);
        info!(
            model = %profile.model_name,
            reasoning = profile.is_reasoning,
            mode = %profile.recommended_mode,
            "Model loaded"
        );
        let name = source.name().to_string();
        self.ctx.set_source(Some(source));
        Ok(self.status(format!("Model loaded: {name}")))
    }

    /// Load the model named in the configuration through `llama-cli`.
    pub fn load_configured_model(&self) -> Result<String, ChatError> {
        match LlamaCliSource::new(&self.config()) {
            Ok(source) => self.load_model(Arc::new(source)),
            Err(e) => {
                self.status(format!("Error: {}", e.detail()));
                Err(e)
            }
        }
    }

    pub fn unload_model(&self) -> Result<String, ChatError> {
        self.ensure_idle()?;
        if self.ctx.source().is_none() {
            return Ok(self.status("No model loaded to unload."));
        }
        self.ctx.set_source(None);
        Ok(self.status("Model unloaded successfully"))
    }

    pub fn set_mode(&self, mode: OperationMode) {
        self.ctx.update_settings(|s| s.mode = mode);
    }

    pub fn set_web_search(&self, enabled: bool) {
        self.ctx.update_settings(|s| s.web_search = enabled);
    }

    pub fn set_disable_think(&self, disabled: bool) {
        self.ctx.update_settings(|s| s.disable_think = disabled);
    }

    /// Update one named setting and re-apply retention bounds.
    ///
    /// Returns whether the model must be reloaded for the change to apply.
    pub async fn apply_setting(&self, key: &str, value: &str) -> Result<bool, ChatError> {
        let mut config = self.config();
        let reload = config.apply_setting(key, value)?;
        self.apply_config(config).await?;
        Ok(reload)
    }

    /// Replace the configuration and re-run the history and attachment
    /// enumerations against the new bounds.
    pub async fn apply_config(&self, config: ParleyConfig) -> Result<(), ChatError> {
        let max_history = config.model.max_history_slots;
        let max_attach = config.model.max_attach_slots;
        match self.config.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }

        let evicted = self.store.set_max_slots(max_history)?;
        let mut slots = self.attachments.lock().await;
        let ejected = slots.set_capacity(max_attach);
        if !ejected.is_empty() {
            let files = slots.files().to_vec();
            self.rebuild_retrieval(&files).await;
        }
        info!(
            max_history,
            max_attach,
            evicted,
            ejected = ejected.len(),
            "Configuration applied"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augment::DisabledWebSearch;
    use crate::source::ScriptedSource;
    use parley_core::config::RetrievalConfig;
    use parley_retrieval::TermHashEmbedding;

    fn controller(dir: &tempfile::TempDir) -> InteractionController {
        let mut config = ParleyConfig::default();
        config.pipeline.tick_millis = 20;
        let store = Arc::new(SessionStore::open(dir.path().join("history"), 12).unwrap());
        let retrieval = Arc::new(RetrievalContext::new(
            Arc::new(TermHashEmbedding::new()),
            RetrievalConfig::default(),
        ));
        let slots = AttachmentSlots::new(dir.path().join("temp"), 2).unwrap();
        let controller =
            InteractionController::new(config, store, retrieval, slots, Arc::new(DisabledWebSearch));
        controller.set_disable_think(true);
        controller
    }

    #[tokio::test]
    async fn test_submit_without_model_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(&dir);
        match c.submit("Hello").await {
            SubmitOutcome::Rejected(msg) => assert_eq!(msg, "Please load a model first."),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(c.phase(), PipelinePhase::WaitingForInput);
    }

    #[tokio::test]
    async fn test_cancel_when_idle_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(&dir);
        let decision = c.cancel();
        assert!(!decision.set_flag);
        assert!(!c.runtime().cancel_flag().is_set());
    }

    #[tokio::test]
    async fn test_submit_while_busy_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(&dir);
        c.load_model(ScriptedSource::new("m", &["x"]).into_shared()).unwrap();

        let SubmitOutcome::Started(handle) = c.submit("Hi").await else {
            panic!("turn should start");
        };
        assert_eq!(c.action_label(), "Cancel Input");
        let SubmitOutcome::CancelRequested(decision) = c.submit("again").await else {
            panic!("second press should cancel");
        };
        assert_eq!(decision.status, "Input cancelled.");
        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Cancelled { .. }));
        assert_eq!(c.action_label(), "Send Input");
    }

    #[tokio::test]
    async fn test_attach_requires_model() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(&dir);
        let err = c.attach_files(&[dir.path().join("x.txt")]).await.unwrap_err();
        assert_eq!(err.detail(), "Load a model first.");
    }

    #[tokio::test]
    async fn test_attach_eject_rebuilds_once_each() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(&dir);
        c.load_model(ScriptedSource::new("m", &["x"]).into_shared()).unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        let extra = dir.path().join("c.txt");
        for p in [&a, &b, &extra] {
            std::fs::write(p, "some attachment text").unwrap();
        }

        let report = c.attach_files(&[a, b, extra]).await.unwrap();
        assert_eq!(report.added.len(), 2);
        assert_eq!(report.rejected, 1);
        assert_eq!(c.retrieval().rebuild_count(), 1);

        assert_eq!(c.eject_file(0).await, "Ejected a.txt");
        assert_eq!(c.retrieval().rebuild_count(), 2);
        assert_eq!(c.eject_file(5).await, "No file to eject");
        assert_eq!(c.retrieval().rebuild_count(), 2);
    }

    #[tokio::test]
    async fn test_copy_last_response() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(&dir);
        assert!(c.copy_last_response().is_none());

        c.load_model(ScriptedSource::new("m", &["<b>Bold</b>", "<thinking>x</thinking>"]).into_shared())
            .unwrap();
        let SubmitOutcome::Started(handle) = c.submit("Hi").await else {
            panic!("turn should start");
        };
        handle.await.unwrap();
        assert_eq!(c.copy_last_response().as_deref(), Some("Bold"));
    }

    #[tokio::test]
    async fn test_unload_model() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(&dir);
        assert_eq!(c.unload_model().unwrap(), "No model loaded to unload.");
        c.load_model(ScriptedSource::new("m", &[]).into_shared()).unwrap();
        assert_eq!(c.unload_model().unwrap(), "Model unloaded successfully");
    }

    #[tokio::test]
    async fn test_load_model_sets_recommended_mode() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(&dir);
        c.load_model(ScriptedSource::new("qwen-coder", &[]).into_shared()).unwrap();
        assert_eq!(c.runtime().settings().mode, OperationMode::Code);
    }

    #[tokio::test]
    async fn test_load_configured_model_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(&dir);
        assert!(c.load_configured_model().is_err());
        assert!(c.runtime().source().is_none());
    }

    #[tokio::test]
    async fn test_apply_setting_reports_reload() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(&dir);
        c.load_model(ScriptedSource::new("m", &[]).into_shared()).unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "alpha").unwrap();
        std::fs::write(&b, "beta").unwrap();
        c.attach_files(&[a, b]).await.unwrap();

        let reload = c.apply_setting("max_attach_slots", "2").await.unwrap();
        assert!(!reload);
        assert_eq!(c.attachments().await.len(), 2);
        assert!(c.apply_setting("context_size", "16384").await.unwrap());
    }

    #[tokio::test]
    async fn test_start_session_keeps_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(&dir);
        c.load_model(ScriptedSource::new("m", &["ok"]).into_shared()).unwrap();
        let a = dir.path().join("a.txt");
        std::fs::write(&a, "alpha").unwrap();
        c.attach_files(&[a]).await.unwrap();

        let SubmitOutcome::Started(handle) = c.submit("Hi").await else {
            panic!("turn should start");
        };
        handle.await.unwrap();
        assert_eq!(c.session().unwrap().attachments.len(), 1);

        assert_eq!(c.start_session().unwrap(), "New session started.");
        assert!(c.session().is_none());
        assert_eq!(c.attachments().await.len(), 1);
    }
}
