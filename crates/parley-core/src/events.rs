use serde::{Deserialize, Serialize};

use crate::types::{PipelinePhase, SessionId};

/// Events emitted while the interaction stream runs.
///
/// The pipeline publishes these on a broadcast channel; front-ends render
/// them and tests inspect them to observe ordering.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum PipelineEvent {
    // =========================================================================
    // Phase / status
    // =========================================================================
    /// The interaction moved to a new phase.
    PhaseChanged {
        from: PipelinePhase,
        to: PipelinePhase,
    },

    /// A short user-visible status line.
    Status { message: String },

    // =========================================================================
    // Turn lifecycle
    // =========================================================================
    /// A submitted input was accepted and a countdown began.
    TurnStarted {
        session_id: SessionId,
        countdown_ticks: u32,
    },

    /// The in-flight assistant turn now reads `content`. Each event replaces
    /// the previous content rather than appending to it.
    AssistantContent {
        session_id: SessionId,
        content: String,
    },

    /// The turn was cancelled; `notice` is the final assistant content.
    TurnCancelled {
        session_id: SessionId,
        notice: String,
    },

    /// Generation finished normally.
    TurnCompleted {
        session_id: SessionId,
        content_length: usize,
    },

    /// The response source failed; the error text is the final content.
    TurnFailed {
        session_id: SessionId,
        error: String,
    },

    // =========================================================================
    // Persistence / retrieval
    // =========================================================================
    /// The session was written to the history directory.
    SessionPersisted { session_id: SessionId, label: String },

    /// Writing the session failed; the in-memory log is untouched.
    PersistFailed {
        session_id: SessionId,
        reason: String,
    },

    /// The retrieval index was rebuilt from the attachment set.
    RetrievalRebuilt { file_count: usize, chunk_count: usize },
}

impl PipelineEvent {
    /// Returns a short name for the event type (useful for logging).
    pub fn event_name(&self) -> &'static str {
        match self {
            PipelineEvent::PhaseChanged { .. } => "phase_changed",
            PipelineEvent::Status { .. } => "status",
            PipelineEvent::TurnStarted { .. } => "turn_started",
            PipelineEvent::AssistantContent { .. } => "assistant_content",
            PipelineEvent::TurnCancelled { .. } => "turn_cancelled",
            PipelineEvent::TurnCompleted { .. } => "turn_completed",
            PipelineEvent::TurnFailed { .. } => "turn_failed",
            PipelineEvent::SessionPersisted { .. } => "session_persisted",
            PipelineEvent::PersistFailed { .. } => "persist_failed",
            PipelineEvent::RetrievalRebuilt { .. } => "retrieval_rebuilt",
        }
    }

    /// True for events that end a turn.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineEvent::TurnCancelled { .. }
                | PipelineEvent::TurnCompleted { .. }
                | PipelineEvent::TurnFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> SessionId {
        SessionId::parse("20250101_000000_000").unwrap()
    }

    #[test]
    fn test_event_name() {
        let event = PipelineEvent::Status {
            message: "ready".to_string(),
        };
        assert_eq!(event.event_name(), "status");

        let event = PipelineEvent::TurnCancelled {
            session_id: sid(),
            notice: "Input cancelled.".to_string(),
        };
        assert_eq!(event.event_name(), "turn_cancelled");
    }

    #[test]
    fn test_terminal_events() {
        assert!(PipelineEvent::TurnFailed {
            session_id: sid(),
            error: "boom".to_string(),
        }
        .is_terminal());
        assert!(!PipelineEvent::AssistantContent {
            session_id: sid(),
            content: "Hel".to_string(),
        }
        .is_terminal());
    }

    #[test]
    fn test_event_serialization() {
        let event = PipelineEvent::PhaseChanged {
            from: PipelinePhase::WaitingForInput,
            to: PipelinePhase::AfterthoughtCountdown,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("afterthought_countdown"));
        let back: PipelineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
