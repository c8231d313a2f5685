use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Enums
// =============================================================================

/// Who produced a turn in the session log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// Operation mode selected for the conversation.
///
/// The mode decides which prompt template is used and whether web
/// augmentation is allowed at all.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    #[default]
    Chat,
    Code,
    Rpg,
}

impl OperationMode {
    /// Web lookup is only offered in Chat and Code modes.
    pub fn allows_web_search(&self) -> bool {
        matches!(self, OperationMode::Chat | OperationMode::Code)
    }

    /// Parse a mode name case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "chat" => Some(OperationMode::Chat),
            "code" => Some(OperationMode::Code),
            "rpg" => Some(OperationMode::Rpg),
            _ => None,
        }
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationMode::Chat => write!(f, "Chat"),
            OperationMode::Code => write!(f, "Code"),
            OperationMode::Rpg => write!(f, "Rpg"),
        }
    }
}

/// Phase of the single interaction stream.
///
/// Valid transitions:
/// - WaitingForInput -> AfterthoughtCountdown (submit accepted)
/// - AfterthoughtCountdown -> GeneratingResponse (countdown elapsed)
/// - AfterthoughtCountdown -> WaitingForInput (cancelled)
/// - GeneratingResponse -> WaitingForInput (finished, failed or cancelled)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    #[default]
    WaitingForInput,
    AfterthoughtCountdown,
    GeneratingResponse,
}

impl PipelinePhase {
    /// Returns whether a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &PipelinePhase) -> bool {
        matches!(
            (self, target),
            (PipelinePhase::WaitingForInput, PipelinePhase::AfterthoughtCountdown)
                | (PipelinePhase::AfterthoughtCountdown, PipelinePhase::GeneratingResponse)
                | (PipelinePhase::AfterthoughtCountdown, PipelinePhase::WaitingForInput)
                | (PipelinePhase::GeneratingResponse, PipelinePhase::WaitingForInput)
        )
    }

    /// True when a new turn may be submitted.
    pub fn is_idle(&self) -> bool {
        *self == PipelinePhase::WaitingForInput
    }

    /// Label of the single action button for this phase.
    pub fn action_label(&self) -> &'static str {
        match self {
            PipelinePhase::WaitingForInput => "Send Input",
            PipelinePhase::AfterthoughtCountdown => "Cancel Input",
            PipelinePhase::GeneratingResponse => "Cancel Response",
        }
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelinePhase::WaitingForInput => write!(f, "waiting_for_input"),
            PipelinePhase::AfterthoughtCountdown => write!(f, "afterthought_countdown"),
            PipelinePhase::GeneratingResponse => write!(f, "generating_response"),
        }
    }
}

// =============================================================================
// Session log
// =============================================================================

/// One message unit within a session log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Opaque, time-derived session identifier.
///
/// Generated ids look like `20250314_093012_417`; the millisecond suffix
/// keeps two sessions started within the same second apart.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new id from the local wall clock.
    pub fn generate() -> Self {
        Self(Local::now().format("%Y%m%d_%H%M%S_%3f").to_string())
    }

    /// Wrap an existing id. Returns `None` when the value is empty or would
    /// not be safe to embed in a file name.
    pub fn parse(value: &str) -> Option<Self> {
        let valid = !value.is_empty()
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        valid.then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Label used when no user turn exists to derive one from.
pub const UNTITLED_LABEL: &str = "Untitled";

/// Label given to a session whose stored record could not be read.
pub const ERROR_LABEL: &str = "Error";

const LABEL_MAX_WORDS: usize = 6;
const LABEL_MAX_CHARS: usize = 40;

/// A conversation plus its attachments and metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    pub id: SessionId,
    /// Short derived title. Empty until the first persist.
    pub label: String,
    pub log: Vec<Turn>,
    pub attachments: Vec<PathBuf>,
    /// Files that actually made it into the retrieval index.
    pub vector_files: Vec<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Session {
    /// Create an empty session with a freshly generated id.
    pub fn new() -> Self {
        Self::with_id(SessionId::generate())
    }

    pub fn with_id(id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            label: String::new(),
            log: Vec::new(),
            attachments: Vec::new(),
            vector_files: Vec::new(),
            created_at: now,
            modified_at: now,
        }
    }

    /// Placeholder for a stored session that could not be decoded.
    pub fn corrupt(id: SessionId) -> Self {
        Self {
            label: ERROR_LABEL.to_string(),
            ..Self::with_id(id)
        }
    }

    /// The first user turn, if any.
    pub fn first_user_turn(&self) -> Option<&Turn> {
        self.log.iter().find(|t| t.role == Role::User)
    }

    /// The last assistant turn, if any.
    pub fn last_assistant_turn(&self) -> Option<&Turn> {
        self.log.iter().rev().find(|t| t.role == Role::Assistant)
    }

    /// Derive a label from the first user turn if none exists yet.
    pub fn ensure_label(&mut self) {
        if self.label.trim().is_empty() {
            self.label = derive_label(self.first_user_turn().map(|t| t.content.as_str()));
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a short session title from the opening user message.
pub fn derive_label(first_user_content: Option<&str>) -> String {
    let words: Vec<&str> = first_user_content
        .unwrap_or_default()
        .split_whitespace()
        .take(LABEL_MAX_WORDS)
        .collect();
    if words.is_empty() {
        return UNTITLED_LABEL.to_string();
    }

    let joined = words.join(" ");
    if joined.chars().count() <= LABEL_MAX_CHARS {
        return joined;
    }
    let truncated: String = joined.chars().take(LABEL_MAX_CHARS - 2).collect();
    format!("{}..", truncated.trim_end())
}

/// Slot-level view of a stored session, for history enumeration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub label: String,
    pub modified_at: DateTime<Utc>,
    pub turn_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display() {
        assert_eq!(PipelinePhase::WaitingForInput.to_string(), "waiting_for_input");
        assert_eq!(
            PipelinePhase::AfterthoughtCountdown.to_string(),
            "afterthought_countdown"
        );
        assert_eq!(
            PipelinePhase::GeneratingResponse.to_string(),
            "generating_response"
        );
    }

    #[test]
    fn test_valid_transitions() {
        assert!(PipelinePhase::WaitingForInput
            .can_transition_to(&PipelinePhase::AfterthoughtCountdown));
        assert!(PipelinePhase::AfterthoughtCountdown
            .can_transition_to(&PipelinePhase::GeneratingResponse));
        assert!(PipelinePhase::AfterthoughtCountdown
            .can_transition_to(&PipelinePhase::WaitingForInput));
        assert!(PipelinePhase::GeneratingResponse
            .can_transition_to(&PipelinePhase::WaitingForInput));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!PipelinePhase::WaitingForInput
            .can_transition_to(&PipelinePhase::GeneratingResponse));
        assert!(!PipelinePhase::GeneratingResponse
            .can_transition_to(&PipelinePhase::AfterthoughtCountdown));
        assert!(!PipelinePhase::WaitingForInput.can_transition_to(&PipelinePhase::WaitingForInput));
        assert!(!PipelinePhase::GeneratingResponse
            .can_transition_to(&PipelinePhase::GeneratingResponse));
    }

    #[test]
    fn test_action_labels() {
        assert_eq!(PipelinePhase::WaitingForInput.action_label(), "Send Input");
        assert_eq!(PipelinePhase::AfterthoughtCountdown.action_label(), "Cancel Input");
        assert_eq!(PipelinePhase::GeneratingResponse.action_label(), "Cancel Response");
    }

    #[test]
    fn test_mode_parse_and_web_search() {
        assert_eq!(OperationMode::parse("CODE"), Some(OperationMode::Code));
        assert_eq!(OperationMode::parse(" rpg "), Some(OperationMode::Rpg));
        assert_eq!(OperationMode::parse("poetry"), None);
        assert!(OperationMode::Chat.allows_web_search());
        assert!(OperationMode::Code.allows_web_search());
        assert!(!OperationMode::Rpg.allows_web_search());
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Turn::user("hi")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"hi"}"#);
    }

    #[test]
    fn test_session_id_parse_rejects_path_characters() {
        assert!(SessionId::parse("20250101_120000_001").is_some());
        assert!(SessionId::parse("../etc/passwd").is_none());
        assert!(SessionId::parse("").is_none());
    }

    #[test]
    fn test_generated_ids_are_file_safe() {
        let id = SessionId::generate();
        assert!(SessionId::parse(id.as_str()).is_some());
    }

    #[test]
    fn test_derive_label() {
        assert_eq!(derive_label(Some("Hello there")), "Hello there");
        assert_eq!(derive_label(Some("   ")), UNTITLED_LABEL);
        assert_eq!(derive_label(None), UNTITLED_LABEL);
        assert_eq!(
            derive_label(Some("one two three four five six seven eight")),
            "one two three four five six"
        );
    }

    #[test]
    fn test_derive_label_truncates_long_words() {
        let label = derive_label(Some(&"x".repeat(100)));
        assert!(label.chars().count() <= LABEL_MAX_CHARS);
        assert!(label.ends_with(".."));
    }

    #[test]
    fn test_ensure_label_keeps_existing() {
        let mut session = Session::new();
        session.log.push(Turn::user("What is Rust"));
        session.ensure_label();
        assert_eq!(session.label, "What is Rust");

        session.log[0].content = "Something else".to_string();
        session.ensure_label();
        assert_eq!(session.label, "What is Rust");
    }

    #[test]
    fn test_corrupt_session_placeholder() {
        let id = SessionId::parse("broken").unwrap();
        let session = Session::corrupt(id.clone());
        assert_eq!(session.id, id);
        assert_eq!(session.label, ERROR_LABEL);
        assert!(session.log.is_empty());
    }

    #[test]
    fn test_last_assistant_turn() {
        let mut session = Session::new();
        assert!(session.last_assistant_turn().is_none());
        session.log.push(Turn::user("q"));
        session.log.push(Turn::assistant("a"));
        assert_eq!(session.last_assistant_turn().unwrap().content, "a");
    }
}
