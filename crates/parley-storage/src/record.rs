//! On-disk representation of a session.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parley_core::types::{Session, SessionId, Turn, UNTITLED_LABEL};

/// Prefix and extension of session files in the history directory.
pub const FILE_PREFIX: &str = "session_";
pub const FILE_EXTENSION: &str = "json";

/// A session file as written to disk.
///
/// Every field defaults when absent and unknown fields are ignored, so
/// records written by older versions still load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionRecord {
    pub session_id: String,
    pub label: String,
    pub history: Vec<Turn>,
    pub attached_files: Vec<PathBuf>,
    pub vector_files: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn from_session(session: &Session) -> Self {
        Self {
            session_id: session.id.to_string(),
            label: session.label.clone(),
            history: session.log.clone(),
            attached_files: session.attachments.clone(),
            vector_files: session.vector_files.clone(),
            created_at: Some(session.created_at),
            modified_at: Some(session.modified_at),
        }
    }

    /// Convert into a session.
    ///
    /// `fallback_id` is used when the stored id is missing or unusable, and
    /// `fallback_time` when timestamps are missing.
    pub fn into_session(self, fallback_id: SessionId, fallback_time: DateTime<Utc>) -> Session {
        let id = SessionId::parse(&self.session_id).unwrap_or(fallback_id);
        let label = if self.label.trim().is_empty() {
            UNTITLED_LABEL.to_string()
        } else {
            self.label
        };
        let modified_at = self.modified_at.unwrap_or(fallback_time);
        Session {
            id,
            label,
            log: self.history,
            attachments: self.attached_files,
            vector_files: self.vector_files,
            created_at: self.created_at.unwrap_or(modified_at),
            modified_at,
        }
    }
}

/// File name for a session id, e.g. `session_20250101_120000_000.json`.
pub fn file_name(id: &SessionId) -> String {
    format!("{FILE_PREFIX}{id}.{FILE_EXTENSION}")
}

/// Directory name holding a session's archived attachments.
pub fn archive_dir_name(id: &SessionId) -> String {
    format!("{FILE_PREFIX}{id}_files")
}

/// Extract the session id from a history file path, if it looks like one.
pub fn id_from_path(path: &Path) -> Option<SessionId> {
    if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    SessionId::parse(stem.strip_prefix(FILE_PREFIX)?)
}
