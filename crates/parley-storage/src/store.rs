//! Session history persistence with bounded retention.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use parley_core::error::{ParleyError, Result};
use parley_core::types::{Session, SessionId, SessionSummary};

use crate::record::{self, SessionRecord};

/// A session file found while scanning the history directory.
#[derive(Debug)]
struct StoredEntry {
    path: PathBuf,
    id: SessionId,
    modified_at: DateTime<Utc>,
    record: Option<SessionRecord>,
}

/// Stores sessions as one JSON file each in a history directory.
///
/// Recency is the `modified_at` stamp inside each record, falling back to
/// the file's modification time for records that lack one. Stamps handed out
/// by one store are strictly increasing, so two persists in quick succession
/// never tie.
pub struct SessionStore {
    history_dir: PathBuf,
    max_slots: AtomicUsize,
    last_stamp: Mutex<Option<DateTime<Utc>>>,
    persist_count: AtomicU64,
}

impl SessionStore {
    /// Open (creating if needed) a history directory.
    pub fn open(history_dir: impl Into<PathBuf>, max_slots: usize) -> Result<Self> {
        let history_dir = history_dir.into();
        std::fs::create_dir_all(&history_dir).map_err(|e| {
            ParleyError::Storage(format!(
                "Failed to create history dir {}: {}",
                history_dir.display(),
                e
            ))
        })?;
        info!(dir = %history_dir.display(), max_slots, "Session store opened");
        Ok(Self {
            history_dir,
            max_slots: AtomicUsize::new(max_slots),
            last_stamp: Mutex::new(None),
            persist_count: AtomicU64::new(0),
        })
    }

    pub fn history_dir(&self) -> &Path {
        &self.history_dir
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots.load(Ordering::SeqCst)
    }

    /// Change the retention bound and immediately apply it.
    ///
    /// Returns the number of sessions deleted.
    pub fn set_max_slots(&self, max_slots: usize) -> Result<usize> {
        self.max_slots.store(max_slots, Ordering::SeqCst);
        self.enforce_retention(max_slots)
    }

    /// Number of successful `persist` calls on this store.
    pub fn persist_count(&self) -> u64 {
        self.persist_count.load(Ordering::SeqCst)
    }

    /// Write a session, overwriting any previous record with the same id.
    ///
    /// Derives the label if the session has none, stamps `modified_at`, then
    /// enforces retention.
    pub fn persist(&self, session: &mut Session) -> Result<()> {
        session.ensure_label();
        session.modified_at = self.next_stamp();

        let record = SessionRecord::from_session(session);
        let json = serde_json::to_string_pretty(&record)?;

        let path = self.path_for(&session.id);
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json).map_err(|e| {
            ParleyError::Storage(format!("Failed to write {}: {}", tmp_path.display(), e))
        })?;
        std::fs::rename(&tmp_path, &path).map_err(|e| {
            ParleyError::Storage(format!("Failed to replace {}: {}", path.display(), e))
        })?;

        self.archive_attachments(session);

        self.persist_count.fetch_add(1, Ordering::SeqCst);
        debug!(
            session_id = %session.id,
            label = %session.label,
            turns = session.log.len(),
            "Session persisted"
        );

        self.enforce_retention(self.max_slots())?;
        Ok(())
    }

    /// Delete every stored session beyond the `max_slots` most recent.
    ///
    /// Returns the number of sessions deleted. An empty or missing history
    /// directory is not an error.
    pub fn enforce_retention(&self, max_slots: usize) -> Result<usize> {
        let entries = self.scan()?;
        if entries.len() <= max_slots {
            return Ok(0);
        }

        let mut deleted = 0;
        for entry in entries.iter().skip(max_slots) {
            match std::fs::remove_file(&entry.path) {
                Ok(()) => {
                    deleted += 1;
                    remove_archive(&self.archive_dir(&entry.id));
                    debug!(session_id = %entry.id, "Evicted session");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ParleyError::Storage(format!(
                        "Failed to evict {}: {}",
                        entry.path.display(),
                        e
                    )))
                }
            }
        }
        if deleted > 0 {
            info!(deleted, max_slots, "Session retention enforced");
        }
        Ok(deleted)
    }

    /// Load a session by id.
    ///
    /// Returns `None` when no record exists. A record that cannot be read
    /// or decoded yields a placeholder session labelled "Error".
    pub fn load(&self, id: &SessionId) -> Option<Session> {
        let path = self.path_for(id);
        if !path.exists() {
            return None;
        }
        let mtime = file_mtime(&path);
        match read_record(&path) {
            Ok(record) => {
                let mut session = record.into_session(id.clone(), mtime);
                // The file name is authoritative for lookups.
                session.id = id.clone();
                Some(session)
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "Session file unreadable, using placeholder");
                Some(Session::corrupt(id.clone()))
            }
        }
    }

    /// Load the session in the given recency slot (0 = most recent).
    pub fn load_slot(&self, slot: usize) -> Option<Session> {
        let summaries = match self.list_all() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Failed to enumerate sessions");
                return None;
            }
        };
        let summary = summaries.get(slot)?;
        self.load(&summary.id)
    }

    /// Stored sessions, most recently modified first, at most `max_slots`.
    pub fn list_all(&self) -> Result<Vec<SessionSummary>> {
        let max_slots = self.max_slots();
        Ok(self
            .scan()?
            .into_iter()
            .take(max_slots)
            .map(|entry| match entry.record {
                Some(record) => {
                    let session = record.into_session(entry.id.clone(), entry.modified_at);
                    SessionSummary {
                        turn_count: session.log.len(),
                        id: entry.id,
                        label: session.label,
                        modified_at: session.modified_at,
                    }
                }
                None => {
                    let session = Session::corrupt(entry.id);
                    SessionSummary {
                        id: session.id,
                        label: session.label,
                        modified_at: entry.modified_at,
                        turn_count: 0,
                    }
                }
            })
            .collect())
    }

    /// Remove every stored session. Returns the number of files deleted.
    pub fn delete_all(&self) -> Result<usize> {
        let entries = self.scan()?;
        let mut deleted = 0;
        for entry in entries {
            match std::fs::remove_file(&entry.path) {
                Ok(()) => {
                    deleted += 1;
                    remove_archive(&self.archive_dir(&entry.id));
                }
                Err(e) => warn!(path = %entry.path.display(), error = %e, "Failed to delete session"),
            }
        }
        info!(deleted, "All session history deleted");
        Ok(deleted)
    }

    /// Directory holding copies of a session's attachments.
    pub fn archive_dir(&self, id: &SessionId) -> PathBuf {
        self.history_dir.join(record::archive_dir_name(id))
    }

    /// Archived copies of `session`'s attachments that still exist, in
    /// attachment order.
    pub fn archived_attachments(&self, session: &Session) -> Vec<PathBuf> {
        let dir = self.archive_dir(&session.id);
        session
            .attachments
            .iter()
            .filter_map(|path| path.file_name())
            .map(|name| dir.join(name))
            .filter(|path| path.is_file())
            .collect()
    }

    /// Mirror the session's attachments into its archive directory.
    ///
    /// Copy failures are logged; the record itself is already written.
    fn archive_attachments(&self, session: &Session) {
        let dir = self.archive_dir(&session.id);
        if session.attachments.is_empty() {
            remove_archive(&dir);
            return;
        }
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %e, "Failed to create attachment archive");
            return;
        }

        let mut keep = Vec::new();
        for source in &session.attachments {
            let Some(name) = source.file_name() else {
                continue;
            };
            keep.push(name.to_os_string());
            let dest = dir.join(name);
            if source == &dest {
                continue;
            }
            if let Err(e) = std::fs::copy(source, &dest) {
                warn!(
                    session_id = %session.id,
                    source = %source.display(),
                    error = %e,
                    "Failed to archive attachment"
                );
            }
        }

        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                if !keep.contains(&entry.file_name()) {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
    }

    fn path_for(&self, id: &SessionId) -> PathBuf {
        self.history_dir.join(record::file_name(id))
    }

    fn next_stamp(&self) -> DateTime<Utc> {
        let mut last = self
            .last_stamp
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut now = Utc::now();
        if let Some(prev) = *last {
            if now <= prev {
                now = prev + chrono::Duration::microseconds(1);
            }
        }
        *last = Some(now);
        now
    }

    /// All session files, most recent first, ties broken by id descending.
    fn scan(&self) -> Result<Vec<StoredEntry>> {
        let dir = match std::fs::read_dir(&self.history_dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ParleyError::Storage(format!(
                    "Failed to read {}: {}",
                    self.history_dir.display(),
                    e
                )))
            }
        };

        let mut entries: Vec<StoredEntry> = dir
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter_map(|path| {
                let id = record::id_from_path(&path)?;
                let mtime = file_mtime(&path);
                let record = read_record(&path).ok();
                let modified_at = record
                    .as_ref()
                    .and_then(|r| r.modified_at)
                    .unwrap_or(mtime);
                Some(StoredEntry {
                    path,
                    id,
                    modified_at,
                    record,
                })
            })
            .collect();

        entries.sort_by(|a, b| {
            b.modified_at
                .cmp(&a.modified_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(entries)
    }
}

fn read_record(path: &Path) -> Result<SessionRecord> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn remove_archive(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "Failed to remove attachment archive");
        }
    }
}

fn file_mtime(path: &Path) -> DateTime<Utc> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}
