//! Bounded, ordered set of attached files.
//!
//! Attached files are copied into a temporary directory so that ejecting a
//! slot can delete the copy without touching the user's original.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use parley_core::error::{ParleyError, Result};

/// Outcome of one `AttachmentSlots::add` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachReport {
    /// Slot paths (inside the temp directory) that were added.
    pub added: Vec<PathBuf>,
    /// Sources skipped because a file with that name is already attached.
    pub duplicates: usize,
    /// Sources dropped because every slot was taken.
    pub rejected: usize,
    /// Sources that could not be copied.
    pub failed: Vec<(PathBuf, String)>,
    pub capacity: usize,
}

impl AttachReport {
    /// User-visible summary line.
    pub fn status(&self) -> String {
        if self.added.is_empty() && self.rejected > 0 {
            format!("Max files ({}) reached.", self.capacity)
        } else {
            format!("Processed {} new files.", self.added.len())
        }
    }
}

#[derive(Debug)]
pub struct AttachmentSlots {
    temp_dir: PathBuf,
    capacity: usize,
    files: Vec<PathBuf>,
}

impl AttachmentSlots {
    pub fn new(temp_dir: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        let temp_dir = temp_dir.into();
        std::fs::create_dir_all(&temp_dir).map_err(|e| {
            ParleyError::Storage(format!(
                "Failed to create temp dir {}: {}",
                temp_dir.display(),
                e
            ))
        })?;
        Ok(Self {
            temp_dir,
            capacity,
            files: Vec::new(),
        })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.files.len() >= self.capacity
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Change the slot count. Slots beyond the new capacity are ejected and
    /// returned.
    pub fn set_capacity(&mut self, capacity: usize) -> Vec<PathBuf> {
        self.capacity = capacity;
        let mut ejected = Vec::new();
        while self.files.len() > capacity {
            if let Some(path) = self.remove(self.files.len() - 1) {
                ejected.push(path);
            }
        }
        ejected
    }

    /// Copy `sources` into free slots, in order.
    ///
    /// Files whose name is already attached are skipped; sources beyond the
    /// free slot count are rejected.
    pub fn add(&mut self, sources: &[PathBuf]) -> AttachReport {
        let mut report = AttachReport {
            capacity: self.capacity,
            ..AttachReport::default()
        };

        for source in sources {
            let Some(name) = source.file_name() else {
                report
                    .failed
                    .push((source.clone(), "path has no file name".to_string()));
                continue;
            };
            let dest = self.temp_dir.join(name);
            if self.files.contains(&dest) {
                report.duplicates += 1;
                continue;
            }
            if self.is_full() {
                report.rejected += 1;
                continue;
            }
            if let Err(e) = copy_into_slot(source, &dest) {
                warn!(source = %source.display(), error = %e, "Failed to attach file");
                report.failed.push((source.clone(), e.to_string()));
                continue;
            }
            debug!(path = %dest.display(), "File attached");
            self.files.push(dest.clone());
            report.added.push(dest);
        }

        info!(
            added = report.added.len(),
            duplicates = report.duplicates,
            rejected = report.rejected,
            "Attachments updated"
        );
        report
    }

    /// Eject the slot at `index`, deleting its temporary copy.
    pub fn remove(&mut self, index: usize) -> Option<PathBuf> {
        if index >= self.files.len() {
            return None;
        }
        let path = self.files.remove(index);
        delete_copy(&path);
        Some(path)
    }

    /// Eject every slot. Returns how many were removed.
    pub fn clear(&mut self) -> usize {
        let count = self.files.len();
        for path in self.files.drain(..) {
            delete_copy(&path);
        }
        count
    }

    /// Replace the slot set with fresh copies of `sources`, deleting the
    /// copies it replaces. Used when a stored session is restored.
    pub fn restore(&mut self, sources: &[PathBuf]) -> AttachReport {
        let cleared = self.clear();
        let report = self.add(sources);
        debug!(
            cleared,
            requested = sources.len(),
            restored = report.added.len(),
            "Attachments restored"
        );
        report
    }
}

fn copy_into_slot(source: &Path, dest: &Path) -> std::io::Result<()> {
    if source == dest {
        return if dest.is_file() {
            Ok(())
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "attachment missing",
            ))
        };
    }
    std::fs::copy(source, dest).map(|_| ())
}

fn delete_copy(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to delete attachment copy");
        }
    }
}
