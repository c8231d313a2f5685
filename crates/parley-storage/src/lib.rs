//! Parley Storage crate - session history files and attachment slots.
//!
//! Sessions are stored one JSON record per file in the history directory and
//! trimmed to a configurable number of slots, least recently modified first.
//! Attachments are copied into a temporary directory and tracked in a
//! bounded, ordered slot set.

pub mod attachments;
pub mod record;
pub mod store;

pub use attachments::{AttachReport, AttachmentSlots};
pub use record::SessionRecord;
pub use store::SessionStore;
