//! Error types for the chat pipeline.

use parley_core::error::ParleyError;

/// Errors from the chat pipeline and controller.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Please load a model first.")]
    NoModelLoaded,
    #[error("No input provided.")]
    EmptyInput,
    #[error("a turn is already in progress")]
    Busy,
    #[error("generation error: {0}")]
    Generation(String),
    #[error("augmentation error: {0}")]
    Augmentation(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("attachment error: {0}")]
    Attachment(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl ChatError {
    /// The message without the category prefix, for user-facing text.
    pub fn detail(&self) -> String {
        match self {
            ChatError::Generation(msg)
            | ChatError::Augmentation(msg)
            | ChatError::Storage(msg)
            | ChatError::Attachment(msg)
            | ChatError::Config(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

impl From<ParleyError> for ChatError {
    fn from(err: ParleyError) -> Self {
        match err {
            ParleyError::Generation(msg) => ChatError::Generation(msg),
            ParleyError::Retrieval(msg) => ChatError::Augmentation(msg),
            ParleyError::Config(msg) => ChatError::Config(msg),
            other => ChatError::Storage(other.to_string()),
        }
    }
}
