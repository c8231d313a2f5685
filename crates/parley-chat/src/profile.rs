//! Model capability detection from the model file name.

use parley_core::types::OperationMode;

const REASONING_KEYWORDS: &[&str] = &["reason", "r1", "think"];
const UNCENSORED_KEYWORDS: &[&str] = &["uncensored", "unfiltered", "unbiased", "unlocked"];
const CODE_KEYWORDS: &[&str] = &["code", "coder", "program", "dev", "copilot", "codex"];
const RPG_KEYWORDS: &[&str] = &["nsfw", "adult", "mature", "explicit", "rp", "roleplay"];

/// What the loaded model is assumed to be good at.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModelProfile {
    pub model_name: String,
    /// The model emits its own reasoning; the pipeline shows a thinking phase.
    pub is_reasoning: bool,
    pub is_uncensored: bool,
    pub recommended_mode: OperationMode,
}

impl ModelProfile {
    pub fn from_model_name(model_name: &str) -> Self {
        let lowered = model_name.to_lowercase();
        let has_any = |keywords: &[&str]| keywords.iter().any(|k| lowered.contains(k));

        let recommended_mode = if has_any(CODE_KEYWORDS) {
            OperationMode::Code
        } else if has_any(RPG_KEYWORDS) {
            OperationMode::Rpg
        } else {
            OperationMode::Chat
        };

        Self {
            model_name: model_name.to_string(),
            is_reasoning: has_any(REASONING_KEYWORDS),
            is_uncensored: has_any(UNCENSORED_KEYWORDS),
            recommended_mode,
        }
    }
}
