//! Conversational turn handling for Parley.
//!
//! Provides the response source boundary (scripted and `llama-cli` backed),
//! prompt assembly per operation mode, retrieval and web augmentation, the
//! cancellable turn pipeline and the interaction controller that front-ends
//! drive.

pub mod augment;
pub mod cancel;
pub mod controller;
pub mod error;
pub mod gguf;
pub mod llama;
pub mod pipeline;
pub mod profile;
pub mod prompt;
pub mod source;
pub mod state;

pub use augment::{Augmentation, Augmentor, DisabledWebSearch, WebResult, WebSearch};
pub use cancel::CancelFlag;
pub use controller::{InteractionController, SubmitOutcome};
pub use error::ChatError;
pub use llama::LlamaCliSource;
pub use pipeline::{PreparedTurn, RuntimeContext, TurnOutcome, TurnPipeline, TurnSettings};
pub use profile::ModelProfile;
pub use prompt::{PromptMessage, PromptRole};
pub use source::{GenerationParams, GenerationRequest, ResponseSource, ScriptedSource, TokenStream};
pub use state::{cancel_decision, CancelDecision, PhaseMachine};
