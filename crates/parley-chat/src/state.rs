//! Interaction phase machine and the cancel lookup table.
//!
//! Valid transitions:
//! - WaitingForInput -> AfterthoughtCountdown (submit accepted)
//! - AfterthoughtCountdown -> GeneratingResponse (countdown elapsed)
//! - AfterthoughtCountdown -> WaitingForInput (input cancelled)
//! - GeneratingResponse -> WaitingForInput (finished, failed or cancelled)

use std::sync::{Arc, Mutex, MutexGuard};

use parley_core::types::PipelinePhase;

use crate::error::ChatError;

/// Thread-safe holder of the current phase.
///
/// Transitions are validated before being applied. A poisoned lock is
/// recovered rather than propagated, since the phase is a plain `Copy` value
/// that cannot be left half-written.
#[derive(Debug, Clone, Default)]
pub struct PhaseMachine {
    phase: Arc<Mutex<PipelinePhase>>,
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PipelinePhase> {
        self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn current(&self) -> PipelinePhase {
        *self.lock()
    }

    /// Attempt to move to `target`. Returns the phase that was left.
    pub fn transition(&self, target: PipelinePhase) -> Result<PipelinePhase, ChatError> {
        let mut phase = self.lock();
        if phase.can_transition_to(&target) {
            tracing::debug!("Interaction phase: {} -> {}", *phase, target);
            let previous = *phase;
            *phase = target;
            Ok(previous)
        } else if *phase == PipelinePhase::WaitingForInput {
            Err(ChatError::Generation(format!(
                "Invalid phase transition: {} -> {}",
                *phase, target
            )))
        } else {
            Err(ChatError::Busy)
        }
    }

    /// Claim the idle phase for a new turn, or report `Busy`.
    pub fn begin_turn(&self) -> Result<(), ChatError> {
        let mut phase = self.lock();
        if *phase != PipelinePhase::WaitingForInput {
            return Err(ChatError::Busy);
        }
        tracing::debug!(
            "Interaction phase: {} -> {}",
            *phase,
            PipelinePhase::AfterthoughtCountdown
        );
        *phase = PipelinePhase::AfterthoughtCountdown;
        Ok(())
    }

    /// Force the machine back to WaitingForInput (used for error recovery).
    pub fn reset(&self) {
        let mut phase = self.lock();
        if *phase != PipelinePhase::WaitingForInput {
            tracing::warn!("Interaction phase reset to waiting_for_input from {}", *phase);
        }
        *phase = PipelinePhase::WaitingForInput;
    }
}

/// What a cancel request does in a given phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelDecision {
    /// Whether the running turn's cancel flag should be raised.
    pub set_flag: bool,
    /// Phase the interaction will settle in once the pipeline observes it.
    pub next_phase: PipelinePhase,
    pub status: &'static str,
}

/// Cancel response once a completed turn has started persisting.
pub const FINALIZING_CANCEL: CancelDecision = CancelDecision {
    set_flag: false,
    next_phase: PipelinePhase::WaitingForInput,
    status: "No action taken.",
};

/// Pure lookup from the current phase to the cancel response.
pub fn cancel_decision(phase: PipelinePhase) -> CancelDecision {
    match phase {
        PipelinePhase::AfterthoughtCountdown => CancelDecision {
            set_flag: true,
            next_phase: PipelinePhase::WaitingForInput,
            status: "Input cancelled.",
        },
        PipelinePhase::GeneratingResponse => CancelDecision {
            set_flag: true,
            next_phase: PipelinePhase::WaitingForInput,
            status: "Response generation cancelled.",
        },
        PipelinePhase::WaitingForInput => CancelDecision {
            set_flag: false,
            next_phase: PipelinePhase::WaitingForInput,
            status: "No action taken.",
        },
    }
}

// =============================================================================
// Tests
// =============================================================================
