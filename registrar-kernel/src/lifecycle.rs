//! Provision state stepping: at most one transition request per node and cycle.
//!
//! enroll --manage--> manageable --provide--> available --active--> active.
//! Any other state (including failures) is left for an operator. The request
//! is fire-and-forget, the new state is only trusted once the backend reports it.

use crate::backend::ProvisioningBackend;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Manage,
    Provide,
    Activate,
}

impl Transition {
    pub fn for_state(state: Option<&str>) -> Option<Self> {
        match state? {
            "enroll" => Some(Transition::Manage),
            "manageable" => Some(Transition::Provide),
            "available" => Some(Transition::Activate),
            _ => None,
        }
    }

    /// Target sent to the backend.
    pub fn command(self) -> &'static str {
        match self {
            Transition::Manage => "manage",
            Transition::Provide => "provide",
            Transition::Activate => "active",
        }
    }

    pub fn expected_state(self) -> &'static str {
        match self {
            Transition::Manage => "manageable",
            Transition::Provide => "available",
            Transition::Activate => "active",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Idle,
    Requested(Transition),
    Failed(Transition),
}

pub async fn step(backend: &dyn ProvisioningBackend, id: &str, state: Option<&str>) -> StepOutcome {
    let Some(transition) = Transition::for_state(state) else {
        debug!(node = %id, ?state, "no transition for state");
        return StepOutcome::Idle;
    };

    match backend.set_lifecycle_state(id, transition.command()).await {
        Ok(()) => {
            info!(
                node = %id,
                target = transition.command(),
                expected = transition.expected_state(),
                "provision transition requested"
            );
            StepOutcome::Requested(transition)
        }
        Err(e) => {
            warn!(node = %id, target = transition.command(), error = %e, "provision transition failed");
            StepOutcome::Failed(transition)
        }
    }
}
