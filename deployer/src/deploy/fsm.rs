//! Finite State Machine for a deployment attempt

use serde::{Deserialize, Serialize};

use crate::models::attempt::{Phase, RunFlags};

/// Which optional phases a run executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhasePlan {
    /// Run StartingInstance and AwaitingInstanceReady
    pub start_instance: bool,

    /// Run ValidatingHealth
    pub validate_health: bool,
}

impl PhasePlan {
    /// Whether the phase runs under this plan
    pub fn includes(&self, phase: Phase) -> bool {
        match phase {
            Phase::StartingInstance | Phase::AwaitingInstanceReady => self.start_instance,
            Phase::ValidatingHealth => self.validate_health,
            _ => true,
        }
    }
}

impl From<&RunFlags> for PhasePlan {
    fn from(flags: &RunFlags) -> Self {
        Self {
            start_instance: !flags.skip_start,
            validate_health: !flags.skip_validation,
        }
    }
}

impl Default for PhasePlan {
    fn default() -> Self {
        Self {
            start_instance: true,
            validate_health: true,
        }
    }
}

/// Deployment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentState {
    /// Executing a phase
    Active(Phase),

    /// Every planned phase completed
    Done,

    /// The phase failed and the run halted
    Failed(Phase),
}

impl DeploymentState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeploymentState::Active(_))
    }
}

/// Deployment event
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    /// Leave Init
    Begin,

    /// The current phase finished successfully
    PhaseCompleted,

    /// The current phase failed
    PhaseFailed(String),

    /// Operator interrupt observed at a checkpoint
    Cancel,
}

/// Deployment FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    plan: PhasePlan,
    state: DeploymentState,
    error: Option<String>,
    last_completed: Option<Phase>,
}

impl DeploymentFsm {
    /// Create a new FSM in Init
    pub fn new(plan: PhasePlan) -> Self {
        Self {
            plan,
            state: DeploymentState::Active(Phase::Init),
            error: None,
            last_completed: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> DeploymentState {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Last phase that completed
    pub fn last_completed(&self) -> Option<Phase> {
        self.last_completed
    }

    /// Phases the plan skips, in order
    pub fn skipped(&self) -> Vec<Phase> {
        Phase::ORDER
            .into_iter()
            .filter(|p| !self.plan.includes(*p))
            .collect()
    }

    /// Phases the plan skips between `from` (exclusive) and the next active phase
    pub fn skipped_after(&self, from: Phase) -> Vec<Phase> {
        Phase::ORDER
            .into_iter()
            .skip_while(|p| *p != from)
            .skip(1)
            .take_while(|p| !self.plan.includes(*p))
            .collect()
    }

    fn next_after(&self, phase: Phase) -> DeploymentState {
        Phase::ORDER
            .into_iter()
            .skip_while(|p| *p != phase)
            .skip(1)
            .find(|p| self.plan.includes(*p))
            .map(DeploymentState::Active)
            .unwrap_or(DeploymentState::Done)
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeploymentEvent) -> Result<DeploymentState, String> {
        let new_state = match (self.state, &event) {
            (DeploymentState::Active(Phase::Init), DeploymentEvent::Begin) => {
                self.last_completed = Some(Phase::Init);
                self.next_after(Phase::Init)
            }

            (DeploymentState::Active(phase), DeploymentEvent::PhaseCompleted)
                if phase != Phase::Init =>
            {
                self.last_completed = Some(phase);
                self.next_after(phase)
            }

            (DeploymentState::Active(phase), DeploymentEvent::PhaseFailed(err)) => {
                self.error = Some(err.clone());
                DeploymentState::Failed(phase)
            }

            (DeploymentState::Active(phase), DeploymentEvent::Cancel) => {
                self.error = Some("cancelled".to_string());
                DeploymentState::Failed(phase)
            }

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(new_state)
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new(PhasePlan::default())
    }
}
