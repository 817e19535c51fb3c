//! Deployment attempt record

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DeployError;

/// A named step of the deployment state machine, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    Init,
    ResolvingConfig,
    AcquiringLease,
    StartingInstance,
    AwaitingInstanceReady,
    DispatchingCommand,
    AwaitingCommandResult,
    ValidatingHealth,
}

impl Phase {
    /// All phases in declared order
    pub const ORDER: [Phase; 8] = [
        Phase::Init,
        Phase::ResolvingConfig,
        Phase::AcquiringLease,
        Phase::StartingInstance,
        Phase::AwaitingInstanceReady,
        Phase::DispatchingCommand,
        Phase::AwaitingCommandResult,
        Phase::ValidatingHealth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "Init",
            Phase::ResolvingConfig => "ResolvingConfig",
            Phase::AcquiringLease => "AcquiringLease",
            Phase::StartingInstance => "StartingInstance",
            Phase::AwaitingInstanceReady => "AwaitingInstanceReady",
            Phase::DispatchingCommand => "DispatchingCommand",
            Phase::AwaitingCommandResult => "AwaitingCommandResult",
            Phase::ValidatingHealth => "ValidatingHealth",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flags chosen by the operator for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFlags {
    pub skip_start: bool,
    pub skip_validation: bool,
    pub quick_restart: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,
}

/// How a phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseOutcome {
    Completed,
    Skipped,
    Failed,
}

/// Per-phase entry of an attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub outcome: PhaseOutcome,
    pub elapsed_ms: u64,
}

/// Whether a successful run proved the service healthy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validation {
    Verified,
    ValidationSkipped,
}

/// Final result of an attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum AttemptResult {
    Done {
        validation: Validation,
    },
    Failed {
        phase: Phase,
        kind: String,
        cause: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        excerpt: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_completed: Option<Phase>,
        exit_code: i32,
    },
}

/// One end-to-end deployment run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentAttempt {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,
    pub flags: RunFlags,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub phases: Vec<PhaseRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<AttemptResult>,
}

impl DeploymentAttempt {
    pub fn new(flags: RunFlags) -> Self {
        Self {
            id: crate::utils::generate_uuid(),
            instance_id: None,
            image_tag: None,
            flags,
            started_at: Utc::now(),
            finished_at: None,
            phases: Vec::new(),
            command_id: None,
            script_digest: None,
            result: None,
        }
    }

    pub fn record(&mut self, phase: Phase, outcome: PhaseOutcome, elapsed: Duration) {
        self.phases.push(PhaseRecord {
            phase,
            outcome,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        });
    }

    /// Last phase that ran to completion
    pub fn last_completed(&self) -> Option<Phase> {
        self.phases
            .iter()
            .rev()
            .find(|r| r.outcome == PhaseOutcome::Completed)
            .map(|r| r.phase)
    }

    pub fn finish_done(&mut self, validation: Validation) {
        self.finished_at = Some(Utc::now());
        self.result = Some(AttemptResult::Done { validation });
    }

    pub fn finish_failed(&mut self, phase: Phase, error: &DeployError) {
        self.finished_at = Some(Utc::now());
        self.result = Some(AttemptResult::Failed {
            phase,
            kind: error.kind().to_string(),
            cause: error.to_string(),
            excerpt: error.excerpt().map(str::to_string),
            last_completed: self.last_completed(),
            exit_code: error.exit_code(),
        });
    }

    pub fn is_done(&self) -> bool {
        matches!(self.result, Some(AttemptResult::Done { .. }))
    }

    /// Process exit code for the attempt
    pub fn exit_code(&self) -> i32 {
        match &self.result {
            Some(AttemptResult::Done { .. }) => 0,
            Some(AttemptResult::Failed { exit_code, .. }) => *exit_code,
            None => 1,
        }
    }

    /// Number of records for a phase with the given outcome
    pub fn count(&self, phase: Phase, outcome: PhaseOutcome) -> usize {
        self.phases
            .iter()
            .filter(|r| r.phase == phase && r.outcome == outcome)
            .count()
    }
}
