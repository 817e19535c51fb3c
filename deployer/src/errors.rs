//! Error types for modeldeploy

use std::time::Duration;

use thiserror::Error;

use crate::models::instance::InstanceState;

/// Failure reported by a cloud backend (compute, command channel, parameter store)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudError {
    /// The command agent on the target has not registered with the channel yet
    #[error("target not ready: {0}")]
    TargetNotReady(String),

    /// Throttling, temporary unavailability, transport failure
    #[error("transient cloud failure: {0}")]
    Transient(String),

    /// The request was understood and refused
    #[error("cloud request rejected: {0}")]
    Rejected(String),
}

impl CloudError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, CloudError::TargetNotReady(_) | CloudError::Transient(_))
    }
}

/// Main error type for a deployment run
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Instance {instance} did not reach running within {timeout:?} (last state: {last_state})")]
    StartTimeout {
        instance: String,
        timeout: Duration,
        last_state: InstanceState,
    },

    #[error("Instance {0} is terminated")]
    InstanceTerminated(String),

    #[error("Command channel error after {attempts} attempt(s): {message}")]
    ChannelError { message: String, attempts: u32 },

    #[error("Remote script exited with code {exit_code}")]
    ScriptExecution { exit_code: i32, output_tail: String },

    #[error("Remote command {command_id} did not finish within {timeout:?}")]
    CommandTimeout {
        command_id: String,
        timeout: Duration,
        output_tail: String,
    },

    #[error("A remote command is already in flight for instance {0}")]
    CommandInFlight(String),

    #[error("Service at {url} did not become healthy within {timeout:?}")]
    HealthCheckTimeout {
        url: String,
        timeout: Duration,
        last_observation: Option<String>,
    },

    #[error("Service at {url} reported unhealthy: {observation}")]
    HealthCheckFailed { url: String, observation: String },

    #[error("Instance {instance} is already leased by {holder}")]
    LeaseConflict { instance: String, holder: String },

    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("Invalid phase transition: {0}")]
    InvalidTransition(String),

    #[error("Cancelled by operator")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// Captured remote output or last observation worth showing to the operator
    pub fn excerpt(&self) -> Option<&str> {
        match self {
            DeployError::ScriptExecution { output_tail, .. }
            | DeployError::CommandTimeout { output_tail, .. } => {
                Some(output_tail.as_str()).filter(|s| !s.is_empty())
            }
            DeployError::HealthCheckTimeout {
                last_observation, ..
            } => last_observation.as_deref(),
            DeployError::HealthCheckFailed { observation, .. } => Some(observation.as_str()),
            _ => None,
        }
    }

    /// Stable name of the failure class, used in attempt records
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::IoError(_) => "IoError",
            DeployError::JsonError(_) => "JsonError",
            DeployError::HttpError(_) => "HttpError",
            DeployError::ConfigError(_) => "ConfigError",
            DeployError::StartTimeout { .. } => "StartTimeoutError",
            DeployError::InstanceTerminated(_) => "InstanceTerminated",
            DeployError::ChannelError { .. } => "ChannelError",
            DeployError::ScriptExecution { .. } => "ScriptExecutionError",
            DeployError::CommandTimeout { .. } => "CommandTimeout",
            DeployError::CommandInFlight(_) => "CommandInFlight",
            DeployError::HealthCheckTimeout { .. } => "HealthCheckTimeoutError",
            DeployError::HealthCheckFailed { .. } => "HealthCheckFailed",
            DeployError::LeaseConflict { .. } => "LeaseConflictError",
            DeployError::Cloud(_) => "CloudError",
            DeployError::InvalidTransition(_) => "InvalidTransition",
            DeployError::Cancelled => "Cancelled",
            DeployError::Internal(_) => "Internal",
        }
    }

    /// Process exit code for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            DeployError::ConfigError(_) => 2,
            DeployError::LeaseConflict { .. } => 3,
            DeployError::Cancelled => 130,
            _ => 1,
        }
    }
}
