//! Compute instance models

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a leased compute instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Stopped,
    Pending,
    Running,
    Stopping,
    Terminated,
    Unknown,
}

impl InstanceState {
    /// Map a provider state name onto the instance lifecycle.
    ///
    /// `shutting-down` is on its way to `terminated` and is treated as such.
    pub fn from_provider(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "stopped" => InstanceState::Stopped,
            "pending" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "stopping" => InstanceState::Stopping,
            "terminated" | "shutting-down" => InstanceState::Terminated,
            _ => InstanceState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Stopped => "stopped",
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Terminated => "terminated",
            InstanceState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a describe call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescription {
    /// Instance identifier
    pub instance_id: String,

    /// Current lifecycle state
    pub state: InstanceState,

    /// Reachable network address, absent while stopped
    pub address: Option<String>,
}

impl InstanceDescription {
    pub fn new(instance_id: impl Into<String>, state: InstanceState, address: Option<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            state,
            address,
        }
    }
}
