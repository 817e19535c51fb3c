//! Per-instance exclusivity
//!
//! A [`Lease`] is taken before any phase that can change instance or
//! container state and is handed back when the run ends, whatever the outcome.
//! Leases carry an expiry so a crashed run cannot wedge an instance forever.

pub mod file;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DeployError;

pub use file::FileLeases;
pub use memory::InProcessLeases;

/// Exclusive claim on one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Unique id of this claim
    pub holder_id: String,

    pub instance_id: String,

    pub acquired_at: DateTime<Utc>,

    /// After this instant the claim may be taken over
    pub expires_at: DateTime<Utc>,

    /// Process that took the claim
    pub pid: u32,
}

impl Lease {
    /// Create a fresh claim on `instance_id` valid for `ttl`
    pub fn new(instance_id: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            holder_id: crate::utils::generate_uuid(),
            instance_id: instance_id.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1)),
            pid: std::process::id(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Hands out at most one live lease per instance
#[async_trait]
pub trait LeaseRegistry: Send + Sync {
    /// Claim `instance_id`, failing with `LeaseConflict` while someone else holds it
    async fn acquire(&self, instance_id: &str, ttl: Duration) -> Result<Lease, DeployError>;

    /// Give the claim back; releasing a lease that was taken over is a no-op
    async fn release(&self, lease: &Lease) -> Result<(), DeployError>;
}
