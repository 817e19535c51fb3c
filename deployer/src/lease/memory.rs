//! In-process lease registry

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::errors::DeployError;
use crate::lease::{Lease, LeaseRegistry};

/// Leases shared by every clone of the registry
#[derive(Debug, Clone, Default)]
pub struct InProcessLeases {
    held: Arc<Mutex<HashMap<String, Lease>>>,
}

impl InProcessLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current live holder of an instance, if any
    pub fn holder(&self, instance_id: &str) -> Option<Lease> {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance_id)
            .filter(|lease| !lease.is_expired())
            .cloned()
    }
}

#[async_trait]
impl LeaseRegistry for InProcessLeases {
    async fn acquire(&self, instance_id: &str, ttl: Duration) -> Result<Lease, DeployError> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = held.get(instance_id).filter(|l| !l.is_expired()) {
            return Err(DeployError::LeaseConflict {
                instance: instance_id.to_string(),
                holder: existing.holder_id.clone(),
            });
        }

        let lease = Lease::new(instance_id, ttl);
        held.insert(instance_id.to_string(), lease.clone());
        debug!(instance = instance_id, holder = %lease.holder_id, "lease acquired");
        Ok(lease)
    }

    async fn release(&self, lease: &Lease) -> Result<(), DeployError> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held
            .get(&lease.instance_id)
            .is_some_and(|current| current.holder_id == lease.holder_id)
        {
            held.remove(&lease.instance_id);
            debug!(instance = %lease.instance_id, holder = %lease.holder_id, "lease released");
        }
        Ok(())
    }
}
