//! Lease markers on the local filesystem

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::lease::{Lease, LeaseRegistry};

/// Leases stored as `<dir>/<instance>.lease` marker files.
///
/// Every read-check-write of a marker happens under an exclusive lock on
/// `<dir>/<instance>.lock`, so an expired marker is taken over by exactly
/// one contender and a release never deletes a marker it does not own.
#[derive(Debug, Clone)]
pub struct FileLeases {
    dir: Dir,
}

/// Exclusive hold on an instance's lock file; dropping it unlocks
struct MarkerLock {
    _file: std::fs::File,
}

impl FileLeases {
    pub fn new(dir: Dir) -> Self {
        Self { dir }
    }

    fn marker(&self, instance_id: &str) -> File {
        let name: String = instance_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.file(&format!("{}.lease", name))
    }

    async fn lock(&self, instance_id: &str) -> Result<MarkerLock, DeployError> {
        let path = self.marker(instance_id).path().with_extension("lock");
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            file.lock()?;
            Ok(file)
        })
        .await
        .map_err(|e| DeployError::Internal(format!("lease lock task failed: {}", e)))??;
        Ok(MarkerLock { _file: file })
    }

    /// Current marker content for an instance
    pub async fn current(&self, instance_id: &str) -> Result<Option<Lease>, DeployError> {
        let marker = self.marker(instance_id);
        if !marker.exists().await {
            return Ok(None);
        }
        Ok(Some(marker.read_json().await?))
    }
}

#[async_trait]
impl LeaseRegistry for FileLeases {
    async fn acquire(&self, instance_id: &str, ttl: Duration) -> Result<Lease, DeployError> {
        let _guard = self.lock(instance_id).await?;
        let marker = self.marker(instance_id);

        if marker.exists().await {
            let existing: Lease = match marker.read_json().await {
                Ok(existing) => existing,
                Err(e) => {
                    warn!(path = %marker.path().display(), error = %e, "unreadable lease marker");
                    return Err(DeployError::LeaseConflict {
                        instance: instance_id.to_string(),
                        holder: format!("unreadable marker at {}", marker.path().display()),
                    });
                }
            };

            if !existing.is_expired() {
                return Err(DeployError::LeaseConflict {
                    instance: instance_id.to_string(),
                    holder: format!("{} (pid {})", existing.holder_id, existing.pid),
                });
            }

            warn!(
                instance = instance_id,
                stale_holder = %existing.holder_id,
                expired_at = %existing.expires_at,
                "taking over expired lease"
            );
        }

        let lease = Lease::new(instance_id, ttl);
        marker.write_json(&lease).await?;
        info!(instance = instance_id, holder = %lease.holder_id, path = %marker.path().display(), "lease acquired");
        Ok(lease)
    }

    async fn release(&self, lease: &Lease) -> Result<(), DeployError> {
        let _guard = self.lock(&lease.instance_id).await?;
        match self.current(&lease.instance_id).await? {
            Some(current) if current.holder_id == lease.holder_id => {
                self.marker(&lease.instance_id).delete().await?;
                debug!(instance = %lease.instance_id, holder = %lease.holder_id, "lease released");
            }
            Some(current) => {
                warn!(
                    instance = %lease.instance_id,
                    holder = %current.holder_id,
                    "lease was taken over, leaving marker in place"
                );
            }
            None => {}
        }
        Ok(())
    }
}
