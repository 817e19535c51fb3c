//! State directory layout

use std::path::PathBuf;

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Environment variable overriding the state directory
pub const HOME_ENV: &str = "MODELDEPLOY_HOME";

/// Local state of the deployer
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Lease markers, one per instance
    pub fn leases_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("leases"))
    }

    /// Attempt records
    pub fn attempts_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("attempts"))
    }

    /// Record of the most recent attempt
    pub fn last_attempt_file(&self) -> File {
        self.attempts_dir().file("last.json")
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), DeployError> {
        self.leases_dir().create().await?;
        self.attempts_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        let base_dir = std::env::var_os(HOME_ENV)
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var_os("HOME")
                    .or_else(|| std::env::var_os("USERPROFILE"))
                    .map(|home| PathBuf::from(home).join(".modeldeploy"))
            })
            .unwrap_or_else(|| PathBuf::from(".modeldeploy"));

        Self::new(base_dir)
    }
}
