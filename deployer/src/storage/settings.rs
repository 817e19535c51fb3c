//! Settings file management

use serde::{Deserialize, Serialize};

use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::params::resolver::DEFAULT_PREFIX;

/// Local deployer settings, read from `settings.json` in the state directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines on stderr
    #[serde(default)]
    pub log_json: bool,

    /// Keep a rolling transcript under `logs/`
    #[serde(default = "default_true")]
    pub log_to_file: bool,

    /// Parameter store path prefix
    #[serde(default = "default_prefix")]
    pub parameter_prefix: String,

    /// AWS CLI settings
    #[serde(default)]
    pub aws: AwsSettings,

    /// Parameter store lookup budget in seconds
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout_secs: u64,

    /// Per-request timeout of the health probe in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_resolve_timeout() -> u64 {
    60
}

fn default_probe_timeout() -> u64 {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: true,
            parameter_prefix: default_prefix(),
            aws: AwsSettings::default(),
            resolve_timeout_secs: default_resolve_timeout(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl Settings {
    /// Read the settings file, falling back to defaults when it does not exist
    pub async fn load(file: &File) -> Result<Self, DeployError> {
        if !file.exists().await {
            return Ok(Self::default());
        }
        file.read_json().await
    }
}

/// AWS CLI settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwsSettings {
    /// Named profile
    #[serde(default)]
    pub profile: Option<String>,

    /// Region of the parameter store
    #[serde(default)]
    pub region: Option<String>,

    /// Path to the `aws` executable
    #[serde(default = "default_cli_path")]
    pub cli_path: String,

    /// Timeout of a single CLI call in seconds
    #[serde(default = "default_cli_timeout")]
    pub cli_timeout_secs: u64,
}

fn default_cli_path() -> String {
    "aws".to_string()
}

fn default_cli_timeout() -> u64 {
    60
}

impl Default for AwsSettings {
    fn default() -> Self {
        Self {
            profile: None,
            region: None,
            cli_path: default_cli_path(),
            cli_timeout_secs: default_cli_timeout(),
        }
    }
}
