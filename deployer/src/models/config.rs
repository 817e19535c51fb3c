//! Deployment configuration resolved from the parameter store

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::DeployError;

/// Tag pulled when neither the CLI nor the parameter store names one
pub const DEFAULT_IMAGE_TAG: &str = "latest";

/// A parameter the resolver looks up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamKey {
    pub name: &'static str,
    pub required: bool,
}

impl ParamKey {
    pub const fn required(name: &'static str) -> Self {
        Self { name, required: true }
    }

    pub const fn optional(name: &'static str) -> Self {
        Self {
            name,
            required: false,
        }
    }
}

pub mod keys {
    pub const INSTANCE_ID: &str = "instance-id";
    pub const REGION: &str = "region";
    pub const IMAGE_REPOSITORY: &str = "image-repository";
    pub const HF_TOKEN_SECRET: &str = "hf-token-secret";
    pub const IMAGE_TAG: &str = "image-tag";
    pub const CONTAINER_NAME: &str = "container-name";
    pub const CONTAINER_PORT: &str = "container-port";
    pub const HOST_PORT: &str = "host-port";
    pub const MODEL_ID: &str = "model-id";
    pub const GPUS: &str = "gpus";
    pub const HEALTH_PATH: &str = "health-path";
    pub const HEALTH_URL: &str = "health-url";
    pub const START_TIMEOUT: &str = "start-timeout-secs";
    pub const COMMAND_TIMEOUT: &str = "command-timeout-secs";
    pub const HEALTH_TIMEOUT: &str = "health-timeout-secs";
    pub const HEALTH_INTERVAL: &str = "health-interval-secs";
    pub const POLL_INTERVAL: &str = "poll-interval-secs";
    pub const MAX_RETRIES: &str = "max-retries";
    pub const AGENT_READY_RETRIES: &str = "agent-ready-retries";
    pub const LOG_GROUP: &str = "log-group";
}

/// Every key a deployment run resolves
pub const DEPLOYMENT_KEYS: &[ParamKey] = &[
    ParamKey::required(keys::INSTANCE_ID),
    ParamKey::required(keys::REGION),
    ParamKey::required(keys::IMAGE_REPOSITORY),
    ParamKey::required(keys::HF_TOKEN_SECRET),
    ParamKey::optional(keys::IMAGE_TAG),
    ParamKey::optional(keys::CONTAINER_NAME),
    ParamKey::optional(keys::CONTAINER_PORT),
    ParamKey::optional(keys::HOST_PORT),
    ParamKey::optional(keys::MODEL_ID),
    ParamKey::optional(keys::GPUS),
    ParamKey::optional(keys::HEALTH_PATH),
    ParamKey::optional(keys::HEALTH_URL),
    ParamKey::optional(keys::START_TIMEOUT),
    ParamKey::optional(keys::COMMAND_TIMEOUT),
    ParamKey::optional(keys::HEALTH_TIMEOUT),
    ParamKey::optional(keys::HEALTH_INTERVAL),
    ParamKey::optional(keys::POLL_INTERVAL),
    ParamKey::optional(keys::MAX_RETRIES),
    ParamKey::optional(keys::AGENT_READY_RETRIES),
    ParamKey::optional(keys::LOG_GROUP),
];

/// Keys needed by operator commands that only touch the instance
pub const INSTANCE_KEYS: &[ParamKey] = &[
    ParamKey::required(keys::INSTANCE_ID),
    ParamKey::required(keys::REGION),
    ParamKey::optional(keys::START_TIMEOUT),
    ParamKey::optional(keys::POLL_INTERVAL),
    ParamKey::optional(keys::MAX_RETRIES),
];

/// Resolved key -> value parameters
pub type ParameterMap = BTreeMap<String, String>;

/// Reference to a secret, resolved on the target machine only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "store", content = "id", rename_all = "snake_case")]
pub enum SecretRef {
    /// A Secrets Manager secret id or ARN
    SecretsManager(String),
    /// An encrypted parameter in the parameter store
    Parameter(String),
}

impl FromStr for SecretRef {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let secret = if let Some(id) = s.strip_prefix("secretsmanager:") {
            SecretRef::SecretsManager(id.trim().to_string())
        } else if let Some(name) = s.strip_prefix("ssm:") {
            SecretRef::Parameter(name.trim().to_string())
        } else if s.starts_with("arn:") && s.contains(":secretsmanager:") {
            SecretRef::SecretsManager(s.to_string())
        } else {
            return Err(DeployError::ConfigError(format!(
                "secret reference must be 'secretsmanager:<id>', 'ssm:<name>' or a secret ARN, got '{}'",
                s
            )));
        };

        let id = match &secret {
            SecretRef::SecretsManager(id) | SecretRef::Parameter(id) => id,
        };
        if id.is_empty() {
            return Err(DeployError::ConfigError(format!(
                "secret reference '{}' names no secret",
                s
            )));
        }
        Ok(secret)
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretRef::SecretsManager(id) => write!(f, "secretsmanager:{}", id),
            SecretRef::Parameter(name) => write!(f, "ssm:{}", name),
        }
    }
}

/// Configuration for one deployment run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentConfig {
    pub instance_id: String,
    pub region: String,
    pub image_repository: String,
    pub image_tag: String,
    pub hf_token_secret: SecretRef,
    pub container_name: String,
    pub container_port: u16,
    pub host_port: u16,
    pub model_id: Option<String>,
    /// `None` runs the container without GPU access
    pub gpus: Option<String>,
    pub health_path: String,
    pub health_url: Option<Url>,
    pub start_timeout: Duration,
    pub command_timeout: Duration,
    pub health_timeout: Duration,
    pub health_interval: Duration,
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub agent_ready_retries: u32,
    pub log_group: Option<String>,
}

impl DeploymentConfig {
    /// Build a typed configuration from resolved parameters
    pub fn from_parameters(params: &ParameterMap) -> Result<Self, DeployError> {
        let image_repository = required(params, keys::IMAGE_REPOSITORY)?;
        if image_repository.contains(':') && !image_repository.contains('/') {
            return Err(malformed(
                keys::IMAGE_REPOSITORY,
                &image_repository,
                "expected <registry>/<repository> without a tag",
            ));
        }

        let health_path = optional(params, keys::HEALTH_PATH).unwrap_or_else(|| "/health".to_string());
        if !health_path.starts_with('/') {
            return Err(malformed(keys::HEALTH_PATH, &health_path, "must start with '/'"));
        }

        let health_url = match optional(params, keys::HEALTH_URL) {
            Some(raw) => {
                let url = Url::parse(&raw).map_err(|e| malformed(keys::HEALTH_URL, &raw, &e.to_string()))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(malformed(keys::HEALTH_URL, &raw, "scheme must be http or https"));
                }
                Some(url)
            }
            None => None,
        };

        let gpus = match optional(params, keys::GPUS) {
            Some(v) if v.eq_ignore_ascii_case("none") => None,
            Some(v) => Some(v),
            None => Some("all".to_string()),
        };

        Ok(Self {
            instance_id: required(params, keys::INSTANCE_ID)?,
            region: required(params, keys::REGION)?,
            image_repository,
            image_tag: optional(params, keys::IMAGE_TAG).unwrap_or_else(|| DEFAULT_IMAGE_TAG.to_string()),
            hf_token_secret: required(params, keys::HF_TOKEN_SECRET)?.parse()?,
            container_name: optional(params, keys::CONTAINER_NAME)
                .unwrap_or_else(|| "model-server".to_string()),
            container_port: parse_or(params, keys::CONTAINER_PORT, 8000)?,
            host_port: parse_or(params, keys::HOST_PORT, 8000)?,
            model_id: optional(params, keys::MODEL_ID),
            gpus,
            health_path,
            health_url,
            start_timeout: secs_or(params, keys::START_TIMEOUT, 600)?,
            command_timeout: secs_or(params, keys::COMMAND_TIMEOUT, 1800)?,
            health_timeout: secs_or(params, keys::HEALTH_TIMEOUT, 900)?,
            health_interval: secs_or(params, keys::HEALTH_INTERVAL, 15)?,
            poll_interval: secs_or(params, keys::POLL_INTERVAL, 5)?,
            max_retries: parse_or(params, keys::MAX_RETRIES, 3)?,
            agent_ready_retries: parse_or(params, keys::AGENT_READY_RETRIES, 10)?,
            log_group: optional(params, keys::LOG_GROUP),
        })
    }

    /// Registry host of the image repository
    pub fn registry(&self) -> &str {
        self.image_repository
            .split('/')
            .next()
            .unwrap_or(&self.image_repository)
    }

    /// Fully qualified image reference for a tag
    pub fn image_ref(&self, tag: &str) -> String {
        format!("{}:{}", self.image_repository, tag)
    }

    /// Health endpoint for an instance reachable at `address`
    pub fn health_url_for(&self, address: &str) -> Result<Url, DeployError> {
        if let Some(url) = &self.health_url {
            return Ok(url.clone());
        }
        let raw = format!("http://{}:{}{}", address, self.host_port, self.health_path);
        Url::parse(&raw).map_err(|e| DeployError::ConfigError(format!("invalid health url '{}': {}", raw, e)))
    }

    /// Upper bound on how long one run may hold its lease
    pub fn lease_ttl(&self) -> Duration {
        self.start_timeout + self.command_timeout + self.health_timeout + Duration::from_secs(300)
    }
}

/// The subset of configuration operator commands need to reach the instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceTarget {
    pub instance_id: String,
    pub region: String,
    pub start_timeout: Duration,
    pub poll_interval: Duration,
    pub max_retries: u32,
}

impl InstanceTarget {
    pub fn from_parameters(params: &ParameterMap) -> Result<Self, DeployError> {
        Ok(Self {
            instance_id: required(params, keys::INSTANCE_ID)?,
            region: required(params, keys::REGION)?,
            start_timeout: secs_or(params, keys::START_TIMEOUT, 600)?,
            poll_interval: secs_or(params, keys::POLL_INTERVAL, 5)?,
            max_retries: parse_or(params, keys::MAX_RETRIES, 3)?,
        })
    }
}

impl From<&DeploymentConfig> for InstanceTarget {
    fn from(config: &DeploymentConfig) -> Self {
        Self {
            instance_id: config.instance_id.clone(),
            region: config.region.clone(),
            start_timeout: config.start_timeout,
            poll_interval: config.poll_interval,
            max_retries: config.max_retries,
        }
    }
}

fn required(params: &ParameterMap, key: &str) -> Result<String, DeployError> {
    optional(params, key).ok_or_else(|| DeployError::ConfigError(format!("missing required parameter '{}'", key)))
}

fn optional(params: &ParameterMap, key: &str) -> Option<String> {
    params
        .get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<T: FromStr>(params: &ParameterMap, key: &str, default: T) -> Result<T, DeployError>
where
    T::Err: fmt::Display,
{
    match optional(params, key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| malformed(key, &raw, &e.to_string())),
        None => Ok(default),
    }
}

fn secs_or(params: &ParameterMap, key: &str, default: u64) -> Result<Duration, DeployError> {
    let secs: u64 = parse_or(params, key, default)?;
    if secs == 0 {
        return Err(malformed(key, "0", "must be greater than zero"));
    }
    Ok(Duration::from_secs(secs))
}

fn malformed(key: &str, value: &str, reason: &str) -> DeployError {
    DeployError::ConfigError(format!("malformed parameter '{}' = '{}': {}", key, value, reason))
}
