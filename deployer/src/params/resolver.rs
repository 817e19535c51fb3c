//! Resolves deployment parameters from the configuration store

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::cloud::ParameterStore;
use crate::errors::DeployError;
use crate::models::config::{ParamKey, ParameterMap};

/// Default path prefix under which parameters live
pub const DEFAULT_PREFIX: &str = "/modeldeploy/";

/// Looks up a key set under a path prefix, failing fast on anything missing.
///
/// There are no retries: a store that cannot answer now will not be asked
/// again during this run.
pub struct ParameterResolver {
    store: Arc<dyn ParameterStore>,
    prefix: String,
    timeout: Duration,
}

impl ParameterResolver {
    pub fn new(store: Arc<dyn ParameterStore>, prefix: &str) -> Self {
        let mut prefix = prefix.trim().to_string();
        if !prefix.starts_with('/') {
            prefix.insert(0, '/');
        }
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self {
            store,
            prefix,
            timeout: Duration::from_secs(60),
        }
    }

    /// Bound the store lookup
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Resolve `keys`, returning values keyed by their unprefixed name
    pub async fn resolve(&self, keys: &[ParamKey]) -> Result<ParameterMap, DeployError> {
        let names: Vec<String> = keys
            .iter()
            .map(|k| format!("{}{}", self.prefix, k.name))
            .collect();
        debug!(prefix = %self.prefix, count = names.len(), "resolving parameters");

        let found = tokio::time::timeout(self.timeout, self.store.get_parameters(&names))
            .await
            .map_err(|_| {
                DeployError::ConfigError(format!(
                    "parameter store did not answer within {:?}",
                    self.timeout
                ))
            })?
            .map_err(|e| DeployError::ConfigError(format!("parameter store lookup failed: {}", e)))?;

        let mut resolved = ParameterMap::new();
        let mut missing = Vec::new();
        for (key, name) in keys.iter().zip(&names) {
            match found.get(name).map(|v| v.trim()) {
                Some(value) if !value.is_empty() => {
                    resolved.insert(key.name.to_string(), value.to_string());
                }
                Some(_) if key.required => {
                    return Err(DeployError::ConfigError(format!(
                        "malformed parameter '{}': value is empty",
                        name
                    )));
                }
                None if key.required => missing.push(name.clone()),
                _ => {}
            }
        }

        if !missing.is_empty() {
            return Err(DeployError::ConfigError(format!(
                "missing required parameter(s): {}",
                missing.join(", ")
            )));
        }

        info!(prefix = %self.prefix, resolved = resolved.len(), "parameters resolved");
        Ok(resolved)
    }
}
