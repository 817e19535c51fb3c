//! HTTP probe of the model server health endpoint

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::errors::DeployError;

/// Longest body kept from a probe response
const MAX_BODY_BYTES: usize = 4096;

/// Result of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// The endpoint answered with an HTTP response
    Response { status: u16, body: String },

    /// The request never produced a response (refused, reset, timed out)
    Unreachable(String),
}

/// Issues one GET against a health endpoint
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn get(&self, url: &Url) -> ProbeResult;
}

/// Probe backed by a reqwest client
pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    /// Create a probe whose requests give up after `request_timeout`
    pub fn new(request_timeout: Duration) -> Result<Self, DeployError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("modeldeploy/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn get(&self, url: &Url) -> ProbeResult {
        let response = match self.client.get(url.clone()).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(%url, error = %e, "health probe request failed");
                return ProbeResult::Unreachable(e.to_string());
            }
        };

        let status = response.status().as_u16();
        let mut body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                debug!(%url, status, error = %e, "health probe body unreadable");
                return ProbeResult::Unreachable(e.to_string());
            }
        };
        if body.len() > MAX_BODY_BYTES {
            let mut cut = MAX_BODY_BYTES;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }

        debug!(%url, status, "health probe answered");
        ProbeResult::Response { status, body }
    }
}
