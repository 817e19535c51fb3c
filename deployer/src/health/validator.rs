//! Readiness polling

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::deploy::cancel::CancelSignal;
use crate::errors::DeployError;
use crate::health::probe::{HealthProbe, ProbeResult};

/// Final answer of a polling loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    /// The endpoint answered in a way that will not improve by waiting
    Unhealthy(String),
    TimedOut,
}

/// Outcome plus what was seen on the way
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub outcome: HealthOutcome,
    pub polls: u32,
    pub last_observation: Option<String>,
}

/// How one probe result moves the loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    /// Keep polling; carries a description of what was observed
    NotReady(String),
    Unhealthy(String),
}

/// Classify a single probe result
pub fn classify(result: &ProbeResult) -> Verdict {
    let (status, body) = match result {
        ProbeResult::Unreachable(reason) => return Verdict::NotReady(format!("unreachable: {}", reason)),
        ProbeResult::Response { status, body } => (*status, body.trim()),
    };

    match status {
        200..=299 => match ready_body(body) {
            Ok(()) => Verdict::Healthy,
            Err(reason) => Verdict::NotReady(format!("HTTP {}: {}", status, reason)),
        },
        408 | 429 | 500..=599 => Verdict::NotReady(format!("HTTP {}", status)),
        400..=499 => Verdict::Unhealthy(format!("HTTP {}", status)),
        _ => Verdict::NotReady(format!("HTTP {}", status)),
    }
}

/// An empty body is ready; otherwise the body must be a JSON object that
/// does not report itself as not ready
fn ready_body(body: &str) -> Result<(), String> {
    if body.is_empty() {
        return Ok(());
    }
    let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(body) else {
        let preview: String = body.chars().take(64).collect();
        return Err(format!("unexpected body {:?}", preview));
    };

    if let Some(status) = fields.get("status") {
        if status.as_str() != Some("healthy") {
            return Err(format!("status is {}", status));
        }
    }
    if let Some(available) = fields.get("vllm_available") {
        if available.as_bool() != Some(true) {
            return Err(format!("vllm_available is {}", available));
        }
    }
    Ok(())
}

/// Polls a health endpoint until it is ready, definitely broken, or out of time
pub struct HealthValidator {
    probe: Arc<dyn HealthProbe>,
}

impl HealthValidator {
    pub fn new(probe: Arc<dyn HealthProbe>) -> Self {
        Self { probe }
    }

    /// Probe `url` every `interval` until a verdict or `timeout`.
    ///
    /// No probe is issued once the deadline has passed.
    pub async fn poll(
        &self,
        url: &Url,
        interval: Duration,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Result<HealthReport, DeployError> {
        let deadline = Instant::now() + timeout;
        let mut report = HealthReport {
            outcome: HealthOutcome::TimedOut,
            polls: 0,
            last_observation: None,
        };

        loop {
            cancel.checkpoint()?;
            let now = Instant::now();
            if now >= deadline {
                warn!(%url, polls = report.polls, last = ?report.last_observation, "health check timed out");
                return Ok(report);
            }

            report.polls += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(DeployError::Cancelled),
                result = tokio::time::timeout(deadline - now, self.probe.get(url)) => {
                    result.unwrap_or_else(|_| ProbeResult::Unreachable("probe outlived the health deadline".to_string()))
                }
            };

            match classify(&result) {
                Verdict::Healthy => {
                    info!(%url, polls = report.polls, "service is healthy");
                    report.outcome = HealthOutcome::Healthy;
                    report.last_observation = Some("healthy".to_string());
                    return Ok(report);
                }
                Verdict::Unhealthy(observation) => {
                    warn!(%url, %observation, "health endpoint rejected the probe");
                    report.outcome = HealthOutcome::Unhealthy(observation.clone());
                    report.last_observation = Some(observation);
                    return Ok(report);
                }
                Verdict::NotReady(observation) => {
                    debug!(%url, poll = report.polls, %observation, "service not ready yet");
                    report.last_observation = Some(observation);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                continue;
            }
            cancel.sleep(interval.min(remaining)).await?;
        }
    }
}
