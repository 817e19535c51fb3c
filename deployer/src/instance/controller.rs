//! Instance lifecycle control

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cloud::ComputeBackend;
use crate::deploy::cancel::CancelSignal;
use crate::errors::{CloudError, DeployError};
use crate::models::config::InstanceTarget;
use crate::models::instance::{InstanceDescription, InstanceState};
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Time and retry budget for bringing an instance up (or down)
#[derive(Debug, Clone)]
pub struct StartPolicy {
    /// Overall budget, shared by the start request and the wait for Running
    pub timeout: Duration,

    /// Delay between describe polls
    pub poll_interval: Duration,

    /// Transient API failures tolerated before giving up
    pub max_retries: u32,

    /// Backoff applied after a transient API failure
    pub backoff: CooldownOptions,
}

impl From<&InstanceTarget> for StartPolicy {
    fn from(target: &InstanceTarget) -> Self {
        Self {
            timeout: target.start_timeout,
            poll_interval: target.poll_interval,
            max_retries: target.max_retries,
            backoff: CooldownOptions::default(),
        }
    }
}

/// State carried from StartingInstance into AwaitingInstanceReady
#[derive(Debug, Clone)]
pub struct StartProgress {
    instance_id: String,
    deadline: Instant,
    start_requested: bool,
    last_state: InstanceState,
    transient_failures: u32,
    ready: Option<InstanceDescription>,
}

impl StartProgress {
    /// Whether this run issued a start request
    pub fn start_requested(&self) -> bool {
        self.start_requested
    }

    pub fn last_state(&self) -> InstanceState {
        self.last_state
    }
}

/// Wraps start/describe/stop of one compute backend.
///
/// This is the only component that asks the backend to change instance state.
pub struct InstanceController {
    backend: Arc<dyn ComputeBackend>,
    policy: StartPolicy,
}

impl InstanceController {
    pub fn new(backend: Arc<dyn ComputeBackend>, policy: StartPolicy) -> Self {
        Self { backend, policy }
    }

    /// Read-only probe of the instance
    pub async fn describe(&self, instance_id: &str) -> Result<InstanceDescription, DeployError> {
        Ok(self.backend.describe(instance_id).await?)
    }

    /// Ensure the instance is Running, starting it if needed
    pub async fn start(
        &self,
        instance_id: &str,
        cancel: &CancelSignal,
    ) -> Result<InstanceDescription, DeployError> {
        let progress = self.begin_start(instance_id, cancel).await?;
        self.await_running(progress, cancel).await
    }

    /// Inspect the instance and issue a start request when it is stopped.
    ///
    /// A Running instance is left untouched.
    pub async fn begin_start(
        &self,
        instance_id: &str,
        cancel: &CancelSignal,
    ) -> Result<StartProgress, DeployError> {
        let mut progress = StartProgress {
            instance_id: instance_id.to_string(),
            deadline: Instant::now() + self.policy.timeout,
            start_requested: false,
            last_state: InstanceState::Unknown,
            transient_failures: 0,
            ready: None,
        };

        let described = self.describe_with_retry(&mut progress, cancel).await?;
        info!(instance = instance_id, state = %described.state, "instance described");

        match described.state {
            InstanceState::Running => progress.ready = Some(described),
            InstanceState::Terminated => {
                return Err(DeployError::InstanceTerminated(instance_id.to_string()));
            }
            InstanceState::Stopped | InstanceState::Unknown => {
                self.request_start(&mut progress, cancel).await?;
            }
            InstanceState::Pending | InstanceState::Stopping => {
                debug!(instance = instance_id, state = %described.state, "instance in transition, not starting yet");
            }
        }

        Ok(progress)
    }

    /// Poll until the instance is Running or the start budget runs out
    pub async fn await_running(
        &self,
        mut progress: StartProgress,
        cancel: &CancelSignal,
    ) -> Result<InstanceDescription, DeployError> {
        if let Some(ready) = progress.ready.take() {
            return Ok(ready);
        }

        loop {
            let remaining = self.remaining(&progress)?;
            cancel.sleep(self.policy.poll_interval.min(remaining)).await?;

            let described = self.describe_with_retry(&mut progress, cancel).await?;
            debug!(instance = %progress.instance_id, state = %described.state, "polled instance state");

            match described.state {
                InstanceState::Running => {
                    info!(instance = %progress.instance_id, address = ?described.address, "instance is running");
                    return Ok(described);
                }
                InstanceState::Terminated => {
                    return Err(DeployError::InstanceTerminated(progress.instance_id.clone()));
                }
                InstanceState::Stopped | InstanceState::Unknown if !progress.start_requested => {
                    self.request_start(&mut progress, cancel).await?;
                }
                _ => {}
            }
        }
    }

    /// Stop the instance, optionally waiting until it reports Stopped
    pub async fn stop(
        &self,
        instance_id: &str,
        wait: bool,
        cancel: &CancelSignal,
    ) -> Result<InstanceDescription, DeployError> {
        let mut progress = StartProgress {
            instance_id: instance_id.to_string(),
            deadline: Instant::now() + self.policy.timeout,
            start_requested: false,
            last_state: InstanceState::Unknown,
            transient_failures: 0,
            ready: None,
        };

        loop {
            match self.backend.stop(instance_id).await {
                Ok(()) => break,
                Err(e) => self.absorb_transient(&mut progress, e, cancel).await?,
            }
        }
        info!(instance = instance_id, "stop requested");

        loop {
            let described = self.describe_with_retry(&mut progress, cancel).await?;
            if !wait || matches!(described.state, InstanceState::Stopped | InstanceState::Terminated) {
                return Ok(described);
            }
            let remaining = self.remaining(&progress)?;
            cancel.sleep(self.policy.poll_interval.min(remaining)).await?;
        }
    }

    async fn request_start(
        &self,
        progress: &mut StartProgress,
        cancel: &CancelSignal,
    ) -> Result<(), DeployError> {
        loop {
            match self.backend.start(&progress.instance_id).await {
                Ok(()) => {
                    info!(instance = %progress.instance_id, "start requested");
                    progress.start_requested = true;
                    return Ok(());
                }
                Err(e) => self.absorb_transient(progress, e, cancel).await?,
            }
        }
    }

    async fn describe_with_retry(
        &self,
        progress: &mut StartProgress,
        cancel: &CancelSignal,
    ) -> Result<InstanceDescription, DeployError> {
        loop {
            match self.backend.describe(&progress.instance_id).await {
                Ok(described) => {
                    progress.last_state = described.state;
                    return Ok(described);
                }
                Err(e) => self.absorb_transient(progress, e, cancel).await?,
            }
        }
    }

    /// Back off after a transient failure, or turn the failure into the phase error
    async fn absorb_transient(
        &self,
        progress: &mut StartProgress,
        error: CloudError,
        cancel: &CancelSignal,
    ) -> Result<(), DeployError> {
        if !error.is_transient() {
            return Err(DeployError::Cloud(error));
        }

        progress.transient_failures += 1;
        if progress.transient_failures > self.policy.max_retries {
            warn!(
                instance = %progress.instance_id,
                failures = progress.transient_failures,
                error = %error,
                "transient failure budget exhausted"
            );
            return Err(self.timeout_error(progress));
        }

        let delay = calc_exp_backoff(&self.policy.backoff, progress.transient_failures - 1);
        warn!(
            instance = %progress.instance_id,
            attempt = progress.transient_failures,
            delay = ?delay,
            error = %error,
            "transient cloud failure, retrying"
        );
        let remaining = self.remaining(progress)?;
        cancel.sleep(delay.min(remaining)).await
    }

    fn remaining(&self, progress: &StartProgress) -> Result<Duration, DeployError> {
        let now = Instant::now();
        if now >= progress.deadline {
            return Err(self.timeout_error(progress));
        }
        Ok(progress.deadline - now)
    }

    fn timeout_error(&self, progress: &StartProgress) -> DeployError {
        DeployError::StartTimeout {
            instance: progress.instance_id.clone(),
            timeout: self.policy.timeout,
            last_state: progress.last_state,
        }
    }
}
