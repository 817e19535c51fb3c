//! Command submission and result polling

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cloud::CommandChannel;
use crate::deploy::cancel::CancelSignal;
use crate::errors::{CloudError, DeployError};
use crate::models::command::{CommandHandle, CommandStatus, RemoteCommand, RemoteScript, SubmitOptions};
use crate::models::config::DeploymentConfig;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Retry budgets for the command channel
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    /// Consecutive channel failures tolerated
    pub max_retries: u32,

    /// "Target not ready" answers tolerated on submission
    pub agent_ready_retries: u32,

    /// Delay between status polls
    pub poll_interval: Duration,

    pub backoff: CooldownOptions,
}

impl From<&DeploymentConfig> for DispatchPolicy {
    fn from(config: &DeploymentConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            agent_ready_retries: config.agent_ready_retries,
            poll_interval: config.poll_interval,
            backoff: CooldownOptions::default(),
        }
    }
}

/// Transport-only front of the command channel.
///
/// Knows nothing about script contents; it delivers, watches and retries
/// channel failures. A script that ran and failed is never resubmitted.
pub struct CommandDispatcher {
    channel: Arc<dyn CommandChannel>,
    policy: DispatchPolicy,
    in_flight: Mutex<HashSet<String>>,
}

impl CommandDispatcher {
    pub fn new(channel: Arc<dyn CommandChannel>, policy: DispatchPolicy) -> Self {
        Self {
            channel,
            policy,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Whether a command is outstanding for the instance
    pub fn is_in_flight(&self, instance_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(instance_id)
    }

    fn release(&self, instance_id: &str) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance_id);
    }

    /// Deliver `script`, returning as soon as the channel acknowledged it
    pub async fn submit(
        &self,
        instance_id: &str,
        script: &RemoteScript,
        options: &SubmitOptions,
        cancel: &CancelSignal,
    ) -> Result<CommandHandle, DeployError> {
        let claimed = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instance_id.to_string());
        if !claimed {
            return Err(DeployError::CommandInFlight(instance_id.to_string()));
        }

        let result = self.submit_with_retry(instance_id, script, options, cancel).await;
        if result.is_err() {
            self.release(instance_id);
        }
        result
    }

    async fn submit_with_retry(
        &self,
        instance_id: &str,
        script: &RemoteScript,
        options: &SubmitOptions,
        cancel: &CancelSignal,
    ) -> Result<CommandHandle, DeployError> {
        let mut attempts = 0;
        let mut not_ready = 0;
        let mut transient = 0;

        loop {
            cancel.checkpoint()?;
            attempts += 1;

            let delay = match self.channel.submit(instance_id, script, options).await {
                Ok(handle) => {
                    info!(
                        instance = instance_id,
                        command_id = %handle.command_id,
                        digest = %script.digest(),
                        attempts,
                        "command submitted"
                    );
                    return Ok(handle);
                }
                Err(CloudError::TargetNotReady(message)) => {
                    not_ready += 1;
                    if not_ready > self.policy.agent_ready_retries {
                        return Err(DeployError::ChannelError {
                            message: format!("command agent never became ready: {}", message),
                            attempts,
                        });
                    }
                    debug!(instance = instance_id, not_ready, "command agent not registered yet");
                    calc_exp_backoff(&self.policy.backoff, not_ready - 1)
                }
                Err(CloudError::Transient(message)) => {
                    transient += 1;
                    if transient > self.policy.max_retries {
                        return Err(DeployError::ChannelError { message, attempts });
                    }
                    warn!(instance = instance_id, attempt = transient, error = %message, "transient submit failure");
                    calc_exp_backoff(&self.policy.backoff, transient - 1)
                }
                Err(CloudError::Rejected(message)) => {
                    return Err(DeployError::ChannelError { message, attempts });
                }
            };

            cancel.sleep(delay).await?;
        }
    }

    /// Poll `handle` until it reaches a terminal status or `timeout` elapses.
    ///
    /// On expiry the command is cancelled best-effort and returned as TimedOut.
    pub async fn await_result(
        &self,
        handle: &CommandHandle,
        script: RemoteScript,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Result<RemoteCommand, DeployError> {
        let result = self.poll_until_terminal(handle, script, timeout, cancel).await;
        self.release(&handle.instance_id);
        result
    }

    async fn poll_until_terminal(
        &self,
        handle: &CommandHandle,
        script: RemoteScript,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Result<RemoteCommand, DeployError> {
        let deadline = Instant::now() + timeout;
        let mut command = RemoteCommand::submitted(handle, script);
        let mut polls = 0;
        let mut failures = 0;

        loop {
            let now = Instant::now();
            if now >= deadline {
                warn!(command_id = %handle.command_id, ?timeout, "command did not finish in time, cancelling");
                self.cancel(handle).await;
                command.status = CommandStatus::TimedOut;
                return Ok(command);
            }

            if cancel.sleep(self.policy.poll_interval.min(deadline - now)).await.is_err() {
                warn!(command_id = %handle.command_id, "interrupted, cancelling remote command");
                self.cancel(handle).await;
                return Err(DeployError::Cancelled);
            }

            polls += 1;
            match self.channel.get_status(handle).await {
                Ok(report) => {
                    failures = 0;
                    command.observe(report);
                    debug!(command_id = %handle.command_id, status = ?command.status, polls, "polled command");
                    if command.status.is_terminal() {
                        info!(
                            command_id = %handle.command_id,
                            status = ?command.status,
                            exit_code = ?command.exit_code,
                            "command finished"
                        );
                        return Ok(command);
                    }
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if failures > self.policy.max_retries {
                        return Err(DeployError::ChannelError {
                            message: e.to_string(),
                            attempts: polls,
                        });
                    }
                    let delay = calc_exp_backoff(&self.policy.backoff, failures - 1);
                    warn!(command_id = %handle.command_id, attempt = failures, error = %e, "transient status failure");
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if cancel.sleep(delay.min(remaining)).await.is_err() {
                        self.cancel(handle).await;
                        return Err(DeployError::Cancelled);
                    }
                }
                Err(e) => {
                    return Err(DeployError::ChannelError {
                        message: e.to_string(),
                        attempts: polls,
                    });
                }
            }
        }
    }

    /// Best-effort cancel of a submitted command; frees the instance either way
    pub async fn cancel(&self, handle: &CommandHandle) {
        if let Err(e) = self.channel.cancel(handle).await {
            warn!(command_id = %handle.command_id, error = %e, "failed to cancel remote command");
        }
        self.release(&handle.instance_id);
    }
}

/// Turn a terminal command into the run's verdict
pub fn check_outcome(command: &RemoteCommand, timeout: Duration) -> Result<(), DeployError> {
    match command.status {
        CommandStatus::Success => Ok(()),
        CommandStatus::Failed => Err(DeployError::ScriptExecution {
            exit_code: command.exit_code.unwrap_or(-1),
            output_tail: command.output_tail(),
        }),
        CommandStatus::TimedOut => Err(DeployError::CommandTimeout {
            command_id: command.command_id.clone(),
            timeout,
            output_tail: command.output_tail(),
        }),
        CommandStatus::Pending | CommandStatus::InProgress => Err(DeployError::Internal(format!(
            "command {} checked before reaching a terminal status",
            command.command_id
        ))),
    }
}
