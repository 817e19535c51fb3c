//! Deployment orchestrator
//!
//! Drives one [`DeploymentAttempt`] through the phase machine: resolve
//! configuration, take the instance lease, bring the instance up, run the
//! deploy script through the command channel, then gate on service health.
//! The first fatal error ends the run; an outstanding remote command is
//! cancelled and the lease is released on every path.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};
use url::Url;

use crate::cloud::{CloudConnector, ParameterStore};
use crate::deploy::cancel::CancelSignal;
use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentState, PhasePlan};
use crate::dispatch::{check_outcome, CommandDispatcher, DeployScript, DispatchPolicy};
use crate::errors::DeployError;
use crate::health::{HealthOutcome, HealthProbe, HealthValidator};
use crate::instance::{InstanceController, StartPolicy, StartProgress};
use crate::lease::{Lease, LeaseRegistry};
use crate::models::attempt::{DeploymentAttempt, Phase, PhaseOutcome, RunFlags, Validation};
use crate::models::command::{CommandHandle, RemoteScript, SubmitOptions};
use crate::models::config::{DeploymentConfig, InstanceTarget, DEPLOYMENT_KEYS};
use crate::params::ParameterResolver;

/// External capabilities a run needs
#[derive(Clone)]
pub struct Backends {
    pub parameters: Arc<dyn ParameterStore>,
    pub cloud: Arc<dyn CloudConnector>,
    pub probe: Arc<dyn HealthProbe>,
    pub leases: Arc<dyn LeaseRegistry>,
}

/// Everything a run learns as it goes; nothing here outlives the run
#[derive(Default)]
struct RunContext {
    config: Option<DeploymentConfig>,
    image_tag: String,
    controller: Option<InstanceController>,
    dispatcher: Option<CommandDispatcher>,
    lease: Option<Lease>,
    progress: Option<StartProgress>,
    address: Option<String>,
    script: Option<RemoteScript>,
    handle: Option<CommandHandle>,
}

impl RunContext {
    fn config(&self) -> Result<&DeploymentConfig, DeployError> {
        self.config
            .as_ref()
            .ok_or_else(|| DeployError::Internal("configuration not resolved".to_string()))
    }

    fn controller(&self) -> Result<&InstanceController, DeployError> {
        self.controller
            .as_ref()
            .ok_or_else(|| DeployError::Internal("instance controller not ready".to_string()))
    }

    fn dispatcher(&self) -> Result<&CommandDispatcher, DeployError> {
        self.dispatcher
            .as_ref()
            .ok_or_else(|| DeployError::Internal("command dispatcher not ready".to_string()))
    }
}

/// Sequences the deployment phases
pub struct Orchestrator {
    backends: Backends,
    prefix: String,
    resolve_timeout: Duration,
}

impl Orchestrator {
    pub fn new(backends: Backends, prefix: &str) -> Self {
        Self {
            backends,
            prefix: prefix.to_string(),
            resolve_timeout: Duration::from_secs(60),
        }
    }

    /// Bound the parameter store lookup
    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    /// Run one deployment attempt to a terminal state
    pub async fn run(&self, flags: &RunFlags, cancel: &CancelSignal) -> DeploymentAttempt {
        let mut attempt = DeploymentAttempt::new(flags.clone());
        let plan = PhasePlan::from(flags);
        let mut fsm = DeploymentFsm::new(plan);
        let mut run = RunContext::default();

        info!(attempt = %attempt.id, ?flags, "deployment attempt started");

        match advance(&mut fsm, DeploymentEvent::Begin) {
            Ok(_) => {
                attempt.record(Phase::Init, PhaseOutcome::Completed, Duration::ZERO);
                record_skipped(&fsm, &mut attempt, Phase::Init);
            }
            Err(e) => attempt.finish_failed(Phase::Init, &e),
        }

        while let DeploymentState::Active(phase) = fsm.state() {
            if let Err(e) = cancel.checkpoint() {
                warn!(attempt = %attempt.id, %phase, "cancelled before phase");
                let _ = advance(&mut fsm, DeploymentEvent::Cancel);
                attempt.finish_failed(phase, &e);
                break;
            }

            info!(attempt = %attempt.id, %phase, "entering phase");
            let started = Instant::now();
            let result = self.execute(phase, flags, &mut run, &mut attempt, cancel).await;
            let elapsed = started.elapsed();

            match result {
                Ok(()) => {
                    attempt.record(phase, PhaseOutcome::Completed, elapsed);
                    if let Err(e) = advance(&mut fsm, DeploymentEvent::PhaseCompleted) {
                        attempt.finish_failed(phase, &e);
                        break;
                    }
                    record_skipped(&fsm, &mut attempt, phase);
                }
                Err(e) => {
                    attempt.record(phase, PhaseOutcome::Failed, elapsed);
                    let event = match e {
                        DeployError::Cancelled => DeploymentEvent::Cancel,
                        _ => DeploymentEvent::PhaseFailed(e.to_string()),
                    };
                    let _ = advance(&mut fsm, event);
                    error!(attempt = %attempt.id, %phase, kind = e.kind(), error = %e, "phase failed");
                    attempt.finish_failed(phase, &e);
                    break;
                }
            }
        }

        if fsm.state() == DeploymentState::Done {
            let validation = if plan.validate_health {
                Validation::Verified
            } else {
                Validation::ValidationSkipped
            };
            attempt.finish_done(validation);
            info!(attempt = %attempt.id, ?validation, "deployment done");
        }

        // A command submitted but never awaited must not outlive the run
        if let (Some(handle), Some(dispatcher)) = (run.handle.take(), run.dispatcher.as_ref()) {
            warn!(attempt = %attempt.id, command_id = %handle.command_id, "run ended with command outstanding, cancelling");
            dispatcher.cancel(&handle).await;
        }

        if let Some(lease) = run.lease.take() {
            if let Err(e) = self.backends.leases.release(&lease).await {
                warn!(instance = %lease.instance_id, error = %e, "failed to release lease");
            }
        }

        attempt
    }

    async fn execute(
        &self,
        phase: Phase,
        flags: &RunFlags,
        run: &mut RunContext,
        attempt: &mut DeploymentAttempt,
        cancel: &CancelSignal,
    ) -> Result<(), DeployError> {
        match phase {
            Phase::Init => Ok(()),

            Phase::ResolvingConfig => {
                let resolver = ParameterResolver::new(self.backends.parameters.clone(), &self.prefix)
                    .with_timeout(self.resolve_timeout);
                let params = resolver.resolve(DEPLOYMENT_KEYS).await?;
                let config = DeploymentConfig::from_parameters(&params)?;

                run.image_tag = flags
                    .image_tag
                    .clone()
                    .unwrap_or_else(|| config.image_tag.clone());
                attempt.instance_id = Some(config.instance_id.clone());
                attempt.image_tag = Some(run.image_tag.clone());

                let compute = self.backends.cloud.compute(&config.region);
                let channel = self.backends.cloud.channel(&config.region);
                run.controller = Some(InstanceController::new(
                    compute,
                    StartPolicy::from(&InstanceTarget::from(&config)),
                ));
                run.dispatcher = Some(CommandDispatcher::new(channel, DispatchPolicy::from(&config)));

                info!(
                    instance = %config.instance_id,
                    region = %config.region,
                    image = %config.image_ref(&run.image_tag),
                    secret = %config.hf_token_secret,
                    "configuration resolved"
                );
                run.config = Some(config);
                Ok(())
            }

            Phase::AcquiringLease => {
                let config = run.config()?;
                let lease = self
                    .backends
                    .leases
                    .acquire(&config.instance_id, config.lease_ttl())
                    .await?;
                run.lease = Some(lease);
                Ok(())
            }

            Phase::StartingInstance => {
                let instance_id = run.config()?.instance_id.clone();
                let progress = run.controller()?.begin_start(&instance_id, cancel).await?;
                run.progress = Some(progress);
                Ok(())
            }

            Phase::AwaitingInstanceReady => {
                let progress = run
                    .progress
                    .take()
                    .ok_or_else(|| DeployError::Internal("instance start was not requested".to_string()))?;
                let described = run.controller()?.await_running(progress, cancel).await?;
                run.address = described.address;
                Ok(())
            }

            Phase::DispatchingCommand => {
                let config = run.config()?;
                let script = if flags.quick_restart {
                    DeployScript::quick_restart(config)
                } else {
                    DeployScript::full(config, &run.image_tag)
                }
                .render();
                attempt.script_digest = Some(script.digest());

                let options = SubmitOptions {
                    comment: format!("modeldeploy attempt {}", attempt.id),
                    execution_timeout: config.command_timeout,
                    log_group: config.log_group.clone(),
                };
                let handle = run
                    .dispatcher()?
                    .submit(&config.instance_id, &script, &options, cancel)
                    .await?;

                attempt.command_id = Some(handle.command_id.clone());
                run.handle = Some(handle);
                run.script = Some(script);
                Ok(())
            }

            Phase::AwaitingCommandResult => {
                let handle = run
                    .handle
                    .take()
                    .ok_or_else(|| DeployError::Internal("no command was submitted".to_string()))?;
                let script = run.script.take().unwrap_or(RemoteScript { lines: Vec::new() });
                let timeout = run.config()?.command_timeout;

                let command = run
                    .dispatcher()?
                    .await_result(&handle, script, timeout, cancel)
                    .await?;
                check_outcome(&command, timeout)
            }

            Phase::ValidatingHealth => {
                let url = self.health_url(run).await?;
                let config = run.config()?;
                let report = HealthValidator::new(self.backends.probe.clone())
                    .poll(&url, config.health_interval, config.health_timeout, cancel)
                    .await?;

                match report.outcome {
                    HealthOutcome::Healthy => Ok(()),
                    HealthOutcome::Unhealthy(observation) => Err(DeployError::HealthCheckFailed {
                        url: url.to_string(),
                        observation,
                    }),
                    HealthOutcome::TimedOut => Err(DeployError::HealthCheckTimeout {
                        url: url.to_string(),
                        timeout: config.health_timeout,
                        last_observation: report.last_observation,
                    }),
                }
            }
        }
    }

    /// Health endpoint for this run: the configured override, else the instance address
    async fn health_url(&self, run: &mut RunContext) -> Result<Url, DeployError> {
        let config = run.config()?;
        if let Some(url) = &config.health_url {
            return Ok(url.clone());
        }

        if run.address.is_none() {
            let described = run.controller()?.describe(&config.instance_id).await?;
            if described.address.is_none() {
                return Err(DeployError::HealthCheckFailed {
                    url: format!("http://<unknown>:{}{}", config.host_port, config.health_path),
                    observation: format!(
                        "instance {} has no reachable address (state: {})",
                        config.instance_id, described.state
                    ),
                });
            }
            run.address = described.address;
        }

        let address = run.address.as_deref().unwrap_or_default();
        run.config()?.health_url_for(address)
    }
}

fn advance(fsm: &mut DeploymentFsm, event: DeploymentEvent) -> Result<DeploymentState, DeployError> {
    fsm.process(event).map_err(DeployError::InvalidTransition)
}

fn record_skipped(fsm: &DeploymentFsm, attempt: &mut DeploymentAttempt, after: Phase) {
    for phase in fsm.skipped_after(after) {
        info!(attempt = %attempt.id, %phase, "phase skipped");
        attempt.record(phase, PhaseOutcome::Skipped, Duration::ZERO);
    }
}
