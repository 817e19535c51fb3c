//! Orchestrator end-to-end tests against the in-memory backends

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use modeldeploy::cloud::{CloudConnector, CommandChannel, ComputeBackend};
use modeldeploy::deploy::cancel::{cancel_pair, CancelHandle, CancelSignal};
use modeldeploy::deploy::{Backends, Orchestrator};
use modeldeploy::errors::CloudError;
use modeldeploy::fakes::{FakeChannel, FakeCompute, FakeProbe};
use modeldeploy::lease::{InProcessLeases, LeaseRegistry};
use modeldeploy::models::attempt::{AttemptResult, Phase, PhaseOutcome, RunFlags, Validation};
use modeldeploy::models::command::{CommandHandle, CommandReport, CommandStatus, RemoteScript, SubmitOptions};
use modeldeploy::models::instance::InstanceState;

use crate::common::{store, Harness, INSTANCE, PREFIX, REPOSITORY};

fn failed_phase(result: &Option<AttemptResult>) -> (Phase, String) {
    match result {
        Some(AttemptResult::Failed { phase, kind, .. }) => (*phase, kind.clone()),
        other => panic!("expected a failed attempt, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_stopped_instance_deployed_end_to_end() {
    let harness = Harness::new(
        store(),
        FakeCompute::new(InstanceState::Stopped).boot_polls(2),
        FakeChannel::new()
            .reply_status(CommandStatus::InProgress)
            .reply_status(CommandStatus::Success),
        FakeProbe::new().status(503).status(503).status(200),
    );

    let attempt = harness.orchestrator.run(&RunFlags::default(), &CancelSignal::never()).await;

    assert_eq!(
        attempt.result,
        Some(AttemptResult::Done {
            validation: Validation::Verified
        })
    );
    assert_eq!(attempt.exit_code(), 0);
    assert_eq!(attempt.instance_id.as_deref(), Some(INSTANCE));
    assert_eq!(attempt.image_tag.as_deref(), Some("latest"));
    assert!(attempt.command_id.is_some());
    assert!(attempt.script_digest.is_some());

    let compute = &harness.cloud.compute;
    let channel = &harness.cloud.channel;
    assert_eq!(compute.start_calls(), 1);
    assert!(compute.describe_calls() >= 1);
    assert_eq!(channel.submit_calls(), 1);
    assert!(channel.status_calls() >= 1);
    assert_eq!(harness.probe.calls(), 3);
    assert_eq!(
        harness.probe.urls()[0].as_str(),
        "http://10.0.0.5:8000/health"
    );

    for phase in &Phase::ORDER {
        assert_eq!(attempt.count(*phase, PhaseOutcome::Completed), 1, "{}", phase);
    }
    assert!(harness.cloud.regions().iter().all(|r| r == "us-east-1"));
    assert!(harness.leases.holder(INSTANCE).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_skip_start_never_starts_instance() {
    let harness = Harness::new(
        store(),
        FakeCompute::new(InstanceState::Running),
        FakeChannel::new(),
        FakeProbe::new().status(200),
    );
    let flags = RunFlags {
        skip_start: true,
        ..Default::default()
    };

    let attempt = harness.orchestrator.run(&flags, &CancelSignal::never()).await;

    assert!(attempt.is_done());
    assert_eq!(harness.cloud.compute.start_calls(), 0);
    assert_eq!(attempt.count(Phase::StartingInstance, PhaseOutcome::Skipped), 1);
    assert_eq!(attempt.count(Phase::AwaitingInstanceReady, PhaseOutcome::Skipped), 1);
    // The health phase still needs the instance address.
    assert_eq!(harness.cloud.compute.describe_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_submit_failures_within_budget() {
    let mut channel = FakeChannel::new();
    for _ in 0..3 {
        channel = channel.submit_error(CloudError::Transient("ThrottlingException".into()));
    }
    let harness = Harness::new(
        store(),
        FakeCompute::new(InstanceState::Running),
        channel,
        FakeProbe::new(),
    );

    let attempt = harness.orchestrator.run(&RunFlags::default(), &CancelSignal::never()).await;

    assert!(attempt.is_done());
    assert_eq!(harness.cloud.channel.submit_calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_transient_submit_failures_over_budget() {
    let mut channel = FakeChannel::new();
    for _ in 0..4 {
        channel = channel.submit_error(CloudError::Transient("ThrottlingException".into()));
    }
    let harness = Harness::new(
        store(),
        FakeCompute::new(InstanceState::Running),
        channel,
        FakeProbe::new(),
    );

    let attempt = harness.orchestrator.run(&RunFlags::default(), &CancelSignal::never()).await;

    assert_eq!(
        failed_phase(&attempt.result),
        (Phase::DispatchingCommand, "ChannelError".to_string())
    );
    assert_eq!(attempt.exit_code(), 1);
    assert_eq!(attempt.last_completed(), Some(Phase::AwaitingInstanceReady));
    assert_eq!(harness.cloud.channel.submit_calls(), 4);
    assert_eq!(harness.probe.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_script_failure_is_submitted_once() {
    let harness = Harness::new(
        store(),
        FakeCompute::new(InstanceState::Running),
        FakeChannel::new().reply(modeldeploy::models::command::CommandReport {
            status: Some(CommandStatus::Failed),
            stdout: "Pulling from vllm-gateway\n".into(),
            stderr: "Error response from daemon: manifest unknown\n".into(),
            exit_code: Some(1),
        }),
        FakeProbe::new(),
    );

    let attempt = harness.orchestrator.run(&RunFlags::default(), &CancelSignal::never()).await;

    match &attempt.result {
        Some(AttemptResult::Failed {
            phase,
            kind,
            excerpt,
            last_completed,
            ..
        }) => {
            assert_eq!(*phase, Phase::AwaitingCommandResult);
            assert_eq!(kind, "ScriptExecutionError");
            assert!(excerpt.as_deref().unwrap_or_default().contains("manifest unknown"));
            assert_eq!(*last_completed, Some(Phase::DispatchingCommand));
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(harness.cloud.channel.submit_calls(), 1);
    assert_eq!(harness.probe.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_runs_conflict_on_lease() {
    let leases = InProcessLeases::new();
    let first = Harness::with_leases(
        store(),
        FakeCompute::new(InstanceState::Stopped),
        FakeChannel::new(),
        FakeProbe::new(),
        leases.clone(),
    );
    let second = Harness::with_leases(
        store(),
        FakeCompute::new(InstanceState::Stopped),
        FakeChannel::new(),
        FakeProbe::new(),
        leases.clone(),
    );

    let never = CancelSignal::never();
    let flags = RunFlags::default();
    let (a, b) = tokio::join!(
        first.orchestrator.run(&flags, &never),
        second.orchestrator.run(&flags, &never)
    );

    let (winner, loser, loser_harness) = if a.is_done() {
        (a, b, &second)
    } else {
        (b, a, &first)
    };
    assert!(winner.is_done());
    assert_eq!(
        failed_phase(&loser.result),
        (Phase::AcquiringLease, "LeaseConflictError".to_string())
    );
    assert_eq!(loser.exit_code(), 3);
    assert_eq!(loser_harness.cloud.compute.start_calls(), 0);
    assert_eq!(loser_harness.cloud.channel.submit_calls(), 0);
    assert_eq!(loser.count(Phase::DispatchingCommand, PhaseOutcome::Completed), 0);
    assert!(leases.holder(INSTANCE).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_lease_held_elsewhere_blocks_run() {
    let leases = InProcessLeases::new();
    let held = leases.acquire(INSTANCE, Duration::from_secs(600)).await.unwrap();
    let harness = Harness::with_leases(
        store(),
        FakeCompute::new(InstanceState::Stopped),
        FakeChannel::new(),
        FakeProbe::new(),
        leases.clone(),
    );

    let attempt = harness.orchestrator.run(&RunFlags::default(), &CancelSignal::never()).await;

    assert_eq!(failed_phase(&attempt.result).0, Phase::AcquiringLease);
    assert_eq!(harness.cloud.compute.describe_calls(), 0);
    assert_eq!(leases.holder(INSTANCE), Some(held));
}

#[tokio::test(start_paused = true)]
async fn test_quick_restart_still_gated_by_health() {
    let harness = Harness::new(
        store().with("/modeldeploy/health-timeout-secs", "60"),
        FakeCompute::new(InstanceState::Running),
        FakeChannel::new(),
        FakeProbe::new().status(503),
    );
    let flags = RunFlags {
        quick_restart: true,
        ..Default::default()
    };

    let attempt = harness.orchestrator.run(&flags, &CancelSignal::never()).await;

    let scripts = harness.cloud.channel.scripts();
    assert_eq!(scripts.len(), 1);
    assert!(scripts[0].lines.iter().any(|l| l.starts_with("docker restart")));
    assert!(!scripts[0].lines.iter().any(|l| l.contains("docker pull")));
    assert_eq!(
        failed_phase(&attempt.result),
        (Phase::ValidatingHealth, "HealthCheckTimeoutError".to_string())
    );
    assert!(harness.probe.calls() >= 4);
}

#[tokio::test(start_paused = true)]
async fn test_image_tag_precedence() {
    let harness = Harness::new(
        store().with("/modeldeploy/image-tag", "v1"),
        FakeCompute::new(InstanceState::Running),
        FakeChannel::new(),
        FakeProbe::new(),
    );
    let attempt = harness.orchestrator.run(&RunFlags::default(), &CancelSignal::never()).await;
    assert_eq!(attempt.image_tag.as_deref(), Some("v1"));

    let flags = RunFlags {
        image_tag: Some("v2".into()),
        ..Default::default()
    };
    let attempt = harness.orchestrator.run(&flags, &CancelSignal::never()).await;
    assert_eq!(attempt.image_tag.as_deref(), Some("v2"));

    let scripts = harness.cloud.channel.scripts();
    let pull = format!("docker pull '{}:v2'", REPOSITORY);
    assert!(scripts[1].lines.contains(&pull));
}

#[tokio::test(start_paused = true)]
async fn test_skip_validation_done_without_probe() {
    let harness = Harness::happy();
    let flags = RunFlags {
        skip_validation: true,
        ..Default::default()
    };

    let attempt = harness.orchestrator.run(&flags, &CancelSignal::never()).await;

    assert_eq!(
        attempt.result,
        Some(AttemptResult::Done {
            validation: Validation::ValidationSkipped
        })
    );
    assert_eq!(harness.probe.calls(), 0);
    assert_eq!(attempt.count(Phase::ValidatingHealth, PhaseOutcome::Skipped), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_configuration_touches_nothing() {
    let harness = Harness::new(
        modeldeploy::fakes::FakeParameterStore::new().with("/modeldeploy/instance-id", INSTANCE),
        FakeCompute::new(InstanceState::Stopped),
        FakeChannel::new(),
        FakeProbe::new(),
    );

    let attempt = harness.orchestrator.run(&RunFlags::default(), &CancelSignal::never()).await;

    assert_eq!(
        failed_phase(&attempt.result),
        (Phase::ResolvingConfig, "ConfigError".to_string())
    );
    assert_eq!(attempt.exit_code(), 2);
    assert!(harness.cloud.regions().is_empty());
    assert_eq!(harness.cloud.compute.describe_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_terminated_instance_fails_start() {
    let harness = Harness::new(
        store(),
        FakeCompute::new(InstanceState::Terminated),
        FakeChannel::new(),
        FakeProbe::new(),
    );

    let attempt = harness.orchestrator.run(&RunFlags::default(), &CancelSignal::never()).await;

    assert_eq!(
        failed_phase(&attempt.result),
        (Phase::StartingInstance, "InstanceTerminated".to_string())
    );
    assert_eq!(harness.cloud.compute.start_calls(), 0);
    assert!(harness.leases.holder(INSTANCE).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_wrong_health_endpoint_fails_fast() {
    let harness = Harness::new(
        store(),
        FakeCompute::new(InstanceState::Running),
        FakeChannel::new(),
        FakeProbe::new().status(404),
    );

    let attempt = harness.orchestrator.run(&RunFlags::default(), &CancelSignal::never()).await;

    assert_eq!(
        failed_phase(&attempt.result),
        (Phase::ValidatingHealth, "HealthCheckFailed".to_string())
    );
    assert_eq!(harness.probe.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_cancels_remote_command() {
    let harness = Harness::new(
        store(),
        FakeCompute::new(InstanceState::Running),
        FakeChannel::new().reply_status(CommandStatus::InProgress),
        FakeProbe::new(),
    );
    let (handle, signal) = cancel_pair();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(12)).await;
        handle.cancel();
    });

    let flags = RunFlags {
        skip_start: true,
        ..Default::default()
    };
    let attempt = harness.orchestrator.run(&flags, &signal).await;

    assert_eq!(
        failed_phase(&attempt.result),
        (Phase::AwaitingCommandResult, "Cancelled".to_string())
    );
    assert_eq!(attempt.exit_code(), 130);
    assert_eq!(attempt.last_completed(), Some(Phase::DispatchingCommand));
    assert_eq!(harness.cloud.channel.cancelled().len(), 1);
    assert!(harness.leases.holder(INSTANCE).is_none());
}

/// Channel whose submission coincides with an operator interrupt
struct InterruptedOnSubmit {
    inner: Arc<FakeChannel>,
    interrupt: CancelHandle,
}

#[async_trait]
impl CommandChannel for InterruptedOnSubmit {
    async fn submit(
        &self,
        instance_id: &str,
        script: &RemoteScript,
        options: &SubmitOptions,
    ) -> Result<CommandHandle, CloudError> {
        let handle = self.inner.submit(instance_id, script, options).await?;
        self.interrupt.cancel();
        Ok(handle)
    }

    async fn get_status(&self, handle: &CommandHandle) -> Result<CommandReport, CloudError> {
        self.inner.get_status(handle).await
    }

    async fn cancel(&self, handle: &CommandHandle) -> Result<(), CloudError> {
        self.inner.cancel(handle).await
    }
}

struct InterruptingCloud {
    compute: Arc<FakeCompute>,
    channel: Arc<InterruptedOnSubmit>,
}

impl CloudConnector for InterruptingCloud {
    fn compute(&self, _region: &str) -> Arc<dyn ComputeBackend> {
        self.compute.clone()
    }

    fn channel(&self, _region: &str) -> Arc<dyn CommandChannel> {
        self.channel.clone()
    }
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_between_dispatch_and_polling_cancels_command() {
    let (interrupt, signal) = cancel_pair();
    let channel = Arc::new(FakeChannel::new().reply_status(CommandStatus::InProgress));
    let leases = InProcessLeases::new();
    let backends = Backends {
        parameters: Arc::new(store()),
        cloud: Arc::new(InterruptingCloud {
            compute: Arc::new(FakeCompute::new(InstanceState::Running)),
            channel: Arc::new(InterruptedOnSubmit {
                inner: channel.clone(),
                interrupt,
            }),
        }),
        probe: Arc::new(FakeProbe::new()),
        leases: Arc::new(leases.clone()),
    };
    let orchestrator = Orchestrator::new(backends, PREFIX);

    let flags = RunFlags {
        skip_start: true,
        ..Default::default()
    };
    let attempt = orchestrator.run(&flags, &signal).await;

    assert_eq!(
        failed_phase(&attempt.result),
        (Phase::AwaitingCommandResult, "Cancelled".to_string())
    );
    assert_eq!(attempt.exit_code(), 130);
    assert_eq!(attempt.last_completed(), Some(Phase::DispatchingCommand));
    assert_eq!(channel.submit_calls(), 1);
    assert_eq!(channel.status_calls(), 0);
    assert_eq!(channel.cancelled(), vec![attempt.command_id.clone().unwrap()]);
    assert!(leases.holder(INSTANCE).is_none());
}
