//! Shared fixtures

use std::sync::Arc;

use modeldeploy::deploy::{Backends, Orchestrator};
use modeldeploy::fakes::{FakeChannel, FakeCloud, FakeCompute, FakeParameterStore, FakeProbe};
use modeldeploy::lease::InProcessLeases;
use modeldeploy::models::instance::InstanceState;

pub const PREFIX: &str = "/modeldeploy/";
pub const INSTANCE: &str = "i-0abc123";
pub const REPOSITORY: &str = "123456789012.dkr.ecr.us-east-1.amazonaws.com/vllm-gateway";

/// Parameter store holding a minimal valid deployment
pub fn store() -> FakeParameterStore {
    FakeParameterStore::new()
        .with("/modeldeploy/instance-id", INSTANCE)
        .with("/modeldeploy/region", "us-east-1")
        .with("/modeldeploy/image-repository", REPOSITORY)
        .with("/modeldeploy/hf-token-secret", "secretsmanager:prod/hf-token")
}

/// A wired orchestrator plus handles on every fake behind it
pub struct Harness {
    pub cloud: FakeCloud,
    pub probe: Arc<FakeProbe>,
    pub leases: InProcessLeases,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new(store: FakeParameterStore, compute: FakeCompute, channel: FakeChannel, probe: FakeProbe) -> Self {
        Self::with_leases(store, compute, channel, probe, InProcessLeases::new())
    }

    pub fn with_leases(
        store: FakeParameterStore,
        compute: FakeCompute,
        channel: FakeChannel,
        probe: FakeProbe,
        leases: InProcessLeases,
    ) -> Self {
        let cloud = FakeCloud::new(compute, channel);
        let probe = Arc::new(probe);
        let backends = Backends {
            parameters: Arc::new(store),
            cloud: Arc::new(cloud.clone()),
            probe: probe.clone(),
            leases: Arc::new(leases.clone()),
        };
        Self {
            cloud,
            probe,
            leases,
            orchestrator: Orchestrator::new(backends, PREFIX),
        }
    }

    /// Stopped instance, succeeding command, healthy service
    pub fn happy() -> Self {
        Self::new(
            store(),
            FakeCompute::new(InstanceState::Stopped),
            FakeChannel::new(),
            FakeProbe::new().status(200),
        )
    }
}
