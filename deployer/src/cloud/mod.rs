//! Cloud capabilities the deployment phases depend on
//!
//! Each capability is a trait so the in-memory backends in `fakes`
//! can stand in for the AWS CLI backends in tests.

pub mod aws;
pub mod ec2;
pub mod parameters;
pub mod ssm;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::CloudError;
use crate::models::command::{CommandHandle, CommandReport, RemoteScript, SubmitOptions};
use crate::models::instance::InstanceDescription;

/// Start / describe / stop of a leased compute instance
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    async fn start(&self, instance_id: &str) -> Result<(), CloudError>;

    async fn describe(&self, instance_id: &str) -> Result<InstanceDescription, CloudError>;

    async fn stop(&self, instance_id: &str) -> Result<(), CloudError>;
}

/// Out-of-band command execution channel
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Submit a script; returns once the channel acknowledged it
    async fn submit(
        &self,
        instance_id: &str,
        script: &RemoteScript,
        options: &SubmitOptions,
    ) -> Result<CommandHandle, CloudError>;

    async fn get_status(&self, handle: &CommandHandle) -> Result<CommandReport, CloudError>;

    async fn cancel(&self, handle: &CommandHandle) -> Result<(), CloudError>;
}

/// Hierarchical key/value configuration store
#[async_trait]
pub trait ParameterStore: Send + Sync {
    /// Fetch the named parameters; absent names are simply missing from the result
    async fn get_parameters(&self, names: &[String]) -> Result<HashMap<String, String>, CloudError>;
}

/// Hands out region-scoped compute and channel backends
pub trait CloudConnector: Send + Sync {
    fn compute(&self, region: &str) -> Arc<dyn ComputeBackend>;

    fn channel(&self, region: &str) -> Arc<dyn CommandChannel>;
}

/// Connector handing out AWS CLI backends
#[derive(Debug, Clone)]
pub struct AwsConnector {
    cli: aws::AwsCli,
}

impl AwsConnector {
    pub fn new(cli: aws::AwsCli) -> Self {
        Self { cli }
    }
}

impl CloudConnector for AwsConnector {
    fn compute(&self, region: &str) -> Arc<dyn ComputeBackend> {
        Arc::new(ec2::Ec2Compute::new(self.cli.with_region(region)))
    }

    fn channel(&self, region: &str) -> Arc<dyn CommandChannel> {
        Arc::new(ssm::SsmChannel::new(self.cli.with_region(region)))
    }
}
