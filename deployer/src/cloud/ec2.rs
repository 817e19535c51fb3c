//! EC2 compute backend

use async_trait::async_trait;

use crate::cloud::aws::{str_field, AwsCli};
use crate::cloud::ComputeBackend;
use crate::errors::CloudError;
use crate::models::instance::{InstanceDescription, InstanceState};

/// Compute backend driving EC2 through the AWS CLI
pub struct Ec2Compute {
    cli: AwsCli,
}

impl Ec2Compute {
    pub fn new(cli: AwsCli) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl ComputeBackend for Ec2Compute {
    async fn start(&self, instance_id: &str) -> Result<(), CloudError> {
        self.cli
            .call("ec2", "start-instances", &["--instance-ids".to_string(), instance_id.to_string()])
            .await?;
        Ok(())
    }

    async fn describe(&self, instance_id: &str) -> Result<InstanceDescription, CloudError> {
        let output = self
            .cli
            .call(
                "ec2",
                "describe-instances",
                &["--instance-ids".to_string(), instance_id.to_string()],
            )
            .await?;
        parse_describe(instance_id, &output)
    }

    async fn stop(&self, instance_id: &str) -> Result<(), CloudError> {
        self.cli
            .call("ec2", "stop-instances", &["--instance-ids".to_string(), instance_id.to_string()])
            .await?;
        Ok(())
    }
}

/// Extract state and address from `describe-instances` output
pub fn parse_describe(
    instance_id: &str,
    output: &serde_json::Value,
) -> Result<InstanceDescription, CloudError> {
    let instance = output
        .get("Reservations")
        .and_then(|r| r.as_array())
        .into_iter()
        .flatten()
        .filter_map(|r| r.get("Instances").and_then(|i| i.as_array()))
        .flatten()
        .find(|i| str_field(i, "InstanceId") == Some(instance_id))
        .ok_or_else(|| {
            // Freshly changed instances can briefly vanish from describe results.
            CloudError::Transient(format!("instance {} missing from describe output", instance_id))
        })?;

    let state = instance
        .get("State")
        .and_then(|s| str_field(s, "Name"))
        .map(InstanceState::from_provider)
        .unwrap_or(InstanceState::Unknown);

    let address = str_field(instance, "PublicIpAddress")
        .or_else(|| str_field(instance, "PrivateIpAddress"))
        .map(str::to_string);

    Ok(InstanceDescription::new(instance_id, state, address))
}
