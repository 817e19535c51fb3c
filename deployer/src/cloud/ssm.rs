//! SSM Run Command channel

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::cloud::aws::{str_field, AwsCli};
use crate::cloud::CommandChannel;
use crate::errors::CloudError;
use crate::models::command::{CommandHandle, CommandReport, CommandStatus, RemoteScript, SubmitOptions};

const DOCUMENT_NAME: &str = "AWS-RunShellScript";

/// How long SSM keeps trying to deliver the command to the agent
const DELIVERY_TIMEOUT_SECS: u64 = 600;

/// SSM caps command comments at 100 characters
const MAX_COMMENT_LEN: usize = 100;

/// Command channel backed by SSM Run Command
pub struct SsmChannel {
    cli: AwsCli,
}

impl SsmChannel {
    pub fn new(cli: AwsCli) -> Self {
        Self { cli }
    }
}

/// Build the `send-command` request body
pub fn send_command_input(
    instance_id: &str,
    script: &RemoteScript,
    options: &SubmitOptions,
) -> serde_json::Value {
    let comment: String = options.comment.chars().take(MAX_COMMENT_LEN).collect();
    let mut input = json!({
        "InstanceIds": [instance_id],
        "DocumentName": DOCUMENT_NAME,
        "Comment": comment,
        "TimeoutSeconds": DELIVERY_TIMEOUT_SECS,
        "Parameters": {
            "commands": script.lines,
            "executionTimeout": [options.execution_timeout.as_secs().to_string()],
        },
    });
    if let Some(group) = &options.log_group {
        input["CloudWatchOutputConfig"] = json!({
            "CloudWatchLogGroupName": group,
            "CloudWatchOutputEnabled": true,
        });
    }
    input
}

/// Map an invocation status onto the command lifecycle
pub fn map_status(status: &str) -> CommandStatus {
    match status {
        "Success" => CommandStatus::Success,
        "Failed" | "Cancelled" | "Cancelling" => CommandStatus::Failed,
        "TimedOut" | "DeliveryTimedOut" => CommandStatus::TimedOut,
        "InProgress" => CommandStatus::InProgress,
        _ => CommandStatus::Pending,
    }
}

/// Extract a report from `get-command-invocation` output
pub fn parse_invocation(output: &serde_json::Value) -> CommandReport {
    let status = str_field(output, "Status").map(map_status);
    let exit_code = output
        .get("ResponseCode")
        .and_then(|c| c.as_i64())
        .and_then(|c| i32::try_from(c).ok())
        .filter(|_| status.is_some_and(|s| s.is_terminal()));

    CommandReport {
        status,
        stdout: str_field(output, "StandardOutputContent").unwrap_or_default().to_string(),
        stderr: str_field(output, "StandardErrorContent").unwrap_or_default().to_string(),
        exit_code,
    }
}

#[async_trait]
impl CommandChannel for SsmChannel {
    async fn submit(
        &self,
        instance_id: &str,
        script: &RemoteScript,
        options: &SubmitOptions,
    ) -> Result<CommandHandle, CloudError> {
        let input = send_command_input(instance_id, script, options);
        let output = self
            .cli
            .call("ssm", "send-command", &["--cli-input-json".to_string(), input.to_string()])
            .await?;

        let command_id = output
            .get("Command")
            .and_then(|c| str_field(c, "CommandId"))
            .ok_or_else(|| CloudError::Transient("send-command returned no command id".to_string()))?;

        Ok(CommandHandle {
            command_id: command_id.to_string(),
            instance_id: instance_id.to_string(),
            submitted_at: Utc::now(),
        })
    }

    async fn get_status(&self, handle: &CommandHandle) -> Result<CommandReport, CloudError> {
        let output = self
            .cli
            .call(
                "ssm",
                "get-command-invocation",
                &[
                    "--command-id".to_string(),
                    handle.command_id.clone(),
                    "--instance-id".to_string(),
                    handle.instance_id.clone(),
                ],
            )
            .await?;
        Ok(parse_invocation(&output))
    }

    async fn cancel(&self, handle: &CommandHandle) -> Result<(), CloudError> {
        self.cli
            .call(
                "ssm",
                "cancel-command",
                &[
                    "--command-id".to_string(),
                    handle.command_id.clone(),
                    "--instance-ids".to_string(),
                    handle.instance_id.clone(),
                ],
            )
            .await?;
        Ok(())
    }
}
