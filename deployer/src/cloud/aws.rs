//! AWS CLI process wrapper shared by the EC2 and SSM backends

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::CloudError;

/// Error codes meaning the SSM agent on the target has not registered yet
const NOT_READY_MARKERS: &[&str] = &["InvalidInstanceId"];

/// Error codes and transport failures worth retrying
const TRANSIENT_MARKERS: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequests",
    "InternalError",
    "InternalServerError",
    "ServiceUnavailable",
    "InvocationDoesNotExist",
    "Could not connect to the endpoint URL",
    "Connection was closed",
    "Read timeout on endpoint URL",
    "Connect timeout on endpoint URL",
];

/// How to invoke the AWS CLI
#[derive(Debug, Clone)]
pub struct AwsCliOptions {
    /// CLI executable
    pub program: String,

    /// Named profile
    pub profile: Option<String>,

    /// Upper bound for a single CLI invocation
    pub call_timeout: Duration,
}

impl Default for AwsCliOptions {
    fn default() -> Self {
        Self {
            program: "aws".to_string(),
            profile: None,
            call_timeout: Duration::from_secs(60),
        }
    }
}

/// A region-scoped AWS CLI invoker
#[derive(Debug, Clone)]
pub struct AwsCli {
    options: AwsCliOptions,
    region: Option<String>,
}

impl AwsCli {
    pub fn new(options: AwsCliOptions, region: Option<String>) -> Self {
        Self { options, region }
    }

    /// Same CLI settings, different region
    pub fn with_region(&self, region: &str) -> Self {
        Self {
            options: self.options.clone(),
            region: Some(region.to_string()),
        }
    }

    /// Run `aws <service> <operation> <args..> --output json` and parse stdout
    pub async fn call(
        &self,
        service: &str,
        operation: &str,
        args: &[String],
    ) -> Result<serde_json::Value, CloudError> {
        let mut command = Command::new(&self.options.program);
        command
            .arg(service)
            .arg(operation)
            .args(args)
            .args(["--output", "json"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(region) = &self.region {
            command.args(["--region", region]);
        }
        if let Some(profile) = &self.options.profile {
            command.args(["--profile", profile]);
        }

        debug!(service, operation, "aws cli call");
        let output = match tokio::time::timeout(self.options.call_timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CloudError::Rejected(format!(
                    "aws cli '{}' not found",
                    self.options.program
                )));
            }
            Ok(Err(e)) => {
                return Err(CloudError::Transient(format!(
                    "failed to run aws {} {}: {}",
                    service, operation, e
                )));
            }
            Err(_) => {
                warn!(service, operation, timeout = ?self.options.call_timeout, "aws cli call timed out");
                return Err(CloudError::Transient(format!(
                    "aws {} {} timed out after {:?}",
                    service, operation, self.options.call_timeout
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(stderr.trim()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&stdout).map_err(|e| {
            CloudError::Rejected(format!(
                "unparseable output from aws {} {}: {}",
                service, operation, e
            ))
        })
    }
}

/// Map CLI stderr onto the cloud error classes
pub fn classify_failure(stderr: &str) -> CloudError {
    let message = if stderr.is_empty() {
        "aws cli exited with an error".to_string()
    } else {
        stderr.to_string()
    };

    // EC2 reports unknown instances as InvalidInstanceID.NotFound, which is fatal.
    if stderr.contains("InvalidInstanceID.") {
        return CloudError::Rejected(message);
    }
    if NOT_READY_MARKERS.iter().any(|m| stderr.contains(m)) {
        return CloudError::TargetNotReady(message);
    }
    if TRANSIENT_MARKERS.iter().any(|m| stderr.contains(m)) {
        return CloudError::Transient(message);
    }
    CloudError::Rejected(message)
}

/// Read a string field out of a JSON object
pub(crate) fn str_field<'a>(value: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(|v| v.as_str())
}
