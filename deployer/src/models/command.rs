//! Remote command models

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a command submitted through the command channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    TimedOut,
}

impl CommandStatus {
    /// Whether the command will not change status anymore
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Success | CommandStatus::Failed | CommandStatus::TimedOut
        )
    }
}

/// A script serialized for the command channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteScript {
    /// Shell lines, executed in order
    pub lines: Vec<String>,
}

impl RemoteScript {
    /// Full script body
    pub fn body(&self) -> String {
        let mut body = self.lines.join("\n");
        body.push('\n');
        body
    }

    /// Hex digest of the script body, safe to log
    pub fn digest(&self) -> String {
        crate::utils::sha256_hash(self.body().as_bytes())
    }
}

/// Channel-side settings for one submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Free-form comment attached to the command, e.g. the attempt id
    pub comment: String,

    /// How long the remote agent lets the script run
    pub execution_timeout: Duration,

    /// Log group receiving the full command output
    pub log_group: Option<String>,
}

/// Acknowledgement of a submitted command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandHandle {
    /// Channel-assigned command id
    pub command_id: String,

    /// Instance the command targets
    pub instance_id: String,

    /// When the channel acknowledged the submission
    pub submitted_at: DateTime<Utc>,
}

/// One status observation returned by the channel
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandReport {
    pub status: Option<CommandStatus>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// A command and everything observed about it so far
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCommand {
    pub command_id: String,
    pub instance_id: String,
    pub script: RemoteScript,
    pub submitted_at: DateTime<Utc>,
    pub status: CommandStatus,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub exit_code: Option<i32>,
}

impl RemoteCommand {
    /// Start tracking a freshly submitted command
    pub fn submitted(handle: &CommandHandle, script: RemoteScript) -> Self {
        Self {
            command_id: handle.command_id.clone(),
            instance_id: handle.instance_id.clone(),
            script,
            submitted_at: handle.submitted_at,
            status: CommandStatus::Pending,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            exit_code: None,
        }
    }

    /// Fold a channel report into the command, keeping only bounded output tails
    pub fn observe(&mut self, report: CommandReport) {
        if let Some(status) = report.status {
            self.status = status;
        }
        if !report.stdout.is_empty() {
            self.stdout_tail = crate::utils::tail_excerpt(&report.stdout);
        }
        if !report.stderr.is_empty() {
            self.stderr_tail = crate::utils::tail_excerpt(&report.stderr);
        }
        if report.exit_code.is_some() {
            self.exit_code = report.exit_code;
        }
    }

    /// Combined output tail, stderr last since it usually holds the cause
    pub fn output_tail(&self) -> String {
        match (self.stdout_tail.is_empty(), self.stderr_tail.is_empty()) {
            (true, true) => String::new(),
            (false, true) => self.stdout_tail.clone(),
            (true, false) => self.stderr_tail.clone(),
            (false, false) => crate::utils::tail_excerpt(&format!(
                "{}\n--- stderr ---\n{}",
                self.stdout_tail, self.stderr_tail
            )),
        }
    }
}
