//! Command-line options

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::logs::LogLevel;
use crate::models::attempt::RunFlags;

#[derive(Debug, Parser)]
#[command(
    name = "modeldeploy",
    about = "Deploy a GPU model-serving container onto a leased cloud instance",
    disable_version_flag = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    /// Print build information and exit
    #[arg(long)]
    pub version: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Options shared by every subcommand; they override `settings.json`
#[derive(Debug, Clone, Default, Args)]
pub struct GlobalOptions {
    /// State directory (defaults to $MODELDEPLOY_HOME or ~/.modeldeploy)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Parameter store path prefix
    #[arg(long, global = true)]
    pub prefix: Option<String>,

    /// AWS named profile
    #[arg(long, global = true)]
    pub profile: Option<String>,

    /// AWS region of the parameter store
    #[arg(long, global = true)]
    pub aws_region: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<LogLevel>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Deploy (or restart) the model server
    Deploy(DeployArgs),

    /// Show the instance state and the last attempt
    Status,

    /// Stop the instance
    Stop {
        /// Wait until the instance reports stopped
        #[arg(long)]
        wait: bool,
    },
}

#[derive(Debug, Clone, Default, Args)]
pub struct DeployArgs {
    /// Assume the instance is already running
    #[arg(long)]
    pub skip_start: bool,

    /// Do not wait for the health endpoint
    #[arg(long)]
    pub skip_validation: bool,

    /// Restart the existing container instead of pulling and recreating it
    #[arg(long)]
    pub quick_restart: bool,

    /// Image tag to deploy instead of the configured one
    #[arg(long, value_parser = parse_tag)]
    pub image_tag: Option<String>,

    /// Print the attempt record as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

impl DeployArgs {
    pub fn flags(&self) -> RunFlags {
        RunFlags {
            skip_start: self.skip_start,
            skip_validation: self.skip_validation,
            quick_restart: self.quick_restart,
            image_tag: self.image_tag.clone(),
        }
    }
}

/// Docker tag grammar: up to 128 of `[A-Za-z0-9_.-]`, not starting with `.` or `-`
fn parse_tag(raw: &str) -> Result<String, String> {
    let valid = !raw.is_empty()
        && raw.len() <= 128
        && !raw.starts_with(['.', '-'])
        && raw.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(raw.to_string())
    } else {
        Err(format!("'{}' is not a valid image tag", raw))
    }
}
