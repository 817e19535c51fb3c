//! modeldeploy - Entry Point
//!
//! Deploys a GPU model-serving container onto a leased cloud instance,
//! driving instance start, remote script execution and health validation.

use anyhow::Context as _;
use clap::{CommandFactory, Parser};
use colored::Colorize;
use tracing::{error, info};

use modeldeploy::app::options::Cli;
use modeldeploy::app::run::{execute, install_cancellation, Context};
use modeldeploy::errors::DeployError;
use modeldeploy::logs::init_logging;
use modeldeploy::utils::version_info;

#[tokio::main]
async fn main() {
    let code = match try_main().await {
        Ok(code) => code,
        Err(e) => {
            error!("modeldeploy failed: {:#}", e);
            eprintln!("{} {:#}", "error:".red().bold(), e);
            e.downcast_ref::<DeployError>()
                .map(DeployError::exit_code)
                .unwrap_or(1)
        }
    };
    std::process::exit(code);
}

async fn try_main() -> anyhow::Result<i32> {
    let cli = Cli::parse();

    // Print version and exit
    if cli.version {
        println!("{}", serde_json::to_string_pretty(&version_info())?);
        return Ok(0);
    }

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(2);
    };

    let context = Context::load(&cli.global)
        .await
        .context("unable to read settings")?;

    let _log_guard = match init_logging(context.log_options()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    let version = version_info();
    info!(version = %version.version, git = %version.git_hash, state_dir = %context.layout.base_dir.display(), "modeldeploy starting");

    let cancel = install_cancellation();
    let code = execute(&context, command, cancel).await?;
    Ok(code)
}
