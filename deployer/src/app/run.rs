//! Subcommand execution

use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use tracing::{info, warn};

use crate::app::options::{Command, DeployArgs, GlobalOptions};
use crate::cloud::aws::{AwsCli, AwsCliOptions};
use crate::cloud::parameters::SsmParameterStore;
use crate::cloud::{AwsConnector, CloudConnector};
use crate::deploy::cancel::{cancel_pair, CancelHandle, CancelSignal};
use crate::deploy::{Backends, Orchestrator};
use crate::errors::DeployError;
use crate::health::HttpProbe;
use crate::instance::{InstanceController, StartPolicy};
use crate::lease::{FileLeases, LeaseRegistry};
use crate::logs::LogOptions;
use crate::models::attempt::{AttemptResult, DeploymentAttempt};
use crate::models::config::{InstanceTarget, INSTANCE_KEYS};
use crate::params::ParameterResolver;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// Settings merged with command-line overrides
#[derive(Debug, Clone)]
pub struct Context {
    pub layout: StorageLayout,
    pub settings: Settings,
}

impl Context {
    /// Load `settings.json` from the state directory and apply CLI overrides
    pub async fn load(global: &GlobalOptions) -> Result<Self, DeployError> {
        let layout = global
            .state_dir
            .clone()
            .map(StorageLayout::new)
            .unwrap_or_default();
        let mut settings = Settings::load(&layout.settings_file()).await?;

        if let Some(prefix) = &global.prefix {
            settings.parameter_prefix = prefix.clone();
        }
        if let Some(profile) = &global.profile {
            settings.aws.profile = Some(profile.clone());
        }
        if let Some(region) = &global.aws_region {
            settings.aws.region = Some(region.clone());
        }
        if let Some(level) = global.log_level {
            settings.log_level = level;
        }
        if global.log_json {
            settings.log_json = true;
        }

        Ok(Self { layout, settings })
    }

    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            log_level: self.settings.log_level,
            stderr: true,
            log_dir: self
                .settings
                .log_to_file
                .then(|| self.layout.logs_dir().path().to_path_buf()),
            json_format: self.settings.log_json,
        }
    }

    fn aws_cli(&self) -> AwsCli {
        AwsCli::new(
            AwsCliOptions {
                program: self.settings.aws.cli_path.clone(),
                profile: self.settings.aws.profile.clone(),
                call_timeout: Duration::from_secs(self.settings.aws.cli_timeout_secs),
            },
            self.settings.aws.region.clone(),
        )
    }

    fn resolver(&self) -> ParameterResolver {
        ParameterResolver::new(
            Arc::new(SsmParameterStore::new(self.aws_cli())),
            &self.settings.parameter_prefix,
        )
        .with_timeout(Duration::from_secs(self.settings.resolve_timeout_secs))
    }
}

/// Run a subcommand to completion, returning the process exit code
pub async fn execute(context: &Context, command: Command, cancel: CancelSignal) -> Result<i32, DeployError> {
    context.layout.setup().await?;
    match command {
        Command::Deploy(args) => deploy(context, &args, &cancel).await,
        Command::Status => status(context).await,
        Command::Stop { wait } => stop(context, wait, &cancel).await,
    }
}

async fn deploy(context: &Context, args: &DeployArgs, cancel: &CancelSignal) -> Result<i32, DeployError> {
    let cli = context.aws_cli();
    let backends = Backends {
        parameters: Arc::new(SsmParameterStore::new(cli.clone())),
        cloud: Arc::new(AwsConnector::new(cli)),
        probe: Arc::new(HttpProbe::new(Duration::from_secs(context.settings.probe_timeout_secs))?),
        leases: Arc::new(FileLeases::new(context.layout.leases_dir())),
    };
    let orchestrator = Orchestrator::new(backends, &context.settings.parameter_prefix)
        .with_resolve_timeout(Duration::from_secs(context.settings.resolve_timeout_secs));

    let attempt = orchestrator.run(&args.flags(), cancel).await;
    if let Err(e) = save_attempt(&context.layout, &attempt).await {
        warn!(attempt = %attempt.id, error = %e, "failed to write attempt record");
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&attempt)?);
    }
    print_summary(&attempt);
    Ok(attempt.exit_code())
}

async fn status(context: &Context) -> Result<i32, DeployError> {
    let params = context.resolver().resolve(INSTANCE_KEYS).await?;
    let target = InstanceTarget::from_parameters(&params)?;
    let compute = AwsConnector::new(context.aws_cli()).compute(&target.region);
    let described = InstanceController::new(compute, StartPolicy::from(&target))
        .describe(&target.instance_id)
        .await?;

    println!(
        "instance {} is {} (address: {})",
        described.instance_id.bold(),
        described.state.to_string().cyan(),
        described.address.as_deref().unwrap_or("none")
    );

    let last = context.layout.last_attempt_file();
    if last.exists().await {
        let attempt: DeploymentAttempt = last.read_json().await?;
        print_summary(&attempt);
    } else {
        println!("no deployment attempt recorded");
    }
    Ok(0)
}

async fn stop(context: &Context, wait: bool, cancel: &CancelSignal) -> Result<i32, DeployError> {
    let params = context.resolver().resolve(INSTANCE_KEYS).await?;
    let target = InstanceTarget::from_parameters(&params)?;

    let leases = FileLeases::new(context.layout.leases_dir());
    let lease = leases
        .acquire(&target.instance_id, target.start_timeout + Duration::from_secs(60))
        .await?;

    let compute = AwsConnector::new(context.aws_cli()).compute(&target.region);
    let result = InstanceController::new(compute, StartPolicy::from(&target))
        .stop(&target.instance_id, wait, cancel)
        .await;

    if let Err(e) = leases.release(&lease).await {
        warn!(instance = %target.instance_id, error = %e, "failed to release lease");
    }

    let described = result?;
    println!(
        "{} instance {} is {}",
        "stop requested:".yellow(),
        described.instance_id.bold(),
        described.state.to_string().cyan()
    );
    Ok(0)
}

/// Write the attempt to `attempts/<id>.json` and `attempts/last.json`
pub async fn save_attempt(layout: &StorageLayout, attempt: &DeploymentAttempt) -> Result<(), DeployError> {
    let dir = layout.attempts_dir();
    dir.file(&format!("{}.json", attempt.id)).write_json(attempt).await?;
    layout.last_attempt_file().write_json(attempt).await?;
    info!(attempt = %attempt.id, path = %dir.path().display(), "attempt recorded");
    Ok(())
}

/// One-line outcome on stdout; failures go to stderr with the excerpt
fn print_summary(attempt: &DeploymentAttempt) {
    let target = format!(
        "{} @ {}",
        attempt.instance_id.as_deref().unwrap_or("?"),
        attempt.image_tag.as_deref().unwrap_or("?")
    );

    match &attempt.result {
        Some(AttemptResult::Done { validation }) => {
            println!(
                "{} attempt {} deployed {} ({:?})",
                "DONE".green().bold(),
                attempt.id,
                target,
                validation
            );
        }
        Some(AttemptResult::Failed {
            phase,
            cause,
            excerpt,
            last_completed,
            ..
        }) => {
            eprintln!(
                "{} attempt {} ({}) failed in {}: {}",
                "FAILED".red().bold(),
                attempt.id,
                target,
                phase.to_string().red(),
                cause
            );
            if let Some(excerpt) = excerpt {
                for line in excerpt.lines() {
                    eprintln!("  | {}", line);
                }
            }
            if let Some(last) = last_completed {
                eprintln!("  last completed phase: {}", last);
            }
        }
        None => println!("{} attempt {} did not finish", "UNKNOWN".yellow(), attempt.id),
    }
}

/// Cancel the run on SIGINT/SIGTERM; a second signal is left to the default handler
pub fn spawn_signal_listener(handle: CancelHandle) {
    tokio::spawn(async move {
        await_shutdown_signal().await;
        warn!("interrupt received, stopping at the next checkpoint");
        handle.cancel();
    });
}

/// Create the cancellation pair and hook it to process signals
pub fn install_cancellation() -> CancelSignal {
    let (handle, signal) = cancel_pair();
    spawn_signal_listener(handle);
    signal
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("SIGTERM received"),
                    _ = tokio::signal::ctrl_c() => info!("Ctrl+C received"),
                }
            }
            Err(e) => {
                warn!(error = %e, "unable to listen for SIGTERM");
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Ctrl+C received");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received");
        } else {
            std::future::pending::<()>().await;
        }
    }
}
