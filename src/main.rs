//! Flotilla CLI
//!
//! `flotilla run` drives one batch run end to end against the configured
//! provider backend. Configuration comes from an optional YAML file with
//! per-flag overrides; Ctrl-C cancels the current wait and still tears the
//! run's resources down.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use flotilla::config::RunConfig;
use flotilla::provider::{create_providers, ProviderKind, SystemClock};
use flotilla::run::{Orchestrator, RunReport};
use flotilla::Error;

#[derive(Parser)]
#[command(name = "flotilla", version, about = "Bounded-wait batch orchestration over remote worker pools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stage input, run the task batch, collect output, tear down
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// YAML configuration file; flags below override its values
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Backend: local or azure
    #[arg(long, default_value = "local")]
    provider: String,

    /// Directory holding the local backend's state
    #[arg(long, env = "FLOTILLA_STATE_DIR", default_value = ".flotilla")]
    state_dir: PathBuf,

    /// Pool id; defaults to <user>-pooltest
    #[arg(long, env = "FLOTILLA_POOL_ID")]
    pool_id: Option<String>,

    /// Dedicated node count
    #[arg(long)]
    nodes: Option<u32>,

    /// Number of tasks to submit
    #[arg(long)]
    tasks: Option<u32>,

    /// Local input file staged for every task
    #[arg(long)]
    input: Option<PathBuf>,

    /// Seconds between remote-state polls
    #[arg(long)]
    poll_interval_secs: Option<u64>,

    /// Seconds allowed for all tasks to complete
    #[arg(long)]
    task_timeout_secs: Option<u64>,

    /// Keep the job after the run
    #[arg(long)]
    keep_job: bool,

    /// Keep the pool after the run (warm pool for the next run)
    #[arg(long)]
    keep_pool: bool,

    /// Keep the staging container after the run
    #[arg(long)]
    keep_container: bool,
}

impl RunArgs {
    fn build_config(&self) -> anyhow::Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => RunConfig {
                pool_id: default_pool_id(),
                ..Default::default()
            },
        };

        if let Some(pool_id) = &self.pool_id {
            config.pool_id = pool_id.clone();
        }
        if let Some(nodes) = self.nodes {
            config.target_node_count = nodes;
        }
        if let Some(tasks) = self.tasks {
            config.task_count = tasks;
        }
        if let Some(input) = &self.input {
            config.input_file = input.clone();
        }
        if let Some(secs) = self.poll_interval_secs {
            config.timeouts.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.task_timeout_secs {
            config.timeouts.task_completion = Duration::from_secs(secs);
        }
        config.cleanup.job = !self.keep_job;
        config.cleanup.pool = !self.keep_pool;
        config.cleanup.container = !self.keep_container;

        Ok(config)
    }

    fn provider_kind(&self) -> anyhow::Result<ProviderKind> {
        match self.provider.as_str() {
            "local" => Ok(ProviderKind::Local),
            "azure" => Ok(ProviderKind::Azure),
            other => anyhow::bail!("unknown provider '{}'; expected local or azure", other),
        }
    }
}

/// Namespace the default pool by the invoking user, so shared backends
/// don't collide.
fn default_pool_id() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "flotilla".to_string());
    format!("{}-pooltest", user)
}

fn print_report(report: &RunReport) {
    println!();
    println!("Task Results ({} task(s), job {})", report.results.len(), report.job_id);
    println!("------------------------------------------------------");
    for result in &report.results {
        println!(
            "{} ({}, exit {}):\n{}",
            result.task_id, result.output_name, result.exit_code, result.content
        );
    }
    for warning in &report.warnings {
        println!("warning: {}", warning);
    }
    println!("Finished in {:.1}s", report.elapsed.as_secs_f64());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flotilla=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => {
            let config = args.build_config()?;
            let kind = args.provider_kind()?;
            let providers =
                create_providers(kind, args.state_dir.clone(), Arc::new(SystemClock))?;

            let cancel = CancellationToken::new();
            let cancel_on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, canceling run");
                    cancel_on_signal.cancel();
                }
            });

            let orchestrator = Orchestrator::new(providers, Arc::new(SystemClock), config)?;
            match orchestrator.run(&cancel).await {
                Ok(report) => {
                    print_report(&report);
                    Ok(())
                }
                Err(Error::Provider(e)) => {
                    eprintln!("{}", e.pretty());
                    Err(Error::Provider(e).into())
                }
                Err(e) => Err(e.into()),
            }
        }
    }
}
