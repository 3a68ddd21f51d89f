//! prismflow CLI
//!
//! Watches an image container and runs the analysis pipeline, or inspects
//! the committed results.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing_appender::non_blocking::WorkerGuard;

use prismflow_core::core::results::{ResultFilter, SummaryStatus};
use prismflow_core::core::settings::SettingsManager;
use prismflow_core::{
    scan_existing, ContainerWatcher, ImageFilter, ImageRef, Orchestrator, PipelineSettings,
    QueryService, StartOutcome,
};

/// Capacity of the channel between event sources and the orchestrator
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Parser)]
#[command(name = "prismflow", version, about = "Durable image analysis pipeline")]
struct Cli {
    /// Settings file (defaults to prismflow.json in the data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Recover, backfill existing images, then watch for uploads
    Run,
    /// Analyze a single image, e.g. `images/test.jpg`
    Submit {
        location: String,
    },
    /// Resume orchestrations interrupted by a crash
    Recover,
    /// List committed results, or show one by id
    Results(ResultsArgs),
    /// Delete finished orchestration state
    Purge {
        /// Retention in days (defaults to the configured value)
        #[arg(long)]
        days: Option<u32>,
    },
}

#[derive(Debug, Args)]
struct ResultsArgs {
    /// Show a single result in full
    id: Option<String>,

    /// Number of results to list
    #[arg(long, short = 'n')]
    limit: Option<usize>,

    /// Case-insensitive file name substring
    #[arg(long)]
    name: Option<String>,

    /// Only results with this status
    #[arg(long, value_enum)]
    status: Option<StatusArg>,

    /// Only results analysed at or after this RFC 3339 time
    #[arg(long)]
    after: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Complete,
    Partial,
    Failed,
}

impl From<StatusArg> for SummaryStatus {
    fn from(status: StatusArg) -> Self {
        match status {
            StatusArg::Complete => SummaryStatus::Complete,
            StatusArg::Partial => SummaryStatus::Partial,
            StatusArg::Failed => SummaryStatus::Failed,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_deref())?;
    let _log_guard = init_logging(&cli.log_level, settings.log_dir.as_deref())?;

    match cli.command {
        Commands::Run => run(settings).await,
        Commands::Submit { location } => submit(settings, &location).await,
        Commands::Recover => recover(settings).await,
        Commands::Results(args) => results(settings, args),
        Commands::Purge { days } => purge(settings, days),
    }
}

/// Settings file from `--config`, else `prismflow.json` in the data
/// directory (after `PRISMFLOW_DATA_DIR` is applied)
fn settings_manager(config: Option<&Path>) -> SettingsManager {
    match config {
        Some(path) => SettingsManager::new(path.to_path_buf()),
        None => {
            let mut defaults = PipelineSettings::default();
            defaults.apply_env_overrides();
            SettingsManager::in_dir(&defaults.data_dir)
        }
    }
}

fn load_settings(config: Option<&Path>) -> Result<PipelineSettings> {
    let manager = settings_manager(config);
    manager.load().with_context(|| {
        format!(
            "Failed to load settings from {}",
            manager.settings_path().display()
        )
    })
}

/// Installs the stdout layer and, when `log_dir` is set, a daily rolling file
fn init_logging(level: &str, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level '{}'", level))?;

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(false);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "prismflow.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

fn open_orchestrator(settings: &PipelineSettings) -> Result<Orchestrator> {
    Orchestrator::open(settings).with_context(|| {
        format!(
            "Failed to open stores in {}",
            settings.data_dir.display()
        )
    })
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(settings: PipelineSettings) -> Result<()> {
    let orchestrator = Arc::new(open_orchestrator(&settings)?);

    let report = orchestrator
        .recover()
        .await
        .context("Failed to scan for interrupted orchestrations")?;
    if !report.is_clean() {
        tracing::warn!(failed = report.failed.len(), "Some orchestrations could not be resumed");
    }

    let filter = ImageFilter::new().context("Failed to build image filter")?;
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let mut watcher = ContainerWatcher::start(&settings.container_root, filter.clone(), tx.clone())
        .with_context(|| {
            format!(
                "Failed to watch container root {}",
                settings.container_root.display()
            )
        })?;

    let processor = tokio::spawn(orchestrator.clone().process_events(rx));

    // Records held by a process that died shortly before this one started are
    // picked up once their lease lapses.
    let (stop_recovery, recovery_stopped) = oneshot::channel::<()>();
    let recovery = {
        let orchestrator = orchestrator.clone();
        let period = orchestrator.config().recovery_interval();
        tokio::spawn(async move {
            orchestrator
                .recover_until(period, async {
                    let _ = recovery_stopped.await;
                })
                .await
        })
    };

    let backlog = scan_existing(&settings.container_root, &filter)
        .context("Failed to scan container root")?;
    tracing::info!(count = backlog.len(), "Submitting existing images");
    for image in backlog {
        if tx.send(image).await.is_err() {
            break;
        }
    }
    drop(tx);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down, waiting for running orchestrations");
    watcher.stop();
    let _ = stop_recovery.send(());

    let finished = processor.await.context("Event processor aborted")?;
    let resumed = recovery.await.context("Recovery loop aborted")?;
    tracing::info!(finished, resumed, "Pipeline stopped");
    Ok(())
}

async fn submit(settings: PipelineSettings, location: &str) -> Result<()> {
    let orchestrator = open_orchestrator(&settings)?;
    let image = ImageRef::new(location);

    let outcome = orchestrator
        .start_orchestration(image)
        .await
        .with_context(|| format!("Failed to analyze {}", location))?;

    match outcome {
        StartOutcome::Finished(record) => {
            let summary = QueryService::new(orchestrator.result_store())
                .get(record.image.id())
                .ok();
            print_json(&json!({
                "outcome": "finished",
                "orchestration": record,
                "result": summary,
            }))
        }
        StartOutcome::AlreadyStarted(id) => print_json(&json!({
            "outcome": "alreadyStarted",
            "id": id,
        })),
        StartOutcome::AlreadyCommitted(summary) => print_json(&json!({
            "outcome": "alreadyCommitted",
            "result": summary,
        })),
    }
}

async fn recover(settings: PipelineSettings) -> Result<()> {
    let orchestrator = open_orchestrator(&settings)?;
    let report = orchestrator
        .recover()
        .await
        .context("Failed to scan for interrupted orchestrations")?;
    print_json(&report)
}

fn results(settings: PipelineSettings, args: ResultsArgs) -> Result<()> {
    let orchestrator = open_orchestrator(&settings)?;
    let query = QueryService::new(orchestrator.result_store());

    if let Some(id) = args.id {
        let summary = query
            .get(&id)
            .with_context(|| format!("No result for {}", id))?;
        return print_json(&summary);
    }

    let mut filter = ResultFilter::newest_first();
    if let Some(name) = args.name {
        filter = filter.with_file_name(name);
    }
    if let Some(status) = args.status {
        filter = filter.with_status(status.into());
    }
    if let Some(after) = args.after {
        filter = filter.with_analyzed_after(after);
    }

    let listing = query
        .list(args.limit, Some(filter))
        .context("Failed to list results")?;
    print_json(&listing)
}

fn purge(settings: PipelineSettings, days: Option<u32>) -> Result<()> {
    let retention = match days {
        Some(days) => chrono::Duration::days(i64::from(days)),
        None => settings.retention(),
    };
    let orchestrator = open_orchestrator(&settings)?;
    let purged = orchestrator
        .purge_finished(retention)
        .context("Failed to purge finished orchestrations")?;
    print_json(&json!({ "purged": purged }))
}
