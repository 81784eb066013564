//! recode-batch binary
//!
//! Wires the components together: config, knowledge database, monitor,
//! concurrency controller, tuner, external tools, and the coordinator.
//! Ctrl-C cancels the shared token; in-flight tasks finish or abort and the
//! session stays resumable.

use anyhow::Context;
use clap::Parser;
use recode_batch::checkpoint::CheckpointStore;
use recode_batch::concurrency::ConcurrencyController;
use recode_batch::knowledge::{KnowledgeStore, PredictionTuner};
use recode_batch::monitor::ResourceMonitor;
use recode_batch::pipeline::Coordinator;
use recode_batch::tools::{
    binary_available, CommandConverter, CompareValidator, ProbeCharacterizer,
};
use recode_batch::types::QualityGoal;
use recode_common::config::{resolve_data_dir, BatchConfig};
use recode_common::db::init_database;
use recode_common::events::{BatchEvent, EventBus};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "recode-batch", version, about = "Learning batch media converter")]
struct Cli {
    /// Directory to scan for convertible media
    target_dir: PathBuf,

    /// Output directory (default: <target>/converted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Data directory holding the knowledge database
    #[arg(long, env = "RECODE_DATA_DIR")]
    data_dir: Option<String>,

    /// Config file path (default: platform config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Quality goal: lossless, balanced, or max_saving
    #[arg(long, default_value = "balanced")]
    quality: QualityGoal,

    /// Override the maximum worker count
    #[arg(long)]
    max_workers: Option<usize>,

    /// Print knowledge statistics and exit without converting
    #[arg(long)]
    stats: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = BatchConfig::load(cli.config.as_ref()).context("loading configuration")?;
    if let Some(max) = cli.max_workers {
        config.max_concurrency = max;
        config.validate().context("validating configuration")?;
    }

    let data_dir = resolve_data_dir(cli.data_dir.as_deref());
    let db_path = data_dir.join("knowledge.db");
    // no ledger, no learning loop: an unusable database is fatal
    let pool = init_database(&db_path)
        .await
        .with_context(|| format!("opening knowledge database at {}", db_path.display()))?;

    let store = KnowledgeStore::new(pool.clone());

    if cli.stats {
        let summary = store.stats_summary().await?;
        println!(
            "{} conversions recorded, avg saving {:.1}%, pass rate {:.1}%, avg prediction error {:.1}%",
            summary.total_conversions,
            summary.avg_saving_percent,
            summary.quality_pass_rate,
            summary.avg_prediction_error
        );
        return Ok(());
    }

    let output_dir = cli
        .output
        .clone()
        .unwrap_or_else(|| cli.target_dir.join("converted"));

    let events = EventBus::new(256);
    let token = CancellationToken::new();

    let monitor = ResourceMonitor::new(
        Duration::from_secs(config.memory_sample_secs),
        config.memory_warning_threshold,
        config.memory_critical_threshold,
        events.clone(),
    );
    let controller = Arc::new(ConcurrencyController::new(
        config.min_concurrency,
        config.max_concurrency,
        config.memory_threshold,
        Duration::from_secs(config.adjust_interval_secs),
        (
            config.rule_memory_usage,
            config.rule_error_rate,
            config.rule_throughput,
        ),
        monitor.clone(),
        events.clone(),
    ));
    controller.attach_to_monitor(&monitor);

    let monitor_handle = monitor.spawn(token.clone());
    let controller_handle = controller.clone().spawn(token.clone());

    let tuner = Arc::new(PredictionTuner::new(
        store.clone(),
        config.tuning_cache_ttl(),
    ));
    let checkpoints = CheckpointStore::new(pool.clone());

    // a missing required tool fails the whole batch up front, not per file
    for bin in [&config.probe_bin, &config.converter_bin, &config.validator_bin] {
        if !binary_available(bin).await {
            anyhow::bail!("required tool not found: {}", bin);
        }
    }
    if !binary_available(&config.avif_bin).await {
        warn!(bin = %config.avif_bin, "AVIF encoder not found; AVIF targets will fail");
    }

    let task_timeout = config.task_timeout();
    let characterizer = Arc::new(ProbeCharacterizer::new(config.probe_bin.as_str(), task_timeout));
    let converter = Arc::new(CommandConverter::new(
        config.converter_bin.as_str(),
        config.avif_bin.as_str(),
        task_timeout,
    ));
    let validator = Arc::new(CompareValidator::new(config.validator_bin.as_str(), task_timeout));

    // render bus events as log lines for the operator
    let mut event_rx = events.subscribe();
    let event_log = tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            match event {
                BatchEvent::BatchStarted { total_files, .. } => {
                    info!(total_files, "batch started");
                }
                BatchEvent::TaskFinished {
                    file_path,
                    status,
                    saving_bytes,
                    retries,
                    ..
                } => {
                    info!(%file_path, %status, saving_bytes, retries, "task finished");
                }
                BatchEvent::ConcurrencyAdjusted {
                    reason,
                    old_workers,
                    new_workers,
                    ..
                } => {
                    info!(%reason, old_workers, new_workers, "workers resized");
                }
                BatchEvent::MemoryPressure { usage, critical, .. } => {
                    warn!(usage, critical, "memory pressure");
                }
                BatchEvent::BatchCompleted {
                    completed, failed, skipped, ..
                } => {
                    info!(completed, failed, skipped, "batch completed");
                }
            }
        }
    });

    let coordinator = Arc::new(Coordinator::new(
        config,
        cli.quality,
        cli.target_dir.clone(),
        output_dir,
        store.clone(),
        tuner,
        checkpoints,
        controller,
        characterizer,
        converter,
        validator,
        events.clone(),
    ));

    let cancel_on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight tasks");
            cancel_on_signal.cancel();
        }
    });

    let result = coordinator.run(token.clone()).await;
    token.cancel();
    let _ = monitor_handle.await;
    let _ = controller_handle.await;
    event_log.abort();

    match result {
        Ok(report) => {
            let summary = store.stats_summary().await.ok();
            print!("{}", report.render(summary.as_ref()));
            if report.failures.is_empty() {
                Ok(())
            } else {
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!(error = %e, "batch run failed");
            Err(e.into())
        }
    }
}
