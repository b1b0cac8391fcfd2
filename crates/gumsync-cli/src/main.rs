use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gumsync_sync::schedule::build_cron_scheduler;
use gumsync_sync::{run_forever, SyncConfig, SyncPipeline};
use tracing::{error, info};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gumsync")]
#[command(about = "Sync Gumroad sales into a Notion customer database")]
struct Cli {
    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest new sales, then merge duplicate customers, once.
    Run,
    /// Keep running on an interval (or GUMSYNC_SCHEDULE_CRON) until Ctrl-C.
    Watch {
        /// Seconds between successful runs; overrides GUMSYNC_POLL_INTERVAL_SECS.
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Only create records for new sales.
    Ingest,
    /// Only merge duplicate customers.
    Dedup,
    /// Show the merges the next dedup would make, without writing.
    Plan,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env().context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let pipeline = SyncPipeline::from_config(&config)?;
            let summary = pipeline.run_once().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "sync complete: run_id={} created={} merged={} archived={} failures={}",
                    summary.run_id,
                    summary.created_records,
                    summary.merged_groups,
                    summary.archived_records,
                    summary.failures.len()
                );
                for failure in &summary.failures {
                    eprintln!("  {failure}");
                }
            }
        }
        Commands::Watch { interval_secs } => {
            if let Some(secs) = interval_secs {
                config.poll_interval = Duration::from_secs(secs);
            }
            let pipeline = Arc::new(SyncPipeline::from_config(&config)?);

            if let Some(cron) = &config.schedule_cron {
                let mut sched = build_cron_scheduler(pipeline, cron).await?;
                sched.start().await.context("starting scheduler")?;
                info!(%cron, "cron schedule active; Ctrl-C to stop");
                tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
                sched.shutdown().await.context("stopping scheduler")?;
            } else {
                let policy = config.schedule_policy();
                info!(interval = ?policy.interval, "polling; Ctrl-C to stop");
                let stats = run_forever(&pipeline, policy, shutdown_signal()).await;
                println!("stopped after {} runs ({} failed)", stats.runs, stats.failed_runs);
            }
        }
        Commands::Ingest => {
            let pipeline = SyncPipeline::from_config(&config)?;
            let report = pipeline.ingest().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "ingest complete: fetched={} already_seen={} created={} failures={}",
                    report.fetched,
                    report.already_seen,
                    report.created.len(),
                    report.failures.len()
                );
                for failure in &report.failures {
                    eprintln!("  {failure}");
                }
            }
        }
        Commands::Plan => {
            let pipeline = SyncPipeline::from_config(&config)?;
            let plan = pipeline.plan().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                println!(
                    "{} records, {} customers, {} to merge",
                    plan.scanned,
                    plan.distinct_emails,
                    plan.groups.len()
                );
                for group in &plan.groups {
                    println!(
                        "  {} -> keep {} (total {}, {} products), archive {}",
                        group.email,
                        group.survivor_id,
                        group.total_spent,
                        group.purchased_products.len(),
                        group.superseded_ids.len()
                    );
                }
                for email in &plan.overflowed {
                    println!("  {email} -> total overflows, left unmerged");
                }
            }
        }
        Commands::Dedup => {
            let pipeline = SyncPipeline::from_config(&config)?;
            let report = pipeline.deduplicate().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "dedup complete: scanned={} merged={} archived={} skipped={} failures={}",
                    report.scanned,
                    report.merged,
                    report.archived,
                    report.skipped,
                    report.failures.len()
                );
                for failure in &report.failures {
                    eprintln!("  {failure}");
                }
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    shutdown_on(tokio::signal::ctrl_c()).await;
}

/// Resolves when `signal` fires. If the handler cannot be installed, logs and never resolves.
async fn shutdown_on(signal: impl Future<Output = std::io::Result<()>>) {
    if let Err(err) = signal.await {
        error!(error = %err, "cannot listen for Ctrl-C; polling continues until the process is killed");
        std::future::pending::<()>().await;
    }
}
