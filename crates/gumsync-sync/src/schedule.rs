//! Outer polling loop around [`SyncPipeline::run_once`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use gumsync_http::BackoffPolicy;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::SyncPipeline;

/// Fixed interval between successful runs, exponential cooldown after failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePolicy {
    pub interval: Duration,
    pub failure_backoff: BackoffPolicy,
}

impl SchedulePolicy {
    pub fn delay_after(&self, consecutive_failures: usize) -> Duration {
        match consecutive_failures {
            0 => self.interval,
            n => self.failure_backoff.delay_for_attempt(n - 1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleStats {
    pub runs: usize,
    pub failed_runs: usize,
}

/// Runs the pipeline until `shutdown` resolves. A run in progress is allowed to finish.
pub async fn run_forever(
    pipeline: &SyncPipeline,
    policy: SchedulePolicy,
    shutdown: impl Future<Output = ()>,
) -> ScheduleStats {
    tokio::pin!(shutdown);
    let mut stats = ScheduleStats::default();
    let mut consecutive_failures = 0usize;

    loop {
        stats.runs += 1;
        match pipeline.run_once().await {
            Ok(summary) => {
                consecutive_failures = 0;
                info!(
                    run_id = %summary.run_id,
                    created = summary.created_records,
                    merged = summary.merged_groups,
                    archived = summary.archived_records,
                    "sync run complete"
                );
            }
            Err(err) => {
                consecutive_failures += 1;
                stats.failed_runs += 1;
                error!(error = %err, transient = err.is_transient(), consecutive_failures, "sync run failed");
            }
        }

        let delay = policy.delay_after(consecutive_failures);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = &mut shutdown => {
                info!(runs = stats.runs, "shutdown requested; leaving poll loop");
                return stats;
            }
        }
    }
}

/// Cron-triggered alternative to [`run_forever`]; overlapping triggers queue on the run lock.
pub async fn build_cron_scheduler(pipeline: Arc<SyncPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(run_id = %summary.run_id, "scheduled sync run complete"),
                Err(err) => error!(error = %err, "scheduled sync run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use gumsync_adapters::{InMemoryRecordStore, StaticSaleFeed};
    use gumsync_core::{CustomerRecord, Money, RecordId};

    fn policy() -> SchedulePolicy {
        SchedulePolicy {
            interval: Duration::from_secs(100),
            failure_backoff: BackoffPolicy {
                max_retries: usize::MAX,
                base_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(40),
            },
        }
    }

    fn pipeline(store: Arc<InMemoryRecordStore>) -> SyncPipeline {
        SyncPipeline::new(store, Arc::new(StaticSaleFeed::default()))
    }

    #[test]
    fn failures_back_off_exponentially_then_cap() {
        let policy = policy();
        assert_eq!(policy.delay_after(0), Duration::from_secs(100));
        assert_eq!(policy.delay_after(1), Duration::from_secs(10));
        assert_eq!(policy.delay_after(2), Duration::from_secs(20));
        assert_eq!(policy.delay_after(3), Duration::from_secs(40));
        assert_eq!(policy.delay_after(9), Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_runs_repeat_on_the_interval() {
        let store = Arc::new(InMemoryRecordStore::new());
        store.seed_record(&CustomerRecord {
            id: RecordId::new("seed"),
            email: "seed@example.com".into(),
            total_spent: Money::from_minor_units(100),
            subscribed: false,
            purchased_products: Vec::new(),
            created_at: Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap(),
        });
        let pipeline = pipeline(store);

        let stats = run_forever(&pipeline, policy(), tokio::time::sleep(Duration::from_secs(250))).await;
        assert_eq!(stats, ScheduleStats { runs: 3, failed_runs: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn failing_runs_retry_sooner_with_growing_delays() {
        let store = Arc::new(InMemoryRecordStore::new());
        store.set_unavailable(true);
        let pipeline = pipeline(store);

        // Runs at t=0, 10 and 30; the next would be at 70.
        let stats = run_forever(&pipeline, policy(), tokio::time::sleep(Duration::from_secs(65))).await;
        assert_eq!(stats, ScheduleStats { runs: 3, failed_runs: 3 });
    }
}
