//! Sync pipeline: ingest new sales, then fold duplicate customers together.
//!
//! Each run reads a fresh snapshot of the record store; nothing is cached
//! between runs. Runs through one [`SyncPipeline`] are serialized, but two
//! processes pointed at the same store are not coordinated, so only one
//! instance may run against a given database.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use gumsync_adapters::{GumroadSaleFeed, NotionRecordStore, RecordStore, SaleFeed};
use gumsync_http::{HttpClientConfig, HttpFetcher, TokenBucketConfig};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub mod config;
pub mod dedup;
pub mod error;
pub mod ingest;
pub mod schedule;

pub use config::SyncConfig;
pub use dedup::{deduplicate, plan_merges, DedupReport, MergeGroup, MergePlan};
pub use error::{SyncError, WriteOp};
pub use ingest::{ingest, IngestReport};
pub use schedule::{run_forever, SchedulePolicy, ScheduleStats};

pub const CRATE_NAME: &str = "gumsync-sync";

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub last_known: Option<DateTime<Utc>>,
    pub fetched_sales: usize,
    pub created_records: usize,
    pub merged_groups: usize,
    pub archived_records: usize,
    pub skipped_records: usize,
    pub failures: Vec<String>,
}

impl SyncRunSummary {
    fn from_reports(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        ingest: IngestReport,
        dedup: DedupReport,
    ) -> Self {
        let failures = ingest
            .failures
            .iter()
            .chain(dedup.failures.iter())
            .map(ToString::to_string)
            .collect();
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            last_known: ingest.last_known,
            fetched_sales: ingest.fetched,
            created_records: ingest.created.len(),
            merged_groups: dedup.merged,
            archived_records: dedup.archived,
            skipped_records: dedup.skipped,
            failures,
        }
    }
}

pub struct SyncPipeline {
    store: Arc<dyn RecordStore>,
    feed: Arc<dyn SaleFeed>,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(store: Arc<dyn RecordStore>, feed: Arc<dyn SaleFeed>) -> Self {
        Self {
            store,
            feed,
            run_lock: Mutex::new(()),
        }
    }

    /// Wires the Notion store and Gumroad feed described by `config`.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.http_timeout_secs);
        let notion_http = HttpFetcher::new(HttpClientConfig {
            timeout,
            user_agent: Some(config.user_agent.clone()),
            token_bucket: Some(TokenBucketConfig::per_second(config.notion_requests_per_second)),
            ..Default::default()
        })?;
        let gumroad_http = HttpFetcher::new(HttpClientConfig {
            timeout,
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;

        let store = NotionRecordStore::new(notion_http, config.notion.clone(), config.property_names()?);
        let feed = GumroadSaleFeed::new(gumroad_http, config.gumroad.clone());
        Ok(Self::new(Arc::new(store), Arc::new(feed)))
    }

    /// Ingestion followed by deduplication, as one serialized unit.
    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        let _guard = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("sync_run", %run_id);

        async {
            let ingest = ingest::ingest(self.store.as_ref(), self.feed.as_ref()).await?;
            let dedup = dedup::deduplicate(self.store.as_ref()).await?;
            let summary = SyncRunSummary::from_reports(run_id, started_at, ingest, dedup);
            info!(
                created = summary.created_records,
                merged = summary.merged_groups,
                archived = summary.archived_records,
                failures = summary.failures.len(),
                "sync run finished"
            );
            Ok::<_, SyncError>(summary)
        }
        .instrument(span)
        .await
    }

    pub async fn ingest(&self) -> Result<IngestReport, SyncError> {
        let _guard = self.run_lock.lock().await;
        ingest::ingest(self.store.as_ref(), self.feed.as_ref()).await
    }

    pub async fn deduplicate(&self) -> Result<DedupReport, SyncError> {
        let _guard = self.run_lock.lock().await;
        dedup::deduplicate(self.store.as_ref()).await
    }

    /// The merges the next deduplication would perform, without writing.
    pub async fn plan(&self) -> Result<MergePlan, SyncError> {
        let _guard = self.run_lock.lock().await;
        dedup::plan(self.store.as_ref()).await
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::from_config(&config)?;
    Ok(pipeline.run_once().await?)
}
