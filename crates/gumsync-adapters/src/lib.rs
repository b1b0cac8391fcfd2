//! Record store + sale feed contracts and their remote/in-memory implementations.

use async_trait::async_trait;
use chrono::NaiveDate;
use gumsync_core::{CustomerRecord, NewRecord, RecordId, RecordPatch, SaleEvent};
use gumsync_http::{FetchError, RetryDisposition};
use thiserror::Error;

pub mod gumroad;
pub mod memory;
pub mod notion;
pub mod schema;

pub use gumroad::{GumroadConfig, GumroadSaleFeed};
pub use memory::{InMemoryRecordStore, StaticSaleFeed};
pub use notion::{NotionConfig, NotionRecordStore};
pub use schema::{PropertyNames, SchemaMismatch};

pub const CRATE_NAME: &str = "gumsync-adapters";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{service} request failed: {source}")]
    Fetch {
        service: &'static str,
        #[source]
        source: FetchError,
    },
    #[error("{service} unavailable: {message}")]
    Unavailable {
        service: &'static str,
        message: String,
    },
    #[error("{service} rejected the request: {message}")]
    Rejected {
        service: &'static str,
        message: String,
    },
    #[error("unexpected {service} response: {message}")]
    Malformed {
        service: &'static str,
        message: String,
    },
    #[error("record {0} not found")]
    NotFound(RecordId),
}

impl ClientError {
    pub fn fetch(service: &'static str, source: FetchError) -> Self {
        Self::Fetch { service, source }
    }

    /// Network-level failures that a later run may not hit again.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Fetch { source, .. } => source.disposition() == RetryDisposition::Retryable,
            ClientError::Unavailable { .. } => true,
            ClientError::Rejected { .. }
            | ClientError::Malformed { .. }
            | ClientError::NotFound(_) => false,
        }
    }
}

/// Full active record set in store order, plus rows the field mapping rejected.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub records: Vec<CustomerRecord>,
    pub rejected: Vec<SchemaMismatch>,
}

/// Sales returned for one feed query, in feed order.
#[derive(Debug, Clone, Default)]
pub struct SaleBatch {
    pub sales: Vec<SaleEvent>,
    pub rejected: Vec<SchemaMismatch>,
}

/// Structured store holding one row per customer purchase history.
///
/// Implementations return the complete active set from `query_all`, following
/// any pagination themselves. Archived rows never appear in a snapshot.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn query_all(&self) -> Result<Snapshot, ClientError>;

    async fn create_record(&self, record: &NewRecord) -> Result<RecordId, ClientError>;

    async fn patch_record(&self, id: &RecordId, patch: &RecordPatch) -> Result<(), ClientError>;

    /// Hides a record without deleting it.
    async fn archive_record(&self, id: &RecordId) -> Result<(), ClientError>;
}

/// Source of sale events. `since` has day granularity only.
#[async_trait]
pub trait SaleFeed: Send + Sync {
    async fn fetch_sales_since(&self, since: NaiveDate) -> Result<SaleBatch, ClientError>;
}
