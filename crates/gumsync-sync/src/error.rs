use std::fmt;

use gumsync_adapters::{ClientError, SchemaMismatch};
use gumsync_core::RecordId;
use serde::Serializer;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Patch,
    Archive,
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteOp::Patch => f.write_str("patch"),
            WriteOp::Archive => f.write_str("archive"),
        }
    }
}

/// Failures of a sync run.
///
/// `TransientNetwork`, `Client` and `EmptyStore` abort the run. The remaining
/// variants are collected per record or per merge group into run reports.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transient network error: {0}")]
    TransientNetwork(#[source] ClientError),
    #[error("remote client error: {0}")]
    Client(#[source] ClientError),
    #[error("record store is empty; seed at least one record before the first run")]
    EmptyStore,
    #[error("skipped unreadable item: {0}")]
    SchemaMismatch(#[from] SchemaMismatch),
    #[error("{operation} of record {record_id} for {email} failed: {source}")]
    PartialWrite {
        email: String,
        operation: WriteOp,
        record_id: RecordId,
        #[source]
        source: ClientError,
    },
    #[error("merged total for {email} does not fit in the amount range; group left unmerged")]
    TotalOverflow { email: String },
    #[error("creating record for {email} failed: {source}")]
    CreateFailed {
        email: String,
        #[source]
        source: ClientError,
    },
}

impl From<ClientError> for SyncError {
    fn from(err: ClientError) -> Self {
        if err.is_transient() {
            SyncError::TransientNetwork(err)
        } else {
            SyncError::Client(err)
        }
    }
}

impl SyncError {
    /// Whether retrying the whole run after a cooldown is expected to help.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::TransientNetwork(_) => true,
            SyncError::PartialWrite { source, .. } | SyncError::CreateFailed { source, .. } => {
                source.is_transient()
            }
            SyncError::Client(_)
            | SyncError::EmptyStore
            | SyncError::SchemaMismatch(_)
            | SyncError::TotalOverflow { .. } => false,
        }
    }
}

/// Writes collected failures as their messages.
pub(crate) fn serialize_failures<S: Serializer>(failures: &[SyncError], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(failures.iter().map(ToString::to_string))
}
