//! Folding same-email records into one surviving record.
//!
//! Cumulative fields (`total_spent`, `purchased_products`) are summed and
//! concatenated across every member. Scalar status fields come from the most
//! recently created member, which is also the survivor. When two members share
//! a creation time, the one later in store order counts as newer.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use gumsync_adapters::RecordStore;
use gumsync_core::{CustomerRecord, Money, ProductRef, RecordId, RecordPatch};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{serialize_failures, SyncError, WriteOp};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeGroup {
    pub email: String,
    pub total_spent: Money,
    pub subscribed: bool,
    pub purchased_products: Vec<ProductRef>,
    pub survivor_id: RecordId,
    pub survivor_created_at: DateTime<Utc>,
    /// Other members, in the order they were displaced or encountered.
    pub superseded_ids: Vec<RecordId>,
    #[serde(skip)]
    overflowed: bool,
}

impl MergeGroup {
    fn seed(record: &CustomerRecord) -> Self {
        Self {
            email: record.email.clone(),
            total_spent: record.total_spent,
            subscribed: record.subscribed,
            purchased_products: record.purchased_products.clone(),
            survivor_id: record.id.clone(),
            survivor_created_at: record.created_at,
            superseded_ids: Vec::new(),
            overflowed: false,
        }
    }

    fn absorb(&mut self, record: &CustomerRecord) {
        match self.total_spent.checked_add(record.total_spent) {
            Some(total) => self.total_spent = total,
            None => self.overflowed = true,
        }
        self.purchased_products
            .extend(record.purchased_products.iter().cloned());

        if record.created_at >= self.survivor_created_at {
            let displaced = std::mem::replace(&mut self.survivor_id, record.id.clone());
            self.superseded_ids.push(displaced);
            self.survivor_created_at = record.created_at;
            self.subscribed = record.subscribed;
        } else {
            self.superseded_ids.push(record.id.clone());
        }
    }

    /// Set once the summed total left the `i64` range; such a group is never written.
    pub fn total_overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn has_duplicates(&self) -> bool {
        !self.superseded_ids.is_empty()
    }

    pub fn patch(&self) -> RecordPatch {
        RecordPatch {
            total_spent: self.total_spent,
            subscribed: self.subscribed,
            purchased_products: self.purchased_products.clone(),
        }
    }
}

/// Groups records by email in store order. Groups come back in first-seen order.
///
/// A record id repeated within the input is only counted once.
pub fn plan_merges(records: &[CustomerRecord]) -> Vec<MergeGroup> {
    let mut groups: Vec<MergeGroup> = Vec::new();
    let mut by_email: HashMap<&str, usize> = HashMap::new();
    let mut seen_ids: HashSet<&RecordId> = HashSet::new();

    for record in records {
        if !seen_ids.insert(&record.id) {
            warn!(record_id = %record.id, "record returned twice by the store; ignoring repeat");
            continue;
        }
        match by_email.get(record.email.as_str()) {
            Some(&index) => groups[index].absorb(record),
            None => {
                by_email.insert(record.email.as_str(), groups.len());
                groups.push(MergeGroup::seed(record));
            }
        }
    }

    groups
}

/// Merge groups that need writes, computed from one full store read.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MergePlan {
    pub scanned: usize,
    pub distinct_emails: usize,
    pub groups: Vec<MergeGroup>,
    /// Emails whose duplicates cannot be merged because the total overflows.
    pub overflowed: Vec<String>,
    #[serde(skip)]
    pub rejected: Vec<gumsync_adapters::SchemaMismatch>,
}

#[derive(Debug, Default, Serialize)]
pub struct DedupReport {
    pub scanned: usize,
    pub distinct_emails: usize,
    pub merged: usize,
    pub archived: usize,
    pub skipped: usize,
    #[serde(serialize_with = "serialize_failures")]
    pub failures: Vec<SyncError>,
}

/// Reads the active set and plans merges without writing anything.
pub async fn plan(store: &dyn RecordStore) -> Result<MergePlan, SyncError> {
    let snapshot = store.query_all().await?;
    let all_groups = plan_merges(&snapshot.records);
    let distinct_emails = all_groups.len();
    let (overflowed, groups): (Vec<MergeGroup>, Vec<MergeGroup>) = all_groups
        .into_iter()
        .filter(MergeGroup::has_duplicates)
        .partition(MergeGroup::total_overflowed);
    let overflowed: Vec<String> = overflowed.into_iter().map(|group| group.email).collect();

    debug!(
        scanned = snapshot.records.len(),
        distinct_emails,
        duplicate_groups = groups.len(),
        overflowed = overflowed.len(),
        "merge plan built"
    );

    Ok(MergePlan {
        scanned: snapshot.records.len(),
        distinct_emails,
        groups,
        overflowed,
        rejected: snapshot.rejected,
    })
}

/// Merges duplicate records and archives the superseded ones.
///
/// Only a failed store read aborts. A failed survivor patch skips that group's
/// archives so no amounts are lost; a failed archive leaves the record active
/// for the next run to fold in again.
pub async fn deduplicate(store: &dyn RecordStore) -> Result<DedupReport, SyncError> {
    let plan = plan(store).await?;
    let mut report = DedupReport {
        scanned: plan.scanned,
        distinct_emails: plan.distinct_emails,
        skipped: plan.rejected.len(),
        ..DedupReport::default()
    };
    report
        .failures
        .extend(plan.rejected.into_iter().map(SyncError::from));
    for email in plan.overflowed {
        warn!(%email, "merged total overflows; leaving duplicates in place");
        report.failures.push(SyncError::TotalOverflow { email });
    }

    for group in &plan.groups {
        if let Err(source) = store.patch_record(&group.survivor_id, &group.patch()).await {
            warn!(email = %group.email, record_id = %group.survivor_id, error = %source, "survivor patch failed");
            report.failures.push(SyncError::PartialWrite {
                email: group.email.clone(),
                operation: WriteOp::Patch,
                record_id: group.survivor_id.clone(),
                source,
            });
            continue;
        }
        report.merged += 1;

        for id in &group.superseded_ids {
            match store.archive_record(id).await {
                Ok(()) => report.archived += 1,
                Err(source) => {
                    warn!(email = %group.email, record_id = %id, error = %source, "archive failed");
                    report.failures.push(SyncError::PartialWrite {
                        email: group.email.clone(),
                        operation: WriteOp::Archive,
                        record_id: id.clone(),
                        source,
                    });
                }
            }
        }
    }

    info!(
        scanned = report.scanned,
        merged = report.merged,
        archived = report.archived,
        failures = report.failures.len(),
        "deduplication finished"
    );
    Ok(report)
}
