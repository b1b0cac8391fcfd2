//! In-process record store and sale feed.
//!
//! The store keeps Notion-shaped page JSON and reads it back through
//! [`PropertyNames`], so callers exercise the same field mapping as the
//! remote client.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use gumsync_core::{CustomerRecord, NewRecord, RecordId, RecordPatch, SaleEvent};
use serde_json::{json, Value as JsonValue};

use crate::schema::PropertyNames;
use crate::{ClientError, RecordStore, SaleBatch, SaleFeed, Snapshot};

const SERVICE: &str = "memory";

#[derive(Debug, Default)]
struct MemoryState {
    pages: Vec<JsonValue>,
    next_id: u64,
    unavailable: bool,
    failing_ids: HashSet<RecordId>,
    failing_emails: HashSet<String>,
    patches: usize,
    archives: usize,
}

#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    properties: PropertyNames,
    state: Mutex<MemoryState>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_properties(properties: PropertyNames) -> Self {
        Self {
            properties,
            state: Mutex::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts an existing record with its own id and creation time.
    pub fn seed_record(&self, record: &CustomerRecord) {
        let new = NewRecord {
            email: record.email.clone(),
            total_spent: record.total_spent,
            subscribed: record.subscribed,
            purchased_products: record.purchased_products.clone(),
        };
        let page = self.page_json(&record.id, record.created_at, &new);
        self.state().pages.push(page);
    }

    /// Inserts a raw page, e.g. one that does not match the schema.
    pub fn seed_page(&self, page: JsonValue) {
        self.state().pages.push(page);
    }

    /// Makes `query_all` fail with a transient error until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Makes patch and archive calls against `id` fail.
    pub fn fail_writes_to(&self, id: impl Into<RecordId>) {
        self.state().failing_ids.insert(id.into());
    }

    /// Makes record creation for `email` fail.
    pub fn fail_creates_for(&self, email: impl Into<String>) {
        self.state().failing_emails.insert(email.into());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.failing_ids.clear();
        state.failing_emails.clear();
        state.unavailable = false;
    }

    /// Decoded records that are still active, in insertion order.
    pub fn active_records(&self) -> Vec<CustomerRecord> {
        self.records_where(|archived| !archived)
    }

    /// Decoded records that have been archived, in insertion order.
    pub fn archived_records(&self) -> Vec<CustomerRecord> {
        self.records_where(|archived| archived)
    }

    pub fn archived_ids(&self) -> Vec<RecordId> {
        self.archived_records().into_iter().map(|r| r.id).collect()
    }

    pub fn patch_count(&self) -> usize {
        self.state().patches
    }

    pub fn archive_count(&self) -> usize {
        self.state().archives
    }

    fn records_where(&self, keep: impl Fn(bool) -> bool) -> Vec<CustomerRecord> {
        self.state()
            .pages
            .iter()
            .filter(|page| keep(is_archived(page)))
            .filter_map(|page| self.properties.decode_page(page).ok())
            .collect()
    }

    fn page_json(&self, id: &RecordId, created_at: DateTime<Utc>, record: &NewRecord) -> JsonValue {
        json!({
            "object": "page",
            "id": id.as_str(),
            "created_time": created_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "archived": false,
            "properties": self.properties.encode_new_record(record),
        })
    }

    fn page_mut<'a>(state: &'a mut MemoryState, id: &RecordId) -> Result<&'a mut JsonValue, ClientError> {
        state
            .pages
            .iter_mut()
            .find(|page| page.get("id").and_then(JsonValue::as_str) == Some(id.as_str()))
            .ok_or_else(|| ClientError::NotFound(id.clone()))
    }

    fn check_writable(state: &MemoryState, id: &RecordId) -> Result<(), ClientError> {
        if state.failing_ids.contains(id) {
            return Err(ClientError::Unavailable {
                service: SERVICE,
                message: format!("write to {id} refused"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn query_all(&self) -> Result<Snapshot, ClientError> {
        let state = self.state();
        if state.unavailable {
            return Err(ClientError::Unavailable {
                service: SERVICE,
                message: "store offline".into(),
            });
        }
        let mut snapshot = Snapshot::default();
        for page in state.pages.iter().filter(|p| !is_archived(p)) {
            match self.properties.decode_page(page) {
                Ok(record) => snapshot.records.push(record),
                Err(mismatch) => snapshot.rejected.push(mismatch),
            }
        }
        Ok(snapshot)
    }

    async fn create_record(&self, record: &NewRecord) -> Result<RecordId, ClientError> {
        let mut state = self.state();
        if state.failing_emails.contains(&record.email) {
            return Err(ClientError::Unavailable {
                service: SERVICE,
                message: format!("create for {} refused", record.email),
            });
        }
        // Creation time is assigned by the store, strictly after every existing page.
        let latest = state
            .pages
            .iter()
            .filter_map(|p| p.get("created_time").and_then(JsonValue::as_str))
            .filter_map(crate::schema::parse_timestamp)
            .max();
        let now = Utc::now();
        let created_at = match latest {
            Some(latest) if latest >= now => latest + Duration::seconds(1),
            _ => now,
        };
        state.next_id += 1;
        let id = RecordId::new(format!("mem-{}", state.next_id));
        let page = self.page_json(&id, created_at, record);
        state.pages.push(page);
        Ok(id)
    }

    async fn patch_record(&self, id: &RecordId, patch: &RecordPatch) -> Result<(), ClientError> {
        let mut state = self.state();
        Self::check_writable(&state, id)?;
        let encoded = self.properties.encode_patch(patch);
        let page = Self::page_mut(&mut state, id)?;
        if let (Some(props), Some(updates)) = (
            page.get_mut("properties").and_then(JsonValue::as_object_mut),
            encoded.as_object(),
        ) {
            for (name, value) in updates {
                props.insert(name.clone(), value.clone());
            }
        }
        state.patches += 1;
        Ok(())
    }

    async fn archive_record(&self, id: &RecordId) -> Result<(), ClientError> {
        let mut state = self.state();
        Self::check_writable(&state, id)?;
        let page = Self::page_mut(&mut state, id)?;
        page["archived"] = json!(true);
        state.archives += 1;
        Ok(())
    }
}

fn is_archived(page: &JsonValue) -> bool {
    page.get("archived").and_then(JsonValue::as_bool).unwrap_or(false)
}

/// Fixed list of sales served with the feed's day-granularity filter.
#[derive(Debug, Clone, Default)]
pub struct StaticSaleFeed {
    sales: Vec<SaleEvent>,
}

impl StaticSaleFeed {
    pub fn new(sales: Vec<SaleEvent>) -> Self {
        Self { sales }
    }
}

#[async_trait]
impl SaleFeed for StaticSaleFeed {
    async fn fetch_sales_since(&self, since: NaiveDate) -> Result<SaleBatch, ClientError> {
        Ok(SaleBatch {
            sales: self
                .sales
                .iter()
                .filter(|s| s.created_at.date_naive() >= since)
                .cloned()
                .collect(),
            rejected: Vec::new(),
        })
    }
}
