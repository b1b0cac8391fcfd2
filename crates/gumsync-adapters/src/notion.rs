//! Notion database as the customer record store.

use async_trait::async_trait;
use gumsync_core::{NewRecord, RecordId, RecordPatch};
use gumsync_http::{HttpFetcher, Method, Replay};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use crate::schema::PropertyNames;
use crate::{ClientError, RecordStore, Snapshot};

const SERVICE: &str = "notion";
const PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone)]
pub struct NotionConfig {
    pub api_url: String,
    pub token: String,
    pub database_id: String,
    pub notion_version: String,
}

#[derive(Debug, Clone)]
pub struct NotionRecordStore {
    http: HttpFetcher,
    config: NotionConfig,
    properties: PropertyNames,
}

impl NotionRecordStore {
    pub fn new(http: HttpFetcher, config: NotionConfig, properties: PropertyNames) -> Self {
        Self {
            http,
            config,
            properties,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_url.trim_end_matches('/'), path)
    }

    async fn call(&self, method: Method, path: &str, body: &JsonValue, replay: Replay) -> Result<JsonValue, ClientError> {
        let request = self
            .http
            .client()
            .request(method, self.url(path))
            .bearer_auth(&self.config.token)
            .header("Notion-Version", &self.config.notion_version)
            .json(body);
        self.http
            .send_json_with(SERVICE, request, replay)
            .await
            .map_err(|e| ClientError::fetch(SERVICE, e))
    }
}

#[async_trait]
impl RecordStore for NotionRecordStore {
    async fn query_all(&self) -> Result<Snapshot, ClientError> {
        let path = format!("databases/{}/query", self.config.database_id);
        let mut snapshot = Snapshot::default();
        let mut cursor: Option<String> = None;

        loop {
            let mut body = json!({ "page_size": PAGE_SIZE });
            if let Some(cursor) = &cursor {
                body["start_cursor"] = json!(cursor);
            }
            let page = self.call(Method::POST, &path, &body, Replay::Idempotent).await?;
            let results = page
                .get("results")
                .and_then(JsonValue::as_array)
                .ok_or_else(|| ClientError::Malformed {
                    service: SERVICE,
                    message: "query response has no results array".into(),
                })?;

            for result in results {
                if is_archived(result) {
                    continue;
                }
                match self.properties.decode_page(result) {
                    Ok(record) => snapshot.records.push(record),
                    Err(mismatch) => {
                        warn!(%mismatch, "skipping unreadable notion page");
                        snapshot.rejected.push(mismatch);
                    }
                }
            }

            let has_more = page.get("has_more").and_then(JsonValue::as_bool).unwrap_or(false);
            cursor = page
                .get("next_cursor")
                .and_then(JsonValue::as_str)
                .map(ToString::to_string);
            if !has_more || cursor.is_none() {
                break;
            }
        }

        debug!(
            records = snapshot.records.len(),
            rejected = snapshot.rejected.len(),
            "notion database read"
        );
        Ok(snapshot)
    }

    async fn create_record(&self, record: &NewRecord) -> Result<RecordId, ClientError> {
        let body = json!({
            "parent": { "database_id": self.config.database_id },
            "properties": self.properties.encode_new_record(record),
        });
        // A timed-out create may still have landed; resending could duplicate the sale.
        let created = self.call(Method::POST, "pages", &body, Replay::UnsentOnly).await?;
        created
            .get("id")
            .and_then(JsonValue::as_str)
            .map(RecordId::new)
            .ok_or_else(|| ClientError::Malformed {
                service: SERVICE,
                message: "created page has no id".into(),
            })
    }

    async fn patch_record(&self, id: &RecordId, patch: &RecordPatch) -> Result<(), ClientError> {
        let body = json!({ "properties": self.properties.encode_patch(patch) });
        self.call(Method::PATCH, &format!("pages/{id}"), &body, Replay::Idempotent)
            .await?;
        Ok(())
    }

    async fn archive_record(&self, id: &RecordId) -> Result<(), ClientError> {
        self.call(
            Method::PATCH,
            &format!("pages/{id}"),
            &json!({ "archived": true }),
            Replay::Idempotent,
        )
        .await?;
        Ok(())
    }
}

fn is_archived(page: &JsonValue) -> bool {
    ["archived", "in_trash"]
        .iter()
        .any(|key| page.get(*key).and_then(JsonValue::as_bool).unwrap_or(false))
}
