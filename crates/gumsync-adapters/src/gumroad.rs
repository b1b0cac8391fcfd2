//! Gumroad sales API as the sale feed.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::NaiveDate;
use gumsync_http::HttpFetcher;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::schema::decode_sale;
use crate::{ClientError, SaleBatch, SaleFeed};

const SERVICE: &str = "gumroad";

#[derive(Debug, Clone)]
pub struct GumroadConfig {
    pub api_url: String,
    pub access_token: String,
}

#[derive(Debug, Clone)]
pub struct GumroadSaleFeed {
    http: HttpFetcher,
    config: GumroadConfig,
}

#[derive(Debug, Deserialize)]
struct SalesPage {
    success: bool,
    #[serde(default)]
    sales: Vec<JsonValue>,
    #[serde(default)]
    next_page_key: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl GumroadSaleFeed {
    pub fn new(http: HttpFetcher, config: GumroadConfig) -> Self {
        Self { http, config }
    }

    async fn fetch_page(&self, after: &str, page_key: Option<&str>) -> Result<SalesPage, ClientError> {
        let url = format!("{}/sales", self.config.api_url.trim_end_matches('/'));
        let mut query = vec![("access_token", self.config.access_token.as_str()), ("after", after)];
        if let Some(key) = page_key {
            query.push(("page_key", key));
        }
        let request = self.http.client().get(url).query(&query);
        let body = self
            .http
            .send_json(SERVICE, request)
            .await
            .map_err(|e| ClientError::fetch(SERVICE, e))?;
        parse_sales_page(body)
    }
}

fn parse_sales_page(body: JsonValue) -> Result<SalesPage, ClientError> {
    let page: SalesPage = serde_json::from_value(body).map_err(|e| ClientError::Malformed {
        service: SERVICE,
        message: e.to_string(),
    })?;
    if !page.success {
        return Err(ClientError::Rejected {
            service: SERVICE,
            message: page.message.unwrap_or_else(|| "success=false".to_string()),
        });
    }
    Ok(page)
}

#[async_trait]
impl SaleFeed for GumroadSaleFeed {
    async fn fetch_sales_since(&self, since: NaiveDate) -> Result<SaleBatch, ClientError> {
        let after = since.format("%Y-%m-%d").to_string();
        let mut batch = SaleBatch::default();
        let mut page_key: Option<String> = None;
        let mut seen_keys: HashSet<String> = HashSet::new();

        loop {
            let page = self.fetch_page(&after, page_key.as_deref()).await?;
            for raw in &page.sales {
                match decode_sale(raw) {
                    Ok(sale) => batch.sales.push(sale),
                    Err(mismatch) => {
                        warn!(%mismatch, "skipping unreadable gumroad sale");
                        batch.rejected.push(mismatch);
                    }
                }
            }
            match page.next_page_key {
                Some(next) if next.is_empty() => break,
                Some(next) => {
                    if !seen_keys.insert(next.clone()) {
                        warn!(page_key = %next, "gumroad page key repeated; stopping pagination");
                        break;
                    }
                    page_key = Some(next);
                }
                None => break,
            }
        }

        debug!(%after, sales = batch.sales.len(), "gumroad sales fetched");
        Ok(batch)
    }
}
