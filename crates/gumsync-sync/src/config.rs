use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use gumsync_adapters::{GumroadConfig, NotionConfig, PropertyNames};
use gumsync_http::BackoffPolicy;

use crate::schedule::SchedulePolicy;

pub const DEFAULT_NOTION_API_URL: &str = "https://api.notion.com/v1";
pub const DEFAULT_NOTION_VERSION: &str = "2022-06-28";
pub const DEFAULT_GUMROAD_API_URL: &str = "https://api.gumroad.com/v2";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub notion: NotionConfig,
    pub gumroad: GumroadConfig,
    pub poll_interval: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub notion_requests_per_second: u32,
    pub schedule_cron: Option<String>,
    pub schema_file: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .with_context(|| format!("{key} must be set"))
        };
        let or_default = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let number = |key: &str, default: u64| -> Result<u64> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .with_context(|| format!("{key} must be a whole number, got {raw:?}")),
                None => Ok(default),
            }
        };

        Ok(Self {
            notion: NotionConfig {
                api_url: or_default("NOTION_API_URL", DEFAULT_NOTION_API_URL),
                token: required("NOTION_TOKEN")?,
                database_id: required("NOTION_DATABASE_ID")?,
                notion_version: or_default("NOTION_VERSION", DEFAULT_NOTION_VERSION),
            },
            gumroad: GumroadConfig {
                api_url: or_default("GUMROAD_API_URL", DEFAULT_GUMROAD_API_URL),
                access_token: required("GUMROAD_ACCESS_TOKEN")?,
            },
            poll_interval: Duration::from_secs(number("GUMSYNC_POLL_INTERVAL_SECS", 300)?),
            retry_base: Duration::from_secs(number("GUMSYNC_RETRY_BASE_SECS", 60)?),
            retry_max: Duration::from_secs(number("GUMSYNC_RETRY_MAX_SECS", 1800)?),
            http_timeout_secs: number("GUMSYNC_HTTP_TIMEOUT_SECS", 20)?,
            user_agent: or_default("GUMSYNC_USER_AGENT", "gumsync/0.1"),
            notion_requests_per_second: u32::try_from(number("GUMSYNC_NOTION_RPS", 3)?)
                .context("GUMSYNC_NOTION_RPS is too large")?,
            schedule_cron: lookup("GUMSYNC_SCHEDULE_CRON").filter(|v| !v.trim().is_empty()),
            schema_file: lookup("GUMSYNC_SCHEMA_FILE").map(PathBuf::from),
        })
    }

    pub fn schedule_policy(&self) -> SchedulePolicy {
        SchedulePolicy {
            interval: self.poll_interval,
            failure_backoff: BackoffPolicy {
                max_retries: usize::MAX,
                base_delay: self.retry_base,
                max_delay: self.retry_max.max(self.retry_base),
            },
        }
    }

    /// Property names from `GUMSYNC_SCHEMA_FILE`, or the defaults.
    pub fn property_names(&self) -> Result<PropertyNames> {
        match &self.schema_file {
            Some(path) => load_property_names(path),
            None => Ok(PropertyNames::default()),
        }
    }
}

pub fn load_property_names(path: &Path) -> Result<PropertyNames> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
