//! Appending one record per new sale.

use chrono::{DateTime, Utc};
use gumsync_adapters::{RecordStore, SaleFeed};
use gumsync_core::{CustomerRecord, RecordId, SaleEvent};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{serialize_failures, SyncError};

#[derive(Debug, Default, Serialize)]
pub struct IngestReport {
    pub last_known: Option<DateTime<Utc>>,
    pub fetched: usize,
    pub already_seen: usize,
    pub created: Vec<RecordId>,
    #[serde(serialize_with = "serialize_failures")]
    pub failures: Vec<SyncError>,
}

pub fn latest_created_at(records: &[CustomerRecord]) -> Option<DateTime<Utc>> {
    records.iter().map(|r| r.created_at).max()
}

/// Keeps sales strictly newer than `last_known`, preserving feed order.
///
/// The feed filters by day only, so it re-serves sales from the day of
/// `last_known`; this drops them. Returns the kept sales and the drop count.
pub fn sales_after(sales: Vec<SaleEvent>, last_known: DateTime<Utc>) -> (Vec<SaleEvent>, usize) {
    let total = sales.len();
    let fresh: Vec<SaleEvent> = sales
        .into_iter()
        .filter(|s| s.created_at > last_known)
        .collect();
    let seen = total - fresh.len();
    (fresh, seen)
}

/// Creates one record per sale newer than the newest active record.
///
/// Fails with [`SyncError::EmptyStore`] when the store holds no readable
/// records. A failed create is reported and does not undo earlier creates.
pub async fn ingest(store: &dyn RecordStore, feed: &dyn SaleFeed) -> Result<IngestReport, SyncError> {
    let snapshot = store.query_all().await?;
    let last_known = latest_created_at(&snapshot.records).ok_or(SyncError::EmptyStore)?;

    let batch = feed.fetch_sales_since(last_known.date_naive()).await?;
    let fetched = batch.sales.len();
    let (fresh, already_seen) = sales_after(batch.sales, last_known);
    debug!(%last_known, fetched, already_seen, "sales filtered against newest record");

    let mut report = IngestReport {
        last_known: Some(last_known),
        fetched,
        already_seen,
        ..IngestReport::default()
    };
    report
        .failures
        .extend(batch.rejected.into_iter().map(SyncError::from));

    for sale in &fresh {
        match store.create_record(&sale.to_new_record()).await {
            Ok(id) => report.created.push(id),
            Err(source) => {
                warn!(email = %sale.buyer_email, error = %source, "record creation failed");
                report.failures.push(SyncError::CreateFailed {
                    email: sale.buyer_email.clone(),
                    source,
                });
            }
        }
    }

    info!(
        created = report.created.len(),
        failures = report.failures.len(),
        "ingestion finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use gumsync_adapters::{InMemoryRecordStore, StaticSaleFeed};
    use gumsync_core::{Money, ProductRef};

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, day, hour, 0, 0).single().unwrap()
    }

    fn sale(email: &str, cents: i64, created_at: DateTime<Utc>) -> SaleEvent {
        SaleEvent {
            price: Money::from_minor_units(cents),
            product_name: "Field Notes".into(),
            buyer_email: email.into(),
            can_contact: true,
            created_at,
        }
    }

    fn store_with_newest(created_at: DateTime<Utc>) -> InMemoryRecordStore {
        let store = InMemoryRecordStore::new();
        store.seed_record(&CustomerRecord {
            id: RecordId::new("seed"),
            email: "seed@example.com".into(),
            total_spent: Money::from_minor_units(100),
            subscribed: false,
            purchased_products: vec![ProductRef::new("Sticker Pack")],
            created_at,
        });
        store
    }

    #[test]
    fn sales_on_the_same_day_but_not_newer_are_dropped() {
        let last = at(24, 12);
        let (fresh, seen) = sales_after(
            vec![
                sale("a@example.com", 100, at(24, 9)),
                sale("b@example.com", 100, last),
                sale("c@example.com", 100, at(24, 13)),
            ],
            last,
        );
        assert_eq!(seen, 2);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].buyer_email, "c@example.com");
    }

    #[tokio::test]
    async fn empty_store_is_refused_before_fetching() {
        let store = InMemoryRecordStore::new();
        let feed = StaticSaleFeed::new(vec![sale("a@example.com", 1999, at(24, 13))]);
        let err = ingest(&store, &feed).await.unwrap_err();
        assert!(matches!(err, SyncError::EmptyStore));
        assert!(store.active_records().is_empty());
    }

    #[tokio::test]
    async fn new_sale_becomes_record_with_major_unit_price() {
        let store = store_with_newest(at(24, 12));
        let feed = StaticSaleFeed::new(vec![sale("a@example.com", 1999, at(24, 13))]);

        let report = ingest(&store, &feed).await.expect("ingest");
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.last_known, Some(at(24, 12)));

        let created = store
            .active_records()
            .into_iter()
            .find(|r| r.id == report.created[0])
            .expect("created record");
        assert_eq!(created.total_spent.as_major_units(), 19.99);
        assert_eq!(created.email, "a@example.com");
        assert!(created.subscribed);
        assert_eq!(created.purchased_products, vec![ProductRef::new("Field Notes")]);
    }

    #[tokio::test]
    async fn creates_follow_feed_order_and_failures_do_not_stop_the_rest() {
        let store = store_with_newest(at(24, 12));
        store.fail_creates_for("b@example.com");
        let feed = StaticSaleFeed::new(vec![
            sale("a@example.com", 100, at(24, 13)),
            sale("b@example.com", 200, at(24, 14)),
            sale("c@example.com", 300, at(25, 9)),
            sale("old@example.com", 300, at(23, 9)),
        ]);

        let report = ingest(&store, &feed).await.expect("ingest");
        assert_eq!(report.fetched, 3);
        assert_eq!(report.created.len(), 2);
        assert!(matches!(
            &report.failures[..],
            [SyncError::CreateFailed { email, .. }] if email == "b@example.com"
        ));

        let emails: Vec<String> = store.active_records().into_iter().map(|r| r.email).collect();
        assert_eq!(emails, vec!["seed@example.com", "a@example.com", "c@example.com"]);

        let json = serde_json::to_value(&report).expect("json");
        assert_eq!(json["created"].as_array().map(Vec::len), Some(2));
        let failure = json["failures"][0].as_str().expect("failure message");
        assert!(failure.contains("b@example.com"));
    }

    #[tokio::test]
    async fn unreachable_store_surfaces_as_transient() {
        let store = store_with_newest(at(24, 12));
        store.set_unavailable(true);
        let feed = StaticSaleFeed::default();
        let err = ingest(&store, &feed).await.unwrap_err();
        assert!(err.is_transient());
    }
}
