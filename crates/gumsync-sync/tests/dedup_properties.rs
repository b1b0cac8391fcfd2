use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, TimeZone, Utc};
use gumsync_adapters::InMemoryRecordStore;
use gumsync_core::{CustomerRecord, Money, ProductRef, RecordId};
use gumsync_sync::{deduplicate, plan_merges};
use proptest::prelude::*;

const EMAILS: [&str; 4] = ["a@example.com", "b@example.com", "c@example.com", "d@example.com"];
const PRODUCTS: [&str; 3] = ["Field Notes", "Sticker Pack", "Course"];

fn arb_records() -> impl Strategy<Value = Vec<CustomerRecord>> {
    let row = (
        0..EMAILS.len(),
        0i64..100_000,
        any::<bool>(),
        // Few distinct hours so identical creation times come up often.
        0u32..4,
        prop::collection::vec(0..PRODUCTS.len(), 0..3),
    );
    prop::collection::vec(row, 1..24).prop_map(|rows| {
        rows.into_iter()
            .enumerate()
            .map(|(i, (email, cents, subscribed, hour, products))| CustomerRecord {
                id: RecordId::new(format!("r-{i}")),
                email: EMAILS[email].to_string(),
                total_spent: Money::from_minor_units(cents),
                subscribed,
                purchased_products: products.into_iter().map(|p| ProductRef::new(PRODUCTS[p])).collect(),
                created_at: at(hour),
            })
            .collect()
    })
}

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 24, hour, 0, 0).single().unwrap()
}

fn seeded(records: &[CustomerRecord]) -> InMemoryRecordStore {
    let store = InMemoryRecordStore::new();
    for r in records {
        store.seed_record(r);
    }
    store
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime")
        .block_on(future)
}

proptest! {
    #[test]
    fn one_active_record_per_email(records in arb_records()) {
        let store = seeded(&records);
        let report = block_on(deduplicate(&store)).expect("dedup");

        let distinct: BTreeSet<&str> = records.iter().map(|r| r.email.as_str()).collect();
        let active = store.active_records();
        prop_assert_eq!(active.len(), distinct.len());
        prop_assert_eq!(store.archived_ids().len(), records.len() - distinct.len());
        prop_assert_eq!(report.archived, records.len() - distinct.len());
        prop_assert!(report.failures.is_empty());
    }

    #[test]
    fn survivor_carries_every_amount_and_product(records in arb_records()) {
        let store = seeded(&records);
        block_on(deduplicate(&store)).expect("dedup");

        let mut expected: BTreeMap<&str, (Money, usize)> = BTreeMap::new();
        for r in &records {
            let entry = expected.entry(r.email.as_str()).or_insert((Money::ZERO, 0));
            entry.0 += r.total_spent;
            entry.1 += r.purchased_products.len();
        }

        for survivor in store.active_records() {
            let (total, products) = expected[survivor.email.as_str()];
            prop_assert_eq!(survivor.total_spent, total);
            prop_assert_eq!(survivor.purchased_products.len(), products);
        }
    }

    #[test]
    fn survivor_is_a_newest_member(records in arb_records()) {
        for group in plan_merges(&records) {
            let newest = records
                .iter()
                .filter(|r| r.email == group.email)
                .map(|r| r.created_at)
                .max()
                .expect("non-empty group");
            prop_assert_eq!(group.survivor_created_at, newest);
            let survivor = records.iter().find(|r| r.id == group.survivor_id).expect("survivor");
            prop_assert_eq!(group.subscribed, survivor.subscribed);
            prop_assert!(!group.superseded_ids.contains(&group.survivor_id));
        }
    }

    #[test]
    fn second_run_is_a_no_op(records in arb_records()) {
        let store = seeded(&records);
        block_on(deduplicate(&store)).expect("first run");
        let before = store.active_records();
        let writes = (store.patch_count(), store.archive_count());

        let report = block_on(deduplicate(&store)).expect("second run");
        prop_assert_eq!(report.merged, 0);
        prop_assert_eq!(report.archived, 0);
        prop_assert_eq!((store.patch_count(), store.archive_count()), writes);
        prop_assert_eq!(store.active_records(), before);
    }
}
