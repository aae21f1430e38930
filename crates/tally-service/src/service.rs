//! Counter business policy over the sqlite store.
//!
//! Every write path runs inside a store transaction, so a read-modify-write
//! either lands whole or not at all. Read paths never create rows: an
//! unknown triple is `None` on the single path and a virtual zero on the
//! batch path.

use std::collections::BTreeMap;

use tally_core::{
    checked_increment, cover_requested_keys, now_utc, Counter, CounterDelta, CounterError,
};
use tally_store_sqlite::{CounterRows, SqliteCounterStore};

pub struct CounterService {
    store: SqliteCounterStore,
}

impl CounterService {
    #[must_use]
    pub fn new(store: SqliteCounterStore) -> Self {
        Self { store }
    }

    /// Looks up one counter. An absent triple is `Ok(None)`, never an error
    /// and never a freshly created row.
    pub fn get_counter(
        &self,
        site_id: &str,
        url: &str,
        key: &str,
    ) -> Result<Option<Counter>, CounterError> {
        self.store.find_one(site_id, url, key)
    }

    /// Reads every requested key in one query. Keys with no stored row come
    /// back as zero-valued counters that are never persisted.
    pub fn batch_get_counters(
        &self,
        site_id: &str,
        url: &str,
        keys: &[String],
    ) -> Result<BTreeMap<String, Counter>, CounterError> {
        let found = self.store.find_many(site_id, url, keys)?;
        Ok(cover_requested_keys(found, site_id, url, keys, now_utc()))
    }

    /// Sets a counter to an absolute value, creating the row if needed.
    pub fn upsert_counter(
        &mut self,
        site_id: &str,
        url: &str,
        key: &str,
        num: i64,
    ) -> Result<Counter, CounterError> {
        self.store
            .in_transaction(|rows| upsert_in(rows, site_id, url, key, num))
    }

    /// Adds a delta to a counter, creating the row at the delta value if it
    /// did not exist yet.
    pub fn increment_counter(
        &mut self,
        site_id: &str,
        url: &str,
        key: &str,
        delta: i64,
    ) -> Result<Counter, CounterError> {
        self.store
            .in_transaction(|rows| increment_in(rows, site_id, url, key, delta))
    }

    /// Applies a batch of increments in input order inside one transaction.
    /// Duplicate keys accumulate sequentially; the returned map holds the
    /// last computed state per key. Any failure rolls back every item.
    pub fn batch_increment_counters(
        &mut self,
        site_id: &str,
        url: &str,
        deltas: &[CounterDelta],
    ) -> Result<BTreeMap<String, Counter>, CounterError> {
        self.store.in_transaction(|rows| {
            let mut applied = BTreeMap::new();
            for delta in deltas {
                let counter = increment_in(rows, site_id, url, &delta.key, delta.increment)?;
                applied.insert(delta.key.clone(), counter);
            }
            Ok(applied)
        })
    }
}

fn upsert_in(
    rows: &CounterRows<'_>,
    site_id: &str,
    url: &str,
    key: &str,
    num: i64,
) -> Result<Counter, CounterError> {
    match rows.find_one(site_id, url, key)? {
        Some(mut counter) => {
            counter.num = num;
            rows.save(&counter)
        }
        None => rows.create(site_id, url, key, num),
    }
}

fn increment_in(
    rows: &CounterRows<'_>,
    site_id: &str,
    url: &str,
    key: &str,
    delta: i64,
) -> Result<Counter, CounterError> {
    match rows.find_one(site_id, url, key)? {
        Some(mut counter) => {
            counter.num = checked_increment(counter.num, delta, key)?;
            rows.save(&counter)
        }
        None => rows.create(site_id, url, key, delta),
    }
}
