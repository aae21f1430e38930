use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CounterError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// One counter row. The (`site_id`, `url`, `key`) triple is the business key;
/// `id` is the storage rowid and stays `None` until the row is persisted.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Counter {
    pub id: Option<i64>,
    pub site_id: String,
    pub url: String,
    pub key: String,
    pub num: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Counter {
    /// An in-memory zero-valued counter for a triple with no stored row.
    /// Read paths synthesize these instead of creating rows.
    #[must_use]
    pub fn virtual_zero(site_id: &str, url: &str, key: &str, as_of: OffsetDateTime) -> Self {
        Self {
            id: None,
            site_id: site_id.to_string(),
            url: url.to_string(),
            key: key.to_string(),
            num: 0,
            created_at: as_of,
            updated_at: as_of,
        }
    }

    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}

/// One item of a batch increment request, applied in input order.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CounterDelta {
    pub key: String,
    pub increment: i64,
}

/// Validates the identifying triple for a single-counter operation.
///
/// # Errors
/// Returns [`CounterError::Validation`] when any identifier is empty.
pub fn validate_triple(site_id: &str, url: &str, key: &str) -> Result<(), CounterError> {
    validate_site_page(site_id, url)?;
    if key.trim().is_empty() {
        return Err(CounterError::Validation("key must not be empty".to_string()));
    }
    Ok(())
}

/// Validates the site/page pair shared by every batch operation.
///
/// # Errors
/// Returns [`CounterError::Validation`] when either identifier is empty.
pub fn validate_site_page(site_id: &str, url: &str) -> Result<(), CounterError> {
    if site_id.trim().is_empty() {
        return Err(CounterError::Validation("siteid must not be empty".to_string()));
    }
    if url.trim().is_empty() {
        return Err(CounterError::Validation("url must not be empty".to_string()));
    }
    Ok(())
}

/// Validates the key set of a batch lookup.
///
/// # Errors
/// Returns [`CounterError::Validation`] when any requested key is empty.
pub fn validate_keys(keys: &[String]) -> Result<(), CounterError> {
    for key in keys {
        if key.trim().is_empty() {
            return Err(CounterError::Validation(
                "keys must not contain empty entries".to_string(),
            ));
        }
    }
    Ok(())
}

/// Validates the items of a batch increment.
///
/// # Errors
/// Returns [`CounterError::Validation`] when any item has an empty key.
pub fn validate_deltas(deltas: &[CounterDelta]) -> Result<(), CounterError> {
    for delta in deltas {
        if delta.key.trim().is_empty() {
            return Err(CounterError::Validation(
                "counters must not contain entries with an empty key".to_string(),
            ));
        }
    }
    Ok(())
}

/// Adds `delta` to a counter value, refusing to wrap around.
///
/// # Errors
/// Returns [`CounterError::Validation`] on signed 64-bit overflow.
pub fn checked_increment(num: i64, delta: i64, key: &str) -> Result<i64, CounterError> {
    num.checked_add(delta)
        .ok_or_else(|| CounterError::Validation(format!("counter overflow for key {key}")))
}

/// Completes a batch lookup result: every requested key with no stored row
/// gets a virtual zero counter, so the mapping covers exactly the request.
#[must_use]
pub fn cover_requested_keys(
    found: Vec<Counter>,
    site_id: &str,
    url: &str,
    keys: &[String],
    as_of: OffsetDateTime,
) -> BTreeMap<String, Counter> {
    let mut result = BTreeMap::new();
    for counter in found {
        result.insert(counter.key.clone(), counter);
    }
    for key in keys {
        if !result.contains_key(key) {
            result.insert(key.clone(), Counter::virtual_zero(site_id, url, key, as_of));
        }
    }
    result
}

/// Parses an RFC3339 timestamp stored by the counter store.
///
/// # Errors
/// Returns [`CounterError::Storage`] when parsing fails; stored timestamps
/// are written by the store and never user-supplied.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, CounterError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map(|parsed| parsed.to_offset(UtcOffset::UTC))
        .map_err(|err| CounterError::Storage(format!("invalid stored timestamp: {err}")))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`CounterError::Storage`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, CounterError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| CounterError::Storage(format!("failed to format timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
