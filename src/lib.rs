//! Lumen Ops - order aggregate sync core.
//!
//! Persists and reconstructs order aggregates (header, line items,
//! installation/delivery jobs, payment schedule) against the hosted
//! relational store's REST API. The store guarantees per-statement
//! atomicity only, so [`writer::save_order`] runs a fixed multi-step
//! sequence in which every step is individually idempotent and safe to
//! re-run after a partial failure. [`reader::get_order_by_id`] rebuilds
//! the denormalized order view the console edits.
//!
//! The store connection is an injected dependency: callers hand every
//! entry point a [`store::StoreClient`] (and, for saves, a
//! [`store::ObjectStore`]) instead of this crate holding a global client.

pub mod api;
pub mod documents;
pub mod ident;
pub mod reader;
pub mod retry;
pub mod settings;
pub mod status;
pub mod store;
pub mod uploads;
pub mod writer;

#[cfg(test)]
pub(crate) mod testutil;

pub use api::RestStore;
pub use reader::{get_order_by_id, get_orders, get_orders_by_customer_id};
pub use retry::{with_retry, RetryOptions};
pub use status::{derive_order_status, OrderStatus};
pub use store::{Filter, ObjectStore, OrderBy, StoreClient, StoreError};
pub use writer::{delete_order, save_order, DeleteError, SaveError};

/// First non-empty string found under any of `keys`, trimmed.
pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

pub(crate) fn value_f64(v: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_f64()) {
            return Some(n);
        }
        // Numeric columns round-trip through text inputs as strings.
        if let Some(n) = v
            .get(*key)
            .and_then(|x| x.as_str())
            .and_then(|s| s.trim().parse::<f64>().ok())
        {
            return Some(n);
        }
    }
    None
}

pub(crate) fn value_i64(v: &serde_json::Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_i64()) {
            return Some(n);
        }
    }
    None
}

pub(crate) fn value_bool(v: &serde_json::Value, keys: &[&str]) -> bool {
    for key in keys {
        if let Some(b) = v.get(*key).and_then(|x| x.as_bool()) {
            return b;
        }
    }
    false
}

/// Display timezone for the console (Asia/Bangkok, no DST).
pub(crate) fn display_offset() -> chrono::FixedOffset {
    use chrono::Offset;
    match chrono::FixedOffset::east_opt(7 * 3600) {
        Some(offset) => offset,
        // +07:00 is always in range; fall back to UTC rather than panic.
        None => chrono::Utc.fix(),
    }
}

/// Parse a store timestamp, tolerating RFC 3339, the store's
/// `"2026-01-10 08:00:00+00"` rendering, and the naive
/// `"2026-01-10T08:00"` strings datetime-local inputs produce (read as
/// console-local time).
pub(crate) fn parse_store_timestamp(s: &str) -> Option<chrono::DateTime<chrono::FixedOffset>> {
    use chrono::{DateTime, NaiveDateTime};

    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    let normalized = t.replacen(' ', "T", 1);
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(parsed);
    }
    for format in ["%Y-%m-%dT%H:%M:%S%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(parsed) = DateTime::parse_from_str(&normalized, format) {
            return Some(parsed);
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&normalized, format) {
            return naive.and_local_timezone(display_offset()).single();
        }
    }
    None
}

/// Array under any of `keys`, or an empty vec.
pub(crate) fn value_array(v: &serde_json::Value, keys: &[&str]) -> Vec<serde_json::Value> {
    for key in keys {
        if let Some(arr) = v.get(*key).and_then(|x| x.as_array()) {
            return arr.clone();
        }
    }
    Vec::new()
}
