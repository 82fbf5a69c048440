//! Invoice and receipt numbering.
//!
//! Sequences are allocated by a store-side counter function that is
//! monotonic per `(doc_type, year_month)` across concurrent callers.
//! The writer only requests a number for payment entries flagged to
//! issue a document that do not already carry one, so numbers are
//! generated exactly once per entry.

use chrono::{Datelike, Utc};
use serde_json::{json, Value};
use tracing::warn;

use crate::display_offset;
use crate::store::StoreClient;

pub const DOC_TYPE_INVOICE: &str = "IV";
pub const DOC_TYPE_RECEIPT: &str = "RC";

/// Year-month key for a document date, e.g. `"202608"`. Falls back to the
/// current console-local month when the date is missing or unparseable.
fn year_month_for(date: Option<&str>) -> String {
    let parsed = date
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(parse_year_month);
    match parsed {
        Some(ym) => ym,
        None => {
            let now = Utc::now().with_timezone(&display_offset());
            format!("{}{:02}", now.year(), now.month())
        }
    }
}

fn parse_year_month(date: &str) -> Option<String> {
    // Date strings arrive as "YYYY-MM-DD" or full timestamps; the leading
    // ten characters are enough either way.
    let prefix = date.get(..10)?;
    let mut parts = prefix.split('-');
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u32 = parts.next()?.parse().ok()?;
    if !(1..=12).contains(&month) {
        return None;
    }
    Some(format!("{year}{month:02}"))
}

pub(crate) fn format_document_number(doc_type: &str, year_month: &str, sequence: i64) -> String {
    format!("{doc_type}-{year_month}{sequence:05}")
}

/// Allocate and format the next document number, e.g. `"IV-20260800042"`.
/// Returns `None` on failure; the payment row is then saved without a
/// number and the next save retries.
pub async fn next_document_number<S: StoreClient>(
    store: &S,
    doc_type: &str,
    date: Option<&str>,
) -> Option<String> {
    let year_month = year_month_for(date);
    let result = store
        .rpc(
            "get_next_document_sequence",
            json!({ "doc_type": doc_type, "doc_year_month": year_month }),
        )
        .await;

    match result.map(|v| sequence_from(&v)) {
        Ok(Some(sequence)) => Some(format_document_number(doc_type, &year_month, sequence)),
        Ok(None) => {
            warn!(doc_type, year_month, "document sequence returned no number");
            None
        }
        Err(err) => {
            warn!(doc_type, year_month, error = %err, "document sequence allocation failed");
            None
        }
    }
}

fn sequence_from(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}
