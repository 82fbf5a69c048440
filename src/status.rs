//! Derived order status.
//!
//! Orders carry no status column; the coarse lifecycle status shown in
//! the console is derived from the item list on every read.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{parse_store_timestamp, value_str};

/// Coarse order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Processing,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "Pending",
            OrderStatus::Processing => "Processing",
            OrderStatus::Completed => "Completed",
            OrderStatus::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-item workflow state used only as derivation input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemState {
    Pending,
    Processing,
    Completed,
    Cancelled,
}

/// Map a free-text job status label to an item state. Workflow labels are
/// locale-specific; unrecognized labels stay pending.
fn map_status_label(label: &str) -> ItemState {
    match label.trim().to_lowercase().as_str() {
        "เสร็จสิ้น" | "completed" => ItemState::Completed,
        "ยกเลิก" | "cancelled" => ItemState::Cancelled,
        "กำลังดำเนินการ" | "processing" => ItemState::Processing,
        _ => ItemState::Pending,
    }
}

fn job_created_at(job: &Value) -> DateTime<Utc> {
    value_str(job, &["created_at", "createdAt"])
        .and_then(|s| parse_store_timestamp(&s))
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Item state: an explicit legacy `status` field wins; otherwise the
/// most-recently-created job's label decides; an item with no jobs is
/// pending.
fn item_state(item: &Value) -> ItemState {
    if let Some(explicit) = value_str(item, &["status"]) {
        return map_status_label(&explicit);
    }

    let jobs = item.get("jobs").and_then(Value::as_array);
    let latest = jobs.and_then(|jobs| jobs.iter().max_by_key(|job| job_created_at(job)));
    match latest {
        Some(job) => map_status_label(&value_str(job, &["status"]).unwrap_or_default()),
        None => ItemState::Pending,
    }
}

/// Derive the order status from its items.
///
/// Precedence matters: all-cancelled reads `Cancelled`; a mix of
/// completed and cancelled reads `Completed` (not `Processing`); a single
/// processing or completed item among pending ones promotes the order to
/// `Processing`; anything else - including zero items - is `Pending`.
pub fn derive_order_status(items: &[Value]) -> OrderStatus {
    if items.is_empty() {
        return OrderStatus::Pending;
    }

    let states: Vec<ItemState> = items.iter().map(item_state).collect();

    if states.iter().all(|s| *s == ItemState::Cancelled) {
        return OrderStatus::Cancelled;
    }
    if states
        .iter()
        .all(|s| matches!(s, ItemState::Completed | ItemState::Cancelled))
    {
        return OrderStatus::Completed;
    }
    if states
        .iter()
        .any(|s| matches!(s, ItemState::Processing | ItemState::Completed))
    {
        return OrderStatus::Processing;
    }
    OrderStatus::Pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item_with_job_status(status: &str) -> Value {
        json!({ "jobs": [{ "status": status, "created_at": "2026-01-10T08:00:00Z" }] })
    }

    #[test]
    fn test_zero_items_is_pending() {
        assert_eq!(derive_order_status(&[]), OrderStatus::Pending);
    }

    #[test]
    fn test_all_cancelled() {
        let items = vec![
            item_with_job_status("ยกเลิก"),
            item_with_job_status("cancelled"),
        ];
        assert_eq!(derive_order_status(&items), OrderStatus::Cancelled);
    }

    #[test]
    fn test_completed_and_cancelled_reads_completed() {
        let items = vec![
            item_with_job_status("เสร็จสิ้น"),
            item_with_job_status("ยกเลิก"),
        ];
        assert_eq!(derive_order_status(&items), OrderStatus::Completed);
    }

    #[test]
    fn test_single_processing_item_promotes_order() {
        let items = vec![
            item_with_job_status("รอดำเนินการ"),
            item_with_job_status("กำลังดำเนินการ"),
        ];
        assert_eq!(derive_order_status(&items), OrderStatus::Processing);
    }

    #[test]
    fn test_all_pending_stays_pending() {
        let items = vec![
            item_with_job_status("รอดำเนินการ"),
            item_with_job_status("รอดำเนินการ"),
        ];
        assert_eq!(derive_order_status(&items), OrderStatus::Pending);
    }

    #[test]
    fn test_unrecognized_label_defaults_to_pending() {
        let items = vec![item_with_job_status("รอวัดหน้างาน")];
        assert_eq!(derive_order_status(&items), OrderStatus::Pending);
    }

    #[test]
    fn test_explicit_item_status_wins_over_jobs() {
        let items = vec![json!({
            "status": "Completed",
            "jobs": [{ "status": "รอดำเนินการ", "created_at": "2026-01-10T08:00:00Z" }]
        })];
        assert_eq!(derive_order_status(&items), OrderStatus::Completed);
    }

    #[test]
    fn test_latest_job_decides() {
        let items = vec![json!({
            "jobs": [
                { "status": "เสร็จสิ้น", "created_at": "2026-01-01T08:00:00Z" },
                { "status": "ยกเลิก", "created_at": "2026-01-20T08:00:00Z" }
            ]
        })];
        assert_eq!(derive_order_status(&items), OrderStatus::Cancelled);
    }

    #[test]
    fn test_item_without_jobs_is_pending() {
        let items = vec![json!({ "remark": "no jobs yet" })];
        assert_eq!(derive_order_status(&items), OrderStatus::Pending);
    }
}
