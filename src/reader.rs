//! Order aggregate reader.
//!
//! Rebuilds the denormalized order view the console edits: one wide join
//! for the header and its relations, a separate authoritative fetch for
//! jobs, field normalization for form consumption, and the derived
//! status. Fetch failures never surface as errors - the reader returns
//! `None`/empty and leaves the details in the log.

use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::warn;

use crate::status::derive_order_status;
use crate::store::{Filter, OrderBy, StoreClient};
use crate::{display_offset, parse_store_timestamp, value_f64, value_str};

/// Wide join for the order detail view. Jobs are embedded here too, but
/// only as a fallback - see [`get_order_by_id`].
const ORDER_DETAIL_COLUMNS: &str = "*, \
    customer:customers(id, name, phone, email, line, facebook, instagram, \
        addresses:customer_addresses(*), contacts:customer_contacts(*), \
        taxInvoices:customer_tax_invoices(*)), \
    purchaserContact:customer_contacts!purchaser_contact_id(*), \
    receiverContact:customer_contacts!receiver_contact_id(*), \
    taxInvoice:customer_tax_invoices!tax_invoice_id(*), \
    taxInvoiceDeliveryAddress:customer_addresses!tax_invoice_delivery_address_id(*), \
    deliveryAddress:customer_addresses!delivery_address_id(*), \
    items:order_items(*, jobs(*, siteAddressRecord:location_id(*), \
        siteInspectorRecord:inspector_id(*)), \
        product:products(uuid, name, description, product_code), \
        variant:product_variants!product_variant_id(*)), \
    paymentSchedule:order_payments(*)";

/// Narrower join for the order list.
const ORDER_LIST_COLUMNS: &str = "*, \
    customer:customers!customer_id(id, name, phone, email), \
    purchaserContact:customer_contacts!purchaser_contact_id(*), \
    receiverContact:customer_contacts!receiver_contact_id(*), \
    taxInvoice:customer_tax_invoices!tax_invoice_id(*), \
    items:order_items(*, jobs(*, siteAddressRecord:location_id(*), \
        siteInspectorRecord:inspector_id(*)), \
        product:products(uuid, name, description, product_code), \
        variant:product_variants!product_variant_id(*)), \
    paymentSchedule:order_payments(*)";

const JOB_DETAIL_COLUMNS: &str =
    "*, siteAddressRecord:location_id(*), siteInspectorRecord:inspector_id(*)";

/// Fetch one order as the denormalized editing view. Returns `None` when
/// the order does not exist or the header fetch fails.
pub async fn get_order_by_id<S: StoreClient>(store: &S, id: &str) -> Option<Value> {
    let mut data = match store
        .select_one("orders", ORDER_DETAIL_COLUMNS, &[Filter::eq("id", id)])
        .await
    {
        Ok(row) => row,
        Err(err) => {
            warn!(order_id = id, error = %err, "order fetch failed");
            return None;
        }
    };

    // Jobs are fetched separately because the wide join is not trusted to
    // populate them consistently. The separate fetch is authoritative;
    // join-embedded jobs are only used for items it yielded nothing for.
    let all_jobs = match store
        .select(
            "jobs",
            JOB_DETAIL_COLUMNS,
            &[Filter::eq("order_id", id)],
            Some(&OrderBy::asc("created_at")),
        )
        .await
    {
        Ok(rows) => rows,
        Err(err) => {
            warn!(order_id = id, error = %err, "separate job fetch failed, falling back to joined data");
            Vec::new()
        }
    };

    let mut jobs_by_item: HashMap<String, Vec<Value>> = HashMap::new();
    for job in &all_jobs {
        if let Some(item_id) = value_str(job, &["order_item_id"]) {
            jobs_by_item
                .entry(item_key(&item_id))
                .or_default()
                .push(normalize_job(job));
        }
    }

    if let Some(items) = data.get_mut("items").and_then(Value::as_array_mut) {
        for item in items.iter_mut() {
            let key = value_str(item, &["id"])
                .map(|id| item_key(&id))
                .unwrap_or_default();
            let group = match jobs_by_item.get(&key) {
                Some(group) if !group.is_empty() => group.clone(),
                _ => item
                    .get("jobs")
                    .and_then(Value::as_array)
                    .map(|jobs| jobs.iter().map(normalize_job).collect())
                    .unwrap_or_default(),
            };
            item["jobs"] = Value::Array(group);
        }
    }

    // Address display strings are reassembled from components so stale
    // flattened strings in the store never win.
    for key in ["taxInvoiceDeliveryAddress", "deliveryAddress"] {
        let formatted = data.get(key).map(format_address);
        if let (Some(address), Some(Value::Object(obj))) = (formatted, data.get_mut(key)) {
            obj.insert("address".to_string(), json!(address));
        }
    }

    let normalized_tax_invoice = normalize_tax_invoice(data.get("taxInvoice"));

    let normalized_payments = data
        .get("paymentSchedule")
        .and_then(Value::as_array)
        .map(|entries| entries.iter().map(normalize_payment).collect::<Vec<Value>>());

    let items_for_status = data
        .get("items")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    if let Some(obj) = data.as_object_mut() {
        obj.insert("taxInvoice".to_string(), normalized_tax_invoice);
        if let Some(payments) = normalized_payments {
            obj.insert("paymentSchedule".to_string(), Value::Array(payments));
        }
        obj.insert("jobs".to_string(), Value::Array(all_jobs));
        obj.insert(
            "status".to_string(),
            json!(derive_order_status(&items_for_status).as_str()),
        );
    }

    Some(data)
}

/// Order list for the console overview. Empty on failure.
pub async fn get_orders<S: StoreClient>(store: &S) -> Vec<Value> {
    let rows = match store
        .select(
            "orders",
            ORDER_LIST_COLUMNS,
            &[],
            Some(&OrderBy::desc("created_at")),
        )
        .await
    {
        Ok(rows) => rows,
        Err(err) => {
            warn!(error = %err, "order list fetch failed");
            return Vec::new();
        }
    };
    rows.iter().map(summarize_order).collect()
}

/// Raw order rows for one customer's history, newest first.
pub async fn get_orders_by_customer_id<S: StoreClient>(store: &S, customer_id: &str) -> Vec<Value> {
    if customer_id.trim().is_empty() {
        return Vec::new();
    }
    match store
        .select(
            "orders",
            "*",
            &[Filter::eq("customer_id", customer_id)],
            Some(&OrderBy::desc("created_at")),
        )
        .await
    {
        Ok(rows) => rows,
        Err(err) => {
            warn!(customer_id, error = %err, "customer order history fetch failed");
            Vec::new()
        }
    }
}

/// Display number for the next order (row count + 1). Defaults to 1 when
/// the count is unavailable.
pub async fn next_order_id<S: StoreClient>(store: &S) -> i64 {
    match store.count("orders").await {
        Ok(count) => count + 1,
        Err(err) => {
            warn!(error = %err, "order count failed");
            1
        }
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Grouping key for an item id: the two job sources disagree on case and
/// stray whitespace, so both sides normalize before matching.
fn item_key(id: &str) -> String {
    id.trim()
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

/// Map a job row to the canonical editing shape: legacy column names to
/// camelCase fields, timestamps to datetime-local strings, the inspector
/// relation to a nested sub-object. The raw columns stay in place.
fn normalize_job(job: &Value) -> Value {
    let mut out = job.as_object().cloned().unwrap_or_default();
    let site = job.get("siteAddressRecord").cloned().unwrap_or(Value::Null);

    out.insert(
        "jobType".to_string(),
        json!(value_str(job, &["job_type", "jobType"]).unwrap_or_else(|| "installation".to_string())),
    );
    out.insert(
        "team".to_string(),
        json!(value_str(job, &["assigned_team", "team"]).unwrap_or_default()),
    );
    out.insert(
        "appointmentDate".to_string(),
        json!(format_date_for_input(
            &value_str(job, &["appointment_date", "appointmentDate"]).unwrap_or_default()
        )),
    );
    out.insert(
        "completionDate".to_string(),
        json!(format_date_for_input(
            &value_str(job, &["completion_date", "completionDate"]).unwrap_or_default()
        )),
    );
    // The console edits job notes under "description".
    out.insert(
        "description".to_string(),
        json!(value_str(job, &["notes", "description"]).unwrap_or_default()),
    );
    out.insert(
        "notes".to_string(),
        json!(value_str(job, &["notes"]).unwrap_or_default()),
    );
    out.insert(
        "teamPaymentId".to_string(),
        opt_json(value_str(
            job,
            &["teamPaymentId", "team_payment_id", "serviceFeeId", "team_payment_batch_id"],
        )),
    );
    out.insert(
        "serviceFeeId".to_string(),
        opt_json(value_str(job, &["team_payment_id", "serviceFeeId"])),
    );

    out.insert(
        "locationId".to_string(),
        opt_json(value_str(
            job,
            &["locationId", "location_id", "site_address_id", "installLocationId"],
        )),
    );
    out.insert(
        "installLocationId".to_string(),
        opt_json(value_str(job, &["location_id", "site_address_id", "installLocationId"])),
    );
    out.insert(
        "installLocationName".to_string(),
        json!(value_str(&site, &["label"])
            .or_else(|| value_str(job, &["install_location_name"]))
            .unwrap_or_default()),
    );
    let install_address = {
        let formatted = format_address(&site);
        if formatted.is_empty() {
            value_str(job, &["install_address"]).unwrap_or_default()
        } else {
            formatted
        }
    };
    out.insert("installAddress".to_string(), json!(install_address));
    out.insert(
        "googleMapLink".to_string(),
        json!(value_str(&site, &["maps", "google_maps_link"])
            .or_else(|| value_str(job, &["google_map_link"]))
            .unwrap_or_default()),
    );

    // Stored distances pass through; nothing is recomputed here.
    let distance = job
        .get("distance")
        .filter(|d| !d.is_null())
        .cloned()
        .or_else(|| site.get("distance").filter(|d| !d.is_null()).cloned())
        .unwrap_or_else(|| json!(""));
    out.insert("distance".to_string(), distance);

    let inspector = match job.get("siteInspectorRecord") {
        Some(Value::Object(rec)) => {
            let rec = Value::Object(rec.clone());
            json!({
                "id": rec.get("id").cloned().unwrap_or(Value::Null),
                "name": rec.get("name").cloned().unwrap_or(Value::Null),
                "phone": rec.get("phone").cloned().unwrap_or(Value::Null),
                "email": rec.get("email").cloned().unwrap_or(Value::Null),
                "line": opt_json(value_str(&rec, &["line", "lineId", "line_id"])),
                "position": rec.get("position").cloned().unwrap_or(Value::Null),
                "note": rec.get("note").cloned().unwrap_or(Value::Null),
            })
        }
        _ => Value::Null,
    };
    out.insert("inspector".to_string(), inspector);

    Value::Object(out)
}

/// The tax-invoice view must always expose a `company` display field,
/// whichever column held it.
fn normalize_tax_invoice(tax: Option<&Value>) -> Value {
    match tax {
        Some(Value::Object(obj)) => {
            let mut out = obj.clone();
            let as_value = Value::Object(obj.clone());
            out.insert(
                "company".to_string(),
                json!(value_str(&as_value, &["company", "companyName"]).unwrap_or_default()),
            );
            out.insert("address".to_string(), json!(format_address(&as_value)));
            Value::Object(out)
        }
        _ => Value::Null,
    }
}

fn normalize_payment(p: &Value) -> Value {
    let mut out = p.as_object().cloned().unwrap_or_default();
    out.insert("date".to_string(), opt_json(value_str(p, &["payment_date", "date"])));
    out.insert(
        "paymentMethod".to_string(),
        opt_json(value_str(p, &["payment_method", "paymentMethod"])),
    );
    out.insert(
        "type".to_string(),
        json!(value_str(p, &["payment_type", "type"]).unwrap_or_else(|| "deposit".to_string())),
    );
    out.insert("amount".to_string(), json!(value_f64(p, &["amount"]).unwrap_or(0.0)));
    out.insert("invoiceNo".to_string(), opt_json(value_str(p, &["invoice_no", "invoiceNo"])));
    out.insert(
        "invoiceDate".to_string(),
        opt_json(value_str(p, &["invoice_date", "invoiceDate"])),
    );
    out.insert("receiptNo".to_string(), opt_json(value_str(p, &["receipt_no", "receiptNo"])));
    out.insert(
        "receiptDate".to_string(),
        opt_json(value_str(p, &["receipt_date", "receiptDate"])),
    );
    out.insert("slip".to_string(), opt_json(value_str(p, &["proof_url", "slip"])));
    out.insert(
        "receiverSignature".to_string(),
        opt_json(value_str(p, &["receiver_signature", "receiverSignature"])),
    );
    out.insert(
        "payerSignature".to_string(),
        opt_json(value_str(p, &["payer_signature", "payerSignature"])),
    );
    out.insert(
        "status".to_string(),
        json!(value_str(p, &["status"]).unwrap_or_else(|| "Completed".to_string())),
    );
    Value::Object(out)
}

fn summarize_order(order: &Value) -> Value {
    let items = order
        .get("items")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let status = derive_order_status(&items);
    let customer = order.get("customer").cloned().unwrap_or(Value::Null);
    let customer_name =
        value_str(&customer, &["name"]).unwrap_or_else(|| "Unknown Customer".to_string());
    let first_job = items
        .first()
        .and_then(|item| item.get("jobs"))
        .and_then(Value::as_array)
        .and_then(|jobs| jobs.first())
        .cloned()
        .unwrap_or(Value::Null);

    let mut out = order.as_object().cloned().unwrap_or_default();
    out.insert(
        "customerId".to_string(),
        order.get("customer_id").cloned().unwrap_or(Value::Null),
    );
    out.insert(
        "date".to_string(),
        order.get("created_at").cloned().unwrap_or(Value::Null),
    );
    out.insert(
        "orderDate".to_string(),
        order.get("order_date").cloned().unwrap_or(Value::Null),
    );
    out.insert(
        "createdAt".to_string(),
        order.get("created_at").cloned().unwrap_or(Value::Null),
    );
    out.insert("status".to_string(), json!(status.as_str()));
    out.insert("customer".to_string(), json!(customer_name.clone()));
    out.insert("customerName".to_string(), json!(customer_name));
    out.insert(
        "customerPhone".to_string(),
        json!(value_str(&customer, &["phone"]).unwrap_or_default()),
    );
    out.insert(
        "customerEmail".to_string(),
        json!(value_str(&customer, &["email"]).unwrap_or_default()),
    );
    out.insert(
        "jobType".to_string(),
        json!(value_str(&first_job, &["job_type", "jobType"]).unwrap_or_else(|| "-".to_string())),
    );
    out.insert(
        "jobStatus".to_string(),
        json!(value_str(&first_job, &["status"]).unwrap_or_else(|| "-".to_string())),
    );
    out.insert("items".to_string(), Value::Array(items));
    out.insert(
        "total".to_string(),
        json!(value_f64(order, &["total"]).unwrap_or(0.0)),
    );
    Value::Object(out)
}

fn opt_json(value: Option<String>) -> Value {
    value.map(Value::String).unwrap_or(Value::Null)
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

/// Format a timestamp for a `datetime-local` input (`YYYY-MM-DDTHH:MM`).
/// Strings already in that shape pass through clipped; store timestamps
/// convert to console-local time. Unparseable input becomes empty.
fn format_date_for_input(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains('T') && trimmed.len() >= 16 {
        return trimmed.chars().take(16).collect();
    }
    match parse_store_timestamp(trimmed) {
        Some(parsed) => parsed
            .with_timezone(&display_offset())
            .format("%Y-%m-%dT%H:%M")
            .to_string(),
        None => String::new(),
    }
}

/// Reassemble a display address from components, tolerating both legacy
/// and current column names. Falls back to a flat `address` column.
fn format_address(addr: &Value) -> String {
    if !addr.is_object() {
        return String::new();
    }

    let mut parts: Vec<String> = Vec::new();
    let mut push_labeled = |label: &str, value: Option<String>| {
        if let Some(value) = value {
            if label.is_empty() {
                parts.push(value);
            } else {
                parts.push(format!("{label} {value}"));
            }
        }
    };

    push_labeled("เลขที่", value_str(addr, &["number", "addrNumber", "house_number"]));
    push_labeled("หมู่", value_str(addr, &["villageno", "addrMoo", "village_no"]));
    push_labeled("", value_str(addr, &["building", "village", "addrVillage"]));
    push_labeled("ซอย", value_str(addr, &["lane", "addrSoi", "soi"]));
    push_labeled("ถนน", value_str(addr, &["road", "addrRoad"]));
    push_labeled("ตำบล", value_str(addr, &["subdistrict", "sub_district", "addrTambon"]));
    push_labeled("อำเภอ", value_str(addr, &["district", "addrAmphoe"]));
    push_labeled("จังหวัด", value_str(addr, &["province", "addrProvince"]));
    push_labeled("", value_str(addr, &["zipcode", "addrZipcode", "postal_code", "postcode"]));

    if !parts.is_empty() {
        return parts.join(" ");
    }
    value_str(addr, &["address"]).unwrap_or_default()
}

// ===========================================================================
// Tests
// ===========================================================================
