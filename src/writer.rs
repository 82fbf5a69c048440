//! Order aggregate writer.
//!
//! Persists the denormalized order object the console submits across four
//! tables (`orders`, `order_items`, `jobs`, `order_payments`) plus the
//! job/service-fee link table, in a fixed sequence. The store has no
//! multi-statement transactions: a failure aborts the remaining steps but
//! never undoes prior ones, so a failed save is "possibly partially
//! applied". Every step upserts or replaces by stable identifiers, which
//! makes a re-save converge instead of duplicating rows.
//!
//! Step order (later steps depend on identifiers produced earlier):
//! signature uploads -> header upsert -> item upsert -> orphan item
//! pruning -> job upsert -> orphan job pruning -> service-fee links ->
//! payment schedule replace.

use chrono::{SecondsFormat, Utc};
use futures::future::join_all;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::documents::{self, DOC_TYPE_INVOICE, DOC_TYPE_RECEIPT};
use crate::ident;
use crate::retry::{with_retry, RetryOptions};
use crate::store::{Filter, ObjectStore, StoreClient, StoreError};
use crate::uploads;
use crate::{value_array, value_bool, value_f64, value_i64, value_str};

/// Workflow label for a freshly synthesized job.
pub const DEFAULT_JOB_STATUS: &str = "รอดำเนินการ";

/// Save failure surfaced to the console. Constraint classes carry fixed
/// localized messages; everything else keeps the store's message for
/// diagnostics.
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error("ข้อมูลลูกค้า ผู้ติดต่อ หรือที่อยู่ไม่ถูกต้อง กรุณาตรวจสอบข้อมูล")]
    InvalidOrderReferences,
    #[error("เลขที่ออเดอร์ซ้ำ กรุณาใช้เลขที่อื่น")]
    DuplicateOrderNumber,
    #[error("ข้อมูลสินค้าไม่ถูกต้อง กรุณาเลือกสินค้าใหม่")]
    InvalidItemReferences,
    #[error("บันทึกออเดอร์ไม่สำเร็จ: {0}")]
    Header(String),
    #[error("บันทึกรายการสินค้าไม่สำเร็จ: {0}")]
    Items(String),
    #[error("บันทึกใบงานไม่สำเร็จ: {0}")]
    Jobs(String),
    #[error("บันทึกข้อมูลการชำระเงินไม่สำเร็จ: {0}")]
    Payments(String),
}

impl SaveError {
    fn header(err: StoreError) -> Self {
        match err {
            StoreError::ForeignKey(_) => SaveError::InvalidOrderReferences,
            StoreError::Unique(_) => SaveError::DuplicateOrderNumber,
            other => SaveError::Header(other.to_string()),
        }
    }

    fn items(err: StoreError) -> Self {
        match err {
            StoreError::ForeignKey(_) => SaveError::InvalidItemReferences,
            other => SaveError::Items(other.to_string()),
        }
    }
}

/// Persist one order aggregate. Returns the store-resolved order id.
///
/// The incoming object is the console's denormalized shape; every field
/// is treated as optionally absent and legacy key aliases are accepted.
/// See the module docs for the step sequence and partial-failure window.
pub async fn save_order<S, B>(store: &S, objects: &B, order: &Value) -> Result<String, SaveError>
where
    S: StoreClient,
    B: ObjectStore,
{
    // 1. Replace inline signature payloads with uploaded URLs. Failed
    // uploads degrade to null instead of aborting the save.
    let payment_schedule = upload_payment_signatures(objects, order).await;

    // 2-3. Header upsert. Only this statement runs under retry: it is
    // idempotent by primary key and nothing depends on it mid-flight.
    // Order ids always come from the store's generator, so the strict
    // check applies; anything else takes the insert path.
    let incoming_id = value_str(order, &["id"]);
    let existing_id = incoming_id.filter(|id| ident::is_store_identifier(id));
    let header_payload = build_order_payload(order, existing_id.as_deref());

    let saved = with_retry("save_order:upsert_header", RetryOptions::default(), || {
        let payload = header_payload.clone();
        async move { store.upsert("orders", Value::Array(vec![payload])).await }
    })
    .await
    .map_err(SaveError::header)?;

    let order_id = saved
        .first()
        .and_then(|row| value_str(row, &["id"]))
        .ok_or_else(|| SaveError::Header("store returned no order row".to_string()))?;
    debug!(order_id = %order_id, new = existing_id.is_none(), "order header saved");

    // 4. No item list at all: a brand-new order may be saved before any
    // items exist. An explicit empty list instead means "remove them all"
    // and falls through to the pruning step.
    let items = match order.get("items").and_then(Value::as_array) {
        Some(items) => items.clone(),
        None => return Ok(order_id),
    };

    // 5. Final item ids are assigned before the upsert so jobs can
    // reference their parent in the same save.
    let items_with_ids: Vec<(String, Value)> = items
        .iter()
        .map(|item| {
            let id = ident::resolve_field(item, &["id", "uuid"])
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            (id, item.clone())
        })
        .collect();

    // 6-7. Item batch upsert.
    if !items_with_ids.is_empty() {
        let items_payload: Vec<Value> = items_with_ids
            .iter()
            .map(|(id, item)| build_item_payload(item, id, &order_id))
            .collect();
        store
            .upsert("order_items", Value::Array(items_payload))
            .await
            .map_err(SaveError::items)?;
    }

    // 8. Orphan pruning is non-critical: a failure leaves stale rows, not
    // corrupt live data, so it is logged and the save continues.
    let kept_ids: Vec<String> = items_with_ids.iter().map(|(id, _)| id.clone()).collect();
    if let Err(err) = prune_orphan_items(store, &order_id, &kept_ids).await {
        warn!(order_id = %order_id, error = %err, "orphan item cleanup failed, stale rows may remain");
    }

    // 9-10. Jobs. Every item ends up with at least one job; a default
    // installation job is synthesized when the console sent none.
    let mut jobs_payload: Vec<Value> = Vec::new();
    for (item_id, item) in &items_with_ids {
        let mut item_jobs = value_array(item, &["jobs"]);
        if item_jobs.is_empty() {
            item_jobs.push(json!({
                "jobType": "installation",
                "status": DEFAULT_JOB_STATUS,
                "sequence_number": 1
            }));
        }
        for job in &item_jobs {
            jobs_payload.push(build_job_payload(job, item_id, &order_id));
        }
    }

    let mut created_jobs: Vec<Value> = Vec::new();
    if !jobs_payload.is_empty() {
        created_jobs = store
            .upsert("jobs", Value::Array(jobs_payload.clone()))
            .await
            .map_err(|e| SaveError::Jobs(e.to_string()))?;
    }

    // 11. Orphan jobs are pruned across the whole order, not per item:
    // jobs may in principle move between items of the same order.
    let current_job_ids: Vec<String> = jobs_payload
        .iter()
        .filter_map(|job| value_str(job, &["id"]))
        .collect();
    if !current_job_ids.is_empty() {
        let filters = [
            Filter::eq("order_id", order_id.as_str()),
            Filter::none_of("id", current_job_ids),
        ];
        if let Err(err) = store.delete("jobs", &filters).await {
            warn!(order_id = %order_id, error = %err, "orphan job cleanup failed, stale rows may remain");
        }
    }

    // 12. Link jobs to their service-fee batch, ignoring duplicates.
    let links: Vec<Value> = created_jobs
        .iter()
        .filter_map(|job| {
            let batch = value_str(job, &["team_payment_id"])?;
            let job_id = value_str(job, &["id"])?;
            Some(json!({ "service_fee_id": batch, "job_id": job_id }))
        })
        .collect();
    if !links.is_empty() {
        if let Err(err) = store
            .upsert_ignore_duplicates("team_service_fee_jobs", Value::Array(links), "service_fee_id, job_id")
            .await
        {
            warn!(order_id = %order_id, error = %err, "service fee link upsert failed");
        }
    }

    // 13. Payment schedule is replaced wholesale: entries have no stable
    // identity across edits, so diffing is not possible. The delete must
    // succeed before inserting or entries would duplicate.
    store
        .delete("order_payments", &[Filter::eq("order_id", order_id.as_str())])
        .await
        .map_err(|e| SaveError::Payments(e.to_string()))?;

    if !payment_schedule.is_empty() {
        let mut payments_payload: Vec<Value> = Vec::with_capacity(payment_schedule.len());
        for entry in &payment_schedule {
            payments_payload.push(build_payment_payload(store, entry, &order_id).await);
        }
        store
            .insert("order_payments", Value::Array(payments_payload))
            .await
            .map_err(|e| SaveError::Payments(e.to_string()))?;
    }

    info!(order_id = %order_id, items = items_with_ids.len(), "order aggregate saved");
    Ok(order_id)
}

/// Delete failure surfaced to the console.
#[derive(Debug, thiserror::Error)]
pub enum DeleteError {
    #[error("ไม่สามารถลบได้เนื่องจากมีข้อมูลที่เกี่ยวข้อง")]
    HasDependencies,
    #[error("ลบไม่สำเร็จ: {0}")]
    Store(String),
}

/// Delete one order and everything it owns, children first.
pub async fn delete_order<S: StoreClient>(store: &S, order_id: &str) -> Result<(), DeleteError> {
    let as_store = |e: StoreError| DeleteError::Store(e.to_string());

    let jobs = store
        .select("jobs", "id", &[Filter::eq("order_id", order_id)], None)
        .await
        .map_err(as_store)?;
    let job_ids = collect_ids(&jobs);
    if !job_ids.is_empty() {
        store
            .delete("team_service_fee_jobs", &[Filter::any_of("job_id", job_ids.clone())])
            .await
            .map_err(as_store)?;
        store
            .delete("job_completions", &[Filter::any_of("job_id", job_ids)])
            .await
            .map_err(as_store)?;
    }

    store
        .delete("jobs", &[Filter::eq("order_id", order_id)])
        .await
        .map_err(as_store)?;
    store
        .delete("order_payments", &[Filter::eq("order_id", order_id)])
        .await
        .map_err(as_store)?;
    store
        .delete("order_items", &[Filter::eq("order_id", order_id)])
        .await
        .map_err(as_store)?;

    store
        .delete("orders", &[Filter::eq("id", order_id)])
        .await
        .map_err(|e| match e {
            StoreError::ForeignKey(_) => DeleteError::HasDependencies,
            other => DeleteError::Store(other.to_string()),
        })?;

    info!(order_id, "order deleted");
    Ok(())
}

// ---------------------------------------------------------------------------
// Signature uploads
// ---------------------------------------------------------------------------

/// Upload every inline signature in the payment schedule, fan-out across
/// entries, and return the schedule with payloads replaced by URLs.
async fn upload_payment_signatures<B: ObjectStore>(objects: &B, order: &Value) -> Vec<Value> {
    let entries = value_array(order, &["paymentSchedule", "payment_schedule"]);
    if entries.is_empty() {
        return entries;
    }
    let order_ref = value_str(order, &["id"]).unwrap_or_else(|| "draft".to_string());

    let tasks = entries.into_iter().enumerate().map(|(index, mut entry)| {
        let order_ref = order_ref.clone();
        async move {
            let receiver = value_str(&entry, &["receiverSignature", "receiver_signature"]);
            let payer = value_str(&entry, &["payerSignature", "payer_signature"]);
            let (receiver_url, payer_url) = tokio::join!(
                async {
                    match receiver {
                        Some(payload) => {
                            uploads::upload_signature(objects, &payload, &order_ref, index, "receiver").await
                        }
                        None => None,
                    }
                },
                async {
                    match payer {
                        Some(payload) => {
                            uploads::upload_signature(objects, &payload, &order_ref, index, "payer").await
                        }
                        None => None,
                    }
                },
            );
            if let Some(obj) = entry.as_object_mut() {
                obj.insert("receiverSignature".to_string(), opt_string(receiver_url));
                obj.insert("payerSignature".to_string(), opt_string(payer_url));
            }
            entry
        }
    });
    join_all(tasks).await
}

// ---------------------------------------------------------------------------
// Payload builders
// ---------------------------------------------------------------------------

fn opt_string(value: Option<String>) -> Value {
    value.map(Value::String).unwrap_or(Value::Null)
}

fn string_or_null(v: &Value, keys: &[&str]) -> Value {
    opt_string(value_str(v, keys))
}

fn reference_or_null(order: &Value, key: &str) -> Value {
    opt_string(order.get(key).and_then(ident::resolve_reference))
}

fn collect_ids(rows: &[Value]) -> Vec<String> {
    rows.iter().filter_map(|row| value_str(row, &["id"])).collect()
}

/// Header row. Omitting `id` puts the upsert on the insert path and the
/// store assigns one.
fn build_order_payload(order: &Value, existing_id: Option<&str>) -> Value {
    let mut payload = Map::new();
    if let Some(id) = existing_id {
        payload.insert("id".to_string(), json!(id));
    }

    payload.insert("customer_id".to_string(), reference_or_null(order, "customer"));
    payload.insert(
        "purchaser_contact_id".to_string(),
        reference_or_null(order, "purchaserContact"),
    );
    payload.insert(
        "receiver_contact_id".to_string(),
        reference_or_null(order, "receiverContact"),
    );
    payload.insert("tax_invoice_id".to_string(), reference_or_null(order, "taxInvoice"));
    payload.insert(
        "tax_invoice_delivery_address_id".to_string(),
        reference_or_null(order, "taxInvoiceDeliveryAddress"),
    );
    payload.insert(
        "delivery_address_id".to_string(),
        reference_or_null(order, "deliveryAddress"),
    );

    payload.insert("order_date".to_string(), opt_string(order_date(order)));
    payload.insert(
        "total".to_string(),
        json!(value_f64(order, &["total"]).unwrap_or(0.0)),
    );
    payload.insert(
        "shipping_fee".to_string(),
        json!(value_f64(order, &["shippingFee", "shipping_fee"]).unwrap_or(0.0)),
    );
    payload.insert("vat_rate".to_string(), json!(0.07));

    let job_type = order
        .get("jobInfo")
        .map(|info| value_str(info, &["job_type", "jobType"]))
        .unwrap_or(None);
    payload.insert("job_type".to_string(), opt_string(job_type));

    let discount = order.get("discount").cloned().unwrap_or(Value::Null);
    payload.insert(
        "discount_mode".to_string(),
        json!(value_str(&discount, &["mode"]).unwrap_or_else(|| "percent".to_string())),
    );
    payload.insert(
        "discount_value".to_string(),
        json!(value_f64(&discount, &["value"]).unwrap_or(0.0)),
    );

    Value::Object(payload)
}

/// Date-only order date; full timestamps are cut to their date part.
fn order_date(order: &Value) -> Option<String> {
    let raw = value_str(order, &["date", "orderDate", "order_date"])?;
    if raw.len() > 10 && raw.as_bytes().get(10) == Some(&b'T') {
        return Some(raw[..10].to_string());
    }
    Some(raw)
}

fn build_item_payload(item: &Value, final_id: &str, order_id: &str) -> Value {
    // Items picked from the catalog may be keyed by a human product code
    // rather than an identifier; the selected variant still knows its
    // product row.
    let product_identifier = value_str(item, &["product_id", "uuid", "id"]);
    let product_id = match product_identifier {
        Some(pid) if ident::is_identifier(&pid) => Some(pid),
        _ => item
            .get("selectedVariant")
            .and_then(|variant| variant.get("product_id"))
            .and_then(ident::resolve_reference),
    };

    let variant_id = item
        .get("selectedVariant")
        .and_then(ident::resolve_reference)
        .or_else(|| ident::resolve_field(item, &["variant_id", "variantId", "product_variant_id"]));

    let quantity = value_f64(item, &["qty", "quantity"])
        .filter(|qty| *qty > 0.0)
        .unwrap_or(1.0);

    json!({
        "id": final_id,
        "order_id": order_id,
        "product_id": opt_string(product_id),
        "product_variant_id": opt_string(variant_id),
        "quantity": quantity,
        "unit_price": value_f64(item, &["unitPrice", "unit_price", "price"]).unwrap_or(0.0),
        "remark": string_or_null(item, &["remark"]),
        "light": string_or_null(item, &["light", "bulbType", "bulb_type"]),
        "light_color": string_or_null(item, &["lightColor", "light_color"]),
        "remote": string_or_null(item, &["remote"]),
    })
}

fn build_job_payload(job: &Value, item_id: &str, order_id: &str) -> Value {
    let inspector_id = job
        .get("inspector")
        .and_then(ident::resolve_reference)
        .or_else(|| ident::resolve_field(job, &["inspectorId"]))
        .or_else(|| job.get("inspector1").and_then(ident::resolve_reference))
        .or_else(|| ident::resolve_field(job, &["site_inspector_id", "inspector_id"]));

    let mut payload = json!({
        "id": ident::resolve_field(job, &["id"]).unwrap_or_else(|| Uuid::new_v4().to_string()),
        "order_item_id": item_id,
        "order_id": order_id,
        "job_type": value_str(job, &["jobType", "job_type"]).unwrap_or_else(|| "installation".to_string()),
        "status": value_str(job, &["status"]).unwrap_or_else(|| DEFAULT_JOB_STATUS.to_string()),
        "team": string_or_null(job, &["team", "assigned_team", "assignedTeam"]),
        "appointment_date": string_or_null(job, &["appointmentDate", "appointment_date"]),
        "completion_date": string_or_null(job, &["completionDate", "completion_date"]),
        "notes": string_or_null(job, &["notes", "description"]),
        "location_id": opt_string(ident::resolve_field(
            job,
            &["locationId", "installLocationId", "site_address_id", "location_id"],
        )),
        "inspector_id": opt_string(inspector_id),
        "team_payment_id": opt_string(ident::resolve_field(
            job,
            &["teamPaymentId", "serviceFeeId", "team_payment_batch_id", "team_payment_id"],
        )),
        "created_at": value_str(job, &["created_at", "createdAt"])
            .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
    });
    if let Some(sequence) = value_i64(job, &["sequence_number", "sequenceNumber"]) {
        payload["sequence_number"] = json!(sequence);
    }
    payload
}

async fn build_payment_payload<S: StoreClient>(store: &S, entry: &Value, order_id: &str) -> Value {
    let date = value_str(entry, &["date", "payment_date"]);

    // Document numbers are generated once per entry: an entry that
    // already carries one keeps it.
    let mut invoice_no = value_str(entry, &["invoiceNo", "invoice_no"]);
    let invoice_date = value_str(entry, &["invoiceDate", "invoice_date"]);
    if invoice_no.is_none() && value_bool(entry, &["issueInvoice", "issue_invoice"]) {
        invoice_no = documents::next_document_number(
            store,
            DOC_TYPE_INVOICE,
            invoice_date.as_deref().or(date.as_deref()),
        )
        .await;
    }

    let mut receipt_no = value_str(entry, &["receiptNo", "receipt_no"]);
    let receipt_date = value_str(entry, &["receiptDate", "receipt_date"]);
    if receipt_no.is_none() && value_bool(entry, &["issueReceipt", "issue_receipt"]) {
        receipt_no = documents::next_document_number(
            store,
            DOC_TYPE_RECEIPT,
            receipt_date.as_deref().or(date.as_deref()),
        )
        .await;
    }

    let payment_type =
        value_str(entry, &["type", "payment_type"]).unwrap_or_else(|| "deposit".to_string());

    let invoice_date_final = invoice_date.or_else(|| invoice_no.as_ref().and_then(|_| date.clone()));
    let receipt_date_final = receipt_date.or_else(|| receipt_no.as_ref().and_then(|_| date.clone()));

    json!({
        "order_id": order_id,
        "payment_date": opt_string(date),
        "amount": value_f64(entry, &["amount"]).unwrap_or(0.0),
        "payment_method": string_or_null(entry, &["method", "paymentMethod", "payment_method"]),
        "payment_type": payment_type,
        "proof_url": string_or_null(entry, &["proofUrl", "proof_url", "slip"]),
        "receiver_signature": string_or_null(entry, &["receiverSignature", "receiver_signature"]),
        "payer_signature": string_or_null(entry, &["payerSignature", "payer_signature"]),
        "status": value_str(entry, &["status"]).unwrap_or_else(|| "Completed".to_string()),
        "is_deposit": payment_type == "deposit",
        "invoice_no": opt_string(invoice_no),
        "invoice_date": opt_string(invoice_date_final),
        "receipt_no": opt_string(receipt_no),
        "receipt_date": opt_string(receipt_date_final),
    })
}

// ---------------------------------------------------------------------------
// Orphan pruning
// ---------------------------------------------------------------------------

/// Remove item rows whose id is absent from the just-written set, with
/// their dependent jobs and service-fee links. The store rejects
/// `not.in` deletes with large lists, so existing ids are fetched and
/// diffed in process instead.
async fn prune_orphan_items<S: StoreClient>(
    store: &S,
    order_id: &str,
    kept: &[String],
) -> Result<(), StoreError> {
    if kept.is_empty() {
        // Complete wipe: the incoming order no longer has any items.
        let jobs = store
            .select("jobs", "id", &[Filter::eq("order_id", order_id)], None)
            .await?;
        let job_ids = collect_ids(&jobs);
        if !job_ids.is_empty() {
            store
                .delete("team_service_fee_jobs", &[Filter::any_of("job_id", job_ids.clone())])
                .await?;
            store.delete("jobs", &[Filter::any_of("id", job_ids)]).await?;
        }
        store
            .delete("order_items", &[Filter::eq("order_id", order_id)])
            .await?;
        return Ok(());
    }

    let existing = store
        .select("order_items", "id", &[Filter::eq("order_id", order_id)], None)
        .await?;
    let orphan_ids: Vec<String> = collect_ids(&existing)
        .into_iter()
        .filter(|id| !kept.contains(id))
        .collect();
    if orphan_ids.is_empty() {
        return Ok(());
    }
    debug!(order_id, count = orphan_ids.len(), "pruning orphan items");

    // Children first: service-fee links, then jobs, then the item rows.
    let dependent = store
        .select(
            "jobs",
            "id",
            &[Filter::any_of("order_item_id", orphan_ids.clone())],
            None,
        )
        .await?;
    let dependent_job_ids = collect_ids(&dependent);
    if !dependent_job_ids.is_empty() {
        store
            .delete(
                "team_service_fee_jobs",
                &[Filter::any_of("job_id", dependent_job_ids.clone())],
            )
            .await?;
        store
            .delete("jobs", &[Filter::any_of("id", dependent_job_ids)])
            .await?;
    }
    store
        .delete("order_items", &[Filter::any_of("id", orphan_ids)])
        .await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
