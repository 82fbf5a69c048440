//! In-memory fakes for the store traits.
//!
//! `MemoryStore` keeps tables as plain row vectors and resolves the
//! embedded-resource column syntax far enough for the order detail and
//! list views. Flags let tests steer the spots where production stores
//! misbehave: join rows without jobs, a jobs fetch that returns nothing,
//! injected per-table failures.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use crate::store::{Filter, ObjectStore, OrderBy, StoreClient, StoreError};
use crate::value_str;

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    sequences: Mutex<HashMap<String, i64>>,
    failures: Mutex<HashMap<String, Vec<StoreError>>>,
    /// Whether the wide join populates `jobs` under items.
    pub embed_jobs_in_items: AtomicBool,
    /// When set, direct selects on `jobs` return no rows.
    pub suppress_job_select: AtomicBool,
    /// RPC invocations, for idempotence assertions.
    pub rpc_calls: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let store = MemoryStore::default();
        store.embed_jobs_in_items.store(true, Ordering::SeqCst);
        store
    }

    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Queue an error for the next operation touching `table`.
    pub fn fail_next(&self, table: &str, err: StoreError) {
        self.failures
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .push(err);
    }

    fn take_failure(&self, table: &str) -> Option<StoreError> {
        let mut failures = self.failures.lock().unwrap();
        let queue = failures.get_mut(table)?;
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }

    fn matches(row: &Value, filters: &[Filter]) -> bool {
        filters.iter().all(|filter| match filter {
            Filter::Eq(column, value) => row.get(column) == Some(value),
            Filter::In(column, ids) => row
                .get(column)
                .and_then(Value::as_str)
                .map(|id| ids.iter().any(|candidate| candidate == id))
                .unwrap_or(false),
            Filter::NotIn(column, ids) => row
                .get(column)
                .and_then(Value::as_str)
                .map(|id| !ids.iter().any(|candidate| candidate == id))
                .unwrap_or(true),
        })
    }

    fn find_by(&self, table: &str, key: &str, value: &Value) -> Value {
        if value.is_null() {
            return Value::Null;
        }
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .and_then(|rows| rows.iter().find(|row| row.get(key) == Some(value)))
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn rows_where(&self, table: &str, key: &str, value: &Value) -> Vec<Value> {
        if value.is_null() {
            return Vec::new();
        }
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| row.get(key) == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn embed_job(&self, job: &Value) -> Value {
        let mut job = job.clone();
        let site = self.find_by(
            "customer_addresses",
            "id",
            job.get("location_id").unwrap_or(&Value::Null),
        );
        let inspector = self.find_by(
            "customer_contacts",
            "id",
            job.get("inspector_id").unwrap_or(&Value::Null),
        );
        if let Some(obj) = job.as_object_mut() {
            obj.insert("siteAddressRecord".to_string(), site);
            obj.insert("siteInspectorRecord".to_string(), inspector);
        }
        job
    }

    fn embed_item(&self, item: &Value) -> Value {
        let mut item = item.clone();
        let product = self.find_by(
            "products",
            "uuid",
            item.get("product_id").unwrap_or(&Value::Null),
        );
        let variant = self.find_by(
            "product_variants",
            "id",
            item.get("product_variant_id").unwrap_or(&Value::Null),
        );
        let jobs: Vec<Value> = if self.embed_jobs_in_items.load(Ordering::SeqCst) {
            self.rows_where("jobs", "order_item_id", item.get("id").unwrap_or(&Value::Null))
                .iter()
                .map(|job| self.embed_job(job))
                .collect()
        } else {
            Vec::new()
        };
        if let Some(obj) = item.as_object_mut() {
            obj.insert("product".to_string(), product);
            obj.insert("variant".to_string(), variant);
            obj.insert("jobs".to_string(), Value::Array(jobs));
        }
        item
    }

    fn embed_order(&self, order: &Value) -> Value {
        let mut order = order.clone();
        let null = Value::Null;
        let customer = self.find_by("customers", "id", order.get("customer_id").unwrap_or(&null));
        let purchaser = self.find_by(
            "customer_contacts",
            "id",
            order.get("purchaser_contact_id").unwrap_or(&null),
        );
        let receiver = self.find_by(
            "customer_contacts",
            "id",
            order.get("receiver_contact_id").unwrap_or(&null),
        );
        let tax_invoice = self.find_by(
            "customer_tax_invoices",
            "id",
            order.get("tax_invoice_id").unwrap_or(&null),
        );
        let tax_address = self.find_by(
            "customer_addresses",
            "id",
            order.get("tax_invoice_delivery_address_id").unwrap_or(&null),
        );
        let delivery_address = self.find_by(
            "customer_addresses",
            "id",
            order.get("delivery_address_id").unwrap_or(&null),
        );
        let items: Vec<Value> = self
            .rows_where("order_items", "order_id", order.get("id").unwrap_or(&null))
            .iter()
            .map(|item| self.embed_item(item))
            .collect();
        let payments =
            self.rows_where("order_payments", "order_id", order.get("id").unwrap_or(&null));

        if let Some(obj) = order.as_object_mut() {
            obj.insert("customer".to_string(), customer);
            obj.insert("purchaserContact".to_string(), purchaser);
            obj.insert("receiverContact".to_string(), receiver);
            obj.insert("taxInvoice".to_string(), tax_invoice);
            obj.insert("taxInvoiceDeliveryAddress".to_string(), tax_address);
            obj.insert("deliveryAddress".to_string(), delivery_address);
            obj.insert("items".to_string(), Value::Array(items));
            obj.insert("paymentSchedule".to_string(), Value::Array(payments));
        }
        order
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn select(
        &self,
        table: &str,
        columns: &str,
        filters: &[Filter],
        order: Option<&OrderBy>,
    ) -> Result<Vec<Value>, StoreError> {
        if let Some(err) = self.take_failure(table) {
            return Err(err);
        }
        if table == "jobs" && self.suppress_job_select.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }

        let mut rows: Vec<Value> = self
            .tables
            .lock()
            .unwrap()
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| Self::matches(row, filters))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if columns.contains('(') {
            rows = match table {
                "orders" => rows.iter().map(|row| self.embed_order(row)).collect(),
                "jobs" => rows.iter().map(|row| self.embed_job(row)).collect(),
                _ => rows,
            };
        }

        if let Some(order) = order {
            rows.sort_by_key(|row| value_str(row, &[order.column.as_str()]).unwrap_or_default());
            if !order.ascending {
                rows.reverse();
            }
        }
        Ok(rows)
    }

    async fn select_one(
        &self,
        table: &str,
        columns: &str,
        filters: &[Filter],
    ) -> Result<Value, StoreError> {
        let mut rows = self.select(table, columns, filters, None).await?;
        if rows.is_empty() {
            return Err(StoreError::NotFound);
        }
        Ok(rows.remove(0))
    }

    async fn upsert(&self, table: &str, rows: Value) -> Result<Vec<Value>, StoreError> {
        if let Some(err) = self.take_failure(table) {
            return Err(err);
        }
        let incoming = rows.as_array().cloned().unwrap_or_default();
        let mut tables = self.tables.lock().unwrap();
        let stored = tables.entry(table.to_string()).or_default();

        let mut written = Vec::with_capacity(incoming.len());
        for mut row in incoming {
            let id = match value_str(&row, &["id"]) {
                Some(id) => id,
                None => {
                    // Insert path: the store assigns the identifier.
                    let id = Uuid::new_v4().to_string();
                    if let Some(obj) = row.as_object_mut() {
                        obj.insert("id".to_string(), json!(id));
                    }
                    id
                }
            };
            let position = stored
                .iter()
                .position(|candidate| value_str(candidate, &["id"]).as_deref() == Some(id.as_str()));
            match position {
                Some(index) => {
                    if let (Some(target), Some(source)) =
                        (stored[index].as_object_mut(), row.as_object())
                    {
                        for (key, value) in source {
                            target.insert(key.clone(), value.clone());
                        }
                    }
                    written.push(stored[index].clone());
                }
                None => {
                    stored.push(row.clone());
                    written.push(row);
                }
            }
        }
        Ok(written)
    }

    async fn upsert_ignore_duplicates(
        &self,
        table: &str,
        rows: Value,
        conflict_columns: &str,
    ) -> Result<(), StoreError> {
        if let Some(err) = self.take_failure(table) {
            return Err(err);
        }
        let keys: Vec<&str> = conflict_columns.split(',').map(str::trim).collect();
        let incoming = rows.as_array().cloned().unwrap_or_default();
        let mut tables = self.tables.lock().unwrap();
        let stored = tables.entry(table.to_string()).or_default();

        for row in incoming {
            let duplicate = stored
                .iter()
                .any(|candidate| keys.iter().all(|key| candidate.get(*key) == row.get(*key)));
            if !duplicate {
                stored.push(row);
            }
        }
        Ok(())
    }

    async fn insert(&self, table: &str, rows: Value) -> Result<Vec<Value>, StoreError> {
        if let Some(err) = self.take_failure(table) {
            return Err(err);
        }
        let incoming = rows.as_array().cloned().unwrap_or_default();
        let mut tables = self.tables.lock().unwrap();
        let stored = tables.entry(table.to_string()).or_default();

        let mut written = Vec::with_capacity(incoming.len());
        for mut row in incoming {
            if value_str(&row, &["id"]).is_none() {
                if let Some(obj) = row.as_object_mut() {
                    obj.insert("id".to_string(), json!(Uuid::new_v4().to_string()));
                }
            }
            stored.push(row.clone());
            written.push(row);
        }
        Ok(written)
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<(), StoreError> {
        if let Some(err) = self.take_failure(table) {
            return Err(err);
        }
        let mut tables = self.tables.lock().unwrap();
        if let Some(rows) = tables.get_mut(table) {
            rows.retain(|row| !Self::matches(row, filters));
        }
        Ok(())
    }

    async fn rpc(&self, function: &str, args: Value) -> Result<Value, StoreError> {
        if let Some(err) = self.take_failure(function) {
            return Err(err);
        }
        self.rpc_calls.lock().unwrap().push(function.to_string());
        if function == "get_next_document_sequence" {
            let key = format!(
                "{}:{}",
                value_str(&args, &["doc_type"]).unwrap_or_default(),
                value_str(&args, &["doc_year_month"]).unwrap_or_default(),
            );
            let mut sequences = self.sequences.lock().unwrap();
            let next = sequences.entry(key).or_insert(0);
            *next += 1;
            return Ok(json!(*next));
        }
        Ok(Value::Null)
    }

    async fn count(&self, table: &str) -> Result<i64, StoreError> {
        if let Some(err) = self.take_failure(table) {
            return Err(err);
        }
        Ok(self
            .tables
            .lock()
            .unwrap()
            .get(table)
            .map(|rows| rows.len() as i64)
            .unwrap_or(0))
    }
}

#[derive(Default)]
pub struct MemoryObjects {
    /// `(bucket, path, byte_len)` per successful upload.
    pub uploads: Mutex<Vec<(String, String, usize)>>,
    pub fail_uploads: AtomicBool,
}

impl MemoryObjects {
    pub fn new() -> Self {
        MemoryObjects::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjects {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, StoreError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(StoreError::Network("upload connection reset".into()));
        }
        self.uploads
            .lock()
            .unwrap()
            .push((bucket.to_string(), path.to_string(), bytes.len()));
        Ok(format!("https://objects.test/{bucket}/{path}"))
    }
}
