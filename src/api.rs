//! Hosted store REST client.
//!
//! Production implementation of [`StoreClient`] and [`ObjectStore`] over
//! the store's PostgREST-style endpoint (`/rest/v1` for tables and RPCs,
//! `/storage/v1` for objects). Constraint violations surface as typed
//! [`StoreError`] variants so the writer can translate them; connection
//! failures classify as transient for the retry wrapper.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;

use crate::store::{Filter, ObjectStore, OrderBy, StoreClient, StoreError};

/// Default timeout for store requests (20 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Timeout for object uploads, which carry image payloads.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the hosted store URL:
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_store_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    // Ensure scheme
    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    // Strip trailing slashes
    while url.ends_with('/') {
        url.pop();
    }

    // Strip trailing /rest/v1
    if url.ends_with("/rest/v1") {
        url.truncate(url.len() - 8);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a typed store error. Connection-level
/// failures classify as `Network` so the retry wrapper picks them up.
fn transport_error(url: &str, err: &reqwest::Error) -> StoreError {
    if err.is_connect() {
        return StoreError::Network(format!("cannot reach store at {url}"));
    }
    if err.is_timeout() {
        return StoreError::Network(format!("store request to {url} timed out"));
    }
    if err.is_request() {
        return StoreError::Network(format!("store request to {url} failed: {err}"));
    }
    StoreError::Other(format!("store error at {url}: {err}"))
}

/// Map a non-success response body to a typed error. The store reports
/// constraint violations with SQLSTATE codes in a JSON body:
/// `{"code": "23503", "message": "...", "details": "..."}`.
fn classify_error_body(status: StatusCode, body: &str) -> StoreError {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        let code = json.get("code").and_then(Value::as_str).unwrap_or("");
        let message = json
            .get("message")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
        let detail = json
            .get("details")
            .and_then(Value::as_str)
            .map(|d| format!("{message}: {d}"))
            .unwrap_or(message);

        return match code {
            "23503" => StoreError::ForeignKey(detail),
            "23505" => StoreError::Unique(detail),
            // PGRST116: "JSON object requested, multiple (or no) rows returned"
            "PGRST116" => StoreError::NotFound,
            _ => StoreError::Other(format!("{detail} (HTTP {})", status.as_u16())),
        };
    }

    if status == StatusCode::NOT_ACCEPTABLE || status == StatusCode::NOT_FOUND {
        return StoreError::NotFound;
    }
    if body.trim().is_empty() {
        StoreError::Other(format!("HTTP {}", status.as_u16()))
    } else {
        StoreError::Other(format!("HTTP {}: {}", status.as_u16(), body.trim()))
    }
}

// ---------------------------------------------------------------------------
// Query rendering
// ---------------------------------------------------------------------------

fn filter_literal(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn quoted_list(ids: &[String]) -> String {
    ids.iter()
        .map(|id| format!("\"{id}\""))
        .collect::<Vec<String>>()
        .join(",")
}

/// Render a filter as a `(column, operator.value)` query pair.
fn filter_pair(filter: &Filter) -> (String, String) {
    match filter {
        Filter::Eq(column, value) => (column.clone(), format!("eq.{}", filter_literal(value))),
        Filter::In(column, ids) => (column.clone(), format!("in.({})", quoted_list(ids))),
        Filter::NotIn(column, ids) => (column.clone(), format!("not.in.({})", quoted_list(ids))),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Thin client over the hosted store's REST surface. Cloneable; the host
/// application constructs one at startup and passes it by reference.
#[derive(Clone)]
pub struct RestStore {
    base_url: String,
    api_key: String,
    client: Client,
    upload_client: Client,
}

impl RestStore {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Other(format!("failed to create HTTP client: {e}")))?;
        let upload_client = Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Other(format!("failed to create HTTP client: {e}")))?;
        Ok(RestStore {
            base_url: normalize_store_url(base_url),
            api_key: api_key.trim().to_string(),
            client,
            upload_client,
        })
    }

    fn table_url(&self, table: &str, filters: &[Filter]) -> Result<Url, StoreError> {
        let mut url = Url::parse(&format!("{}/rest/v1/{}", self.base_url, table))
            .map_err(|e| StoreError::Other(format!("invalid store URL: {e}")))?;
        {
            let mut qp = url.query_pairs_mut();
            for filter in filters {
                let (column, predicate) = filter_pair(filter);
                qp.append_pair(&column, &predicate);
            }
        }
        Ok(url)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", &self.api_key))
            .header("Content-Type", "application/json")
    }

    async fn read_rows(&self, resp: Response) -> Result<Vec<Value>, StoreError> {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_error_body(status, &body));
        }
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        let parsed: Value = serde_json::from_str(&body)
            .map_err(|e| StoreError::Other(format!("invalid JSON from store: {e}")))?;
        match parsed {
            Value::Array(rows) => Ok(rows),
            other => Ok(vec![other]),
        }
    }

    async fn check_status(&self, resp: Response) -> Result<(), StoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_error_body(status, &body))
    }
}

#[async_trait]
impl StoreClient for RestStore {
    async fn select(
        &self,
        table: &str,
        columns: &str,
        filters: &[Filter],
        order: Option<&OrderBy>,
    ) -> Result<Vec<Value>, StoreError> {
        let mut url = self.table_url(table, filters)?;
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("select", columns);
            if let Some(order) = order {
                let dir = if order.ascending { "asc" } else { "desc" };
                qp.append_pair("order", &format!("{}.{dir}", order.column));
            }
        }
        let resp = self
            .authed(self.client.get(url))
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        self.read_rows(resp).await
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
        let url = self.table_url(table, &[])?;
        let resp = self
            .authed(self.client.post(url))
            .header(
                "Prefer",
                "resolution=merge-duplicates,return=representation",
            )
            .json(&rows)
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        self.read_rows(resp).await
    }

    async fn upsert_ignore_duplicates(
        &self,
        table: &str,
        rows: Value,
        conflict_columns: &str,
    ) -> Result<(), StoreError> {
        let mut url = self.table_url(table, &[])?;
        url.query_pairs_mut()
            .append_pair("on_conflict", conflict_columns);
        let resp = self
            .authed(self.client.post(url))
            .header("Prefer", "resolution=ignore-duplicates")
            .json(&rows)
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        self.check_status(resp).await
    }

    async fn insert(&self, table: &str, rows: Value) -> Result<Vec<Value>, StoreError> {
        let url = self.table_url(table, &[])?;
        let resp = self
            .authed(self.client.post(url))
            .header("Prefer", "return=representation")
            .json(&rows)
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        self.read_rows(resp).await
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<(), StoreError> {
        let url = self.table_url(table, filters)?;
        let resp = self
            .authed(self.client.delete(url))
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        self.check_status(resp).await
    }

    async fn rpc(&self, function: &str, args: Value) -> Result<Value, StoreError> {
        let url = Url::parse(&format!("{}/rest/v1/rpc/{}", self.base_url, function))
            .map_err(|e| StoreError::Other(format!("invalid store URL: {e}")))?;
        let resp = self
            .authed(self.client.post(url))
            .json(&args)
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_error_body(status, &body));
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| StoreError::Other(format!("invalid JSON from store: {e}")))
    }

    async fn count(&self, table: &str) -> Result<i64, StoreError> {
        let url = self.table_url(table, &[])?;
        let resp = self
            .authed(self.client.head(url))
            .header("Prefer", "count=exact")
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StoreError::Other(format!(
                "count failed (HTTP {})",
                status.as_u16()
            )));
        }
        let range = resp
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        parse_content_range_total(range)
            .ok_or_else(|| StoreError::Other(format!("unparseable content-range: {range}")))
    }
}

/// Extract the total from a `content-range` header (`"0-24/3573"` or
/// `"*/3573"`).
fn parse_content_range_total(range: &str) -> Option<i64> {
    range.rsplit('/').next()?.trim().parse::<i64>().ok()
}

#[async_trait]
impl ObjectStore for RestStore {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StoreError> {
        let url = Url::parse(&format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url, bucket, path
        ))
        .map_err(|e| StoreError::Other(format!("invalid object URL: {e}")))?;
        let resp = self
            .upload_client
            .post(url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", &self.api_key))
            .header("Content-Type", content_type)
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        self.check_status(resp).await?;
        Ok(format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, bucket, path
        ))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
