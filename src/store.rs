//! Store client abstraction.
//!
//! The hosted relational store is consumed through a thin REST client with
//! per-statement atomicity only; there are no multi-statement
//! transactions. These traits are the seam the writer and reader are
//! written against: [`crate::api::RestStore`] is the production
//! implementation and unit tests substitute an in-memory fake.

use async_trait::async_trait;
use serde_json::Value;

/// Typed store failures. Constraint classes carry the store's own message
/// so callers can translate them to user-facing text.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Foreign-key constraint violation (store error code 23503).
    #[error("foreign key violation: {0}")]
    ForeignKey(String),
    /// Unique constraint violation (store error code 23505).
    #[error("unique violation: {0}")]
    Unique(String),
    /// The requested single row does not exist.
    #[error("row not found")]
    NotFound,
    /// Connection-level failure (reset, DNS, timeout). Safe to retry.
    #[error("network error: {0}")]
    Network(String),
    #[error("store error: {0}")]
    Other(String),
}

impl StoreError {
    /// Whether a retry can reasonably succeed. Only connection-level
    /// failures qualify; constraint errors are deterministic.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Network(_))
    }
}

/// Row filter for select and delete calls.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Column equals a literal value.
    Eq(String, Value),
    /// Column value is one of the given identifiers.
    In(String, Vec<String>),
    /// Column value is none of the given identifiers.
    NotIn(String, Vec<String>),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(column.to_string(), value.into())
    }

    pub fn any_of(column: &str, ids: Vec<String>) -> Self {
        Filter::In(column.to_string(), ids)
    }

    pub fn none_of(column: &str, ids: Vec<String>) -> Self {
        Filter::NotIn(column.to_string(), ids)
    }

    pub fn column(&self) -> &str {
        match self {
            Filter::Eq(c, _) | Filter::In(c, _) | Filter::NotIn(c, _) => c,
        }
    }
}

/// Sort order for select calls.
#[derive(Debug, Clone)]
pub struct OrderBy {
    pub column: String,
    pub ascending: bool,
}

impl OrderBy {
    pub fn asc(column: &str) -> Self {
        OrderBy {
            column: column.to_string(),
            ascending: true,
        }
    }

    pub fn desc(column: &str) -> Self {
        OrderBy {
            column: column.to_string(),
            ascending: false,
        }
    }
}

/// Thin client over the relational store's REST surface.
///
/// `columns` strings use the store's embedded-resource syntax
/// (`"*, customer:customers(id, name)"`); implementations that cannot
/// resolve embeds may return flat rows, callers must tolerate missing
/// sub-objects. Upserts key on the primary identifier and return the
/// written representation.
#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn select(
        &self,
        table: &str,
        columns: &str,
        filters: &[Filter],
        order: Option<&OrderBy>,
    ) -> Result<Vec<Value>, StoreError>;

    /// Select exactly one row; `StoreError::NotFound` when absent.
    async fn select_one(
        &self,
        table: &str,
        columns: &str,
        filters: &[Filter],
    ) -> Result<Value, StoreError>;

    /// Insert-or-update by primary key. `rows` is a JSON array.
    async fn upsert(&self, table: &str, rows: Value) -> Result<Vec<Value>, StoreError>;

    /// Upsert that silently skips rows already present, keyed on
    /// `conflict_columns` (comma-separated). Used for link tables.
    async fn upsert_ignore_duplicates(
        &self,
        table: &str,
        rows: Value,
        conflict_columns: &str,
    ) -> Result<(), StoreError>;

    /// Plain insert. `rows` is a JSON array.
    async fn insert(&self, table: &str, rows: Value) -> Result<Vec<Value>, StoreError>;

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<(), StoreError>;

    /// Invoke a store-side function, e.g. the document sequence counter.
    async fn rpc(&self, function: &str, args: Value) -> Result<Value, StoreError>;

    /// Exact row count for a table.
    async fn count(&self, table: &str) -> Result<i64, StoreError>;
}

/// Object storage consumed for signatures, slips and photos.
///
/// Uploads are idempotent per distinct path. Callers treat a failed
/// upload as a missing URL rather than a fatal error.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StoreError>;
}
