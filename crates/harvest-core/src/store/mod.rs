//! Index store abstraction.
//!
//! The [`IndexStore`] trait is everything the sync engine and the read-back
//! iterator need from a searchable store: the incremental boundary lookup,
//! idempotent bulk upsert, and a server-side scroll cursor.
//!
//! Read operations never fail. An unreachable store or a malformed reply is
//! logged as a warning and reported as "nothing there", which makes a first
//! sync against a fresh store and a sync against a broken one look the same
//! to the caller. Writes propagate their errors.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::models::{FIELD_OFFSET, FIELD_ORIGIN};
use crate::time::value_to_datetime;

/// Documents written per `bulk_upsert` call unless configured otherwise.
pub const DEFAULT_BULK_SIZE: usize = 100;
/// Documents per scroll page unless configured otherwise.
pub const DEFAULT_SCROLL_PAGE_SIZE: usize = 10;
/// Idle window after which a scroll cursor expires.
pub const DEFAULT_SCROLL_TTL: Duration = Duration::from_secs(180);

/// Equality filter on a top-level document field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFilter {
    pub name: String,
    pub value: String,
}

impl StoreFilter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Filter on the `origin` field.
    pub fn origin(value: impl Into<String>) -> Self {
        Self::new(FIELD_ORIGIN, value)
    }

    pub fn matches(&self, doc: &Value) -> bool {
        doc.get(&self.name).and_then(Value::as_str) == Some(self.value.as_str())
    }
}

/// Parameters of a new scroll cursor.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub filter: Option<StoreFilter>,
    /// Field the cursor sorts on (ascending) and `from_date` applies to.
    pub date_field: String,
    pub from_date: Option<DateTime<Utc>>,
    pub page_size: usize,
}

impl ScanRequest {
    pub fn new(date_field: impl Into<String>) -> Self {
        Self {
            filter: None,
            date_field: date_field.into(),
            from_date: None,
            page_size: DEFAULT_SCROLL_PAGE_SIZE,
        }
    }

    pub fn with_filter(mut self, filter: StoreFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_from_date(mut self, from_date: Option<DateTime<Utc>>) -> Self {
        self.from_date = from_date;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Whether a document passes the filter and the date lower bound.
    pub fn matches(&self, doc: &Value) -> bool {
        if let Some(filter) = &self.filter {
            if !filter.matches(doc) {
                return false;
            }
        }
        match self.from_date {
            Some(from) => document_date(doc, &self.date_field).is_some_and(|d| d >= from),
            None => true,
        }
    }
}

/// One page of a scroll cursor.
#[derive(Debug, Clone, Default)]
pub struct ScrollPage {
    pub items: Vec<Value>,
    /// Token for the next page; `None` once the cursor is gone.
    pub scroll_id: Option<String>,
}

impl ScrollPage {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Searchable store that the sync engine writes into.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`last_update`](IndexStore::last_update) | max of a date field, the incremental boundary |
/// | [`last_offset`](IndexStore::last_offset) | max stored `offset`, for offset resume |
/// | [`bulk_upsert`](IndexStore::bulk_upsert) | idempotent batch write keyed by an id field |
/// | [`scan`](IndexStore::scan) | open a scroll cursor and return its first page |
/// | [`scroll`](IndexStore::scroll) | advance a scroll cursor |
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Maximum value of `field` among documents matching `filter`.
    async fn last_update(
        &self,
        field: &str,
        filter: Option<&StoreFilter>,
    ) -> Option<DateTime<Utc>>;

    /// Maximum `offset` among documents matching `filter`.
    async fn last_offset(&self, filter: Option<&StoreFilter>) -> Option<u64>;

    /// Insert or overwrite `docs`, keyed by the string value of `id_field`.
    ///
    /// Returns the number of documents written.
    async fn bulk_upsert(&self, docs: &[Value], id_field: &str) -> Result<usize>;

    async fn scan(&self, request: &ScanRequest) -> ScrollPage;

    async fn scroll(&self, scroll_id: &str) -> ScrollPage;

    /// Preferred number of documents per `bulk_upsert`.
    fn bulk_size(&self) -> usize {
        DEFAULT_BULK_SIZE
    }
}

/// Read a top-level date field of a stored document.
pub fn document_date(doc: &Value, field: &str) -> Option<DateTime<Utc>> {
    doc.get(field).and_then(value_to_datetime)
}

/// Read the `offset` field of a stored document.
pub fn document_offset(doc: &Value) -> Option<u64> {
    doc.get(FIELD_OFFSET).and_then(Value::as_u64)
}
