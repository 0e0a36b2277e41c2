//! In-memory [`IndexStore`] for tests and embedding.
//!
//! Documents live in a `BTreeMap` keyed by their id behind a
//! `std::sync::RwLock`. A scroll cursor is a snapshot of the matching
//! documents taken when the cursor opens, drained one page at a time.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{HarvestError, Result};

use super::{
    document_date, document_offset, IndexStore, ScanRequest, ScrollPage, StoreFilter,
    DEFAULT_BULK_SIZE, DEFAULT_SCROLL_TTL,
};

struct ScrollState {
    remaining: VecDeque<Value>,
    page_size: usize,
    expires_at: Instant,
}

pub struct InMemoryStore {
    docs: RwLock<BTreeMap<String, Value>>,
    scrolls: RwLock<HashMap<String, ScrollState>>,
    next_scroll: AtomicU64,
    bulk_size: usize,
    scroll_ttl: Duration,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(BTreeMap::new()),
            scrolls: RwLock::new(HashMap::new()),
            next_scroll: AtomicU64::new(1),
            bulk_size: DEFAULT_BULK_SIZE,
            scroll_ttl: DEFAULT_SCROLL_TTL,
        }
    }

    pub fn with_bulk_size(mut self, bulk_size: usize) -> Self {
        self.bulk_size = bulk_size.max(1);
        self
    }

    pub fn with_scroll_ttl(mut self, ttl: Duration) -> Self {
        self.scroll_ttl = ttl;
        self
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.docs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch one stored document by id.
    pub fn get(&self, id: &str) -> Option<Value> {
        self.docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn matching(&self, filter: Option<&StoreFilter>) -> Vec<Value> {
        self.docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|doc| filter.map_or(true, |f| f.matches(doc)))
            .cloned()
            .collect()
    }

    fn next_page(&self, state: &mut ScrollState) -> Vec<Value> {
        let take = state.page_size.min(state.remaining.len());
        state.expires_at = Instant::now() + self.scroll_ttl;
        state.remaining.drain(..take).collect()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IndexStore for InMemoryStore {
    async fn last_update(
        &self,
        field: &str,
        filter: Option<&StoreFilter>,
    ) -> Option<DateTime<Utc>> {
        self.matching(filter)
            .iter()
            .filter_map(|doc| document_date(doc, field))
            .max()
    }

    async fn last_offset(&self, filter: Option<&StoreFilter>) -> Option<u64> {
        self.matching(filter).iter().filter_map(document_offset).max()
    }

    async fn bulk_upsert(&self, docs: &[Value], id_field: &str) -> Result<usize> {
        if docs.is_empty() {
            return Ok(0);
        }

        let mut keyed = Vec::with_capacity(docs.len());
        for doc in docs {
            let id = doc
                .get(id_field)
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    HarvestError::Store(format!("document has no string '{}' field", id_field))
                })?;
            keyed.push((id.to_string(), doc.clone()));
        }

        let mut stored = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        let written = keyed.len();
        stored.extend(keyed);
        Ok(written)
    }

    async fn scan(&self, request: &ScanRequest) -> ScrollPage {
        let mut hits: Vec<(Option<DateTime<Utc>>, Value)> = self
            .matching(request.filter.as_ref())
            .into_iter()
            .filter(|doc| request.matches(doc))
            .map(|doc| (document_date(&doc, &request.date_field), doc))
            .collect();

        // Ascending by date, undated documents last.
        hits.sort_by(|(a, _), (b, _)| match (a, b) {
            (Some(a), Some(b)) => a.cmp(b),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });

        let mut state = ScrollState {
            remaining: hits.into_iter().map(|(_, doc)| doc).collect(),
            page_size: request.page_size.max(1),
            expires_at: Instant::now(),
        };
        let items = self.next_page(&mut state);
        if items.is_empty() {
            return ScrollPage::empty();
        }

        let scroll_id = format!("mem-{}", self.next_scroll.fetch_add(1, Ordering::SeqCst));
        self.scrolls
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scroll_id.clone(), state);

        ScrollPage {
            items,
            scroll_id: Some(scroll_id),
        }
    }

    async fn scroll(&self, scroll_id: &str) -> ScrollPage {
        let mut scrolls = self.scrolls.write().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        scrolls.retain(|_, state| state.expires_at > now);

        let Some(mut state) = scrolls.remove(scroll_id) else {
            tracing::warn!(scroll_id, "scroll cursor expired or unknown");
            return ScrollPage::empty();
        };

        let items = self.next_page(&mut state);
        if items.is_empty() {
            return ScrollPage::empty();
        }
        scrolls.insert(scroll_id.to_string(), state);

        ScrollPage {
            items,
            scroll_id: Some(scroll_id.to_string()),
        }
    }

    fn bulk_size(&self) -> usize {
        self.bulk_size
    }
}
