//! Cursor-driven read-back of stored documents.
//!
//! [`ItemReader`] turns the page-at-a-time [`IndexStore::scan`] /
//! [`IndexStore::scroll`] protocol into a flat pull interface for downstream
//! consumers. It is finite and cannot be restarted; open a new reader for a
//! second pass.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;

use crate::store::{IndexStore, ScanRequest};

pub struct ItemReader {
    store: Arc<dyn IndexStore>,
    request: Option<ScanRequest>,
    scroll_id: Option<String>,
    buffer: VecDeque<Value>,
    done: bool,
}

impl ItemReader {
    /// Create a reader; no request is sent until the first [`next`](Self::next).
    pub fn new(store: Arc<dyn IndexStore>, request: ScanRequest) -> Self {
        Self {
            store,
            request: Some(request),
            scroll_id: None,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    /// Next stored document, or `None` once the cursor is exhausted.
    pub async fn next(&mut self) -> Option<Value> {
        loop {
            if let Some(doc) = self.buffer.pop_front() {
                return Some(doc);
            }
            if self.done {
                return None;
            }

            let page = if let Some(request) = self.request.take() {
                self.store.scan(&request).await
            } else if let Some(scroll_id) = self.scroll_id.take() {
                self.store.scroll(&scroll_id).await
            } else {
                self.done = true;
                return None;
            };

            if page.items.is_empty() {
                self.done = true;
                return None;
            }

            tracing::debug!(count = page.items.len(), "fetched scroll page");
            self.scroll_id = page.scroll_id;
            self.buffer.extend(page.items);
        }
    }

    /// Drain the remaining documents into a `Vec`.
    pub async fn collect_all(mut self) -> Vec<Value> {
        let mut docs = Vec::new();
        while let Some(doc) = self.next().await {
            docs.push(doc);
        }
        docs
    }
}
