//! Elasticsearch-compatible index store.
//!
//! Talks to the HTTP API of one index:
//!
//! - `POST /<index>/_bulk?refresh=true` for upserts (`index` actions keyed by
//!   the id field, so a resubmitted document replaces the stored one)
//! - `POST /<index>/_search` with a `max` aggregation for the boundaries
//! - `POST /<index>/_search?scroll=<ttl>` and `POST /_search/scroll` for
//!   read-back, `DELETE /_search/scroll` once a cursor runs dry
//!
//! Requests go through the shared [`HttpClient`], so they get its timeout,
//! retries, and certificate policy.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::models::FIELD_OFFSET;
use harvest_core::store::{
    IndexStore, ScanRequest, ScrollPage, StoreFilter, DEFAULT_BULK_SIZE, DEFAULT_SCROLL_TTL,
};
use harvest_core::time::{str_to_datetime, to_iso};
use harvest_core::{HarvestError, Result};
use serde_json::{json, Value};

use crate::http::HttpClient;

pub struct ElasticStore {
    http: HttpClient,
    url: String,
    index: String,
    bulk_size: usize,
    scroll_ttl: Duration,
}

impl ElasticStore {
    pub fn new(http: HttpClient, url: &str, index: &str) -> Self {
        Self {
            http,
            url: url.trim_end_matches('/').to_string(),
            index: index.to_string(),
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

    fn ttl(&self) -> String {
        format!("{}s", self.scroll_ttl.as_secs().max(1))
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value> {
        let response = self.http.send(|c| c.post(url).json(body)).await?;
        response
            .json::<Value>()
            .await
            .map_err(|e| HarvestError::Http(format!("malformed reply from {}: {}", url, e)))
    }

    async fn max_aggregation(&self, field: &str, filter: Option<&StoreFilter>) -> Option<Value> {
        let url = format!("{}/{}/_search", self.url, self.index);
        let body = max_query(field, filter);
        match self.post_json(&url, &body).await {
            Ok(reply) => parse_max_aggregation(&reply),
            Err(e) => {
                tracing::warn!(field, error = %e, "cannot read max from elastic store");
                None
            }
        }
    }

    /// Page of a search or scroll reply; an exhausted cursor is released
    /// instead of waiting for its TTL.
    async fn read_page(&self, reply: &Value) -> ScrollPage {
        let page = parse_scroll_page(reply);
        if page.items.is_empty() {
            if let Some(scroll_id) = reply.get("_scroll_id").and_then(Value::as_str) {
                self.clear_scroll(scroll_id).await;
            }
        }
        page
    }

    async fn clear_scroll(&self, scroll_id: &str) {
        let url = format!("{}/_search/scroll", self.url);
        let body = json!({ "scroll_id": [scroll_id] });
        match self.http.send(|c| c.delete(&url).json(&body)).await {
            Ok(_) => tracing::debug!(index = %self.index, "scroll cleared"),
            Err(e) => tracing::warn!(error = %e, "cannot clear scroll on elastic store"),
        }
    }
}

fn filter_query(filter: Option<&StoreFilter>, range: Option<(&str, String)>) -> Value {
    let mut clauses = Vec::new();
    if let Some(f) = filter {
        clauses.push(json!({ "term": { f.name.as_str(): f.value } }));
    }
    if let Some((field, from)) = range {
        clauses.push(json!({ "range": { field: { "gte": from } } }));
    }
    if clauses.is_empty() {
        json!({ "match_all": {} })
    } else {
        json!({ "bool": { "filter": clauses } })
    }
}

fn max_query(field: &str, filter: Option<&StoreFilter>) -> Value {
    json!({
        "size": 0,
        "query": filter_query(filter, None),
        "aggs": { "1": { "max": { "field": field } } }
    })
}

/// NDJSON body of a `_bulk` request.
pub fn bulk_body(docs: &[Value], id_field: &str) -> Result<String> {
    let mut body = String::new();
    for doc in docs {
        let id = doc.get(id_field).and_then(Value::as_str).ok_or_else(|| {
            HarvestError::Store(format!("document without a string '{}' field", id_field))
        })?;
        body.push_str(&json!({ "index": { "_id": id } }).to_string());
        body.push('\n');
        body.push_str(&doc.to_string());
        body.push('\n');
    }
    Ok(body)
}

/// First item error of a `_bulk` reply, if any.
pub fn bulk_error(reply: &Value) -> Option<String> {
    if !reply.get("errors").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    let first = reply
        .get("items")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|item| item.get("index"))
        .find_map(|action| action.get("error"));
    Some(match first {
        Some(err) => err.to_string(),
        None => "bulk request reported errors".to_string(),
    })
}

/// Value of the `max` aggregation: the formatted date if the field is a
/// date, else the raw number. `None` when no document matched.
pub fn parse_max_aggregation(reply: &Value) -> Option<Value> {
    let agg = reply.get("aggregations")?.get("1")?;
    if let Some(s) = agg.get("value_as_string") {
        return Some(s.clone());
    }
    agg.get("value").filter(|v| !v.is_null()).cloned()
}

fn aggregation_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => str_to_datetime(s).ok(),
        // Date fields aggregate to epoch milliseconds.
        Value::Number(n) => n
            .as_f64()
            .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms as i64)),
        _ => None,
    }
}

/// Documents and cursor of a search or scroll reply.
pub fn parse_scroll_page(reply: &Value) -> ScrollPage {
    let items: Vec<Value> = reply
        .get("hits")
        .and_then(|h| h.get("hits"))
        .and_then(Value::as_array)
        .map(|hits| hits.iter().filter_map(|h| h.get("_source").cloned()).collect())
        .unwrap_or_default();
    let scroll_id = reply
        .get("_scroll_id")
        .and_then(Value::as_str)
        .filter(|_| !items.is_empty())
        .map(str::to_string);
    ScrollPage { items, scroll_id }
}

#[async_trait]
impl IndexStore for ElasticStore {
    async fn last_update(&self, field: &str, filter: Option<&StoreFilter>) -> Option<DateTime<Utc>> {
        self.max_aggregation(field, filter)
            .await
            .as_ref()
            .and_then(aggregation_date)
    }

    async fn last_offset(&self, filter: Option<&StoreFilter>) -> Option<u64> {
        self.max_aggregation(FIELD_OFFSET, filter)
            .await
            .and_then(|v| v.as_f64())
            .filter(|v| *v >= 0.0)
            .map(|v| v as u64)
    }

    async fn bulk_upsert(&self, docs: &[Value], id_field: &str) -> Result<usize> {
        if docs.is_empty() {
            return Ok(0);
        }
        let body = bulk_body(docs, id_field)?;
        let url = format!("{}/{}/_bulk?refresh=true", self.url, self.index);

        let response = self
            .http
            .send(|c| {
                c.post(&url)
                    .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
                    .body(body.clone())
            })
            .await
            .map_err(|e| HarvestError::Store(e.to_string()))?;
        let reply: Value = response
            .json()
            .await
            .map_err(|e| HarvestError::Store(format!("malformed bulk reply: {}", e)))?;

        if let Some(err) = bulk_error(&reply) {
            return Err(HarvestError::Store(err));
        }
        tracing::debug!(count = docs.len(), index = %self.index, "bulk upsert");
        Ok(docs.len())
    }

    async fn scan(&self, request: &ScanRequest) -> ScrollPage {
        let url = format!("{}/{}/_search?scroll={}", self.url, self.index, self.ttl());
        let range = request
            .from_date
            .as_ref()
            .map(|from| (request.date_field.as_str(), to_iso(from)));
        let body = json!({
            "size": request.page_size.max(1),
            "query": filter_query(request.filter.as_ref(), range),
            "sort": [{ request.date_field.as_str(): { "order": "asc" } }]
        });

        match self.post_json(&url, &body).await {
            Ok(reply) => self.read_page(&reply).await,
            Err(e) => {
                tracing::warn!(error = %e, "cannot open scroll on elastic store");
                ScrollPage::empty()
            }
        }
    }

    async fn scroll(&self, scroll_id: &str) -> ScrollPage {
        let url = format!("{}/_search/scroll", self.url);
        let body = json!({ "scroll": self.ttl(), "scroll_id": scroll_id });

        match self.post_json(&url, &body).await {
            Ok(reply) => self.read_page(&reply).await,
            Err(e) => {
                tracing::warn!(error = %e, "cannot advance scroll on elastic store");
                ScrollPage::empty()
            }
        }
    }

    fn bulk_size(&self) -> usize {
        self.bulk_size
    }
}
