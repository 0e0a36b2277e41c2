//! Kitsune connector.
//!
//! Harvests questions, with their answers, from a Kitsune support forum
//! through its REST API (`/api/2/question/`, `/api/2/answer/`). Questions
//! are listed from older to newer update time, so a question's position in
//! that listing (its `offset`) is the resume point for the next run.
//!
//! The API pages by 20 items and cannot start mid-page: a run starting at
//! offset 45 requests page 3 and discards its first 5 questions.
//!
//! Cache layout for one run:
//!
//! ```text
//! "45"                      offset marker
//! {questions page}
//! {answers page} ... "{}"   per kept question, "{}" closes its answers
//! {questions page}
//! ...
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::time::str_to_datetime;
use harvest_core::{HarvestError, Result};
use serde_json::Value;

use crate::cache::{CacheBlocks, CacheQueue, ReplayCache};
use crate::config::KitsuneConnectorConfig;
use crate::http::HttpClient;
use crate::traits::{Connector, FetchFrom, FetchMode, ItemSource};

pub const KITSUNE_URL: &str = "https://support.mozilla.org";

/// Page size of the Kitsune API.
pub const ITEMS_PER_PAGE: u64 = 20;
const FIRST_PAGE: u64 = 1;

const VERSION: &str = "0.1.0";

/// Closes the answers of one question in the cache.
const END_OF_ANSWERS: &str = "{}";

#[derive(Clone)]
pub struct KitsuneClient {
    api_url: String,
    http: HttpClient,
}

impl KitsuneClient {
    pub fn new(url: &str, http: HttpClient) -> Self {
        Self {
            api_url: format!("{}/api/2", url.trim_end_matches('/')),
            http,
        }
    }

    /// One page of questions ordered by update time.
    pub async fn questions(&self, page: u64) -> Result<String> {
        let url = format!("{}/question/", self.api_url);
        let params = [("page", page.to_string()), ("ordering", "updated".to_string())];
        self.http.get_text(&url, &params).await
    }

    /// One page of the answers to `question_id`.
    pub async fn answers(&self, question_id: &str, page: u64) -> Result<String> {
        let url = format!("{}/answer/", self.api_url);
        let params = [
            ("page", page.to_string()),
            ("question", question_id.to_string()),
            ("ordering", "updated".to_string()),
        ];
        self.http.get_text(&url, &params).await
    }
}

/// A page of the questions or answers API.
struct ApiPage {
    count: u64,
    results: Vec<Value>,
    has_next: bool,
}

fn parse_page(raw: &str, what: &str) -> Result<ApiPage> {
    let bad = || HarvestError::Parse(format!("Bad JSON format for {}: {}", what, truncate(raw)));

    let json: Value = serde_json::from_str(raw).map_err(|_| bad())?;
    let results = json
        .get("results")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(bad)?;

    Ok(ApiPage {
        count: json.get("count").and_then(Value::as_u64).unwrap_or(0),
        results,
        has_next: json.get("next").is_some_and(|n| !n.is_null()),
    })
}

fn truncate(raw: &str) -> &str {
    match raw.char_indices().nth(200) {
        Some((idx, _)) => &raw[..idx],
        None => raw,
    }
}

fn question_id(question: &Value) -> Result<String> {
    match question.get("id") {
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(HarvestError::Parse("question without an id".into())),
    }
}

/// Number of questions to discard from the first page requested for `offset`.
fn questions_to_drop(offset: u64) -> u64 {
    offset % ITEMS_PER_PAGE
}

pub struct KitsuneConnector {
    name: String,
    url: String,
    origin: String,
    client: KitsuneClient,
    cache: Option<Arc<ReplayCache>>,
}

impl KitsuneConnector {
    pub fn new(
        name: String,
        config: &KitsuneConnectorConfig,
        http: HttpClient,
        cache: Option<Arc<ReplayCache>>,
    ) -> Self {
        let url = if config.url.is_empty() {
            KITSUNE_URL.to_string()
        } else {
            config.url.clone()
        };
        let origin = match &config.origin {
            Some(o) if !o.is_empty() => o.clone(),
            _ => url.clone(),
        };
        Self {
            name,
            client: KitsuneClient::new(&url, http),
            url,
            origin,
            cache,
        }
    }
}

#[async_trait]
impl Connector for KitsuneConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Questions and answers from a Kitsune support forum"
    }

    fn connector_type(&self) -> &str {
        "kitsune"
    }

    fn version(&self) -> &str {
        VERSION
    }

    fn origin(&self) -> &str {
        &self.origin
    }

    fn fetch_mode(&self) -> FetchMode {
        FetchMode::FromOffset
    }

    fn cache(&self) -> Option<&Arc<ReplayCache>> {
        self.cache.as_ref()
    }

    async fn fetch(&self, from: FetchFrom) -> Result<Box<dyn ItemSource>> {
        let offset = match from {
            FetchFrom::Offset(offset) => offset,
            _ => 0,
        };
        tracing::info!(url = %self.url, offset, "looking for questions");

        let mut queue = CacheQueue::new(self.cache.clone());
        queue.purge();
        queue.push(offset.to_string());

        Ok(Box::new(KitsuneFetch {
            client: self.client.clone(),
            queue,
            page: Some(FIRST_PAGE + offset / ITEMS_PER_PAGE),
            drop: questions_to_drop(offset),
            offset,
            fetched: 0,
        }))
    }

    async fn fetch_from_cache(&self) -> Result<Box<dyn ItemSource>> {
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| HarvestError::Cache("cache instance was not provided".into()))?;
        tracing::info!(url = %self.url, "retrieving cached questions");

        Ok(Box::new(KitsuneReplay {
            blocks: cache.retrieve()?,
            offset: 0,
            drop: 0,
            fetched: 0,
        }))
    }

    fn record_id(&self, item: &Value) -> Result<String> {
        question_id(item)
    }

    fn record_updated_at(&self, item: &Value) -> Result<DateTime<Utc>> {
        let updated = item
            .get("updated")
            .and_then(Value::as_str)
            .ok_or_else(|| HarvestError::Parse("question without an updated field".into()))?;
        str_to_datetime(updated)
    }

    fn record_offset(&self, item: &Value) -> Option<u64> {
        item.get("offset").and_then(Value::as_u64)
    }
}

struct KitsuneFetch {
    client: KitsuneClient,
    queue: CacheQueue,
    /// Next questions page; `None` once the API reports no more pages.
    page: Option<u64>,
    drop: u64,
    offset: u64,
    fetched: usize,
}

impl KitsuneFetch {
    async fn fetch_answers(&mut self, question_id: &str) -> Result<Vec<Value>> {
        let mut answers = Vec::new();
        let mut page = FIRST_PAGE;
        loop {
            let raw = self.client.answers(question_id, page).await?;
            self.queue.push(raw.clone());
            let parsed = parse_page(&raw, "answers")?;
            answers.extend(parsed.results);
            if !parsed.has_next {
                return Ok(answers);
            }
            page += 1;
        }
    }
}

#[async_trait]
impl ItemSource for KitsuneFetch {
    async fn next_batch(&mut self) -> Result<Option<Vec<Value>>> {
        let Some(page) = self.page else {
            tracing::info!(fetched = self.fetched, "fetch process completed");
            return Ok(None);
        };

        let raw = self.client.questions(page).await?;
        self.queue.push(raw.clone());
        let parsed = parse_page(&raw, "questions")?;

        let mut questions = Vec::with_capacity(parsed.results.len());
        for mut question in parsed.results {
            if self.drop > 0 {
                self.drop -= 1;
                continue;
            }
            let id = question_id(&question)?;
            question["offset"] = Value::from(self.offset);
            self.offset += 1;
            question["answers_data"] = Value::Array(self.fetch_answers(&id).await?);
            self.queue.push(END_OF_ANSWERS);
            questions.push(question);
        }

        self.queue.flush()?;
        self.fetched += questions.len();
        tracing::debug!(fetched = self.fetched, total = parsed.count, "questions");

        self.page = parsed.has_next.then_some(page + 1);
        Ok(Some(questions))
    }
}

struct KitsuneReplay {
    blocks: CacheBlocks,
    offset: u64,
    drop: u64,
    fetched: usize,
}

impl KitsuneReplay {
    fn next_block(&mut self) -> Result<String> {
        self.blocks.next().ok_or_else(|| {
            HarvestError::Cache("cache is exhausted but more items were expected".into())
        })?
    }

    fn answers(&mut self) -> Result<Vec<Value>> {
        let mut answers = Vec::new();
        loop {
            let raw = self.next_block()?;
            if raw == END_OF_ANSWERS {
                return Ok(answers);
            }
            answers.extend(parse_page(&raw, "answers")?.results);
        }
    }
}

#[async_trait]
impl ItemSource for KitsuneReplay {
    async fn next_batch(&mut self) -> Result<Option<Vec<Value>>> {
        let mut raw = match self.blocks.next() {
            Some(block) => block?,
            None => {
                tracing::info!(fetched = self.fetched, "retrieval from cache completed");
                return Ok(None);
            }
        };

        // Each run starts with the offset it was asked for.
        if let Ok(offset) = raw.trim().parse::<u64>() {
            self.offset = offset;
            self.drop = questions_to_drop(offset);
            raw = self.next_block()?;
        }

        let parsed = parse_page(&raw, "questions")?;
        let mut questions = Vec::with_capacity(parsed.results.len());
        for mut question in parsed.results {
            if self.drop > 0 {
                self.drop -= 1;
                continue;
            }
            question["offset"] = Value::from(self.offset);
            self.offset += 1;
            question["answers_data"] = Value::Array(self.answers()?);
            questions.push(question);
        }

        self.fetched += questions.len();
        Ok(Some(questions))
    }
}
