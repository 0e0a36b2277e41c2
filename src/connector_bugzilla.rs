//! Bugzilla connector.
//!
//! Harvests bugs through the CGI interface that every Bugzilla 3.x/4.x
//! server exposes:
//!
//! 1. `buglist.cgi?ctype=csv` lists the ids of bugs changed since a date.
//!    Bugzilla has no pagination, so the list is re-requested from the last
//!    change date plus one second until a page comes back empty.
//! 2. `show_bug.cgi?ctype=xml` returns the details of up to `max_bugs` bugs
//!    per request.
//! 3. `show_activity.cgi` returns the change history of one bug as HTML.
//!
//! The cache receives, per chunk, the details XML followed by one activity
//! page per bug in the order the bugs appear in the XML. Replay relies on
//! that pairing.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use harvest_core::time::{epoch, str_to_datetime};
use harvest_core::{HarvestError, Result};
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::cache::{CacheBlocks, CacheQueue, ReplayCache};
use crate::config::BugzillaConnectorConfig;
use crate::extract::{first_text, parse_bug_activity, parse_csv, xml_to_json};
use crate::http::HttpClient;
use crate::traits::{Connector, FetchFrom, ItemSource};

/// Default number of bugs requested per details query.
pub const MAX_BUGS: usize = 200;

const VERSION: &str = "0.2.0";

const CGI_BUGLIST: &str = "buglist.cgi";
const CGI_BUG: &str = "show_bug.cgi";
const CGI_BUG_ACTIVITY: &str = "show_activity.cgi";

/// Servers that only understand the old `order` value.
const OLD_STYLE_VERSIONS: &[&str] = &["3.2.3", "3.2.2"];

/// Thin client over the three CGI endpoints.
#[derive(Clone)]
pub struct BugzillaClient {
    base_url: String,
    http: HttpClient,
}

impl BugzillaClient {
    pub fn new(base_url: &str, http: HttpClient) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    async fn call(&self, cgi: &str, params: &[(&str, String)]) -> Result<String> {
        let url = format!("{}/{}", self.base_url, cgi);
        self.http.get_text(&url, params).await
    }

    /// Server metadata as XML; carries the version.
    pub async fn metadata(&self) -> Result<String> {
        self.call(CGI_BUG, &[("ctype", "xml".to_string())]).await
    }

    /// CSV summary of bugs changed since `from_date`.
    pub async fn buglist(&self, from_date: DateTime<Utc>, server_version: &str) -> Result<String> {
        let order = if OLD_STYLE_VERSIONS.contains(&server_version) {
            "Last+Changed"
        } else {
            "changeddate"
        };
        let params = [
            ("chfieldfrom", from_date.format("%Y-%m-%d %H:%M:%S").to_string()),
            ("ctype", "csv".to_string()),
            ("order", order.to_string()),
        ];
        self.call(CGI_BUGLIST, &params).await
    }

    /// XML details of a group of bugs.
    pub async fn bugs(&self, bug_ids: &[String]) -> Result<String> {
        let mut params: Vec<(&str, String)> = bug_ids.iter().map(|id| ("id", id.clone())).collect();
        params.push(("ctype", "xml".to_string()));
        params.push(("excludefield", "attachmentdata".to_string()));
        self.call(CGI_BUG, &params).await
    }

    /// HTML activity page of one bug.
    pub async fn bug_activity(&self, bug_id: &str) -> Result<String> {
        self.call(CGI_BUG_ACTIVITY, &[("id", bug_id.to_string())])
            .await
    }
}

/// Extract the server version from the metadata XML.
pub fn parse_version(raw_xml: &str) -> Option<String> {
    let marker = "bugzilla version=\"";
    let start = raw_xml.find(marker)? + marker.len();
    let len = raw_xml[start..].find('"')?;
    let version = &raw_xml[start..start + len];
    (!version.is_empty()).then(|| version.to_string())
}

/// Parse a details XML stream into its bugs.
pub fn parse_bugs_details(raw_xml: &str) -> Result<Vec<Value>> {
    let tree = xml_to_json(raw_xml)?;
    match tree.get("bug") {
        Some(Value::Array(bugs)) => Ok(bugs.clone()),
        _ => Err(HarvestError::Parse(
            "No bugs found. XML stream seems to be invalid.".into(),
        )),
    }
}

fn bug_id(bug: &Value) -> Result<&str> {
    first_text(bug, "bug_id")
        .ok_or_else(|| HarvestError::Parse("bug without a bug_id element".into()))
}

pub struct BugzillaConnector {
    name: String,
    origin: String,
    url: String,
    max_bugs: usize,
    server_version: OnceCell<String>,
    client: BugzillaClient,
    cache: Option<Arc<ReplayCache>>,
}

impl BugzillaConnector {
    /// Build the connector and ask the server for its version.
    ///
    /// # Errors
    ///
    /// `HarvestError::Backend` when the version cannot be determined.
    pub async fn connect(
        name: String,
        config: &BugzillaConnectorConfig,
        http: HttpClient,
        cache: Option<Arc<ReplayCache>>,
    ) -> Result<Self> {
        let connector = Self::offline(name, config, http, cache);
        connector.server_version().await?;
        Ok(connector)
    }

    /// Build the connector without contacting the server.
    ///
    /// Cache replay needs nothing else; a live fetch asks for the server
    /// version first.
    pub fn offline(
        name: String,
        config: &BugzillaConnectorConfig,
        http: HttpClient,
        cache: Option<Arc<ReplayCache>>,
    ) -> Self {
        let origin = match &config.origin {
            Some(o) if !o.is_empty() => o.clone(),
            _ => config.url.clone(),
        };

        Self {
            name,
            origin,
            url: config.url.clone(),
            max_bugs: config.max_bugs.max(1),
            server_version: OnceCell::new(),
            client: BugzillaClient::new(&config.url, http),
            cache,
        }
    }

    /// Version reported by the server, fetched once.
    pub async fn server_version(&self) -> Result<&str> {
        let version = self
            .server_version
            .get_or_try_init(|| async {
                let metadata = self.client.metadata().await.map_err(|e| {
                    HarvestError::Backend(format!("cannot reach {}: {}", self.url, e))
                })?;
                let version = parse_version(&metadata).ok_or_else(|| {
                    HarvestError::Backend(format!("Bugzilla server version not found at {}", self.url))
                })?;
                tracing::debug!(url = %self.url, %version, "bugzilla server");
                Ok::<_, HarvestError>(version)
            })
            .await?;
        Ok(version)
    }
}

#[async_trait]
impl Connector for BugzillaConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Bugs and their activity from a Bugzilla server"
    }

    fn connector_type(&self) -> &str {
        "bugzilla"
    }

    fn version(&self) -> &str {
        VERSION
    }

    fn origin(&self) -> &str {
        &self.origin
    }

    fn cache(&self) -> Option<&Arc<ReplayCache>> {
        self.cache.as_ref()
    }

    async fn fetch(&self, from: FetchFrom) -> Result<Box<dyn ItemSource>> {
        let server_version = self.server_version().await?.to_string();
        let from_date = match from {
            FetchFrom::Date(date) => date,
            _ => epoch(),
        };
        tracing::info!(origin = %self.origin, %from_date, "looking for bugs");

        let mut queue = CacheQueue::new(self.cache.clone());
        queue.purge();

        Ok(Box::new(BugzillaFetch {
            client: self.client.clone(),
            server_version,
            max_bugs: self.max_bugs,
            from_date,
            queue,
            pending: None,
            total: 0,
            fetched: 0,
        }))
    }

    async fn fetch_from_cache(&self) -> Result<Box<dyn ItemSource>> {
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| HarvestError::Cache("cache instance was not provided".into()))?;
        tracing::info!(origin = %self.origin, "retrieving cached bugs");

        Ok(Box::new(BugzillaReplay {
            blocks: cache.retrieve()?,
            fetched: 0,
        }))
    }

    fn record_id(&self, item: &Value) -> Result<String> {
        bug_id(item).map(str::to_string)
    }

    fn record_updated_at(&self, item: &Value) -> Result<DateTime<Utc>> {
        let delta_ts = first_text(item, "delta_ts")
            .ok_or_else(|| HarvestError::Parse("bug without a delta_ts element".into()))?;
        str_to_datetime(delta_ts)
    }
}

struct BugzillaFetch {
    client: BugzillaClient,
    server_version: String,
    max_bugs: usize,
    from_date: DateTime<Utc>,
    queue: CacheQueue,
    pending: Option<VecDeque<String>>,
    total: usize,
    fetched: usize,
}

impl BugzillaFetch {
    /// Ids of every bug changed since `from_date`, oldest change first.
    async fn fetch_buglist(&self) -> Result<VecDeque<String>> {
        let mut ids = VecDeque::new();
        let mut from_date = self.from_date;

        loop {
            tracing::debug!(%from_date, "fetching buglist page");
            let raw_csv = self.client.buglist(from_date, &self.server_version).await?;
            let page = parse_csv(&raw_csv)?;
            let Some(last) = page.last() else {
                break;
            };

            let last_date = last
                .get("changeddate")
                .ok_or_else(|| HarvestError::Parse("buglist without changeddate column".into()))?;
            let next_from = str_to_datetime(last_date)? + Duration::seconds(1);

            for row in &page {
                let id = row
                    .get("bug_id")
                    .ok_or_else(|| HarvestError::Parse("buglist without bug_id column".into()))?;
                ids.push_back(id.clone());
            }

            // The page boundary only moves forward; a server that ignores
            // chfieldfrom would otherwise be polled forever.
            if next_from <= from_date {
                break;
            }
            from_date = next_from;
        }
        Ok(ids)
    }
}

#[async_trait]
impl ItemSource for BugzillaFetch {
    async fn next_batch(&mut self) -> Result<Option<Vec<Value>>> {
        if self.pending.is_none() {
            let ids = self.fetch_buglist().await?;
            self.total = ids.len();
            self.pending = Some(ids);
        }
        let pending = self.pending.get_or_insert_with(VecDeque::new);

        let take = self.max_bugs.min(pending.len());
        if take == 0 {
            tracing::info!(fetched = self.fetched, total = self.total, "fetch process completed");
            return Ok(None);
        }
        let chunk: Vec<String> = pending.drain(..take).collect();

        tracing::info!("Fetching bugs: {}/{}", self.fetched, self.total);
        let raw_bugs = self.client.bugs(&chunk).await?;
        self.queue.push(raw_bugs.clone());
        let mut bugs = parse_bugs_details(&raw_bugs)?;

        for bug in bugs.iter_mut() {
            let id = bug_id(bug)?.to_string();
            tracing::debug!(bug = %id, "fetching bug activity");
            let raw_activity = self.client.bug_activity(&id).await?;
            self.queue.push(raw_activity.clone());
            let activity = parse_bug_activity(&raw_activity)?;
            bug["activity"] = Value::Array(activity);
        }

        self.queue.flush()?;
        self.fetched += bugs.len();
        Ok(Some(bugs))
    }
}

struct BugzillaReplay {
    blocks: CacheBlocks,
    fetched: usize,
}

#[async_trait]
impl ItemSource for BugzillaReplay {
    async fn next_batch(&mut self) -> Result<Option<Vec<Value>>> {
        let raw_bugs = match self.blocks.next() {
            Some(block) => block?,
            None => {
                tracing::info!(fetched = self.fetched, "retrieval from cache completed");
                return Ok(None);
            }
        };
        let mut bugs = parse_bugs_details(&raw_bugs)?;

        for bug in bugs.iter_mut() {
            let raw_activity = self.blocks.next().ok_or_else(|| {
                HarvestError::Cache("cache is exhausted but more items were expected".into())
            })??;
            bug["activity"] = Value::Array(parse_bug_activity(&raw_activity)?);
        }

        self.fetched += bugs.len();
        Ok(Some(bugs))
    }
}
