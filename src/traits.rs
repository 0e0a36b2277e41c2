//! The connector contract and the connector registry.
//!
//! Every data source implements [`Connector`]. A connector knows how to
//! talk to its source, how to replay what it cached, and how to read the
//! identity and update time out of a raw item. Everything else (identity
//! hashing, metadata wrapping, batching, storing) happens outside it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │           ConnectorRegistry              │
//! │  ┌──────────┐ ┌─────────┐ ┌───────────┐  │
//! │  │ bugzilla │ │ kitsune │ │  custom   │  │
//! │  └──────────┘ └─────────┘ └───────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!   fetch() / fetch_from_cache() → ItemSource
//!                ▼
//!   Records (wrap_record) → Feeder → IndexStore
//! ```
//!
//! # Usage
//!
//! ```rust
//! use harvest::traits::ConnectorRegistry;
//!
//! let mut connectors = ConnectorRegistry::new();
//! // connectors.register(Box::new(MyConnector::new()));
//! assert!(connectors.is_empty());
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{identity, Record, Result};
use serde_json::Value;

use crate::cache::ReplayCache;
use crate::config::{matches_spec, Config};
use crate::http::HttpClient;

/// Which lower bound a connector's `fetch` honors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Items updated at or after a date.
    FromDate,
    /// Items at or after a position in the source's update order.
    FromOffset,
    /// Everything, every time.
    Full,
}

/// Lower bound passed to [`Connector::fetch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFrom {
    Start,
    Date(DateTime<Utc>),
    Offset(u64),
}

/// A lazily evaluated sequence of raw items.
///
/// Each call performs the I/O for one group (a detail chunk, a result
/// page) and returns its fully assembled items; `None` once exhausted. A
/// connector writes a group's raw blocks to its cache before returning the
/// group, so stopping between calls leaves the cache consistent.
#[async_trait]
pub trait ItemSource: Send {
    async fn next_batch(&mut self) -> Result<Option<Vec<Value>>>;
}

/// A data source that yields raw items for harvesting.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use chrono::{DateTime, Utc};
/// use harvest::traits::{Connector, FetchFrom, ItemSource};
/// use harvest_core::{HarvestError, Result};
/// use serde_json::Value;
///
/// struct Empty;
///
/// #[async_trait]
/// impl ItemSource for Empty {
///     async fn next_batch(&mut self) -> Result<Option<Vec<Value>>> {
///         Ok(None)
///     }
/// }
///
/// pub struct NothingConnector;
///
/// #[async_trait]
/// impl Connector for NothingConnector {
///     fn name(&self) -> &str { "nothing" }
///     fn description(&self) -> &str { "Yields no items" }
///     fn origin(&self) -> &str { "nothing://" }
///
///     async fn fetch(&self, _from: FetchFrom) -> Result<Box<dyn ItemSource>> {
///         Ok(Box::new(Empty))
///     }
///
///     async fn fetch_from_cache(&self) -> Result<Box<dyn ItemSource>> {
///         Err(HarvestError::Cache("cache instance was not provided".into()))
///     }
///
///     fn record_id(&self, item: &Value) -> Result<String> {
///         Ok(item["id"].to_string())
///     }
///
///     fn record_updated_at(&self, _item: &Value) -> Result<DateTime<Utc>> {
///         Ok(Utc::now())
///     }
/// }
/// ```
#[async_trait]
pub trait Connector: Send + Sync {
    /// Instance name from the config (e.g. `"redhat"`).
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Backend name stored with every record (e.g. `"bugzilla"`).
    fn connector_type(&self) -> &str {
        "custom"
    }

    /// Backend version stored with every record.
    fn version(&self) -> &str {
        "0.1.0"
    }

    /// Identifier of the harvested repository; part of every record's uuid.
    fn origin(&self) -> &str;

    /// `"{type}:{name}"`, as used on the command line.
    fn source_label(&self) -> String {
        format!("{}:{}", self.connector_type(), self.name())
    }

    fn fetch_mode(&self) -> FetchMode {
        FetchMode::FromDate
    }

    /// The replay cache this connector writes to, if any.
    fn cache(&self) -> Option<&Arc<ReplayCache>> {
        None
    }

    /// Fetch items from the live source.
    async fn fetch(&self, from: FetchFrom) -> Result<Box<dyn ItemSource>>;

    /// Replay cached raw blocks through the same parsing, without network I/O.
    ///
    /// Fails with `HarvestError::Cache` when the connector has no cache.
    async fn fetch_from_cache(&self) -> Result<Box<dyn ItemSource>>;

    /// Source-specific identifier of a raw item.
    fn record_id(&self, item: &Value) -> Result<String>;

    /// When the source last updated a raw item.
    fn record_updated_at(&self, item: &Value) -> Result<DateTime<Utc>>;

    /// Position of a raw item, for [`FetchMode::FromOffset`] connectors.
    fn record_offset(&self, _item: &Value) -> Option<u64> {
        None
    }
}

/// Wrap a raw item with its ingestion metadata.
pub fn wrap_record(connector: &dyn Connector, data: Value) -> Result<Record> {
    let id = connector.record_id(&data)?;
    let uuid = identity::uuid(&[connector.origin(), &id])?;
    let updated_on = connector.record_updated_at(&data)?;

    Ok(Record {
        backend_name: connector.connector_type().to_string(),
        backend_version: connector.version().to_string(),
        harvester_version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
        origin: connector.origin().to_string(),
        uuid,
        updated_on,
        offset: connector.record_offset(&data),
        project: None,
        stored_updated_on: None,
        stored_timestamp: None,
        data,
    })
}

/// Wrapped records pulled one at a time from an [`ItemSource`].
pub struct Records<'a> {
    connector: &'a dyn Connector,
    source: Box<dyn ItemSource>,
    buffer: VecDeque<Value>,
}

impl<'a> Records<'a> {
    pub fn new(connector: &'a dyn Connector, source: Box<dyn ItemSource>) -> Self {
        Self {
            connector,
            source,
            buffer: VecDeque::new(),
        }
    }

    pub async fn next(&mut self) -> Result<Option<Record>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return wrap_record(self.connector, item).map(Some);
            }
            match self.source.next_batch().await? {
                Some(batch) => self.buffer.extend(batch),
                None => return Ok(None),
            }
        }
    }
}

/// Live records from `connector`, starting at `from`.
pub async fn records(connector: &dyn Connector, from: FetchFrom) -> Result<Records<'_>> {
    let source = connector.fetch(from).await?;
    Ok(Records::new(connector, source))
}

/// Records replayed from `connector`'s cache.
pub async fn cached_records(connector: &dyn Connector) -> Result<Records<'_>> {
    let source = connector.fetch_from_cache().await?;
    Ok(Records::new(connector, source))
}

/// Registry of connector instances (built-in and custom).
///
/// Use [`ConnectorRegistry::from_config`] to build every configured
/// instance, then optionally [`register`](ConnectorRegistry::register)
/// custom ones.
pub struct ConnectorRegistry {
    connectors: Vec<Box<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            connectors: Vec::new(),
        }
    }

    /// Build every configured connector instance.
    ///
    /// With `with_cache`, each instance gets a replay cache under
    /// `[cache] dir`. Bugzilla instances contact their server here to
    /// learn its version.
    pub async fn from_config(
        config: &Config,
        http: &HttpClient,
        with_cache: bool,
    ) -> anyhow::Result<Self> {
        Self::build(config, http, with_cache, true).await
    }

    /// Build every configured connector instance for cache replay.
    ///
    /// No source is contacted.
    pub async fn for_replay(config: &Config, http: &HttpClient) -> anyhow::Result<Self> {
        Self::build(config, http, true, false).await
    }

    async fn build(
        config: &Config,
        http: &HttpClient,
        with_cache: bool,
        check_version: bool,
    ) -> anyhow::Result<Self> {
        use crate::connector_bugzilla::BugzillaConnector;
        use crate::connector_kitsune::KitsuneConnector;

        let open_cache = |connector_type: &str, name: &str| -> anyhow::Result<Option<Arc<ReplayCache>>> {
            if !with_cache {
                return Ok(None);
            }
            let cache = ReplayCache::open(config.cache.path_for(connector_type, name))?;
            Ok(Some(Arc::new(cache)))
        };

        let mut registry = Self::new();

        for (name, cfg) in &config.connectors.bugzilla {
            let cache = open_cache("bugzilla", name)?;
            let connector = if check_version {
                BugzillaConnector::connect(name.clone(), cfg, http.clone(), cache)
                    .await
                    .with_context(|| format!("Failed to set up connector bugzilla:{}", name))?
            } else {
                BugzillaConnector::offline(name.clone(), cfg, http.clone(), cache)
            };
            registry.register(Box::new(connector));
        }
        for (name, cfg) in &config.connectors.kitsune {
            let cache = open_cache("kitsune", name)?;
            registry.register(Box::new(KitsuneConnector::new(
                name.clone(),
                cfg,
                http.clone(),
                cache,
            )));
        }

        Ok(registry)
    }

    pub fn register(&mut self, connector: Box<dyn Connector>) {
        self.connectors.push(connector);
    }

    pub fn connectors(&self) -> &[Box<dyn Connector>] {
        &self.connectors
    }

    /// Connectors of one type (e.g. `"bugzilla"`).
    pub fn connectors_by_type(&self, connector_type: &str) -> Vec<&dyn Connector> {
        self.connectors
            .iter()
            .filter(|c| c.connector_type() == connector_type)
            .map(|c| c.as_ref())
            .collect()
    }

    pub fn find(&self, connector_type: &str, name: &str) -> Option<&dyn Connector> {
        self.connectors
            .iter()
            .find(|c| c.connector_type() == connector_type && c.name() == name)
            .map(|c| c.as_ref())
    }

    /// Connectors matching `all`, `<type>`, or `<type>:<name>`.
    pub fn select(&self, spec: &str) -> anyhow::Result<Vec<&dyn Connector>> {
        let selected: Vec<&dyn Connector> = self
            .connectors
            .iter()
            .filter(|c| matches_spec(spec, c.connector_type(), c.name()))
            .map(|c| c.as_ref())
            .collect();
        if selected.is_empty() {
            anyhow::bail!("No connector matches '{}'", spec);
        }
        Ok(selected)
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::HarvestError;
    use serde_json::json;

    struct Pages {
        pages: VecDeque<Vec<Value>>,
    }

    #[async_trait]
    impl ItemSource for Pages {
        async fn next_batch(&mut self) -> Result<Option<Vec<Value>>> {
            Ok(self.pages.pop_front())
        }
    }

    struct Fixed {
        name: &'static str,
        kind: &'static str,
        pages: Vec<Vec<Value>>,
    }

    #[async_trait]
    impl Connector for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "fixed pages"
        }
        fn connector_type(&self) -> &str {
            self.kind
        }
        fn origin(&self) -> &str {
            "http://example.com"
        }
        async fn fetch(&self, _from: FetchFrom) -> Result<Box<dyn ItemSource>> {
            Ok(Box::new(Pages {
                pages: self.pages.clone().into(),
            }))
        }
        async fn fetch_from_cache(&self) -> Result<Box<dyn ItemSource>> {
            Err(HarvestError::Cache("cache instance was not provided".into()))
        }
        fn record_id(&self, item: &Value) -> Result<String> {
            item["id"]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| HarvestError::Parse("no id".into()))
        }
        fn record_updated_at(&self, item: &Value) -> Result<DateTime<Utc>> {
            harvest_core::time::str_to_datetime(item["updated"].as_str().unwrap_or(""))
        }
    }

    fn fixed(name: &'static str, kind: &'static str, pages: Vec<Vec<Value>>) -> Fixed {
        Fixed { name, kind, pages }
    }

    #[test]
    fn wrap_adds_metadata() {
        let conn = fixed("a", "custom", vec![]);
        let rec = wrap_record(&conn, json!({ "id": "1", "updated": "2015-08-12T18:32:10" })).unwrap();

        assert_eq!(rec.uuid, "6a7ba2a01aee56603b9d8a5f6b40c843fc089b2f");
        assert_eq!(rec.origin, "http://example.com");
        assert_eq!(rec.backend_name, "custom");
        assert_eq!(rec.harvester_version, env!("CARGO_PKG_VERSION"));
        assert_eq!(rec.updated_on.to_rfc3339(), "2015-08-12T18:32:10+00:00");
        assert_eq!(rec.data["id"], "1");
    }

    #[test]
    fn wrap_rejects_empty_identity() {
        let conn = fixed("a", "custom", vec![]);
        let err = wrap_record(&conn, json!({ "id": "", "updated": "2015-08-12" })).unwrap_err();
        assert!(matches!(err, HarvestError::InvalidIdentity(_)));
    }

    #[tokio::test]
    async fn records_flatten_batches() {
        let conn = fixed(
            "a",
            "custom",
            vec![
                vec![json!({ "id": "1", "updated": "2015-01-01" })],
                vec![],
                vec![
                    json!({ "id": "2", "updated": "2015-01-02" }),
                    json!({ "id": "3", "updated": "2015-01-03" }),
                ],
            ],
        );

        let mut recs = records(&conn, FetchFrom::Start).await.unwrap();
        let mut ids = Vec::new();
        while let Some(rec) = recs.next().await.unwrap() {
            ids.push(rec.data["id"].as_str().unwrap().to_string());
        }
        assert_eq!(ids, vec!["1", "2", "3"]);

        assert!(matches!(
            cached_records(&conn).await.err(),
            Some(HarvestError::Cache(_))
        ));
    }

    #[test]
    fn registry_selects_by_spec() {
        let mut registry = ConnectorRegistry::new();
        registry.register(Box::new(fixed("one", "bugzilla", vec![])));
        registry.register(Box::new(fixed("two", "bugzilla", vec![])));
        registry.register(Box::new(fixed("sumo", "kitsune", vec![])));

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.select("all").unwrap().len(), 3);
        assert_eq!(registry.select("bugzilla").unwrap().len(), 2);
        assert_eq!(registry.connectors_by_type("kitsune").len(), 1);
        assert_eq!(
            registry.select("bugzilla:two").unwrap()[0].source_label(),
            "bugzilla:two"
        );
        assert!(registry.find("kitsune", "sumo").is_some());
        assert!(registry.select("jira").is_err());
    }
}
