//! TOML configuration.
//!
//! Every command reads one file (default `./config/harvest.toml`). Only
//! `[db]` is required; the other sections fall back to their defaults.
//! See `config/harvest.example.toml` for an annotated example.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use harvest_core::store::{DEFAULT_BULK_SIZE, DEFAULT_SCROLL_PAGE_SIZE};

use crate::connector_bugzilla::MAX_BUGS;
use crate::connector_kitsune::KITSUNE_URL;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// `sqlite` (default) or `elastic`.
    #[serde(default = "default_store_kind")]
    pub kind: String,
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,
    #[serde(default = "default_scroll_page_size")]
    pub scroll_page_size: usize,
    #[serde(default = "default_scroll_ttl_secs")]
    pub scroll_ttl_secs: u64,
    /// Base URL of the Elasticsearch-compatible server.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_index")]
    pub index: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: default_store_kind(),
            bulk_size: default_bulk_size(),
            scroll_page_size: default_scroll_page_size(),
            scroll_ttl_secs: default_scroll_ttl_secs(),
            url: None,
            index: default_index(),
        }
    }
}

fn default_store_kind() -> String {
    "sqlite".to_string()
}
fn default_bulk_size() -> usize {
    DEFAULT_BULK_SIZE
}
fn default_scroll_page_size() -> usize {
    DEFAULT_SCROLL_PAGE_SIZE
}
fn default_scroll_ttl_secs() -> u64 {
    180
}
fn default_index() -> String {
    "items".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            enabled: true,
        }
    }
}

impl CacheConfig {
    /// Cache directory of one connector instance: `<dir>/<type>/<name>`.
    pub fn path_for(&self, connector_type: &str, name: &str) -> PathBuf {
        self.dir.join(connector_type).join(name)
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./data/cache")
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            user_agent: default_user_agent(),
            accept_invalid_certs: false,
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_user_agent() -> String {
    format!("harvest/{}", env!("CARGO_PKG_VERSION"))
}

/// Connector instances, keyed by type and then by instance name.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectorsConfig {
    #[serde(default)]
    pub bugzilla: BTreeMap<String, BugzillaConnectorConfig>,
    #[serde(default)]
    pub kitsune: BTreeMap<String, KitsuneConnectorConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BugzillaConnectorConfig {
    pub url: String,
    #[serde(default = "default_max_bugs")]
    pub max_bugs: usize,
    /// Identifier stored with every record; defaults to `url`.
    #[serde(default)]
    pub origin: Option<String>,
}

fn default_max_bugs() -> usize {
    MAX_BUGS
}

#[derive(Debug, Deserialize, Clone)]
pub struct KitsuneConnectorConfig {
    #[serde(default = "default_kitsune_url")]
    pub url: String,
    #[serde(default)]
    pub origin: Option<String>,
}

fn default_kitsune_url() -> String {
    KITSUNE_URL.to_string()
}

/// A configured connector instance, independent of its type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorEntry {
    pub connector_type: String,
    pub name: String,
    pub url: String,
    pub origin: String,
}

impl ConnectorEntry {
    pub fn label(&self) -> String {
        format!("{}:{}", self.connector_type, self.name)
    }
}

fn resolve_origin(origin: &Option<String>, url: &str) -> String {
    match origin {
        Some(o) if !o.is_empty() => o.clone(),
        _ => url.to_string(),
    }
}

impl ConnectorsConfig {
    /// Every configured instance, bugzilla first, each type sorted by name.
    pub fn entries(&self) -> Vec<ConnectorEntry> {
        let bugzilla = self.bugzilla.iter().map(|(name, cfg)| ConnectorEntry {
            connector_type: "bugzilla".to_string(),
            name: name.clone(),
            url: cfg.url.clone(),
            origin: resolve_origin(&cfg.origin, &cfg.url),
        });
        let kitsune = self.kitsune.iter().map(|(name, cfg)| ConnectorEntry {
            connector_type: "kitsune".to_string(),
            name: name.clone(),
            url: cfg.url.clone(),
            origin: resolve_origin(&cfg.origin, &cfg.url),
        });
        bugzilla.chain(kitsune).collect()
    }

    /// Instances matching a specifier: `all`, `<type>`, or `<type>:<name>`.
    pub fn select(&self, spec: &str) -> Result<Vec<ConnectorEntry>> {
        let selected: Vec<ConnectorEntry> = self
            .entries()
            .into_iter()
            .filter(|e| matches_spec(spec, &e.connector_type, &e.name))
            .collect();
        if selected.is_empty() {
            anyhow::bail!(
                "No connector matches '{}'. Use `all`, a type (bugzilla, kitsune), or `<type>:<name>`.",
                spec
            );
        }
        Ok(selected)
    }
}

/// Whether a connector of `connector_type` named `name` matches `spec`.
pub fn matches_spec(spec: &str, connector_type: &str, name: &str) -> bool {
    match spec.split_once(':') {
        Some((t, n)) => t == connector_type && n == name,
        None => spec == "all" || spec == connector_type,
    }
}

fn check_url(key: &str, raw: &str) -> Result<()> {
    let parsed = url::Url::parse(raw).with_context(|| format!("{} is not a valid URL: '{}'", key, raw))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        anyhow::bail!("{} must be an http(s) URL, got '{}'", key, raw);
    }
    Ok(())
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate store
    if config.store.bulk_size == 0 {
        anyhow::bail!("store.bulk_size must be > 0");
    }
    if config.store.scroll_page_size == 0 {
        anyhow::bail!("store.scroll_page_size must be > 0");
    }
    match config.store.kind.as_str() {
        "sqlite" => {}
        "elastic" => {
            if config.store.url.as_deref().map_or(true, str::is_empty) {
                anyhow::bail!("store.url must be set when store.kind is 'elastic'");
            }
        }
        other => anyhow::bail!(
            "Unknown store kind: '{}'. Must be sqlite or elastic.",
            other
        ),
    }

    if let Some(url) = &config.store.url {
        check_url("store.url", url)?;
    }

    // Validate connectors
    for (name, cfg) in &config.connectors.bugzilla {
        if cfg.max_bugs < 1 {
            anyhow::bail!("connectors.bugzilla.{}.max_bugs must be >= 1", name);
        }
        check_url(&format!("connectors.bugzilla.{}.url", name), &cfg.url)?;
    }
    for (name, cfg) in &config.connectors.kitsune {
        check_url(&format!("connectors.kitsune.{}.url", name), &cfg.url)?;
    }

    Ok(config)
}
