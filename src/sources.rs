use anyhow::Result;

use crate::cache::ReplayCache;
use crate::config::{Config, ConnectorEntry};

/// Cache state of one connector instance, for display.
pub fn cache_status(config: &Config, entry: &ConnectorEntry) -> String {
    if !config.cache.enabled {
        return "disabled".to_string();
    }
    let dir = config.cache.path_for(&entry.connector_type, &entry.name);
    if !dir.exists() {
        return "empty".to_string();
    }
    match ReplayCache::open(&dir).and_then(|cache| cache.len()) {
        Ok(0) => "empty".to_string(),
        Ok(n) => format!("{} blocks", n),
        Err(e) => format!("corrupt ({})", e),
    }
}

pub fn list_sources(config: &Config) -> Result<()> {
    let entries = config.connectors.entries();
    if entries.is_empty() {
        println!("No connectors configured. Add [connectors.bugzilla.<name>] or [connectors.kitsune.<name>].");
        return Ok(());
    }

    println!("{:<24} {:<40} {:<14} ORIGIN", "CONNECTOR", "URL", "CACHE");
    for entry in &entries {
        println!(
            "{:<24} {:<40} {:<14} {}",
            entry.label(),
            entry.url,
            cache_status(config, entry),
            entry.origin
        );
    }
    Ok(())
}
