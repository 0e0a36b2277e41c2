//! `harvest cache`: manage the replay caches of configured connectors
//! without contacting their sources.

use anyhow::{Context, Result};

use crate::cache::ReplayCache;
use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAction {
    /// Snapshot the current contents.
    Backup,
    /// Restore the last snapshot.
    Recover,
    /// Discard the contents; `erase` also skips the snapshot.
    Clean { erase: bool },
}

pub fn run_cache(config: &Config, spec: &str, action: CacheAction) -> Result<()> {
    for entry in config.connectors.select(spec)? {
        let dir = config.cache.path_for(&entry.connector_type, &entry.name);
        let cache = ReplayCache::open(&dir)
            .with_context(|| format!("Failed to open cache of {}", entry.label()))?;

        let verb = match action {
            CacheAction::Backup => {
                cache.backup()?;
                "backed up"
            }
            CacheAction::Recover => {
                cache.recover()?;
                "recovered"
            }
            CacheAction::Clean { erase } => {
                cache.clean(erase)?;
                if erase {
                    "erased"
                } else {
                    "cleaned"
                }
            }
        };
        println!("cache {}  {} ({})", entry.label(), verb, dir.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn clean_then_recover_restores_blocks() {
        let tmp = TempDir::new().unwrap();
        let cfg_path = tmp.path().join("harvest.toml");
        fs::write(
            &cfg_path,
            format!(
                "[db]\npath = \"{0}/db.sqlite\"\n[cache]\ndir = \"{0}/cache\"\n[connectors.kitsune.sumo]\n",
                tmp.path().display()
            ),
        )
        .unwrap();
        let config = load_config(&cfg_path).unwrap();

        let cache = ReplayCache::open(config.cache.path_for("kitsune", "sumo")).unwrap();
        cache.store(&["0".to_string(), "{}".to_string()]).unwrap();

        run_cache(&config, "kitsune", CacheAction::Clean { erase: false }).unwrap();
        assert_eq!(cache.len().unwrap(), 0);

        run_cache(&config, "kitsune:sumo", CacheAction::Recover).unwrap();
        assert_eq!(cache.len().unwrap(), 2);

        assert!(run_cache(&config, "bugzilla", CacheAction::Backup).is_err());
    }
}
