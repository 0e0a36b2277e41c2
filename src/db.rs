use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use harvest_core::store::IndexStore;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::config::Config;
use crate::elastic_store::ElasticStore;
use crate::http::HttpClient;
use crate::migrate;
use crate::sqlite_store::SqliteStore;

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Open the index store selected by `[store] kind`.
///
/// The SQLite store shares the run-log database and creates its schema on
/// first use.
pub async fn open_index_store(config: &Config, http: &HttpClient) -> Result<Arc<dyn IndexStore>> {
    let ttl = Duration::from_secs(config.store.scroll_ttl_secs);

    match config.store.kind.as_str() {
        "elastic" => {
            let url = config
                .store
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("store.url must be set when store.kind is 'elastic'"))?;
            let store = ElasticStore::new(http.clone(), url, &config.store.index)
                .with_bulk_size(config.store.bulk_size)
                .with_scroll_ttl(ttl);
            Ok(Arc::new(store))
        }
        _ => {
            let pool = connect(config).await?;
            migrate::create_schema(&pool).await?;
            let store = SqliteStore::new(pool)
                .with_bulk_size(config.store.bulk_size)
                .with_scroll_ttl(ttl);
            Ok(Arc::new(store))
        }
    }
}
