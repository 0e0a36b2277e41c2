use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create every table and index if missing. Safe to run repeatedly.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // Stored records, one row per uuid
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id TEXT PRIMARY KEY,
            origin TEXT,
            updated_on TEXT,
            stored_timestamp TEXT,
            item_offset INTEGER,
            project TEXT,
            doc TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Open scroll cursors
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scrolls (
            id TEXT PRIMARY KEY,
            filter_name TEXT,
            filter_value TEXT,
            date_field TEXT NOT NULL,
            from_date TEXT,
            page_size INTEGER NOT NULL,
            last_key TEXT,
            last_id TEXT,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Run log
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            connector TEXT NOT NULL,
            origin TEXT NOT NULL,
            mode TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            success INTEGER,
            boundary TEXT,
            fetched INTEGER NOT NULL DEFAULT 0,
            dropped INTEGER NOT NULL DEFAULT 0,
            written INTEGER NOT NULL DEFAULT 0,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_origin_updated ON items(origin, updated_on)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_origin_offset ON items(origin, item_offset)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}
