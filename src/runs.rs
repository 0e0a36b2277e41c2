//! Run log and store overview.
//!
//! Every `harvest sync` pass leaves a row in the `runs` table: which
//! connector ran, against which origin, where it started, how many records
//! it fetched, dropped, and wrote, and why it failed if it did. `harvest
//! runs` prints the latest entries and, for the SQLite store, how many
//! records each origin holds.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::ingest::SyncReport;
use crate::migrate;
use crate::sqlite_store::SqliteStore;

/// One row of the run log.
#[derive(Debug, Clone)]
pub struct RunEntry {
    pub connector: String,
    pub origin: String,
    pub mode: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub success: Option<bool>,
    pub boundary: Option<String>,
    pub fetched: i64,
    pub dropped: i64,
    pub written: i64,
    pub error: Option<String>,
}

impl RunEntry {
    pub fn status(&self) -> &'static str {
        match self.success {
            Some(true) => "ok",
            Some(false) => "failed",
            None => "running",
        }
    }
}

/// Record the start of a pass; returns the run id.
pub async fn start_run(pool: &SqlitePool, connector: &str, origin: &str, mode: &str) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO runs (id, connector, origin, mode, started_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(connector)
    .bind(origin)
    .bind(mode)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(id)
}

/// Close a run with its report, or with the error that ended it.
pub async fn finish_run(
    pool: &SqlitePool,
    id: &str,
    report: Option<&SyncReport>,
    error: Option<&str>,
) -> Result<()> {
    let (boundary, fetched, dropped, written) = match report {
        Some(r) => (
            Some(r.boundary()),
            r.fetched as i64,
            r.dropped as i64,
            r.written as i64,
        ),
        None => (None, 0, 0, 0),
    };

    sqlx::query(
        r#"
        UPDATE runs SET
            finished_at = ?, success = ?, boundary = ?,
            fetched = ?, dropped = ?, written = ?, error = ?
        WHERE id = ?
        "#,
    )
    .bind(chrono::Utc::now().timestamp())
    .bind(error.is_none())
    .bind(boundary)
    .bind(fetched)
    .bind(dropped)
    .bind(written)
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Most recent runs first.
pub async fn list_runs(pool: &SqlitePool, limit: i64) -> Result<Vec<RunEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT connector, origin, mode, started_at, finished_at, success, boundary,
               fetched, dropped, written, error
        FROM runs
        ORDER BY started_at DESC, rowid DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| RunEntry {
            connector: row.get("connector"),
            origin: row.get("origin"),
            mode: row.get("mode"),
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
            success: row.get("success"),
            boundary: row.get("boundary"),
            fetched: row.get("fetched"),
            dropped: row.get("dropped"),
            written: row.get("written"),
            error: row.get("error"),
        })
        .collect())
}

/// Run the `runs` command: print the run log and stored record counts.
pub async fn run_runs(config: &Config, limit: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::create_schema(&pool).await?;

    let entries = list_runs(&pool, limit).await?;
    if entries.is_empty() {
        println!("No runs yet. Use `harvest sync <connector>` to start one.");
    } else {
        println!(
            "{:<24} {:<8} {:<7} {:>8} {:>8} {:>8}   {}",
            "CONNECTOR", "STATUS", "MODE", "FETCHED", "DROPPED", "WRITTEN", "STARTED"
        );
        println!("{}", "-".repeat(90));
        for e in &entries {
            println!(
                "{:<24} {:<8} {:<7} {:>8} {:>8} {:>8}   {}",
                e.connector,
                e.status(),
                e.mode,
                e.fetched,
                e.dropped,
                e.written,
                format_ts_relative(e.started_at)
            );
            if let Some(err) = &e.error {
                println!("    error: {}", err);
            }
        }
    }

    if config.store.kind == "sqlite" {
        let counts = SqliteStore::new(pool.clone()).counts_by_origin().await?;
        if !counts.is_empty() {
            println!();
            println!("{:<48} {:>8}", "ORIGIN", "ITEMS");
            for (origin, n) in &counts {
                println!("{:<48} {:>8}", origin, n);
            }
        }
    }

    pool.close().await;
    Ok(())
}

/// Format a Unix timestamp relative to now (e.g. "3 hours ago").
pub fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
