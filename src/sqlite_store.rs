//! SQLite-backed index store.
//!
//! Documents live in the `items` table, keyed by their uuid, with the
//! fields the engine filters and sorts on copied into columns:
//!
//! | Document field | Column |
//! |----------------|--------|
//! | `uuid` | `id` |
//! | `origin` | `origin` |
//! | `metadata__updated_on` | `updated_on` |
//! | `metadata__timestamp` | `stored_timestamp` |
//! | `offset` | `item_offset` |
//! | `project` | `project` |
//!
//! Any other top-level field is reached through `json_extract`.
//!
//! Scroll cursors are rows of the `scrolls` table holding the last sort key
//! returned (keyset pagination), so a cursor sees documents written after it
//! was opened if they sort after its position. Each advance pushes the
//! cursor's expiry forward; expired cursors are purged lazily.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::models::{FIELD_OFFSET, FIELD_ORIGIN, FIELD_TIMESTAMP, FIELD_UPDATED_ON, FIELD_UUID};
use harvest_core::store::{
    IndexStore, ScanRequest, ScrollPage, StoreFilter, DEFAULT_BULK_SIZE, DEFAULT_SCROLL_TTL,
};
use harvest_core::time::{from_epoch, str_to_datetime, to_iso};
use harvest_core::{HarvestError, Result};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Sort key given to documents without a value in the date field; sorts
/// after every ISO-8601 date.
const UNDATED_KEY: &str = "~";

pub struct SqliteStore {
    pool: SqlitePool,
    bulk_size: usize,
    scroll_ttl: Duration,
}

/// SQL expression reading `field`, or `None` for names that cannot be
/// embedded in a JSON path safely.
fn field_expr(field: &str) -> Option<String> {
    let column = match field {
        FIELD_UUID => "id",
        FIELD_ORIGIN => "origin",
        FIELD_UPDATED_ON => "updated_on",
        FIELD_TIMESTAMP => "stored_timestamp",
        FIELD_OFFSET => "item_offset",
        "project" => "project",
        _ => {
            let valid = !field.is_empty()
                && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            return valid.then(|| format!("json_extract(doc, '$.{}')", field));
        }
    };
    Some(column.to_string())
}

/// `expr` as comparable ISO-8601 text; numeric values are read as epoch
/// seconds.
fn date_key_expr(expr: &str) -> String {
    format!(
        "CASE WHEN typeof({0}) IN ('integer', 'real') \
         THEN strftime('%Y-%m-%dT%H:%M:%S', {0}, 'unixepoch') \
         || printf('.%06dZ', CAST(({0} - CAST({0} AS INTEGER)) * 1000000 AS INTEGER)) \
         ELSE CAST({0} AS TEXT) END",
        expr
    )
}

fn sort_key_expr(expr: &str) -> String {
    format!("COALESCE({}, '{}')", date_key_expr(expr), UNDATED_KEY)
}

fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// Persisted state of one scroll cursor.
struct ScrollState {
    id: String,
    filter: Option<StoreFilter>,
    date_field: String,
    from_date: Option<String>,
    page_size: i64,
    last_key: Option<String>,
    last_id: Option<String>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
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

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn expires_at(&self) -> i64 {
        now_secs() + self.scroll_ttl.as_secs() as i64
    }

    /// `WHERE` clause for an optional filter, and whether it binds a value.
    fn filter_clause(filter: Option<&StoreFilter>) -> std::result::Result<String, String> {
        match filter {
            None => Ok("1 = 1".to_string()),
            Some(f) => field_expr(&f.name)
                .map(|expr| format!("{} = ?", expr))
                .ok_or_else(|| format!("unsupported filter field '{}'", f.name)),
        }
    }

    async fn max_value(
        &self,
        field: &str,
        filter: Option<&StoreFilter>,
        as_date: bool,
    ) -> std::result::Result<Option<String>, String> {
        let mut expr = field_expr(field).ok_or_else(|| format!("unsupported field '{}'", field))?;
        if as_date {
            expr = date_key_expr(&expr);
        }
        let clause = Self::filter_clause(filter)?;
        let sql = format!("SELECT CAST(MAX({}) AS TEXT) FROM items WHERE {}", expr, clause);

        let mut query = sqlx::query_scalar::<_, Option<String>>(&sql);
        if let Some(f) = filter {
            query = query.bind(&f.value);
        }
        query.fetch_one(&self.pool).await.map_err(|e| e.to_string())
    }

    async fn next_page(&self, state: &ScrollState) -> std::result::Result<Vec<(String, String, Value)>, String> {
        let expr = field_expr(&state.date_field)
            .ok_or_else(|| format!("unsupported date field '{}'", state.date_field))?;
        let key = sort_key_expr(&expr);

        let mut sql = format!(
            "SELECT id, doc, {} AS sort_key FROM items WHERE {}",
            key,
            Self::filter_clause(state.filter.as_ref())?
        );
        if state.from_date.is_some() {
            sql.push_str(&format!(" AND {} >= ?", date_key_expr(&expr)));
        }
        if state.last_key.is_some() {
            sql.push_str(&format!(" AND ({0} > ? OR ({0} = ? AND id > ?))", key));
        }
        sql.push_str(" ORDER BY sort_key, id LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(f) = &state.filter {
            query = query.bind(&f.value);
        }
        if let Some(from) = &state.from_date {
            query = query.bind(from);
        }
        if let Some(last_key) = &state.last_key {
            query = query
                .bind(last_key)
                .bind(last_key)
                .bind(state.last_id.as_deref().unwrap_or(""));
        }
        query = query.bind(state.page_size);

        let rows = query.fetch_all(&self.pool).await.map_err(|e| e.to_string())?;
        let mut page = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let raw: String = row.get("doc");
            let sort_key: String = row.get("sort_key");
            let doc = serde_json::from_str(&raw).map_err(|e| format!("document {}: {}", id, e))?;
            page.push((id, sort_key, doc));
        }
        Ok(page)
    }

    async fn advance(&self, mut state: ScrollState) -> std::result::Result<ScrollPage, String> {
        let rows = self.next_page(&state).await?;

        let Some((last_id, last_key, _)) = rows.last() else {
            sqlx::query("DELETE FROM scrolls WHERE id = ?")
                .bind(&state.id)
                .execute(&self.pool)
                .await
                .map_err(|e| e.to_string())?;
            return Ok(ScrollPage::empty());
        };
        state.last_id = Some(last_id.clone());
        state.last_key = Some(last_key.clone());

        sqlx::query("UPDATE scrolls SET last_key = ?, last_id = ?, expires_at = ? WHERE id = ?")
            .bind(&state.last_key)
            .bind(&state.last_id)
            .bind(self.expires_at())
            .bind(&state.id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(ScrollPage {
            items: rows.into_iter().map(|(_, _, doc)| doc).collect(),
            scroll_id: Some(state.id),
        })
    }

    async fn open_scroll(&self, request: &ScanRequest) -> std::result::Result<ScrollPage, String> {
        let state = ScrollState {
            id: Uuid::new_v4().to_string(),
            filter: request.filter.clone(),
            date_field: request.date_field.clone(),
            from_date: request.from_date.as_ref().map(to_iso),
            page_size: request.page_size.max(1) as i64,
            last_key: None,
            last_id: None,
        };

        sqlx::query(
            r#"
            INSERT INTO scrolls (id, filter_name, filter_value, date_field, from_date, page_size, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&state.id)
        .bind(state.filter.as_ref().map(|f| f.name.clone()))
        .bind(state.filter.as_ref().map(|f| f.value.clone()))
        .bind(&state.date_field)
        .bind(&state.from_date)
        .bind(state.page_size)
        .bind(self.expires_at())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        self.advance(state).await
    }

    async fn load_scroll(&self, scroll_id: &str) -> std::result::Result<Option<ScrollState>, String> {
        sqlx::query("DELETE FROM scrolls WHERE expires_at < ?")
            .bind(now_secs())
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;

        let row = sqlx::query(
            r#"
            SELECT id, filter_name, filter_value, date_field, from_date, page_size, last_key, last_id
            FROM scrolls WHERE id = ?
            "#,
        )
        .bind(scroll_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(row.map(|row| {
            let filter_name: Option<String> = row.get("filter_name");
            let filter_value: Option<String> = row.get("filter_value");
            ScrollState {
                id: row.get("id"),
                filter: filter_name.zip(filter_value).map(|(n, v)| StoreFilter::new(n, v)),
                date_field: row.get("date_field"),
                from_date: row.get("from_date"),
                page_size: row.get("page_size"),
                last_key: row.get("last_key"),
                last_id: row.get("last_id"),
            }
        }))
    }

    /// Number of stored documents per origin.
    pub async fn counts_by_origin(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT COALESCE(origin, '') AS origin, COUNT(*) AS n FROM items GROUP BY origin ORDER BY origin",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| HarvestError::Store(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|row| (row.get::<String, _>("origin"), row.get::<i64, _>("n")))
            .collect())
    }
}

fn text_field(doc: &Value, field: &str) -> Option<String> {
    doc.get(field).and_then(Value::as_str).map(str::to_string)
}

fn parse_stored_date(raw: &str) -> Option<DateTime<Utc>> {
    str_to_datetime(raw)
        .ok()
        .or_else(|| raw.parse::<f64>().ok().and_then(from_epoch))
}

#[async_trait]
impl IndexStore for SqliteStore {
    async fn last_update(&self, field: &str, filter: Option<&StoreFilter>) -> Option<DateTime<Utc>> {
        match self.max_value(field, filter, true).await {
            Ok(value) => value.as_deref().and_then(parse_stored_date),
            Err(e) => {
                tracing::warn!(field, error = %e, "cannot read last update from sqlite store");
                None
            }
        }
    }

    async fn last_offset(&self, filter: Option<&StoreFilter>) -> Option<u64> {
        match self.max_value(FIELD_OFFSET, filter, false).await {
            Ok(value) => value.and_then(|v| v.parse::<u64>().ok()),
            Err(e) => {
                tracing::warn!(error = %e, "cannot read last offset from sqlite store");
                None
            }
        }
    }

    async fn bulk_upsert(&self, docs: &[Value], id_field: &str) -> Result<usize> {
        if docs.is_empty() {
            return Ok(0);
        }
        let store_err = |e: sqlx::Error| HarvestError::Store(e.to_string());

        let mut tx = self.pool.begin().await.map_err(store_err)?;
        for doc in docs {
            let id = text_field(doc, id_field).ok_or_else(|| {
                HarvestError::Store(format!("document without a string '{}' field", id_field))
            })?;

            sqlx::query(
                r#"
                INSERT INTO items (id, origin, updated_on, stored_timestamp, item_offset, project, doc)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    origin = excluded.origin,
                    updated_on = excluded.updated_on,
                    stored_timestamp = excluded.stored_timestamp,
                    item_offset = excluded.item_offset,
                    project = excluded.project,
                    doc = excluded.doc
                "#,
            )
            .bind(&id)
            .bind(text_field(doc, FIELD_ORIGIN))
            .bind(text_field(doc, FIELD_UPDATED_ON))
            .bind(text_field(doc, FIELD_TIMESTAMP))
            .bind(doc.get(FIELD_OFFSET).and_then(Value::as_i64))
            .bind(text_field(doc, "project"))
            .bind(doc.to_string())
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)?;

        tracing::debug!(count = docs.len(), "bulk upsert");
        Ok(docs.len())
    }

    async fn scan(&self, request: &ScanRequest) -> ScrollPage {
        self.open_scroll(request).await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "cannot open scroll on sqlite store");
            ScrollPage::empty()
        })
    }

    async fn scroll(&self, scroll_id: &str) -> ScrollPage {
        let state = match self.load_scroll(scroll_id).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                tracing::warn!(scroll_id, "scroll cursor expired or unknown");
                return ScrollPage::empty();
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot read scroll cursor");
                return ScrollPage::empty();
            }
        };
        self.advance(state).await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "cannot advance scroll on sqlite store");
            ScrollPage::empty()
        })
    }

    fn bulk_size(&self) -> usize {
        self.bulk_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::create_schema;
    use harvest_core::reader::ItemReader;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Arc;

    async fn store() -> SqliteStore {
        // One connection so every query sees the same in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        create_schema(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    fn doc(uuid: &str, origin: &str, updated: Option<&str>) -> Value {
        let mut d = json!({ "uuid": uuid, "origin": origin, "data": { "n": uuid } });
        if let Some(u) = updated {
            d[FIELD_UPDATED_ON] = json!(u);
        }
        d
    }

    #[test]
    fn field_names_map_to_columns_or_json() {
        assert_eq!(field_expr("metadata__updated_on").unwrap(), "updated_on");
        assert_eq!(field_expr("offset").unwrap(), "item_offset");
        assert_eq!(field_expr("grimoire_creation_date").unwrap(), "json_extract(doc, '$.grimoire_creation_date')");
        assert!(field_expr("x'); DROP TABLE items; --").is_none());
        assert!(field_expr("").is_none());
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = store().await;
        let first = doc("a", "o", Some("2015-08-12T18:32:10.000000Z"));
        let mut second = first.clone();
        second["data"] = json!({ "n": "changed" });

        store.bulk_upsert(&[first], FIELD_UUID).await.unwrap();
        store.bulk_upsert(&[second], FIELD_UUID).await.unwrap();
        assert_eq!(store.bulk_upsert(&[], FIELD_UUID).await.unwrap(), 0);

        let counts = store.counts_by_origin().await.unwrap();
        assert_eq!(counts, vec![("o".to_string(), 1)]);

        let all = ItemReader::new(Arc::new(store), ScanRequest::new(FIELD_UPDATED_ON))
            .collect_all()
            .await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["data"]["n"], "changed");
    }

    #[tokio::test]
    async fn missing_id_is_a_store_error() {
        let store = store().await;
        let err = store
            .bulk_upsert(&[json!({ "origin": "o" })], FIELD_UUID)
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Store(_)));
    }

    #[tokio::test]
    async fn last_update_and_offset_per_origin() {
        let store = store().await;
        assert!(store.last_update(FIELD_UPDATED_ON, None).await.is_none());

        let mut with_offset = doc("c", "k", Some("2016-01-01T00:00:00.000000Z"));
        with_offset["offset"] = json!(41);
        store
            .bulk_upsert(
                &[
                    doc("a", "http://example.com", Some("2015-08-12T18:32:10.000000Z")),
                    doc("b", "http://example.com", Some("2009-07-22T15:27:25.000000Z")),
                    with_offset,
                ],
                FIELD_UUID,
            )
            .await
            .unwrap();

        let last = store
            .last_update(FIELD_UPDATED_ON, Some(&StoreFilter::origin("http://example.com")))
            .await
            .unwrap();
        assert_eq!(to_iso(&last), "2015-08-12T18:32:10.000000Z");

        assert_eq!(store.last_offset(Some(&StoreFilter::origin("k"))).await, Some(41));
        assert_eq!(store.last_offset(Some(&StoreFilter::origin("http://example.com"))).await, None);
        assert!(store
            .last_update(FIELD_UPDATED_ON, Some(&StoreFilter::new("bad name!", "x")))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn scroll_is_ascending_and_filtered() {
        let store = store().await;
        store
            .bulk_upsert(
                &[
                    doc("3", "o", Some("2012-01-01T00:00:00.000000Z")),
                    doc("1", "o", Some("2010-01-01T00:00:00.000000Z")),
                    doc("x", "other", Some("2011-01-01T00:00:00.000000Z")),
                    doc("u", "o", None),
                    doc("2", "o", Some("2011-01-01T00:00:00.000000Z")),
                ],
                FIELD_UUID,
            )
            .await
            .unwrap();
        let store = Arc::new(store);

        let request = ScanRequest::new(FIELD_UPDATED_ON)
            .with_filter(StoreFilter::origin("o"))
            .with_page_size(1);
        let ids: Vec<String> = ItemReader::new(store.clone(), request.clone())
            .collect_all()
            .await
            .iter()
            .map(|d| d["uuid"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["1", "2", "3", "u"]);

        let from = str_to_datetime("2011-01-01").unwrap();
        let recent = ItemReader::new(store.clone(), request.with_from_date(Some(from)))
            .collect_all()
            .await;
        assert_eq!(recent.len(), 2);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scrolls")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn epoch_dates_compare_with_iso_dates() {
        let store = store().await;
        let mut docs = vec![
            doc("1", "o", None),
            doc("2", "o", None),
            doc("3", "o", None),
            doc("4", "o", None),
        ];
        docs[0]["grimoire_creation_date"] = json!("2015-08-12T18:32:10.000000Z");
        docs[1]["grimoire_creation_date"] = json!(1439404330.5);
        docs[2]["grimoire_creation_date"] = json!(1230768000);
        docs[3]["grimoire_creation_date"] = json!("2009-07-22T15:27:25.000000Z");
        store.bulk_upsert(&docs, FIELD_UUID).await.unwrap();
        let store = Arc::new(store);

        let request = ScanRequest::new("grimoire_creation_date").with_page_size(2);
        let ids: Vec<String> = ItemReader::new(store.clone(), request.clone())
            .collect_all()
            .await
            .iter()
            .map(|d| d["uuid"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["3", "4", "1", "2"]);

        let from = str_to_datetime("2010-01-01").unwrap();
        let recent: Vec<String> = ItemReader::new(store.clone(), request.with_from_date(Some(from)))
            .collect_all()
            .await
            .iter()
            .map(|d| d["uuid"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(recent, vec!["1", "2"]);

        assert_eq!(
            store.last_update("grimoire_creation_date", None).await,
            str_to_datetime("2015-08-12T18:32:10.500000Z").ok()
        );
    }

    #[tokio::test]
    async fn expired_or_unknown_scroll_is_empty() {
        let store = store().await.with_scroll_ttl(Duration::from_secs(0));
        store
            .bulk_upsert(
                &[
                    doc("1", "o", Some("2010-01-01T00:00:00.000000Z")),
                    doc("2", "o", Some("2011-01-01T00:00:00.000000Z")),
                ],
                FIELD_UUID,
            )
            .await
            .unwrap();

        let page = store
            .scan(&ScanRequest::new(FIELD_UPDATED_ON).with_page_size(1))
            .await;
        let scroll_id = page.scroll_id.unwrap();
        sqlx::query("UPDATE scrolls SET expires_at = 0")
            .execute(store.pool())
            .await
            .unwrap();

        assert!(store.scroll(&scroll_id).await.items.is_empty());
        assert!(store.scroll("nope").await.scroll_id.is_none());
    }
}
