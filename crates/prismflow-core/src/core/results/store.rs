//! Result Store
//!
//! Durable table of committed summaries, one row per image id.

use std::path::Path;

use rusqlite::types::ToSql;
use rusqlite::{params, OptionalExtension};

use crate::core::storage::{fmt_timestamp, SqliteDb};
use crate::core::{CoreError, CoreResult};

use super::{ResultFilter, ResultOrder, ResultSummary};

// =============================================================================
// Result Store Trait
// =============================================================================

/// Durable storage of finished summaries
pub trait ResultStore: Send + Sync {
    /// Inserts or replaces the summary for `summary.id`.
    ///
    /// Repeating an upsert with the same value leaves the store unchanged,
    /// including the summary's listing position.
    fn upsert(&self, summary: &ResultSummary) -> CoreResult<()>;

    /// Returns the summary for an image
    fn get(&self, id: &str) -> CoreResult<Option<ResultSummary>>;

    /// Lists up to `limit` summaries matching `filter`
    fn list(&self, limit: usize, filter: &ResultFilter) -> CoreResult<Vec<ResultSummary>>;

    /// Number of stored summaries
    fn count(&self) -> CoreResult<usize>;
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS results (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        file_name TEXT NOT NULL,
        blob_path TEXT NOT NULL,
        analyzed_at TEXT NOT NULL,
        status TEXT NOT NULL,
        body TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_results_analyzed ON results(analyzed_at);
"#;

// =============================================================================
// SQLite Result Store
// =============================================================================

/// SQLite-backed result store
pub struct SqliteResultStore {
    db: SqliteDb,
}

impl SqliteResultStore {
    /// Opens (or creates) the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        Ok(Self {
            db: SqliteDb::open(path, SCHEMA)?,
        })
    }

    /// Creates an in-memory store (for testing)
    pub fn in_memory() -> CoreResult<Self> {
        Ok(Self {
            db: SqliteDb::in_memory(SCHEMA)?,
        })
    }
}

fn parse_body(id: &str, body: &str) -> CoreResult<ResultSummary> {
    serde_json::from_str(body).map_err(|e| {
        CoreError::RecordCorrupted(format!("result {} has an unreadable body: {}", id, e))
    })
}

impl ResultStore for SqliteResultStore {
    fn upsert(&self, summary: &ResultSummary) -> CoreResult<()> {
        let body = serde_json::to_string(summary)?;

        self.db.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO results (id, file_name, blob_path, analyzed_at, status, body)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(id) DO UPDATE SET
                    file_name = excluded.file_name,
                    blob_path = excluded.blob_path,
                    analyzed_at = excluded.analyzed_at,
                    status = excluded.status,
                    body = excluded.body
                "#,
                params![
                    summary.id,
                    summary.file_name,
                    summary.blob_path,
                    fmt_timestamp(summary.analyzed_at),
                    summary.status.as_str(),
                    body,
                ],
            )?;
            Ok(())
        })?;

        tracing::debug!(image_id = %summary.id, "Result upserted");
        Ok(())
    }

    fn get(&self, id: &str) -> CoreResult<Option<ResultSummary>> {
        let body: Option<String> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row("SELECT body FROM results WHERE id = ?1", [id], |row| {
                    row.get(0)
                })
                .optional()?)
        })?;

        body.map(|b| parse_body(id, &b)).transpose()
    }

    fn list(&self, limit: usize, filter: &ResultFilter) -> CoreResult<Vec<ResultSummary>> {
        let mut sql = String::from("SELECT id, body FROM results WHERE 1 = 1");
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(needle) = &filter.file_name_contains {
            args.push(Box::new(needle.to_lowercase()));
            sql.push_str(&format!(" AND instr(lower(file_name), ?{}) > 0", args.len()));
        }
        if let Some(after) = filter.analyzed_after {
            args.push(Box::new(fmt_timestamp(after)));
            sql.push_str(&format!(" AND analyzed_at >= ?{}", args.len()));
        }
        if let Some(status) = filter.status {
            args.push(Box::new(status.as_str()));
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }

        sql.push_str(match filter.order {
            ResultOrder::Insertion => " ORDER BY seq ASC",
            ResultOrder::NewestFirst => " ORDER BY analyzed_at DESC, seq DESC",
        });

        args.push(Box::new(i64::try_from(limit).unwrap_or(i64::MAX)));
        sql.push_str(&format!(" LIMIT ?{}", args.len()));

        let rows: Vec<(String, String)> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn ToSql> = args.iter().map(|a| a.as_ref()).collect();
            let rows = stmt
                .query_map(params.as_slice(), |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.iter().map(|(id, body)| parse_body(id, body)).collect()
    }

    fn count(&self) -> CoreResult<usize> {
        let count: i64 = self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM results", [], |row| row.get(0))?)
        })?;
        Ok(count as usize)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::results::SummaryStatus;
    use chrono::{DateTime, Duration, Utc};
    use serde_json::json;
    use tempfile::TempDir;

    fn summary(name: &str, analyzed_at: DateTime<Utc>, status: SummaryStatus) -> ResultSummary {
        let image = crate::core::ImageRef::new(&format!("images/{}", name));
        let mut fields = serde_json::Map::new();
        fields.insert("hasText".to_string(), json!(false));
        ResultSummary {
            id: image.id().to_string(),
            file_name: image.file_name().to_string(),
            blob_path: image.location().to_string(),
            analyzed_at,
            status,
            failed_analyzers: Vec::new(),
            summary: fields,
            analyses: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_get_missing() {
        let store = SqliteResultStore::in_memory().unwrap();
        assert!(store.get("nope").unwrap().is_none());
    }

    #[test]
    fn test_upsert_and_get() {
        let store = SqliteResultStore::in_memory().unwrap();
        let s = summary("a.jpg", Utc::now(), SummaryStatus::Complete);
        store.upsert(&s).unwrap();

        assert_eq!(store.get(&s.id).unwrap(), Some(s));
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = SqliteResultStore::in_memory().unwrap();
        let s = summary("a.jpg", Utc::now(), SummaryStatus::Complete);
        store.upsert(&s).unwrap();
        store.upsert(&s).unwrap();
        store.upsert(&s).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.list(10, &ResultFilter::default()).unwrap(), vec![s]);
    }

    #[test]
    fn test_count_matches_distinct_ids() {
        let store = SqliteResultStore::in_memory().unwrap();
        let now = Utc::now();
        for name in ["a.jpg", "b.jpg", "a.jpg", "c.jpg", "b.jpg"] {
            store.upsert(&summary(name, now, SummaryStatus::Complete)).unwrap();
        }
        assert_eq!(store.count().unwrap(), 3);
        assert_eq!(store.list(100, &ResultFilter::default()).unwrap().len(), 3);
    }

    #[test]
    fn test_list_insertion_order_survives_upsert() {
        let store = SqliteResultStore::in_memory().unwrap();
        let now = Utc::now();
        let a = summary("a.jpg", now, SummaryStatus::Complete);
        let b = summary("b.jpg", now - Duration::seconds(10), SummaryStatus::Complete);
        store.upsert(&a).unwrap();
        store.upsert(&b).unwrap();
        store.upsert(&a).unwrap();

        let names: Vec<String> = store
            .list(10, &ResultFilter::default())
            .unwrap()
            .into_iter()
            .map(|s| s.file_name)
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.jpg"]);
    }

    #[test]
    fn test_list_newest_first_with_limit() {
        let store = SqliteResultStore::in_memory().unwrap();
        let now = Utc::now();
        store.upsert(&summary("old.jpg", now - Duration::hours(2), SummaryStatus::Complete)).unwrap();
        store.upsert(&summary("new.jpg", now, SummaryStatus::Complete)).unwrap();
        store.upsert(&summary("mid.jpg", now - Duration::hours(1), SummaryStatus::Complete)).unwrap();

        let listed = store.list(2, &ResultFilter::newest_first()).unwrap();
        let names: Vec<&str> = listed.iter().map(|s| s.file_name.as_str()).collect();
        assert_eq!(names, vec!["new.jpg", "mid.jpg"]);
    }

    #[test]
    fn test_list_filters() {
        let store = SqliteResultStore::in_memory().unwrap();
        let now = Utc::now();
        store.upsert(&summary("Beach.jpg", now, SummaryStatus::Complete)).unwrap();
        store.upsert(&summary("beach-2.png", now - Duration::days(3), SummaryStatus::Partial)).unwrap();
        store.upsert(&summary("city.jpg", now, SummaryStatus::Partial)).unwrap();

        let by_name = store
            .list(10, &ResultFilter::default().with_file_name("BEACH"))
            .unwrap();
        assert_eq!(by_name.len(), 2);

        let partial = store
            .list(10, &ResultFilter::default().with_status(SummaryStatus::Partial))
            .unwrap();
        assert_eq!(partial.len(), 2);

        let recent_partial = store
            .list(
                10,
                &ResultFilter::default()
                    .with_status(SummaryStatus::Partial)
                    .with_analyzed_after(now - Duration::days(1)),
            )
            .unwrap();
        assert_eq!(recent_partial.len(), 1);
        assert_eq!(recent_partial[0].file_name, "city.jpg");
    }

    #[test]
    fn test_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("results.db");
        let s = summary("a.jpg", Utc::now(), SummaryStatus::Partial);
        {
            let store = SqliteResultStore::open(&path).unwrap();
            store.upsert(&s).unwrap();
        }
        let store = SqliteResultStore::open(&path).unwrap();
        assert_eq!(store.get(&s.id).unwrap(), Some(s));
    }
}
