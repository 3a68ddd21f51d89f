//! Orchestration State Store
//!
//! Durable records of in-flight and finished orchestrations.
//!
//! Every write is atomic per record. Writes are fenced on the lease: a record
//! leased by another live instance cannot be overwritten.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::core::storage::{fmt_timestamp, SqliteDb};
use crate::core::{CoreError, CoreResult, ImageId};

use super::{OrchestrationRecord, OrchestrationStatus};

// =============================================================================
// State Store Trait
// =============================================================================

/// Persistence for orchestration records
pub trait OrchestrationStateStore: Send + Sync {
    /// Persists `record` only if no record with its id exists.
    ///
    /// Returns `false` when another writer got there first.
    fn create(&self, record: &OrchestrationRecord) -> CoreResult<bool>;

    /// Inserts or replaces `record`.
    ///
    /// Fails with [`CoreError::LeaseHeld`] when the stored record is leased by
    /// a different instance whose lease has not expired.
    fn save(&self, record: &OrchestrationRecord) -> CoreResult<()>;

    fn load(&self, id: &str) -> CoreResult<Option<OrchestrationRecord>>;

    /// Records still in `running` state
    fn list_incomplete(&self) -> CoreResult<Vec<OrchestrationRecord>>;

    fn delete(&self, id: &str) -> CoreResult<()>;

    /// Takes the lease for `owner` if it is free, expired or already held by
    /// `owner`. Returns the claimed record, or `None` if another instance
    /// holds a live lease.
    fn try_claim(
        &self,
        id: &str,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<OrchestrationRecord>>;

    /// Ids of completed or failed records finished before `cutoff`
    fn list_finished_before(&self, cutoff: DateTime<Utc>) -> CoreResult<Vec<ImageId>>;
}

/// Rejects a write that would clobber another instance's live lease
pub(crate) fn check_fence(
    stored: &OrchestrationRecord,
    incoming: &OrchestrationRecord,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    let owner = incoming.lease_owner.as_deref().unwrap_or_default();
    if stored.is_claimable_by(owner, now) {
        Ok(())
    } else {
        Err(CoreError::LeaseHeld(stored.id().to_string()))
    }
}

pub(crate) fn parse_record(id: &str, body: &str) -> CoreResult<OrchestrationRecord> {
    serde_json::from_str(body).map_err(|e| {
        CoreError::RecordCorrupted(format!("orchestration {} has an unreadable body: {}", id, e))
    })
}

// =============================================================================
// SQLite State Store
// =============================================================================

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS orchestrations (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        lease_owner TEXT,
        lease_expires_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        completed_at TEXT,
        body TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_orchestrations_status ON orchestrations(status);
"#;

/// One row per record with the full record as a JSON body
pub struct SqliteStateStore {
    db: SqliteDb,
}

impl SqliteStateStore {
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

fn load_in(conn: &Connection, id: &str) -> CoreResult<Option<OrchestrationRecord>> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM orchestrations WHERE id = ?1",
            [id],
            |row| row.get(0),
        )
        .optional()?;
    body.map(|b| parse_record(id, &b)).transpose()
}

fn write_in(conn: &Connection, record: &OrchestrationRecord) -> CoreResult<()> {
    let body = serde_json::to_string(record)?;
    conn.execute(
        r#"
        INSERT OR REPLACE INTO orchestrations
            (id, status, lease_owner, lease_expires_at, created_at, updated_at, completed_at, body)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            record.id(),
            record.status.as_str(),
            record.lease_owner,
            record.lease_expires_at.map(fmt_timestamp),
            fmt_timestamp(record.created_at),
            fmt_timestamp(record.updated_at),
            record.completed_at.map(fmt_timestamp),
            body,
        ],
    )?;
    Ok(())
}

impl OrchestrationStateStore for SqliteStateStore {
    fn create(&self, record: &OrchestrationRecord) -> CoreResult<bool> {
        self.db.with_transaction(|tx| {
            let exists: bool = tx
                .query_row(
                    "SELECT 1 FROM orchestrations WHERE id = ?1",
                    [record.id()],
                    |_| Ok(true),
                )
                .optional()?
                .unwrap_or(false);
            if exists {
                return Ok(false);
            }
            write_in(tx, record)?;
            Ok(true)
        })
    }

    fn save(&self, record: &OrchestrationRecord) -> CoreResult<()> {
        self.db.with_transaction(|tx| {
            if let Some(stored) = load_in(tx, record.id())? {
                check_fence(&stored, record, Utc::now())?;
            }
            write_in(tx, record)
        })
    }

    fn load(&self, id: &str) -> CoreResult<Option<OrchestrationRecord>> {
        self.db.with_conn(|conn| load_in(conn, id))
    }

    fn list_incomplete(&self) -> CoreResult<Vec<OrchestrationRecord>> {
        let rows: Vec<(String, String)> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, body FROM orchestrations WHERE status = ?1 ORDER BY created_at",
            )?;
            let rows = stmt
                .query_map([OrchestrationStatus::Running.as_str()], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.iter().map(|(id, body)| parse_record(id, body)).collect()
    }

    fn delete(&self, id: &str) -> CoreResult<()> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM orchestrations WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    fn try_claim(
        &self,
        id: &str,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<OrchestrationRecord>> {
        self.db.with_transaction(|tx| {
            let mut record = load_in(tx, id)?
                .ok_or_else(|| CoreError::OrchestrationNotFound(id.to_string()))?;
            if !record.is_claimable_by(owner, now) {
                return Ok(None);
            }
            record.renew_lease(owner, lease, now);
            record.updated_at = now;
            write_in(tx, &record)?;
            Ok(Some(record))
        })
    }

    fn list_finished_before(&self, cutoff: DateTime<Utc>) -> CoreResult<Vec<ImageId>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id FROM orchestrations
                WHERE status != ?1 AND completed_at IS NOT NULL AND completed_at < ?2
                ORDER BY completed_at
                "#,
            )?;
            let ids = stmt
                .query_map(
                    params![OrchestrationStatus::Running.as_str(), fmt_timestamp(cutoff)],
                    |row| row.get(0),
                )?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(ids)
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::analysis::AnalysisKind;
    use crate::core::ImageRef;
    use tempfile::TempDir;

    const LEASE: Duration = Duration::from_secs(60);

    fn leased_record(name: &str, owner: &str, now: DateTime<Utc>) -> OrchestrationRecord {
        let mut record =
            OrchestrationRecord::new(ImageRef::new(name), &AnalysisKind::ALL, now);
        record.renew_lease(owner, LEASE, now);
        record
    }

    #[test]
    fn test_create_if_absent() {
        let store = SqliteStateStore::in_memory().unwrap();
        let record = leased_record("a.jpg", "me", Utc::now());

        assert!(store.create(&record).unwrap());
        assert!(!store.create(&record).unwrap());
        assert_eq!(store.load(record.id()).unwrap(), Some(record));
    }

    #[test]
    fn test_save_and_load() {
        let store = SqliteStateStore::in_memory().unwrap();
        let mut record = leased_record("a.jpg", "me", Utc::now());
        store.create(&record).unwrap();

        record.task_mut(AnalysisKind::Color).unwrap().start_attempt();
        store.save(&record).unwrap();

        let loaded = store.load(record.id()).unwrap().unwrap();
        assert_eq!(loaded.task(AnalysisKind::Color).unwrap().attempts, 1);
    }

    #[test]
    fn test_save_rejected_under_foreign_lease() {
        let store = SqliteStateStore::in_memory().unwrap();
        let now = Utc::now();
        let record = leased_record("a.jpg", "owner-a", now);
        store.create(&record).unwrap();

        let mut intruder = record.clone();
        intruder.renew_lease("owner-b", LEASE, now);
        assert!(matches!(
            store.save(&intruder),
            Err(CoreError::LeaseHeld(_))
        ));
    }

    #[test]
    fn test_try_claim() {
        let store = SqliteStateStore::in_memory().unwrap();
        let now = Utc::now();
        let record = leased_record("a.jpg", "owner-a", now);
        store.create(&record).unwrap();

        assert!(store.try_claim(record.id(), "owner-b", LEASE, now).unwrap().is_none());

        let later = now + chrono::Duration::seconds(120);
        let claimed = store
            .try_claim(record.id(), "owner-b", LEASE, later)
            .unwrap()
            .unwrap();
        assert_eq!(claimed.lease_owner.as_deref(), Some("owner-b"));

        let stored = store.load(record.id()).unwrap().unwrap();
        assert_eq!(stored.lease_owner.as_deref(), Some("owner-b"));
    }

    #[test]
    fn test_try_claim_missing() {
        let store = SqliteStateStore::in_memory().unwrap();
        assert!(matches!(
            store.try_claim("nope", "me", LEASE, Utc::now()),
            Err(CoreError::OrchestrationNotFound(_))
        ));
    }

    #[test]
    fn test_list_incomplete_and_finished() {
        let store = SqliteStateStore::in_memory().unwrap();
        let now = Utc::now();

        let running = leased_record("running.jpg", "me", now);
        let mut done = leased_record("done.jpg", "me", now);
        done.mark_completed(now - chrono::Duration::days(40));
        let failed = OrchestrationRecord::failed(ImageRef::new("gone.jpg"), "missing", now);

        for record in [&running, &done, &failed] {
            store.create(record).unwrap();
        }

        let incomplete: Vec<String> = store
            .list_incomplete()
            .unwrap()
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        assert_eq!(incomplete, vec![running.id().to_string()]);

        let cutoff = now - chrono::Duration::days(30);
        assert_eq!(
            store.list_finished_before(cutoff).unwrap(),
            vec![done.id().to_string()]
        );

        store.delete(done.id()).unwrap();
        assert!(store.load(done.id()).unwrap().is_none());
        assert!(store.list_finished_before(cutoff).unwrap().is_empty());
    }

    #[test]
    fn test_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("orchestrations.db");
        let record = leased_record("a.jpg", "me", Utc::now());
        {
            let store = SqliteStateStore::open(&path).unwrap();
            store.create(&record).unwrap();
        }
        let store = SqliteStateStore::open(&path).unwrap();
        assert_eq!(store.list_incomplete().unwrap(), vec![record]);
    }
}
