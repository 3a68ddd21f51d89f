//! File-backed Orchestration State Store
//!
//! Storage: `{state_dir}/{image_id}.json`, one file per record, written via
//! temp file + rename. Read-check-write sequences run under a process mutex
//! and an advisory lock file so concurrent writers cannot interleave.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::core::{CoreError, CoreResult, ImageId};

use super::state_store::{check_fence, parse_record};
use super::{OrchestrationRecord, OrchestrationStateStore, OrchestrationStatus};

/// Advisory lock shared by every process using the directory
const LOCK_FILE: &str = ".orchestrations.lock";

/// One JSON file per orchestration record
pub struct FileStateStore {
    state_dir: PathBuf,
    guard: Mutex<()>,
}

impl FileStateStore {
    /// Creates a store rooted at `state_dir`, creating the directory
    pub fn new(state_dir: impl Into<PathBuf>) -> CoreResult<Self> {
        let state_dir = state_dir.into();
        fs::create_dir_all(&state_dir).map_err(|e| {
            CoreError::StoreUnavailable(format!(
                "Failed to create state directory {}: {}",
                state_dir.display(),
                e
            ))
        })?;
        Ok(Self {
            state_dir,
            guard: Mutex::new(()),
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Returns the file path for a record
    pub fn record_path(&self, id: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", id))
    }

    fn locked<T>(&self, op: impl FnOnce() -> CoreResult<T>) -> CoreResult<T> {
        let _guard = self.guard.lock().map_err(|_| {
            CoreError::StoreUnavailable("state directory lock poisoned".to_string())
        })?;

        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.state_dir.join(LOCK_FILE))?;
        fs2::FileExt::lock_exclusive(&lock_file)?;

        let result = op();

        if let Err(e) = fs2::FileExt::unlock(&lock_file) {
            warn!("Failed to unlock state directory lock file: {}", e);
        }
        result
    }

    fn read(&self, id: &str) -> CoreResult<Option<OrchestrationRecord>> {
        let path = self.record_path(id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CoreError::StoreUnavailable(format!(
                    "Failed to read state file {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        parse_record(id, &content).map(Some)
    }

    fn write(&self, record: &OrchestrationRecord) -> CoreResult<()> {
        let path = self.record_path(record.id());
        let temp_path = self.state_dir.join(format!(
            ".{}.json.tmp.{}",
            record.id(),
            std::process::id()
        ));

        let content = serde_json::to_string_pretty(record)?;
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;

        fs::rename(&temp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            CoreError::StoreUnavailable(format!(
                "Failed to rename state file {} to {}: {}",
                temp_path.display(),
                path.display(),
                e
            ))
        })
    }

    fn read_all(&self) -> CoreResult<Vec<OrchestrationRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.state_dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if id.starts_with('.') {
                continue;
            }
            if let Some(record) = self.read(id)? {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

impl OrchestrationStateStore for FileStateStore {
    fn create(&self, record: &OrchestrationRecord) -> CoreResult<bool> {
        self.locked(|| {
            if self.record_path(record.id()).exists() {
                return Ok(false);
            }
            self.write(record)?;
            Ok(true)
        })
    }

    fn save(&self, record: &OrchestrationRecord) -> CoreResult<()> {
        self.locked(|| {
            if let Some(stored) = self.read(record.id())? {
                check_fence(&stored, record, Utc::now())?;
            }
            self.write(record)
        })
    }

    fn load(&self, id: &str) -> CoreResult<Option<OrchestrationRecord>> {
        self.read(id)
    }

    fn list_incomplete(&self) -> CoreResult<Vec<OrchestrationRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| r.status == OrchestrationStatus::Running)
            .collect())
    }

    fn delete(&self, id: &str) -> CoreResult<()> {
        self.locked(|| match fs::remove_file(self.record_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        })
    }

    fn try_claim(
        &self,
        id: &str,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<OrchestrationRecord>> {
        self.locked(|| {
            let mut record = self
                .read(id)?
                .ok_or_else(|| CoreError::OrchestrationNotFound(id.to_string()))?;
            if !record.is_claimable_by(owner, now) {
                return Ok(None);
            }
            record.renew_lease(owner, lease, now);
            record.updated_at = now;
            self.write(&record)?;
            Ok(Some(record))
        })
    }

    fn list_finished_before(&self, cutoff: DateTime<Utc>) -> CoreResult<Vec<ImageId>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| r.status != OrchestrationStatus::Running)
            .filter(|r| r.completed_at.is_some_and(|at| at < cutoff))
            .map(|r| r.id().to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::analysis::AnalysisKind;
    use crate::core::ImageRef;
    use std::sync::Arc;
    use tempfile::TempDir;

    const LEASE: Duration = Duration::from_secs(60);

    fn create_test_store() -> (TempDir, FileStateStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStateStore::new(temp_dir.path().join("orchestrations")).unwrap();
        (temp_dir, store)
    }

    fn leased_record(name: &str, owner: &str) -> OrchestrationRecord {
        let now = Utc::now();
        let mut record = OrchestrationRecord::new(ImageRef::new(name), &AnalysisKind::ALL, now);
        record.renew_lease(owner, LEASE, now);
        record
    }

    #[test]
    fn test_create_if_absent() {
        let (_temp_dir, store) = create_test_store();
        let record = leased_record("a.jpg", "me");

        assert!(store.create(&record).unwrap());
        assert!(!store.create(&record).unwrap());
        assert!(store.record_path(record.id()).exists());
        assert_eq!(store.load(record.id()).unwrap(), Some(record));
    }

    #[test]
    fn test_concurrent_create_has_one_winner() {
        let (_temp_dir, store) = create_test_store();
        let store = Arc::new(store);
        let record = leased_record("race.jpg", "me");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let record = record.clone();
                std::thread::spawn(move || store.create(&record).unwrap())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_save_fenced_by_lease() {
        let (_temp_dir, store) = create_test_store();
        let record = leased_record("a.jpg", "owner-a");
        store.create(&record).unwrap();

        let mut intruder = record.clone();
        intruder.renew_lease("owner-b", LEASE, Utc::now());
        assert!(matches!(store.save(&intruder), Err(CoreError::LeaseHeld(_))));

        let mut own = record.clone();
        own.task_mut(AnalysisKind::Text).unwrap().start_attempt();
        store.save(&own).unwrap();
    }

    #[test]
    fn test_try_claim_after_expiry() {
        let (_temp_dir, store) = create_test_store();
        let record = leased_record("a.jpg", "owner-a");
        store.create(&record).unwrap();

        let now = Utc::now();
        assert!(store.try_claim(record.id(), "owner-b", LEASE, now).unwrap().is_none());
        let later = now + chrono::Duration::seconds(120);
        let claimed = store.try_claim(record.id(), "owner-b", LEASE, later).unwrap();
        assert_eq!(claimed.unwrap().lease_owner.as_deref(), Some("owner-b"));
    }

    #[test]
    fn test_listing_skips_temp_and_lock_files() {
        let (_temp_dir, store) = create_test_store();
        let record = leased_record("a.jpg", "me");
        store.create(&record).unwrap();
        fs::write(store.state_dir().join(".x.json.tmp.1"), "garbage").unwrap();

        assert_eq!(store.list_incomplete().unwrap().len(), 1);
    }

    #[test]
    fn test_finished_records_and_delete() {
        let (_temp_dir, store) = create_test_store();
        let now = Utc::now();
        let mut done = leased_record("done.jpg", "me");
        done.mark_completed(now - chrono::Duration::days(10));
        store.create(&done).unwrap();

        assert!(store.list_incomplete().unwrap().is_empty());
        assert_eq!(
            store.list_finished_before(now - chrono::Duration::days(1)).unwrap(),
            vec![done.id().to_string()]
        );

        store.delete(done.id()).unwrap();
        store.delete(done.id()).unwrap();
        assert!(store.load(done.id()).unwrap().is_none());
    }

    #[test]
    fn test_corrupted_file() {
        let (_temp_dir, store) = create_test_store();
        fs::write(store.record_path("bad"), "{not json").unwrap();
        assert!(matches!(store.load("bad"), Err(CoreError::RecordCorrupted(_))));
    }
}
