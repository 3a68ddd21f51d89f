//! Pipeline Settings
//!
//! Provides persistent pipeline configuration with:
//! - Atomic file writes (temp file + rename)
//! - Defaults for every field so partial files stay valid
//! - Normalization that clamps bad values instead of failing
//! - Environment overrides for the container root and data directory

use serde::{Deserialize, Serialize};
use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::core::{CoreError, CoreResult};

/// Settings schema version for migration support
pub const SETTINGS_VERSION: u32 = 1;

/// Settings file name
pub const SETTINGS_FILE: &str = "prismflow.json";

/// Lock file name (advisory lock to prevent concurrent writers)
pub const SETTINGS_LOCK_FILE: &str = "prismflow.json.lock";

/// Overrides `containerRoot`
pub const ENV_CONTAINER_ROOT: &str = "PRISMFLOW_CONTAINER_ROOT";

/// Overrides the directory holding the databases and state files
pub const ENV_DATA_DIR: &str = "PRISMFLOW_DATA_DIR";

/// Backend used for orchestration state
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StateBackend {
    /// One row per record in SQLite
    #[default]
    Sqlite,
    /// One JSON file per record
    File,
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSettings {
    /// Schema version for migrations
    #[serde(default = "default_version")]
    pub version: u32,

    /// Root directory holding the storage containers
    #[serde(default = "default_container_root")]
    pub container_root: PathBuf,

    /// Directory for databases, state files and logs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Orchestration state backend
    #[serde(default)]
    pub state_backend: StateBackend,

    /// Per-attempt analyzer budget in seconds
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Additional attempts after the first failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff between attempts (multiplied by the attempt number)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Lease held on an orchestration record, renewed on every save
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// Images driven concurrently by one orchestrator
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_orchestrations: usize,

    /// Age after which finished state records are purged
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Directory for rolling log files (stdout only when unset)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("prismflow"))
        .unwrap_or_else(|| PathBuf::from(".prismflow"))
}

fn default_container_root() -> PathBuf {
    default_data_dir().join("containers")
}

fn default_task_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_lease_secs() -> u64 {
    300
}

fn default_max_concurrent() -> usize {
    num_cpus::get().max(2)
}

fn default_retention_days() -> u32 {
    30
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            container_root: default_container_root(),
            data_dir: default_data_dir(),
            state_backend: StateBackend::default(),
            task_timeout_secs: default_task_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            lease_secs: default_lease_secs(),
            max_concurrent_orchestrations: default_max_concurrent(),
            retention_days: default_retention_days(),
            log_dir: None,
        }
    }
}

impl PipelineSettings {
    /// Normalizes and clamps settings so persisted state is always valid.
    pub fn normalize(&mut self) {
        self.version = SETTINGS_VERSION;
        self.task_timeout_secs = self.task_timeout_secs.clamp(1, 3600);
        self.max_retries = self.max_retries.min(10);
        self.retry_backoff_ms = self.retry_backoff_ms.min(60_000);
        // A lease shorter than one attempt would expire mid-task.
        self.lease_secs = self.lease_secs.clamp(self.task_timeout_secs + 1, 86_400);
        self.max_concurrent_orchestrations = self.max_concurrent_orchestrations.clamp(1, 256);
        self.retention_days = self.retention_days.clamp(1, 3650);
    }

    /// Applies `PRISMFLOW_*` environment overrides
    pub fn apply_env_overrides(&mut self) {
        if let Some(root) = std::env::var_os(ENV_CONTAINER_ROOT) {
            self.container_root = PathBuf::from(root);
        }
        if let Some(dir) = std::env::var_os(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    /// SQLite file for orchestration state
    pub fn state_db_path(&self) -> PathBuf {
        self.data_dir.join("orchestrations.db")
    }

    /// Directory for file-backed orchestration state
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("orchestrations")
    }

    /// SQLite file for committed results
    pub fn result_db_path(&self) -> PathBuf {
        self.data_dir.join("results.db")
    }
}

/// Settings manager for loading and saving settings
pub struct SettingsManager {
    settings_path: PathBuf,
}

impl SettingsManager {
    /// Create a settings manager for an explicit settings file
    pub fn new(settings_path: PathBuf) -> Self {
        Self { settings_path }
    }

    /// Create a settings manager for `prismflow.json` inside a directory
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(SETTINGS_FILE))
    }

    fn lock_path(&self) -> PathBuf {
        self.settings_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(SETTINGS_LOCK_FILE)
    }

    fn with_lock<T>(&self, exclusive: bool, op: impl FnOnce() -> CoreResult<T>) -> CoreResult<T> {
        if let Some(parent) = self.settings_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path())?;

        if exclusive {
            fs2::FileExt::lock_exclusive(&lock_file)?;
        } else {
            fs2::FileExt::lock_shared(&lock_file)?;
        }

        let result = op();

        if let Err(e) = fs2::FileExt::unlock(&lock_file) {
            warn!("Failed to unlock settings lock file: {}", e);
        }

        result
    }

    /// Get the settings file path
    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    /// Load settings from disk, returning defaults if the file doesn't exist.
    ///
    /// Environment overrides are applied after the file is read.
    pub fn load(&self) -> CoreResult<PipelineSettings> {
        let mut settings = self.with_lock(false, || {
            if !self.settings_path.exists() {
                info!(
                    path = %self.settings_path.display(),
                    "Settings file not found, using defaults"
                );
                return Ok(PipelineSettings::default());
            }

            let content = fs::read_to_string(&self.settings_path)?;
            let settings: PipelineSettings = serde_json::from_str(&content).map_err(|e| {
                CoreError::ValidationError(format!(
                    "Failed to parse settings file {}: {}",
                    self.settings_path.display(),
                    e
                ))
            })?;
            Ok(settings)
        })?;

        settings.apply_env_overrides();
        settings.normalize();
        Ok(settings)
    }

    /// Save settings to disk using atomic write (temp file + rename)
    pub fn save(&self, settings: &PipelineSettings) -> CoreResult<PipelineSettings> {
        self.with_lock(true, || {
            let mut normalized = settings.clone();
            normalized.normalize();

            let content = serde_json::to_string_pretty(&normalized)?;

            let temp_path = self.settings_path.with_extension("json.tmp");
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;

            fs::rename(&temp_path, &self.settings_path).map_err(|e| {
                let _ = fs::remove_file(&temp_path);
                CoreError::Internal(format!(
                    "Failed to rename settings file {} to {}: {}",
                    temp_path.display(),
                    self.settings_path.display(),
                    e
                ))
            })?;

            info!(path = %self.settings_path.display(), "Settings saved");
            Ok(normalized)
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
