#![allow(dead_code)]

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use prismflow_core::core::orchestration::{OrchestrationStateStore, SqliteStateStore};
use prismflow_core::core::results::{ResultStore, SqliteResultStore};
use prismflow_core::core::storage::{BlobMetadata, BlobStore, LocalBlobStore};
use prismflow_core::{
    AnalysisKind, Analyzer, AnalyzerError, AnalyzerOutput, AnalyzerRoster, ImageRef,
    Orchestrator, OrchestratorConfig,
};
use serde_json::json;
use tempfile::TempDir;

// -----------------------------------------------------------------------------
// Scripted analyzers
// -----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
pub enum Behavior {
    Succeed,
    Hang,
    FailFirst(u32),
    Panic,
    Malformed,
}

/// Analyzer with a fixed behaviour that counts its invocations
pub struct Scripted {
    kind: AnalysisKind,
    behavior: Behavior,
    calls: AtomicU32,
}

impl Scripted {
    pub fn new(kind: AnalysisKind, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            kind,
            behavior,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn valid_output(kind: AnalysisKind) -> AnalyzerOutput {
    let value = match kind {
        AnalysisKind::Color => json!({
            "dominantColors": [{"hex": "#102030", "rgb": [16, 32, 48], "percentage": 100.0}],
            "isGrayscale": false
        }),
        AnalysisKind::Objects => json!({
            "objects": [{"label": "square composition", "confidence": 0.5}],
            "objectCount": 1
        }),
        AnalysisKind::Text => json!({"hasText": false, "extractedText": ""}),
        AnalysisKind::Metadata => json!({"width": 10, "height": 10, "format": "PNG"}),
    };
    value.as_object().cloned().unwrap()
}

#[async_trait]
impl Analyzer for Scripted {
    fn kind(&self) -> AnalysisKind {
        self.kind
    }

    async fn run(&self, _image: &ImageRef, attempt: u32) -> Result<AnalyzerOutput, AnalyzerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Succeed => Ok(valid_output(self.kind)),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(valid_output(self.kind))
            }
            Behavior::FailFirst(n) if attempt <= n => {
                Err(AnalyzerError::Failed(format!("transient failure {}", attempt)))
            }
            Behavior::FailFirst(_) => Ok(valid_output(self.kind)),
            Behavior::Panic => panic!("{} analyzer crashed", self.kind),
            Behavior::Malformed => Ok(json!({"unexpected": true}).as_object().cloned().unwrap()),
        }
    }
}

/// One scripted analyzer per kind
pub struct ScriptedRoster {
    pub color: Arc<Scripted>,
    pub objects: Arc<Scripted>,
    pub text: Arc<Scripted>,
    pub metadata: Arc<Scripted>,
}

impl ScriptedRoster {
    pub fn succeeding() -> Self {
        Self::with(AnalysisKind::Color, Behavior::Succeed)
    }

    /// Every analyzer succeeds except `kind`, which follows `behavior`
    pub fn with(kind: AnalysisKind, behavior: Behavior) -> Self {
        let pick = |k: AnalysisKind| {
            if k == kind {
                Scripted::new(k, behavior)
            } else {
                Scripted::new(k, Behavior::Succeed)
            }
        };
        Self {
            color: pick(AnalysisKind::Color),
            objects: pick(AnalysisKind::Objects),
            text: pick(AnalysisKind::Text),
            metadata: pick(AnalysisKind::Metadata),
        }
    }

    pub fn roster(&self) -> AnalyzerRoster {
        AnalyzerRoster::from_analyzers(vec![
            self.color.clone() as Arc<dyn Analyzer>,
            self.objects.clone() as Arc<dyn Analyzer>,
            self.text.clone() as Arc<dyn Analyzer>,
            self.metadata.clone() as Arc<dyn Analyzer>,
        ])
        .unwrap()
    }

    pub fn total_calls(&self) -> u32 {
        self.color.calls() + self.objects.calls() + self.text.calls() + self.metadata.calls()
    }
}

// -----------------------------------------------------------------------------
// Environment
// -----------------------------------------------------------------------------

/// Container root plus on-disk stores in a temp directory
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub blob_store: Arc<LocalBlobStore>,
    pub state_store: Arc<dyn OrchestrationStateStore>,
    pub result_store: Arc<dyn ResultStore>,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("containers");
        std::fs::create_dir_all(root.join("images")).unwrap();

        let state_store: Arc<dyn OrchestrationStateStore> =
            Arc::new(SqliteStateStore::open(temp_dir.path().join("orchestrations.db")).unwrap());
        let result_store: Arc<dyn ResultStore> =
            Arc::new(SqliteResultStore::open(temp_dir.path().join("results.db")).unwrap());

        Self {
            blob_store: Arc::new(LocalBlobStore::new(root)),
            temp_dir,
            state_store,
            result_store,
        }
    }

    pub fn with_state_store(mut self, state_store: Arc<dyn OrchestrationStateStore>) -> Self {
        self.state_store = state_store;
        self
    }

    pub fn container_root(&self) -> PathBuf {
        self.blob_store.root().to_path_buf()
    }

    /// Places a small blob at `images/{name}` and returns its reference
    pub fn put(&self, name: &str) -> ImageRef {
        self.put_bytes(name, b"not decoded by scripted analyzers")
    }

    /// Writes `bytes` to `images/{name}` and returns a reference pinned to
    /// that upload, as the container watcher would deliver it
    pub fn put_bytes(&self, name: &str, bytes: &[u8]) -> ImageRef {
        let path = self.container_root().join("images").join(name);
        std::fs::write(&path, bytes).unwrap();
        let meta = BlobMetadata::from_fs(&std::fs::metadata(&path).unwrap());
        ImageRef::new(&format!("images/{}", name))
            .with_size(meta.size_bytes)
            .with_version(meta.version())
    }

    pub fn orchestrator(&self, roster: AnalyzerRoster, config: OrchestratorConfig) -> Orchestrator {
        Orchestrator::new(
            config,
            roster,
            self.blob_store.clone() as Arc<dyn BlobStore>,
            self.state_store.clone(),
            self.result_store.clone(),
        )
    }
}

/// Fast timings for tests
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        task_timeout: Duration::from_millis(200),
        max_retries: 2,
        retry_backoff: Duration::from_millis(5),
        lease: Duration::from_secs(60),
        max_concurrent_orchestrations: 4,
        ..OrchestratorConfig::default()
    }
}

/// Writes a 770x400 JPEG: left 60% black, right 40% red
pub fn write_test_jpeg(dir: &Path, name: &str) -> PathBuf {
    let image = RgbImage::from_fn(770, 400, |x, _| {
        if x < 462 {
            Rgb([0, 0, 0])
        } else {
            Rgb([255, 0, 0])
        }
    });
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
        .unwrap();

    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}
