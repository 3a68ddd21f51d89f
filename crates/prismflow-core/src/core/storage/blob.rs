//! Blob Store
//!
//! Access to raw image bytes held in storage containers. The orchestrator only
//! probes objects; analyzers read them on demand.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::{CoreError, CoreResult, ImageRef};

// =============================================================================
// Blob Metadata
// =============================================================================

/// Lightweight metadata returned by a probe
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobMetadata {
    /// Object size in bytes
    pub size_bytes: u64,
    /// Last modification time, when the backend reports one
    pub modified_at: Option<DateTime<Utc>>,
}

impl BlobMetadata {
    pub fn from_fs(meta: &std::fs::Metadata) -> Self {
        Self {
            size_bytes: meta.len(),
            modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
        }
    }

    /// Identifies this upload of the object: `{size}-{modified micros}`
    pub fn version(&self) -> String {
        let modified = self.modified_at.map(|t| t.timestamp_micros()).unwrap_or(0);
        format!("{}-{}", self.size_bytes, modified)
    }
}

// =============================================================================
// Blob Store Trait
// =============================================================================

/// Storage holding raw image bytes
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Checks that the object exists and is readable without downloading it.
    ///
    /// Returns `Ok(None)` when the object does not exist.
    async fn probe(&self, image: &ImageRef) -> CoreResult<Option<BlobMetadata>>;

    /// Reads the full object
    async fn read(&self, image: &ImageRef) -> CoreResult<Vec<u8>>;
}

// =============================================================================
// Local Blob Store
// =============================================================================

/// Blob store backed by a directory: `{root}/{container}/{blob}`
#[derive(Clone, Debug)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Creates a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves an image to its path, rejecting traversal outside the root
    pub fn resolve(&self, image: &ImageRef) -> CoreResult<PathBuf> {
        let (container, blob) = image.container_and_blob();
        validate_component(container, "container")?;

        let mut path = self.root.join(container);
        for segment in blob.split('/') {
            validate_component(segment, "blob name")?;
            path.push(segment);
        }
        Ok(path)
    }

    /// Builds the location string for a file below the root
    pub fn location_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let rel = rel.to_string_lossy().replace('\\', "/");
        if rel.contains('/') {
            Some(rel)
        } else {
            None
        }
    }
}

fn validate_component(segment: &str, label: &str) -> CoreResult<()> {
    if segment.is_empty() {
        return Err(CoreError::InvalidLocation(format!("{label} is empty")));
    }
    if segment == "." || segment == ".." || segment.contains('\\') || segment.contains(':') {
        return Err(CoreError::InvalidLocation(format!(
            "Invalid {label} '{segment}': contains path traversal characters"
        )));
    }
    Ok(())
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn probe(&self, image: &ImageRef) -> CoreResult<Option<BlobMetadata>> {
        let path = self.resolve(image)?;

        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CoreError::SourceUnreadable(format!("{}: {}", path.display(), e))),
        };
        if !meta.is_file() {
            return Ok(None);
        }

        Ok(Some(BlobMetadata::from_fs(&meta)))
    }

    async fn read(&self, image: &ImageRef) -> CoreResult<Vec<u8>> {
        let path = self.resolve(image)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| CoreError::SourceUnreadable(format!("{}: {}", path.display(), e)))
    }
}

// =============================================================================
// Tests
// =============================================================================
