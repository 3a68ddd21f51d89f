//! prismflow Core Type Definitions
//!
//! Defines fundamental types used throughout the project.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// ID Types
// =============================================================================

/// Image unique identifier (UUID v5 of the storage location and object version)
pub type ImageId = String;

/// Orchestrator instance identifier (`hostname-pid-ulid`)
pub type InstanceId = String;

/// Container used when a location carries no container prefix
pub const DEFAULT_CONTAINER: &str = "images";

/// Generates a process-unique orchestrator instance identifier
pub fn new_instance_id() -> InstanceId {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    format!("{}-{}-{}", host, std::process::id(), ulid::Ulid::new())
}

// =============================================================================
// Image Reference
// =============================================================================

/// Identifies a source image in the storage container.
///
/// Immutable once created. The id is derived from the location and, once
/// known, the object version: redelivered notifications for one upload map to
/// the same id while a new upload to the same location gets a fresh one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    /// Unique image ID
    id: ImageId,
    /// Storage location, `container/blob`
    location: String,
    /// Original file name (last path segment)
    file_name: String,
    /// When the notification was received
    discovered_at: DateTime<Utc>,
    /// Object size in bytes, when the notification carries it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size_bytes: Option<u64>,
    /// Version of the uploaded object; a new upload to the same location
    /// gets a new version and therefore a new id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

impl ImageRef {
    /// Creates a reference for an object at `location`.
    ///
    /// A bare blob name is placed in the default container.
    pub fn new(location: &str) -> Self {
        let location = normalize_location(location);
        let file_name = location
            .rsplit('/')
            .next()
            .unwrap_or(location.as_str())
            .to_string();

        Self {
            id: image_id_for(&location, None),
            location,
            file_name,
            discovered_at: Utc::now(),
            size_bytes: None,
            version: None,
        }
    }

    /// Pins the reference to one version of the object and rederives the id
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        let version = version.into();
        self.id = image_id_for(&self.location, Some(&version));
        self.version = Some(version);
        self
    }

    /// Sets the object size reported by the notification
    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn discovered_at(&self) -> DateTime<Utc> {
        self.discovered_at
    }

    pub fn size_bytes(&self) -> Option<u64> {
        self.size_bytes
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Splits the location into `(container, blob)`
    pub fn container_and_blob(&self) -> (&str, &str) {
        match self.location.split_once('/') {
            Some((container, blob)) => (container, blob),
            None => (DEFAULT_CONTAINER, self.location.as_str()),
        }
    }
}

/// Derives the stable image id for a normalized location and optional version
pub fn image_id_for(location: &str, version: Option<&str>) -> ImageId {
    let name = match version {
        Some(version) => format!("{}#{}", location, version),
        None => location.to_string(),
    };
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

fn normalize_location(location: &str) -> String {
    let trimmed = location.trim().replace('\\', "/");
    let trimmed = trimmed.trim_start_matches('/');
    if trimmed.contains('/') {
        trimmed.to_string()
    } else {
        format!("{}/{}", DEFAULT_CONTAINER, trimmed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_ref_from_full_location() {
        let image = ImageRef::new("images/holiday/test.jpg");
        assert_eq!(image.location(), "images/holiday/test.jpg");
        assert_eq!(image.file_name(), "test.jpg");
        assert_eq!(image.container_and_blob(), ("images", "holiday/test.jpg"));
    }

    #[test]
    fn test_bare_name_goes_to_default_container() {
        let image = ImageRef::new("test.jpg");
        assert_eq!(image.location(), "images/test.jpg");
        assert_eq!(image.file_name(), "test.jpg");
    }

    #[test]
    fn test_id_is_stable_per_location() {
        let a = ImageRef::new("images/test.jpg");
        let b = ImageRef::new("/images/test.jpg").with_size(1024);
        let c = ImageRef::new("images/other.jpg");

        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(ImageRef::new("test.jpg").id(), a.id());
    }

    #[test]
    fn test_version_changes_id() {
        let plain = ImageRef::new("images/test.jpg");
        let first = ImageRef::new("images/test.jpg").with_version("5-100");
        let again = ImageRef::new("test.jpg").with_version("5-100");
        let rewritten = ImageRef::new("images/test.jpg").with_version("7-200");

        assert_eq!(first.id(), again.id());
        assert_ne!(first.id(), plain.id());
        assert_ne!(first.id(), rewritten.id());
        assert_eq!(first.version(), Some("5-100"));
        assert_eq!(first.location(), "images/test.jpg");
    }

    #[test]
    fn test_image_ref_serialization() {
        let image = ImageRef::new("images/test.jpg")
            .with_size(2048)
            .with_version("2048-1");
        let json = serde_json::to_value(&image).unwrap();
        assert_eq!(json["fileName"], "test.jpg");
        assert_eq!(json["sizeBytes"], 2048);
        assert_eq!(json["version"], "2048-1");

        let parsed: ImageRef = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, image);
    }

    #[test]
    fn test_instance_id_is_unique() {
        assert_ne!(new_instance_id(), new_instance_id());
    }
}
