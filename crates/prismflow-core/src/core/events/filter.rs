//! Image File Filter
//!
//! Decides which container paths are image uploads, using `globset`.

use std::path::Path;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::core::{CoreError, CoreResult};

/// Extensions recognised as images (matched case-insensitively)
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp", "tiff", "tif"];

/// Partial uploads and editor leftovers
const IGNORE_PATTERNS: &[&str] = &["**/.*", "**/*.tmp", "**/*.part", "**/*.crdownload"];

/// Matches image uploads below a container root
#[derive(Debug, Clone)]
pub struct ImageFilter {
    include: GlobSet,
    ignore: GlobSet,
}

impl ImageFilter {
    pub fn new() -> CoreResult<Self> {
        let include = format!("**/*.{{{}}}", IMAGE_EXTENSIONS.join(","));
        Ok(Self {
            include: build_set(&[include.as_str()])?,
            ignore: build_set(IGNORE_PATTERNS)?,
        })
    }

    /// Whether `rel_path` (relative to the container root) is an image upload
    pub fn is_image(&self, rel_path: &Path) -> bool {
        let path = rel_path.to_string_lossy().replace('\\', "/");
        self.include.is_match(&path) && !self.ignore.is_match(&path)
    }
}

fn build_set(patterns: &[&str]) -> CoreResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .literal_separator(false)
            .build()
            .map_err(|e| CoreError::Internal(format!("Invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| CoreError::Internal(format!("Failed to build glob set: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_extensions() {
        let filter = ImageFilter::new().unwrap();
        assert!(filter.is_image(Path::new("images/a.jpg")));
        assert!(filter.is_image(Path::new("images/B.JPEG")));
        assert!(filter.is_image(Path::new("uploads/nested/c.tif")));
        assert!(filter.is_image(Path::new("images/d.webp")));
        assert!(!filter.is_image(Path::new("images/notes.txt")));
        assert!(!filter.is_image(Path::new("images/clip.mp4")));
    }

    #[test]
    fn test_partial_uploads_ignored() {
        let filter = ImageFilter::new().unwrap();
        assert!(!filter.is_image(Path::new("images/.a.jpg")));
        assert!(!filter.is_image(Path::new("images/a.jpg.part")));
        assert!(!filter.is_image(Path::new("images/.hidden/a.jpg")));
    }
}
