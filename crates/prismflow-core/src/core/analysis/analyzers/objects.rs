//! Object Analyzer
//!
//! Heuristic labels derived from the image geometry. Stands in for a real
//! detection model; only the output contract matters to the pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::core::analysis::{AnalysisKind, Analyzer, AnalyzerError, AnalyzerOutput};
use crate::core::storage::BlobStore;
use crate::core::ImageRef;

use super::read_header;

/// Pixel count above which an image counts as high resolution
const HIGH_RESOLUTION_PIXELS: u64 = 1_000_000;

/// Geometry-based object labels
pub struct ObjectAnalyzer {
    blob_store: Arc<dyn BlobStore>,
}

impl ObjectAnalyzer {
    pub fn new(blob_store: Arc<dyn BlobStore>) -> Self {
        Self { blob_store }
    }
}

#[async_trait]
impl Analyzer for ObjectAnalyzer {
    fn kind(&self) -> AnalysisKind {
        AnalysisKind::Objects
    }

    async fn run(&self, image: &ImageRef, _attempt: u32) -> Result<AnalyzerOutput, AnalyzerError> {
        let bytes = self.blob_store.read(image).await?;
        let header = read_header(&bytes)?;
        Ok(detect_objects(header.width, header.height))
    }
}

fn detect_objects(width: u32, height: u32) -> AnalyzerOutput {
    let mut objects = Vec::new();

    if width > height {
        objects.push(json!({"name": "landscape", "confidence": 0.85}));
    } else if height > width {
        objects.push(json!({"name": "portrait", "confidence": 0.82}));
    } else {
        objects.push(json!({"name": "square composition", "confidence": 0.90}));
    }

    if u64::from(width) * u64::from(height) > HIGH_RESOLUTION_PIXELS {
        objects.push(json!({"name": "high-resolution scene", "confidence": 0.78}));
    }

    objects.push(json!({"name": "digital image", "confidence": 0.99}));

    let mut output = AnalyzerOutput::new();
    output.insert("objectCount".into(), json!(objects.len()));
    output.insert("objects".into(), json!(objects));
    output.insert("note".into(), json!("Heuristic analysis"));
    output
}
