//! Metadata Analyzer
//!
//! Dimensions, format, colour mode and size, read from the image header.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::core::analysis::{AnalysisKind, Analyzer, AnalyzerError, AnalyzerOutput};
use crate::core::storage::BlobStore;
use crate::core::ImageRef;

use super::{color_mode, format_name, read_header, ImageHeader};

pub struct MetadataAnalyzer {
    blob_store: Arc<dyn BlobStore>,
}

impl MetadataAnalyzer {
    pub fn new(blob_store: Arc<dyn BlobStore>) -> Self {
        Self { blob_store }
    }
}

#[async_trait]
impl Analyzer for MetadataAnalyzer {
    fn kind(&self) -> AnalysisKind {
        AnalysisKind::Metadata
    }

    async fn run(&self, image: &ImageRef, _attempt: u32) -> Result<AnalyzerOutput, AnalyzerError> {
        let bytes = self.blob_store.read(image).await?;
        let header = read_header(&bytes)?;
        let size_bytes = image.size_bytes().unwrap_or(bytes.len() as u64);
        Ok(describe(&header, size_bytes))
    }
}

fn describe(header: &ImageHeader, size_bytes: u64) -> AnalyzerOutput {
    let total_pixels = u64::from(header.width) * u64::from(header.height);
    let megapixels = (total_pixels as f64 / 10_000.0).round() / 100.0;
    let size_kb = (size_bytes as f64 / 1024.0 * 100.0).round() / 100.0;

    let mut output = AnalyzerOutput::new();
    output.insert("width".into(), json!(header.width));
    output.insert("height".into(), json!(header.height));
    output.insert("format".into(), json!(format_name(header.format)));
    output.insert("mode".into(), json!(color_mode(header.color_type)));
    output.insert("totalPixels".into(), json!(total_pixels));
    output.insert("megapixels".into(), json!(megapixels));
    output.insert("sizeKB".into(), json!(size_kb));
    output
}
