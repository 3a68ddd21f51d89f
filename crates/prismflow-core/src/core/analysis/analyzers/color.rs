//! Colour Analyzer
//!
//! Samples the image down to 50x50, buckets every channel into 32-wide bins
//! and reports the five most frequent buckets.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use image::imageops::FilterType;
use serde_json::json;

use crate::core::analysis::{AnalysisKind, Analyzer, AnalyzerError, AnalyzerOutput};
use crate::core::storage::BlobStore;
use crate::core::ImageRef;

/// Side length of the sampling grid
const SAMPLE_SIZE: u32 = 50;

/// Channel bucket width
const BUCKET: u8 = 32;

/// Number of colours reported
const TOP_COLORS: usize = 5;

/// Maximum channel spread for a pixel to count as gray
const GRAY_SPREAD: i16 = 30;

/// Share of gray pixels above which the image is grayscale
const GRAYSCALE_RATIO: f64 = 0.9;

/// Dominant colour and grayscale detection
pub struct ColorAnalyzer {
    blob_store: Arc<dyn BlobStore>,
}

impl ColorAnalyzer {
    pub fn new(blob_store: Arc<dyn BlobStore>) -> Self {
        Self { blob_store }
    }
}

#[async_trait]
impl Analyzer for ColorAnalyzer {
    fn kind(&self) -> AnalysisKind {
        AnalysisKind::Color
    }

    async fn run(&self, image: &ImageRef, _attempt: u32) -> Result<AnalyzerOutput, AnalyzerError> {
        let bytes = self.blob_store.read(image).await?;

        // Decoding and resampling are CPU bound
        tokio::task::spawn_blocking(move || analyze_colors(&bytes))
            .await
            .map_err(|e| AnalyzerError::Failed(format!("colour analysis aborted: {}", e)))?
    }
}

fn analyze_colors(bytes: &[u8]) -> Result<AnalyzerOutput, AnalyzerError> {
    let decoded =
        image::load_from_memory(bytes).map_err(|e| AnalyzerError::Unsupported(e.to_string()))?;
    let sample = decoded
        .resize_exact(SAMPLE_SIZE, SAMPLE_SIZE, FilterType::Nearest)
        .to_rgb8();

    let mut counts: HashMap<[u8; 3], usize> = HashMap::new();
    let mut gray_pixels = 0usize;
    let total = (sample.width() * sample.height()) as usize;

    for pixel in sample.pixels() {
        let [r, g, b] = pixel.0;
        let key = [r / BUCKET * BUCKET, g / BUCKET * BUCKET, b / BUCKET * BUCKET];
        *counts.entry(key).or_insert(0) += 1;

        let (r, g, b) = (i16::from(r), i16::from(g), i16::from(b));
        if (r - g).abs() < GRAY_SPREAD && (g - b).abs() < GRAY_SPREAD {
            gray_pixels += 1;
        }
    }

    let mut sorted: Vec<([u8; 3], usize)> = counts.into_iter().collect();
    // Most frequent first; ties broken by bucket so output is deterministic
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let top_colors: Vec<serde_json::Value> = sorted
        .iter()
        .take(TOP_COLORS)
        .map(|([r, g, b], count)| {
            json!({
                "hex": format!("#{:02x}{:02x}{:02x}", r, g, b),
                "rgb": {"r": r, "g": g, "b": b},
                "percentage": round1(*count as f64 / total as f64 * 100.0),
            })
        })
        .collect();

    let is_grayscale = total > 0 && gray_pixels as f64 / total as f64 > GRAYSCALE_RATIO;

    let mut output = AnalyzerOutput::new();
    output.insert("dominantColors".into(), json!(top_colors));
    output.insert("isGrayscale".into(), json!(is_grayscale));
    output.insert("totalPixelsSampled".into(), json!(total));
    Ok(output)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
