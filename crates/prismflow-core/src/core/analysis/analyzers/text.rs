//! Text Analyzer
//!
//! OCR placeholder. No OCR engine is bundled, so it always reports that the
//! image carries no text.

use async_trait::async_trait;
use serde_json::json;

use crate::core::analysis::{AnalysisKind, Analyzer, AnalyzerError, AnalyzerOutput};
use crate::core::ImageRef;

#[derive(Debug, Default)]
pub struct TextAnalyzer;

impl TextAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Analyzer for TextAnalyzer {
    fn kind(&self) -> AnalysisKind {
        AnalysisKind::Text
    }

    async fn run(&self, _image: &ImageRef, _attempt: u32) -> Result<AnalyzerOutput, AnalyzerError> {
        let mut output = AnalyzerOutput::new();
        output.insert("hasText".into(), json!(false));
        output.insert("extractedText".into(), json!(""));
        output.insert("confidence".into(), json!(0.0));
        output.insert("language".into(), json!("unknown"));
        output.insert("note".into(), json!("OCR engine not configured"));
        Ok(output)
    }
}
