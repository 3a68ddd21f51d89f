//! Analyzer Trait
//!
//! Defines the invocation contract every analysis task satisfies and the
//! static roster that maps each [`AnalysisKind`] to its implementation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::storage::BlobStore;
use crate::core::{CoreError, CoreResult, ImageRef};

use super::analyzers::{ColorAnalyzer, MetadataAnalyzer, ObjectAnalyzer, TextAnalyzer};
use super::{AnalysisKind, AnalyzerOutput};

// =============================================================================
// Analyzer Error
// =============================================================================

/// Failure reported by an analyzer for one attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalyzerError {
    #[error("source unreadable: {0}")]
    SourceUnreadable(String),

    #[error("unsupported image: {0}")]
    Unsupported(String),

    #[error("analysis failed: {0}")]
    Failed(String),
}

impl From<CoreError> for AnalyzerError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::SourceUnreadable(msg) => AnalyzerError::SourceUnreadable(msg),
            other => AnalyzerError::Failed(other.to_string()),
        }
    }
}

// =============================================================================
// Analyzer Trait
// =============================================================================

/// A single analysis step over one image.
///
/// Implementations never touch orchestration state; the orchestrator records
/// the returned value. `run` may be invoked more than once for the same image
/// (retries) and must have no side effects beyond producing its result.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Kind of analysis this analyzer performs
    fn kind(&self) -> AnalysisKind;

    /// Analyzes `image`. `attempt` starts at 1.
    async fn run(&self, image: &ImageRef, attempt: u32) -> Result<AnalyzerOutput, AnalyzerError>;
}

// =============================================================================
// Analyzer Roster
// =============================================================================

/// Exactly one analyzer per [`AnalysisKind`]
#[derive(Clone)]
pub struct AnalyzerRoster {
    analyzers: BTreeMap<AnalysisKind, Arc<dyn Analyzer>>,
}

impl AnalyzerRoster {
    /// Builds the roster of built-in analyzers reading from `blob_store`
    pub fn standard(blob_store: Arc<dyn BlobStore>) -> Self {
        let analyzers: Vec<Arc<dyn Analyzer>> = vec![
            Arc::new(ColorAnalyzer::new(blob_store.clone())),
            Arc::new(ObjectAnalyzer::new(blob_store.clone())),
            Arc::new(TextAnalyzer::new()),
            Arc::new(MetadataAnalyzer::new(blob_store)),
        ];

        Self {
            analyzers: analyzers.into_iter().map(|a| (a.kind(), a)).collect(),
        }
    }

    /// Builds a roster from explicit analyzers.
    ///
    /// Fails unless every kind is covered exactly once.
    pub fn from_analyzers(analyzers: Vec<Arc<dyn Analyzer>>) -> CoreResult<Self> {
        let mut map = BTreeMap::new();
        for analyzer in analyzers {
            let kind = analyzer.kind();
            if map.insert(kind, analyzer).is_some() {
                return Err(CoreError::InvalidRoster(format!(
                    "more than one analyzer for kind '{}'",
                    kind
                )));
            }
        }

        let missing: Vec<&str> = AnalysisKind::ALL
            .iter()
            .filter(|k| !map.contains_key(*k))
            .map(|k| k.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(CoreError::InvalidRoster(format!(
                "no analyzer for: {}",
                missing.join(", ")
            )));
        }

        Ok(Self { analyzers: map })
    }

    /// Replaces the analyzer registered for `analyzer.kind()`
    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzers.insert(analyzer.kind(), analyzer);
        self
    }

    /// Returns the analyzer for a kind
    pub fn get(&self, kind: AnalysisKind) -> Option<Arc<dyn Analyzer>> {
        self.analyzers.get(&kind).cloned()
    }

    /// Kinds covered by the roster
    pub fn kinds(&self) -> Vec<AnalysisKind> {
        self.analyzers.keys().copied().collect()
    }
}

impl std::fmt::Debug for AnalyzerRoster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyzerRoster")
            .field("kinds", &self.kinds())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
