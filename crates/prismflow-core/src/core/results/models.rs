//! Result Data Models
//!
//! The externally visible summary of an analysed image and the filters used
//! to list summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::analysis::AnalysisKind;
use crate::core::orchestration::{OrchestrationRecord, TaskStatus};
use crate::core::{CoreError, CoreResult, ImageId};

// =============================================================================
// Summary Status
// =============================================================================

/// How much of the roster contributed to a summary
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SummaryStatus {
    /// Every analyzer succeeded
    Complete,
    /// Some analyzers failed; their fields are null
    Partial,
    /// Every analyzer failed; all fields are null
    Failed,
}

impl SummaryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryStatus::Complete => "complete",
            SummaryStatus::Partial => "partial",
            SummaryStatus::Failed => "failed",
        }
    }
}

// =============================================================================
// Result Summary
// =============================================================================

/// Merged result of one image's orchestration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSummary {
    /// Image ID
    pub id: ImageId,
    /// Original file name
    pub file_name: String,
    /// Storage location
    pub blob_path: String,
    /// When the last analyzer reached a terminal state
    pub analyzed_at: DateTime<Utc>,
    /// Complete, partial or failed
    pub status: SummaryStatus,
    /// Kinds whose analyzers exhausted their attempts
    pub failed_analyzers: Vec<AnalysisKind>,
    /// Merged summary fields; null for failed analyzers
    pub summary: serde_json::Map<String, Value>,
    /// Full per-kind outputs; null for failed analyzers
    pub analyses: serde_json::Map<String, Value>,
}

impl ResultSummary {
    /// Builds the summary from a record whose tasks are all terminal.
    ///
    /// Only each task's final outcome is merged.
    pub fn from_record(record: &OrchestrationRecord) -> CoreResult<Self> {
        if !record.all_tasks_terminal() {
            return Err(CoreError::ValidationError(format!(
                "orchestration {} still has unfinished tasks: {:?}",
                record.id(),
                record.non_terminal_kinds()
            )));
        }

        let mut summary = serde_json::Map::new();
        let mut analyses = serde_json::Map::new();
        let mut failed_analyzers = Vec::new();

        for task in record.tasks() {
            let output = match task.status {
                TaskStatus::Succeeded => task.output.as_ref(),
                _ => None,
            };
            if output.is_none() {
                failed_analyzers.push(task.kind);
            }

            for (field, value) in task.kind.summary_values(output) {
                summary.insert(field.to_string(), value);
            }
            analyses.insert(
                task.kind.analyses_key().to_string(),
                output.cloned().map(Value::Object).unwrap_or(Value::Null),
            );
        }

        let status = if failed_analyzers.is_empty() {
            SummaryStatus::Complete
        } else if failed_analyzers.len() == record.tasks().len() {
            SummaryStatus::Failed
        } else {
            SummaryStatus::Partial
        };

        Ok(Self {
            id: record.id().to_string(),
            file_name: record.image.file_name().to_string(),
            blob_path: record.image.location().to_string(),
            analyzed_at: record.analyzed_at().unwrap_or(record.created_at),
            status,
            failed_analyzers,
            summary,
            analyses,
        })
    }
}

// =============================================================================
// Filters
// =============================================================================

/// Ordering of listed summaries
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultOrder {
    /// First insertion first
    #[default]
    Insertion,
    /// Most recent `analyzedAt` first
    NewestFirst,
}

/// Optional constraints for listing summaries
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResultFilter {
    /// Case-insensitive substring of the file name
    pub file_name_contains: Option<String>,
    /// Only summaries analysed at or after this time
    pub analyzed_after: Option<DateTime<Utc>>,
    /// Only summaries with this status
    pub status: Option<SummaryStatus>,
    /// Ordering of the listing
    pub order: ResultOrder,
}

impl ResultFilter {
    pub fn newest_first() -> Self {
        Self {
            order: ResultOrder::NewestFirst,
            ..Default::default()
        }
    }

    pub fn with_file_name(mut self, needle: impl Into<String>) -> Self {
        self.file_name_contains = Some(needle.into());
        self
    }

    pub fn with_status(mut self, status: SummaryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_analyzed_after(mut self, after: DateTime<Utc>) -> Self {
        self.analyzed_after = Some(after);
        self
    }
}

// =============================================================================
// Tests
// =============================================================================
