//! Query Service
//!
//! Read-only JSON view over the result store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::core::{CoreError, CoreResult, ImageId};

use super::{ResultFilter, ResultStore, ResultSummary, SummaryStatus};

/// Listing limit when the caller does not give one
pub const DEFAULT_LIST_LIMIT: usize = 10;

/// One entry of a listing
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultListItem {
    pub id: ImageId,
    pub file_name: String,
    pub analyzed_at: DateTime<Utc>,
    pub status: SummaryStatus,
    pub summary: serde_json::Map<String, Value>,
}

impl From<ResultSummary> for ResultListItem {
    fn from(summary: ResultSummary) -> Self {
        Self {
            id: summary.id,
            file_name: summary.file_name,
            analyzed_at: summary.analyzed_at,
            status: summary.status,
            summary: summary.summary,
        }
    }
}

/// Response of [`QueryService::list`]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResultListing {
    pub count: usize,
    pub results: Vec<ResultListItem>,
}

/// Exposes committed summaries
#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn ResultStore>,
}

impl QueryService {
    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        Self { store }
    }

    /// Lists summaries, newest first unless `filter` says otherwise.
    ///
    /// `filter` defaults to [`ResultFilter::newest_first`] and `limit` to
    /// [`DEFAULT_LIST_LIMIT`].
    pub fn list(
        &self,
        limit: Option<usize>,
        filter: Option<ResultFilter>,
    ) -> CoreResult<ResultListing> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT);
        let filter = filter.unwrap_or_else(ResultFilter::newest_first);

        let results: Vec<ResultListItem> = self
            .store
            .list(limit, &filter)?
            .into_iter()
            .map(ResultListItem::from)
            .collect();

        tracing::debug!(limit, returned = results.len(), "Listed results");

        Ok(ResultListing {
            count: results.len(),
            results,
        })
    }

    /// Returns the full summary for one image
    pub fn get(&self, id: &str) -> CoreResult<ResultSummary> {
        self.store
            .get(id)?
            .ok_or_else(|| CoreError::NotFound(format!("result {}", id)))
    }
}

// =============================================================================
// Tests
// =============================================================================
