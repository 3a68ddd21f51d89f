//! Orchestration Data Models
//!
//! Persistent records describing an image's progress through the analyzer
//! roster.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::analysis::{AnalysisKind, AnalyzerError, AnalyzerOutput};
use crate::core::{ImageRef, InstanceId};

// =============================================================================
// Task Status
// =============================================================================

/// Status of one analysis task
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Waiting for its next attempt
    #[default]
    Pending,
    /// An attempt is in flight
    Running,
    /// Terminal: an attempt produced a valid output
    Succeeded,
    /// Terminal: every attempt failed
    Failed,
    /// Last attempt exceeded its budget; awaiting retry
    TimedOut,
}

impl TaskStatus {
    /// Succeeded or failed-after-retries
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

// =============================================================================
// Attempt Failure
// =============================================================================

/// Why a single attempt did not produce an output
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptFailure {
    /// The attempt exceeded its execution budget and was cancelled
    Timeout(Duration),
    /// The analyzer returned an error
    Analyzer(AnalyzerError),
    /// The analyzer returned output that breaks its kind's contract
    ContractViolation(String),
    /// The analyzer panicked
    Panicked(String),
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Timeout(budget) => write!(f, "timed out after {:?}", budget),
            AttemptFailure::Analyzer(e) => write!(f, "{}", e),
            AttemptFailure::ContractViolation(msg) => write!(f, "malformed output: {}", msg),
            AttemptFailure::Panicked(msg) => write!(f, "analyzer panicked: {}", msg),
        }
    }
}

// =============================================================================
// Analysis Task
// =============================================================================

/// One analyzer's unit of work within an orchestration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisTask {
    /// Analyzer kind
    pub kind: AnalysisKind,
    /// Current status
    pub status: TaskStatus,
    /// Attempts started so far
    pub attempts: u32,
    /// Output of the succeeding attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<AnalyzerOutput>,
    /// Last failure, kept for diagnostics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the task reached a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl AnalysisTask {
    /// Creates a pending task
    pub fn new(kind: AnalysisKind) -> Self {
        Self {
            kind,
            status: TaskStatus::Pending,
            attempts: 0,
            output: None,
            last_error: None,
            finished_at: None,
        }
    }

    /// Marks a new attempt as started and returns its number (1-based)
    pub fn start_attempt(&mut self) -> u32 {
        self.status = TaskStatus::Running;
        self.attempts += 1;
        self.attempts
    }

    /// Records the output of a successful attempt
    pub fn record_success(&mut self, output: AnalyzerOutput, now: DateTime<Utc>) {
        self.status = TaskStatus::Succeeded;
        self.output = Some(output);
        self.finished_at = Some(now);
    }

    /// Records a failed attempt.
    ///
    /// Returns `true` when another attempt is allowed; otherwise the task is
    /// now terminally `Failed`.
    pub fn record_failure(
        &mut self,
        failure: &AttemptFailure,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> bool {
        self.last_error = Some(failure.to_string());
        self.output = None;

        if self.attempts >= max_attempts {
            self.status = TaskStatus::Failed;
            self.finished_at = Some(now);
            return false;
        }

        self.status = match failure {
            AttemptFailure::Timeout(_) => TaskStatus::TimedOut,
            _ => TaskStatus::Pending,
        };
        true
    }

    /// Returns a task whose attempt was cut off by a crash to `Pending`.
    ///
    /// The interrupted attempt does not count against the retry bound.
    pub fn reset_interrupted(&mut self) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        self.status = TaskStatus::Pending;
        self.attempts = self.attempts.saturating_sub(1);
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// =============================================================================
// Orchestration Record
// =============================================================================

/// Overall status of an orchestration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrchestrationStatus {
    /// Tasks are in flight or the summary is not committed yet
    Running,
    /// Every task is terminal and the summary is committed
    Completed,
    /// The source image could not be read; nothing was dispatched
    Failed,
}

impl OrchestrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestrationStatus::Running => "running",
            OrchestrationStatus::Completed => "completed",
            OrchestrationStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(OrchestrationStatus::Running),
            "completed" => Some(OrchestrationStatus::Completed),
            "failed" => Some(OrchestrationStatus::Failed),
            _ => None,
        }
    }
}

/// Durable state of one image's orchestration.
///
/// The task set is fixed when the record is created; tasks can be mutated but
/// never added or removed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationRecord {
    /// Source image
    pub image: ImageRef,
    /// One task per roster kind
    tasks: Vec<AnalysisTask>,
    /// Overall status
    pub status: OrchestrationStatus,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last persisted change
    pub updated_at: DateTime<Utc>,
    /// Completion timestamp
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Orchestration-level failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Instance holding the lease
    #[serde(default)]
    pub lease_owner: Option<InstanceId>,
    /// When the lease lapses
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl OrchestrationRecord {
    /// Creates a running record with one pending task per kind
    pub fn new(image: ImageRef, kinds: &[AnalysisKind], now: DateTime<Utc>) -> Self {
        Self {
            image,
            tasks: kinds.iter().map(|k| AnalysisTask::new(*k)).collect(),
            status: OrchestrationStatus::Running,
            created_at: now,
            updated_at: now,
            completed_at: None,
            failure_reason: None,
            lease_owner: None,
            lease_expires_at: None,
        }
    }

    /// Creates a failed record with no tasks
    pub fn failed(image: ImageRef, reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            image,
            tasks: Vec::new(),
            status: OrchestrationStatus::Failed,
            created_at: now,
            updated_at: now,
            completed_at: Some(now),
            failure_reason: Some(reason.into()),
            lease_owner: None,
            lease_expires_at: None,
        }
    }

    pub fn id(&self) -> &str {
        self.image.id()
    }

    pub fn tasks(&self) -> &[AnalysisTask] {
        &self.tasks
    }

    pub fn task(&self, kind: AnalysisKind) -> Option<&AnalysisTask> {
        self.tasks.iter().find(|t| t.kind == kind)
    }

    pub(crate) fn task_mut(&mut self, kind: AnalysisKind) -> Option<&mut AnalysisTask> {
        self.tasks.iter_mut().find(|t| t.kind == kind)
    }

    /// Kinds whose tasks still need attempts
    pub fn non_terminal_kinds(&self) -> Vec<AnalysisKind> {
        self.tasks
            .iter()
            .filter(|t| !t.is_terminal())
            .map(|t| t.kind)
            .collect()
    }

    /// Whether every task is terminal (fan-in complete)
    pub fn all_tasks_terminal(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(AnalysisTask::is_terminal)
    }

    /// Latest terminal timestamp across tasks.
    ///
    /// Derived from persisted state so re-finalizing yields the same value.
    pub fn analyzed_at(&self) -> Option<DateTime<Utc>> {
        self.tasks.iter().filter_map(|t| t.finished_at).max()
    }

    /// Resets tasks cut off mid-attempt; returns how many were reset
    pub fn reset_interrupted_tasks(&mut self) -> usize {
        self.tasks
            .iter_mut()
            .map(AnalysisTask::reset_interrupted)
            .filter(|reset| *reset)
            .count()
    }

    /// Marks the orchestration completed
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = OrchestrationStatus::Completed;
        self.completed_at = Some(now);
    }

    /// Whether `owner` may take (or keep) the lease at `now`
    pub fn is_claimable_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        match (&self.lease_owner, self.lease_expires_at) {
            (None, _) => true,
            (Some(current), _) if current == owner => true,
            (Some(_), Some(expires_at)) => expires_at <= now,
            (Some(_), None) => true,
        }
    }

    /// Sets the lease holder and pushes the expiry forward
    pub fn renew_lease(&mut self, owner: &str, lease: Duration, now: DateTime<Utc>) {
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        self.lease_owner = Some(owner.to_string());
        self.lease_expires_at = now.checked_add_signed(lease);
    }

    /// Drops the lease
    pub fn release_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }
}

// =============================================================================
// Tests
// =============================================================================
