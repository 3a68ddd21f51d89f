//! Orchestrator
//!
//! Drives one image through the analyzer roster:
//! - persists the orchestration record before any analyzer runs
//! - dispatches every non-terminal task concurrently, one tokio task per attempt
//! - bounds each attempt by the task timeout and retries with linear backoff
//! - saves progress after every transition, renewing the lease
//! - merges the terminal outcomes and commits one summary per image

use std::any::Any;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

use crate::core::analysis::{AnalysisKind, Analyzer, AnalyzerError, AnalyzerOutput, AnalyzerRoster};
use crate::core::results::{ResultStore, ResultSummary, SqliteResultStore};
use crate::core::settings::{PipelineSettings, StateBackend};
use crate::core::storage::{BlobStore, LocalBlobStore};
use crate::core::{new_instance_id, CoreError, CoreResult, ImageId, ImageRef, InstanceId};

use super::{
    AttemptFailure, FileStateStore, OrchestrationRecord, OrchestrationStateStore,
    OrchestrationStatus, SqliteStateStore,
};

// =============================================================================
// Configuration
// =============================================================================

/// Orchestrator configuration
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Lease owner written to every record this orchestrator drives
    pub instance_id: InstanceId,
    /// Budget for a single analyzer attempt
    pub task_timeout: Duration,
    /// Attempts allowed after the first one
    pub max_retries: u32,
    /// Base delay between attempts, multiplied by the failed attempt's number
    pub retry_backoff: Duration,
    /// Lease duration, renewed on every save and periodically while driving
    pub lease: Duration,
    /// Images driven at the same time
    pub max_concurrent_orchestrations: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_settings(&PipelineSettings::default())
    }
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            instance_id: new_instance_id(),
            task_timeout: settings.task_timeout(),
            max_retries: settings.max_retries,
            retry_backoff: settings.retry_backoff(),
            lease: settings.lease(),
            max_concurrent_orchestrations: settings.max_concurrent_orchestrations.max(1),
        }
    }

    /// Total attempts a task may use
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before the attempt following `failed_attempt`
    pub fn backoff_for(&self, failed_attempt: u32) -> Duration {
        self.retry_backoff.saturating_mul(failed_attempt)
    }

    /// How often a driving orchestrator renews its lease
    pub fn renew_interval(&self) -> Duration {
        (self.lease / 3).max(Duration::from_millis(10))
    }

    /// How often a long-running orchestrator rescans for abandoned records
    pub fn recovery_interval(&self) -> Duration {
        (self.lease / 2).max(Duration::from_millis(10))
    }
}

// =============================================================================
// Start Outcome
// =============================================================================

/// Result of [`Orchestrator::start_orchestration`]
#[derive(Clone, Debug, PartialEq)]
pub enum StartOutcome {
    /// This call drove the orchestration to an end state (completed or failed)
    Finished(OrchestrationRecord),
    /// Another call or instance owns this image's orchestration
    AlreadyStarted(ImageId),
    /// A summary was committed earlier; nothing to do
    AlreadyCommitted(ResultSummary),
}

impl StartOutcome {
    pub fn image_id(&self) -> &str {
        match self {
            StartOutcome::Finished(record) => record.id(),
            StartOutcome::AlreadyStarted(id) => id,
            StartOutcome::AlreadyCommitted(summary) => &summary.id,
        }
    }
}

// =============================================================================
// Attempt Execution
// =============================================================================

/// Progress events consumed by the fan-in loop
enum TaskEvent {
    /// An attempt ended
    Finished {
        kind: AnalysisKind,
        attempt: u32,
        outcome: Result<AnalyzerOutput, AttemptFailure>,
    },
    /// Backoff elapsed; the next attempt may start
    RetryDue(AnalysisKind),
}

/// Aborts the attempt's tokio task when the attempt is abandoned
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

/// Runs one attempt on its own tokio task under `budget`
async fn run_attempt(
    analyzer: Arc<dyn Analyzer>,
    image: ImageRef,
    attempt: u32,
    budget: Duration,
) -> Result<AnalyzerOutput, AttemptFailure> {
    let kind = analyzer.kind();
    let mut handle = tokio::spawn(async move { analyzer.run(&image, attempt).await });
    let _abort = AbortOnDrop(handle.abort_handle());

    let output = match tokio::time::timeout(budget, &mut handle).await {
        Err(_) => return Err(AttemptFailure::Timeout(budget)),
        Ok(Err(join_error)) if join_error.is_panic() => {
            return Err(AttemptFailure::Panicked(panic_message(
                join_error.into_panic(),
            )))
        }
        Ok(Err(join_error)) => {
            return Err(AttemptFailure::Analyzer(AnalyzerError::Failed(
                join_error.to_string(),
            )))
        }
        Ok(Ok(result)) => result.map_err(AttemptFailure::Analyzer)?,
    };

    kind.validate_output(&output)
        .map_err(AttemptFailure::ContractViolation)?;
    Ok(output)
}

// =============================================================================
// In-flight Guard
// =============================================================================

/// Marks an image as driven by this process until dropped
pub(super) struct InFlight<'a> {
    set: &'a Mutex<HashSet<ImageId>>,
    id: ImageId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.id);
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Durable fan-out/fan-in coordinator
pub struct Orchestrator {
    pub(super) config: OrchestratorConfig,
    roster: AnalyzerRoster,
    blob_store: Arc<dyn BlobStore>,
    pub(super) state_store: Arc<dyn OrchestrationStateStore>,
    result_store: Arc<dyn ResultStore>,
    pub(super) permits: Semaphore,
    in_flight: Mutex<HashSet<ImageId>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        roster: AnalyzerRoster,
        blob_store: Arc<dyn BlobStore>,
        state_store: Arc<dyn OrchestrationStateStore>,
        result_store: Arc<dyn ResultStore>,
    ) -> Self {
        let permits = Semaphore::new(config.max_concurrent_orchestrations.max(1));
        Self {
            config,
            roster,
            blob_store,
            state_store,
            result_store,
            permits,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Builds an orchestrator with the standard roster and the stores
    /// configured in `settings`
    pub fn open(settings: &PipelineSettings) -> CoreResult<Self> {
        let blob_store: Arc<dyn BlobStore> =
            Arc::new(LocalBlobStore::new(settings.container_root.clone()));
        let state_store: Arc<dyn OrchestrationStateStore> = match settings.state_backend {
            StateBackend::Sqlite => Arc::new(SqliteStateStore::open(settings.state_db_path())?),
            StateBackend::File => Arc::new(FileStateStore::new(settings.state_dir())?),
        };
        let result_store: Arc<dyn ResultStore> =
            Arc::new(SqliteResultStore::open(settings.result_db_path())?);

        Ok(Self::new(
            OrchestratorConfig::from_settings(settings),
            AnalyzerRoster::standard(blob_store.clone()),
            blob_store,
            state_store,
            result_store,
        ))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn result_store(&self) -> Arc<dyn ResultStore> {
        self.result_store.clone()
    }

    /// Current record of an orchestration
    pub fn status(&self, id: &str) -> CoreResult<OrchestrationRecord> {
        self.state_store
            .load(id)?
            .ok_or_else(|| CoreError::OrchestrationNotFound(id.to_string()))
    }

    pub(super) fn enter(&self, id: &str) -> CoreResult<Option<InFlight<'_>>> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| CoreError::Internal("in-flight set lock poisoned".to_string()))?;
        if !set.insert(id.to_string()) {
            return Ok(None);
        }
        Ok(Some(InFlight {
            set: &self.in_flight,
            id: id.to_string(),
        }))
    }

    /// Starts (or declines to start) the orchestration for `image`.
    ///
    /// Safe to call any number of times for the same upload, concurrently or
    /// not: at most one call drives it and at most one summary is committed.
    /// A reference without a version is pinned to the version found by the
    /// probe, so a later upload to the same location is a new orchestration.
    pub async fn start_orchestration(&self, image: ImageRef) -> CoreResult<StartOutcome> {
        let probed = self.blob_store.probe(&image).await;
        let image = match (&probed, image.version()) {
            (Ok(Some(meta)), None) => image.with_version(meta.version()),
            _ => image,
        };

        let id = image.id().to_string();
        let Some(_in_flight) = self.enter(&id)? else {
            tracing::debug!(image_id = %id, "Orchestration already in flight in this process");
            return Ok(StartOutcome::AlreadyStarted(id));
        };
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CoreError::Internal("orchestrator is shut down".to_string()))?;

        let now = Utc::now();
        let replacing = match self.state_store.load(&id)? {
            Some(existing)
                if existing.status == OrchestrationStatus::Running
                    && existing.is_claimable_by(&self.config.instance_id, now) =>
            {
                // The owner's lease lapsed: it crashed or stalled.
                return match self.claim_and_drive(&id).await? {
                    Some(record) => Ok(StartOutcome::Finished(record)),
                    None => Ok(StartOutcome::AlreadyStarted(id)),
                };
            }
            Some(existing) if existing.status != OrchestrationStatus::Failed => {
                tracing::debug!(
                    image_id = %id,
                    status = existing.status.as_str(),
                    "Duplicate notification ignored"
                );
                return Ok(StartOutcome::AlreadyStarted(id));
            }
            Some(_) => true,
            None => {
                if let Some(summary) = self.result_store.get(&id)? {
                    tracing::debug!(image_id = %id, "Summary already committed");
                    return Ok(StartOutcome::AlreadyCommitted(summary));
                }
                false
            }
        };

        let unreadable = match probed {
            Ok(Some(_)) => None,
            Ok(None) => Some(format!("source image not found: {}", image.location())),
            Err(e) => Some(e.to_string()),
        };

        // Failed records carry no lease so any instance may replace them.
        let record = match unreadable {
            Some(reason) => OrchestrationRecord::failed(image, reason, now),
            None => {
                let mut record = OrchestrationRecord::new(image, &self.roster.kinds(), now);
                record.renew_lease(&self.config.instance_id, self.config.lease, now);
                record
            }
        };

        let persisted = if replacing {
            match self.state_store.save(&record) {
                Ok(()) => true,
                Err(CoreError::LeaseHeld(_)) => false,
                Err(e) => return Err(e),
            }
        } else {
            self.state_store.create(&record)?
        };
        if !persisted {
            tracing::debug!(image_id = %id, "Lost the race to create the orchestration");
            return Ok(StartOutcome::AlreadyStarted(id));
        }

        if record.status == OrchestrationStatus::Failed {
            tracing::warn!(
                image_id = %id,
                reason = record.failure_reason.as_deref().unwrap_or_default(),
                "Orchestration failed before dispatch"
            );
            return Ok(StartOutcome::Finished(record));
        }

        tracing::info!(
            image_id = %id,
            location = record.image.location(),
            discovered_at = %record.image.discovered_at(),
            "Orchestration started"
        );
        let record = self.drive(record).await?;
        Ok(StartOutcome::Finished(record))
    }

    /// Saves `record`, renewing this instance's lease
    fn persist(&self, record: &mut OrchestrationRecord) -> CoreResult<()> {
        let now = Utc::now();
        record.updated_at = now;
        record.renew_lease(&self.config.instance_id, self.config.lease, now);
        self.state_store.save(record)
    }

    fn dispatch(&self, kind: AnalysisKind, attempt: u32, image: &ImageRef) -> BoxFuture<'static, TaskEvent> {
        let analyzer = self.roster.get(kind);
        let image = image.clone();
        let budget = self.config.task_timeout;

        tracing::debug!(image_id = %image.id(), %kind, attempt, "Dispatching analyzer");

        async move {
            let outcome = match analyzer {
                Some(analyzer) => run_attempt(analyzer, image, attempt, budget).await,
                None => Err(AttemptFailure::Analyzer(AnalyzerError::Failed(format!(
                    "no analyzer registered for '{}'",
                    kind
                )))),
            };
            TaskEvent::Finished {
                kind,
                attempt,
                outcome,
            }
        }
        .boxed()
    }

    /// Runs every non-terminal task of `record` to a terminal state, then
    /// finalizes.
    pub(super) async fn drive(&self, mut record: OrchestrationRecord) -> CoreResult<OrchestrationRecord> {
        let image = record.image.clone();
        let max_attempts = self.config.max_attempts();
        let mut pending: FuturesUnordered<BoxFuture<'static, TaskEvent>> = FuturesUnordered::new();

        for kind in record.non_terminal_kinds() {
            let task = record
                .task_mut(kind)
                .ok_or_else(|| CoreError::Internal(format!("task '{}' vanished", kind)))?;
            let attempt = task.start_attempt();
            pending.push(self.dispatch(kind, attempt, &image));
        }
        self.persist(&mut record)?;

        // Renew the lease while analyzers run or retries wait out their backoff
        let renew_every = self.config.renew_interval();
        let mut renewal = tokio::time::interval_at(Instant::now() + renew_every, renew_every);
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                event = pending.next() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = renewal.tick() => {
                    tracing::trace!(image_id = %image.id(), "Renewing orchestration lease");
                    self.persist(&mut record)?;
                    continue;
                }
            };

            let now = Utc::now();
            match event {
                TaskEvent::RetryDue(kind) => {
                    let task = record
                        .task_mut(kind)
                        .ok_or_else(|| CoreError::Internal(format!("task '{}' vanished", kind)))?;
                    let attempt = task.start_attempt();
                    pending.push(self.dispatch(kind, attempt, &image));
                }
                TaskEvent::Finished {
                    kind,
                    attempt,
                    outcome,
                } => {
                    let task = record
                        .task_mut(kind)
                        .ok_or_else(|| CoreError::Internal(format!("task '{}' vanished", kind)))?;
                    match outcome {
                        Ok(output) => {
                            task.record_success(output, now);
                            tracing::info!(image_id = %image.id(), %kind, attempt, "Analyzer succeeded");
                        }
                        Err(failure) => {
                            log_failure(image.id(), kind, attempt, &failure);
                            if task.record_failure(&failure, max_attempts, now) {
                                let delay = self.config.backoff_for(attempt);
                                pending.push(
                                    async move {
                                        tokio::time::sleep(delay).await;
                                        TaskEvent::RetryDue(kind)
                                    }
                                    .boxed(),
                                );
                            } else {
                                tracing::warn!(
                                    image_id = %image.id(),
                                    %kind,
                                    attempts = attempt,
                                    "Analyzer failed after exhausting retries"
                                );
                            }
                        }
                    }
                }
            }
            self.persist(&mut record)?;
        }

        self.finalize(record)
    }

    /// Commits the merged summary and archives the record.
    ///
    /// Idempotent: the summary is derived from persisted state only.
    fn finalize(&self, mut record: OrchestrationRecord) -> CoreResult<OrchestrationRecord> {
        let summary = ResultSummary::from_record(&record)?;
        self.result_store.upsert(&summary)?;

        record.mark_completed(Utc::now());
        self.persist(&mut record)?;

        tracing::info!(
            image_id = %record.id(),
            status = summary.status.as_str(),
            failed = ?summary.failed_analyzers,
            "Orchestration completed"
        );
        Ok(record)
    }

    /// Starts an orchestration for every image received on `rx` until the
    /// channel closes, then waits for the in-flight ones.
    ///
    /// Returns how many orchestrations this call finished.
    pub async fn process_events(self: Arc<Self>, mut rx: mpsc::Receiver<ImageRef>) -> usize {
        let mut running = JoinSet::new();
        let mut finished = 0;

        loop {
            tokio::select! {
                received = rx.recv() => {
                    let Some(image) = received else { break };
                    let orchestrator = self.clone();
                    running.spawn(async move {
                        let id = image.id().to_string();
                        (id, orchestrator.start_orchestration(image).await)
                    });
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    finished += count_outcome(joined);
                }
            }
        }

        while let Some(joined) = running.join_next().await {
            finished += count_outcome(joined);
        }
        finished
    }
}

fn count_outcome(
    joined: Result<(ImageId, CoreResult<StartOutcome>), tokio::task::JoinError>,
) -> usize {
    match joined {
        Ok((_, Ok(StartOutcome::Finished(_)))) => 1,
        Ok((_, Ok(_))) => 0,
        Ok((id, Err(e))) => {
            tracing::error!(
                image_id = %id,
                retryable = e.is_retryable(),
                "Orchestration aborted: {}",
                e
            );
            0
        }
        Err(e) => {
            tracing::error!("Orchestration task crashed: {}", e);
            0
        }
    }
}

fn log_failure(image_id: &str, kind: AnalysisKind, attempt: u32, failure: &AttemptFailure) {
    match failure {
        AttemptFailure::ContractViolation(detail) => tracing::error!(
            image_id,
            %kind,
            attempt,
            contract_violation = true,
            "Analyzer returned malformed output: {}",
            detail
        ),
        AttemptFailure::Panicked(message) => tracing::error!(
            image_id,
            %kind,
            attempt,
            "Analyzer panicked: {}",
            message
        ),
        other => tracing::warn!(image_id, %kind, attempt, "Analyzer attempt failed: {}", other),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    enum Script {
        Text,
        Sleep(Duration),
        Panic,
        Malformed,
        Error,
    }

    struct ScriptedText {
        script: Script,
        calls: AtomicU32,
    }

    impl ScriptedText {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Analyzer for ScriptedText {
        fn kind(&self) -> AnalysisKind {
            AnalysisKind::Text
        }

        async fn run(&self, _image: &ImageRef, _attempt: u32) -> Result<AnalyzerOutput, AnalyzerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.script {
                Script::Text => Ok(json!({"hasText": true}).as_object().cloned().unwrap()),
                Script::Sleep(d) => {
                    tokio::time::sleep(*d).await;
                    Ok(json!({"hasText": false}).as_object().cloned().unwrap())
                }
                Script::Panic => panic!("ocr engine exploded"),
                Script::Malformed => Ok(json!({"hasText": "maybe"}).as_object().cloned().unwrap()),
                Script::Error => Err(AnalyzerError::Unsupported("cmyk".into())),
            }
        }
    }

    async fn attempt(script: Script, budget: Duration) -> Result<AnalyzerOutput, AttemptFailure> {
        run_attempt(ScriptedText::new(script), ImageRef::new("a.jpg"), 1, budget).await
    }

    #[test]
    fn test_config_from_settings() {
        let settings = PipelineSettings {
            task_timeout_secs: 7,
            max_retries: 3,
            retry_backoff_ms: 250,
            ..Default::default()
        };
        let config = OrchestratorConfig::from_settings(&settings);

        assert_eq!(config.task_timeout, Duration::from_secs(7));
        assert_eq!(config.max_attempts(), 4);
        assert_eq!(config.backoff_for(1), Duration::from_millis(250));
        assert_eq!(config.backoff_for(3), Duration::from_millis(750));
    }

    #[test]
    fn test_instance_ids_are_unique() {
        let a = OrchestratorConfig::default();
        let b = OrchestratorConfig::default();
        assert_ne!(a.instance_id, b.instance_id);
    }

    #[tokio::test]
    async fn test_attempt_success() {
        let output = attempt(Script::Text, Duration::from_secs(1)).await.unwrap();
        assert_eq!(output["hasText"], true);
    }

    #[tokio::test]
    async fn test_attempt_timeout() {
        let result = attempt(Script::Sleep(Duration::from_secs(5)), Duration::from_millis(20)).await;
        assert_eq!(result, Err(AttemptFailure::Timeout(Duration::from_millis(20))));
    }

    #[tokio::test]
    async fn test_attempt_panic_is_contained() {
        let result = attempt(Script::Panic, Duration::from_secs(1)).await;
        assert_eq!(
            result,
            Err(AttemptFailure::Panicked("ocr engine exploded".to_string()))
        );
    }

    #[tokio::test]
    async fn test_attempt_malformed_output() {
        let result = attempt(Script::Malformed, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(AttemptFailure::ContractViolation(msg)) if msg.contains("hasText")));
    }

    #[tokio::test]
    async fn test_attempt_analyzer_error() {
        let result = attempt(Script::Error, Duration::from_secs(1)).await;
        assert_eq!(
            result,
            Err(AttemptFailure::Analyzer(AnalyzerError::Unsupported("cmyk".into())))
        );
    }

    #[test]
    fn test_panic_message_payloads() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42_u8)), "Unknown panic");
    }

    #[test]
    fn test_start_outcome_image_id() {
        let outcome = StartOutcome::AlreadyStarted("abc".to_string());
        assert_eq!(outcome.image_id(), "abc");
    }
}
