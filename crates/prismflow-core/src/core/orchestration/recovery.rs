//! Orchestration Recovery
//!
//! Resumes orchestrations left `running` by a crashed or stopped process and
//! purges finished records past their retention.
//!
//! A record leased by a process that just died is skipped until its lease
//! lapses, so long-running orchestrators rescan with [`Orchestrator::recover_until`].

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::time::MissedTickBehavior;

use crate::core::{CoreError, CoreResult, ImageId};

use super::{OrchestrationRecord, OrchestrationStatus, Orchestrator};

/// Outcome of a recovery scan
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// Claimed and driven to completion
    pub resumed: Vec<ImageId>,
    /// Leased by another live instance or already in flight here
    pub skipped: Vec<ImageId>,
    /// Claimed (or attempted) but could not be finished, with the error
    pub failed: Vec<(ImageId, String)>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl Orchestrator {
    /// Claims and resumes every incomplete orchestration.
    ///
    /// Tasks cut off mid-attempt go back to pending without counting the lost
    /// attempt; succeeded tasks are never run again.
    pub async fn recover(&self) -> CoreResult<RecoveryReport> {
        let incomplete = self.state_store.list_incomplete()?;
        tracing::debug!(count = incomplete.len(), "Scanning incomplete orchestrations");

        let mut report = RecoveryReport::default();
        let resumed = join_all(incomplete.into_iter().map(|record| async move {
            let id = record.id().to_string();
            (id.clone(), self.resume(&id).await)
        }))
        .await;

        for (id, outcome) in resumed {
            match outcome {
                Ok(true) => report.resumed.push(id),
                Ok(false) => report.skipped.push(id),
                Err(e) => {
                    tracing::error!(image_id = %id, "Recovery failed: {}", e);
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        if !report.resumed.is_empty() || !report.failed.is_empty() {
            tracing::info!(
                resumed = report.resumed.len(),
                skipped = report.skipped.len(),
                failed = report.failed.len(),
                "Recovery finished"
            );
        }
        Ok(report)
    }

    /// Runs [`Orchestrator::recover`] every `period` until `shutdown`
    /// completes. The first scan runs immediately.
    ///
    /// Returns how many orchestrations were resumed.
    pub async fn recover_until<F>(&self, period: Duration, shutdown: F) -> usize
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let mut resumed = 0;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => match self.recover().await {
                    Ok(report) => resumed += report.resumed.len(),
                    Err(e) => tracing::warn!(error = %e, "Recovery scan failed"),
                },
            }
        }
        resumed
    }

    /// Claims one record and drives it; `Ok(false)` when someone else owns it
    async fn resume(&self, id: &str) -> CoreResult<bool> {
        let Some(_in_flight) = self.enter(id)? else {
            return Ok(false);
        };
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CoreError::Internal("orchestrator is shut down".to_string()))?;

        Ok(self.claim_and_drive(id).await?.is_some())
    }

    /// Takes the lease on a running record and drives it to completion.
    ///
    /// The caller holds the in-flight guard and a permit. `Ok(None)` when the
    /// record is leased by another live instance or no longer running.
    pub(super) async fn claim_and_drive(&self, id: &str) -> CoreResult<Option<OrchestrationRecord>> {
        let claimed = self.state_store.try_claim(
            id,
            &self.config.instance_id,
            self.config.lease,
            Utc::now(),
        )?;
        let Some(mut record) = claimed else {
            tracing::debug!(image_id = %id, "Orchestration leased by another instance");
            return Ok(None);
        };
        if record.status != OrchestrationStatus::Running {
            return Ok(None);
        }

        let reset = record.reset_interrupted_tasks();
        tracing::info!(
            image_id = %id,
            interrupted = reset,
            remaining = ?record.non_terminal_kinds(),
            "Resuming orchestration"
        );

        self.drive(record).await.map(Some)
    }

    /// Deletes completed and failed records that finished more than
    /// `retention` ago. Returns the number removed.
    pub fn purge_finished(&self, retention: chrono::Duration) -> CoreResult<usize> {
        let cutoff = Utc::now() - retention;
        let ids = self.state_store.list_finished_before(cutoff)?;
        for id in &ids {
            self.state_store.delete(id)?;
        }
        tracing::info!(purged = ids.len(), %cutoff, "Purged finished orchestrations");
        Ok(ids.len())
    }
}
