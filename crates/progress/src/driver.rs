//! End-to-end lifecycle of analysis jobs.
//!
//! [`JobLifecycleDriver`] submits jobs, subscribes each accepted job to
//! its progress channel, feeds the aggregator and, once a job reaches a
//! terminal phase, tears the subscription down and fetches the final
//! record. Lifecycle changes are published on a [`JobEventBus`].
//!
//! ```text
//! Submitted -> Monitoring -> Succeeded | Failed | Cancelled
//! ```
//!
//! Jobs of one batch are monitored concurrently and independently; a
//! failure of one never affects the others.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use callcoach_core::progress::{Phase, ProgressSnapshot};
use callcoach_core::types::JobId;
use futures::future::join_all;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::aggregator::ProgressAggregator;
use crate::api::{ApiError, CallCoachApi, CallDetail, JobStore, JobSubmitter, UploadRequest};
use crate::channel::{ChannelEvent, ChannelState, ProgressChannel};
use crate::client::{ProgressConnector, WsConnector};
use crate::config::MonitorConfig;
use crate::events::{JobEvent, JobEventBus};
use crate::registry::ChannelRegistry;

/// Reason surfaced when the backend reports a failure without a message.
pub const FALLBACK_FAILURE_REASON: &str = "Analysis failed without a reason from the server";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Where a job is in its lifecycle, as seen by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobLifecycle {
    Submitted,
    Monitoring,
    Succeeded,
    Failed,
    Cancelled,
}

/// Final result of monitoring one job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// The job completed. `record` is `None` if the final record could
    /// not be fetched.
    Succeeded {
        job_id: JobId,
        record: Option<CallDetail>,
    },
    /// The backend reported a failure.
    Failed {
        job_id: JobId,
        reason: String,
        record: Option<CallDetail>,
    },
    /// Monitoring stopped before a terminal phase was observed.
    Cancelled { job_id: JobId },
}

impl JobOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            JobOutcome::Succeeded { job_id, .. }
            | JobOutcome::Failed { job_id, .. }
            | JobOutcome::Cancelled { job_id } => *job_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded { .. })
    }

    pub fn record(&self) -> Option<&CallDetail> {
        match self {
            JobOutcome::Succeeded { record, .. } | JobOutcome::Failed { record, .. } => {
                record.as_ref()
            }
            JobOutcome::Cancelled { .. } => None,
        }
    }
}

/// Errors that prevent a batch from being monitored at all.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The backend rejected the submission or could not be reached.
    #[error("Submission failed: {0}")]
    Submission(#[from] ApiError),

    /// The submission succeeded but produced no jobs.
    #[error("The backend accepted none of the submitted files")]
    NothingAccepted,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// JobLifecycleDriver
// ---------------------------------------------------------------------------

/// Drives submitted jobs from acceptance to a terminal outcome.
///
/// Share it as `Arc<JobLifecycleDriver>` when [`shutdown`] must be
/// reachable from another task (e.g. a Ctrl-C handler).
///
/// [`shutdown`]: JobLifecycleDriver::shutdown
pub struct JobLifecycleDriver {
    submitter: Arc<dyn JobSubmitter>,
    store: Arc<dyn JobStore>,
    registry: ChannelRegistry,
    aggregator: Arc<ProgressAggregator>,
    events: Arc<JobEventBus>,
    lifecycles: Mutex<HashMap<JobId, JobLifecycle>>,
    cancel: CancellationToken,
}

impl JobLifecycleDriver {
    pub fn new(
        config: MonitorConfig,
        connector: Arc<dyn ProgressConnector>,
        submitter: Arc<dyn JobSubmitter>,
        store: Arc<dyn JobStore>,
    ) -> Self {
        let aggregator = Arc::new(ProgressAggregator::new(
            Arc::clone(&store),
            config.poll_interval,
        ));
        Self {
            submitter,
            store,
            registry: ChannelRegistry::new(config, connector),
            aggregator,
            events: Arc::new(JobEventBus::default()),
            lifecycles: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Driver talking to the real backend over HTTP and WebSocket.
    pub fn connect(config: MonitorConfig) -> Result<Self, ApiError> {
        let api = Arc::new(CallCoachApi::new(&config)?);
        let connector = Arc::new(WsConnector::new(&config));
        Ok(Self::new(config, connector, api.clone(), api))
    }

    /// Subscribe to lifecycle events of every job this driver handles.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn aggregator(&self) -> &ProgressAggregator {
        &self.aggregator
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn lifecycle(&self, job_id: JobId) -> Option<JobLifecycle> {
        lock(&self.lifecycles).get(&job_id).copied()
    }

    /// Upload a batch and monitor every accepted job to completion.
    ///
    /// Outcomes are returned in submission order.
    pub async fn submit_batch(
        &self,
        request: &UploadRequest,
    ) -> Result<Vec<JobOutcome>, DriverError> {
        let calls = self.submitter.submit(request).await?;
        if calls.is_empty() {
            return Err(DriverError::NothingAccepted);
        }

        tracing::info!(count = calls.len(), "Batch accepted");
        for call in &calls {
            self.mark_submitted(call.id);
            self.events.publish(JobEvent::Submitted {
                job_id: call.id,
                filename: call.filename.clone(),
            });
        }

        let job_ids: Vec<JobId> = calls.iter().map(|call| call.id).collect();
        Ok(self.monitor(&job_ids).await)
    }

    /// Start (or restart) analysis of an existing call and monitor it.
    pub async fn analyze(&self, job_id: JobId) -> Result<JobOutcome, DriverError> {
        let accepted = self.submitter.start_analysis(job_id).await?;
        tracing::info!(job_id, status = %accepted.status, "Analysis started");

        // A finished previous run must not short-circuit the new one.
        if self.lifecycle(job_id) != Some(JobLifecycle::Monitoring) {
            self.aggregator.untrack(job_id);
        }
        self.mark_submitted(job_id);
        Ok(self.monitor_job(job_id).await)
    }

    /// Monitor already-running jobs until each reaches a terminal phase.
    ///
    /// Duplicate ids are monitored once.
    pub async fn monitor(&self, job_ids: &[JobId]) -> Vec<JobOutcome> {
        let mut seen = HashSet::new();
        let unique: Vec<JobId> = job_ids
            .iter()
            .copied()
            .filter(|job_id| seen.insert(*job_id))
            .collect();
        join_all(unique.into_iter().map(|job_id| self.monitor_job(job_id))).await
    }

    /// Stop monitoring everything: close all channels, stop all pollers
    /// and resolve pending jobs as [`JobOutcome::Cancelled`].
    ///
    /// The driver stays cancelled; later calls resolve immediately.
    pub fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        tracing::info!(active = self.registry.len(), "Shutting down job monitoring");
        self.cancel.cancel();
        self.registry.unsubscribe_all();
        self.aggregator.stop_all();
    }

    // ---- private helpers ----

    async fn monitor_job(&self, job_id: JobId) -> JobOutcome {
        if self.cancel.is_cancelled() {
            return JobOutcome::Cancelled { job_id };
        }

        // Only the first concurrent monitor of a job owns its channel and
        // publishes its events; others just await the same outcome.
        let owner = self.begin_monitoring(job_id);
        let mut progress = self.aggregator.track(job_id);

        let channel = if owner {
            self.events.publish(JobEvent::Monitoring { job_id });
            Some(self.open_channel(job_id))
        } else {
            tracing::debug!(job_id, "Job already monitored, awaiting its outcome");
            None
        };

        let terminal = self
            .wait_for_terminal(job_id, &mut progress, channel.as_ref(), owner)
            .await;

        if let Some(channel) = channel {
            self.registry.unsubscribe(job_id);
            self.aggregator.stop_polling(job_id);
            channel.join().await;
        }

        let outcome = match terminal {
            None => JobOutcome::Cancelled { job_id },
            Some(snapshot) => {
                let record = self.fetch_record(job_id).await;
                match snapshot.phase {
                    Phase::Failed => JobOutcome::Failed {
                        job_id,
                        reason: failure_reason(&snapshot),
                        record,
                    },
                    _ => JobOutcome::Succeeded { job_id, record },
                }
            }
        };

        if owner {
            self.finish(&outcome);
        }
        outcome
    }

    /// Subscribe `job_id` to its push channel, routing snapshots into the
    /// aggregator and switching to polling when the channel gives up.
    fn open_channel(&self, job_id: JobId) -> ProgressChannel {
        let aggregator = Arc::clone(&self.aggregator);
        let events = Arc::clone(&self.events);

        self.registry.subscribe(job_id, move |event| match event {
            ChannelEvent::Snapshot(snapshot) => {
                aggregator.on_update(snapshot);
            }
            ChannelEvent::Abandoned {
                job_id,
                attempts,
                reason,
            } => {
                events.publish(JobEvent::ChannelAbandoned {
                    job_id,
                    attempts,
                    reason,
                });
                aggregator.start_polling(job_id);
            }
        })
    }

    /// Publish progress until the aggregator holds a terminal snapshot.
    ///
    /// Returns `None` on shutdown or if the job stops being tracked.
    async fn wait_for_terminal(
        &self,
        job_id: JobId,
        progress: &mut watch::Receiver<ProgressSnapshot>,
        channel: Option<&ProgressChannel>,
        publish: bool,
    ) -> Option<ProgressSnapshot> {
        let mut channel_state = channel.map(ProgressChannel::state_changes);
        if let Some(state) = channel_state.as_mut() {
            if *state.borrow_and_update() == ChannelState::Open {
                self.aggregator.reconcile(job_id);
            }
        }

        loop {
            let snapshot = progress.borrow_and_update().clone();
            if publish {
                self.events.publish(JobEvent::Progress {
                    snapshot: snapshot.clone(),
                });
            }
            if snapshot.is_terminal() {
                return Some(snapshot);
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                changed = progress.changed() => {
                    if changed.is_err() {
                        tracing::debug!(job_id, "Job no longer tracked");
                        return None;
                    }
                }
                state = next_state(channel_state.as_mut()) => {
                    if state == ChannelState::Open {
                        self.aggregator.reconcile(job_id);
                    }
                }
            }
        }
    }

    async fn fetch_record(&self, job_id: JobId) -> Option<CallDetail> {
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            result = self.store.fetch_record(job_id) => result,
        };
        match result {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Failed to fetch final call record");
                None
            }
        }
    }

    fn begin_monitoring(&self, job_id: JobId) -> bool {
        let mut lifecycles = lock(&self.lifecycles);
        if lifecycles.get(&job_id) == Some(&JobLifecycle::Monitoring) {
            return false;
        }
        lifecycles.insert(job_id, JobLifecycle::Monitoring);
        true
    }

    fn mark_submitted(&self, job_id: JobId) {
        let mut lifecycles = lock(&self.lifecycles);
        if lifecycles.get(&job_id) != Some(&JobLifecycle::Monitoring) {
            lifecycles.insert(job_id, JobLifecycle::Submitted);
        }
    }

    fn finish(&self, outcome: &JobOutcome) {
        let job_id = outcome.job_id();
        let (lifecycle, event) = match outcome {
            JobOutcome::Succeeded { .. } => {
                tracing::info!(job_id, "Analysis completed");
                (JobLifecycle::Succeeded, JobEvent::Succeeded { job_id })
            }
            JobOutcome::Failed { reason, .. } => {
                tracing::warn!(job_id, reason = %reason, "Analysis failed");
                (
                    JobLifecycle::Failed,
                    JobEvent::Failed {
                        job_id,
                        reason: reason.clone(),
                    },
                )
            }
            JobOutcome::Cancelled { .. } => {
                tracing::info!(job_id, "Monitoring cancelled");
                (JobLifecycle::Cancelled, JobEvent::Cancelled { job_id })
            }
        };
        lock(&self.lifecycles).insert(job_id, lifecycle);
        self.events.publish(event);
    }
}

impl Drop for JobLifecycleDriver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Next state of a channel. Pending forever without a channel, or once
/// the channel can no longer change.
async fn next_state(state: Option<&mut watch::Receiver<ChannelState>>) -> ChannelState {
    if let Some(state) = state {
        if state.changed().await.is_ok() {
            return *state.borrow_and_update();
        }
    }
    std::future::pending().await
}

fn failure_reason(snapshot: &ProgressSnapshot) -> String {
    snapshot
        .message
        .as_deref()
        .map(str::trim)
        .filter(|message| !message.is_empty())
        .unwrap_or(FALLBACK_FAILURE_REASON)
        .to_string()
}

#[cfg(test)]
mod tests {
    use callcoach_core::progress::SnapshotSource;

    use super::*;

    fn failed(message: Option<&str>) -> ProgressSnapshot {
        let snapshot = ProgressSnapshot::new(1, 100, Phase::Failed, SnapshotSource::Push);
        match message {
            Some(message) => snapshot.with_message(message),
            None => snapshot,
        }
    }

    #[test]
    fn failure_reason_uses_backend_message() {
        assert_eq!(failure_reason(&failed(Some("audio unreadable"))), "audio unreadable");
    }

    #[test]
    fn failure_reason_falls_back_when_missing_or_blank() {
        assert_eq!(failure_reason(&failed(None)), FALLBACK_FAILURE_REASON);
        assert_eq!(failure_reason(&failed(Some("   "))), FALLBACK_FAILURE_REASON);
    }

    #[test]
    fn outcome_accessors() {
        let ok = JobOutcome::Succeeded {
            job_id: 3,
            record: None,
        };
        assert_eq!(ok.job_id(), 3);
        assert!(ok.is_success());
        assert!(ok.record().is_none());
        assert!(!JobOutcome::Cancelled { job_id: 4 }.is_success());
    }
}
