//! Consolidated progress view with a polling fallback.
//!
//! [`ProgressAggregator`] keeps the latest [`ProgressSnapshot`] for every
//! tracked job and exposes it to the presentation layer, either as a
//! one-off read ([`latest`](ProgressAggregator::latest)) or as a
//! [`watch::Receiver`] per job. A terminal snapshot is final: later
//! updates for that job are rejected here as well as in the channel.
//!
//! When a job's push channel is abandoned the aggregator polls the
//! authoritative status endpoint instead, until a terminal status shows
//! up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use callcoach_core::progress::ProgressSnapshot;
use callcoach_core::types::JobId;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::JobStore;

type JobMap = HashMap<JobId, TrackedJob>;

struct TrackedJob {
    snapshot: watch::Sender<ProgressSnapshot>,
    poller: Option<StatusTask>,
    /// The latest one-off status check started by `reconcile`.
    reconcile: Option<StatusTask>,
}

impl TrackedJob {
    fn stop_status_tasks(&mut self) {
        if let Some(task) = self.poller.take() {
            task.stop();
        }
        if let Some(task) = self.reconcile.take() {
            task.stop();
        }
    }
}

/// A background task querying the status endpoint for one job.
///
/// Stopped while the job map is locked; results are applied only under
/// the same lock after checking `cancel`, so a stopped task never writes.
struct StatusTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl StatusTask {
    fn stop(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

/// Result of offering a snapshot to the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Stored; the job is still in progress.
    Applied,
    /// Stored, and the job has now reached a terminal phase.
    Finished,
    /// Dropped because the job already has a terminal snapshot.
    RejectedTerminal,
    /// Dropped because the job is not tracked.
    NotTracked,
}

fn lock(jobs: &Mutex<JobMap>) -> MutexGuard<'_, JobMap> {
    jobs.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Latest progress of every tracked job.
///
/// Dropping the aggregator stops all of its pollers.
pub struct ProgressAggregator {
    store: Arc<dyn JobStore>,
    poll_interval: Duration,
    jobs: Arc<Mutex<JobMap>>,
}

impl ProgressAggregator {
    pub fn new(store: Arc<dyn JobStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Begin tracking `job_id` with a Queued/0% snapshot.
    ///
    /// Tracking an already-tracked job keeps its current snapshot.
    /// Returns a receiver that observes every accepted update.
    pub fn track(&self, job_id: JobId) -> watch::Receiver<ProgressSnapshot> {
        let mut jobs = lock(&self.jobs);
        jobs.entry(job_id)
            .or_insert_with(|| {
                tracing::debug!(job_id, "Tracking job progress");
                TrackedJob {
                    snapshot: watch::channel(ProgressSnapshot::queued(job_id)).0,
                    poller: None,
                    reconcile: None,
                }
            })
            .snapshot
            .subscribe()
    }

    /// The most recent snapshot, or `None` if the job is not tracked.
    pub fn latest(&self, job_id: JobId) -> Option<ProgressSnapshot> {
        lock(&self.jobs)
            .get(&job_id)
            .map(|job| job.snapshot.borrow().clone())
    }

    /// Subscribe to updates of an already-tracked job.
    pub fn watch(&self, job_id: JobId) -> Option<watch::Receiver<ProgressSnapshot>> {
        lock(&self.jobs)
            .get(&job_id)
            .map(|job| job.snapshot.subscribe())
    }

    /// Snapshots of all tracked jobs, ordered by job id.
    pub fn snapshots(&self) -> Vec<ProgressSnapshot> {
        let mut all: Vec<ProgressSnapshot> = lock(&self.jobs)
            .values()
            .map(|job| job.snapshot.borrow().clone())
            .collect();
        all.sort_by_key(|snap| snap.job_id);
        all
    }

    /// Offer a new snapshot for its job.
    ///
    /// Channels are single-writer per job, so an accepted update simply
    /// overwrites. Updates after a terminal snapshot are rejected.
    pub fn on_update(&self, snapshot: ProgressSnapshot) -> UpdateOutcome {
        apply_update(lock(&self.jobs), snapshot)
    }

    /// Start polling the status endpoint for `job_id`.
    ///
    /// No-op (returning `false`) if the job is untracked, already
    /// terminal, or already being polled.
    pub fn start_polling(&self, job_id: JobId) -> bool {
        let mut jobs = lock(&self.jobs);
        let Some(job) = jobs.get_mut(&job_id) else {
            return false;
        };
        if job.poller.is_some() || job.snapshot.borrow().is_terminal() {
            return false;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(poll_status(
            job_id,
            Arc::clone(&self.store),
            self.poll_interval,
            Arc::downgrade(&self.jobs),
            cancel.clone(),
        ));
        job.poller = Some(StatusTask { cancel, task });

        tracing::info!(
            job_id,
            interval_ms = self.poll_interval.as_millis() as u64,
            "Push channel unavailable, polling job status",
        );
        true
    }

    /// Check the status endpoint once and adopt the result if it is
    /// terminal.
    ///
    /// Used after a channel (re)opens: a job that finished while no
    /// channel was connected never gets its terminal push. A check still
    /// in flight for the same job is replaced.
    pub fn reconcile(&self, job_id: JobId) {
        let mut jobs = lock(&self.jobs);
        let Some(job) = jobs.get_mut(&job_id) else {
            return;
        };
        if job.snapshot.borrow().is_terminal() {
            return;
        }
        if let Some(previous) = job.reconcile.take() {
            previous.stop();
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(reconcile_status(
            job_id,
            Arc::clone(&self.store),
            Arc::downgrade(&self.jobs),
            cancel.clone(),
        ));
        job.reconcile = Some(StatusTask { cancel, task });
    }

    /// Stop polling `job_id` and drop any reconcile check still in
    /// flight for it.
    pub fn stop_polling(&self, job_id: JobId) {
        let mut jobs = lock(&self.jobs);
        let Some(job) = jobs.get_mut(&job_id) else {
            return;
        };
        let was_polling = job.poller.is_some();
        job.stop_status_tasks();
        if was_polling {
            tracing::debug!(job_id, "Stopped status polling");
        }
    }

    pub fn is_polling(&self, job_id: JobId) -> bool {
        lock(&self.jobs)
            .get(&job_id)
            .is_some_and(|job| job.poller.is_some())
    }

    /// Stop tracking `job_id` along with its polling and reconcile tasks.
    pub fn untrack(&self, job_id: JobId) {
        let mut jobs = lock(&self.jobs);
        if let Some(mut job) = jobs.remove(&job_id) {
            job.stop_status_tasks();
        }
    }

    /// Stop every poller and reconcile check. Snapshots are kept.
    pub fn stop_all(&self) {
        let mut jobs = lock(&self.jobs);
        for job in jobs.values_mut() {
            job.stop_status_tasks();
        }
    }
}

impl Drop for ProgressAggregator {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Store a snapshot read by a background status task.
///
/// Returns `None` without writing if the task was stopped; the check runs
/// under the map lock, which every stop also holds.
fn apply_from_task(
    jobs: &Mutex<JobMap>,
    snapshot: ProgressSnapshot,
    cancel: &CancellationToken,
) -> Option<UpdateOutcome> {
    let guard = lock(jobs);
    if cancel.is_cancelled() {
        return None;
    }
    Some(apply_update(guard, snapshot))
}

/// Store `snapshot` unless its job is untracked or already terminal.
///
/// Reaching a terminal phase also stops the job's status tasks.
fn apply_update(mut guard: MutexGuard<'_, JobMap>, snapshot: ProgressSnapshot) -> UpdateOutcome {
    let job_id = snapshot.job_id;
    let Some(job) = guard.get_mut(&job_id) else {
        tracing::debug!(job_id, "Ignoring update for untracked job");
        return UpdateOutcome::NotTracked;
    };

    if job.snapshot.borrow().is_terminal() {
        tracing::debug!(job_id, phase = %snapshot.phase, "Ignoring update after terminal snapshot");
        return UpdateOutcome::RejectedTerminal;
    }

    let terminal = snapshot.is_terminal();
    job.snapshot.send_replace(snapshot);
    if !terminal {
        return UpdateOutcome::Applied;
    }

    job.stop_status_tasks();
    UpdateOutcome::Finished
}

/// One status check; a terminal answer is adopted, anything else is
/// left to the push channel.
async fn reconcile_status(
    job_id: JobId,
    store: Arc<dyn JobStore>,
    jobs: Weak<Mutex<JobMap>>,
    cancel: CancellationToken,
) {
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        result = store.fetch_status(job_id) => result,
    };

    match result {
        Ok(report) if report.phase().is_terminal() => {
            let Some(jobs) = jobs.upgrade() else {
                return;
            };
            let outcome = apply_from_task(&jobs, report.into_snapshot(), &cancel);
            if outcome == Some(UpdateOutcome::Finished) {
                tracing::info!(job_id, "Terminal status found while reconciling");
            }
        }
        Ok(_) => {}
        Err(e) => {
            tracing::debug!(job_id, error = %e, "Status reconcile failed");
        }
    }
}

/// Poll the status endpoint until the job is terminal, cancelled, or the
/// aggregator is gone. Request errors are logged and retried on the next
/// tick.
async fn poll_status(
    job_id: JobId,
    store: Arc<dyn JobStore>,
    interval: Duration,
    jobs: Weak<Mutex<JobMap>>,
    cancel: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = store.fetch_status(job_id) => result,
        };

        match result {
            Ok(report) => {
                let Some(jobs) = jobs.upgrade() else {
                    return;
                };
                let snapshot = report.into_snapshot();
                tracing::debug!(
                    job_id,
                    phase = %snapshot.phase,
                    percent = snapshot.percent,
                    "Polled job status",
                );
                match apply_from_task(&jobs, snapshot, &cancel) {
                    Some(UpdateOutcome::Applied) => {}
                    Some(UpdateOutcome::Finished) => {
                        tracing::info!(job_id, "Terminal status observed by polling");
                        return;
                    }
                    Some(UpdateOutcome::RejectedTerminal | UpdateOutcome::NotTracked) | None => {
                        return
                    }
                }
            }
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Status poll failed");
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
