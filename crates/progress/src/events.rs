//! Job lifecycle events published by the driver.
//!
//! The presentation layer subscribes to a [`JobEventBus`] and renders
//! whatever it receives. Every job that enters monitoring produces
//! exactly one terminal event: [`JobEvent::Succeeded`],
//! [`JobEvent::Failed`] or [`JobEvent::Cancelled`].

use callcoach_core::progress::ProgressSnapshot;
use callcoach_core::types::JobId;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::channel::AbandonReason;

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

/// A state change of one analysis job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// The backend accepted the job.
    Submitted { job_id: JobId, filename: String },

    /// Progress tracking for the job started.
    Monitoring { job_id: JobId },

    /// The job's consolidated progress changed.
    Progress { snapshot: ProgressSnapshot },

    /// The push channel gave up; status polling takes over. Not a job
    /// failure.
    ChannelAbandoned {
        job_id: JobId,
        attempts: u32,
        reason: AbandonReason,
    },

    /// Analysis completed.
    Succeeded { job_id: JobId },

    /// Analysis failed on the backend.
    Failed {
        job_id: JobId,
        /// Human-readable reason reported by the backend.
        reason: String,
    },

    /// Monitoring stopped before the job reached a terminal phase.
    Cancelled { job_id: JobId },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Progress { snapshot } => snapshot.job_id,
            JobEvent::Submitted { job_id, .. }
            | JobEvent::Monitoring { job_id }
            | JobEvent::ChannelAbandoned { job_id, .. }
            | JobEvent::Succeeded { job_id }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Cancelled { job_id } => *job_id,
        }
    }

    /// Whether this is the last event published for its job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Succeeded { .. } | JobEvent::Failed { .. } | JobEvent::Cancelled { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// JobEventBus
// ---------------------------------------------------------------------------

/// Fan-out of [`JobEvent`]s to any number of subscribers.
///
/// Slow receivers observe `RecvError::Lagged` once the buffer fills.
pub struct JobEventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl JobEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Dropped silently when nobody is subscribed.
    pub fn publish(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for JobEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
