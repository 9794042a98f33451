//! Job progress phases and snapshots.
//!
//! A [`ProgressSnapshot`] is the unit of progress the monitoring layer
//! passes around. Snapshots are produced from push messages, from the
//! status polling fallback, or locally when tracking starts.

use serde::{Deserialize, Serialize};

use crate::types::JobId;

// ---------------------------------------------------------------------------
// Backend status names
// ---------------------------------------------------------------------------

pub const STATUS_QUEUED: &str = "queued";
/// Reported by the status endpoint for calls that were never started.
pub const STATUS_PENDING: &str = "pending";
pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Lifecycle phase of an analysis job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl Phase {
    /// Map a backend status string onto a phase.
    ///
    /// Unknown values are treated as in-progress so that monitoring
    /// continues rather than stopping on a status this client does not
    /// recognise.
    pub fn from_status(status: &str) -> Self {
        match status {
            STATUS_QUEUED | STATUS_PENDING => Phase::Queued,
            STATUS_PROCESSING => Phase::Processing,
            STATUS_COMPLETED => Phase::Completed,
            STATUS_FAILED => Phase::Failed,
            _ => Phase::Processing,
        }
    }

    /// Completed and Failed are final: nothing may follow them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Queued => STATUS_QUEUED,
            Phase::Processing => STATUS_PROCESSING,
            Phase::Completed => STATUS_COMPLETED,
            Phase::Failed => STATUS_FAILED,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ProgressSnapshot
// ---------------------------------------------------------------------------

/// Where a snapshot originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    /// Delivered over the job's push channel.
    Push,
    /// Read from the authoritative status endpoint by the polling fallback.
    Poll,
    /// Created locally, e.g. the initial Queued snapshot.
    Local,
}

/// Point-in-time progress of a single job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: JobId,
    /// Completion percentage, always within `0..=100`.
    pub percent: u8,
    pub phase: Phase,
    pub message: Option<String>,
    pub source: SnapshotSource,
}

impl ProgressSnapshot {
    /// Create a snapshot, clamping `percent` into `0..=100`.
    pub fn new(job_id: JobId, percent: i64, phase: Phase, source: SnapshotSource) -> Self {
        Self {
            job_id,
            percent: clamp_percent(percent),
            phase,
            message: None,
            source,
        }
    }

    /// The initial snapshot recorded when tracking of a job begins.
    pub fn queued(job_id: JobId) -> Self {
        Self::new(job_id, 0, Phase::Queued, SnapshotSource::Local)
    }

    /// Attach a human-readable message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// Clamp a raw percentage reported by the backend into `0..=100`.
pub fn clamp_percent(raw: i64) -> u8 {
    raw.clamp(0, 100) as u8
}
