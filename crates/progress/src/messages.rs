//! Push-channel message types and parser.
//!
//! The backend sends one JSON object per progress event with the shape
//! `{"call_id": 42, "progress": 10, "status": "processing", "message": "..."}`.
//! Each frame is decoded independently; a malformed frame never affects
//! the frames around it.

use callcoach_core::progress::{Phase, ProgressSnapshot, SnapshotSource};
use callcoach_core::types::JobId;
use serde::Deserialize;

/// A single progress event as sent by the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressMessage {
    /// The job this event belongs to.
    pub call_id: JobId,
    /// Completion percentage. Out-of-range values are clamped on conversion.
    pub progress: i64,
    /// Backend status name. Unknown names are kept and treated as non-terminal.
    pub status: String,
    /// Optional human-readable detail (e.g. the failure reason).
    #[serde(default)]
    pub message: Option<String>,
}

impl ProgressMessage {
    pub fn phase(&self) -> Phase {
        Phase::from_status(&self.status)
    }

    /// Convert into a push-sourced snapshot.
    pub fn into_snapshot(self) -> ProgressSnapshot {
        let phase = self.phase();
        let mut snapshot =
            ProgressSnapshot::new(self.call_id, self.progress, phase, SnapshotSource::Push);
        snapshot.message = self.message;
        snapshot
    }
}

/// Parse a push-channel text frame.
///
/// Returns `Err` for malformed JSON or missing fields. Callers should log
/// and drop the frame.
pub fn parse_message(text: &str) -> Result<ProgressMessage, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_processing_message() {
        let json = r#"{"call_id":42,"progress":10,"status":"processing","message":"Transcribing"}"#;
        let msg = parse_message(json).unwrap();
        assert_eq!(msg.call_id, 42);
        assert_eq!(msg.progress, 10);
        assert_eq!(msg.phase(), Phase::Processing);
        assert_eq!(msg.message.as_deref(), Some("Transcribing"));
    }

    #[test]
    fn parse_message_without_text() {
        let json = r#"{"call_id":42,"progress":100,"status":"completed"}"#;
        let msg = parse_message(json).unwrap();
        assert!(msg.message.is_none());
        assert!(msg.phase().is_terminal());
    }

    #[test]
    fn failed_message_keeps_reason() {
        let json = r#"{"call_id":3,"progress":0,"status":"failed","message":"audio unreadable"}"#;
        let snap = parse_message(json).unwrap().into_snapshot();
        assert_eq!(snap.phase, Phase::Failed);
        assert_eq!(snap.message.as_deref(), Some("audio unreadable"));
        assert_eq!(snap.source, SnapshotSource::Push);
    }

    #[test]
    fn unknown_status_is_accepted_as_non_terminal() {
        let json = r#"{"call_id":1,"progress":50,"status":"evaluating"}"#;
        let msg = parse_message(json).unwrap();
        assert_eq!(msg.status, "evaluating");
        assert!(!msg.phase().is_terminal());
    }

    #[test]
    fn out_of_range_progress_is_clamped() {
        let json = r#"{"call_id":1,"progress":180,"status":"processing"}"#;
        let snap = parse_message(json).unwrap().into_snapshot();
        assert_eq!(snap.percent, 100);
    }

    #[test]
    fn parse_invalid_json_returns_error() {
        assert!(parse_message("{not json").is_err());
    }

    #[test]
    fn parse_missing_fields_returns_error() {
        assert!(parse_message(r#"{"progress":10}"#).is_err());
    }
}
