/// Backend primary keys are integer identifiers.
pub type DbId = i64;

/// Identifier the backend assigns to an analysis job at submission time.
///
/// A job is keyed by the id of the call record it analyses.
pub type JobId = DbId;
