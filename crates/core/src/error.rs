use crate::types::JobId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),
}

/// Parse a user-supplied job identifier.
///
/// Backend ids are positive integers; anything else is rejected before
/// a channel or request is ever made for it.
pub fn parse_job_id(raw: &str) -> Result<JobId, CoreError> {
    let id: JobId = raw
        .trim()
        .parse()
        .map_err(|_| CoreError::Validation(format!("'{raw}' is not a valid job id")))?;
    if id <= 0 {
        return Err(CoreError::Validation(format!(
            "Job id must be positive, got {id}"
        )));
    }
    Ok(id)
}
