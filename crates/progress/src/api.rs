//! REST client for the call analysis backend.
//!
//! [`CallCoachApi`] wraps the HTTP endpoints the monitoring layer needs:
//! upload (which also starts analysis), explicit analysis start, status
//! lookup, the authoritative call record, retest and health. The
//! [`JobSubmitter`] and [`JobStore`] traits are the seams the driver and
//! aggregator depend on.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use callcoach_core::progress::{Phase, ProgressSnapshot, SnapshotSource};
use callcoach_core::types::JobId;
use chrono::NaiveDateTime;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::MonitorConfig;

/// Timeout for the health check, independent of the request timeout.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Audio files plus the optional metadata attached to every call.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub files: Vec<PathBuf>,
    pub manager: Option<String>,
    /// ISO-8601 date or datetime of the call.
    pub call_date: Option<String>,
    /// Identifier of the call in an external telephony system.
    pub call_identifier: Option<String>,
}

/// One accepted upload, as returned by `POST /api/upload`.
#[derive(Debug, Clone, Deserialize)]
pub struct CallSummary {
    pub id: JobId,
    pub filename: String,
    pub manager: Option<String>,
    pub call_date: Option<String>,
    pub call_identifier: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    calls: Vec<CallSummary>,
}

/// Response of `POST /api/analyze/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisAccepted {
    pub call_id: JobId,
    pub status: String,
    pub progress: i64,
    pub message: Option<String>,
}

/// Response of `GET /api/analyze/{id}/status`.
#[derive(Debug, Clone, Deserialize)]
pub struct JobStatusReport {
    pub call_id: JobId,
    pub status: String,
    pub progress: i64,
}

impl JobStatusReport {
    pub fn phase(&self) -> Phase {
        Phase::from_status(&self.status)
    }

    pub fn into_snapshot(self) -> ProgressSnapshot {
        let phase = self.phase();
        ProgressSnapshot::new(self.call_id, self.progress, phase, SnapshotSource::Poll)
    }
}

/// One scoring of a call's transcription.
#[derive(Debug, Clone, Deserialize)]
pub struct Evaluation {
    pub id: i64,
    /// Per-criterion scores; the rubric is owned by the backend.
    pub scores: serde_json::Value,
    #[serde(rename = "итоговая_оценка")]
    pub total_score: Option<i64>,
    #[serde(rename = "нарушения", default)]
    pub violations: bool,
    #[serde(rename = "комментарии")]
    pub comments: Option<String>,
    #[serde(default)]
    pub is_retest: bool,
    pub created_at: Option<NaiveDateTime>,
}

/// Authoritative call record, as returned by `GET /api/calls/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct CallDetail {
    pub id: JobId,
    pub filename: String,
    pub manager: Option<String>,
    pub call_date: Option<NaiveDateTime>,
    pub call_identifier: Option<String>,
    pub transcription: Option<String>,
    /// Duration of the recording in seconds.
    pub duration: Option<f64>,
    pub created_at: NaiveDateTime,
    #[serde(default)]
    pub evaluations: Vec<Evaluation>,
}

impl CallDetail {
    /// The most recent evaluation. The backend lists newest first.
    pub fn latest_evaluation(&self) -> Option<&Evaluation> {
        self.evaluations.first()
    }
}

/// Response of `POST /api/analyze/{id}/retest`.
#[derive(Debug, Clone, Deserialize)]
pub struct RetestResult {
    pub call_id: JobId,
    pub evaluation: Evaluation,
}

/// Outcome of a health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
    pub reachable: bool,
    pub message: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend returned a non-2xx status code.
    #[error("Backend error ({status}): {detail}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// `detail` field of the error body, or the raw body.
        detail: String,
    },

    /// A local file could not be read for upload.
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ApiError {
    /// Whether the backend rejected the request as invalid (4xx).
    pub fn is_rejection(&self) -> bool {
        matches!(self, ApiError::Api { status, .. } if (400..500).contains(status))
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Submits analysis jobs.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    /// Upload audio; every accepted file becomes one job.
    async fn submit(&self, request: &UploadRequest) -> Result<Vec<CallSummary>, ApiError>;

    /// Start (or restart) analysis of an existing call.
    async fn start_analysis(&self, job_id: JobId) -> Result<AnalysisAccepted, ApiError>;
}

/// Read access to the authoritative job store.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn fetch_status(&self, job_id: JobId) -> Result<JobStatusReport, ApiError>;

    async fn fetch_record(&self, job_id: JobId) -> Result<CallDetail, ApiError>;
}

// ---------------------------------------------------------------------------
// CallCoachApi
// ---------------------------------------------------------------------------

/// HTTP client for the call analysis backend.
pub struct CallCoachApi {
    client: reqwest::Client,
    api_url: String,
}

impl CallCoachApi {
    /// Create a client for the backend described by `config`.
    pub fn new(config: &MonitorConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self::with_client(client, config.base_address.clone()))
    }

    /// Create a client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Upload audio files with optional metadata.
    ///
    /// Sends a multipart `POST /api/upload`. The backend starts analysis
    /// for each accepted file and returns one call record per file.
    pub async fn upload(&self, request: &UploadRequest) -> Result<Vec<CallSummary>, ApiError> {
        let mut form = reqwest::multipart::Form::new();

        for path in &request.files {
            let data = tokio::fs::read(path).await.map_err(|source| ApiError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let filename = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "recording".to_string());
            let part = reqwest::multipart::Part::bytes(data)
                .file_name(filename)
                .mime_str(audio_mime_type(path))?;
            form = form.part("files", part);
        }

        if let Some(manager) = &request.manager {
            form = form.text("manager", manager.clone());
        }
        if let Some(call_date) = &request.call_date {
            form = form.text("call_date", call_date.clone());
        }
        if let Some(call_identifier) = &request.call_identifier {
            form = form.text("call_identifier", call_identifier.clone());
        }

        let response = self
            .client
            .post(format!("{}/api/upload", self.api_url))
            .multipart(form)
            .send()
            .await?;

        let body: UploadResponse = Self::read_json(response).await?;
        tracing::info!(count = body.calls.len(), "Upload accepted");
        Ok(body.calls)
    }

    /// Start analysis of an existing call via `POST /api/analyze/{id}`.
    pub async fn start_analysis(&self, job_id: JobId) -> Result<AnalysisAccepted, ApiError> {
        let response = self
            .client
            .post(format!("{}/api/analyze/{job_id}", self.api_url))
            .send()
            .await?;

        Self::read_json(response).await
    }

    /// Current status of a job via `GET /api/analyze/{id}/status`.
    pub async fn analysis_status(&self, job_id: JobId) -> Result<JobStatusReport, ApiError> {
        let response = self
            .client
            .get(format!("{}/api/analyze/{job_id}/status", self.api_url))
            .send()
            .await?;

        Self::read_json(response).await
    }

    /// Full call record via `GET /api/calls/{id}`.
    pub async fn get_call(&self, job_id: JobId) -> Result<CallDetail, ApiError> {
        let response = self
            .client
            .get(format!("{}/api/calls/{job_id}", self.api_url))
            .send()
            .await?;

        Self::read_json(response).await
    }

    /// Re-score an analysed call via `POST /api/analyze/{id}/retest`.
    ///
    /// Runs synchronously on the backend and returns the new evaluation.
    pub async fn retest(&self, job_id: JobId) -> Result<RetestResult, ApiError> {
        let response = self
            .client
            .post(format!("{}/api/analyze/{job_id}/retest", self.api_url))
            .send()
            .await?;

        Self::read_json(response).await
    }

    /// Check `GET /health`. Never fails; unreachability is reported in
    /// the returned status.
    pub async fn health(&self) -> HealthStatus {
        let url = format!("{}/health", self.api_url);
        let result = self.client.get(&url).timeout(HEALTH_TIMEOUT).send().await;

        let (reachable, message) = match result {
            Ok(response) if response.status().is_success() => {
                (true, "Backend is reachable".to_string())
            }
            Ok(response) => (
                false,
                format!("Backend returned an error: {}", response.status().as_u16()),
            ),
            Err(e) if e.is_timeout() => (false, "Timed out connecting to the backend".to_string()),
            Err(e) if e.is_connect() => (false, "Could not connect to the backend".to_string()),
            Err(e) => (false, e.to_string()),
        };

        if !reachable {
            tracing::warn!(url = %url, message = %message, "Backend health check failed");
        }

        HealthStatus {
            reachable,
            message,
            url: self.api_url.clone(),
        }
    }

    // ---- private helpers ----

    /// Decode a JSON reply from the backend.
    ///
    /// Error replies carry `{"detail": "..."}`, which becomes the text of
    /// [`ApiError::Api`] so it can be shown to the user as-is.
    async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Api {
            status: status.as_u16(),
            detail: error_detail(&body),
        })
    }
}

#[async_trait]
impl JobSubmitter for CallCoachApi {
    async fn submit(&self, request: &UploadRequest) -> Result<Vec<CallSummary>, ApiError> {
        self.upload(request).await
    }

    async fn start_analysis(&self, job_id: JobId) -> Result<AnalysisAccepted, ApiError> {
        CallCoachApi::start_analysis(self, job_id).await
    }
}

#[async_trait]
impl JobStore for CallCoachApi {
    async fn fetch_status(&self, job_id: JobId) -> Result<JobStatusReport, ApiError> {
        self.analysis_status(job_id).await
    }

    async fn fetch_record(&self, job_id: JobId) -> Result<CallDetail, ApiError> {
        self.get_call(job_id).await
    }
}

/// The backend's error message: the `detail` field of a JSON error
/// body, otherwise the body text itself.
fn error_detail(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            detail: Some(detail),
        }) => detail,
        _ if body.trim().is_empty() => "<empty body>".to_string(),
        _ => body.to_string(),
    }
}

/// Content type for an audio upload, guessed from the file extension.
///
/// The backend only accepts `audio/*` parts.
fn audio_mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "wav" => "audio/wav",
        "ogg" | "oga" | "opus" => "audio/ogg",
        "m4a" | "mp4" | "aac" => "audio/mp4",
        "flac" => "audio/flac",
        "webm" => "audio/webm",
        _ => "audio/mpeg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_detail_prefers_detail_field() {
        assert_eq!(
            error_detail(r#"{"detail":"No audio files were accepted"}"#),
            "No audio files were accepted"
        );
        assert_eq!(error_detail("Internal Server Error"), "Internal Server Error");
        assert_eq!(error_detail(""), "<empty body>");
    }

    #[test]
    fn mime_type_from_extension() {
        assert_eq!(audio_mime_type(Path::new("call.WAV")), "audio/wav");
        assert_eq!(audio_mime_type(Path::new("call.m4a")), "audio/mp4");
        assert_eq!(audio_mime_type(Path::new("call.mp3")), "audio/mpeg");
        assert_eq!(audio_mime_type(Path::new("call")), "audio/mpeg");
    }

    #[test]
    fn rejection_is_4xx_only() {
        let bad_request = ApiError::Api {
            status: 400,
            detail: "bad".into(),
        };
        let server_error = ApiError::Api {
            status: 500,
            detail: "boom".into(),
        };
        assert!(bad_request.is_rejection());
        assert!(!server_error.is_rejection());
    }

    #[test]
    fn status_report_becomes_poll_snapshot() {
        let report: JobStatusReport =
            serde_json::from_str(r#"{"call_id":7,"status":"completed","progress":100}"#).unwrap();
        let snap = report.into_snapshot();
        assert_eq!(snap.job_id, 7);
        assert_eq!(snap.phase, Phase::Completed);
        assert_eq!(snap.source, SnapshotSource::Poll);
    }

    #[test]
    fn call_detail_parses_backend_record() {
        let json = r#"{
            "id": 42,
            "filename": "call.mp3",
            "manager": "Anna",
            "call_date": "2024-05-01T10:30:00",
            "call_identifier": null,
            "transcription": "Hello",
            "duration": 93.5,
            "created_at": "2024-05-01T10:31:12.123456",
            "evaluations": [
                {
                    "id": 2,
                    "scores": {"greeting": 5},
                    "итоговая_оценка": 87,
                    "нарушения": false,
                    "комментарии": "Good call",
                    "is_retest": true,
                    "created_at": "2024-05-02T09:00:00"
                }
            ]
        }"#;
        let detail: CallDetail = serde_json::from_str(json).unwrap();
        assert_eq!(detail.id, 42);
        assert_eq!(detail.duration, Some(93.5));
        let latest = detail.latest_evaluation().unwrap();
        assert_eq!(latest.total_score, Some(87));
        assert!(latest.is_retest);
        assert!(!latest.violations);
    }
}
