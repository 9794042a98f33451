//! Shared fakes for the progress integration tests.
//!
//! [`FakeConnector`] plays the backend's push endpoint from per-job
//! scripts, [`FakeStore`] plays the status/record endpoints and
//! [`FakeSubmitter`] plays the upload endpoint. All of them count calls so
//! tests can assert on connection and polling behaviour.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use callcoach_core::types::JobId;
use callcoach_progress::api::{
    AnalysisAccepted, ApiError, CallDetail, CallSummary, JobStatusReport, JobStore,
    JobSubmitter, UploadRequest,
};
use callcoach_progress::channel::ChannelEvent;
use callcoach_progress::client::{Frame, FrameStream, ProgressClientError, ProgressConnector};
use callcoach_progress::config::MonitorConfig;
use futures::StreamExt;
use tokio::sync::mpsc;

type FrameResult = Result<Frame, ProgressClientError>;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A push-channel progress frame.
pub fn progress(job_id: JobId, percent: i64, status: &str) -> Frame {
    Frame::Text(format!(
        r#"{{"call_id":{job_id},"progress":{percent},"status":"{status}"}}"#
    ))
}

/// A push-channel progress frame carrying a message.
pub fn progress_with_message(job_id: JobId, percent: i64, status: &str, message: &str) -> Frame {
    Frame::Text(format!(
        r#"{{"call_id":{job_id},"progress":{percent},"status":"{status}","message":"{message}"}}"#
    ))
}

/// Config with the default 5 reconnects, 1 s base delay and 3 s polling.
pub fn test_config() -> MonitorConfig {
    MonitorConfig::new("http://backend.test")
}

// ---------------------------------------------------------------------------
// FakeConnector
// ---------------------------------------------------------------------------

/// What the fake endpoint does for one connection attempt.
pub enum Session {
    /// The connection attempt fails.
    Refuse,
    /// The connection attempt never completes.
    Stall,
    /// Connects, yields these frames, then stays open.
    Frames(Vec<Frame>),
    /// Connects, yields these frames, then drops the connection.
    FramesThenDrop(Vec<Frame>),
    /// Connects and forwards whatever the test pushes.
    Feed,
}

/// Decrements the live-connection counter when a stream is dropped.
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(live)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scripted push endpoint. Jobs without a remaining script get a
/// [`Session::Feed`].
#[derive(Default)]
pub struct FakeConnector {
    scripts: Mutex<HashMap<JobId, VecDeque<Session>>>,
    connects: Mutex<HashMap<JobId, u32>>,
    feeds: Mutex<HashMap<JobId, mpsc::UnboundedSender<FrameResult>>>,
    live: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue sessions for the next connection attempts of `job_id`.
    pub fn script(&self, job_id: JobId, sessions: impl IntoIterator<Item = Session>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(job_id)
            .or_default()
            .extend(sessions);
    }

    /// Connection attempts made for `job_id`, successful or not.
    pub fn connects(&self, job_id: JobId) -> u32 {
        self.connects.lock().unwrap().get(&job_id).copied().unwrap_or(0)
    }

    /// Streams handed out and not yet dropped.
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Push a frame on the current [`Session::Feed`] of `job_id`.
    ///
    /// Returns `false` if there is no live feed to push to.
    pub fn push(&self, job_id: JobId, frame: Frame) -> bool {
        self.feeds
            .lock()
            .unwrap()
            .get(&job_id)
            .is_some_and(|feed| feed.send(Ok(frame)).is_ok())
    }

    /// Break the current feed of `job_id` with a transport error.
    pub fn break_feed(&self, job_id: JobId) -> bool {
        self.feeds
            .lock()
            .unwrap()
            .remove(&job_id)
            .is_some_and(|feed| {
                feed.send(Err(ProgressClientError::Protocol("connection reset".into())))
                    .is_ok()
            })
    }

    fn guarded(&self, stream: FrameStream) -> FrameStream {
        let guard = LiveGuard::new(Arc::clone(&self.live));
        stream
            .map(move |item| {
                let _guard = &guard;
                item
            })
            .boxed()
    }
}

#[async_trait]
impl ProgressConnector for FakeConnector {
    async fn connect(&self, job_id: JobId) -> Result<FrameStream, ProgressClientError> {
        *self.connects.lock().unwrap().entry(job_id).or_default() += 1;
        let session = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&job_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Session::Feed);

        let stream: FrameStream = match session {
            Session::Refuse => {
                return Err(ProgressClientError::Connection("connection refused".into()))
            }
            Session::Stall => std::future::pending().await,
            Session::Frames(frames) => futures::stream::iter(frames.into_iter().map(Ok))
                .chain(futures::stream::pending())
                .boxed(),
            Session::FramesThenDrop(frames) => futures::stream::iter(frames.into_iter().map(Ok))
                .chain(futures::stream::once(async {
                    Err(ProgressClientError::Protocol("connection reset".into()))
                }))
                .boxed(),
            Session::Feed => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.feeds.lock().unwrap().insert(job_id, tx);
                futures::stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                })
                .boxed()
            }
        };

        Ok(self.guarded(stream))
    }
}

// ---------------------------------------------------------------------------
// FakeStore
// ---------------------------------------------------------------------------

/// Status and record endpoints. Scripted statuses are served in order;
/// the last one repeats. Unscripted jobs report `processing` at 0%.
#[derive(Default)]
pub struct FakeStore {
    statuses: Mutex<HashMap<JobId, VecDeque<Result<(String, i64), u16>>>>,
    status_calls: Mutex<HashMap<JobId, u32>>,
    answered_status_calls: Mutex<HashMap<JobId, u32>>,
    status_latency: Mutex<Option<Duration>>,
    missing_records: Mutex<Vec<JobId>>,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_status(&self, job_id: JobId, status: &str, progress: i64) {
        self.statuses
            .lock()
            .unwrap()
            .entry(job_id)
            .or_default()
            .push_back(Ok((status.to_string(), progress)));
    }

    /// Make the next status request for `job_id` fail with `status`.
    pub fn script_status_error(&self, job_id: JobId, status: u16) {
        self.statuses
            .lock()
            .unwrap()
            .entry(job_id)
            .or_default()
            .push_back(Err(status));
    }

    /// Make record lookups for `job_id` fail with 404.
    pub fn remove_record(&self, job_id: JobId) {
        self.missing_records.lock().unwrap().push(job_id);
    }

    /// Delay every status response by `latency`.
    pub fn slow_status(&self, latency: Duration) {
        *self.status_latency.lock().unwrap() = Some(latency);
    }

    /// Status requests that ran to completion and produced a response.
    pub fn answered_status_calls(&self, job_id: JobId) -> u32 {
        self.answered_status_calls
            .lock()
            .unwrap()
            .get(&job_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn status_calls(&self, job_id: JobId) -> u32 {
        self.status_calls
            .lock()
            .unwrap()
            .get(&job_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl JobStore for FakeStore {
    async fn fetch_status(&self, job_id: JobId) -> Result<JobStatusReport, ApiError> {
        *self.status_calls.lock().unwrap().entry(job_id).or_default() += 1;

        let latency = *self.status_latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        *self
            .answered_status_calls
            .lock()
            .unwrap()
            .entry(job_id)
            .or_default() += 1;

        let mut statuses = self.statuses.lock().unwrap();
        let queue = statuses.entry(job_id).or_default();
        let next = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };

        match next.unwrap_or_else(|| Ok(("processing".to_string(), 0))) {
            Ok((status, progress)) => Ok(JobStatusReport {
                call_id: job_id,
                status,
                progress,
            }),
            Err(status) => Err(ApiError::Api {
                status,
                detail: "status unavailable".into(),
            }),
        }
    }

    async fn fetch_record(&self, job_id: JobId) -> Result<CallDetail, ApiError> {
        if self.missing_records.lock().unwrap().contains(&job_id) {
            return Err(ApiError::Api {
                status: 404,
                detail: "Call not found".into(),
            });
        }
        Ok(call_detail(job_id))
    }
}

/// A call record as the backend would return it after analysis.
pub fn call_detail(job_id: JobId) -> CallDetail {
    serde_json::from_value(serde_json::json!({
        "id": job_id,
        "filename": format!("call-{job_id}.mp3"),
        "manager": null,
        "call_date": null,
        "call_identifier": null,
        "transcription": "Добрый день",
        "duration": 61.0,
        "created_at": "2024-05-01T10:00:00",
        "evaluations": []
    }))
    .unwrap()
}

// ---------------------------------------------------------------------------
// FakeSubmitter
// ---------------------------------------------------------------------------

/// Upload endpoint that accepts a fixed list of job ids, or rejects.
pub struct FakeSubmitter {
    accepted: Vec<JobId>,
    reject_with: Option<(u16, String)>,
    analysis_starts: Mutex<Vec<JobId>>,
}

impl FakeSubmitter {
    pub fn accepting(accepted: &[JobId]) -> Arc<Self> {
        Arc::new(Self {
            accepted: accepted.to_vec(),
            reject_with: None,
            analysis_starts: Mutex::new(Vec::new()),
        })
    }

    pub fn rejecting(status: u16, detail: &str) -> Arc<Self> {
        Arc::new(Self {
            accepted: Vec::new(),
            reject_with: Some((status, detail.to_string())),
            analysis_starts: Mutex::new(Vec::new()),
        })
    }

    pub fn analysis_starts(&self) -> Vec<JobId> {
        self.analysis_starts.lock().unwrap().clone()
    }

    fn rejection(&self) -> Option<ApiError> {
        self.reject_with.as_ref().map(|(status, detail)| ApiError::Api {
            status: *status,
            detail: detail.clone(),
        })
    }
}

#[async_trait]
impl JobSubmitter for FakeSubmitter {
    async fn submit(&self, _request: &UploadRequest) -> Result<Vec<CallSummary>, ApiError> {
        if let Some(error) = self.rejection() {
            return Err(error);
        }
        Ok(self
            .accepted
            .iter()
            .map(|&id| CallSummary {
                id,
                filename: format!("call-{id}.mp3"),
                manager: None,
                call_date: None,
                call_identifier: None,
            })
            .collect())
    }

    async fn start_analysis(&self, job_id: JobId) -> Result<AnalysisAccepted, ApiError> {
        if let Some(error) = self.rejection() {
            return Err(error);
        }
        self.analysis_starts.lock().unwrap().push(job_id);
        Ok(AnalysisAccepted {
            call_id: job_id,
            status: "processing".into(),
            progress: 0,
            message: Some("Analysis started".into()),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Records every event a channel hands to its callback.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<ChannelEvent>>>);

impl EventLog {
    pub fn callback(&self) -> impl Fn(ChannelEvent) + Send + Sync + 'static {
        let events = Arc::clone(&self.0);
        move |event| events.lock().unwrap().push(event)
    }

    pub fn events(&self) -> Vec<ChannelEvent> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

/// Wait (in paused test time) until `condition` holds.
pub async fn until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

/// Let spawned tasks run without advancing time past pending timers.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
