//! A single job's progress subscription.
//!
//! [`ProgressChannel`] owns one push channel for one job. It runs as a
//! spawned task that connects, decodes frames, reconnects with linear
//! backoff after non-clean disconnects and closes itself on the first
//! terminal snapshot. All state changes go through one transition
//! function; callers only observe the state.
//!
//! Delivery goes to a single callback. The final event of a channel
//! (terminal snapshot or abandon notice) consumes the callback, so a
//! terminal event is delivered at most once and nothing follows it.
//! Deliveries and the move to Closed are serialized by a gate, so once
//! [`ProgressChannel::close`] returns no delivery is running or pending.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use callcoach_core::progress::ProgressSnapshot;
use callcoach_core::types::JobId;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{Frame, FrameStream, ProgressConnector};
use crate::messages::parse_message;
use crate::reconnect::ReconnectPolicy;

/// Delivery callback registered on a channel.
pub type SnapshotCallback = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// Runs once when the channel reaches [`ChannelState::Closed`].
pub(crate) type CloseHook = Box<dyn FnOnce() + Send>;

// ---------------------------------------------------------------------------
// ChannelState
// ---------------------------------------------------------------------------

/// Connection state of a [`ProgressChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

impl ChannelState {
    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Closed is final.
    pub fn can_transition_to(self, next: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Closed)
                | (Connecting, Open)
                | (Connecting, Reconnecting)
                | (Connecting, Closed)
                | (Open, Reconnecting)
                | (Open, Closed)
                | (Reconnecting, Connecting)
                | (Reconnecting, Closed)
        )
    }
}

// ---------------------------------------------------------------------------
// ChannelEvent
// ---------------------------------------------------------------------------

/// What a channel hands to its callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A progress snapshot reported by the backend.
    Snapshot(ProgressSnapshot),

    /// The channel gave up. This is a local notice about the transport,
    /// not a backend-reported failure; the job itself may still succeed.
    Abandoned {
        job_id: JobId,
        /// Reconnects made since the channel was last open.
        attempts: u32,
        reason: AbandonReason,
    },
}

/// Why a channel stopped listening before a terminal snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonReason {
    /// The backend closed the channel normally.
    ClosedByServer,
    /// Every reconnect attempt failed.
    ReconnectsExhausted,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct ChannelShared {
    job_id: JobId,
    state: watch::Sender<ChannelState>,
    callback: Mutex<Option<SnapshotCallback>>,
    /// Held while a delivery runs and while the channel moves to Closed.
    delivery: Mutex<()>,
    on_closed: Mutex<Option<CloseHook>>,
    cancel: CancellationToken,
    abandoned: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

thread_local! {
    /// Address of the channel whose callback is running on this thread.
    static DELIVERING: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as inside a channel's callback, so that the
/// callback can close its own channel without waiting on the gate it
/// is running under.
struct DeliveryScope {
    previous: usize,
}

impl DeliveryScope {
    fn enter(shared: &ChannelShared) -> Self {
        let previous = DELIVERING.with(|current| current.replace(shared.addr()));
        Self { previous }
    }

    fn is_active(shared: &ChannelShared) -> bool {
        DELIVERING.with(|current| current.get() == shared.addr())
    }
}

impl Drop for DeliveryScope {
    fn drop(&mut self) {
        DELIVERING.with(|current| current.set(self.previous));
    }
}

impl ChannelShared {
    /// The only place the channel state is mutated.
    ///
    /// Returns `false` if the move is not allowed from the current state,
    /// which in practice means the channel is already closed.
    fn transition(&self, next: ChannelState) -> bool {
        let job_id = self.job_id;
        let mut moved = false;
        self.state.send_if_modified(|current| {
            if !current.can_transition_to(next) {
                return false;
            }
            tracing::debug!(job_id, from = ?current, to = ?next, "Channel state transition");
            *current = next;
            moved = true;
            true
        });
        moved
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    fn deliver(&self, event: ChannelEvent) {
        let _gate = lock(&self.delivery);
        if *self.state.borrow() == ChannelState::Closed {
            return;
        }
        // Never call user code while holding the slot.
        let callback = lock(&self.callback).clone();
        if let Some(callback) = callback {
            let _scope = DeliveryScope::enter(self);
            callback(event);
        }
    }

    /// Close the channel. Runs the close hook before handing `final_event`
    /// to the callback, so a consumer reacting to it can already open a
    /// fresh subscription for the same job.
    ///
    /// Returns `false` if the channel was already closed.
    fn finish(&self, final_event: Option<ChannelEvent>) -> bool {
        let _gate = (!DeliveryScope::is_active(self)).then(|| lock(&self.delivery));
        if !self.transition(ChannelState::Closed) {
            return false;
        }
        self.cancel.cancel();

        let hook = lock(&self.on_closed).take();
        if let Some(hook) = hook {
            hook();
        }

        let callback = lock(&self.callback).take();
        if let (Some(callback), Some(event)) = (callback, final_event) {
            let _scope = DeliveryScope::enter(self);
            callback(event);
        }
        true
    }

    fn abandon(&self, attempts: u32, reason: AbandonReason) {
        self.abandoned.store(true, Ordering::SeqCst);
        self.finish(Some(ChannelEvent::Abandoned {
            job_id: self.job_id,
            attempts,
            reason,
        }));
    }
}

// ---------------------------------------------------------------------------
// ProgressChannel
// ---------------------------------------------------------------------------

/// Handle to one job's progress subscription.
///
/// Cloning the handle does not open another connection; all clones refer
/// to the same channel.
#[derive(Clone)]
pub struct ProgressChannel {
    shared: Arc<ChannelShared>,
}

impl ProgressChannel {
    /// Open a push channel for `job_id`.
    ///
    /// The channel starts Idle, moves to Connecting and spawns its
    /// connection task. Must be called within a Tokio runtime.
    pub fn open<F>(
        job_id: JobId,
        connector: Arc<dyn ProgressConnector>,
        policy: ReconnectPolicy,
        callback: F,
    ) -> Self
    where
        F: Fn(ChannelEvent) + Send + Sync + 'static,
    {
        Self::open_with_hook(job_id, connector, policy, Arc::new(callback), None)
    }

    pub(crate) fn open_with_hook(
        job_id: JobId,
        connector: Arc<dyn ProgressConnector>,
        policy: ReconnectPolicy,
        callback: SnapshotCallback,
        on_closed: Option<CloseHook>,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Idle);
        let shared = Arc::new(ChannelShared {
            job_id,
            state,
            callback: Mutex::new(Some(callback)),
            delivery: Mutex::new(()),
            on_closed: Mutex::new(on_closed),
            cancel: CancellationToken::new(),
            abandoned: AtomicBool::new(false),
            task: Mutex::new(None),
        });

        shared.transition(ChannelState::Connecting);
        tracing::info!(
            job_id,
            max_attempts = policy.max_attempts(),
            "Opening progress channel"
        );

        let task = tokio::spawn(run_channel(Arc::clone(&shared), connector, policy));
        *lock(&shared.task) = Some(task);

        Self { shared }
    }

    pub fn job_id(&self) -> JobId {
        self.shared.job_id
    }

    /// Replace the delivery callback. Only one callback is ever active.
    ///
    /// Ignored once the channel is closed.
    pub fn on_snapshot<F>(&self, callback: F)
    where
        F: Fn(ChannelEvent) + Send + Sync + 'static,
    {
        let mut slot = lock(&self.shared.callback);
        if self.state() != ChannelState::Closed {
            *slot = Some(Arc::new(callback));
        }
    }

    /// Close the channel from any state.
    ///
    /// Idempotent. If a delivery is running on another thread this waits
    /// for it to return; once `close` returns no further event is handed
    /// to the callback. May be called from the channel's own callback.
    /// Any pending reconnect timer or connection attempt is cancelled and
    /// the connection task is aborted.
    pub fn close(&self) {
        if self.shared.finish(None) {
            tracing::info!(job_id = self.shared.job_id, "Progress channel closed");
        }
        if let Some(task) = lock(&self.shared.task).as_ref() {
            task.abort();
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    /// True only while the push channel is connected.
    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Whether the channel gave up after exhausting its reconnects (or
    /// after the backend closed it before a terminal snapshot).
    pub fn is_abandoned(&self) -> bool {
        self.shared.abandoned.load(Ordering::SeqCst)
    }

    /// Observe state changes, e.g. to react to every (re)open.
    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// Wait until the channel reaches [`ChannelState::Closed`].
    pub async fn closed(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|state| *state == ChannelState::Closed).await;
    }

    /// Wait until the connection task has exited, releasing its socket
    /// and timers.
    pub async fn join(&self) {
        let task = lock(&self.shared.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub(crate) fn ptr_eq(&self, other: &ProgressChannel) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for ProgressChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressChannel")
            .field("job_id", &self.shared.job_id)
            .field("state", &self.state())
            .field("abandoned", &self.is_abandoned())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

/// Why frame processing for one connection stopped.
enum PumpExit {
    Terminal(ProgressSnapshot),
    ClosedCleanly,
    Dropped(String),
    Cancelled,
}

/// Connect -> pump frames -> back off -> reconnect, until a terminal
/// snapshot, cancellation or exhaustion.
async fn run_channel(
    shared: Arc<ChannelShared>,
    connector: Arc<dyn ProgressConnector>,
    mut policy: ReconnectPolicy,
) {
    let job_id = shared.job_id;

    loop {
        let connected = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return,
            result = connector.connect(job_id) => result,
        };

        match connected {
            Ok(stream) => {
                if !shared.transition(ChannelState::Open) {
                    return;
                }
                policy.reset();
                tracing::info!(job_id, "Progress channel open");

                match pump_frames(&shared, stream).await {
                    PumpExit::Terminal(snapshot) => {
                        tracing::info!(
                            job_id,
                            phase = %snapshot.phase,
                            percent = snapshot.percent,
                            "Terminal snapshot received, closing channel",
                        );
                        shared.finish(Some(ChannelEvent::Snapshot(snapshot)));
                        return;
                    }
                    PumpExit::Cancelled => return,
                    PumpExit::ClosedCleanly => {
                        tracing::warn!(
                            job_id,
                            "Backend closed progress channel before a terminal status",
                        );
                        shared.abandon(policy.attempt(), AbandonReason::ClosedByServer);
                        return;
                    }
                    PumpExit::Dropped(reason) => {
                        tracing::warn!(job_id, reason = %reason, "Progress channel dropped");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    job_id,
                    attempt = policy.attempt(),
                    error = %e,
                    "Progress channel connection attempt failed",
                );
            }
        }

        let Some(delay) = policy.next_delay() else {
            tracing::error!(
                job_id,
                attempts = policy.attempt(),
                "Reconnect attempts exhausted, abandoning progress channel",
            );
            shared.abandon(policy.attempt(), AbandonReason::ReconnectsExhausted);
            return;
        };

        if !shared.transition(ChannelState::Reconnecting) {
            return;
        }
        tracing::info!(
            job_id,
            attempt = policy.attempt(),
            max_attempts = policy.max_attempts(),
            delay_ms = delay.as_millis() as u64,
            "Reconnecting progress channel",
        );

        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        if !shared.transition(ChannelState::Connecting) {
            return;
        }
    }
}

/// Read frames until the connection ends or a terminal snapshot arrives.
///
/// Non-terminal snapshots are delivered in arrival order. Malformed
/// payloads are dropped without touching the connection.
async fn pump_frames(shared: &ChannelShared, mut stream: FrameStream) -> PumpExit {
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return PumpExit::Cancelled,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Frame::Text(text))) => {
                if let Some(snapshot) = decode_frame(shared.job_id, &text) {
                    if snapshot.is_terminal() {
                        return PumpExit::Terminal(snapshot);
                    }
                    shared.deliver(ChannelEvent::Snapshot(snapshot));
                }
            }
            Some(Ok(Frame::Close { clean: true })) => return PumpExit::ClosedCleanly,
            Some(Ok(Frame::Close { clean: false })) => {
                return PumpExit::Dropped("peer closed the channel abnormally".into())
            }
            Some(Err(e)) => return PumpExit::Dropped(e.to_string()),
            None => return PumpExit::Dropped("stream ended without a close frame".into()),
        }
    }
}

fn decode_frame(job_id: JobId, text: &str) -> Option<ProgressSnapshot> {
    match parse_message(text) {
        Ok(msg) if msg.call_id != job_id => {
            tracing::warn!(
                job_id,
                call_id = msg.call_id,
                "Dropping progress message addressed to another job",
            );
            None
        }
        Ok(msg) => {
            tracing::debug!(
                job_id,
                progress = msg.progress,
                status = %msg.status,
                "Progress message",
            );
            Some(msg.into_snapshot())
        }
        Err(e) => {
            tracing::warn!(
                job_id,
                error = %e,
                raw_message = %text,
                "Failed to parse progress message",
            );
            None
        }
    }
}
