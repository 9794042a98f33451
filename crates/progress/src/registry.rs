//! Registry of live progress channels keyed by job.
//!
//! [`ChannelRegistry`] is the single owner of the job -> channel mapping.
//! It guarantees at most one live channel per job: subscribing to a job
//! that already has a live channel returns that channel instead of
//! opening a second connection. A channel that closes on its own removes
//! itself from the mapping before it hands out its final event.
//!
//! The mapping is behind a mutex and is never held across an await or
//! while user callbacks run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use callcoach_core::types::JobId;

use crate::channel::{ChannelEvent, CloseHook, ProgressChannel};
use crate::client::{ProgressConnector, WsConnector};
use crate::config::MonitorConfig;

type ChannelMap = HashMap<JobId, Subscription>;

/// One registry entry.
struct Subscription {
    channel: ProgressChannel,
    /// Distinguishes successive channels for the same job, so a stale
    /// channel's close hook never evicts its replacement.
    generation: u64,
}

/// Owns every live progress channel of one consumer context.
///
/// Dropping the registry closes all of its channels.
pub struct ChannelRegistry {
    config: MonitorConfig,
    connector: Arc<dyn ProgressConnector>,
    channels: Arc<Mutex<ChannelMap>>,
    next_generation: AtomicU64,
}

fn lock(channels: &Mutex<ChannelMap>) -> MutexGuard<'_, ChannelMap> {
    channels.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChannelRegistry {
    /// Create a registry that opens channels through `connector`.
    pub fn new(config: MonitorConfig, connector: Arc<dyn ProgressConnector>) -> Self {
        Self {
            config,
            connector,
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Create a registry backed by the backend's WebSocket endpoint.
    pub fn with_websocket(config: MonitorConfig) -> Self {
        let connector = Arc::new(WsConnector::new(&config));
        Self::new(config, connector)
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Subscribe to progress for `job_id`.
    ///
    /// If a live channel already exists for the job it is returned as-is
    /// and `callback` is discarded. Otherwise a new channel is opened with
    /// `callback` as its delivery callback.
    pub fn subscribe<F>(&self, job_id: JobId, callback: F) -> ProgressChannel
    where
        F: Fn(ChannelEvent) + Send + Sync + 'static,
    {
        let mut channels = lock(&self.channels);

        if let Some(existing) = channels.get(&job_id) {
            if !existing.channel.is_closed() {
                tracing::debug!(job_id, "Reusing existing progress subscription");
                return existing.channel.clone();
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(&self.channels);
        let hook: CloseHook = Box::new(move || {
            if let Some(channels) = weak.upgrade() {
                let mut channels = lock(&channels);
                if channels
                    .get(&job_id)
                    .is_some_and(|sub| sub.generation == generation)
                {
                    channels.remove(&job_id);
                    tracing::debug!(job_id, "Closed channel removed from registry");
                }
            }
        });

        let channel = ProgressChannel::open_with_hook(
            job_id,
            Arc::clone(&self.connector),
            self.config.reconnect_policy(),
            Arc::new(callback),
            Some(hook),
        );

        channels.insert(
            job_id,
            Subscription {
                channel: channel.clone(),
                generation,
            },
        );
        tracing::info!(job_id, active = channels.len(), "Subscribed to job progress");

        channel
    }

    /// Close and forget the channel for `job_id`.
    ///
    /// Returns `false` if there was nothing to remove.
    pub fn unsubscribe(&self, job_id: JobId) -> bool {
        let removed = lock(&self.channels).remove(&job_id);
        match removed {
            Some(sub) => {
                sub.channel.close();
                tracing::info!(job_id, "Unsubscribed from job progress");
                true
            }
            None => false,
        }
    }

    /// Close every tracked channel. Returns how many were closed.
    pub fn unsubscribe_all(&self) -> usize {
        let drained: Vec<Subscription> = lock(&self.channels).drain().map(|(_, sub)| sub).collect();
        let count = drained.len();
        for sub in drained {
            sub.channel.close();
        }
        if count > 0 {
            tracing::info!(count, "Closed all progress subscriptions");
        }
        count
    }

    /// The live channel for `job_id`, if any.
    pub fn get(&self, job_id: JobId) -> Option<ProgressChannel> {
        lock(&self.channels).get(&job_id).map(|sub| sub.channel.clone())
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        lock(&self.channels).contains_key(&job_id)
    }

    /// Number of open or connecting channels.
    pub fn len(&self) -> usize {
        lock(&self.channels).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = lock(&self.channels).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Whether `channel` is the registry's current channel for its job.
    pub fn is_current(&self, channel: &ProgressChannel) -> bool {
        lock(&self.channels)
            .get(&channel.job_id())
            .is_some_and(|sub| sub.channel.ptr_eq(channel))
    }
}

impl Drop for ChannelRegistry {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}
