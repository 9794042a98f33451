//! Real-time progress monitoring for call analysis jobs.
//!
//! Provides per-job WebSocket progress channels with linear-backoff
//! reconnection, a registry enforcing one channel per job, a progress
//! aggregator with a status-polling fallback, the REST client for the
//! analysis backend and a driver that takes jobs from submission to a
//! terminal outcome.

pub mod aggregator;
pub mod api;
pub mod channel;
pub mod client;
pub mod config;
pub mod driver;
pub mod events;
pub mod messages;
pub mod reconnect;
pub mod registry;
