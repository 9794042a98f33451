//! Shared domain types for the call analysis progress subsystem.
//!
//! Kept free of I/O so that both the monitoring library and the
//! command-line front end can depend on it.

pub mod error;
pub mod progress;
pub mod types;
