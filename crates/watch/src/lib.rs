//! Command-line front end for call analysis progress.
//!
//! Argument parsing lives in [`cli`]; rendering of lifecycle events,
//! outcomes and records lives in [`report`]. The binary wires both to a
//! [`callcoach_progress::driver::JobLifecycleDriver`].

pub mod cli;
pub mod report;
