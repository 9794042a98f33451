//! `callcoach-watch` -- follow call analysis jobs from the terminal.
//!
//! Uploads recordings (or picks up existing jobs), prints one line per
//! lifecycle event while the backend works and a summary of each final
//! record. Ctrl-C stops monitoring cleanly.
//!
//! # Environment variables
//!
//! | Variable                    | Default                 | Description                          |
//! |-----------------------------|-------------------------|--------------------------------------|
//! | `CALLCOACH_API_URL`         | `http://localhost:8000` | Backend base URL (`--api-url` wins)  |
//! | `RECONNECT_MAX_ATTEMPTS`    | `5`                     | Push-channel reconnects per drop     |
//! | `RECONNECT_BASE_DELAY_MS`   | `1000`                  | Linear backoff step                  |
//! | `STATUS_POLL_INTERVAL_SECS` | `3`                     | Fallback polling interval            |
//! | `REQUEST_TIMEOUT_SECS`      | `30`                    | REST request timeout                 |
//! | `RUST_LOG`                  | see below               | Log filter (logs go to stderr)       |

use std::future::Future;
use std::process::ExitCode;

use anyhow::Context;
use callcoach_progress::api::CallCoachApi;
use callcoach_progress::config::MonitorConfig;
use callcoach_progress::driver::{JobLifecycleDriver, JobOutcome};
use callcoach_progress::events::JobEvent;
use callcoach_watch::cli::{Cli, Command};
use callcoach_watch::report;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "callcoach_watch=info,callcoach_progress=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let api_url = cli.api_url.clone();
    let config = MonitorConfig::from_lookup(|key| match (key, &api_url) {
        ("CALLCOACH_API_URL", Some(url)) => Some(url.clone()),
        _ => std::env::var(key).ok(),
    })
    .context("Invalid configuration")?;
    tracing::info!(
        api_url = %config.base_address,
        max_reconnect_attempts = config.max_reconnect_attempts,
        "Loaded monitoring configuration"
    );

    let json = cli.json;
    match &cli.command {
        Command::Health => {
            let api = CallCoachApi::new(&config)?;
            let health = api.health().await;
            println!("{}", report::format_health(&health));
            Ok(exit_code(health.reachable))
        }
        Command::Retest { job_id } => {
            let api = CallCoachApi::new(&config)?;
            let result = api
                .retest(*job_id)
                .await
                .with_context(|| format!("Retest of call {job_id} failed"))?;
            println!("{}", report::format_retest(&result));
            Ok(ExitCode::SUCCESS)
        }
        Command::Upload { .. } => {
            let request = cli
                .command
                .upload_request()
                .context("Upload arguments missing")?;
            let driver = JobLifecycleDriver::connect(config)?;
            let outcomes = follow(&driver, json, driver.submit_batch(&request))
                .await
                .context("Upload failed")?;
            Ok(finish(&outcomes, json))
        }
        Command::Watch { job_ids } => {
            let driver = JobLifecycleDriver::connect(config)?;
            let outcomes = follow(&driver, json, driver.monitor(job_ids)).await;
            Ok(finish(&outcomes, json))
        }
        Command::Analyze { job_id } => {
            let driver = JobLifecycleDriver::connect(config)?;
            let outcome = follow(&driver, json, driver.analyze(*job_id))
                .await
                .with_context(|| format!("Could not start analysis of call {job_id}"))?;
            Ok(finish(&[outcome], json))
        }
    }
}

/// Run `work` while printing the driver's events. Ctrl-C shuts the
/// driver down, which resolves pending jobs as cancelled.
async fn follow<T>(driver: &JobLifecycleDriver, json: bool, work: impl Future<Output = T>) -> T {
    let mut events = driver.subscribe();
    tokio::pin!(work);

    let mut events_open = true;
    let mut interrupted = false;
    let result = loop {
        tokio::select! {
            result = &mut work => break result,
            event = events.recv(), if events_open => match event {
                Ok(event) => print_event(&event, json),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event output fell behind");
                }
                Err(RecvError::Closed) => events_open = false,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                tracing::warn!("Interrupted, stopping job monitoring");
                driver.shutdown();
            }
        }
    };

    while let Ok(event) = events.try_recv() {
        print_event(&event, json);
    }
    result
}

fn print_event(event: &JobEvent, json: bool) {
    if json {
        println!("{}", report::event_json(event));
    } else {
        println!("{}", report::format_event(event));
    }
}

fn finish(outcomes: &[JobOutcome], json: bool) -> ExitCode {
    for outcome in outcomes {
        if json {
            println!("{}", report::outcome_json(outcome));
        } else {
            println!("{}", report::format_outcome(outcome));
        }
    }
    exit_code(report::all_succeeded(outcomes))
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
