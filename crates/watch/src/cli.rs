use std::path::PathBuf;

use callcoach_core::error::parse_job_id;
use callcoach_core::types::JobId;
use callcoach_progress::api::UploadRequest;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "callcoach-watch",
    version,
    about = "Submit call recordings for analysis and follow their progress live"
)]
pub struct Cli {
    /// Base URL of the analysis backend (overrides CALLCOACH_API_URL)
    #[arg(long, global = true)]
    pub api_url: Option<String>,

    /// Print lifecycle events and outcomes as JSON lines
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Upload audio files and follow their analysis to completion
    Upload {
        /// Audio files to analyse
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Manager who handled the calls
        #[arg(long)]
        manager: Option<String>,

        /// Date of the calls (ISO-8601 date or datetime)
        #[arg(long)]
        call_date: Option<String>,

        /// Identifier of the call in the telephony system
        #[arg(long = "call-id")]
        call_identifier: Option<String>,
    },

    /// Follow jobs that are already running
    Watch {
        #[arg(required = true, value_parser = parse_job_id)]
        job_ids: Vec<JobId>,
    },

    /// Start (or restart) analysis of an uploaded call and follow it
    Analyze {
        #[arg(value_parser = parse_job_id)]
        job_id: JobId,
    },

    /// Re-score an analysed call with the current rubric
    Retest {
        #[arg(value_parser = parse_job_id)]
        job_id: JobId,
    },

    /// Check that the backend is reachable
    Health,
}

impl Command {
    /// The upload request for [`Command::Upload`].
    pub fn upload_request(&self) -> Option<UploadRequest> {
        match self {
            Command::Upload {
                files,
                manager,
                call_date,
                call_identifier,
            } => Some(UploadRequest {
                files: files.clone(),
                manager: manager.clone(),
                call_date: call_date.clone(),
                call_identifier: call_identifier.clone(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_upload_with_metadata() {
        let cli = Cli::parse_from([
            "callcoach-watch",
            "upload",
            "a.mp3",
            "b.wav",
            "--manager",
            "Anna",
            "--call-id",
            "T-100",
        ]);
        let request = cli.command.upload_request().unwrap();
        assert_eq!(request.files.len(), 2);
        assert_eq!(request.manager.as_deref(), Some("Anna"));
        assert_eq!(request.call_identifier.as_deref(), Some("T-100"));
        assert!(request.call_date.is_none());
    }

    #[test]
    fn upload_requires_files() {
        assert!(Cli::try_parse_from(["callcoach-watch", "upload"]).is_err());
    }

    #[test]
    fn watch_takes_many_ids() {
        let cli = Cli::parse_from(["callcoach-watch", "watch", "1", "2", "42"]);
        match cli.command {
            Command::Watch { job_ids } => assert_eq!(job_ids, vec![1, 2, 42]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "callcoach-watch",
            "analyze",
            "7",
            "--api-url",
            "http://backend:8000",
            "--json",
        ]);
        assert!(cli.json);
        assert_eq!(cli.api_url.as_deref(), Some("http://backend:8000"));
        assert!(cli.command.upload_request().is_none());
    }

    #[test]
    fn rejects_invalid_job_ids() {
        assert!(Cli::try_parse_from(["callcoach-watch", "retest", "abc"]).is_err());
        assert!(Cli::try_parse_from(["callcoach-watch", "analyze", "0"]).is_err());
    }
}
