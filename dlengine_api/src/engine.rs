use crate::error::DownloadError;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, time::Duration};

/// Option key selecting the number of concurrent range connections.
pub const OPTION_CONNECTIONS: &str = "connections";
/// Option key selecting the destination folder.
pub const OPTION_DIRECTORY: &str = "directory";

/// A request to fetch one resource. Immutable once submitted.
/// Unrecognized option keys are ignored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            options: HashMap::new(),
        }
    }

    pub fn with_option(mut self, key: &str, value: impl Into<String>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Http,
    Torrent,
}

/// Terminal state of a transfer. Exactly one outcome is recorded, the first
/// one reached; a transfer never leaves its terminal state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed(DownloadError),
    Cancelled,
}

/// Read-only snapshot of one transfer, handed to listeners and returned by
/// status queries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferInfo {
    pub gid: String,
    pub kind: TransferKind,
    /// Display name of the downloaded content.
    pub name: String,
    /// Destination file path, known once resolved (for torrents only after
    /// metadata arrived).
    pub dl_path: Option<PathBuf>,
    pub directory: PathBuf,
    pub content_type: String,
    pub total_bytes: u64,
    pub completed_bytes: u64,
    /// Current throughput in bytes per second.
    pub speed: u64,
    /// Estimated remaining time, human-rounded.
    pub eta: Duration,
    /// True for a torrent transfer that is still waiting for metadata.
    pub awaiting_metadata: bool,
    pub outcome: Option<Outcome>,
}

impl TransferInfo {
    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.outcome, Some(Outcome::Completed))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, Some(Outcome::Failed(_)))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome, Some(Outcome::Cancelled))
    }

    /// Recorded error, if the transfer failed or was cancelled.
    pub fn error(&self) -> Option<DownloadError> {
        match &self.outcome {
            Some(Outcome::Failed(err)) => Some(err.clone()),
            Some(Outcome::Cancelled) => Some(DownloadError::Cancelled),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Start,
    Progress,
    Complete,
    Stop,
}

/// Lifecycle observer. Callbacks are invoked synchronously on the task that
/// currently drives the transfer, in listener registration order; a slow
/// listener blocks the emitting task.
pub trait DownloadListener: Send + Sync {
    fn on_download_start(&self, gid: &str, info: &TransferInfo);
    fn on_download_progress(&self, gid: &str, info: &TransferInfo);
    fn on_download_complete(&self, gid: &str, info: &TransferInfo);
    fn on_download_stop(&self, gid: &str, info: &TransferInfo);
}
