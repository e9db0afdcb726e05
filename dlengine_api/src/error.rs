use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminal failure reasons for a transfer. A transfer records at most one of
/// these; the first failure observed wins and remaining workers are cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadError {
    /// Metadata probe failed or returned a non-success status.
    #[error("metadata probe failed: {0}")]
    Probe(String),

    /// Response carried no usable content length, so the resource cannot be
    /// split into ranges.
    #[error("content length unknown: {0}")]
    SizeUnknown(String),

    /// Network or local write failure while transferring a range, including
    /// servers that do not honor the requested range.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// Stream ended before the declared range was fully consumed.
    #[error("stream ended after {received} of {expected} bytes")]
    ShortTransfer { expected: u64, received: u64 },

    #[error("cancelled by user")]
    Cancelled,

    /// Failure surfaced by the peer-to-peer collaborator.
    #[error("torrent client error: {0}")]
    Collaborator(String),
}
