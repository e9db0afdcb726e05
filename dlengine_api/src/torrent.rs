use async_trait::async_trait;
use eyre::Result;
use mockall::automock;
use std::{path::Path, sync::Arc};

/// Aggregate counters reported by the collaborator for one session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TorrentStats {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

/// Trait that allows to inject a peer-to-peer transfer implementation.
/// The engine treats it as a black box: it never sees peers, pieces or the
/// wire protocol, only sessions.
#[automock]
#[async_trait]
pub trait TorrentClient: Send + Sync {
    /// Register content by its magnet link.
    async fn add_magnet(&self, uri: &str) -> Result<Arc<dyn TorrentSession>>;
    /// Register content described by an already downloaded metainfo file.
    async fn add_torrent_file(&self, path: &Path) -> Result<Arc<dyn TorrentSession>>;
}

/// One active peer-to-peer transfer.
#[automock]
#[async_trait]
pub trait TorrentSession: Send + Sync {
    /// Resolves once content metadata is known. One-shot.
    async fn await_metadata(&self);
    /// Content name. Valid only after metadata is known.
    fn name(&self) -> String;
    /// Request the full content.
    fn download_all(&self);
    fn stats(&self) -> TorrentStats;
    fn is_complete(&self) -> bool;
    /// Cooperatively terminate the session.
    fn abort(&self);
}
