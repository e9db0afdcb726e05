/// Transfer registry. Accepts download requests, classifies them (plain HTTP
/// vs magnet link), keeps one status record per identifier and fans lifecycle
/// events out to registered listeners. Each active transfer is driven by its
/// own tasks: range workers plus an aggregator for HTTP, the collaborator
/// session for torrents, and one timer-paced progress monitor each.
use crate::{eta, gid, http_download::HttpDownloader};
use dl_utils::{run_flag::RunFlag, timer::AsyncTimer};
use dlengine_api::{
    engine::{
        DownloadListener, DownloadRequest, EventKind, Outcome, TransferInfo, TransferKind,
        OPTION_CONNECTIONS, OPTION_DIRECTORY,
    },
    error::DownloadError,
    torrent::{TorrentClient, TorrentSession},
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Content type marking a downloaded artifact as a metainfo file that shall
/// be handed over to the torrent client.
pub const TORRENT_MIME: &str = "application/x-bittorrent";

const MAGNET_SCHEME: &str = "magnet:";

pub fn is_magnet(url: &str) -> bool {
    url.starts_with(MAGNET_SCHEME)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_connections: usize,
    pub default_directory: PathBuf,
    pub poll_interval_ms: u64,
    pub request_queue_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_connections: 1,
            default_directory: PathBuf::from("."),
            poll_interval_ms: 500,
            request_queue_size: 128,
        }
    }
}

impl EngineConfig {
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Active downloader behind a status record, dispatched through the variant
/// instead of type tags scattered around the engine.
#[derive(Clone)]
enum TransferTask {
    Http(Arc<HttpDownloader>),
    Torrent(Arc<dyn TorrentSession>),
}

impl TransferTask {
    fn abort(&self) {
        match self {
            TransferTask::Http(downloader) => downloader.cancel(),
            TransferTask::Torrent(session) => session.abort(),
        }
    }
}

struct TransferState {
    info: TransferInfo,
    task: Option<TransferTask>,
}

/// One status record. Created at request acceptance, mutated by its driving
/// and monitoring tasks, immutable once a terminal outcome is recorded.
struct Transfer {
    gid: String,
    directory: PathBuf,
    run: RunFlag,
    state: RwLock<TransferState>,
}

impl Transfer {
    fn new(gid: String, kind: TransferKind, directory: PathBuf) -> Self {
        let info = TransferInfo {
            gid: gid.clone(),
            kind,
            name: String::new(),
            dl_path: None,
            directory: directory.clone(),
            content_type: String::new(),
            total_bytes: 0,
            completed_bytes: 0,
            speed: 0,
            eta: Duration::ZERO,
            awaiting_metadata: false,
            outcome: None,
        };
        Self {
            gid,
            directory,
            run: RunFlag::default(),
            state: RwLock::new(TransferState { info, task: None }),
        }
    }

    async fn snapshot(&self) -> TransferInfo {
        self.state.read().await.info.clone()
    }

    /// Record the terminal outcome. Only the first transition wins; a
    /// terminal record never changes again.
    async fn set_terminal(&self, outcome: Outcome) -> bool {
        let mut state = self.state.write().await;
        if state.info.outcome.is_none() {
            state.info.outcome = Some(outcome);
            true
        } else {
            false
        }
    }
}

enum TorrentSource {
    Magnet(String),
    Metainfo(PathBuf),
}

pub struct DownloadEngine<T> {
    client: reqwest::Client,
    transfers: Arc<RwLock<HashMap<String, Arc<Transfer>>>>,
    listeners: Arc<RwLock<Vec<Arc<dyn DownloadListener>>>>,
    torrent: Arc<dyn TorrentClient>,
    timer: Arc<T>,
    config: Arc<EngineConfig>,
}

impl<T> Clone for DownloadEngine<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            transfers: self.transfers.clone(),
            listeners: self.listeners.clone(),
            torrent: self.torrent.clone(),
            timer: self.timer.clone(),
            config: self.config.clone(),
        }
    }
}

impl<T: AsyncTimer + Send + Sync + 'static> DownloadEngine<T> {
    pub fn new(timer: T, torrent: Arc<dyn TorrentClient>, config: EngineConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            transfers: Arc::new(RwLock::new(HashMap::new())),
            listeners: Arc::new(RwLock::new(Vec::new())),
            torrent,
            timer: Arc::new(timer),
            config: Arc::new(config),
        }
    }

    /// Listeners are notified in registration order, synchronously on the
    /// task that emits the event.
    pub async fn add_listener(&self, listener: Arc<dyn DownloadListener>) {
        self.listeners.write().await.push(listener);
    }

    /// Accept one request and return its identifier. Acceptance is
    /// synchronous - for HTTP the metadata probe runs before this returns, so
    /// a probe failure is already visible in the status - while the transfer
    /// itself proceeds on background tasks.
    pub async fn submit(&self, request: DownloadRequest) -> String {
        let gid = gid::generate();
        info!("accepted download request '{gid}' for '{}'", request.url);
        let connections = request
            .options
            .get(OPTION_CONNECTIONS)
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(self.config.default_connections);
        let directory = request
            .options
            .get(OPTION_DIRECTORY)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.default_directory.clone());
        if is_magnet(&request.url) {
            self.submit_torrent(gid.clone(), request.url, directory).await;
        } else {
            self.submit_http(gid.clone(), request.url, connections, directory)
                .await;
        }
        gid
    }

    pub async fn add_url(&self, url: &str, options: HashMap<String, String>) -> String {
        self.submit(DownloadRequest {
            url: url.to_string(),
            options,
        })
        .await
    }

    /// Spawn the request intake loop and hand out its sender. The loop
    /// suspends on request arrival and submits each request on its own task,
    /// until `run` is stopped or all senders are dropped.
    pub fn spawn_intake(&self, run: RunFlag) -> mpsc::Sender<DownloadRequest> {
        let (tx, mut rx) = mpsc::channel(self.config.request_queue_size.max(1));
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                match run.select(rx.recv()).await {
                    Some(Some(request)) => {
                        let engine = engine.clone();
                        tokio::spawn(async move {
                            engine.submit(request).await;
                        });
                    }
                    Some(None) | None => break,
                }
            }
            debug!("request intake loop stopped");
        });
        tx
    }

    /// Cancel a transfer. No-op for unknown identifiers and for transfers
    /// that already reached a terminal state.
    pub async fn cancel(&self, gid: &str) {
        let Some(transfer) = self.transfers.read().await.get(gid).cloned() else {
            debug!("cancel request for unknown download '{gid}'");
            return;
        };
        if !transfer.set_terminal(Outcome::Cancelled).await {
            return;
        }
        info!("download '{gid}' cancelled by user");
        let task = transfer.state.read().await.task.clone();
        if let Some(task) = task {
            task.abort();
        }
        transfer.run.stop();
        self.notify(EventKind::Stop, gid).await;
    }

    pub async fn status(&self, gid: &str) -> Option<TransferInfo> {
        let transfer = self.transfers.read().await.get(gid).cloned()?;
        Some(transfer.snapshot().await)
    }

    /// Status records are kept until explicitly removed. Removal is refused
    /// while the transfer is still running.
    pub async fn remove(&self, gid: &str) -> bool {
        let mut transfers = self.transfers.write().await;
        let Some(transfer) = transfers.get(gid) else {
            return false;
        };
        if transfer.state.read().await.info.outcome.is_none() {
            return false;
        }
        transfers.remove(gid);
        true
    }

    async fn register(&self, transfer: Arc<Transfer>) {
        self.transfers
            .write()
            .await
            .insert(transfer.gid.clone(), transfer);
    }

    async fn notify(&self, event: EventKind, gid: &str) {
        let Some(transfer) = self.transfers.read().await.get(gid).cloned() else {
            return;
        };
        let info = transfer.snapshot().await;
        let listeners = self.listeners.read().await;
        for listener in listeners.iter() {
            match event {
                EventKind::Start => listener.on_download_start(gid, &info),
                EventKind::Progress => listener.on_download_progress(gid, &info),
                EventKind::Complete => listener.on_download_complete(gid, &info),
                EventKind::Stop => listener.on_download_stop(gid, &info),
            }
        }
    }

    async fn submit_http(&self, gid: String, url: String, connections: usize, directory: PathBuf) {
        let transfer = Arc::new(Transfer::new(gid.clone(), TransferKind::Http, directory.clone()));
        match HttpDownloader::init(self.client.clone(), &url, connections, &directory).await {
            Ok(downloader) => {
                let downloader = Arc::new(downloader);
                {
                    let mut state = transfer.state.write().await;
                    state.info.name = downloader.file_name().to_string();
                    state.info.dl_path = Some(downloader.dl_path().to_path_buf());
                    state.info.content_type = downloader.content_type().to_string();
                    state.info.total_bytes = downloader.total_size();
                    state.task = Some(TransferTask::Http(downloader.clone()));
                }
                self.register(transfer.clone()).await;
                self.notify(EventKind::Start, &gid).await;
                let engine = self.clone();
                tokio::spawn(engine.drive_http(transfer, downloader));
            }
            Err(err) => {
                warn!("download '{gid}' initialization failed: {err}");
                self.register(transfer.clone()).await;
                self.notify(EventKind::Start, &gid).await;
                transfer.set_terminal(Outcome::Failed(err)).await;
                self.notify(EventKind::Stop, &gid).await;
            }
        }
    }

    async fn drive_http(self, transfer: Arc<Transfer>, downloader: Arc<HttpDownloader>) {
        downloader.start().await;
        tokio::spawn(
            self.clone()
                .monitor_http(transfer.clone(), downloader.clone()),
        );
        match downloader.wait().await {
            Some(err) => {
                warn!("download '{}' failed: {err}", transfer.gid);
                if transfer.set_terminal(Outcome::Failed(err)).await {
                    self.notify(EventKind::Stop, &transfer.gid).await;
                }
            }
            None => {
                if downloader.content_type() == TORRENT_MIME && transfer.run.load() {
                    info!(
                        "'{}' fetched a metainfo file, handing it over to the torrent client",
                        transfer.gid
                    );
                    {
                        let mut state = transfer.state.write().await;
                        state.info.kind = TransferKind::Torrent;
                        state.info.awaiting_metadata = true;
                    }
                    let source = TorrentSource::Metainfo(downloader.dl_path().to_path_buf());
                    self.drive_torrent(transfer, source).await;
                } else {
                    transfer.set_terminal(Outcome::Completed).await;
                }
            }
        }
    }

    /// Timer-paced poll of the range workers' counters: updates throughput
    /// and the remaining-time estimate, emits PROGRESS until the record turns
    /// terminal, then COMPLETE exactly once (nothing for failure or
    /// cancellation, whose STOP was already emitted).
    async fn monitor_http(self, transfer: Arc<Transfer>, downloader: Arc<HttpDownloader>) {
        loop {
            if transfer
                .run
                .select(self.timer.sleep(self.config.poll_interval()))
                .await
                .is_none()
            {
                return;
            }
            let progress = downloader.progress().await;
            let (outcome, kind) = {
                let mut state = transfer.state.write().await;
                if state.info.kind == TransferKind::Http {
                    state.info.completed_bytes = progress.downloaded;
                    state.info.total_bytes = progress.total;
                    state.info.speed = speed(progress.downloaded, progress.elapsed);
                    state.info.eta = eta::estimate(
                        progress.total.saturating_sub(progress.downloaded),
                        state.info.speed,
                    );
                }
                (state.info.outcome.clone(), state.info.kind)
            };
            if kind != TransferKind::Http {
                // handed over to the torrent path, its own monitor takes over
                return;
            }
            match outcome {
                None => self.notify(EventKind::Progress, &transfer.gid).await,
                Some(Outcome::Completed) => {
                    self.notify(EventKind::Complete, &transfer.gid).await;
                    return;
                }
                Some(_) => return,
            }
        }
    }

    async fn submit_torrent(&self, gid: String, uri: String, directory: PathBuf) {
        let transfer = Arc::new(Transfer::new(gid.clone(), TransferKind::Torrent, directory));
        transfer.state.write().await.info.awaiting_metadata = true;
        self.register(transfer.clone()).await;
        self.notify(EventKind::Start, &gid).await;
        let engine = self.clone();
        tokio::spawn(async move {
            engine
                .drive_torrent(transfer, TorrentSource::Magnet(uri))
                .await;
        });
    }

    async fn drive_torrent(&self, transfer: Arc<Transfer>, source: TorrentSource) {
        let added = match &source {
            TorrentSource::Magnet(uri) => self.torrent.add_magnet(uri).await,
            TorrentSource::Metainfo(path) => self.torrent.add_torrent_file(path).await,
        };
        let session = match added {
            Ok(session) => session,
            Err(err) => {
                warn!("torrent '{}' registration failed: {err:#}", transfer.gid);
                let failure = Outcome::Failed(DownloadError::Collaborator(format!("{err:#}")));
                if transfer.set_terminal(failure).await {
                    self.notify(EventKind::Stop, &transfer.gid).await;
                }
                return;
            }
        };
        transfer.state.write().await.task = Some(TransferTask::Torrent(session.clone()));
        tokio::spawn(
            self.clone()
                .monitor_torrent(transfer.clone(), session.clone()),
        );
        if transfer
            .run
            .select(session.await_metadata())
            .await
            .is_none()
        {
            return;
        }
        info!(
            "torrent '{}' metadata resolved to '{}'",
            transfer.gid,
            session.name()
        );
        {
            let mut state = transfer.state.write().await;
            state.info.awaiting_metadata = false;
            state.info.name = session.name();
            state.info.dl_path = Some(transfer.directory.join(session.name()));
        }
        session.download_all();
    }

    /// Like the HTTP monitor, but sampling the collaborator session. While
    /// metadata is still unknown no PROGRESS is emitted - the session has
    /// nothing meaningful to report yet.
    async fn monitor_torrent(self, transfer: Arc<Transfer>, session: Arc<dyn TorrentSession>) {
        let started = self.timer.now();
        loop {
            if transfer
                .run
                .select(self.timer.sleep(self.config.poll_interval()))
                .await
                .is_none()
            {
                return;
            }
            let (awaiting, outcome) = {
                let state = transfer.state.read().await;
                (
                    state.info.awaiting_metadata,
                    state.info.outcome.clone(),
                )
            };
            if outcome.is_some() {
                return;
            }
            if awaiting {
                continue;
            }
            if session.is_complete() {
                if transfer.set_terminal(Outcome::Completed).await {
                    let stats = session.stats();
                    {
                        let mut state = transfer.state.write().await;
                        state.info.completed_bytes = stats.bytes_transferred;
                        state.info.total_bytes = stats.total_bytes;
                        state.info.eta = Duration::ZERO;
                    }
                    self.notify(EventKind::Complete, &transfer.gid).await;
                }
                return;
            }
            let stats = session.stats();
            let elapsed = self.timer.now().saturating_duration_since(started);
            {
                let mut state = transfer.state.write().await;
                state.info.name = session.name();
                state.info.total_bytes = stats.total_bytes;
                state.info.completed_bytes = stats.bytes_transferred;
                state.info.speed = speed(stats.bytes_transferred, elapsed);
                state.info.eta = eta::estimate(
                    stats.total_bytes.saturating_sub(stats.bytes_transferred),
                    state.info.speed,
                );
            }
            self.notify(EventKind::Progress, &transfer.gid).await;
        }
    }
}

fn speed(downloaded: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs();
    if secs == 0 {
        0
    } else {
        downloaded / secs
    }
}
