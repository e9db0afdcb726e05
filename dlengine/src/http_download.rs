/// Chunked HTTP downloader. A resource of known size is split into contiguous,
/// non-overlapping byte ranges, one range worker per connection, all writing
/// into a single shared destination file at fixed offsets. Workers observe a
/// shared [`RunFlag`], so one stop request reaches every still-running worker.
use dl_utils::run_flag::RunFlag;
use dlengine_api::error::DownloadError;
use reqwest::header::{HeaderMap, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use std::{
    fs::File,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Resources below this size are fetched over a single connection.
const PARALLEL_SIZE_THRESHOLD: u64 = 4096 * 1024;
/// Upper bound on a single positional write; workers re-check the stop flag
/// between slices.
const WRITE_SLICE_SIZE: usize = 4096;

const DEFAULT_CONTENT_TYPE: &str = "text/plain";
const FALLBACK_FILE_NAME: &str = "download";

/// One contiguous byte range of the resource, owned by a single worker.
/// `transferred` is the only field mutated after partitioning and is read
/// concurrently by progress snapshots.
#[derive(Debug)]
pub struct Part {
    index: usize,
    offset: u64,
    len: u64,
    transferred: AtomicU64,
}

impl Part {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    fn record(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::SeqCst);
    }
}

/// Split `[0, size)` into `connections` contiguous ranges. Every range gets
/// `size / connections` bytes except the last one, which absorbs the division
/// remainder.
pub fn partition(size: u64, connections: usize) -> Vec<Part> {
    let connections = connections.max(1);
    let per_part = size / connections as u64;
    (0..connections)
        .map(|index| {
            let offset = index as u64 * per_part;
            let len = if index == connections - 1 {
                size - per_part * (connections as u64 - 1)
            } else {
                per_part
            };
            Part {
                index,
                offset,
                len,
                transferred: AtomicU64::new(0),
            }
        })
        .collect()
}

/// Progress snapshot of one download, consistent across all ranges.
#[derive(Clone, Copy, Debug, Default)]
pub struct Progress {
    pub total: u64,
    pub downloaded: u64,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct HttpDownloader {
    client: reqwest::Client,
    url: String,
    connections: usize,
    size: u64,
    name: String,
    content_type: String,
    dl_path: PathBuf,
    parts: Vec<Arc<Part>>,
    file: Mutex<Option<Arc<File>>>,
    outcomes: Mutex<Option<mpsc::Receiver<Result<(), DownloadError>>>>,
    started: Mutex<Option<Instant>>,
    run: RunFlag,
}

impl HttpDownloader {
    /// Probe the resource and arm the downloader: resolve name, content type
    /// and total size, create the destination file (truncating any previous
    /// one) and partition the size across connections. The probe must report
    /// a parsable content length before any file is touched; without it
    /// range downloading is impossible.
    pub async fn init(
        client: reqwest::Client,
        url: &str,
        connections: usize,
        dir: &Path,
    ) -> Result<Self, DownloadError> {
        let resp = client
            .head(url)
            .send()
            .await
            .map_err(|err| DownloadError::Probe(err.to_string()))?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(DownloadError::Probe(format!(
                "server responded with {}",
                resp.status()
            )));
        }
        let content_type = sniff_content_type(resp.headers());
        let name = sniff_filename(url, resp.headers());
        let size = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or_else(|| {
                DownloadError::SizeUnknown(format!("no parsable content length for '{url}'"))
            })?;

        let mut connections = connections.max(1);
        if size < PARALLEL_SIZE_THRESHOLD {
            connections = 1;
        }

        let dl_path = dir.join(&name);
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&dl_path)
            .map_err(|err| {
                DownloadError::Transfer(format!("cannot create '{}': {err}", dl_path.display()))
            })?;
        info!("'{url}' resolved to '{name}' ({content_type}, {size} bytes, {connections} connections)");

        Ok(Self {
            client,
            url: url.to_string(),
            connections,
            size,
            name,
            content_type,
            dl_path,
            parts: partition(size, connections).into_iter().map(Arc::new).collect(),
            file: Mutex::new(Some(Arc::new(file))),
            outcomes: Mutex::new(None),
            started: Mutex::new(None),
            run: RunFlag::default(),
        })
    }

    pub fn file_name(&self) -> &str {
        &self.name
    }

    pub fn dl_path(&self) -> &Path {
        &self.dl_path
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn total_size(&self) -> u64 {
        self.size
    }

    pub fn connections(&self) -> usize {
        self.connections
    }

    /// Launch one range worker per part. Failures are not reported here;
    /// they surface through [`HttpDownloader::wait`].
    pub async fn start(&self) {
        let Some(file) = self.file.lock().await.clone() else {
            warn!("'{}' already finished, not starting again", self.url);
            return;
        };
        let (tx, rx) = mpsc::channel(self.parts.len().max(1));
        *self.outcomes.lock().await = Some(rx);
        *self.started.lock().await = Some(Instant::now());
        for part in &self.parts {
            let part = part.clone();
            let file = file.clone();
            let run = self.run.clone();
            let tx = tx.clone();
            let client = self.client.clone();
            let url = self.url.clone();
            tokio::spawn(async move {
                let outcome = fetch_range(&client, &url, &part, &file, &run).await;
                if let Err(err) = &outcome {
                    warn!("range {} of '{url}' failed: {err}", part.index());
                }
                drop(file);
                let _ = tx.send(outcome).await;
            });
        }
        debug!("launched {} range workers for '{}'", self.parts.len(), self.url);
    }

    /// Block until every worker reported an outcome. The first reported error
    /// wins: remaining workers are stopped and their outcomes discarded. The
    /// destination file is closed here exactly once, whatever the outcome.
    pub async fn wait(&self) -> Option<DownloadError> {
        let Some(mut outcomes) = self.outcomes.lock().await.take() else {
            return None;
        };
        let mut first_err = None;
        for _ in 0..self.parts.len() {
            match outcomes.recv().await {
                Some(Err(err)) => {
                    if first_err.is_none() {
                        self.run.stop();
                        first_err = Some(err);
                    }
                }
                Some(Ok(())) => {}
                None => break,
            }
        }
        self.file.lock().await.take();
        first_err
    }

    /// Request cooperative termination of all workers. Not an error: workers
    /// report success once they observe the stop request.
    pub fn cancel(&self) {
        self.run.stop();
    }

    pub async fn progress(&self) -> Progress {
        Progress {
            total: self.size,
            downloaded: self.parts.iter().map(|part| part.transferred()).sum(),
            elapsed: self
                .started
                .lock()
                .await
                .map(|started| started.elapsed())
                .unwrap_or_default(),
        }
    }

    pub async fn download(&self) -> Option<DownloadError> {
        self.start().await;
        self.wait().await
    }
}

/// Download one range into the shared file with positional writes at
/// `offset + transferred`, so workers never contend on a file cursor. The
/// worker is done exactly when the whole range arrived; a stream that ends
/// early is a short transfer, not success.
async fn fetch_range(
    client: &reqwest::Client,
    url: &str,
    part: &Part,
    file: &File,
    run: &RunFlag,
) -> Result<(), DownloadError> {
    if part.is_empty() {
        return Ok(());
    }
    let range = format!("bytes={}-{}", part.offset(), part.offset() + part.len() - 1);
    let mut resp = client
        .get(url)
        .header(RANGE, range)
        .send()
        .await
        .map_err(|err| DownloadError::Transfer(err.to_string()))?;
    if !resp.status().is_success() {
        return Err(DownloadError::Transfer(format!(
            "server responded with {}",
            resp.status()
        )));
    }
    while part.transferred() < part.len() {
        let Some(read) = run.select(resp.chunk()).await else {
            return Ok(());
        };
        let Some(bytes) = read.map_err(|err| DownloadError::Transfer(err.to_string()))? else {
            return Err(DownloadError::ShortTransfer {
                expected: part.len(),
                received: part.transferred(),
            });
        };
        if part.transferred() + bytes.len() as u64 > part.len() {
            return Err(DownloadError::Transfer(
                "server sent more bytes than requested".to_string(),
            ));
        }
        for slice in bytes.chunks(WRITE_SLICE_SIZE) {
            if !run.load() {
                return Ok(());
            }
            file.write_all_at(slice, part.offset() + part.transferred())
                .map_err(|err| DownloadError::Transfer(err.to_string()))?;
            part.record(slice.len() as u64);
        }
    }
    Ok(())
}

fn sniff_content_type(headers: &HeaderMap) -> String {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
}

/// Filename embedded in the disposition header wins; otherwise the last URL
/// path segment, percent-decoded (raw if decoding fails).
fn sniff_filename(url: &str, headers: &HeaderMap) -> String {
    if let Some(name) = headers
        .get(CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .and_then(disposition_filename)
    {
        return name;
    }
    let segment = url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(|last| last.to_string()))
        })
        .unwrap_or_default();
    let name = match urlencoding::decode(&segment) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => segment,
    };
    if name.is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        name
    }
}

fn disposition_filename(value: &str) -> Option<String> {
    value
        .split(';')
        .find_map(|param| {
            let (key, value) = param.split_once('=')?;
            if key.trim().eq_ignore_ascii_case("filename") {
                Some(value.trim().trim_matches('"').to_string())
            } else {
                None
            }
        })
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::TempDir;
    use dl_tests_utils::http_server::{HttpServerConfig, ServeMode, TestHttpServer};
    use reqwest::header::HeaderValue;
    use std::fs;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_partition_covers_size_exactly() {
        for size in [0u64, 1, 10, 4096, 1 << 20, 7_777_777] {
            for connections in 1..=8usize {
                let parts = partition(size, connections);
                assert_eq!(connections, parts.len());
                let mut expected_offset = 0;
                for part in &parts {
                    assert_eq!(expected_offset, part.offset());
                    expected_offset += part.len();
                }
                assert_eq!(size, parts.iter().map(|part| part.len()).sum::<u64>());
                let per_part = size / connections as u64;
                assert_eq!(
                    size - per_part * (connections as u64 - 1),
                    parts.last().unwrap().len()
                );
            }
        }
    }

    #[test]
    fn test_partition_single_connection_degenerates() {
        let parts = partition(12345, 1);
        assert_eq!(1, parts.len());
        assert_eq!(0, parts[0].offset());
        assert_eq!(12345, parts[0].len());
    }

    #[test]
    fn test_sniff_filename_prefers_disposition() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment; filename=\"archive.tar.gz\""),
        );
        assert_eq!(
            "archive.tar.gz",
            sniff_filename("http://host/other.bin", &headers)
        );
    }

    #[test]
    fn test_sniff_filename_decodes_path_segment() {
        let headers = HeaderMap::new();
        assert_eq!(
            "my file.txt",
            sniff_filename("http://host/files/my%20file.txt", &headers)
        );
        assert_eq!("download", sniff_filename("http://host/", &headers));
    }

    #[test]
    fn test_sniff_content_type_defaults() {
        let mut headers = HeaderMap::new();
        assert_eq!("text/plain", sniff_content_type(&headers));
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-bittorrent; charset=binary"),
        );
        assert_eq!("application/x-bittorrent", sniff_content_type(&headers));
    }

    #[tokio::test]
    async fn test_multi_connection_download_matches_content() {
        let content = patterned(5 * 1024 * 1024);
        let server = TestHttpServer::start(HttpServerConfig {
            content: content.clone(),
            ..Default::default()
        })
        .await;
        let tmp_dir = TempDir::new().unwrap();

        let downloader = HttpDownloader::init(
            reqwest::Client::new(),
            &server.url("data.bin"),
            4,
            tmp_dir.path(),
        )
        .await
        .unwrap();
        assert_eq!(4, downloader.connections());
        assert_eq!(content.len() as u64, downloader.total_size());
        assert_eq!("data.bin", downloader.file_name());

        assert_eq!(None, downloader.download().await);
        let progress = downloader.progress().await;
        assert_eq!(progress.total, progress.downloaded);
        assert_eq!(content, fs::read(downloader.dl_path()).unwrap());
    }

    #[tokio::test]
    async fn test_small_resource_forces_single_connection() {
        let content = patterned(10_000);
        let server = TestHttpServer::start(HttpServerConfig {
            content: content.clone(),
            ..Default::default()
        })
        .await;
        let tmp_dir = TempDir::new().unwrap();

        let downloader = HttpDownloader::init(
            reqwest::Client::new(),
            &server.url("small.bin"),
            8,
            tmp_dir.path(),
        )
        .await
        .unwrap();
        assert_eq!(1, downloader.connections());
        assert_eq!(None, downloader.download().await);
        assert_eq!(content, fs::read(downloader.dl_path()).unwrap());
    }

    #[tokio::test]
    async fn test_probe_failure() {
        let server = TestHttpServer::start(HttpServerConfig {
            head_status: 500,
            ..Default::default()
        })
        .await;
        let tmp_dir = TempDir::new().unwrap();

        let err = HttpDownloader::init(
            reqwest::Client::new(),
            &server.url("data.bin"),
            2,
            tmp_dir.path(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DownloadError::Probe(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_missing_content_length_creates_no_file() {
        let server = TestHttpServer::start(HttpServerConfig {
            content: patterned(100),
            send_content_length: false,
            ..Default::default()
        })
        .await;
        let tmp_dir = TempDir::new().unwrap();

        let err = HttpDownloader::init(
            reqwest::Client::new(),
            &server.url("data.bin"),
            2,
            tmp_dir.path(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DownloadError::SizeUnknown(_)), "{err:?}");
        assert_eq!(0, fs::read_dir(tmp_dir.path()).unwrap().count());
    }

    #[tokio::test]
    async fn test_stream_ending_early_is_short_transfer() {
        let server = TestHttpServer::start(HttpServerConfig {
            content: patterned(100),
            mode: ServeMode::Truncate(60),
            ..Default::default()
        })
        .await;
        let tmp_dir = TempDir::new().unwrap();

        let downloader = HttpDownloader::init(
            reqwest::Client::new(),
            &server.url("data.bin"),
            1,
            tmp_dir.path(),
        )
        .await
        .unwrap();
        assert_eq!(
            Some(DownloadError::ShortTransfer {
                expected: 100,
                received: 60,
            }),
            downloader.download().await
        );
    }

    #[tokio::test]
    async fn test_cancel_mid_transfer_stops_workers() {
        let content = patterned(1024 * 1024);
        let server = TestHttpServer::start(HttpServerConfig {
            content: content.clone(),
            mode: ServeMode::StallAfter(1024),
            ..Default::default()
        })
        .await;
        let tmp_dir = TempDir::new().unwrap();

        let downloader = Arc::new(
            HttpDownloader::init(
                reqwest::Client::new(),
                &server.url("data.bin"),
                1,
                tmp_dir.path(),
            )
            .await
            .unwrap(),
        );
        downloader.start().await;
        // let the worker consume the part of the stream served before the stall
        tokio::time::sleep(Duration::from_millis(100)).await;
        downloader.cancel();
        // cancellation is cooperative but must not leave the aggregator hanging
        assert_eq!(None, downloader.wait().await);
        let progress = downloader.progress().await;
        assert!(progress.downloaded < progress.total);
    }

    #[tokio::test]
    async fn test_progress_before_start_is_zero() {
        let server = TestHttpServer::start(HttpServerConfig {
            content: patterned(500),
            ..Default::default()
        })
        .await;
        let tmp_dir = TempDir::new().unwrap();

        let downloader = HttpDownloader::init(
            reqwest::Client::new(),
            &server.url("data.bin"),
            1,
            tmp_dir.path(),
        )
        .await
        .unwrap();
        let progress = downloader.progress().await;
        assert_eq!(0, progress.downloaded);
        assert_eq!(Duration::ZERO, progress.elapsed);
        assert_eq!(500, progress.total);
    }
}
