/// Minimal HTTP test server with byte-exact control over probe headers and
/// range responses, including responses that are deliberately wrong: missing
/// content length, streams that end before the declared size, streams that
/// stall forever.
use std::sync::Arc;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

#[derive(Clone, Copy, Debug)]
pub enum ServeMode {
    /// Serve every requested range completely.
    Full,
    /// Declare and serve only the first N bytes of each requested range.
    Truncate(usize),
    /// Declare the full range but write only the first N bytes, then keep the
    /// connection open forever.
    StallAfter(usize),
}

#[derive(Clone, Debug)]
pub struct HttpServerConfig {
    pub content: Vec<u8>,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
    pub send_content_length: bool,
    pub head_status: u16,
    pub get_status: u16,
    pub mode: ServeMode,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            content: Vec::new(),
            content_type: Some("application/octet-stream".to_string()),
            content_disposition: None,
            send_content_length: true,
            head_status: 200,
            get_status: 206,
            mode: ServeMode::Full,
        }
    }
}

pub struct TestHttpServer {
    addr: std::net::SocketAddr,
    handle: JoinHandle<()>,
}

impl TestHttpServer {
    pub async fn start(config: HttpServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = Arc::new(config);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle_connection(stream, config.clone()));
            }
        });
        Self { addr, handle }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path.trim_start_matches('/'))
    }
}

impl Drop for TestHttpServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(mut stream: TcpStream, config: Arc<HttpServerConfig>) {
    let Some(request) = read_request_head(&mut stream).await else {
        return;
    };
    if request.starts_with("HEAD") {
        let mut head = format!("HTTP/1.1 {} Status\r\n", config.head_status);
        push_common_headers(&mut head, &config);
        if config.send_content_length {
            head.push_str(&format!("Content-Length: {}\r\n", config.content.len()));
        }
        head.push_str("Connection: close\r\n\r\n");
        let _ = stream.write_all(head.as_bytes()).await;
        return;
    }

    let len = config.content.len();
    let (start, end) = requested_range(&request).unwrap_or((0, len.saturating_sub(1)));
    let slice: &[u8] = if len == 0 || start >= len {
        &[]
    } else {
        &config.content[start..=end.min(len - 1)]
    };

    let (declared, body, stall) = match config.mode {
        ServeMode::Full => (slice.len(), slice, false),
        ServeMode::Truncate(keep) => {
            let keep = keep.min(slice.len());
            (keep, &slice[..keep], false)
        }
        ServeMode::StallAfter(sent) => {
            let sent = sent.min(slice.len());
            (slice.len(), &slice[..sent], true)
        }
    };

    let mut head = format!("HTTP/1.1 {} Status\r\n", config.get_status);
    push_common_headers(&mut head, &config);
    head.push_str(&format!("Content-Length: {declared}\r\n"));
    if !stall {
        head.push_str("Connection: close\r\n");
    }
    head.push_str("\r\n");
    if stream.write_all(head.as_bytes()).await.is_err() {
        return;
    }
    if stream.write_all(body).await.is_err() {
        return;
    }
    let _ = stream.flush().await;
    if stall {
        std::future::pending::<()>().await;
    }
}

async fn read_request_head(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut chunk).await.ok()?;
        if read == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..read]);
        if buf.len() > 64 * 1024 {
            return None;
        }
    }
    Some(String::from_utf8_lossy(&buf).into_owned())
}

fn requested_range(request: &str) -> Option<(usize, usize)> {
    let line = request
        .lines()
        .find(|line| line.to_ascii_lowercase().starts_with("range:"))?;
    let spec = line.split_once(':')?.1.trim().strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
}

fn push_common_headers(head: &mut String, config: &HttpServerConfig) {
    if let Some(content_type) = &config.content_type {
        head.push_str(&format!("Content-Type: {content_type}\r\n"));
    }
    if let Some(disposition) = &config.content_disposition {
        head.push_str(&format!("Content-Disposition: {disposition}\r\n"));
    }
}
