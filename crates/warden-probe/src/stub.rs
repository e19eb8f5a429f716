//! Minimal scriptable HTTP/1.1 server for tests.
//!
//! Every connection gets one response and is closed. Responses come from a
//! handler closure, or from a status script followed by a default status.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// A request as seen by the stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubRequest {
    pub method: String,
    pub path: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubResponse {
    pub status: u16,
    pub body: String,
}

impl StubResponse {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
        }
    }

    pub fn json(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

type Handler = dyn Fn(&StubRequest) -> StubResponse + Send + Sync;

struct Shared {
    handler: Option<Box<Handler>>,
    script: Mutex<VecDeque<u16>>,
    default_status: AtomicU16,
    delay: Mutex<Duration>,
    hits: AtomicUsize,
    requests: Mutex<Vec<StubRequest>>,
}

impl Shared {
    fn respond(&self, req: &StubRequest) -> StubResponse {
        if let Some(handler) = &self.handler {
            return handler(req);
        }
        let scripted = lock(&self.script).pop_front();
        StubResponse::status(scripted.unwrap_or_else(|| self.default_status.load(Ordering::SeqCst)))
    }
}

pub struct StubServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl StubServer {
    /// Serve `default_status` to every request.
    pub async fn start(default_status: u16) -> std::io::Result<Self> {
        Self::spawn(None, default_status).await
    }

    /// Serve whatever `handler` returns.
    pub async fn with_handler<F>(handler: F) -> std::io::Result<Self>
    where
        F: Fn(&StubRequest) -> StubResponse + Send + Sync + 'static,
    {
        Self::spawn(Some(Box::new(handler)), 200).await
    }

    async fn spawn(handler: Option<Box<Handler>>, default_status: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            handler,
            script: Mutex::new(VecDeque::new()),
            default_status: AtomicU16::new(default_status),
            delay: Mutex::new(Duration::ZERO),
            hits: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        });

        let accept_shared = shared.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let shared = accept_shared.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, shared).await;
                });
            }
        });

        Ok(Self { addr, shared, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn set_status(&self, status: u16) {
        self.shared.default_status.store(status, Ordering::SeqCst);
    }

    /// Statuses served, in order, before falling back to the default.
    pub fn script(&self, statuses: impl IntoIterator<Item = u16>) {
        lock(&self.shared.script).extend(statuses);
    }

    /// Delay applied before every response.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.shared.delay) = delay;
    }

    pub fn hits(&self) -> usize {
        self.shared.hits.load(Ordering::SeqCst)
    }

    pub fn paths(&self) -> Vec<String> {
        lock(&self.shared.requests).iter().map(|r| r.path.clone()).collect()
    }

    pub fn requests(&self) -> Vec<StubRequest> {
        lock(&self.shared.requests).clone()
    }

    /// Stop accepting; later connections are refused.
    pub async fn stop(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream, shared: Arc<Shared>) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let content_length = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body_end = buf.len().min(header_end + content_length);
    let body = String::from_utf8_lossy(&buf[header_end..body_end]).to_string();

    let request = StubRequest { method, path, body };
    shared.hits.fetch_add(1, Ordering::SeqCst);
    lock(&shared.requests).push(request.clone());

    let delay = *lock(&shared.delay);
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let response = shared.respond(&request);
    let raw = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        response.status,
        reason(response.status),
        response.body.len(),
        response.body
    );
    stream.write_all(raw.as_bytes()).await?;
    stream.shutdown().await
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
