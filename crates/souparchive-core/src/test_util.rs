use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt as _, stream};
use reqwest::StatusCode;
use tokio::io::{AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::TcpListener;

use crate::error::BoxedErrorResult;
use crate::fetch::{ByteStream, FetchResponse, FileWriter, NetworkFetcher};

/// Answer a single http request with a canned response
///
/// Returns the address to send the request to.
pub(crate) async fn serve_once(status_line: &'static str, body: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        // Read until the end of the request head; requests here never carry a body
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }

        let head = format!(
            "HTTP/1.1 {status_line}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.write_all(&body).await.unwrap();
        stream.shutdown().await.unwrap();
    });

    addr
}

#[derive(Debug, Clone)]
pub(crate) enum MockResponse {
    Body(StatusCode, &'static [u8]),
    Unreachable,
    BrokenBody,
    Hang,
}

/// Scripted [`NetworkFetcher`] recording every request
#[derive(Default)]
pub(crate) struct MockNetwork {
    responses: BTreeMap<String, MockResponse>,
    calls: Mutex<Vec<String>>,
    open_bodies: Arc<AtomicUsize>,
}

impl MockNetwork {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with(mut self, url: &str, response: MockResponse) -> Self {
        self.responses.insert(url.to_owned(), response);
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Response bodies handed out and not dropped yet
    pub(crate) fn open_bodies(&self) -> usize {
        self.open_bodies.load(Ordering::SeqCst)
    }

    fn body(&self, chunks: Vec<BoxedErrorResult<Bytes>>) -> ByteStream {
        TrackedBody::new(stream::iter(chunks).boxed(), self.open_bodies.clone()).boxed()
    }
}

#[async_trait::async_trait]
impl NetworkFetcher for MockNetwork {
    async fn get(&self, url: &str) -> BoxedErrorResult<FetchResponse> {
        self.calls.lock().unwrap().push(url.to_owned());

        match self.responses.get(url).cloned() {
            Some(MockResponse::Body(status, body)) => Ok(FetchResponse::new(
                status,
                self.body(vec![Ok(Bytes::from_static(body))]),
            )),
            Some(MockResponse::BrokenBody) => Ok(FetchResponse::new(
                StatusCode::OK,
                self.body(vec![
                    Ok(Bytes::from_static(b"partial")),
                    Err("connection reset".into()),
                ]),
            )),
            Some(MockResponse::Hang) => std::future::pending().await,
            Some(MockResponse::Unreachable) | None => Err("connection refused".into()),
        }
    }
}

struct TrackedBody {
    inner: ByteStream,
    open: Arc<AtomicUsize>,
}

impl TrackedBody {
    fn new(inner: ByteStream, open: Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self { inner, open }
    }
}

impl Stream for TrackedBody {
    type Item = BoxedErrorResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for TrackedBody {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory [`FileWriter`]
///
/// A file's content becomes visible in `files` once it is shut down.
#[derive(Default)]
pub(crate) struct MemoryFiles {
    fail_create: bool,
    fail_write: bool,
    created: Mutex<Vec<PathBuf>>,
    files: Arc<Mutex<BTreeMap<PathBuf, Vec<u8>>>>,
    open_files: Arc<AtomicUsize>,
}

impl MemoryFiles {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing_create() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    pub(crate) fn failing_write() -> Self {
        Self {
            fail_write: true,
            ..Self::default()
        }
    }

    pub(crate) fn created(&self) -> Vec<PathBuf> {
        self.created.lock().unwrap().clone()
    }

    pub(crate) fn content(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub(crate) fn open_files(&self) -> usize {
        self.open_files.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl FileWriter for MemoryFiles {
    async fn create(&self, path: &Path) -> io::Result<Box<dyn AsyncWrite + Send + Unpin>> {
        if self.fail_create {
            return Err(io::Error::other("read-only filesystem"));
        }
        self.created.lock().unwrap().push(path.to_owned());
        self.open_files.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemoryFile {
            path: path.to_owned(),
            buf: vec![],
            fail_write: self.fail_write,
            files: self.files.clone(),
            open: self.open_files.clone(),
        }))
    }
}

struct MemoryFile {
    path: PathBuf,
    buf: Vec<u8>,
    fail_write: bool,
    files: Arc<Mutex<BTreeMap<PathBuf, Vec<u8>>>>,
    open: Arc<AtomicUsize>,
}

impl AsyncWrite for MemoryFile {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.fail_write {
            return Poll::Ready(Err(io::Error::other("disk full")));
        }
        self.buf.extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.files
            .lock()
            .unwrap()
            .insert(self.path.clone(), self.buf.clone());
        Poll::Ready(Ok(()))
    }
}

impl Drop for MemoryFile {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}
