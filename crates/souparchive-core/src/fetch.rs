use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt as _;
use futures::stream::BoxStream;
use reqwest::StatusCode;
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use tokio::io::{AsyncWrite, AsyncWriteExt as _};
use tracing::{debug, info, instrument, warn};

use crate::archive::ArchiveStore;
use crate::error::{BoxedError, BoxedErrorResult};
use crate::feed::FeedItem;
use crate::pipeline::ShutdownSignal;

pub const LOG_TARGET: &str = "souparchive::fetch";

pub type ByteStream = BoxStream<'static, BoxedErrorResult<Bytes>>;

/// Response to a payload request, with the body not yet read
pub struct FetchResponse {
    pub status: StatusCode,
    pub body: ByteStream,
}

impl FetchResponse {
    pub fn new(status: StatusCode, body: ByteStream) -> Self {
        Self { status, body }
    }
}

/// Capability to issue network requests for payloads
#[async_trait::async_trait]
pub trait NetworkFetcher: Send + Sync {
    async fn get(&self, url: &str) -> BoxedErrorResult<FetchResponse>;
}

/// Capability to create payload files
#[async_trait::async_trait]
pub trait FileWriter: Send + Sync {
    async fn create(&self, path: &Path) -> io::Result<Box<dyn AsyncWrite + Send + Unpin>>;
}

/// [`NetworkFetcher`] doing plain http requests
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl NetworkFetcher for HttpFetcher {
    async fn get(&self, url: &str) -> BoxedErrorResult<FetchResponse> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(BoxedError::from))
            .boxed();
        Ok(FetchResponse::new(status, body))
    }
}

/// [`FileWriter`] creating (or truncating) files on the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileWriter;

#[async_trait::async_trait]
impl FileWriter for LocalFileWriter {
    async fn create(&self, path: &Path) -> io::Result<Box<dyn AsyncWrite + Send + Unpin>> {
        Ok(Box::new(tokio::fs::File::create(path).await?))
    }
}

/// An item that was downloaded and now needs to be recorded in the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub identifier: String,
    /// Publish time of the item (not the time of the download)
    pub timestamp: i64,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Downloaded(Completion),
    AlreadyArchived,
    NoResource,
}

#[derive(Debug, Snafu)]
pub enum FetchError {
    #[snafu(display("Error fetching {url}"))]
    Fetch { url: String, source: BoxedError },
    #[snafu(display("Error fetching {url}: status {status}"))]
    BadStatus { url: String, status: StatusCode },
    #[snafu(display("No file name in {url}"))]
    NoFilename { url: String },
    #[snafu(display("Error writing file {}", path.display()))]
    Write { path: PathBuf, source: BoxedError },
    #[snafu(display("Refusing to overwrite reserved file {} with {url}", path.display()))]
    Reserved { url: String, path: PathBuf },
    #[snafu(display("Fetching {url} cancelled"))]
    Cancelled { url: String },
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;

#[derive(Debug, Snafu)]
#[snafu(display("Timed out after {}s", timeout.as_secs()))]
struct TimeoutError {
    timeout: Duration,
}

/// Downloads the payloads of feed items into the archive directory
///
/// Never touches the archive store itself; recording a [`Completion`] is up
/// to the caller.
pub struct Fetcher {
    network: Arc<dyn NetworkFetcher>,
    files: Arc<dyn FileWriter>,
    archive_dir: PathBuf,
    timeout: Option<Duration>,
    /// Paths a payload must never be written to, like the archive file itself
    reserved: Vec<PathBuf>,
}

impl Fetcher {
    pub fn new(
        network: Arc<dyn NetworkFetcher>,
        files: Arc<dyn FileWriter>,
        archive_dir: impl Into<PathBuf>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            network,
            files,
            archive_dir: archive_dir.into(),
            timeout,
            reserved: vec![],
        }
    }

    /// Never write a payload to `path`
    pub fn reserve(mut self, path: impl Into<PathBuf>) -> Self {
        self.reserved.push(path.into());
        self
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Download `item` unless `archived` already has it
    #[instrument(skip_all, fields(identifier = %item.identifier))]
    pub async fn fetch_item(
        &self,
        item: &FeedItem,
        archived: &ArchiveStore,
        mut shutdown: ShutdownSignal,
    ) -> FetchResult<FetchOutcome> {
        let Some(url) = item.resource_url.as_deref() else {
            debug!(target: LOG_TARGET, "Nothing to fetch");
            return Ok(FetchOutcome::NoResource);
        };

        if item.identifier.is_empty() {
            warn!(target: LOG_TARGET, %url, "Item has no identifier, not archiving it");
            return Ok(FetchOutcome::NoResource);
        }

        if archived.contains(&item.identifier) {
            debug!(target: LOG_TARGET, %url, "Skipping, already in archive");
            return Ok(FetchOutcome::AlreadyArchived);
        }

        info!(target: LOG_TARGET, %url, "Saving");

        let download = async {
            match self.timeout {
                Some(timeout) => tokio::time::timeout(timeout, self.download(url))
                    .await
                    .unwrap_or_else(|_| {
                        Err(BoxedError::from(TimeoutError { timeout })).context(FetchSnafu { url })
                    }),
                None => self.download(url).await,
            }
        };

        let filename = tokio::select! {
            biased;
            () = shutdown.wait() => return CancelledSnafu { url }.fail(),
            res = download => res?,
        };

        Ok(FetchOutcome::Downloaded(Completion {
            identifier: item.identifier.clone(),
            timestamp: item.published_at,
            filename,
        }))
    }

    /// Fetch `url` and stream it into the archive directory, returning the file name
    async fn download(&self, url: &str) -> FetchResult<String> {
        let response = self.network.get(url).await.context(FetchSnafu { url })?;
        if !response.status.is_success() {
            return BadStatusSnafu {
                url,
                status: response.status,
            }
            .fail();
        }

        let filename = filename_from_url(url).context(NoFilenameSnafu { url })?;
        let path = self.archive_dir.join(&filename);
        if self.is_reserved(&path).await {
            return ReservedSnafu { url, path }.fail();
        }

        let mut body = response.body;
        let mut file = self
            .files
            .create(&path)
            .await
            .map_err(BoxedError::from)
            .context(WriteSnafu { path: &path })?;

        let res = copy(&mut body, &mut file).await;

        // Release both ends before reporting, whatever the outcome
        drop(body);
        drop(file);

        let written = res.context(WriteSnafu { path: &path })?;
        debug!(target: LOG_TARGET, path = %path.display(), bytes = written, "Saved");

        Ok(filename)
    }

    async fn is_reserved(&self, path: &Path) -> bool {
        for reserved in &self.reserved {
            if reserved == path {
                return true;
            }
            if reserved.file_name() != path.file_name() {
                continue;
            }
            // Same name, parents may still be spelled differently
            let (Some(a), Some(b)) = (reserved.parent(), path.parent()) else {
                continue;
            };
            if let (Ok(a), Ok(b)) = (
                tokio::fs::canonicalize(non_empty_dir(a)).await,
                tokio::fs::canonicalize(non_empty_dir(b)).await,
            ) {
                if a == b {
                    return true;
                }
            }
        }
        false
    }
}

fn non_empty_dir(dir: &Path) -> &Path {
    if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    }
}

async fn copy(
    body: &mut ByteStream,
    file: &mut (dyn AsyncWrite + Send + Unpin),
) -> BoxedErrorResult<u64> {
    let mut written = 0;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.shutdown().await?;
    Ok(written)
}

/// Final path segment of `url`, which may also be a bare relative path
pub fn filename_from_url(url: &str) -> Option<String> {
    let path = match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_owned(),
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_owned(),
    };

    path.rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .map(ToOwned::to_owned)
}
