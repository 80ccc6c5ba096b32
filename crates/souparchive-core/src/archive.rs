use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, instrument, warn};

use crate::error::FmtCompact as _;

pub const LOG_TARGET: &str = "souparchive::archive";

/// One item that has already been archived
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    #[serde(rename = "guid")]
    pub identifier: String,
    /// Unix timestamp of when the item was published in the feed
    #[serde(default)]
    pub timestamp: i64,
    /// Name of the payload inside the archive directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl ArchiveRecord {
    pub fn new(identifier: impl Into<String>, timestamp: i64, filename: Option<String>) -> Self {
        Self {
            identifier: identifier.into(),
            timestamp,
            filename,
        }
    }
}

/// On-disk shapes of the archive file
///
/// Old archives only tracked a flat list of guids.
#[derive(Deserialize)]
#[serde(untagged)]
enum ArchiveDocument {
    Records { items: Vec<ArchiveRecord> },
    Legacy { guid: Vec<String> },
}

impl From<ArchiveDocument> for Vec<ArchiveRecord> {
    fn from(doc: ArchiveDocument) -> Self {
        match doc {
            ArchiveDocument::Records { items } => items,
            ArchiveDocument::Legacy { guid } => guid
                .into_iter()
                .map(|identifier| ArchiveRecord::new(identifier, 0, None))
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct ArchiveDocumentRef<'a> {
    items: &'a [ArchiveRecord],
}

#[derive(Debug, Snafu)]
enum ReadError {
    #[snafu(display("Failed to read {}", path.display()))]
    ReadFile { path: PathBuf, source: io::Error },
    #[snafu(display("Failed to decode {}", path.display()))]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Snafu)]
pub enum PersistError {
    #[snafu(display("Failed to create archive directory {}", path.display()))]
    CreateDir { path: PathBuf, source: io::Error },
    #[snafu(display("Failed to encode archive"))]
    Encode { source: serde_json::Error },
    #[snafu(display("Failed to write archive file {}", path.display()))]
    WriteFile { path: PathBuf, source: io::Error },
}

pub type PersistResult<T> = std::result::Result<T, PersistError>;

/// Durable set of already archived items, backed by a single JSON file
///
/// The store does no locking of its own. Only one task at a time may run a
/// `read` → `add` → `persist` cycle on a given path.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    path: PathBuf,
    records: Vec<ArchiveRecord>,
}

impl ArchiveStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: vec![],
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[ArchiveRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Reload the records from disk, replacing the in-memory ones
    ///
    /// A missing or undecodable file is not an error: the in-memory records
    /// stay as they were. Note that this makes a corrupted archive file look
    /// exactly like a missing one.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub async fn read(&mut self) {
        match Self::read_records(&self.path).await {
            Ok(records) => {
                debug!(target: LOG_TARGET, count = records.len(), "Loaded archive");
                self.records = records;
            }
            Err(err @ ReadError::ReadFile { .. }) => {
                debug!(target: LOG_TARGET, err = %err.fmt_compact(), "No archive file, keeping current records");
            }
            Err(err @ ReadError::Decode { .. }) => {
                warn!(target: LOG_TARGET, err = %err.fmt_compact(), "Undecodable archive file, keeping current records");
            }
        }
    }

    async fn read_records(path: &Path) -> Result<Vec<ArchiveRecord>, ReadError> {
        let data = tokio::fs::read(path).await.context(ReadFileSnafu { path })?;
        let doc: ArchiveDocument = serde_json::from_slice(&data).context(DecodeSnafu { path })?;
        Ok(doc.into())
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.records.iter().any(|r| r.identifier == identifier)
    }

    /// Append a record in memory, without checking for duplicates
    ///
    /// Callers are expected to check `contains` after a fresh `read`.
    /// Nothing is written until `persist` is called.
    pub fn add(&mut self, identifier: impl Into<String>, timestamp: i64, filename: Option<String>) {
        self.records
            .push(ArchiveRecord::new(identifier, timestamp, filename));
    }

    /// Drop every in-memory record of `identifier`
    pub fn remove(&mut self, identifier: &str) {
        self.records.retain(|r| r.identifier != identifier);
    }

    /// Records that have a payload file, newest first
    pub fn records_by_newest(&self) -> Vec<&ArchiveRecord> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.filename.is_some())
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records
    }

    /// Write all in-memory records to the backing file
    ///
    /// The whole file is rewritten every time. Data goes to a temporary
    /// sibling first and is renamed over the target, so the archive file is
    /// either the old or the new version, never a truncated one.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub async fn persist(&self) -> PersistResult<()> {
        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_private_dir(dir)
                .await
                .context(CreateDirSnafu { path: dir })?;
        }

        let data = serde_json::to_vec_pretty(&ArchiveDocumentRef {
            items: &self.records,
        })
        .context(EncodeSnafu)?;

        let tmp_path = self.tmp_path();
        write_private_file(&tmp_path, &data)
            .await
            .context(WriteFileSnafu { path: &tmp_path })?;
        if let Err(err) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err).context(WriteFileSnafu { path: &self.path });
        }

        debug!(target: LOG_TARGET, count = self.records.len(), "Persisted archive");
        Ok(())
    }

    /// Sibling file `persist` stages its writes in
    pub fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(ToOwned::to_owned)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

async fn create_private_dir(dir: &Path) -> io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(dir).await
}

async fn write_private_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}
