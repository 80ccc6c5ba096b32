pub mod archive;
pub mod error;
pub mod feed;
pub mod fetch;
pub mod pipeline;

pub use archive::{ArchiveRecord, ArchiveStore};
pub use feed::{Feed, FeedItem};
pub use fetch::{Completion, FetchOutcome, Fetcher};
pub use pipeline::{Pipeline, RunSummary, ShutdownSignal};

pub const PROJECT_NAME: &str = "souparchive";

/// Default name of the archive file inside the archive directory
pub const DEFAULT_ARCHIVE_FILE_NAME: &str = "archive.json";

#[cfg(test)]
pub(crate) mod test_util;
