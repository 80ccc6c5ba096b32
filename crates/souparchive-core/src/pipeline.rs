use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use snafu::{ResultExt as _, Snafu};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::archive::ArchiveStore;
use crate::error::FmtCompact as _;
use crate::feed::FeedItem;
use crate::fetch::{
    Completion, FetchError, FetchOutcome, FetchResult, Fetcher, FileWriter, NetworkFetcher,
};

pub const LOG_TARGET: &str = "souparchive::pipeline";

/// Lets a host process abort a running pipeline
///
/// A signal whose sender is gone never fires.
#[derive(Debug, Clone)]
pub struct ShutdownSignal(Option<watch::Receiver<bool>>);

impl ShutdownSignal {
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self(Some(rx)))
    }

    pub fn never() -> Self {
        Self(None)
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once shutdown was requested
    pub async fn wait(&mut self) {
        if let Some(rx) = self.0.as_mut() {
            if rx.wait_for(|shutdown| *shutdown).await.is_ok() {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

#[derive(Debug, Snafu)]
pub enum PipelineError {
    #[snafu(display("Failed to create archive directory {}", path.display()))]
    ArchiveDir { path: PathBuf, source: io::Error },
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Tally of a single run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub downloaded: usize,
    pub already_archived: usize,
    pub no_resource: usize,
    pub failed: usize,
    /// Completions durably recorded in the archive store
    pub persisted: usize,
    pub persist_failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recorded {
    Persisted,
    Duplicate,
    Failed,
}

#[derive(Debug, Clone, Copy, Default)]
struct WriterSummary {
    persisted: usize,
    duplicates: usize,
    persist_failed: usize,
}

/// Fans feed items out to concurrent fetch workers and funnels their
/// completions into a single task that owns all archive writes
pub struct Pipeline {
    fetcher: Arc<Fetcher>,
    archive_path: PathBuf,
    max_concurrency: Option<usize>,
    shutdown: ShutdownSignal,
}

#[bon::bon]
impl Pipeline {
    #[builder(finish_fn(name = "build"))]
    pub fn new(
        network: Arc<dyn NetworkFetcher>,
        files: Arc<dyn FileWriter>,
        #[builder(into)] archive_dir: PathBuf,
        #[builder(into)] archive_path: PathBuf,
        fetch_timeout: Option<Duration>,
        max_concurrency: Option<usize>,
        shutdown: Option<ShutdownSignal>,
    ) -> Self {
        let store = ArchiveStore::new(&archive_path);
        let fetcher = Fetcher::new(network, files, archive_dir, fetch_timeout)
            .reserve(store.path())
            .reserve(store.tmp_path());

        Self {
            fetcher: Arc::new(fetcher),
            archive_path,
            max_concurrency: max_concurrency.filter(|n| 0 < *n),
            shutdown: shutdown.unwrap_or_else(ShutdownSignal::never),
        }
    }
}

impl Pipeline {
    /// Archive every item of the feed that is not archived yet
    ///
    /// Per-item failures are logged and counted, never returned. Returns
    /// only once every worker finished and every completion was handled by
    /// the writer.
    #[instrument(skip_all, fields(items = items.len()))]
    pub async fn run(&self, items: Vec<FeedItem>) -> PipelineResult<RunSummary> {
        let archive_dir = self.fetcher.archive_dir();
        tokio::fs::create_dir_all(archive_dir)
            .await
            .context(ArchiveDirSnafu { path: archive_dir })?;

        let mut store = ArchiveStore::new(&self.archive_path);
        store.read().await;
        debug!(target: LOG_TARGET, archived = store.len(), "Loaded archive");
        // Workers only ever see this read-only snapshot
        let snapshot = Arc::new(store);

        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(Self::run_writer(self.archive_path.clone(), completion_rx));

        let limit = self.max_concurrency.map(|n| Arc::new(Semaphore::new(n)));
        let mut workers = JoinSet::new();
        for item in items {
            let fetcher = self.fetcher.clone();
            let snapshot = snapshot.clone();
            let shutdown = self.shutdown.clone();
            let completion_tx = completion_tx.clone();
            let limit = limit.clone();

            workers.spawn(async move {
                let _permit = match limit {
                    Some(limit) => limit.acquire_owned().await.ok(),
                    None => None,
                };
                let res = fetcher.fetch_item(&item, &snapshot, shutdown).await;
                if let Ok(FetchOutcome::Downloaded(completion)) = &res {
                    if completion_tx.send(completion.clone()).is_err() {
                        error!(target: LOG_TARGET, identifier = %completion.identifier, "Archive writer is gone");
                    }
                }
                res
            });
        }
        // The channel closes once the last worker drops its sender
        drop(completion_tx);

        let mut summary = RunSummary::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(res) => Self::tally(&mut summary, &res),
                Err(err) => {
                    error!(target: LOG_TARGET, err = %err.fmt_compact(), "Fetch worker panicked");
                    summary.failed += 1;
                }
            }
        }

        match writer.await {
            Ok(written) => {
                summary.persisted = written.persisted;
                summary.persist_failed = written.persist_failed;
                if 0 < written.duplicates {
                    debug!(target: LOG_TARGET, duplicates = written.duplicates, "Dropped duplicate completions");
                }
            }
            Err(err) => {
                error!(target: LOG_TARGET, err = %err.fmt_compact(), "Archive writer panicked");
            }
        }

        info!(
            target: LOG_TARGET,
            downloaded = summary.downloaded,
            already_archived = summary.already_archived,
            no_resource = summary.no_resource,
            failed = summary.failed,
            persisted = summary.persisted,
            persist_failed = summary.persist_failed,
            "Run complete"
        );
        Ok(summary)
    }

    fn tally(summary: &mut RunSummary, res: &FetchResult<FetchOutcome>) {
        match res {
            Ok(FetchOutcome::Downloaded(_)) => summary.downloaded += 1,
            Ok(FetchOutcome::AlreadyArchived) => summary.already_archived += 1,
            Ok(FetchOutcome::NoResource) => summary.no_resource += 1,
            Err(err @ FetchError::Cancelled { .. }) => {
                info!(target: LOG_TARGET, err = %err.fmt_compact(), "Item skipped");
                summary.failed += 1;
            }
            Err(err) => {
                warn!(target: LOG_TARGET, err = %err.fmt_compact(), "Item failed");
                summary.failed += 1;
            }
        }
    }

    /// Record completions one at a time, in arrival order
    ///
    /// Every completion gets a full re-read, add, persist cycle, so each write
    /// contains everything recorded before it.
    async fn run_writer(
        archive_path: PathBuf,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) -> WriterSummary {
        let mut summary = WriterSummary::default();
        let mut store = ArchiveStore::new(archive_path);

        while let Some(completion) = completions.recv().await {
            match Self::record(&mut store, completion).await {
                Recorded::Persisted => summary.persisted += 1,
                Recorded::Duplicate => summary.duplicates += 1,
                Recorded::Failed => summary.persist_failed += 1,
            }
        }

        summary
    }

    /// One read, add, persist cycle
    ///
    /// A record whose persist failed is dropped from memory again, so a
    /// later persist does not write it behind the caller's back.
    async fn record(store: &mut ArchiveStore, completion: Completion) -> Recorded {
        store.read().await;

        if store.contains(&completion.identifier) {
            debug!(target: LOG_TARGET, identifier = %completion.identifier, "Already recorded");
            return Recorded::Duplicate;
        }

        store.add(
            completion.identifier.clone(),
            completion.timestamp,
            Some(completion.filename),
        );

        match store.persist().await {
            Ok(()) => {
                debug!(target: LOG_TARGET, identifier = %completion.identifier, "Recorded in archive");
                Recorded::Persisted
            }
            Err(err) => {
                error!(
                    target: LOG_TARGET,
                    identifier = %completion.identifier,
                    err = %err.fmt_compact(),
                    "Failed to persist archive"
                );
                store.remove(&completion.identifier);
                Recorded::Failed
            }
        }
    }
}
