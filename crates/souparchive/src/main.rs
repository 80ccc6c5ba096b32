mod cli;

use std::io;
use std::sync::Arc;

use clap::{CommandFactory as _, Parser as _};
use cli::Opts;
use snafu::{ResultExt as _, Snafu};
use souparchive_core::error::FmtCompact as _;
use souparchive_core::feed::{FeedClient, FeedError};
use souparchive_core::fetch::{HttpFetcher, LocalFileWriter};
use souparchive_core::pipeline::PipelineError;
use souparchive_core::{PROJECT_NAME, Pipeline, ShutdownSignal};
use souparchive_web::{Server, WebServerError};
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub const LOG_TARGET: &str = "souparchive::cli";

#[derive(Debug, Snafu)]
pub enum CliError {
    #[snafu(display("Failed to initialize logging"))]
    Logging,
    #[snafu(display("Failed to build http client"))]
    HttpClient { source: reqwest::Error },
    #[snafu(display("Feed error"))]
    Feed { source: FeedError },
    #[snafu(display("Archive error"))]
    Pipeline { source: PipelineError },
    #[snafu(display("Web server error"))]
    WebServer { source: WebServerError },
    #[snafu(display("Failed to print usage"))]
    Usage { source: io::Error },
}

pub type CliResult<T> = std::result::Result<T, CliError>;

#[snafu::report]
#[tokio::main]
async fn main() -> CliResult<()> {
    init_logging()?;

    let opts = Opts::parse();

    if let Some(port) = opts.host {
        return host(&opts, port).await;
    }

    let Some(user) = opts.user.as_deref() else {
        Opts::command().print_help().context(UsageSnafu)?;
        return Ok(());
    };

    fetch(&opts, user).await
}

async fn host(opts: &Opts, port: u16) -> CliResult<()> {
    let server = Server::init(souparchive_web::Opts::new(
        opts.listen_ip,
        port,
        opts.archive_dir(),
        opts.archive_file(),
    ))
    .await
    .context(WebServerSnafu)?;

    info!(
        target: LOG_TARGET,
        url = %format!("http://{}", server.addr().context(WebServerSnafu)?),
        "Hosting archive"
    );
    server.run().await.context(WebServerSnafu)
}

async fn fetch(opts: &Opts, user: &str) -> CliResult<()> {
    let client = reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .context(HttpClientSnafu)?;

    let feed_url = opts.feed_url(user);
    let feed = FeedClient::new(client.clone())
        .fetch(&feed_url)
        .await
        .context(FeedSnafu)?;
    info!(target: LOG_TARGET, title = %feed.title, items = feed.items.len(), "Archiving feed");

    let (shutdown_tx, shutdown) = ShutdownSignal::new();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!(target: LOG_TARGET, "Shutdown requested, cancelling downloads");
                let _ = shutdown_tx.send(true);
            }
            Err(err) => {
                warn!(target: LOG_TARGET, err = %err.fmt_compact(), "Failed to listen for Ctrl+C");
            }
        }
    });

    let pipeline = Pipeline::builder()
        .network(Arc::new(HttpFetcher::new(client)))
        .files(Arc::new(LocalFileWriter))
        .archive_dir(opts.archive_dir())
        .archive_path(opts.archive_file())
        .maybe_fetch_timeout(opts.fetch_timeout())
        .maybe_max_concurrency(opts.max_concurrent_downloads)
        .shutdown(shutdown)
        .build();

    let summary = pipeline.run(feed.items).await.context(PipelineSnafu)?;

    if 0 < summary.failed || 0 < summary.persist_failed {
        warn!(
            target: LOG_TARGET,
            failed = summary.failed,
            persist_failed = summary.persist_failed,
            "Some items were not archived"
        );
    }
    info!(target: LOG_TARGET, project = PROJECT_NAME, downloaded = summary.downloaded, "Done");
    Ok(())
}

pub fn init_logging() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init()
        .map_err(|_| CliError::Logging)?;

    Ok(())
}
