//! Read-only http view of an archive
mod routes;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Router;
use snafu::Snafu;
use souparchive_core::ArchiveStore;
use tokio::net::{TcpListener, TcpSocket};
use tokio::signal;
use tower_http::services::ServeDir;
use tracing::info;

pub const LOG_TARGET: &str = "souparchive::web";

#[derive(Clone, Debug)]
pub struct Opts {
    pub listen_ip: IpAddr,
    pub port: u16,
    /// Directory holding the payload files
    pub archive_dir: PathBuf,
    /// Archive store to list
    pub archive_path: PathBuf,
}

impl Opts {
    pub fn new(
        listen_ip: IpAddr,
        port: u16,
        archive_dir: impl Into<PathBuf>,
        archive_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            listen_ip,
            port,
            archive_dir: archive_dir.into(),
            archive_path: archive_path.into(),
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.port)
    }
}

pub struct UiState {
    archive_path: PathBuf,
}

impl UiState {
    /// Fresh copy of the archive store
    ///
    /// The fetcher may be running next to us, so this is reloaded on every
    /// request.
    pub(crate) async fn load_archive(&self) -> ArchiveStore {
        let mut store = ArchiveStore::new(&self.archive_path);
        store.read().await;
        store
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }
}

pub type SharedState = Arc<UiState>;

pub struct Server {
    listener: TcpListener,
    state: SharedState,
    opts: Opts,
}

#[derive(Debug, Snafu)]
pub enum WebServerError {
    #[snafu(display("Failed to listen on {addr}"))]
    ListenAddr { addr: SocketAddr, source: io::Error },
    #[snafu(transparent)]
    Io { source: io::Error },
}

pub type ServerResult<T> = std::result::Result<T, WebServerError>;

impl Server {
    pub async fn init(opts: Opts) -> ServerResult<Server> {
        let listener = Self::get_listener(&opts).await?;

        let state = Arc::new(UiState {
            archive_path: opts.archive_path.clone(),
        });

        info!(
            target: LOG_TARGET,
            addr = %listener.local_addr()?,
            archive = %opts.archive_path.display(),
            "Listening"
        );
        Ok(Self {
            listener,
            state,
            opts,
        })
    }

    pub async fn get_listener(opts: &Opts) -> ServerResult<TcpListener> {
        let addr = opts.listen_addr();
        let bind = || -> io::Result<TcpListener> {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_nodelay(true)?;
            socket.bind(addr)?;
            socket.listen(1024)
        };

        bind().map_err(|source| WebServerError::ListenAddr { addr, source })
    }

    pub fn router(&self) -> Router {
        Router::new()
            .merge(routes::route_handler(self.state.clone()))
            .nest_service("/files", ServeDir::new(&self.opts.archive_dir))
    }

    pub async fn run(self) -> ServerResult<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve until `shutdown` resolves, then finish in-flight requests
    pub async fn run_until(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> ServerResult<()> {
        let router = self.router();

        info!(target: LOG_TARGET, "Starting server");
        axum::serve(self.listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!(target: LOG_TARGET, "Server stopped");
        Ok(())
    }

    pub fn addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::warn!(target: LOG_TARGET, %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!(target: LOG_TARGET, %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!(target: LOG_TARGET, "Shutdown requested");
}
