//! The `epm daemon` supervisor process
//!
//! A single daemon per home root owns every managed process. It listens on a
//! loopback port chosen by the OS and advertises `{pid, port, token}` in
//! `daemon.json`; an exclusive lock on `daemon.pid` keeps a second daemon
//! from starting against the same home.

use crate::paths::EpmHome;
use crate::process::ProcessManager;
use crate::supervisor::ManagedProcessDescriptor;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest request body the daemon accepts
const MAX_REQUEST_BODY: usize = 1024 * 1024;

/// Contents of `daemon.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonState {
    pub pid: u32,
    pub port: u16,
    pub token: String,
}

impl DaemonState {
    /// Read the advertised daemon address, if any
    pub fn read(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Write the state file atomically so clients never see a partial file
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut tmp, self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Exclusive lock held for the daemon's lifetime
#[cfg(unix)]
pub struct DaemonLock {
    _file: std::fs::File,
}

#[cfg(unix)]
impl DaemonLock {
    pub fn acquire(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another daemon is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        file.set_len(0)?;
        writeln!(&file, "{}", std::process::id())?;

        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
pub struct DaemonLock;

#[cfg(not(unix))]
impl DaemonLock {
    pub fn acquire(path: &Path) -> anyhow::Result<Self> {
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .expect("valid response with StatusCode enum and static header"),
        Err(e) => response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// HTTP API in front of the process table
pub struct DaemonServer {
    listener: TcpListener,
    manager: Arc<ProcessManager>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl DaemonServer {
    /// Bind on a loopback port chosen by the OS
    pub async fn bind(
        manager: Arc<ProcessManager>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        Ok(Self {
            listener,
            manager,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr()?, "Supervisor API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let manager = Arc::clone(&self.manager);
                            let auth_token = Arc::clone(&self.auth_token);

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let manager = Arc::clone(&manager);
                                    let token = Arc::clone(&auth_token);
                                    async move { handle_request(req, manager, token).await }
                                });

                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Supervisor connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept supervisor connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Supervisor API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

fn check_auth(req: &Request<hyper::body::Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| token == expected_token)
        .unwrap_or(false)
}

async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<hyper::body::Incoming>,
) -> Result<T, Response<Full<Bytes>>> {
    let body = Limited::new(req.into_body(), MAX_REQUEST_BODY)
        .collect()
        .await
        .map_err(|e| response(StatusCode::BAD_REQUEST, e.to_string()))?
        .to_bytes();
    serde_json::from_slice(&body).map_err(|e| response(StatusCode::BAD_REQUEST, e.to_string()))
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    manager: Arc<ProcessManager>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Supervisor API request");

    if path != "/health" && !check_auth(&req, &auth_token) {
        warn!(%path, "Unauthorized supervisor API request");
        return Ok(response(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => json_response(
            StatusCode::OK,
            &serde_json::json!({ "name": PKG_NAME, "version": VERSION }),
        ),

        (&Method::GET, "/processes") => json_response(StatusCode::OK, &manager.snapshot()),

        (&Method::POST, "/processes") => {
            match read_json::<Vec<ManagedProcessDescriptor>>(req).await {
                Ok(desired) => json_response(StatusCode::OK, &manager.reconcile(&desired)),
                Err(rejection) => rejection,
            }
        }

        (&Method::POST, "/processes/remove") => match read_json::<Vec<String>>(req).await {
            Ok(names) => json_response(StatusCode::OK, &manager.remove(&names).await),
            Err(rejection) => rejection,
        },

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

/// Run the supervisor until `shutdown` resolves, then stop every process.
pub async fn run_daemon<F>(home: &EpmHome, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    std::fs::create_dir_all(home.root())?;
    let _lock = DaemonLock::acquire(&home.daemon_lock_path())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = ProcessManager::new();
    let token = uuid::Uuid::new_v4().simple().to_string();
    let server = DaemonServer::bind(Arc::clone(&manager), shutdown_rx, token.clone()).await?;

    let state_path = home.daemon_state_path();
    let state = DaemonState {
        pid: std::process::id(),
        port: server.local_addr()?.port(),
        token,
    };
    state.write(&state_path)?;
    info!(
        name = PKG_NAME,
        version = VERSION,
        pid = state.pid,
        port = state.port,
        home = %home.root().display(),
        "Supervisor daemon started"
    );

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Supervisor API error");
        }
    });

    shutdown.await;

    let _ = shutdown_tx.send(true);
    info!("Stopping all managed processes...");
    manager.stop_all().await;
    let _ = server_handle.await;

    if let Err(e) = std::fs::remove_file(&state_path) {
        warn!(path = %state_path.display(), error = %e, "Failed to remove daemon state file");
    }
    info!("Supervisor daemon stopped");

    Ok(())
}
