//! HTTP client for the supervisor daemon

use crate::error::{EpmError, Result};
use crate::paths::EpmHome;
use crate::supervisor::daemon::DaemonState;
use crate::supervisor::{
    ManagedProcessDescriptor, ProcessStatus, ProcessSupervisor, ReconcileReport,
};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How long to wait for a freshly launched daemon to come up
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(5);

const LAUNCH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Connection to a running `epm daemon`
pub struct DaemonClient {
    client: Client<HttpConnector, Full<Bytes>>,
    base_url: String,
    token: String,
}

impl DaemonClient {
    /// Talk to the daemon advertised in `state`
    pub fn new(state: &DaemonState) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            client,
            base_url: format!("http://127.0.0.1:{}", state.port),
            token: state.token.clone(),
        }
    }

    /// Connect to the daemon for `home`, launching it if none is running.
    pub async fn connect(home: &EpmHome) -> Result<Self> {
        if let Some(client) = Self::connect_existing(home).await {
            return Ok(client);
        }

        launch_daemon(home)?;

        let deadline = Instant::now() + LAUNCH_TIMEOUT;
        while Instant::now() < deadline {
            tokio::time::sleep(LAUNCH_POLL_INTERVAL).await;
            if let Some(client) = Self::connect_existing(home).await {
                return Ok(client);
            }
        }

        Err(EpmError::SupervisorConnectFailed(format!(
            "daemon did not come up within {}s (see {})",
            LAUNCH_TIMEOUT.as_secs(),
            home.daemon_log_path().display()
        )))
    }

    /// Connect only if a healthy daemon is already advertised
    pub async fn connect_existing(home: &EpmHome) -> Option<Self> {
        let state = DaemonState::read(&home.daemon_state_path()).ok()?;
        let client = Self::new(&state);
        match client.health().await {
            Ok(()) => Some(client),
            Err(e) => {
                debug!(port = state.port, error = %e, "Advertised daemon is not healthy");
                None
            }
        }
    }

    pub async fn health(&self) -> Result<()> {
        let req = self.request(Method::GET, "/health", Bytes::new())?;
        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| EpmError::SupervisorConnectFailed(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(EpmError::SupervisorConnectFailed(format!(
                "health check returned {}",
                response.status()
            )))
        }
    }

    fn request(&self, method: Method, path: &str, body: Bytes) -> Result<Request<Full<Bytes>>> {
        Request::builder()
            .method(method)
            .uri(format!("{}{}", self.base_url, path))
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(body))
            .map_err(|e| EpmError::SupervisorConnectFailed(e.to_string()))
    }

    async fn call<T: DeserializeOwned>(&self, method: Method, path: &str, body: Bytes) -> Result<T> {
        let req = self.request(method, path, body)?;
        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| EpmError::SupervisorConnectFailed(e.to_string()))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| EpmError::SupervisorConnectFailed(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            return Err(EpmError::SupervisorStartFailed(format!(
                "{} {}: {}",
                status,
                path,
                String::from_utf8_lossy(&body)
            )));
        }

        serde_json::from_slice(&body)
            .map_err(|e| EpmError::SupervisorStartFailed(format!("bad response from {}: {}", path, e)))
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let body = serde_json::to_vec(body)
            .map_err(|e| EpmError::SupervisorStartFailed(e.to_string()))?;
        self.call(Method::POST, path, Bytes::from(body)).await
    }
}

impl ProcessSupervisor for DaemonClient {
    async fn reconcile(&self, desired: &[ManagedProcessDescriptor]) -> Result<ReconcileReport> {
        self.post("/processes", &desired).await
    }

    async fn snapshot(&self) -> Result<Vec<ProcessStatus>> {
        self.call(Method::GET, "/processes", Bytes::new()).await
    }

    async fn remove(&self, names: &[String]) -> Result<Vec<String>> {
        self.post("/processes/remove", &names).await
    }
}

/// Start `epm daemon` for `home` in the background, detached from this
/// process and logging to `daemon.log`.
fn launch_daemon(home: &EpmHome) -> Result<()> {
    let exe = std::env::current_exe()
        .map_err(|e| EpmError::SupervisorConnectFailed(format!("cannot locate epm binary: {}", e)))?;

    let log_failed = |e: std::io::Error| {
        EpmError::SupervisorConnectFailed(format!(
            "cannot open daemon log {}: {}",
            home.daemon_log_path().display(),
            e
        ))
    };

    std::fs::create_dir_all(home.root()).map_err(log_failed)?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(home.daemon_log_path())
        .map_err(log_failed)?;
    let log_err = log.try_clone().map_err(log_failed)?;

    let mut cmd = std::process::Command::new(&exe);
    cmd.arg("--home")
        .arg(home.root())
        .arg("daemon")
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let child = cmd
        .spawn()
        .map_err(|e| EpmError::SupervisorConnectFailed(format!("cannot launch daemon: {}", e)))?;
    info!(pid = child.id(), exe = %exe.display(), "Launched supervisor daemon");

    Ok(())
}
