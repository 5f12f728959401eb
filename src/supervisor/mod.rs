//! Contract between the orchestrator and the process supervisor
//!
//! The orchestrator only ever declares a desired set of named processes and
//! reads their status back. [`client::DaemonClient`] implements the contract
//! over HTTP against the `epm daemon` process; the daemon side lives in
//! [`daemon`] and [`crate::process`].

pub mod client;
pub mod daemon;

use crate::config::{CONFIG_PATH_ENV, SERVER_PORT_ENV};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// What a managed process watches for restart-on-change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WatchSpec {
    /// `true` watches the working directory, `false` disables watching
    Enabled(bool),
    /// Watch exactly these files or directories
    Paths(Vec<PathBuf>),
}

/// A process the supervisor is asked to keep running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedProcessDescriptor {
    /// Identity key, unique across all config files
    pub name: String,
    pub script: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub watch: WatchSpec,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ManagedProcessDescriptor {
    /// Paths whose modification restarts the process
    pub fn watch_paths(&self) -> Vec<PathBuf> {
        match &self.watch {
            WatchSpec::Enabled(true) => vec![self.cwd.clone()],
            WatchSpec::Enabled(false) => Vec::new(),
            WatchSpec::Paths(paths) => paths.clone(),
        }
    }
}

/// Lifecycle state of a managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Waiting to be (re)spawned
    Launching,
    /// Running
    Online,
    /// Shutting down
    Stopping,
    /// Not running and not scheduled to run
    Stopped,
    /// Crashed too often or failed to spawn
    Errored,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::Launching => "launching",
            ProcessState::Online => "online",
            ProcessState::Stopping => "stopping",
            ProcessState::Stopped => "stopped",
            ProcessState::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Live status of a managed process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStatus {
    /// Identity key
    pub name: String,
    pub pid: Option<u32>,
    pub status: ProcessState,
    pub restart_count: u32,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub cwd: PathBuf,
    /// Environment the process was started with
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ProcessStatus {
    /// Config file the process was started from, if it is an app
    pub fn config_path(&self) -> Option<&str> {
        self.env.get(CONFIG_PATH_ENV).map(String::as_str)
    }

    /// Router port recorded for the process's config file
    pub fn server_port(&self) -> Option<u16> {
        self.env
            .get(SERVER_PORT_ENV)
            .and_then(|port| port.trim().parse().ok())
    }
}

/// Outcome of a reconcile call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Processes that were not known and got spawned
    pub started: Vec<String>,
    /// Known but stopped or errored processes that got spawned again
    pub restarted: Vec<String>,
    /// Running processes left alone
    pub unchanged: Vec<String>,
    /// Processes that failed to spawn, with the reason
    pub failed: Vec<(String, String)>,
}

/// Process supervisor as seen by the orchestrator.
///
/// Reconciliation is additive: processes missing from `desired` are never
/// stopped, so independent `start` calls for different config files coexist.
#[allow(async_fn_in_trait)]
pub trait ProcessSupervisor {
    /// Start every descriptor that is not already running
    async fn reconcile(&self, desired: &[ManagedProcessDescriptor]) -> Result<ReconcileReport>;

    /// Status of every known process
    async fn snapshot(&self) -> Result<Vec<ProcessStatus>>;

    /// Stop and forget the named processes, returning the names that existed
    async fn remove(&self, names: &[String]) -> Result<Vec<String>>;
}
