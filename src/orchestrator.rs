//! `start`, `list` and `stop` on top of a [`ProcessSupervisor`]
//!
//! The orchestrator turns the registered config files into the desired set
//! of managed processes (every app plus the router itself) and reads their
//! status back grouped by the config file they came from.

use crate::config::{load_all, parse_identity_key, ConfigFile, DEFAULT_SERVER_PORT};
use crate::error::{EpmError, Result};
use crate::paths::{absolutize, resolve_home, EpmHome, HOME_ENV};
use crate::registry::Registry;
use crate::supervisor::{
    ManagedProcessDescriptor, ProcessState, ProcessStatus, ProcessSupervisor, WatchSpec,
};
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Process name of the router
pub const ROUTER_PROCESS_NAME: &str = "easy-pm-server";

/// Turn a user supplied config path (`~/site.json`, `./site.json`) into the
/// absolute path stored in the registry
pub fn resolve_config_path(input: &str, cwd: &Path) -> PathBuf {
    absolutize(cwd, &resolve_home(input))
}

/// Human readable memory size: `kb = bytes / 1024`, then KB, MB or GB with
/// one decimal
pub fn format_memory(bytes: u64) -> String {
    let kb = bytes as f64 / 1024.0;
    if kb < 1024.0 {
        format!("{:.1} KB", kb)
    } else if kb < 1024.0 * 1024.0 {
        format!("{:.1} MB", kb / 1024.0)
    } else {
        format!("{:.1} GB", kb / 1024.0 / 1024.0)
    }
}

/// One line of the `list` table
#[derive(Debug, Clone, PartialEq)]
pub struct AppRow {
    pub name: String,
    pub branch: String,
    pub pid: Option<u32>,
    pub status: ProcessState,
    pub restart: u32,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

impl AppRow {
    fn from_status(status: &ProcessStatus) -> Self {
        let (name, branch) = match parse_identity_key(&status.name) {
            Some(parts) => (parts.name.to_string(), parts.branch.to_string()),
            None => (status.name.clone(), String::new()),
        };
        Self::with_name(status, name, branch)
    }

    fn with_name(status: &ProcessStatus, name: String, branch: String) -> Self {
        Self {
            name,
            branch,
            pid: status.pid,
            status: status.status,
            restart: status.restart_count,
            cpu_percent: status.cpu_percent,
            memory_bytes: status.memory_bytes,
        }
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.branch.clone(),
            self.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            self.status.to_string(),
            self.restart.to_string(),
            format!("{:.1}%", self.cpu_percent),
            format_memory(self.memory_bytes),
        ]
    }
}

/// Processes started from one config file
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigGroup {
    pub config_path: PathBuf,
    /// App directory, derived from the first app's working directory
    pub root: String,
    pub port: u16,
    pub rows: Vec<AppRow>,
}

/// Output of `list` (and of `start`)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatusReport {
    /// One group per registered config, in registry order
    pub groups: Vec<ConfigGroup>,
    /// Processes not started from a config file (the router)
    pub server: Vec<AppRow>,
}

fn render_table(rows: &[AppRow]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Name", "branch", "pid", "status", "restart", "cpu", "memory"]);
    for row in rows {
        table.add_row(row.cells());
    }
    table
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.server.is_empty() {
            writeln!(f, "Server processes")?;
            writeln!(f, "{}", render_table(&self.server))?;
            writeln!(f)?;
        }

        for group in &self.groups {
            let count = group.rows.len();
            writeln!(f, "Config File: {}", group.config_path.display())?;
            writeln!(f, "App Directory: {}", group.root)?;
            writeln!(
                f,
                "Listening on port {}: {} {} running",
                group.port,
                count,
                if count > 1 { "apps" } else { "app" }
            )?;
            writeln!(f, "{}", render_table(&group.rows))?;
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Group process statuses under the registered config files
pub fn group_statuses(config_paths: &[PathBuf], statuses: &[ProcessStatus]) -> StatusReport {
    let groups = config_paths
        .iter()
        .map(|config_path| {
            let key = config_path.to_string_lossy();
            let members: Vec<&ProcessStatus> = statuses
                .iter()
                .filter(|s| s.config_path() == Some(key.as_ref()))
                .collect();

            let rows: Vec<AppRow> = members.iter().map(|s| AppRow::from_status(s)).collect();

            let root = members
                .first()
                .zip(rows.first())
                .map(|(status, row)| app_root(&status.cwd, &row.name))
                .unwrap_or_default();

            let port = members
                .iter()
                .find_map(|s| s.server_port())
                .unwrap_or(DEFAULT_SERVER_PORT);

            ConfigGroup {
                config_path: config_path.clone(),
                root,
                port,
                rows,
            }
        })
        .collect();

    let server = statuses
        .iter()
        .filter(|s| s.config_path().is_none())
        .map(|s| AppRow::with_name(s, s.name.clone(), String::new()))
        .collect();

    StatusReport { groups, server }
}

/// `cwd` with a trailing `/<name>` removed
fn app_root(cwd: &Path, name: &str) -> String {
    let cwd = cwd.to_string_lossy();
    let suffix = format!("/{}", name);
    cwd.strip_suffix(suffix.as_str()).unwrap_or(&cwd).to_string()
}

/// Runs the CLI actions against a supervisor
pub struct Orchestrator<S> {
    home: EpmHome,
    registry: Registry,
    supervisor: S,
    router_exe: PathBuf,
    router_port: Option<u16>,
}

impl<S: ProcessSupervisor> Orchestrator<S> {
    /// The router is launched from the current executable
    pub fn new(home: EpmHome, supervisor: S) -> Self {
        let router_exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("epm"));
        let registry = Registry::new(home.registry_path());
        Self {
            home,
            registry,
            supervisor,
            router_exe,
            router_port: None,
        }
    }

    pub fn with_router_exe(mut self, exe: impl Into<PathBuf>) -> Self {
        self.router_exe = exe.into();
        self
    }

    /// Make the router listen on `port` for every config
    pub fn with_router_port(mut self, port: Option<u16>) -> Self {
        self.router_port = port;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Register a config file and make sure its apps and the router run.
    /// The registration is kept even if a later step fails.
    pub async fn start(&self, config_path: &Path) -> Result<StatusReport> {
        self.registry.append(config_path)?;

        let paths = self.registry.load()?;
        let configs = load_all(&paths).await?;
        let desired = self.descriptors(&configs, &paths);
        debug!(processes = desired.len(), "Declaring desired processes");

        let report = self.supervisor.reconcile(&desired).await?;
        if !report.failed.is_empty() {
            let detail = report
                .failed
                .iter()
                .map(|(name, reason)| format!("{}: {}", name, reason))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(EpmError::SupervisorStartFailed(detail));
        }

        info!(
            config = %config_path.display(),
            started = report.started.len(),
            restarted = report.restarted.len(),
            "Processes started"
        );

        self.list().await
    }

    /// Status of every process, grouped by registered config
    pub async fn list(&self) -> Result<StatusReport> {
        let paths = self.registry.load()?;
        let statuses = self.supervisor.snapshot().await?;
        Ok(group_statuses(&paths, &statuses))
    }

    /// Stop every app of a config file and unregister it. Returns the names
    /// of the processes that were stopped.
    pub async fn stop(&self, config_path: &Path) -> Result<Vec<String>> {
        let key = config_path.to_string_lossy();
        let names: Vec<String> = self
            .supervisor
            .snapshot()
            .await?
            .into_iter()
            .filter(|s| s.config_path() == Some(key.as_ref()))
            .map(|s| s.name)
            .collect();

        let removed = if names.is_empty() {
            Vec::new()
        } else {
            self.supervisor.remove(&names).await?
        };

        if !self.registry.remove(config_path)? {
            debug!(config = %config_path.display(), "Config was not registered");
        }

        info!(config = %config_path.display(), stopped = removed.len(), "Config stopped");
        Ok(removed)
    }

    /// Desired processes: every app in registry order, then the router
    pub fn descriptors(
        &self,
        configs: &[ConfigFile],
        config_paths: &[PathBuf],
    ) -> Vec<ManagedProcessDescriptor> {
        let mut desired: Vec<ManagedProcessDescriptor> = configs
            .iter()
            .flat_map(|config| config.apps.iter())
            .map(|app| ManagedProcessDescriptor {
                name: app.identity.clone(),
                script: app.script.clone(),
                args: app.args.clone(),
                cwd: app.cwd.clone(),
                watch: WatchSpec::Enabled(app.watch),
                env: app.env.clone(),
            })
            .collect();

        desired.push(self.router_descriptor(config_paths));
        desired
    }

    fn router_descriptor(&self, config_paths: &[PathBuf]) -> ManagedProcessDescriptor {
        let mut watch = vec![self.registry.path().to_path_buf()];
        watch.extend(config_paths.iter().cloned());

        let mut env = BTreeMap::new();
        env.insert(HOME_ENV.to_string(), self.home.root().to_string_lossy().into_owned());
        env.insert("epm_start".to_string(), "true".to_string());
        if let Some(port) = self.router_port {
            env.insert("PORT".to_string(), port.to_string());
        }

        ManagedProcessDescriptor {
            name: ROUTER_PROCESS_NAME.to_string(),
            script: self.router_exe.to_string_lossy().into_owned(),
            args: vec!["serve".to_string()],
            cwd: self.home.root().to_path_buf(),
            watch: WatchSpec::Paths(watch),
            env,
        }
    }
}
