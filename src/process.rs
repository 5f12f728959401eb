use crate::supervisor::{ManagedProcessDescriptor, ProcessState, ProcessStatus, ReconcileReport};
use crate::watch::{fingerprint, Fingerprint};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delay before a crashed process is spawned again
const RESTART_DELAY: Duration = Duration::from_millis(500);

/// A run shorter than this counts as an unstable restart
const MIN_UPTIME: Duration = Duration::from_secs(1);

/// Consecutive unstable restarts before a process is marked errored
const MAX_UNSTABLE_RESTARTS: u32 = 10;

/// Grace period between SIGTERM and SIGKILL
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Polling interval for watched paths
const WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Book-keeping for one managed process
struct ManagedProcess {
    descriptor: ManagedProcessDescriptor,
    state: ProcessState,
    pid: Option<u32>,
    restart_count: u32,
    /// Consecutive exits before `MIN_UPTIME`
    unstable_restarts: u32,
    started_at: Instant,
    /// Bumped on every spawn so monitors of old children stand down
    generation: u64,
    /// Insertion order, used to keep snapshots stable
    seq: u64,
    /// Bumped by every stop request so an in-flight restart backs off
    stop_epoch: u64,
    stop_tx: Option<watch::Sender<bool>>,
    monitor: Option<JoinHandle<()>>,
}

impl ManagedProcess {
    fn new(descriptor: ManagedProcessDescriptor, seq: u64) -> Self {
        Self {
            descriptor,
            state: ProcessState::Launching,
            pid: None,
            restart_count: 0,
            unstable_restarts: 0,
            started_at: Instant::now(),
            generation: 0,
            seq,
            stop_epoch: 0,
            stop_tx: None,
            monitor: None,
        }
    }
}

/// Supervises all processes declared to the daemon.
///
/// Like the rest of the daemon state this lives behind an `Arc`: monitor and
/// watcher tasks hold a clone, so [`new`](ProcessManager::new) returns
/// `Arc<Self>` directly.
pub struct ProcessManager {
    /// Processes keyed by identity key
    processes: DashMap<String, Mutex<ManagedProcess>>,
    /// cpu/memory sampler; cpu needs the previous sample to compute usage
    system: Mutex<System>,
    next_seq: AtomicU64,
}

impl ProcessManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            processes: DashMap::new(),
            system: Mutex::new(System::new()),
            next_seq: AtomicU64::new(0),
        })
    }

    /// Check if a process is known
    pub fn has_process(&self, name: &str) -> bool {
        self.processes.contains_key(name)
    }

    /// Current state of a process (`Stopped` if unknown)
    pub fn get_state(&self, name: &str) -> ProcessState {
        self.processes
            .get(name)
            .map(|p| p.lock().state)
            .unwrap_or(ProcessState::Stopped)
    }

    /// Current pid of a process
    pub fn get_pid(&self, name: &str) -> Option<u32> {
        self.processes.get(name).and_then(|p| p.lock().pid)
    }

    /// Declare the desired process set. Unknown processes are spawned,
    /// stopped/errored ones are spawned again with the new descriptor, and
    /// running ones are left alone apart from picking up the new watch list.
    /// Processes missing from `desired` are not touched.
    pub fn reconcile(self: &Arc<Self>, desired: &[ManagedProcessDescriptor]) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for descriptor in desired {
            let name = descriptor.name.clone();
            let existing = self.processes.get(&name).map(|p| p.lock().state);

            match existing {
                None => {
                    let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                    self.processes.insert(
                        name.clone(),
                        Mutex::new(ManagedProcess::new(descriptor.clone(), seq)),
                    );
                    self.spawn_watcher(&name, seq);
                    match self.launch(&name, false) {
                        Ok(_) => report.started.push(name),
                        Err(e) => report.failed.push((name, e.to_string())),
                    }
                }
                Some(ProcessState::Stopped) | Some(ProcessState::Errored) => {
                    if let Some(process) = self.processes.get(&name) {
                        let mut guard = process.lock();
                        guard.descriptor = descriptor.clone();
                        guard.unstable_restarts = 0;
                        guard.state = ProcessState::Launching;
                    }
                    match self.launch(&name, false) {
                        Ok(_) => report.restarted.push(name),
                        Err(e) => report.failed.push((name, e.to_string())),
                    }
                }
                Some(_) => {
                    if let Some(process) = self.processes.get(&name) {
                        let mut guard = process.lock();
                        if guard.descriptor.watch != descriptor.watch {
                            debug!(process = %name, "Refreshing watch list");
                            guard.descriptor.watch = descriptor.watch.clone();
                        }
                    }
                    report.unchanged.push(name);
                }
            }
        }

        info!(
            started = report.started.len(),
            restarted = report.restarted.len(),
            unchanged = report.unchanged.len(),
            failed = report.failed.len(),
            "Reconciled desired processes"
        );

        report
    }

    /// Spawn the process for `name` from its current descriptor.
    ///
    /// Only a process in `Launching` is spawned; anything else means a stop
    /// got in first and `Ok(false)` is returned without spawning.
    fn launch(self: &Arc<Self>, name: &str, is_restart: bool) -> anyhow::Result<bool> {
        let process = self
            .processes
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown process: {}", name))?;
        let mut guard = process.lock();

        if guard.state != ProcessState::Launching {
            debug!(process = name, state = %guard.state, "Not launching, process was stopped");
            return Ok(false);
        }

        let descriptor = &guard.descriptor;
        info!(
            process = name,
            script = %descriptor.script,
            cwd = %descriptor.cwd.display(),
            "Starting process"
        );

        let mut cmd = Command::new(&descriptor.script);
        cmd.args(&descriptor.args);
        cmd.current_dir(&descriptor.cwd);
        cmd.envs(&descriptor.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        // Own process group so the whole tree (e.g. npm + node) gets signalled
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                guard.state = ProcessState::Errored;
                guard.pid = None;
                error!(process = name, error = %e, "Failed to spawn process");
                return Err(anyhow::anyhow!(
                    "failed to spawn `{}`: {}",
                    guard.descriptor.script,
                    e
                ));
            }
        };

        let pid = child.id();
        info!(process = name, pid, "Process spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_output(name.to_string(), stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(name.to_string(), stderr, true);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        guard.generation += 1;
        guard.pid = pid;
        guard.state = ProcessState::Online;
        guard.started_at = Instant::now();
        guard.stop_tx = Some(stop_tx);
        if is_restart {
            guard.restart_count += 1;
        }

        let manager = Arc::clone(self);
        let owned_name = name.to_string();
        let generation = guard.generation;
        guard.monitor = Some(tokio::spawn(async move {
            manager.monitor(owned_name, generation, child, stop_rx).await;
        }));

        Ok(true)
    }

    /// Wait for a child to exit or for a stop request, whichever comes first
    async fn monitor(
        self: Arc<Self>,
        name: String,
        generation: u64,
        mut child: Child,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        tokio::select! {
            status = child.wait() => {
                self.on_exit(&name, generation, status).await;
            }
            _ = stop_rx.changed() => {
                terminate(&name, &mut child, SHUTDOWN_GRACE_PERIOD).await;
            }
        }
    }

    /// Restart a process that exited on its own, unless it keeps crashing
    async fn on_exit(
        self: &Arc<Self>,
        name: &str,
        generation: u64,
        status: std::io::Result<ExitStatus>,
    ) {
        let should_restart = {
            let Some(process) = self.processes.get(name) else {
                return;
            };
            let mut guard = process.lock();
            if guard.generation != generation || guard.state == ProcessState::Stopping {
                return;
            }

            guard.pid = None;
            if guard.started_at.elapsed() < MIN_UPTIME {
                guard.unstable_restarts += 1;
            } else {
                guard.unstable_restarts = 0;
            }

            if guard.unstable_restarts > MAX_UNSTABLE_RESTARTS {
                guard.state = ProcessState::Errored;
                error!(
                    process = name,
                    restarts = guard.unstable_restarts,
                    "Process keeps crashing, giving up"
                );
                false
            } else {
                guard.state = ProcessState::Launching;
                true
            }
        };

        if !should_restart {
            return;
        }

        match status {
            Ok(status) => warn!(process = name, ?status, "Process exited, restarting"),
            Err(e) => warn!(process = name, error = %e, "Lost track of process, restarting"),
        }

        tokio::time::sleep(RESTART_DELAY).await;

        // Someone may have stopped or replaced the process while we slept
        let still_wanted = self
            .processes
            .get(name)
            .map(|p| {
                let guard = p.lock();
                guard.generation == generation && guard.state == ProcessState::Launching
            })
            .unwrap_or(false);

        if still_wanted {
            if let Err(e) = self.launch(name, true) {
                error!(process = name, error = %e, "Failed to restart process");
            }
        }
    }

    /// Poll the process's watch paths and restart it when they change
    fn spawn_watcher(self: &Arc<Self>, name: &str, seq: u64) {
        let manager = Arc::clone(self);
        let name = name.to_string();

        tokio::spawn(async move {
            let mut last: Option<Fingerprint> = None;

            loop {
                // Stop once the process is removed or replaced by a new entry
                let paths = match manager.processes.get(&name) {
                    Some(process) => {
                        let guard = process.lock();
                        if guard.seq != seq {
                            return;
                        }
                        guard.descriptor.watch_paths()
                    }
                    None => return,
                };

                if paths.is_empty() {
                    last = None;
                } else {
                    let current = match tokio::task::spawn_blocking(move || fingerprint(&paths)).await {
                        Ok(fp) => fp,
                        Err(e) => {
                            warn!(process = %name, error = %e, "Watch fingerprint task failed");
                            return;
                        }
                    };

                    if let Some(previous) = last.replace(current.clone()) {
                        if previous != current {
                            info!(process = %name, "Watched files changed, restarting");
                            manager.restart(&name).await;
                        }
                    }
                }

                tokio::time::sleep(WATCH_INTERVAL).await;
            }
        });
    }

    /// Stop a running process and spawn it again, counting a restart.
    ///
    /// Does nothing unless the process is `Online` or `Launching`. If a stop
    /// request arrives while the old child is shutting down, the process
    /// stays stopped.
    pub async fn restart(self: &Arc<Self>, name: &str) {
        let (epoch, stop_tx, monitor) = match self.processes.get(name) {
            Some(process) => {
                let mut guard = process.lock();
                if !matches!(guard.state, ProcessState::Online | ProcessState::Launching) {
                    debug!(process = name, state = %guard.state, "Skipping restart");
                    return;
                }
                guard.state = ProcessState::Stopping;
                (guard.stop_epoch, guard.stop_tx.take(), guard.monitor.take())
            }
            None => return,
        };

        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(true);
        }
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }

        let relaunch = match self.processes.get(name) {
            Some(process) => {
                let mut guard = process.lock();
                let unclaimed = guard.state == ProcessState::Stopping && guard.stop_epoch == epoch;
                if unclaimed {
                    guard.state = ProcessState::Launching;
                    guard.pid = None;
                    guard.unstable_restarts = 0;
                }
                unclaimed
            }
            None => false,
        };

        if !relaunch {
            debug!(process = name, "Process was stopped during restart");
            return;
        }
        if let Err(e) = self.launch(name, true) {
            error!(process = name, error = %e, "Failed to restart process");
        }
    }

    /// Stop a process gracefully, keeping its entry. Returns false if the
    /// process is unknown.
    pub async fn stop_process(&self, name: &str) -> bool {
        let (stop_tx, monitor) = match self.processes.get(name) {
            Some(process) => {
                let mut guard = process.lock();
                guard.state = ProcessState::Stopping;
                guard.stop_epoch += 1;
                (guard.stop_tx.take(), guard.monitor.take())
            }
            None => return false,
        };

        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(true);
        }
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }

        if let Some(process) = self.processes.get(name) {
            let mut guard = process.lock();
            guard.state = ProcessState::Stopped;
            guard.pid = None;
        }
        true
    }

    /// Stop and forget the named processes
    pub async fn remove(&self, names: &[String]) -> Vec<String> {
        let mut removed = Vec::new();
        for name in names {
            if self.stop_process(name).await {
                self.processes.remove(name);
                info!(process = %name, "Process removed");
                removed.push(name.clone());
            }
        }
        removed
    }

    /// Stop every process (daemon shutdown)
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.processes.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.stop_process(&name).await;
        }
    }

    /// Status of every known process, in the order they were first declared
    pub fn snapshot(&self) -> Vec<ProcessStatus> {
        let mut rows: Vec<(u64, ProcessStatus)> = self
            .processes
            .iter()
            .map(|entry| {
                let guard = entry.value().lock();
                (
                    guard.seq,
                    ProcessStatus {
                        name: entry.key().clone(),
                        pid: guard.pid,
                        status: guard.state,
                        restart_count: guard.restart_count,
                        cpu_percent: 0.0,
                        memory_bytes: 0,
                        cwd: guard.descriptor.cwd.clone(),
                        env: guard.descriptor.env.clone(),
                    },
                )
            })
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);

        let mut system = self.system.lock();
        rows.into_iter()
            .map(|(_, mut status)| {
                if let Some(pid) = status.pid {
                    let pid = Pid::from_u32(pid);
                    if system.refresh_process(pid) {
                        if let Some(proc_info) = system.process(pid) {
                            status.cpu_percent = proc_info.cpu_usage();
                            status.memory_bytes = proc_info.memory();
                        }
                    }
                }
                status
            })
            .collect()
    }
}

impl crate::supervisor::ProcessSupervisor for Arc<ProcessManager> {
    async fn reconcile(
        &self,
        desired: &[ManagedProcessDescriptor],
    ) -> crate::error::Result<ReconcileReport> {
        Ok(ProcessManager::reconcile(self, desired))
    }

    async fn snapshot(&self) -> crate::error::Result<Vec<ProcessStatus>> {
        Ok(ProcessManager::snapshot(self))
    }

    async fn remove(&self, names: &[String]) -> crate::error::Result<Vec<String>> {
        Ok(ProcessManager::remove(self, names).await)
    }
}

/// Send SIGTERM to the process group, then SIGKILL after the grace period
async fn terminate(name: &str, child: &mut Child, grace_period: Duration) {
    if let Some(pid) = child.id() {
        info!(process = name, pid, "Sending SIGTERM to process");

        #[cfg(unix)]
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(process = name, ?status, "Process exited gracefully");
        }
        Ok(Err(e)) => {
            warn!(process = name, error = %e, "Error waiting for process to exit");
        }
        Err(_) => {
            warn!(
                process = name,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGKILL);
                }
            }
            let _ = child.kill().await;
        }
    }
}

/// Forward a child's output to the daemon log line by line
fn forward_output<R>(name: String, stream: R, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                warn!(target: "easy_pm::app", process = %name, "{}", line);
            } else {
                info!(target: "easy_pm::app", process = %name, "{}", line);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::WatchSpec;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn descriptor(name: &str, script: &str, args: &[&str]) -> ManagedProcessDescriptor {
        ManagedProcessDescriptor {
            name: name.to_string(),
            script: script.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: std::env::temp_dir(),
            watch: WatchSpec::Enabled(false),
            env: BTreeMap::new(),
        }
    }

    async fn wait_for_state(manager: &ProcessManager, name: &str, state: ProcessState) -> bool {
        for _ in 0..100 {
            if manager.get_state(name) == state {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[test]
    fn test_unknown_process_is_stopped() {
        let manager = ProcessManager::new();
        assert!(!manager.has_process("nope"));
        assert_eq!(manager.get_state("nope"), ProcessState::Stopped);
        assert!(manager.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_starts_and_is_additive() {
        let manager = ProcessManager::new();

        let a = descriptor("a-master-1", "sleep", &["60"]);
        let b = descriptor("b-master-1", "sleep", &["60"]);

        let report = manager.reconcile(&[a.clone()]);
        assert_eq!(report.started, vec!["a-master-1"]);
        assert_eq!(manager.get_state("a-master-1"), ProcessState::Online);
        let pid = manager.get_pid("a-master-1");
        assert!(pid.is_some());

        // A second declaration without `a` leaves it running
        let report = manager.reconcile(&[b.clone()]);
        assert_eq!(report.started, vec!["b-master-1"]);
        assert_eq!(manager.get_state("a-master-1"), ProcessState::Online);

        // Re-declaring a running process does not restart it
        let report = manager.reconcile(&[a, b]);
        assert_eq!(report.unchanged, vec!["a-master-1", "b-master-1"]);
        assert_eq!(manager.get_pid("a-master-1"), pid);

        manager.stop_all().await;
        assert_eq!(manager.get_state("a-master-1"), ProcessState::Stopped);
        assert_eq!(manager.get_state("b-master-1"), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_snapshot_order_and_env() {
        let manager = ProcessManager::new();
        let mut first = descriptor("z-master-1", "sleep", &["60"]);
        first.env.insert("epm_config_path".to_string(), "/srv/a.json".to_string());
        let second = descriptor("a-master-1", "sleep", &["60"]);

        manager.reconcile(&[first, second]);
        let snapshot = manager.snapshot();

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name, "z-master-1");
        assert_eq!(snapshot[0].config_path(), Some("/srv/a.json"));
        assert_eq!(snapshot[1].name, "a-master-1");
        assert_eq!(snapshot[0].status, ProcessState::Online);

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let manager = ProcessManager::new();
        let report = manager.reconcile(&[descriptor(
            "ghost-master-1",
            "/nonexistent/epm-test-binary",
            &[],
        )]);

        assert!(report.started.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "ghost-master-1");
        assert_eq!(manager.get_state("ghost-master-1"), ProcessState::Errored);
    }

    #[tokio::test]
    async fn test_crashed_process_is_restarted() {
        let manager = ProcessManager::new();
        // Lives past MIN_UPTIME, then exits with an error
        manager.reconcile(&[descriptor("crash-master-1", "sh", &["-c", "sleep 1.2; exit 1"])]);

        let mut restarted = false;
        for _ in 0..80 {
            let snapshot = manager.snapshot();
            if snapshot[0].restart_count >= 1 {
                restarted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(restarted, "process should have been restarted after exiting");

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_remove_stops_and_forgets() {
        let manager = ProcessManager::new();
        manager.reconcile(&[descriptor("gone-master-1", "sleep", &["60"])]);
        assert!(wait_for_state(&manager, "gone-master-1", ProcessState::Online).await);

        let removed = manager
            .remove(&["gone-master-1".to_string(), "unknown".to_string()])
            .await;
        assert_eq!(removed, vec!["gone-master-1"]);
        assert!(!manager.has_process("gone-master-1"));
    }

    #[tokio::test]
    async fn test_stopped_process_is_restarted_by_reconcile() {
        let manager = ProcessManager::new();
        let desc = descriptor("again-master-1", "sleep", &["60"]);
        manager.reconcile(&[desc.clone()]);
        manager.stop_process("again-master-1").await;
        assert_eq!(manager.get_state("again-master-1"), ProcessState::Stopped);

        let report = manager.reconcile(&[desc]);
        assert_eq!(report.restarted, vec!["again-master-1"]);
        assert_eq!(manager.get_state("again-master-1"), ProcessState::Online);

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_watch_change_restarts_process() {
        let dir = tempfile::tempdir().unwrap();
        let watched = dir.path().join("app.json");
        std::fs::write(&watched, "{}").unwrap();

        let manager = ProcessManager::new();
        let mut desc = descriptor("watched-master-1", "sleep", &["60"]);
        desc.watch = WatchSpec::Paths(vec![PathBuf::from(&watched)]);
        manager.reconcile(&[desc]);
        let first_pid = manager.get_pid("watched-master-1");

        // Let the watcher take its baseline fingerprint
        tokio::time::sleep(Duration::from_millis(300)).await;
        std::fs::remove_file(&watched).unwrap();

        let mut restarted = false;
        for _ in 0..100 {
            let snapshot = manager.snapshot();
            if snapshot[0].restart_count >= 1 && snapshot[0].status == ProcessState::Online {
                restarted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(restarted, "watched process should restart on change");
        assert_ne!(manager.get_pid("watched-master-1"), first_pid);

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_restart_leaves_stopped_process_alone() {
        let manager = ProcessManager::new();
        manager.reconcile(&[descriptor("idle-master-1", "sleep", &["60"])]);
        manager.stop_process("idle-master-1").await;

        manager.restart("idle-master-1").await;
        assert_eq!(manager.get_state("idle-master-1"), ProcessState::Stopped);
        assert_eq!(manager.get_pid("idle-master-1"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_watch_change_during_remove_does_not_respawn() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("app");
        std::fs::create_dir(&app_dir).unwrap();
        let pid_log = dir.path().join("pids.log");

        // Touches its watched cwd while shutting down
        let script = format!(
            "echo $$ >> {}; trap 'touch changed; sleep 2; exit 0' TERM; while true; do sleep 0.1; done",
            pid_log.display()
        );
        let mut desc = descriptor("app-master-1", "sh", &["-c", script.as_str()]);
        desc.cwd = app_dir;
        desc.watch = WatchSpec::Enabled(true);

        let manager = ProcessManager::new();
        manager.reconcile(&[desc]);
        assert!(wait_for_state(&manager, "app-master-1", ProcessState::Online).await);

        // Let the watcher take its baseline fingerprint
        tokio::time::sleep(Duration::from_millis(1200)).await;

        let removed = manager.remove(&["app-master-1".to_string()]).await;
        assert_eq!(removed, vec!["app-master-1"]);
        assert!(!manager.has_process("app-master-1"));

        // Give a stray watcher restart time to show up
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let log = std::fs::read_to_string(&pid_log).unwrap();
        let pids: Vec<i32> = log.lines().map(|l| l.trim().parse().unwrap()).collect();
        assert_eq!(pids.len(), 1, "process was spawned again: {:?}", pids);
        let alive = unsafe { libc::kill(pids[0], 0) } == 0;
        assert!(!alive, "removed process {} is still running", pids[0]);
    }
}
