//! Home directory layout and path resolution helpers

use std::path::{Component, Path, PathBuf};

/// Environment variable that overrides the home root
pub const HOME_ENV: &str = "EPM_HOME";

const REGISTRY_FILE: &str = "configs";
const DAEMON_STATE_FILE: &str = "daemon.json";
const DAEMON_LOCK_FILE: &str = "daemon.pid";
const DAEMON_LOG_FILE: &str = "daemon.log";

/// Root directory holding the registry and daemon state.
///
/// Every operation receives this explicitly; nothing looks up the home
/// directory on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpmHome {
    root: PathBuf,
}

impl EpmHome {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `~/.easy-pm`, or `./.easy-pm` when no home directory is known
    pub fn default_root() -> PathBuf {
        dirs_next::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".easy-pm")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    pub fn daemon_state_path(&self) -> PathBuf {
        self.root.join(DAEMON_STATE_FILE)
    }

    pub fn daemon_lock_path(&self) -> PathBuf {
        self.root.join(DAEMON_LOCK_FILE)
    }

    pub fn daemon_log_path(&self) -> PathBuf {
        self.root.join(DAEMON_LOG_FILE)
    }
}

/// Expand a leading `~` to the user's home directory
pub fn resolve_home(path: &str) -> PathBuf {
    if path == "~" {
        return dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_next::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Join `path` onto `base` unless it is already absolute, then normalize
/// `.` and `..` lexically (symlinks are left alone).
pub fn absolutize(base: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
