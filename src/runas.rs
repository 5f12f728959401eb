//! Identity used to run deploy commands
//!
//! When epm runs as root (typically through `sudo`), deploy commands are
//! dropped to the invoking user so repositories and `node_modules` do not end
//! up owned by root.

use std::ffi::OsStr;
use tokio::process::Command;

/// Environment variables consulted, in order, for the invoking user's name
const USER_ENV_VARS: &[&str] = &["SUDO_USER", "LOGNAME", "USER", "LNAME", "USERNAME"];

/// How deploy commands are executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunAs {
    /// Run directly as the current user
    CurrentUser,
    /// Run through `sudo -u <name>`
    SudoUser { name: String },
}

impl RunAs {
    /// Pick the identity for this process: sudo down to the invoking user
    /// when running as root and a non-root user name is known.
    pub fn detect() -> Self {
        Self::from_parts(is_root(), |key| std::env::var(key).ok())
    }

    fn from_parts(is_root: bool, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if !is_root {
            return RunAs::CurrentUser;
        }

        USER_ENV_VARS
            .iter()
            .filter_map(|key| lookup(*key))
            .map(|name| name.trim().to_string())
            .find(|name| !name.is_empty() && name != "root")
            .map(|name| RunAs::SudoUser { name })
            .unwrap_or(RunAs::CurrentUser)
    }

    /// Build a command for `program args...` under this identity
    pub fn command<I, S>(&self, program: &str, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        match self {
            RunAs::CurrentUser => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
            RunAs::SudoUser { name } => {
                let mut cmd = Command::new("sudo");
                cmd.arg("-u").arg(name).arg(program).args(args);
                cmd
            }
        }
    }
}

#[cfg(unix)]
fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_non_root_runs_directly() {
        let run_as = RunAs::from_parts(false, lookup(&[("SUDO_USER", "alice")]));
        assert_eq!(run_as, RunAs::CurrentUser);
    }

    #[test]
    fn test_root_drops_to_sudo_user() {
        let run_as = RunAs::from_parts(true, lookup(&[("SUDO_USER", "alice"), ("USER", "root")]));
        assert_eq!(run_as, RunAs::SudoUser { name: "alice".to_string() });
    }

    #[test]
    fn test_root_skips_root_names() {
        let run_as = RunAs::from_parts(
            true,
            lookup(&[("SUDO_USER", "root"), ("LOGNAME", ""), ("USER", "deploy")]),
        );
        assert_eq!(run_as, RunAs::SudoUser { name: "deploy".to_string() });

        let run_as = RunAs::from_parts(true, lookup(&[("USER", "root")]));
        assert_eq!(run_as, RunAs::CurrentUser);
    }

    #[test]
    fn test_command_prefix() {
        let direct = RunAs::CurrentUser.command("git", ["pull"]);
        assert_eq!(direct.as_std().get_program(), "git");

        let sudo = RunAs::SudoUser { name: "alice".to_string() }.command("git", ["pull"]);
        let std_cmd = sudo.as_std();
        assert_eq!(std_cmd.get_program(), "sudo");
        let args: Vec<_> = std_cmd.get_args().collect();
        assert_eq!(args, vec!["-u", "alice", "git", "pull"]);
    }
}
