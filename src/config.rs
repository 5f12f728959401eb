use crate::error::{EpmError, Result};
use crate::paths::{absolutize, resolve_home};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Branch deployed when an app does not name one
pub const DEFAULT_BRANCH: &str = "master";

/// Port the router listens on when a config does not name one
pub const DEFAULT_SERVER_PORT: u16 = 80;

/// Env var injected into every app naming the config file it came from
pub const CONFIG_PATH_ENV: &str = "epm_config_path";

/// Env var injected into every app naming the router's listen port
pub const SERVER_PORT_ENV: &str = "epm_server_port";

const DEFAULT_SCRIPT: &str = "npm";
const DEFAULT_ARGS: &[&str] = &["start"];

/// On-disk shape of a config file
#[derive(Debug, Deserialize)]
struct RawConfig {
    /// Directory that app paths are resolved against
    root: String,

    /// Router listen port (default: 80)
    #[serde(default)]
    port: Option<u16>,

    /// Webhook deploy settings
    #[serde(default)]
    webhook: Option<WebhookSettings>,

    apps: Vec<RawApp>,
}

/// Webhook deploy settings for a config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSettings {
    /// Shared secret used as the HMAC key
    pub token: String,
}

/// `args` may be written as a single command line or as a list
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ArgsSpec {
    Line(String),
    List(Vec<String>),
}

/// On-disk shape of a single app entry
///
/// **Security:** `script` and `args` are executed as given. Config files must
/// only be writable by the user running the supervisor.
#[derive(Debug, Deserialize)]
struct RawApp {
    name: String,
    branch: Option<String>,
    path: Option<String>,
    #[serde(default)]
    domains: Vec<String>,
    script: Option<String>,
    args: Option<ArgsSpec>,
    watch: Option<bool>,
    #[serde(default)]
    env: serde_json::Map<String, serde_json::Value>,
    port: Option<u16>,
}

/// A loaded, normalized config file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigFile {
    /// Absolute path of the file this was loaded from
    pub path: PathBuf,
    /// Absolute root directory of the apps
    pub root: PathBuf,
    /// Router listen port
    pub port: u16,
    pub webhook: Option<WebhookSettings>,
    /// Apps in declaration order
    pub apps: Vec<AppSpec>,
}

impl ConfigFile {
    pub fn webhook_token(&self) -> Option<&str> {
        self.webhook.as_ref().map(|w| w.token.as_str())
    }

    pub fn find_app(&self, name: &str) -> Option<&AppSpec> {
        self.apps.iter().find(|app| app.name == name)
    }
}

/// A normalized app declaration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppSpec {
    pub name: String,
    pub branch: String,
    /// Absolute working directory (root joined with `path` or `name`)
    pub cwd: PathBuf,
    pub script: String,
    pub args: Vec<String>,
    /// Restart the app when files under `cwd` change
    pub watch: bool,
    /// Hostnames routed to this app
    pub domains: Vec<String>,
    /// Port the app listens on (required when `domains` is set)
    pub port: Option<u16>,
    /// Environment with the injected `epm_*` defaults and user env merged
    pub env: BTreeMap<String, String>,
    /// Globally unique process name, see [`identity_key`]
    pub identity: String,
}

/// Unique process name for an app: `name-branch-sha1(config path)`.
///
/// Two configs declaring the same name and branch still get distinct keys.
pub fn identity_key(name: &str, branch: &str, config_path: &Path) -> String {
    format!("{}-{}-{}", name, branch, config_path_hash(config_path))
}

/// Hex SHA-1 of a config file path
pub fn config_path_hash(config_path: &Path) -> String {
    hex::encode(Sha1::digest(config_path.to_string_lossy().as_bytes()))
}

/// App name and branch recovered from an identity key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityParts<'a> {
    pub name: &'a str,
    pub branch: &'a str,
    pub config_hash: &'a str,
}

/// Split an identity key back into its parts.
///
/// The hash and branch are taken from the right, so app names may contain
/// dashes but branch names may not.
pub fn parse_identity_key(key: &str) -> Option<IdentityParts<'_>> {
    let mut parts = key.rsplitn(3, '-');
    let config_hash = parts.next()?;
    let branch = parts.next()?;
    let name = parts.next()?;
    Some(IdentityParts {
        name,
        branch,
        config_hash,
    })
}

/// Parse and normalize config file contents. Pure: the same `path` and
/// `content` always yield the same result.
pub fn parse_config(path: &Path, content: &str) -> Result<ConfigFile> {
    let raw: RawConfig = serde_json::from_str(content)
        .map_err(|e| EpmError::config_invalid(path, e.to_string()))?;

    let config_dir = path.parent().unwrap_or_else(|| Path::new("/"));
    let root = absolutize(config_dir, &resolve_home(&raw.root));
    let port = raw.port.unwrap_or(DEFAULT_SERVER_PORT);

    let mut seen = HashSet::new();
    let mut apps = Vec::with_capacity(raw.apps.len());
    for app in raw.apps {
        if app.name.trim().is_empty() {
            return Err(EpmError::config_invalid(path, "app `name` must not be empty"));
        }
        if !seen.insert(app.name.clone()) {
            return Err(EpmError::config_invalid(
                path,
                format!("duplicate app name `{}`", app.name),
            ));
        }
        apps.push(normalize_app(path, &root, port, app)?);
    }

    Ok(ConfigFile {
        path: path.to_path_buf(),
        root,
        port,
        webhook: raw.webhook,
        apps,
    })
}

fn normalize_app(config_path: &Path, root: &Path, server_port: u16, app: RawApp) -> Result<AppSpec> {
    if !app.domains.is_empty() && app.port.is_none() {
        return Err(EpmError::config_invalid(
            config_path,
            format!("app `{}` routes domains but declares no `port`", app.name),
        ));
    }

    let branch = app.branch.unwrap_or_else(|| DEFAULT_BRANCH.to_string());
    let dir = app.path.as_deref().unwrap_or(&app.name);
    let cwd = absolutize(root, &resolve_home(dir));

    let args = match app.args {
        Some(ArgsSpec::Line(line)) => shell_words::split(&line).map_err(|e| {
            EpmError::config_invalid(config_path, format!("app `{}` args: {}", app.name, e))
        })?,
        Some(ArgsSpec::List(list)) => list,
        None if app.script.is_none() => DEFAULT_ARGS.iter().map(|s| s.to_string()).collect(),
        None => Vec::new(),
    };

    // Injected defaults first, user env layered on top
    let mut env = BTreeMap::new();
    env.insert(
        CONFIG_PATH_ENV.to_string(),
        config_path.to_string_lossy().into_owned(),
    );
    env.insert(SERVER_PORT_ENV.to_string(), server_port.to_string());
    for (key, value) in app.env {
        env.insert(key, env_value(value));
    }

    let identity = identity_key(&app.name, &branch, config_path);

    Ok(AppSpec {
        name: app.name,
        branch,
        cwd,
        script: app.script.unwrap_or_else(|| DEFAULT_SCRIPT.to_string()),
        args,
        watch: app.watch.unwrap_or(true),
        domains: app.domains,
        port: app.port,
        env,
        identity,
    })
}

fn env_value(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Read and normalize a config file. Unreadable files are reported as
/// `ConfigInvalid` as well.
pub async fn load_config(path: &Path) -> Result<ConfigFile> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| EpmError::config_invalid(path, format!("cannot read file: {}", e)))?;
    let config = parse_config(path, &content)?;
    debug!(path = %path.display(), apps = config.apps.len(), "Config loaded");
    Ok(config)
}

/// Load every config concurrently. The first failure aborts the whole load.
pub async fn load_all(paths: &[PathBuf]) -> Result<Vec<ConfigFile>> {
    futures::future::try_join_all(paths.iter().map(|p| load_config(p))).await
}
