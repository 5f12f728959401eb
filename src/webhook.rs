//! Push webhooks that redeploy an app
//!
//! `POST /hooks/<app>` carrying a GitHub style `x-hub-signature` header is
//! checked against the config's webhook token (HMAC-SHA1 over the raw body).
//! A valid hook pulls the app's repository, checks out its branch and runs
//! `npm install`; the watcher then restarts the app. Rejected hooks are only
//! logged, the caller always gets an empty 200.

use crate::config::AppSpec;
use crate::error::{EpmError, Result};
use crate::runas::RunAs;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::Request;
use sha1::Sha1;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

type HmacSha1 = Hmac<Sha1>;

/// Header carrying the payload signature
pub const SIGNATURE_HEADER: &str = "x-hub-signature";

/// Largest payload accepted for signature checking
pub const MAX_HOOK_BODY: usize = 5 * 1024 * 1024;

const HOOK_PREFIX: &str = "/hooks/";

/// Why a hook request did not trigger a deploy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookRejection {
    MissingSignature,
    SignatureMismatch,
    BodyTooLarge,
    BodyUnreadable,
    /// The config declares no `webhook.token`
    NoWebhookToken,
}

impl fmt::Display for HookRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HookRejection::MissingSignature => "missing signature header",
            HookRejection::SignatureMismatch => "signature mismatch",
            HookRejection::BodyTooLarge => "body too large",
            HookRejection::BodyUnreadable => "body unreadable",
            HookRejection::NoWebhookToken => "no webhook token configured",
        };
        f.write_str(s)
    }
}

/// App name addressed by a hook path: `/hooks/<name>` or `/hooks/<name>/`.
/// The query string is not part of `path`.
pub fn hook_target(path: &str) -> Option<&str> {
    let rest = path.strip_prefix(HOOK_PREFIX)?;
    let name = rest.strip_suffix('/').unwrap_or(rest);
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Hex HMAC-SHA1 of `payload` keyed with `secret`
pub fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Check a `x-hub-signature` value (with or without `sha1=`) against the payload
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let provided = signature.strip_prefix("sha1=").unwrap_or(signature);
    constant_time_compare(&sign(secret, payload), provided)
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Read and authenticate a hook request
pub async fn authenticate<B>(req: Request<B>, token: Option<&str>) -> std::result::Result<(), HookRejection>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = req.into_parts();

    let payload = match Limited::new(body, MAX_HOOK_BODY).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return Err(HookRejection::BodyTooLarge)
        }
        Err(_) => return Err(HookRejection::BodyUnreadable),
    };

    let signature = parts
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(HookRejection::MissingSignature)?;

    let token = token.ok_or(HookRejection::NoWebhookToken)?;

    if verify_signature(token, &payload, signature) {
        Ok(())
    } else {
        Err(HookRejection::SignatureMismatch)
    }
}

/// One command of a deploy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployStep {
    pub program: String,
    pub args: Vec<String>,
}

impl DeployStep {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl fmt::Display for DeployStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// `git pull`, `git checkout <branch>`, `npm install`
pub fn deploy_steps(branch: &str) -> Vec<DeployStep> {
    vec![
        DeployStep::new("git", &["pull"]),
        DeployStep::new("git", &["checkout", branch]),
        DeployStep::new("npm", &["install"]),
    ]
}

/// Runs deploys, one at a time per app directory
pub struct Deployer {
    run_as: RunAs,
    locks: DashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>,
}

impl Deployer {
    pub fn new(run_as: RunAs) -> Arc<Self> {
        Arc::new(Self {
            run_as,
            locks: DashMap::new(),
        })
    }

    /// Deploy `app` in the background
    pub fn spawn_deploy(self: &Arc<Self>, app: &AppSpec) -> JoinHandle<()> {
        let deployer = Arc::clone(self);
        let name = app.name.clone();
        let cwd = app.cwd.clone();
        let steps = deploy_steps(&app.branch);

        tokio::spawn(async move {
            info!(app = %name, cwd = %cwd.display(), "Deploy started");
            match deployer.run(&cwd, &steps).await {
                Ok(()) => info!(app = %name, "Deploy finished"),
                Err(e) => error!(app = %name, error = %e, "Deploy failed"),
            }
        })
    }

    /// Run `steps` in `cwd`, stopping at the first failure. Deploys for the
    /// same directory wait for each other.
    pub async fn run(&self, cwd: &Path, steps: &[DeployStep]) -> Result<()> {
        let lock = self
            .locks
            .entry(cwd.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        for step in steps {
            self.run_step(cwd, step).await?;
        }
        Ok(())
    }

    async fn run_step(&self, cwd: &Path, step: &DeployStep) -> Result<()> {
        let mut cmd = self.run_as.command(&step.program, &step.args);
        cmd.current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = cmd.output().await.map_err(|e| EpmError::DeployExecFailed {
            step: step.to_string(),
            code: None,
            stderr: e.to_string(),
        })?;

        if output.status.success() {
            info!(step = %step, cwd = %cwd.display(), "Deploy step succeeded");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(step = %step, code = ?output.status.code(), %stderr, "Deploy step failed");
            Err(EpmError::DeployExecFailed {
                step: step.to_string(),
                code: output.status.code(),
                stderr,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::HeaderValue;

    fn hook_request(body: &'static str, signature: Option<&str>) -> Request<Full<Bytes>> {
        let mut builder = Request::builder().method("POST").uri("/hooks/blog");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        builder.body(Full::new(Bytes::from_static(body.as_bytes()))).unwrap()
    }

    fn sh(script: &str) -> DeployStep {
        DeployStep::new("sh", &["-c", script])
    }

    #[test]
    fn test_hook_target() {
        assert_eq!(hook_target("/hooks/blog"), Some("blog"));
        assert_eq!(hook_target("/hooks/blog/"), Some("blog"));
        assert_eq!(hook_target("/hooks/"), None);
        assert_eq!(hook_target("/hooks"), None);
        assert_eq!(hook_target("/other/blog"), None);
        assert_eq!(hook_target("/hooks/blog/extra"), Some("blog/extra"));
    }

    #[test]
    fn test_sign_reference_values() {
        assert_eq!(
            sign("key", b"The quick brown fox jumps over the lazy dog"),
            "de7c9b85b8b78aa6bc8a7a36f70a90701c9db4d9"
        );
        assert_eq!(
            sign("secret", br#"{"ref":"refs/heads/master"}"#),
            "acb0be542e7d080e7e0253bfaa88c5fc95e28fe2"
        );
        assert_eq!(
            sign("secret", b"payload"),
            "f75efc0f29bf50c23f99b30b86f7c78fdaf5f11d"
        );
    }

    #[test]
    fn test_verify_signature() {
        let payload = br#"{"ref":"refs/heads/master"}"#;
        let good = "acb0be542e7d080e7e0253bfaa88c5fc95e28fe2";

        assert!(verify_signature("secret", payload, good));
        assert!(verify_signature("secret", payload, &format!("sha1={}", good)));
        assert!(!verify_signature("other", payload, good));
        assert!(!verify_signature("secret", payload, ""));
    }

    #[test]
    fn test_single_bit_mutations_rejected() {
        let payload = br#"{"ref":"refs/heads/master"}"#.to_vec();
        let signature = sign("secret", &payload);

        for byte in 0..payload.len() {
            for bit in 0..8 {
                let mut mutated = payload.clone();
                mutated[byte] ^= 1 << bit;
                assert!(
                    !verify_signature("secret", &mutated, &signature),
                    "mutation at byte {} bit {} was accepted",
                    byte,
                    bit
                );
            }
        }
    }

    #[tokio::test]
    async fn test_signature_header_bit_flips_rejected() {
        let header = format!("sha1={}", sign("secret", b"payload"));
        let request = |value: HeaderValue| {
            Request::builder()
                .method("POST")
                .uri("/hooks/blog")
                .header(SIGNATURE_HEADER, value)
                .body(Full::new(Bytes::from_static(b"payload")))
                .unwrap()
        };

        assert_eq!(
            authenticate(request(HeaderValue::from_str(&header).unwrap()), Some("secret")).await,
            Ok(())
        );

        let mut checked = 0;
        for byte in 0..header.len() {
            for bit in 0..8 {
                let mut mutated = header.clone().into_bytes();
                mutated[byte] ^= 1 << bit;
                // Some flips produce bytes a header cannot carry at all
                let Ok(value) = HeaderValue::from_bytes(&mutated) else {
                    continue;
                };
                assert!(
                    authenticate(request(value), Some("secret")).await.is_err(),
                    "header mutation at byte {} bit {} was accepted",
                    byte,
                    bit
                );
                checked += 1;
            }
        }
        assert!(checked > header.len() * 4);
    }

    #[tokio::test]
    async fn test_authenticate() {
        let body = r#"{"ref":"refs/heads/master"}"#;
        let signature = format!("sha1={}", sign("secret", body.as_bytes()));

        assert_eq!(
            authenticate(hook_request(body, Some(&signature)), Some("secret")).await,
            Ok(())
        );
        assert_eq!(
            authenticate(hook_request(body, None), Some("secret")).await,
            Err(HookRejection::MissingSignature)
        );
        assert_eq!(
            authenticate(hook_request(body, Some(&signature)), None).await,
            Err(HookRejection::NoWebhookToken)
        );
        assert_eq!(
            authenticate(hook_request("{}", Some(&signature)), Some("secret")).await,
            Err(HookRejection::SignatureMismatch)
        );
    }

    #[tokio::test]
    async fn test_authenticate_rejects_oversized_body() {
        let payload = vec![b'a'; MAX_HOOK_BODY + 1];
        let signature = sign("secret", &payload);
        let req = Request::builder()
            .method("POST")
            .uri("/hooks/blog")
            .header(SIGNATURE_HEADER, signature)
            .body(Full::new(Bytes::from(payload)))
            .unwrap();

        assert_eq!(
            authenticate(req, Some("secret")).await,
            Err(HookRejection::BodyTooLarge)
        );
    }

    #[test]
    fn test_deploy_steps() {
        let steps: Vec<String> = deploy_steps("dev").iter().map(|s| s.to_string()).collect();
        assert_eq!(steps, vec!["git pull", "git checkout dev", "npm install"]);
    }

    #[tokio::test]
    async fn test_first_failing_step_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let deployer = Deployer::new(RunAs::CurrentUser);

        let steps = vec![
            sh("touch first"),
            sh("echo boom >&2; exit 3"),
            sh("touch third"),
        ];
        let err = deployer.run(dir.path(), &steps).await.unwrap_err();

        match err {
            EpmError::DeployExecFailed { step, code, stderr } => {
                assert!(step.contains("exit 3"));
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(dir.path().join("first").exists());
        assert!(!dir.path().join("third").exists());
    }

    #[tokio::test]
    async fn test_missing_program_is_exec_failure() {
        let dir = tempfile::tempdir().unwrap();
        let deployer = Deployer::new(RunAs::CurrentUser);
        let steps = vec![DeployStep::new("/nonexistent/epm-deploy-tool", &[])];

        let err = deployer.run(dir.path(), &steps).await.unwrap_err();
        assert!(matches!(err, EpmError::DeployExecFailed { code: None, .. }));
    }

    #[tokio::test]
    async fn test_deploys_for_same_path_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let deployer = Deployer::new(RunAs::CurrentUser);
        let steps = vec![sh("echo start >> log; sleep 0.3; echo end >> log")];

        let (a, b) = tokio::join!(
            deployer.run(dir.path(), &steps),
            deployer.run(dir.path(), &steps)
        );
        a.unwrap();
        b.unwrap();

        let log = std::fs::read_to_string(dir.path().join("log")).unwrap();
        assert_eq!(log, "start\nend\nstart\nend\n");
    }
}
