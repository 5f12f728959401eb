//! Error taxonomy and JSON error responses for the router

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;

/// Errors raised by orchestration actions and the supervisor daemon
#[derive(Debug, thiserror::Error)]
pub enum EpmError {
    /// The config registry does not exist yet or cannot be read
    #[error("cannot read config registry {path}: {source}")]
    RegistryUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config registry could not be created or rewritten
    #[error("cannot write config registry {path}: {source}")]
    RegistryWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A config file failed to parse or validate
    #[error("invalid config {path}: {detail}")]
    ConfigInvalid { path: PathBuf, detail: String },

    /// The supervisor daemon could not be reached
    #[error("cannot connect to supervisor: {0}")]
    SupervisorConnectFailed(String),

    /// The supervisor daemon rejected a request
    #[error("supervisor rejected request: {0}")]
    SupervisorStartFailed(String),

    /// A deploy step exited unsuccessfully or could not be spawned
    #[error("deploy step `{step}` failed (exit code {code:?}): {stderr}")]
    DeployExecFailed {
        step: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EpmError {
    /// Process exit status the CLI reports for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            EpmError::SupervisorConnectFailed(_) => 2,
            _ => 1,
        }
    }

    pub(crate) fn config_invalid(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        EpmError::ConfigInvalid {
            path: path.into(),
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EpmError>;

/// Error codes for router errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Failed to connect to backend
    ConnectionFailed,
    /// Internal router error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
