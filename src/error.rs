use crate::cancel::CancelReason;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the pipeline and its components.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// A pipeline entry named a role that is not registered.
    #[error("role '{0}' is not registered")]
    RoleNotFound(String),

    /// A role invocation failed. Isolated to one `(role, run)` cell.
    #[error("role '{role}' failed: {message}")]
    RoleFailed { role: String, message: String },

    /// The request was cancelled by the caller or by its deadline.
    ///
    /// This is the only variant that aborts a whole pipeline; every other
    /// variant stays local to the stage that raised it.
    #[error("pipeline was cancelled ({0})")]
    Cancelled(CancelReason),

    /// Invalid configuration detected at build time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A request body failed validation before reaching the executor.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// HTTP error with status code, response body, and optional Retry-After hint.
    ///
    /// Returned by [`Backend`](crate::backend::Backend) implementations when
    /// the provider returns a non-success status code.
    #[error("HTTP {status}: {body}")]
    HttpError {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// Model output could not be turned into candidates.
    #[error("could not parse model output: {0}")]
    Parse(String),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// Whether this error is the fatal cancellation marker.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled(_))
    }

    /// Stable machine-readable code used in stage events and wire errors.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Request(_) | PipelineError::HttpError { .. } => "upstream_error",
            PipelineError::Json(_) | PipelineError::Parse(_) => "parse_error",
            PipelineError::RoleNotFound(_) => "role_not_found",
            PipelineError::RoleFailed { .. } => "role_failed",
            PipelineError::Cancelled(CancelReason::TimedOut) => "timeout",
            PipelineError::Cancelled(CancelReason::Aborted) => "aborted",
            PipelineError::InvalidConfig(_) => "invalid_config",
            PipelineError::InvalidRequest(_) => "bad_request",
            PipelineError::Other(_) => "internal",
        }
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
