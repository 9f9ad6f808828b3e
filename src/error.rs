//! Failure taxonomy shared by every runtime step.
//!
//! Library functions return `anyhow::Result` and attach context at I/O
//! boundaries. The typed [`RuntimeError`] sits at the root of the chain so
//! callers can tell a misconfigured runtime from a broken input jar without
//! string matching.

use std::fmt;
use thiserror::Error;

/// Typed root cause for runtime failures.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Raised before any step executes: unknown adapter target, missing
    /// specification field, malformed bundle listing.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A referenced file or embedded entry does not exist.
    #[error("missing resource: {0}")]
    MissingResource(String),

    /// An archive or listing could not be interpreted.
    #[error("format error: {0}")]
    Format(String),

    /// An external tool exited unsuccessfully.
    #[error("tool '{tool}' failed with exit code {code:?}: {detail}")]
    ToolExecution {
        tool: String,
        code: Option<i32>,
        detail: String,
    },
}

/// Coarse classification of a [`RuntimeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    MissingResource,
    Format,
    ToolExecution,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "configuration"),
            ErrorKind::MissingResource => write!(f, "missing-resource"),
            ErrorKind::Format => write!(f, "format"),
            ErrorKind::ToolExecution => write!(f, "tool-execution"),
        }
    }
}

impl RuntimeError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        RuntimeError::Configuration(msg.into())
    }

    pub fn missing(msg: impl Into<String>) -> Self {
        RuntimeError::MissingResource(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        RuntimeError::Format(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::Configuration(_) => ErrorKind::Configuration,
            RuntimeError::MissingResource(_) => ErrorKind::MissingResource,
            RuntimeError::Format(_) => ErrorKind::Format,
            RuntimeError::ToolExecution { .. } => ErrorKind::ToolExecution,
        }
    }

    /// Find the first typed runtime error anywhere in an `anyhow` chain.
    pub fn classify(err: &anyhow::Error) -> Option<ErrorKind> {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<RuntimeError>())
            .map(RuntimeError::kind)
    }
}
