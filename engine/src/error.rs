//! Error taxonomy for the ingestion pipeline
//!
//! Six kinds, each with its own handling policy: transient I/O retries at
//! the call site, operation failures stay file/module scoped, data issues
//! degrade the document, policy conditions are handled transparently,
//! configuration problems fail fast, and fatal conditions abort the run.

use thiserror::Error;

use crate::types::ErrorRecord;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    /// HTTP 5xx, connection reset, store timeout. Retried with backoff up
    /// to 3 times at the call site, then reclassified as an operation error.
    #[error("transient failure in {context}: {message}")]
    Transient { context: String, message: String },

    /// Parse failure, LLM validation failure after retries, embedding norm
    /// violation after retry. Recorded in `errors[]`; the run continues.
    #[error("{context}: {message}")]
    Operation { context: String, message: String },

    /// File absent at the pinned commit, unnameable symbol. Counted as a
    /// warning; the file still emits a (possibly empty) document.
    #[error("data issue in {context}: {message}")]
    Data { context: String, message: String },

    /// Another pipeline holds the run lock. Clean exit, code 2.
    #[error("already running: pid {pid}, started {started_at}")]
    AlreadyRunning { pid: u32, started_at: String },

    /// Missing or invalid environment. Raised before any I/O, exit code 3.
    #[error("configuration error: {0}")]
    Config(String),

    /// Store unreachable at startup, audit record unwritable. Aborts the
    /// run before any repository work; the lock is still released.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl IngestError {
    pub fn transient(context: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Transient { context: context.into(), message: message.to_string() }
    }

    pub fn operation(context: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Operation { context: context.into(), message: message.to_string() }
    }

    pub fn data(context: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Data { context: context.into(), message: message.to_string() }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Short class name for log lines and audit records
    pub fn class(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "transient",
            Self::Operation { .. } => "operation",
            Self::Data { .. } => "data",
            Self::AlreadyRunning { .. } => "policy",
            Self::Config(_) => "config",
            Self::Fatal(_) => "fatal",
        }
    }

    /// Exhausted retries demote a transient failure to an operation error
    pub fn into_operation(self) -> Self {
        match self {
            Self::Transient { context, message } => Self::Operation { context, message },
            other => other,
        }
    }

    /// Audit-record form: scope + class + message, never a backtrace
    pub fn to_record(&self, scope: impl Into<String>) -> ErrorRecord {
        ErrorRecord {
            scope: scope.into(),
            kind: self.class().to_owned(),
            message: self.to_string(),
        }
    }
}
