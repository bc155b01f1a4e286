//! Tagged job failure type.
//!
//! Job runners report failure as a [`JobError`] carrying an explicit
//! [`JobErrorKind`]. The classifier decides lease and status handling from
//! the tag alone, so runners choose the kind at the point where they know
//! what went wrong.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

/// What kind of failure a job hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// The job's input is invalid (parse, encoding, or validation failure).
    /// Retrying cannot succeed.
    Content,
    /// Infrastructure hiccup (network blip, lock contention, resource
    /// temporarily unavailable). Another attempt may succeed.
    Transient,
    /// The execution context died (panic, killed subprocess) before the
    /// job's own error handling could run.
    Crash,
    /// A failure nobody tagged. Kept distinct so operators can see how often
    /// the fallback path is taken.
    Unclassified,
}

impl JobErrorKind {
    /// Returns the lowercase name used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            JobErrorKind::Content => "content",
            JobErrorKind::Transient => "transient",
            JobErrorKind::Crash => "crash",
            JobErrorKind::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure raised by a job runner (or synthesised by the dispatcher when the
/// execution context dies).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct JobError {
    /// Classification tag.
    pub kind: JobErrorKind,
    /// Human-readable message, persisted for operator visibility.
    pub message: String,
    /// Optional diagnostic detail such as a stack trace or stderr tail.
    pub detail: Option<String>,
}

impl JobError {
    /// Creates an error with the given kind and message.
    #[must_use]
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    /// Invalid input; the message will be discarded.
    #[must_use]
    pub fn content(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Content, message)
    }

    /// Retryable infrastructure failure; the message will be redelivered.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Transient, message)
    }

    /// Execution context died.
    #[must_use]
    pub fn crash(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Crash, message)
    }

    /// Failure without a known classification.
    #[must_use]
    pub fn unclassified(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Unclassified, message)
    }

    /// Attaches diagnostic detail (stack trace, stderr tail, ...).
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Text persisted to the status store: the message, followed by the
    /// detail when one is attached.
    #[must_use]
    pub fn status_message(&self) -> String {
        match &self.detail {
            Some(detail) if !detail.trim().is_empty() => {
                format!("{}\n{}", self.message, detail.trim_end())
            }
            _ => self.message.clone(),
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::content(format!("malformed JSON input: {err}"))
    }
}

impl From<std::str::Utf8Error> for JobError {
    fn from(err: std::str::Utf8Error) -> Self {
        JobError::content(format!("invalid UTF-8 input: {err}"))
    }
}

impl From<std::string::FromUtf8Error> for JobError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        JobError::content(format!("invalid UTF-8 input: {err}"))
    }
}

impl From<std::num::ParseIntError> for JobError {
    fn from(err: std::num::ParseIntError) -> Self {
        JobError::content(format!("invalid number: {err}"))
    }
}

impl From<io::Error> for JobError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::InvalidData
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::UnexpectedEof => JobErrorKind::Content,
            io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe => JobErrorKind::Transient,
            _ => JobErrorKind::Unclassified,
        };
        JobError::new(kind, err.to_string())
    }
}
