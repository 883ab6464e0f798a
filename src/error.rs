use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::download::{DownloadKind, TaskId};

/// Rejections raised synchronously by `submit`/`enqueue`. Nothing that fails
/// admission is ever placed in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("download request has no destination")]
    MissingDestination,
    #[error("destination {0:?} is not an absolute path")]
    RelativeDestination(PathBuf),
    #[error("task {0} is already queued or running")]
    Duplicate(TaskId),
    #[error("{kind} downloads cannot be served from a {scheme} source")]
    KindMismatch {
        kind: DownloadKind,
        scheme: &'static str,
    },
}

/// Failure of a single transfer. Always terminal for that task only.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered with status {0}")]
    Status(u16),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no data received for {0:?}")]
    Timeout(Duration),
    #[error("integrity check failed: {0}")]
    Integrity(String),
    #[error("{0}")]
    Other(String),
    /// Raised by a transfer that observed its own cancellation. Reported as a
    /// `Cancelled` terminal event rather than a failure.
    #[error("transfer cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("unsupported link scheme: {0}")]
    UnsupportedScheme(String),
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid magnet link: {0}")]
    InvalidMagnet(String),
    #[error("invalid ed2k link: {0}")]
    InvalidEd2k(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("unknown task {0}")]
    UnknownTask(TaskId),
}
