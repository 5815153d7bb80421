//! Error types for congregate-sync.

use std::path::PathBuf;

use thiserror::Error;

use congregate_core::{ConfigError, EntityKind};

/// Failure of a single outbound HTTP call.
///
/// The transport retries `Transient` failures itself; callers only ever see
/// `Permanent` once the retry budget is spent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// 429, 5xx, or a connection-level failure.
    #[error("{method} {url} => {} {detail} (transient)", status_text(.status))]
    Transient {
        method: String,
        url: String,
        status: Option<u16>,
        detail: String,
    },

    /// Any other 4xx, or retries exhausted.
    #[error("{method} {url} => {} {detail}", status_text(.status))]
    Permanent {
        method: String,
        url: String,
        status: Option<u16>,
        detail: String,
    },
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient { .. })
    }

    /// HTTP status of the final response, if there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Transient { status, .. } | TransportError::Permanent { status, .. } => {
                *status
            }
        }
    }

    /// Reclassify as permanent (used when the retry ceiling is reached).
    pub(crate) fn into_permanent(self) -> Self {
        match self {
            TransportError::Transient {
                method,
                url,
                status,
                detail,
            } => TransportError::Permanent {
                method,
                url,
                status,
                detail,
            },
            permanent => permanent,
        }
    }
}

fn status_text(status: &Option<u16>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "no response".to_string(),
    }
}

/// A single pulled record that could not be mapped. Never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{system} {kind} {record}: {reason}")]
pub struct MappingError {
    pub system: &'static str,
    pub kind: EntityKind,
    /// Identifier of the offending record, or `<unknown>`.
    pub record: String,
    pub reason: String,
}

/// All errors that can abort a sync run.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Permanent transport failure on a read.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Pre-flight check against one system failed; nothing was read or written.
    #[error("{system} connectivity check failed: {source}")]
    Connectivity {
        system: &'static str,
        #[source]
        source: Box<SyncError>,
    },

    /// The destination rejected a write batch; the direction is aborted.
    #[error("{system} rejected {kind} write batch: {reason}")]
    Batch {
        system: &'static str,
        kind: EntityKind,
        reason: String,
    },

    /// A response did not have the expected shape.
    #[error("unexpected {system} response: {detail}")]
    Decode {
        system: &'static str,
        detail: String,
    },

    /// A query command reported failure.
    #[error("{system} query failed: {detail}")]
    Remote {
        system: &'static str,
        detail: String,
    },

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error (cursor store).
    #[error("cursor store JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A pull worker thread panicked.
    #[error("{0} worker panicked")]
    Worker(&'static str),
}

impl SyncError {
    pub(crate) fn batch(system: &'static str, kind: EntityKind, reason: impl ToString) -> Self {
        SyncError::Batch {
            system,
            kind,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn decode(system: &'static str, detail: impl ToString) -> Self {
        SyncError::Decode {
            system,
            detail: detail.to_string(),
        }
    }
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
