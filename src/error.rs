//! Error types for repository orchestration.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while registering, updating, installing or removing repositories.
#[derive(Debug, Error)]
pub enum Error {
    /// The remote host has no such repository, ref or file.
    #[error("not found: {0}")]
    NotFound(String),

    /// The remote content has not changed since the last fetch.
    #[error("remote content not modified")]
    NotModified,

    /// The remote API quota is exhausted; retry after `reset`.
    #[error("rate limited by remote host{}", reset_suffix(.reset))]
    RateLimited { reset: Option<DateTime<Utc>> },

    /// Credentials were rejected by the remote host.
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("{full_name} can not be used: {reason}")]
    ArchivedOrBlacklisted { full_name: String, reason: String },

    /// Every reason the repository failed validation, collected in one pass.
    #[error("validation failed for {full_name}: {}", .reasons.join("; "))]
    ValidationFailed {
        full_name: String,
        reasons: Vec<String>,
    },

    #[error("could not download {full_name}: {reason}")]
    DownloadFailed { full_name: String, reason: String },

    /// A queue execution pass is already running.
    #[error("queue execution is still in progress")]
    StillInProgress,

    /// The remote host reports a different id for a repository we already know.
    #[error("repository id for {full_name} changed from {stored} to {incoming}")]
    RepositoryIdChanged {
        full_name: String,
        stored: u64,
        incoming: u64,
    },

    #[error("path {} is blocked from removal", .0.display())]
    ProtectedPath(PathBuf),

    /// Another install, update or uninstall already holds this repository.
    #[error("an operation for repository {0} is already in flight")]
    AlreadyInFlight(u64),

    #[error("{full_name} requires host version {required}, running {current}")]
    Incompatible {
        full_name: String,
        required: String,
        current: String,
    },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("remote host error: {0}")]
    Host(String),

    #[error("failed to {action}")]
    Io {
        action: String,
        #[source]
        source: std::io::Error,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl Error {
    pub fn io(action: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            action: action.into(),
            source,
        }
    }

    pub fn store(err: impl std::fmt::Display) -> Self {
        Error::Store(err.to_string())
    }

    /// Errors that end a whole scheduling cycle instead of a single item.
    pub fn is_quota_failure(&self) -> bool {
        matches!(self, Error::RateLimited { .. } | Error::Authentication(_))
    }

    /// Transient transport failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Store(format!("{:#}", err))
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, Error>;

fn reset_suffix(reset: &Option<DateTime<Utc>>) -> String {
    reset
        .map(|reset| format!(" (resets at {})", reset))
        .unwrap_or_default()
}
