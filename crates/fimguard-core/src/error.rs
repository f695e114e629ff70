//! Error taxonomy shared by every fimguard component.

use std::path::PathBuf;
use thiserror::Error;

/// Which authenticated artifact failed its integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TamperTarget {
    Records,
    Log,
    SafeModeState,
}

impl std::fmt::Display for TamperTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TamperTarget::Records => write!(f, "record store"),
            TamperTarget::Log => write!(f, "audit log"),
            TamperTarget::SafeModeState => write!(f, "safe mode state"),
        }
    }
}

#[derive(Error, Debug)]
pub enum GuardError {
    /// Retryable failure that persisted past the hasher's retry budget.
    #[error("transient I/O error on {path} after {attempts} attempts: {source}")]
    TransientIo {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// The file cannot be read at all (missing, persistently denied).
    #[error("cannot access {path}: {source}")]
    Access {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{target} failed authentication at {path}: {detail}")]
    Tampered {
        target: TamperTarget,
        path: PathBuf,
        detail: String,
    },

    #[error("{0} does not exist")]
    Missing(PathBuf),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("snapshot write failed: {0}")]
    SnapshotWrite(String),

    #[error("administrative token rejected")]
    Unauthorized,

    #[error("safe mode is active; reconciliation suspended")]
    SafeModeActive,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GuardError {
    pub fn tampered(target: TamperTarget, path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        GuardError::Tampered {
            target,
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub fn is_tampered(&self) -> bool {
        matches!(self, GuardError::Tampered { .. })
    }
}

pub type Result<T> = std::result::Result<T, GuardError>;
