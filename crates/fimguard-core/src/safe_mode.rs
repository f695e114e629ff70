use crate::atomic::write_atomic;
use crate::crypto::{self, SecretKey};
use crate::error::{GuardError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafeModeReason {
    TamperRecords,
    TamperLog,
    /// The persisted state itself failed authentication.
    StateTampered,
}

impl std::fmt::Display for SafeModeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SafeModeReason::TamperRecords => write!(f, "record store tampered"),
            SafeModeReason::TamperLog => write!(f, "audit log tampered"),
            SafeModeReason::StateTampered => write!(f, "safe mode state tampered"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SafeModeState {
    pub active: bool,
    pub reason: Option<SafeModeReason>,
    pub activated_at: Option<DateTime<Utc>>,
    pub last_incident_id: Option<String>,
}

impl SafeModeState {
    pub fn enter(&mut self, reason: SafeModeReason, incident_id: Option<String>) {
        self.active = true;
        self.reason = Some(reason);
        self.activated_at = Some(Utc::now());
        if incident_id.is_some() {
            self.last_incident_id = incident_id;
        }
    }

    /// Keeps `last_incident_id` for the record.
    pub fn exit(&mut self) {
        self.active = false;
        self.reason = None;
        self.activated_at = None;
    }

    /// Active safe mode for a state that cannot be trusted.
    pub fn untrusted() -> Self {
        let mut state = Self::default();
        state.enter(SafeModeReason::StateTampered, None);
        state
    }
}

/// What was found at the state file's location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafeModeLoad {
    Missing,
    Trusted(SafeModeState),
    /// Unreadable, not authentic or not parseable.
    Untrusted(String),
}

impl SafeModeLoad {
    /// Why the load cannot be trusted, if it cannot. A missing file is only
    /// acceptable before anything was ever logged.
    pub fn untrusted_detail(&self, has_history: bool) -> Option<String> {
        match self {
            SafeModeLoad::Missing if has_history => Some("safe mode state missing".into()),
            SafeModeLoad::Missing | SafeModeLoad::Trusted(_) => None,
            SafeModeLoad::Untrusted(detail) => Some(detail.clone()),
        }
    }

    /// Never fails open.
    pub fn into_state(self, has_history: bool) -> SafeModeState {
        match self {
            SafeModeLoad::Trusted(state) => state,
            SafeModeLoad::Missing if !has_history => SafeModeState::default(),
            SafeModeLoad::Missing | SafeModeLoad::Untrusted(_) => SafeModeState::untrusted(),
        }
    }
}

/// Sealed on-disk home of [`SafeModeState`].
#[derive(Debug, Clone)]
pub struct SafeModeFile {
    path: PathBuf,
    key: SecretKey,
}

impl SafeModeFile {
    pub fn new(path: impl Into<PathBuf>, key: SecretKey) -> Self {
        Self {
            path: path.into(),
            key,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> SafeModeLoad {
        let sealed = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return SafeModeLoad::Missing,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "safe mode state unreadable");
                return SafeModeLoad::Untrusted(format!("unreadable: {e}"));
            }
        };
        let body = match crypto::open(&self.key, &sealed) {
            Ok((_, body)) => body,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "safe mode state failed authentication");
                return SafeModeLoad::Untrusted(e.to_string());
            }
        };
        match serde_json::from_slice(body) {
            Ok(state) => SafeModeLoad::Trusted(state),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "safe mode state does not parse");
                SafeModeLoad::Untrusted(format!("does not parse: {e}"))
            }
        }
    }

    pub fn save(&self, state: &SafeModeState) -> Result<()> {
        let body = serde_json::to_vec(state)?;
        write_atomic(&self.path, &crypto::seal(&self.key, &body)).map_err(GuardError::from)
    }
}
