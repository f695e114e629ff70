use crate::error::{GuardError, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "fimguard";
pub const APP_NAME: &str = "fimguard";

pub fn default_data_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| GuardError::Config("cannot determine data directory".into()))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn default_config_file() -> Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| GuardError::Config("cannot determine config directory".into()))?;
    Ok(dirs.config_dir().join("config.json"))
}

/// Layout of everything fimguard persists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn records(&self) -> PathBuf {
        self.root.join("records.sealed")
    }

    pub fn audit_log(&self) -> PathBuf {
        self.root.join("audit.log")
    }

    pub fn safe_mode_state(&self) -> PathBuf {
        self.root.join("safe-mode.sealed")
    }

    pub fn severity_counters(&self) -> PathBuf {
        self.root.join("severity-counters.json")
    }

    pub fn last_verification(&self) -> PathBuf {
        self.root.join("last-verification.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join("fimguard.lock")
    }

    pub fn incidents(&self) -> PathBuf {
        self.root.join("incidents")
    }

    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}
