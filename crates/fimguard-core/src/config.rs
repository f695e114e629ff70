use crate::audit_log::{DEFAULT_MAX_BACKUPS, DEFAULT_MAX_SEGMENT_BYTES};
use crate::crypto::SecretKey;
use crate::error::{GuardError, Result};
use crate::hasher::{Hasher, DEFAULT_CHUNK_SIZE, DEFAULT_RETRIES};
use crate::paths::{default_data_dir, DataPaths};
use crate::severity::DEFAULT_DELETION_BURST_THRESHOLD;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_SECRET_KEY: &str = "FIMGUARD_SECRET_KEY";
pub const ENV_ADMIN_TOKEN: &str = "FIMGUARD_ADMIN_TOKEN";

/// File-name substrings of editor swap files, partial downloads and similar
/// noise. Matched case-insensitively against file names only.
pub const DEFAULT_IGNORE_PATTERNS: &[&str] =
    &[".tmp", ".part", ".crdownload", ".ds_store", ".swp", ".bak", "~"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    Poll,
    Notify,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub watch_path: PathBuf,
    pub watch_mode: WatchMode,
    pub poll_interval_seconds: u64,
    pub verify_interval_seconds: u64,
    pub max_log_segment_bytes: u64,
    pub max_backup_segments: usize,
    pub deletion_burst_threshold: usize,
    pub secret_key: String,
    pub admin_token: String,
    pub snapshot_history_depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    pub hash_chunk_size: usize,
    pub hash_retries: u32,
    pub hash_retry_delay_ms: u64,
    pub debounce_ms: u64,
    pub alert_timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub ignore_patterns: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watch_path: PathBuf::new(),
            watch_mode: WatchMode::Notify,
            poll_interval_seconds: 5,
            verify_interval_seconds: 300,
            max_log_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
            max_backup_segments: DEFAULT_MAX_BACKUPS,
            deletion_burst_threshold: DEFAULT_DELETION_BURST_THRESHOLD,
            secret_key: String::new(),
            admin_token: String::new(),
            snapshot_history_depth: 10,
            data_dir: None,
            hash_chunk_size: DEFAULT_CHUNK_SIZE,
            hash_retries: DEFAULT_RETRIES,
            hash_retry_delay_ms: 200,
            debounce_ms: 250,
            alert_timeout_ms: 5000,
            webhook_url: None,
            ignore_patterns: DEFAULT_IGNORE_PATTERNS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("watch_path", &self.watch_path)
            .field("watch_mode", &self.watch_mode)
            .field("data_dir", &self.data_dir)
            .field("secret_key", &"<redacted>")
            .field("admin_token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Read, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            GuardError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_json(&text)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| GuardError::Config(format!("invalid config: {e}")))
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var(ENV_SECRET_KEY) {
            if !secret.is_empty() {
                self.secret_key = secret;
            }
        }
        // The admin token variable is also how the CLI presents a token, so
        // it may only fill a token the file leaves unset.
        if self.admin_token.is_empty() {
            if let Ok(token) = std::env::var(ENV_ADMIN_TOKEN) {
                self.admin_token = token;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.watch_path.as_os_str().is_empty() {
            return Err(GuardError::Config("watchPath is required".into()));
        }
        if !self.watch_path.is_dir() {
            return Err(GuardError::Config(format!(
                "watchPath {} is not a directory",
                self.watch_path.display()
            )));
        }
        if self.secret_key.is_empty() {
            return Err(GuardError::Config(format!(
                "secretKey is required (or set {ENV_SECRET_KEY})"
            )));
        }
        if self.admin_token.is_empty() {
            return Err(GuardError::Config(format!(
                "adminToken is required (or set {ENV_ADMIN_TOKEN})"
            )));
        }
        if self.watch_mode == WatchMode::Poll && self.poll_interval_seconds == 0 {
            return Err(GuardError::Config("pollIntervalSeconds must be positive".into()));
        }
        if self.verify_interval_seconds == 0 {
            return Err(GuardError::Config("verifyIntervalSeconds must be positive".into()));
        }
        if self.max_log_segment_bytes < 1024 {
            return Err(GuardError::Config("maxLogSegmentBytes must be at least 1024".into()));
        }
        if self.hash_chunk_size == 0 || self.hash_retries == 0 {
            return Err(GuardError::Config(
                "hashChunkSize and hashRetries must be positive".into(),
            ));
        }
        if let Some(url) = &self.webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(GuardError::Config(format!("webhookUrl {url} is not http(s)")));
            }
        }
        if let Some(data_dir) = &self.data_dir {
            if data_dir.starts_with(&self.watch_path) {
                return Err(GuardError::Config(
                    "dataDir must not live inside watchPath".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn secret(&self) -> Result<SecretKey> {
        SecretKey::from_passphrase(&self.secret_key)
    }

    pub fn data_paths(&self) -> Result<DataPaths> {
        let root = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => default_data_dir()?,
        };
        Ok(DataPaths::new(root))
    }

    pub fn hasher(&self) -> Hasher {
        Hasher::new(
            self.hash_chunk_size,
            self.hash_retries,
            Duration::from_millis(self.hash_retry_delay_ms),
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn verify_interval(&self) -> Duration {
        Duration::from_secs(self.verify_interval_seconds)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn alert_timeout(&self) -> Duration {
        Duration::from_millis(self.alert_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_keys_take_defaults() {
        let cfg = Config::from_json(r#"{"watchPath":"/srv/www","secretKey":"k"}"#).unwrap();
        assert_eq!(cfg.watch_mode, WatchMode::Notify);
        assert_eq!(cfg.poll_interval_seconds, 5);
        assert_eq!(cfg.verify_interval_seconds, 300);
        assert_eq!(cfg.max_log_segment_bytes, 10 * 1024 * 1024);
        assert_eq!(cfg.max_backup_segments, 5);
        assert_eq!(cfg.deletion_burst_threshold, 3);
        assert_eq!(cfg.snapshot_history_depth, 10);
        assert_eq!(cfg.debounce_ms, 250);
        assert!(cfg.ignore_patterns.iter().any(|p| p == ".swp"));
    }

    #[test]
    fn validate_rejects_incomplete_config() {
        let dir = tempdir().unwrap();
        let mut cfg = Config {
            watch_path: dir.path().to_path_buf(),
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(GuardError::Config(_))));
        cfg.secret_key = "s3cret".into();
        assert!(cfg.validate().is_err());
        cfg.admin_token = "admin".into();
        cfg.validate().unwrap();

        cfg.webhook_url = Some("ftp://example".into());
        assert!(cfg.validate().is_err());
        cfg.webhook_url = None;

        cfg.verify_interval_seconds = 0;
        assert!(matches!(cfg.validate(), Err(GuardError::Config(_))));
        cfg.verify_interval_seconds = 300;

        cfg.data_dir = Some(dir.path().join("state"));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn watch_mode_spelling() {
        let cfg = Config::from_json(r#"{"watchMode":"poll"}"#).unwrap();
        assert_eq!(cfg.watch_mode, WatchMode::Poll);
        assert!(Config::from_json(r#"{"watchMode":"inotify"}"#).is_err());
    }

    #[test]
    fn debug_output_hides_secrets() {
        let cfg = Config {
            secret_key: "hunter2".into(),
            admin_token: "letmein".into(),
            ..Config::default()
        };
        let shown = format!("{cfg:?}");
        assert!(!shown.contains("hunter2"));
        assert!(!shown.contains("letmein"));
    }
}
