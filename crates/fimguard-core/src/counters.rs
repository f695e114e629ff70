use crate::atomic::write_atomic;
use crate::error::Result;
use crate::severity::Severity;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::warn;

/// Running totals of handled events per severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SeverityCounters {
    pub info: u64,
    pub medium: u64,
    pub high: u64,
    pub critical: u64,
}

impl SeverityCounters {
    pub fn bump(&mut self, severity: Severity) {
        *self.slot(severity) += 1;
    }

    pub fn get(&self, severity: Severity) -> u64 {
        match severity {
            Severity::Info => self.info,
            Severity::Medium => self.medium,
            Severity::High => self.high,
            Severity::Critical => self.critical,
        }
    }

    pub fn total(&self) -> u64 {
        self.info + self.medium + self.high + self.critical
    }

    fn slot(&mut self, severity: Severity) -> &mut u64 {
        match severity {
            Severity::Info => &mut self.info,
            Severity::Medium => &mut self.medium,
            Severity::High => &mut self.high,
            Severity::Critical => &mut self.critical,
        }
    }

    /// Counters are informational; an unreadable file starts from zero.
    pub fn load(path: &Path) -> Self {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "severity counters reset");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, &serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn bump_and_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("severity-counters.json");
        let mut c = SeverityCounters::load(&path);
        assert_eq!(c.total(), 0);
        c.bump(Severity::High);
        c.bump(Severity::High);
        c.bump(Severity::Info);
        c.save(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"HIGH\": 2"));
        let reloaded = SeverityCounters::load(&path);
        assert_eq!(reloaded.get(Severity::High), 2);
        assert_eq!(reloaded.total(), 3);
    }

    #[test]
    fn garbage_file_starts_from_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("severity-counters.json");
        fs::write(&path, b"not json").unwrap();
        assert_eq!(SeverityCounters::load(&path), SeverityCounters::default());
    }
}
