//! Write-once incident snapshots.
//!
//! A snapshot captures the entry that triggered a HIGH or CRITICAL response,
//! the entries preceding it and the digests the record store held at that
//! moment. Snapshots are never rewritten; each lands in its own file under
//! the incidents directory, with an adjacent `_forensic/` directory holding
//! copies of the evidence files.

use crate::atomic::write_once;
use crate::audit_log::LogEntry;
use crate::error::{GuardError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentSnapshot {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub triggering_entry: LogEntry,
    pub preceding_entries: Vec<LogEntry>,
    pub file_digests_at_time: BTreeMap<String, String>,
}

impl IncidentSnapshot {
    pub fn new(
        triggering_entry: LogEntry,
        preceding_entries: Vec<LogEntry>,
        file_digests_at_time: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: new_incident_id(),
            timestamp: Utc::now(),
            triggering_entry,
            preceding_entries,
            file_digests_at_time,
        }
    }

    fn file_stem(&self) -> String {
        format!(
            "incident_{}_{}",
            self.timestamp.format("%Y-%m-%d_%H-%M-%S"),
            self.id
        )
    }
}

pub fn new_incident_id() -> String {
    Uuid::new_v4().to_string()
}

/// Destination for incident snapshots.
pub trait SnapshotWriter: Send + Sync {
    fn write_snapshot(&self, snapshot: &IncidentSnapshot) -> Result<PathBuf>;
}

/// Writes snapshots as JSON and copies evidence files next to them.
#[derive(Debug, Clone)]
pub struct ForensicSnapshotWriter {
    dir: PathBuf,
    evidence: Vec<PathBuf>,
}

impl ForensicSnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            evidence: Vec::new(),
        }
    }

    /// Files copied into the forensic directory of every snapshot.
    pub fn with_evidence(mut self, files: impl IntoIterator<Item = PathBuf>) -> Self {
        self.evidence.extend(files);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot files present in the incidents directory, oldest first.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut found = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_snapshot = path.extension().map(|e| e == "json").unwrap_or(false)
                && path
                    .file_name()
                    .map(|n| n.to_string_lossy().starts_with("incident_"))
                    .unwrap_or(false);
            if is_snapshot {
                found.push(path);
            }
        }
        found.sort();
        Ok(found)
    }

    fn copy_evidence(&self, stem: &str) {
        let forensic_dir = self.dir.join(format!("{stem}_forensic"));
        if let Err(e) = fs::create_dir_all(&forensic_dir) {
            warn!(path = %forensic_dir.display(), error = %e, "forensic directory not created");
            return;
        }
        for file in &self.evidence {
            let Some(name) = file.file_name() else {
                continue;
            };
            if !file.exists() {
                continue;
            }
            if let Err(e) = fs::copy(file, forensic_dir.join(name)) {
                warn!(path = %file.display(), error = %e, "forensic copy failed");
            }
        }
    }
}

impl SnapshotWriter for ForensicSnapshotWriter {
    fn write_snapshot(&self, snapshot: &IncidentSnapshot) -> Result<PathBuf> {
        let stem = snapshot.file_stem();
        let path = self.dir.join(format!("{stem}.json"));
        let body = serde_json::to_vec_pretty(snapshot)?;
        write_once(&path, &body)
            .map_err(|e| GuardError::SnapshotWrite(format!("{}: {e}", path.display())))?;
        self.copy_evidence(&stem);
        info!(
            incident = %snapshot.id,
            path = %path.display(),
            kind = %snapshot.triggering_entry.event_kind,
            "incident snapshot written"
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit_log::ResponseAction;
    use crate::severity::{EventKind, Severity};
    use tempfile::tempdir;

    fn entry(seq: u64, kind: EventKind) -> LogEntry {
        LogEntry {
            seq,
            timestamp: Utc::now(),
            event_kind: kind,
            path: None,
            severity: Severity::Critical,
            response_taken: vec![ResponseAction::Logged],
            detail: None,
            incident_id: None,
        }
    }

    #[test]
    fn snapshot_is_written_once_with_evidence() {
        let dir = tempdir().unwrap();
        let evidence = dir.path().join("records.sealed");
        fs::write(&evidence, b"sealed bytes").unwrap();
        let writer = ForensicSnapshotWriter::new(dir.path().join("incidents"))
            .with_evidence(vec![evidence, dir.path().join("absent.log")]);

        let mut digests = BTreeMap::new();
        digests.insert("/w/a.txt".to_string(), "abc".to_string());
        let snap = IncidentSnapshot::new(
            entry(5, EventKind::TamperRecords),
            vec![entry(3, EventKind::Created), entry(4, EventKind::Modified)],
            digests,
        );

        let path = writer.write_snapshot(&snap).unwrap();
        let parsed: IncidentSnapshot =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed, snap);

        let stem = path.file_stem().unwrap().to_string_lossy().to_string();
        let copied = writer.dir().join(format!("{stem}_forensic")).join("records.sealed");
        assert_eq!(fs::read(copied).unwrap(), b"sealed bytes");

        assert!(matches!(
            writer.write_snapshot(&snap),
            Err(GuardError::SnapshotWrite(_))
        ));
        assert_eq!(writer.list().unwrap(), vec![path]);
    }
}
