use crate::record_store::{ChangeEvent, ChangeKind};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DELETION_BURST_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "INFO",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// Kinds of audit log entries. The first five are classified events; the
/// rest are administrative and always logged at INFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Created,
    Modified,
    Deleted,
    TamperRecords,
    TamperLog,
    BaselineCreated,
    MonitorStarted,
    MonitorStopped,
    VerificationCompleted,
    LogRotated,
    SafeModeCleared,
}

impl EventKind {
    pub fn is_administrative(self) -> bool {
        !matches!(
            self,
            EventKind::Created
                | EventKind::Modified
                | EventKind::Deleted
                | EventKind::TamperRecords
                | EventKind::TamperLog
        )
    }

    pub fn is_tamper(self) -> bool {
        matches!(self, EventKind::TamperRecords | EventKind::TamperLog)
    }
}

impl From<ChangeKind> for EventKind {
    fn from(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::Created => EventKind::Created,
            ChangeKind::Modified => EventKind::Modified,
            ChangeKind::Deleted => EventKind::Deleted,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Same spelling as the serialized form.
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default();
        f.write_str(&s)
    }
}

/// Maps events to severities. Stateless apart from the burst threshold.
#[derive(Debug, Clone, Copy)]
pub struct Classifier {
    deletion_burst_threshold: usize,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(DEFAULT_DELETION_BURST_THRESHOLD)
    }
}

impl Classifier {
    pub fn new(deletion_burst_threshold: usize) -> Self {
        Self {
            deletion_burst_threshold,
        }
    }

    /// `deletions_in_batch` only matters for `Deleted`.
    pub fn classify(&self, kind: EventKind, deletions_in_batch: usize) -> Severity {
        match kind {
            EventKind::Created => Severity::Info,
            EventKind::Modified => Severity::Medium,
            EventKind::Deleted if deletions_in_batch > self.deletion_burst_threshold => Severity::High,
            EventKind::Deleted => Severity::Medium,
            EventKind::TamperRecords | EventKind::TamperLog => Severity::Critical,
            _ => Severity::Info,
        }
    }

    /// Severity per event, in the same order as `events`.
    pub fn classify_batch(&self, events: &[ChangeEvent]) -> Vec<Severity> {
        let deletions = events
            .iter()
            .filter(|e| e.kind == ChangeKind::Deleted)
            .count();
        events
            .iter()
            .map(|e| self.classify(e.kind.into(), deletions))
            .collect()
    }
}
