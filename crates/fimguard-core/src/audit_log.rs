//! Authenticated, append-only, size-bounded audit log.
//!
//! Each segment is a sealed file whose body is JSON Lines. The active segment
//! keeps a running HMAC so an append only hashes the new line; the whole
//! segment is then rewritten atomically with the updated tag. Closed segments
//! are renamed to `<base>.1` … `<base>.N` and never rewritten.

use crate::atomic::write_atomic;
use crate::crypto::{self, SecretKey, TagState};
use crate::error::{GuardError, Result, TamperTarget};
use crate::severity::{EventKind, Severity};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

pub const DEFAULT_MAX_SEGMENT_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_BACKUPS: usize = 5;

/// Entries kept in memory for incident snapshots.
const RECENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseAction {
    Logged,
    Alerted,
    SnapshotTaken,
    SafeModeEntered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event_kind: EventKind,
    pub path: Option<String>,
    pub severity: Severity,
    pub response_taken: Vec<ResponseAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
}

/// An entry before the log assigns its sequence number and timestamp.
#[derive(Debug, Clone)]
pub struct EntryDraft {
    pub kind: EventKind,
    pub path: Option<String>,
    pub severity: Severity,
    pub response_taken: Vec<ResponseAction>,
    pub detail: Option<String>,
    pub incident_id: Option<String>,
}

impl EntryDraft {
    pub fn event(kind: EventKind, path: Option<String>, severity: Severity) -> Self {
        Self {
            kind,
            path,
            severity,
            response_taken: vec![ResponseAction::Logged],
            detail: None,
            incident_id: None,
        }
    }

    /// Administrative entries are always INFO.
    pub fn admin(kind: EventKind, detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::event(kind, None, Severity::Info)
        }
    }

    pub fn with_responses(mut self, actions: Vec<ResponseAction>) -> Self {
        self.response_taken = actions;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_incident(mut self, id: impl Into<String>) -> Self {
        self.incident_id = Some(id.into());
        self
    }
}

/// A segment that failed authentication, at open or before an append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogTamperFinding {
    pub segment: PathBuf,
    pub preserved_as: Option<PathBuf>,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentStatus {
    pub path: PathBuf,
    pub authentic: bool,
    pub entries: usize,
    pub detail: Option<String>,
}

impl SegmentStatus {
    fn to_error(&self) -> Option<GuardError> {
        (!self.authentic).then(|| {
            GuardError::tampered(
                TamperTarget::Log,
                &self.path,
                self.detail.clone().unwrap_or_default(),
            )
        })
    }
}

pub struct AuditLog {
    base: PathBuf,
    key: SecretKey,
    max_segment_bytes: u64,
    max_backups: usize,
    inner: Mutex<LogState>,
    findings: Mutex<VecDeque<LogTamperFinding>>,
    tampered_at_open: bool,
}

struct LogState {
    body: Vec<u8>,
    tag: TagState,
    next_seq: u64,
    recent: VecDeque<LogEntry>,
}

impl AuditLog {
    pub fn open(
        base: impl Into<PathBuf>,
        key: SecretKey,
        max_segment_bytes: u64,
        max_backups: usize,
    ) -> Result<Self> {
        let base = base.into();
        let mut finding = None;
        let mut body = Vec::new();
        let mut active_entries = Vec::new();

        if base.exists() {
            match read_segment(&key, &base) {
                Ok((bytes, entries)) => {
                    body = bytes;
                    active_entries = entries;
                }
                Err(detail) => {
                    let preserved = preserve_tampered(&base);
                    error!(
                        path = %base.display(),
                        detail = %detail,
                        preserved = ?preserved,
                        "active audit segment failed authentication"
                    );
                    finding = Some(LogTamperFinding {
                        segment: base.clone(),
                        preserved_as: preserved,
                        detail,
                    });
                }
            }
        }

        // Pull the tail of the newest backup so recent() and sequence numbers
        // continue across the rotation boundary.
        let mut recent: VecDeque<LogEntry> = VecDeque::new();
        if active_entries.len() < RECENT_CAPACITY {
            let newest_backup = path_with_suffix(&base, 1);
            if newest_backup.exists() {
                match read_segment(&key, &newest_backup) {
                    Ok((_, entries)) => recent.extend(entries),
                    Err(detail) => warn!(
                        path = %newest_backup.display(),
                        detail = %detail,
                        "skipping unauthenticated backup segment"
                    ),
                }
            }
        }
        recent.extend(active_entries);
        while recent.len() > RECENT_CAPACITY {
            recent.pop_front();
        }
        let next_seq = recent.back().map(|e| e.seq + 1).unwrap_or(1);

        let mut tag = TagState::new(&key);
        tag.update(&body);

        debug!(
            path = %base.display(),
            next_seq,
            bytes = body.len(),
            "audit log opened"
        );

        Ok(Self {
            base,
            key,
            max_segment_bytes,
            max_backups,
            inner: Mutex::new(LogState {
                body,
                tag,
                next_seq,
                recent,
            }),
            tampered_at_open: finding.is_some(),
            findings: Mutex::new(finding.into_iter().collect()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.base
    }

    /// Oldest unreported tamper condition. Each is returned once.
    pub fn take_tamper_finding(&self) -> Option<LogTamperFinding> {
        self.findings.lock().pop_front()
    }

    /// Whether this log has ever recorded anything, including segments that
    /// were set aside as tampered.
    pub fn has_history(&self) -> bool {
        if self.inner.lock().next_seq > 1 {
            return true;
        }
        self.tampered_at_open || path_with_suffix(&self.base, 1).exists()
    }

    pub fn append(&self, draft: EntryDraft) -> Result<LogEntry> {
        let mut state = self.inner.lock();
        let entry = self.append_locked(&mut state, draft)?;
        if self.should_rotate_locked(&state) {
            self.rotate_locked(&mut state)?;
        }
        Ok(entry)
    }

    pub fn should_rotate(&self) -> bool {
        let state = self.inner.lock();
        self.should_rotate_locked(&state)
    }

    /// Close the active segment and start a new one. Normally driven by
    /// `append`; exposed for administrative use.
    pub fn rotate(&self) -> Result<()> {
        let mut state = self.inner.lock();
        self.rotate_locked(&mut state)
    }

    /// Move a tampered active segment aside as evidence and continue in a
    /// fresh one. Sequence numbers carry on.
    pub fn quarantine_active(&self) -> Option<PathBuf> {
        let mut state = self.inner.lock();
        let preserved = preserve_tampered(&self.base);
        state.body.clear();
        state.tag = TagState::new(&self.key);
        preserved
    }

    /// Move a failing backup segment aside so it is reported once.
    pub fn quarantine_backup(&self, segment: &Path) -> Option<PathBuf> {
        let _state = self.inner.lock();
        if segment == self.base {
            return None;
        }
        preserve_tampered(segment)
    }

    /// Last `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        let state = self.inner.lock();
        let skip = state.recent.len().saturating_sub(n);
        state.recent.iter().skip(skip).cloned().collect()
    }

    /// Check the active segment and every retained backup from disk.
    pub fn verify_signatures(&self) -> Vec<SegmentStatus> {
        let _state = self.inner.lock();
        let mut report = Vec::new();
        let mut segments = vec![self.base.clone()];
        segments.extend((1..=self.max_backups).map(|i| path_with_suffix(&self.base, i)));

        for path in segments {
            if !path.exists() {
                continue;
            }
            let status = match read_segment(&self.key, &path) {
                Ok((_, entries)) => SegmentStatus {
                    path,
                    authentic: true,
                    entries: entries.len(),
                    detail: None,
                },
                Err(detail) => SegmentStatus {
                    path,
                    authentic: false,
                    entries: 0,
                    detail: Some(detail),
                },
            };
            report.push(status);
        }
        report
    }

    /// First failing segment as a `Tampered` error.
    pub fn verify(&self) -> Result<()> {
        match self.verify_signatures().iter().find_map(SegmentStatus::to_error) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn append_locked(&self, state: &mut LogState, draft: EntryDraft) -> Result<LogEntry> {
        self.check_active_locked(state)?;
        let entry = LogEntry {
            seq: state.next_seq,
            timestamp: Utc::now(),
            event_kind: draft.kind,
            path: draft.path,
            severity: draft.severity,
            response_taken: draft.response_taken,
            detail: draft.detail,
            incident_id: draft.incident_id,
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let mut tag = state.tag.clone();
        tag.update(&line);
        let mut body = state.body.clone();
        body.extend_from_slice(&line);
        write_atomic(&self.base, &crypto::seal_with_tag(&tag.finalize_hex(), &body))?;

        state.body = body;
        state.tag = tag;
        state.next_seq += 1;
        state.recent.push_back(entry.clone());
        if state.recent.len() > RECENT_CAPACITY {
            state.recent.pop_front();
        }
        Ok(entry)
    }

    /// The active segment on disk must be exactly what this log last wrote.
    /// Anything else is set aside as evidence and queued as a finding; the
    /// log then continues in a fresh segment.
    fn check_active_locked(&self, state: &mut LogState) -> Result<()> {
        let expected = (!state.body.is_empty())
            .then(|| crypto::seal_with_tag(&state.tag.finalize_hex(), &state.body));
        let detail = match (fs::read(&self.base), expected) {
            (Ok(actual), Some(expected)) if actual == expected => return Ok(()),
            (Err(e), None) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            (Err(e), Some(_)) if e.kind() == std::io::ErrorKind::NotFound => {
                "active segment deleted".to_string()
            }
            (Err(e), _) => return Err(e.into()),
            (Ok(_), Some(_)) => "active segment changed on disk".to_string(),
            (Ok(_), None) => "unexpected active segment on disk".to_string(),
        };

        let preserved = if self.base.exists() {
            preserve_tampered(&self.base)
        } else {
            None
        };
        error!(
            path = %self.base.display(),
            detail = %detail,
            preserved = ?preserved,
            "active audit segment modified outside the log"
        );
        state.body.clear();
        state.tag = TagState::new(&self.key);
        self.findings.lock().push_back(LogTamperFinding {
            segment: self.base.clone(),
            preserved_as: preserved,
            detail,
        });
        Ok(())
    }

    fn should_rotate_locked(&self, state: &LogState) -> bool {
        sealed_len(&state.body) > self.max_segment_bytes
    }

    fn rotate_locked(&self, state: &mut LogState) -> Result<()> {
        let sealed_tag = state.tag.finalize_hex();

        for i in (1..=self.max_backups).rev() {
            let rotated = path_with_suffix(&self.base, i);
            if rotated.exists() {
                if i == self.max_backups {
                    fs::remove_file(&rotated)?;
                } else {
                    fs::rename(&rotated, path_with_suffix(&self.base, i + 1))?;
                }
            }
        }
        if self.base.exists() {
            if self.max_backups == 0 {
                fs::remove_file(&self.base)?;
            } else {
                fs::rename(&self.base, path_with_suffix(&self.base, 1))?;
            }
        }

        state.body.clear();
        state.tag = TagState::new(&self.key);
        info!(path = %self.base.display(), sealed_tag = %sealed_tag, "audit log rotated");

        // Chain generations: the new segment names its predecessor's tag.
        self.append_locked(
            state,
            EntryDraft::admin(EventKind::LogRotated, format!("previous segment tag {sealed_tag}")),
        )?;
        Ok(())
    }
}

fn sealed_len(body: &[u8]) -> u64 {
    (crypto::TAG_HEX_LEN + 1 + body.len()) as u64
}

/// Last `n` entries of the active segment, read without opening the log for
/// writing. Fails with `Tampered` when the segment does not authenticate.
pub fn read_tail(base: &Path, key: &SecretKey, n: usize) -> Result<Vec<LogEntry>> {
    if !base.exists() {
        return Ok(Vec::new());
    }
    let (_, entries) = read_segment(key, base)
        .map_err(|detail| GuardError::tampered(TamperTarget::Log, base, detail))?;
    let skip = entries.len().saturating_sub(n);
    Ok(entries.into_iter().skip(skip).collect())
}

/// Authenticate and parse one segment. The error string is the reason it was
/// rejected.
fn read_segment(key: &SecretKey, path: &Path) -> std::result::Result<(Vec<u8>, Vec<LogEntry>), String> {
    let sealed = fs::read(path).map_err(|e| format!("unreadable: {e}"))?;
    let (_, body) = crypto::open(key, &sealed).map_err(|e| e.to_string())?;
    let mut entries = Vec::new();
    for (n, line) in body.split(|b| *b == b'\n').enumerate() {
        if line.is_empty() {
            continue;
        }
        let entry: LogEntry = serde_json::from_slice(line)
            .map_err(|e| format!("line {} does not parse: {e}", n + 1))?;
        entries.push(entry);
    }
    Ok((body.to_vec(), entries))
}

fn preserve_tampered(base: &Path) -> Option<PathBuf> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let file_name = base.file_name()?.to_string_lossy().to_string();
    let target = base.with_file_name(format!("{file_name}.tampered-{stamp}"));
    match fs::rename(base, &target) {
        Ok(()) => Some(target),
        Err(e) => {
            error!(path = %base.display(), error = %e, "could not set tampered segment aside");
            None
        }
    }
}

pub fn path_with_suffix(base: &Path, index: usize) -> PathBuf {
    let file_name = base
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "audit.log".to_string());
    base.with_file_name(format!("{file_name}.{index}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key() -> SecretKey {
        SecretKey::from_passphrase("audit-test-key").unwrap()
    }

    fn created(path: &str) -> EntryDraft {
        EntryDraft::event(EventKind::Created, Some(path.to_string()), Severity::Info)
    }

    #[test]
    fn append_persists_and_reopens() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("audit.log");
        {
            let log = AuditLog::open(&base, key(), DEFAULT_MAX_SEGMENT_BYTES, 5).unwrap();
            assert!(!log.has_history());
            log.append(created("/w/a")).unwrap();
            log.append(created("/w/b")).unwrap();
        }
        let log = AuditLog::open(&base, key(), DEFAULT_MAX_SEGMENT_BYTES, 5).unwrap();
        assert!(log.take_tamper_finding().is_none());
        assert!(log.has_history());
        let e = log.append(created("/w/c")).unwrap();
        assert_eq!(e.seq, 3);
        let recent = log.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].path.as_deref(), Some("/w/c"));
        assert!(log.verify().is_ok());
    }

    #[test]
    fn crossing_threshold_rotates_exactly_once() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("audit.log");
        let log = AuditLog::open(&base, key(), 1024, 3).unwrap();

        let mut appended = 0;
        while !path_with_suffix(&base, 1).exists() {
            log.append(created(&format!("/w/file-{appended}"))).unwrap();
            appended += 1;
            assert!(appended < 100, "never rotated");
        }
        assert!(!path_with_suffix(&base, 2).exists());
        assert!(!log.should_rotate());

        let active = log.recent(1);
        assert_eq!(active[0].event_kind, EventKind::LogRotated);
        assert!(active[0]
            .detail
            .as_deref()
            .unwrap()
            .starts_with("previous segment tag "));
    }

    #[test]
    fn backups_are_bounded_and_oldest_evicted() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("audit.log");
        let log = AuditLog::open(&base, key(), DEFAULT_MAX_SEGMENT_BYTES, 2).unwrap();

        for round in 0..4 {
            log.append(created(&format!("/w/round-{round}"))).unwrap();
            log.rotate().unwrap();
        }
        assert!(path_with_suffix(&base, 1).exists());
        assert!(path_with_suffix(&base, 2).exists());
        assert!(!path_with_suffix(&base, 3).exists());

        // .2 is the older of the two retained backups
        let older = fs::read_to_string(path_with_suffix(&base, 2)).unwrap();
        let newer = fs::read_to_string(path_with_suffix(&base, 1)).unwrap();
        assert!(older.contains("/w/round-2"));
        assert!(newer.contains("/w/round-3"));

        let statuses = log.verify_signatures();
        assert_eq!(statuses.len(), 3);
        assert!(statuses.iter().all(|s| s.authentic));
    }

    #[test]
    fn sequence_continues_across_rotation_and_reopen() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("audit.log");
        let log = AuditLog::open(&base, key(), DEFAULT_MAX_SEGMENT_BYTES, 5).unwrap();
        log.append(created("/w/a")).unwrap();
        log.rotate().unwrap();
        drop(log);

        let log = AuditLog::open(&base, key(), DEFAULT_MAX_SEGMENT_BYTES, 5).unwrap();
        let e = log.append(created("/w/b")).unwrap();
        assert_eq!(e.seq, 3);
        let kinds: Vec<_> = log.recent(10).iter().map(|e| e.event_kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::Created, EventKind::LogRotated, EventKind::Created]
        );
    }

    #[test]
    fn tampered_active_segment_is_set_aside() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("audit.log");
        {
            let log = AuditLog::open(&base, key(), DEFAULT_MAX_SEGMENT_BYTES, 5).unwrap();
            log.append(created("/w/a")).unwrap();
        }
        let text = fs::read_to_string(&base).unwrap();
        fs::write(&base, text.replace("/w/a", "/w/z")).unwrap();

        let log = AuditLog::open(&base, key(), DEFAULT_MAX_SEGMENT_BYTES, 5).unwrap();
        let finding = log.take_tamper_finding().expect("tamper finding");
        let preserved = finding.preserved_as.expect("evidence kept");
        assert!(preserved.exists());
        assert!(log.has_history());
        assert!(!base.exists());

        log.append(created("/w/b")).unwrap();
        assert!(log.verify().is_ok());
    }

    #[test]
    fn live_tamper_is_quarantined_not_overwritten() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("audit.log");
        let log = AuditLog::open(&base, key(), DEFAULT_MAX_SEGMENT_BYTES, 5).unwrap();
        log.append(created("/w/a")).unwrap();

        let text = fs::read_to_string(&base).unwrap();
        fs::write(&base, text.replace("/w/a", "/w/q")).unwrap();
        assert!(log.verify().is_err());

        let preserved = log.quarantine_active().unwrap();
        assert!(fs::read_to_string(&preserved).unwrap().contains("/w/q"));
        let next = log.append(created("/w/b")).unwrap();
        assert_eq!(next.seq, 2);
        assert!(log.verify().is_ok());
    }

    #[test]
    fn append_after_outside_edit_keeps_the_evidence() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("audit.log");
        let log = AuditLog::open(&base, key(), DEFAULT_MAX_SEGMENT_BYTES, 5).unwrap();
        log.append(created("/w/a")).unwrap();

        let text = fs::read_to_string(&base).unwrap();
        fs::write(&base, text.replace("CREATED", "DELETED")).unwrap();

        let next = log.append(created("/w/b")).unwrap();
        assert_eq!(next.seq, 2);
        let finding = log.take_tamper_finding().expect("edit detected");
        assert_eq!(finding.segment, base);
        let evidence = fs::read_to_string(finding.preserved_as.unwrap()).unwrap();
        assert!(evidence.contains("DELETED"));
        assert!(log.take_tamper_finding().is_none());

        // The fresh segment holds only the new entry.
        let active = fs::read_to_string(&base).unwrap();
        assert!(active.contains("/w/b"));
        assert!(!active.contains("/w/a"));
        assert!(log.verify().is_ok());

        fs::remove_file(&base).unwrap();
        log.append(created("/w/c")).unwrap();
        let finding = log.take_tamper_finding().expect("deletion detected");
        assert!(finding.preserved_as.is_none());
        assert_eq!(finding.detail, "active segment deleted");
    }

    #[test]
    fn edited_backup_fails_verification() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("audit.log");
        let log = AuditLog::open(&base, key(), DEFAULT_MAX_SEGMENT_BYTES, 5).unwrap();
        log.append(created("/w/a")).unwrap();
        log.rotate().unwrap();

        let backup = path_with_suffix(&base, 1);
        let text = fs::read_to_string(&backup).unwrap();
        fs::write(&backup, text.replace("CREATED", "DELETED")).unwrap();

        let statuses = log.verify_signatures();
        let bad: Vec<_> = statuses.iter().filter(|s| !s.authentic).collect();
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].path, backup);
        assert!(log.verify().unwrap_err().is_tampered());

        let preserved = log.quarantine_backup(&backup).unwrap();
        assert!(preserved.exists());
        assert!(log.verify().is_ok());
        assert!(log.quarantine_backup(&base).is_none());
    }

    #[test]
    fn read_tail_authenticates_without_opening() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("audit.log");
        assert!(read_tail(&base, &key(), 5).unwrap().is_empty());

        let log = AuditLog::open(&base, key(), DEFAULT_MAX_SEGMENT_BYTES, 5).unwrap();
        for p in ["/w/a", "/w/b", "/w/c"] {
            log.append(created(p)).unwrap();
        }
        let tail = read_tail(&base, &key(), 2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1].path.as_deref(), Some("/w/c"));

        let other = SecretKey::from_passphrase("someone-else").unwrap();
        assert!(read_tail(&base, &other, 2).unwrap_err().is_tampered());
    }
}
