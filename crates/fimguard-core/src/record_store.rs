//! Authenticated record of file digests.
//!
//! The store is the ground truth the live filesystem is compared against.
//! On disk it is a sealed file (see [`crate::crypto`]) whose body is the
//! compact JSON of `{version, records}`; records are kept in a `BTreeMap` so
//! the serialization is stable.

use crate::atomic::write_atomic;
use crate::crypto::{self, OpenError, SecretKey};
use crate::error::{GuardError, Result, TamperTarget};
use crate::hasher::FileDigest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileRecord {
    pub path: String,
    pub digest: String,
    pub size: u64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordStore {
    pub version: u64,
    pub records: BTreeMap<String, FileRecord>,
    /// Tag of the sealed file this store was loaded from or committed as.
    #[serde(skip)]
    pub signature: Option<String>,
}

/// Declaration order is the emission order: deletions, then modifications,
/// then creations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Deleted,
    Modified,
    Created,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: String,
    pub previous: Option<FileDigest>,
    pub current: Option<FileDigest>,
}

/// Which store paths a live scan speaks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanScope {
    /// The whole watched tree was walked.
    Full,
    /// Only these candidate paths were examined.
    Paths(BTreeSet<String>),
}

#[derive(Debug, Clone)]
pub struct LiveScan {
    scope: ScanScope,
    entries: BTreeMap<String, FileDigest>,
    excluded: BTreeSet<String>,
    subtrees: BTreeSet<String>,
}

impl LiveScan {
    pub fn full() -> Self {
        Self {
            scope: ScanScope::Full,
            entries: BTreeMap::new(),
            excluded: BTreeSet::new(),
            subtrees: BTreeSet::new(),
        }
    }

    pub fn for_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scope: ScanScope::Paths(paths.into_iter().map(Into::into).collect()),
            entries: BTreeMap::new(),
            excluded: BTreeSet::new(),
            subtrees: BTreeSet::new(),
        }
    }

    pub fn insert(&mut self, path: impl Into<String>, digest: FileDigest) {
        self.entries.insert(path.into(), digest);
    }

    /// Drop a path from consideration, e.g. because hashing it failed. An
    /// excluded path never produces an event and keeps its prior record.
    pub fn exclude(&mut self, path: impl Into<String>) {
        let path = path.into();
        self.entries.remove(&path);
        self.excluded.insert(path);
    }

    /// Widen a `Paths` scope to everything below `dir`, e.g. when a watched
    /// directory vanished as a whole.
    pub fn include_subtree(&mut self, dir: impl Into<String>) {
        self.subtrees.insert(dir.into());
    }

    pub fn in_scope(&self, path: &str) -> bool {
        if self.excluded.contains(path) {
            return false;
        }
        match &self.scope {
            ScanScope::Full => true,
            ScanScope::Paths(set) => {
                set.contains(path)
                    || self
                        .subtrees
                        .iter()
                        .any(|dir| Path::new(path).starts_with(Path::new(dir)))
            }
        }
    }

    pub fn scope(&self) -> &ScanScope {
        &self.scope
    }

    pub fn entries(&self) -> &BTreeMap<String, FileDigest> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RecordStore {
    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.records.get(path)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Path → digest view, used for incident snapshots.
    pub fn digests(&self) -> BTreeMap<String, String> {
        self.records
            .iter()
            .map(|(k, r)| (k.clone(), r.digest.clone()))
            .collect()
    }

    /// Compare a live scan against the store. Pure; the store is not touched.
    pub fn reconcile(&self, live: &LiveScan) -> Vec<ChangeEvent> {
        let mut events = Vec::new();

        for (path, digest) in live.entries() {
            if !live.in_scope(path) {
                continue;
            }
            match self.records.get(path) {
                None => events.push(ChangeEvent {
                    kind: ChangeKind::Created,
                    path: path.clone(),
                    previous: None,
                    current: Some(digest.clone()),
                }),
                Some(rec) if rec.digest != digest.digest => events.push(ChangeEvent {
                    kind: ChangeKind::Modified,
                    path: path.clone(),
                    previous: Some(rec.as_digest()),
                    current: Some(digest.clone()),
                }),
                Some(_) => {}
            }
        }

        for (path, rec) in &self.records {
            if live.in_scope(path) && !live.entries().contains_key(path) {
                events.push(ChangeEvent {
                    kind: ChangeKind::Deleted,
                    path: path.clone(),
                    previous: Some(rec.as_digest()),
                    current: None,
                });
            }
        }

        sort_events(&mut events);
        events
    }

    /// Successor store with `events` applied and the version bumped.
    pub fn apply(&self, events: &[ChangeEvent], observed_at: DateTime<Utc>) -> RecordStore {
        let mut next = RecordStore {
            version: self.version + 1,
            records: self.records.clone(),
            signature: None,
        };
        for event in events {
            match (&event.kind, &event.current) {
                (ChangeKind::Deleted, _) => {
                    next.records.remove(&event.path);
                }
                (_, Some(current)) => {
                    next.records.insert(
                        event.path.clone(),
                        FileRecord {
                            path: event.path.clone(),
                            digest: current.digest.clone(),
                            size: current.size,
                            observed_at,
                        },
                    );
                }
                (_, None) => {}
            }
        }
        next
    }

    /// Bytes the authentication tag is computed over.
    pub fn to_body(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl FileRecord {
    fn as_digest(&self) -> FileDigest {
        FileDigest {
            digest: self.digest.clone(),
            size: self.size,
        }
    }
}

/// Deletions, modifications, creations; path order within each kind.
pub fn sort_events(events: &mut [ChangeEvent]) {
    events.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.path.cmp(&b.path)));
}

/// The sealed record file on disk.
#[derive(Debug, Clone)]
pub struct RecordFile {
    path: PathBuf,
    key: SecretKey,
}

impl RecordFile {
    pub fn new(path: impl Into<PathBuf>, key: SecretKey) -> Self {
        Self {
            path: path.into(),
            key,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load and authenticate. A failed check is never repaired here.
    pub fn load(&self) -> Result<RecordStore> {
        let sealed = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GuardError::Missing(self.path.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        let (tag, body) = crypto::open(&self.key, &sealed).map_err(|e| {
            error!(path = %self.path.display(), error = %e, "record store failed authentication");
            GuardError::tampered(TamperTarget::Records, &self.path, e.to_string())
        })?;

        let mut store: RecordStore = serde_json::from_slice(body).map_err(|e| {
            GuardError::tampered(
                TamperTarget::Records,
                &self.path,
                format!("authenticated body does not parse: {e}"),
            )
        })?;
        if let Some((key, _)) = store.records.iter().find(|(k, r)| **k != r.path) {
            return Err(GuardError::tampered(
                TamperTarget::Records,
                &self.path,
                format!("record key {key} disagrees with its path"),
            ));
        }
        store.signature = Some(tag.to_string());
        debug!(
            path = %self.path.display(),
            version = store.version,
            records = store.records.len(),
            "record store loaded"
        );
        Ok(store)
    }

    /// Sign and atomically replace the file. Returns the new tag.
    pub fn commit(&self, store: &RecordStore) -> Result<String> {
        let body = store.to_body()?;
        let tag = crypto::sign(&self.key, &body);
        write_atomic(&self.path, &crypto::seal_with_tag(&tag, &body))?;
        debug!(
            path = %self.path.display(),
            version = store.version,
            "record store committed"
        );
        Ok(tag)
    }

    /// Check authenticity without deserializing the records.
    pub fn verify(&self) -> Result<()> {
        let sealed = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GuardError::Missing(self.path.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        match crypto::open(&self.key, &sealed) {
            Ok(_) => Ok(()),
            Err(e @ (OpenError::Malformed | OpenError::TagMismatch)) => Err(GuardError::tampered(
                TamperTarget::Records,
                &self.path,
                e.to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn d(digest: &str, size: u64) -> FileDigest {
        FileDigest {
            digest: digest.to_string(),
            size,
        }
    }

    fn store_with(entries: &[(&str, &str)]) -> RecordStore {
        let mut live = LiveScan::full();
        for (p, h) in entries {
            live.insert(*p, d(h, 1));
        }
        let empty = RecordStore::default();
        let events = empty.reconcile(&live);
        empty.apply(&events, Utc::now())
    }

    fn key() -> SecretKey {
        SecretKey::from_passphrase("unit-test-secret").unwrap()
    }

    #[test]
    fn reconcile_classifies_created_modified_deleted() {
        let store = store_with(&[("/w/keep", "k"), ("/w/edit", "e1"), ("/w/gone", "g")]);
        let mut live = LiveScan::full();
        live.insert("/w/keep", d("k", 1));
        live.insert("/w/edit", d("e2", 1));
        live.insert("/w/new", d("n", 1));

        let events = store.reconcile(&live);
        let summary: Vec<_> = events.iter().map(|e| (e.kind, e.path.as_str())).collect();
        assert_eq!(
            summary,
            vec![
                (ChangeKind::Deleted, "/w/gone"),
                (ChangeKind::Modified, "/w/edit"),
                (ChangeKind::Created, "/w/new"),
            ]
        );
    }

    #[test]
    fn reconcile_is_idempotent_after_apply() {
        let store = store_with(&[("/w/a", "1"), ("/w/b", "2")]);
        let mut live = LiveScan::full();
        live.insert("/w/a", d("1", 1));
        live.insert("/w/b", d("3", 1));
        live.insert("/w/c", d("4", 1));

        let first = store.reconcile(&live);
        assert_eq!(first.len(), 2);
        let next = store.apply(&first, Utc::now());
        assert_eq!(next.version, store.version + 1);
        assert!(next.reconcile(&live).is_empty());
    }

    #[test]
    fn ordering_is_deterministic_and_path_sorted() {
        let store = store_with(&[("/w/z", "1"), ("/w/y", "1"), ("/w/m", "1"), ("/w/a", "1")]);
        let mut live = LiveScan::full();
        live.insert("/w/m", d("2", 1));
        live.insert("/w/a", d("2", 1));
        live.insert("/w/c", d("1", 1));
        live.insert("/w/b", d("1", 1));

        let expected = vec![
            (ChangeKind::Deleted, "/w/y".to_string()),
            (ChangeKind::Deleted, "/w/z".to_string()),
            (ChangeKind::Modified, "/w/a".to_string()),
            (ChangeKind::Modified, "/w/m".to_string()),
            (ChangeKind::Created, "/w/b".to_string()),
            (ChangeKind::Created, "/w/c".to_string()),
        ];
        for _ in 0..3 {
            let got: Vec<_> = store
                .reconcile(&live)
                .into_iter()
                .map(|e| (e.kind, e.path))
                .collect();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn partial_scope_does_not_infer_unlisted_deletions() {
        let store = store_with(&[("/w/a", "1"), ("/w/b", "1")]);
        let mut live = LiveScan::for_paths(["/w/a"]);
        live.insert("/w/a", d("1", 1));
        assert!(store.reconcile(&live).is_empty());

        let live = LiveScan::for_paths(["/w/b"]);
        let events = store.reconcile(&live);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Deleted);
        assert_eq!(events[0].path, "/w/b");
    }

    #[test]
    fn removed_directory_subtree_is_in_scope() {
        let store = store_with(&[("/w/dir/a", "1"), ("/w/dir/b", "1"), ("/w/dirx", "1")]);
        let mut live = LiveScan::for_paths(["/w/dir"]);
        live.include_subtree("/w/dir");
        let deleted: Vec<_> = store.reconcile(&live).into_iter().map(|e| e.path).collect();
        assert_eq!(deleted, vec!["/w/dir/a", "/w/dir/b"]);
    }

    #[test]
    fn excluded_paths_keep_their_record() {
        let store = store_with(&[("/w/locked", "1")]);
        let mut live = LiveScan::full();
        live.exclude("/w/locked");
        assert!(store.reconcile(&live).is_empty());
    }

    #[test]
    fn commit_then_load_roundtrips() {
        let dir = tempdir().unwrap();
        let file = RecordFile::new(dir.path().join("records.sealed"), key());
        let store = store_with(&[("/w/a", "1"), ("/w/b", "2")]);
        let tag = file.commit(&store).unwrap();
        let loaded = file.load().unwrap();
        assert_eq!(loaded.records, store.records);
        assert_eq!(loaded.version, store.version);
        assert_eq!(loaded.signature.as_deref(), Some(tag.as_str()));
    }

    #[test]
    fn hand_edit_is_detected_as_tamper() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.sealed");
        let file = RecordFile::new(&path, key());
        file.commit(&store_with(&[("/w/a.txt", "aaaa")])).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, text.replace("aaaa", "bbbb")).unwrap();

        let err = file.load().unwrap_err();
        assert!(err.is_tampered());
        assert!(file.verify().unwrap_err().is_tampered());
    }

    #[test]
    fn missing_file_is_reported_as_missing() {
        let dir = tempdir().unwrap();
        let file = RecordFile::new(dir.path().join("absent"), key());
        assert!(matches!(file.load(), Err(GuardError::Missing(_))));
    }
}
