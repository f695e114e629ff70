//! Directory walking and live-scan construction.
//!
//! The scanner walks the watched tree (or a set of candidate paths from the
//! watcher), hashes every regular file through the core `Hasher`, and builds
//! the `LiveScan` the record store reconciles against. Files that cannot be
//! hashed are reported per path and excluded from the scan scope.

use anyhow::{Context, Result};
use fimguard_core::hasher::Hasher;
use fimguard_core::record_store::LiveScan;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanError {
    pub path: String,
    pub error: String,
}

/// File names and directories that are never observed, hashed or recorded.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    patterns: Vec<String>,
    excluded_roots: Vec<PathBuf>,
}

impl IgnoreRules {
    pub fn new(patterns: &[String], excluded_roots: Vec<PathBuf>) -> Self {
        Self {
            patterns: patterns
                .iter()
                .filter(|p| !p.is_empty())
                .map(|p| p.to_lowercase())
                .collect(),
            excluded_roots: excluded_roots
                .into_iter()
                .map(|p| p.canonicalize().unwrap_or(p))
                .collect(),
        }
    }

    /// Inside one of the excluded roots (the data directory). Applies to
    /// directories as well as files.
    pub fn is_excluded(&self, path: &Path) -> bool {
        self.excluded_roots.iter().any(|root| path.starts_with(root))
    }

    /// Excluded, or a file whose name contains one of the patterns. The
    /// caller knows `path` names a file.
    pub fn is_ignored_file(&self, path: &Path) -> bool {
        if self.is_excluded(path) {
            return true;
        }
        let Some(name) = path.file_name() else {
            return false;
        };
        let name = name.to_string_lossy().to_lowercase();
        self.patterns.iter().any(|p| name.contains(p.as_str()))
    }

    /// Whether a path reported by a change source is skipped. Patterns only
    /// apply to regular files; a vanished path stays visible so its records
    /// can be reconciled.
    pub fn is_ignored(&self, path: &Path) -> bool {
        if self.is_excluded(path) {
            return true;
        }
        path.is_file() && self.is_ignored_file(path)
    }
}

#[derive(Debug, Clone)]
pub struct TreeScan {
    pub live: LiveScan,
    pub errors: Vec<ScanError>,
}

#[derive(Debug, Clone)]
pub struct Scanner {
    root: PathBuf,
    hasher: Hasher,
    ignore: IgnoreRules,
}

impl Scanner {
    pub fn new(root: &Path, hasher: Hasher, ignore: IgnoreRules) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("watch path {} is not accessible", root.display()))?;
        Ok(Self {
            root,
            hasher,
            ignore,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ignore_rules(&self) -> &IgnoreRules {
        &self.ignore
    }

    /// Record key for a path: absolute, with symlinks in existing ancestors
    /// resolved. Works for paths that no longer exist.
    pub fn key_for(&self, path: &Path) -> String {
        normalize(&self.root, path).display().to_string()
    }

    /// Regular files under the root, excluding ignored ones.
    pub fn collect_files(&self) -> Vec<PathBuf> {
        collect_under(&self.root, &self.ignore)
    }

    /// Walk and hash the whole tree.
    pub fn scan_full(&self) -> TreeScan {
        let files = self.collect_files();
        debug!(root = %self.root.display(), files = files.len(), "full scan");
        self.hash_into(LiveScan::full(), files)
    }

    /// Hash only the candidate paths proposed by the watcher. Candidates that
    /// no longer exist stay in scope so tracked ones become deletions; a
    /// vanished directory brings its whole subtree into scope. The root as a
    /// candidate means a full scan.
    pub fn scan_paths(&self, candidates: &[PathBuf]) -> TreeScan {
        if candidates.iter().any(|c| normalize(&self.root, c) == self.root) {
            return self.scan_full();
        }
        let mut keys = Vec::new();
        let mut files = Vec::new();
        let mut vanished = Vec::new();

        for candidate in candidates {
            let path = normalize(&self.root, candidate);
            if !path.starts_with(&self.root) || self.ignore.is_ignored(&path) {
                continue;
            }
            if path.is_file() {
                keys.push(path.display().to_string());
                files.push(path);
            } else if path.is_dir() {
                for file in collect_under(&path, &self.ignore) {
                    keys.push(file.display().to_string());
                    files.push(file);
                }
            } else {
                keys.push(path.display().to_string());
                vanished.push(path.display().to_string());
            }
        }

        let mut live = LiveScan::for_paths(keys);
        for dir in vanished {
            live.include_subtree(dir);
        }
        self.hash_into(live, files)
    }

    fn hash_into(&self, mut live: LiveScan, files: Vec<PathBuf>) -> TreeScan {
        let mut errors = Vec::new();
        for (path, result) in self.hasher.digest_all(&files) {
            let key = path.display().to_string();
            match result {
                Ok(digest) => live.insert(key, digest),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "file skipped this cycle");
                    live.exclude(key.clone());
                    errors.push(ScanError {
                        path: key,
                        error: e.to_string(),
                    });
                }
            }
        }
        TreeScan { live, errors }
    }
}

fn collect_under(dir: &Path, ignore: &IgnoreRules) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let walker = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !ignore.is_excluded(e.path()));
    for entry in walker {
        match entry {
            Ok(e) if e.file_type().is_file() && !ignore.is_ignored_file(e.path()) => {
                files.push(e.into_path())
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "walk error"),
        }
    }
    files.sort();
    files
}

fn normalize(root: &Path, path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    if let Ok(canonical) = absolute.canonicalize() {
        return canonical;
    }
    // Gone: resolve the parent and re-attach the name.
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or(absolute),
        _ => absolute,
    }
}
