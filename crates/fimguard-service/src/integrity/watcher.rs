//! Change sources: where candidate paths come from.
//!
//! Two strategies share one trait. `PollingSource` walks the tree on an
//! interval and diffs size and mtime against the previous walk.
//! `NotifySource` bridges native notifications from the `notify` crate into a
//! tokio channel. Neither decides what changed; they only propose paths for
//! the record store to reconcile.

use crate::integrity::scanner::IgnoreRules;
use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    Created,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub path: PathBuf,
    pub kind: RawKind,
}

/// A restartable stream of raw change events. Every call to `observe` starts
/// a fresh stream that ends when `shutdown` flips to `true` or the receiver
/// is dropped.
pub trait ChangeSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn observe(&self, shutdown: watch::Receiver<bool>) -> Result<mpsc::Receiver<RawEvent>>;
}

// ── polling ────────────────────────────────────────────────────────────────

type Fingerprint = (u64, Option<SystemTime>);

pub struct PollingSource {
    root: PathBuf,
    interval: Duration,
    ignore: IgnoreRules,
}

impl PollingSource {
    pub fn new(root: PathBuf, interval: Duration, ignore: IgnoreRules) -> Self {
        Self {
            root,
            interval,
            ignore,
        }
    }
}

impl ChangeSource for PollingSource {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn observe(&self, mut shutdown: watch::Receiver<bool>) -> Result<mpsc::Receiver<RawEvent>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let root = self.root.clone();
        let ignore = self.ignore.clone();
        let interval = self.interval;

        tokio::spawn(async move {
            let walk = |root: PathBuf, ignore: IgnoreRules| {
                tokio::task::spawn_blocking(move || fingerprint_tree(&root, &ignore))
            };
            // The first walk is only a reference point.
            let mut previous = match walk(root.clone(), ignore.clone()).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    error!(error = %e, "initial poll walk failed");
                    return;
                }
            };
            info!(root = %root.display(), interval_ms = interval.as_millis() as u64, "polling watcher started");

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("polling watcher stopping");
                            return;
                        }
                    }
                    _ = tx.closed() => return,
                }

                let current = match walk(root.clone(), ignore.clone()).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!(error = %e, "poll walk failed");
                        continue;
                    }
                };
                for event in diff_fingerprints(&previous, &current) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                previous = current;
            }
        });

        Ok(rx)
    }
}

fn fingerprint_tree(root: &Path, ignore: &IgnoreRules) -> HashMap<PathBuf, Fingerprint> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !ignore.is_excluded(e.path()))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && !ignore.is_ignored_file(e.path()))
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            Some((e.into_path(), (meta.len(), meta.modified().ok())))
        })
        .collect()
}

fn diff_fingerprints(
    previous: &HashMap<PathBuf, Fingerprint>,
    current: &HashMap<PathBuf, Fingerprint>,
) -> Vec<RawEvent> {
    let mut events = Vec::new();
    for (path, fp) in current {
        match previous.get(path) {
            None => events.push(RawEvent {
                path: path.clone(),
                kind: RawKind::Created,
            }),
            Some(old) if old != fp => events.push(RawEvent {
                path: path.clone(),
                kind: RawKind::Modified,
            }),
            Some(_) => {}
        }
    }
    for path in previous.keys() {
        if !current.contains_key(path) {
            events.push(RawEvent {
                path: path.clone(),
                kind: RawKind::Removed,
            });
        }
    }
    events.sort_by(|a, b| a.path.cmp(&b.path));
    events
}

// ── native notifications ───────────────────────────────────────────────────

pub struct NotifySource {
    root: PathBuf,
    ignore: IgnoreRules,
}

impl NotifySource {
    pub fn new(root: PathBuf, ignore: IgnoreRules) -> Self {
        Self { root, ignore }
    }
}

impl ChangeSource for NotifySource {
    fn name(&self) -> &'static str {
        "notify"
    }

    fn observe(&self, mut shutdown: watch::Receiver<bool>) -> Result<mpsc::Receiver<RawEvent>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (sync_tx, sync_rx) = std_mpsc::channel::<notify::Result<Event>>();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = sync_tx.send(res);
            },
            NotifyConfig::default(),
        )
        .context("creating native watcher")?;
        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .with_context(|| format!("watching {}", self.root.display()))?;
        info!(root = %self.root.display(), "native watcher started");

        // Bridge the blocking notify channel into tokio.
        let bridge_tx = tx.clone();
        let ignore = self.ignore.clone();
        let root = self.root.clone();
        std::thread::Builder::new()
            .name("fimguard-watch-bridge".into())
            .spawn(move || loop {
                match sync_rx.recv() {
                    Ok(Ok(event)) => {
                        for raw in classify_event(&root, &event) {
                            if ignore.is_ignored(&raw.path) {
                                continue;
                            }
                            if bridge_tx.blocking_send(raw).is_err() {
                                debug!("raw event receiver dropped, bridge exiting");
                                return;
                            }
                        }
                    }
                    Ok(Err(e)) => error!(error = %e, "native watcher error"),
                    Err(_) => {
                        debug!("native watcher closed");
                        return;
                    }
                }
            })
            .context("spawning watcher bridge")?;

        // Owns the watcher; dropping it closes the bridge.
        tokio::spawn(async move {
            tokio::select! {
                _ = async {
                    while shutdown.changed().await.is_ok() {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                } => {}
                _ = tx.closed() => {}
            }
            drop(watcher);
            debug!("native watcher stopped");
        });

        Ok(rx)
    }
}

/// The root as a candidate stands for the whole tree.
fn classify_event(root: &Path, event: &Event) -> Vec<RawEvent> {
    use notify::event::{ModifyKind, RenameMode};

    if event.need_rescan() {
        warn!(root = %root.display(), "native watcher lost events, rescanning tree");
        return vec![RawEvent {
            path: root.to_path_buf(),
            kind: RawKind::Modified,
        }];
    }
    let kind = match &event.kind {
        EventKind::Create(_) => RawKind::Created,
        EventKind::Remove(_) => RawKind::Removed,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() >= 2 => {
            return vec![
                RawEvent {
                    path: event.paths[0].clone(),
                    kind: RawKind::Removed,
                },
                RawEvent {
                    path: event.paths[1].clone(),
                    kind: RawKind::Created,
                },
            ];
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => RawKind::Removed,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => RawKind::Created,
        // Permission or timestamp changes do not alter content.
        EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        EventKind::Modify(_) => RawKind::Modified,
        _ => return Vec::new(),
    };
    event
        .paths
        .iter()
        .map(|p| RawEvent {
            path: p.clone(),
            kind,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn rename_becomes_remove_plus_create() {
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/w/old"))
            .add_path(PathBuf::from("/w/new"));
        let raw = classify_event(Path::new("/w"), &event);
        assert_eq!(raw[0].kind, RawKind::Removed);
        assert_eq!(raw[1].kind, RawKind::Created);
        assert_eq!(raw[1].path, PathBuf::from("/w/new"));
    }

    #[test]
    fn metadata_only_changes_are_dropped() {
        let event = Event::new(EventKind::Modify(ModifyKind::Metadata(
            notify::event::MetadataKind::Permissions,
        )))
        .add_path(PathBuf::from("/w/a"));
        assert!(classify_event(Path::new("/w"), &event).is_empty());

        let created = Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/w/a"));
        assert_eq!(classify_event(Path::new("/w"), &created)[0].kind, RawKind::Created);
        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(PathBuf::from("/w/a"));
        assert_eq!(classify_event(Path::new("/w"), &removed)[0].kind, RawKind::Removed);
    }

    #[test]
    fn overflow_rescan_proposes_the_root() {
        use notify::event::Flag;
        let event = Event::new(EventKind::Other).set_flag(Flag::Rescan);
        let raw = classify_event(Path::new("/w"), &event);
        assert_eq!(raw, vec![RawEvent { path: PathBuf::from("/w"), kind: RawKind::Modified }]);
        assert!(classify_event(Path::new("/w"), &Event::new(EventKind::Other)).is_empty());
    }

    #[test]
    fn fingerprint_diff_reports_all_three_kinds() {
        let mut before = HashMap::new();
        before.insert(PathBuf::from("/w/keep"), (1, None));
        before.insert(PathBuf::from("/w/grow"), (1, None));
        before.insert(PathBuf::from("/w/gone"), (1, None));
        let mut after = before.clone();
        after.remove(Path::new("/w/gone"));
        after.insert(PathBuf::from("/w/grow"), (2, None));
        after.insert(PathBuf::from("/w/new"), (1, None));

        let events = diff_fingerprints(&before, &after);
        let summary: Vec<_> = events
            .iter()
            .map(|e| (e.path.to_string_lossy().to_string(), e.kind))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("/w/gone".to_string(), RawKind::Removed),
                ("/w/grow".to_string(), RawKind::Modified),
                ("/w/new".to_string(), RawKind::Created),
            ]
        );
    }

    #[tokio::test]
    async fn polling_source_reports_new_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("existing.txt"), b"x").unwrap();
        let source = PollingSource::new(
            dir.path().to_path_buf(),
            Duration::from_millis(50),
            IgnoreRules::default(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut rx = source.observe(shutdown_rx).unwrap();

        // Let the reference walk happen before creating the file.
        tokio::time::sleep(Duration::from_millis(150)).await;
        fs::write(dir.path().join("fresh.txt"), b"y").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, RawKind::Created);
        assert!(event.path.ends_with("fresh.txt"));

        shutdown_tx.send(true).unwrap();
    }
}
