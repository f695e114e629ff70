//! Debounced watcher pipeline.
//!
//! Receives `RawEvent`s from a `ChangeSource`, coalesces them per path (the
//! last kind wins), and once the stream has been quiet for the debounce
//! window emits everything pending as one `Batch`. One batch is one
//! reconciliation cycle.

use crate::integrity::watcher::{RawEvent, RawKind};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Upper bound on how long a continuously busy path can hold a batch back,
/// as a multiple of the debounce window.
const MAX_HOLD_FACTOR: u32 = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    /// Candidate paths with their final observed kind, path-sorted.
    pub paths: BTreeMap<PathBuf, RawKind>,
}

impl Batch {
    pub fn candidates(&self) -> Vec<PathBuf> {
        self.paths.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Spawn the pipeline. The returned receiver yields batches until the raw
/// stream ends or `shutdown` flips to `true`; pending events are dropped on
/// shutdown.
pub fn spawn_pipeline(
    mut raw_rx: mpsc::Receiver<RawEvent>,
    debounce: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> (JoinHandle<()>, mpsc::Receiver<Batch>) {
    let (batch_tx, batch_rx) = mpsc::channel::<Batch>(64);
    let tick = (debounce / 4).max(Duration::from_millis(10));
    let max_hold = debounce * MAX_HOLD_FACTOR;

    let handle = tokio::spawn(async move {
        let mut pending: HashMap<PathBuf, RawKind> = HashMap::new();
        let mut first_at: Option<Instant> = None;
        let mut last_at = Instant::now();

        loop {
            tokio::select! {
                event = raw_rx.recv() => {
                    match event {
                        Some(event) => {
                            trace!(path = %event.path.display(), kind = ?event.kind, "raw event");
                            pending.insert(event.path, event.kind);
                            last_at = Instant::now();
                            first_at.get_or_insert(last_at);
                        }
                        None => {
                            debug!("change source closed, pipeline exiting");
                            flush(&mut pending, &batch_tx).await;
                            return;
                        }
                    }
                }
                _ = tokio::time::sleep(tick) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(dropped = pending.len(), "pipeline suspended");
                        return;
                    }
                }
            }

            let Some(started) = first_at else {
                continue;
            };
            let now = Instant::now();
            if now.duration_since(last_at) >= debounce || now.duration_since(started) >= max_hold {
                first_at = None;
                if !flush(&mut pending, &batch_tx).await {
                    return;
                }
            }
        }
    });

    (handle, batch_rx)
}

/// Returns `false` when the consumer is gone.
async fn flush(pending: &mut HashMap<PathBuf, RawKind>, tx: &mpsc::Sender<Batch>) -> bool {
    if pending.is_empty() {
        return true;
    }
    let batch = Batch {
        paths: pending.drain().collect(),
    };
    debug!(paths = batch.len(), "flushing batch");
    tx.send(batch).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(path: &str, kind: RawKind) -> RawEvent {
        RawEvent {
            path: PathBuf::from(path),
            kind,
        }
    }

    #[tokio::test]
    async fn burst_is_coalesced_into_one_batch_keeping_final_kind() {
        let (raw_tx, raw_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_handle, mut batches) = spawn_pipeline(raw_rx, Duration::from_millis(40), shutdown_rx);

        raw_tx.send(raw("/w/a", RawKind::Created)).await.unwrap();
        raw_tx.send(raw("/w/a", RawKind::Modified)).await.unwrap();
        raw_tx.send(raw("/w/b", RawKind::Modified)).await.unwrap();
        raw_tx.send(raw("/w/b", RawKind::Removed)).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(2), batches.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.paths[&PathBuf::from("/w/a")], RawKind::Modified);
        assert_eq!(batch.paths[&PathBuf::from("/w/b")], RawKind::Removed);
        assert_eq!(
            batch.candidates(),
            vec![PathBuf::from("/w/a"), PathBuf::from("/w/b")]
        );
    }

    #[tokio::test]
    async fn suspension_ends_the_pipeline() {
        let (raw_tx, raw_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, mut batches) = spawn_pipeline(raw_rx, Duration::from_secs(10), shutdown_rx);

        raw_tx.send(raw("/w/a", RawKind::Modified)).await.unwrap();
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(batches.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_source_flushes_what_is_pending() {
        let (raw_tx, raw_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_handle, mut batches) = spawn_pipeline(raw_rx, Duration::from_secs(10), shutdown_rx);

        raw_tx.send(raw("/w/z", RawKind::Created)).await.unwrap();
        drop(raw_tx);
        let batch = batches.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
    }
}
