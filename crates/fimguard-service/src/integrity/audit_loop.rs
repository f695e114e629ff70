//! Periodic verification loop.
//!
//! Runs an accepting full verification every `verifyIntervalSeconds` so that
//! anything the watcher missed (events dropped under load, changes made while
//! the service was down) is still reconciled and responded to. Shares only the
//! engine's commit lock with the live pipeline.

use crate::engine::Engine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info};

/// Lets the caller request an immediate pass.
#[derive(Clone)]
pub struct VerificationLoopHandle {
    pub wake: Arc<Notify>,
}

pub fn spawn_verification_loop(
    engine: Arc<Engine>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> (tokio::task::JoinHandle<()>, VerificationLoopHandle) {
    let wake = Arc::new(Notify::new());
    let wake_task = wake.clone();

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "verification loop started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wake_task.notified() => debug!("verification loop woken early"),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("verification loop shutting down");
                        return;
                    }
                }
            }
            if *shutdown.borrow() {
                return;
            }
            if engine.controller().is_safe_mode() {
                debug!("safe mode active, periodic verification skipped");
                continue;
            }

            let engine = engine.clone();
            match tokio::task::spawn_blocking(move || engine.run_full_verification(true)).await {
                Ok(Ok(report)) => debug!(clean = report.is_clean(), "periodic verification done"),
                Ok(Err(e)) => error!(error = %e, "periodic verification failed"),
                Err(e) => error!(error = %e, "periodic verification task panicked"),
            }
        }
    });

    (handle, VerificationLoopHandle { wake })
}
