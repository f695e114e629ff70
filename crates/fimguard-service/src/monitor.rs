//! The `Monitor` facade: the inbound interface of the service.
//!
//! Wires a change source, the debounce pipeline, a batch consumer and the
//! periodic verification loop around one shared [`Engine`]. A monitoring
//! session ends when `stop_monitoring` is called or when the controller
//! publishes a suspension (safe mode).

use crate::engine::verifier::VerificationReport;
use crate::engine::{CycleOutcome, CycleScope, Engine, StartupOutcome};
use crate::integrity::audit_loop::{spawn_verification_loop, VerificationLoopHandle};
use crate::integrity::pipeline::spawn_pipeline;
use crate::integrity::watcher::{ChangeSource, NotifySource, PollingSource};
use crate::status::MonitorStatus;
use anyhow::{anyhow, Context, Result};
use fimguard_core::{Config, EventKind, GuardError, WatchMode};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const STOP_GRACE: Duration = Duration::from_secs(5);

struct Session {
    stop_tx: Arc<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    verification: VerificationLoopHandle,
    source: &'static str,
}

impl Session {
    fn is_live(&self) -> bool {
        !*self.stop_tx.borrow()
    }
}

pub struct Monitor {
    engine: Arc<Engine>,
    startup: StartupOutcome,
    session: Mutex<Option<Session>>,
}

impl Monitor {
    /// Open the data directory and run the startup integrity check.
    pub fn open(config: Config) -> Result<Self> {
        let engine = Arc::new(Engine::open(config)?);
        let startup = engine.startup_check().context("startup integrity check")?;
        match &startup {
            StartupOutcome::Ready { records } => info!(records, "record store authenticated"),
            StartupOutcome::BaselineCreated { records } => info!(records, "baseline created"),
            StartupOutcome::SafeMode => warn!("starting in safe mode"),
        }
        Ok(Self {
            engine,
            startup,
            session: Mutex::new(None),
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn startup_outcome(&self) -> &StartupOutcome {
        &self.startup
    }

    pub fn is_watching(&self) -> bool {
        self.session.lock().as_ref().is_some_and(Session::is_live)
    }

    /// Receiver that turns `true` when the current session has ended, for
    /// whatever reason. `None` when no session was started.
    pub fn session_stopped(&self) -> Option<watch::Receiver<bool>> {
        self.session.lock().as_ref().map(|s| s.stop_tx.subscribe())
    }

    /// Start watching. Refused while safe mode is active. Changes made while
    /// the monitor was not running are reconciled first.
    pub async fn start_monitoring(&self) -> Result<()> {
        if self.is_watching() {
            debug!("start_monitoring: already watching");
            return Ok(());
        }
        if self.engine.controller().is_safe_mode() {
            return Err(GuardError::SafeModeActive.into());
        }

        let engine = self.engine.clone();
        let outcome = tokio::task::spawn_blocking(move || engine.reconcile(CycleScope::Full))
            .await
            .map_err(|e| anyhow!("initial reconciliation task failed: {e}"))??;
        match outcome {
            CycleOutcome::Applied { events, errors } => {
                info!(changes = events.len(), unreadable = errors.len(), "initial reconciliation done");
            }
            CycleOutcome::Suspended | CycleOutcome::Tampered => {
                return Err(GuardError::SafeModeActive.into());
            }
        }

        let config = self.engine.config();
        let source: Box<dyn ChangeSource> = match config.watch_mode {
            WatchMode::Poll => Box::new(PollingSource::new(
                self.engine.scanner().root().to_path_buf(),
                config.poll_interval(),
                self.engine.scanner().ignore_rules().clone(),
            )),
            WatchMode::Notify => Box::new(NotifySource::new(
                self.engine.scanner().root().to_path_buf(),
                self.engine.scanner().ignore_rules().clone(),
            )),
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);
        let mut tasks = Vec::new();

        tasks.push(spawn_suspension_forwarder(
            self.engine.controller().suspension(),
            stop_tx.clone(),
        ));

        let raw_rx = source
            .observe(stop_rx.clone())
            .with_context(|| format!("starting {} change source", source.name()))?;
        let (pipeline_task, batch_rx) = spawn_pipeline(raw_rx, config.debounce(), stop_rx.clone());
        tasks.push(pipeline_task);
        tasks.push(spawn_batch_consumer(self.engine.clone(), batch_rx, stop_rx.clone()));

        let (verify_task, verification) =
            spawn_verification_loop(self.engine.clone(), config.verify_interval(), stop_rx);
        tasks.push(verify_task);

        self.engine.controller().log_admin(
            EventKind::MonitorStarted,
            format!(
                "watching {} via {}",
                self.engine.scanner().root().display(),
                source.name()
            ),
        )?;

        *self.session.lock() = Some(Session {
            stop_tx,
            tasks,
            verification,
            source: source.name(),
        });
        Ok(())
    }

    /// Stop the current session and wait briefly for its tasks.
    pub async fn stop_monitoring(&self) -> Result<()> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };
        session.stop_tx.send_replace(true);
        for task in session.tasks {
            match tokio::time::timeout(STOP_GRACE, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "monitor task ended abnormally"),
                Err(_) => warn!("monitor task did not stop in time"),
            }
        }
        self.engine
            .controller()
            .log_admin(EventKind::MonitorStopped, format!("{} source stopped", session.source))?;
        info!("monitoring stopped");
        Ok(())
    }

    /// Ask the periodic loop for an immediate pass, if a session is live.
    pub fn request_verification(&self) {
        if let Some(session) = self.session.lock().as_ref() {
            session.verification.wake.notify_one();
        }
    }

    pub async fn run_full_verification(&self, accept: bool) -> Result<VerificationReport> {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.run_full_verification(accept))
            .await
            .map_err(|e| anyhow!("verification task failed: {e}"))?
    }

    /// Leave safe mode. Monitoring is not resumed; call `start_monitoring`.
    pub fn clear_safe_mode(&self, admin_token: &str) -> Result<()> {
        self.engine.controller().clear_safe_mode(admin_token)?;
        Ok(())
    }

    /// Re-record the current tree as trusted. Required after a record store
    /// tamper, once the cause is understood.
    pub async fn rebaseline(&self, admin_token: &str) -> Result<usize> {
        let engine = self.engine.clone();
        let token = admin_token.to_string();
        tokio::task::spawn_blocking(move || engine.rebaseline(&token))
            .await
            .map_err(|e| anyhow!("rebaseline task failed: {e}"))?
    }

    pub fn get_status(&self) -> MonitorStatus {
        let last_verification = std::fs::read(self.engine.paths().last_verification())
            .ok()
            .and_then(|bytes| serde_json::from_slice::<VerificationReport>(&bytes).ok())
            .map(|r| r.summary());
        MonitorStatus::from_controller(self.engine.controller(), self.is_watching(), last_verification)
    }
}

/// Ends the session as soon as the controller suspends reconciliation.
fn spawn_suspension_forwarder(
    mut suspension: watch::Receiver<bool>,
    stop_tx: Arc<watch::Sender<bool>>,
) -> JoinHandle<()> {
    let mut stop_rx = stop_tx.subscribe();
    tokio::spawn(async move {
        loop {
            if *suspension.borrow_and_update() {
                error!("safe mode entered; stopping live monitoring");
                stop_tx.send_replace(true);
                return;
            }
            tokio::select! {
                changed = suspension.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

fn spawn_batch_consumer(
    engine: Arc<Engine>,
    mut batch_rx: tokio::sync::mpsc::Receiver<crate::integrity::pipeline::Batch>,
    stop_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(batch) = batch_rx.recv().await {
            if *stop_rx.borrow() {
                break;
            }
            debug!(paths = batch.len(), "reconciling batch");
            let engine = engine.clone();
            let candidates = batch.candidates();
            let outcome =
                tokio::task::spawn_blocking(move || engine.reconcile(CycleScope::Paths(candidates)))
                    .await;
            match outcome {
                Ok(Ok(CycleOutcome::Applied { errors, .. })) => {
                    for err in errors {
                        warn!(path = %err.path, error = %err.error, "file could not be verified");
                    }
                }
                Ok(Ok(CycleOutcome::Suspended | CycleOutcome::Tampered)) => {
                    debug!("batch dropped: reconciliation suspended");
                    break;
                }
                Ok(Err(e)) => error!(error = %e, "reconciliation failed"),
                Err(e) => error!(error = %e, "reconciliation task panicked"),
            }
        }
        debug!("batch consumer stopped");
    })
}
