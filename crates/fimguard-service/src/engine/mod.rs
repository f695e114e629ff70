//! Reconciliation engine.
//!
//! Owns the record file, the scanner and the controller, and serializes every
//! `load → scan → reconcile → commit` cycle behind one commit lock. Live
//! batches, periodic verification and on-demand verification all go through
//! here.

pub mod verifier;

use crate::integrity::scanner::{IgnoreRules, ScanError, Scanner};
use crate::response::controller::{Controller, ControllerParts};
use crate::response::notifier::{AlertDispatcher, Notifier, TracingNotifier, WebhookNotifier};
use anyhow::{Context, Result};
use chrono::Utc;
use fimguard_core::audit_log::AuditLog;
use fimguard_core::lock::DataDirLock;
use fimguard_core::paths::DataPaths;
use fimguard_core::record_store::{ChangeEvent, RecordFile, RecordStore};
use fimguard_core::safe_mode::SafeModeFile;
use fimguard_core::severity::Classifier;
use fimguard_core::snapshot::{ForensicSnapshotWriter, SnapshotWriter};
use fimguard_core::{Config, EventKind, GuardError, TamperTarget};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a reconciliation cycle looks at.
#[derive(Debug, Clone)]
pub enum CycleScope {
    Full,
    Paths(Vec<PathBuf>),
}

#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Applied {
        events: Vec<ChangeEvent>,
        errors: Vec<ScanError>,
    },
    /// Safe mode is active; nothing was accepted.
    Suspended,
    /// The record store failed authentication; safe mode was entered.
    Tampered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupOutcome {
    Ready { records: usize },
    BaselineCreated { records: usize },
    SafeMode,
}

pub struct Engine {
    config: Config,
    paths: DataPaths,
    scanner: Scanner,
    records: RecordFile,
    controller: Arc<Controller>,
    commit_lock: Mutex<()>,
    /// Digests of the last authenticated store, for snapshots taken when the
    /// store itself can no longer be trusted.
    last_digests: Mutex<BTreeMap<String, String>>,
    _lock: DataDirLock,
}

impl Engine {
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let paths = config.data_paths()?;
        paths
            .ensure()
            .with_context(|| format!("creating data dir {}", paths.root().display()))?;
        let lock = DataDirLock::acquire(&paths.lock_file())?;
        let key = config.secret()?;

        let log = Arc::new(
            AuditLog::open(
                paths.audit_log(),
                key.clone(),
                config.max_log_segment_bytes,
                config.max_backup_segments,
            )
            .context("opening audit log")?,
        );

        let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(TracingNotifier)];
        if let Some(url) = &config.webhook_url {
            notifiers.push(Arc::new(WebhookNotifier::new(url.clone(), config.alert_timeout())?));
        }

        let snapshots: Arc<dyn SnapshotWriter> = Arc::new(
            ForensicSnapshotWriter::new(paths.incidents())
                .with_evidence(vec![paths.records(), paths.audit_log()]),
        );

        let controller = Arc::new(Controller::new(ControllerParts {
            log,
            classifier: Classifier::new(config.deletion_burst_threshold),
            snapshots,
            alerts: AlertDispatcher::new(notifiers, config.alert_timeout()),
            safe_mode_file: SafeModeFile::new(paths.safe_mode_state(), key.clone()),
            counters_path: paths.severity_counters(),
            history_depth: config.snapshot_history_depth,
            key: key.clone(),
            admin_token: config.admin_token.clone(),
        }));

        let ignore = IgnoreRules::new(&config.ignore_patterns, vec![paths.root().to_path_buf()]);
        let scanner = Scanner::new(&config.watch_path, config.hasher(), ignore)?;
        let records = RecordFile::new(paths.records(), key);

        Ok(Self {
            config,
            paths,
            scanner,
            records,
            controller,
            commit_lock: Mutex::new(()),
            last_digests: Mutex::new(BTreeMap::new()),
            _lock: lock,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn paths(&self) -> &DataPaths {
        &self.paths
    }

    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Check the persisted state, the log and the record store once at
    /// startup. A first start without any history commits a baseline
    /// silently; a missing store or state file with history is tampering.
    pub fn startup_check(&self) -> Result<StartupOutcome> {
        let _guard = self.commit_lock.lock();
        let log = self.controller.audit_log().clone();

        let digests = self.last_digests.lock().clone();
        if let Some(detail) = self.controller.take_state_finding() {
            self.controller.handle_tamper(
                TamperTarget::SafeModeState,
                Some(self.controller.safe_mode_path().display().to_string()),
                &detail,
                &digests,
            )?;
        }
        self.controller.report_log_findings(&digests)?;

        if self.controller.is_safe_mode() {
            return Ok(StartupOutcome::SafeMode);
        }

        if self.records.exists() && !log.has_history() {
            // Every committed store was preceded by a BASELINE_CREATED entry.
            let digests = self.last_digests.lock().clone();
            self.controller.handle_tamper(
                TamperTarget::Log,
                Some(log.path().display().to_string()),
                "audit log missing while a record store exists",
                &digests,
            )?;
            return Ok(StartupOutcome::SafeMode);
        }

        if !self.records.exists() && !log.has_history() {
            let records = self.commit_baseline()?;
            self.controller
                .log_admin(EventKind::BaselineCreated, format!("baseline of {records} files"))?;
            return Ok(StartupOutcome::BaselineCreated { records });
        }

        match self.load_store()? {
            Some(store) => Ok(StartupOutcome::Ready {
                records: store.len(),
            }),
            None => Ok(StartupOutcome::SafeMode),
        }
    }

    /// One reconciliation cycle under the commit lock.
    pub fn reconcile(&self, scope: CycleScope) -> Result<CycleOutcome> {
        let _guard = self.commit_lock.lock();
        if self.controller.is_safe_mode() {
            return Ok(CycleOutcome::Suspended);
        }
        let Some(store) = self.load_store()? else {
            return Ok(CycleOutcome::Tampered);
        };

        let scan = match &scope {
            CycleScope::Full => self.scanner.scan_full(),
            CycleScope::Paths(candidates) => self.scanner.scan_paths(candidates),
        };
        // Hashing may have overlapped a suspension; its results are dropped.
        if self.controller.is_safe_mode() {
            return Ok(CycleOutcome::Suspended);
        }

        let events = store.reconcile(&scan.live);
        if !events.is_empty() {
            self.accept(&store, &events)?;
        } else {
            debug!(scope = %scope_label(&scope), "no changes");
        }
        Ok(CycleOutcome::Applied {
            events,
            errors: scan.errors,
        })
    }

    /// Replace the record store with the current tree. Administrative; needed
    /// to recover after a store tamper.
    pub fn rebaseline(&self, admin_token: &str) -> Result<usize> {
        self.controller.authorize(admin_token)?;
        let _guard = self.commit_lock.lock();
        let records = self.commit_baseline()?;
        self.controller.log_admin(
            EventKind::BaselineCreated,
            format!("rebaseline by administrator: {records} files"),
        )?;
        Ok(records)
    }

    /// Commit the successor of `store` and run the responses for `events`.
    /// Caller holds the commit lock.
    fn accept(&self, store: &RecordStore, events: &[ChangeEvent]) -> Result<()> {
        let next = store.apply(events, Utc::now());
        self.records.commit(&next).context("committing record store")?;
        let digests = next.digests();
        *self.last_digests.lock() = digests.clone();
        info!(
            version = next.version,
            changes = events.len(),
            "record store updated"
        );
        self.controller.handle_changes(events, &digests)?;
        Ok(())
    }

    fn commit_baseline(&self) -> Result<usize> {
        let scan = self.scanner.scan_full();
        for err in &scan.errors {
            warn!(path = %err.path, error = %err.error, "not in baseline");
        }
        let empty = RecordStore::default();
        let baseline = empty.apply(&empty.reconcile(&scan.live), Utc::now());
        self.records.commit(&baseline).context("committing baseline")?;
        *self.last_digests.lock() = baseline.digests();
        info!(records = baseline.len(), "baseline committed");
        Ok(baseline.len())
    }

    /// `None` when the store could not be trusted; the tamper response has
    /// already run.
    fn load_store(&self) -> Result<Option<RecordStore>> {
        match self.records.load() {
            Ok(store) => {
                *self.last_digests.lock() = store.digests();
                Ok(Some(store))
            }
            Err(GuardError::Tampered { path, detail, .. }) => {
                self.report_store_tamper(path.display().to_string(), &detail)?;
                Ok(None)
            }
            Err(GuardError::Missing(path)) => {
                self.report_store_tamper(path.display().to_string(), "record store missing")?;
                Ok(None)
            }
            Err(e) => Err(e).context("loading record store"),
        }
    }

    fn report_store_tamper(&self, path: String, detail: &str) -> Result<()> {
        let digests = self.last_digests.lock().clone();
        self.controller
            .handle_tamper(TamperTarget::Records, Some(path), detail, &digests)?;
        Ok(())
    }
}

fn scope_label(scope: &CycleScope) -> String {
    match scope {
        CycleScope::Full => "full".into(),
        CycleScope::Paths(p) => format!("{} paths", p.len()),
    }
}
