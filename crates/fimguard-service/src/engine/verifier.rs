//! Full verification: re-hash the whole tree, reconcile against the store and
//! check every sealed artifact independently of the live pipeline.

use super::Engine;
use crate::integrity::scanner::ScanError;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fimguard_core::atomic::write_atomic;
use fimguard_core::record_store::ChangeKind;
use fimguard_core::{EventKind, GuardError, TamperTarget};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TamperFinding {
    pub target: TamperTarget,
    pub path: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Whether the detected changes were committed to the store.
    pub accepted: bool,
    pub checked_count: usize,
    pub mismatches: Vec<String>,
    pub missing: Vec<String>,
    pub created: Vec<String>,
    pub errors: Vec<ScanError>,
    pub tamper_findings: Vec<TamperFinding>,
}

impl VerificationReport {
    fn begin(accepted: bool) -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            accepted,
            checked_count: 0,
            mismatches: Vec::new(),
            missing: Vec::new(),
            created: Vec::new(),
            errors: Vec::new(),
            tamper_findings: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
            && self.missing.is_empty()
            && self.created.is_empty()
            && self.tamper_findings.is_empty()
    }

    pub fn summary(&self) -> String {
        let mut s = format!(
            "checked {} files: {} modified, {} missing, {} created, {} unreadable",
            self.checked_count,
            self.mismatches.len(),
            self.missing.len(),
            self.created.len(),
            self.errors.len()
        );
        if !self.tamper_findings.is_empty() {
            s.push_str(&format!("; {} tamper findings", self.tamper_findings.len()));
        }
        if self.accepted {
            s.push_str("; accepted");
        }
        s
    }
}

impl Engine {
    /// Re-check the tree and both sealed stores. With `accept`, detected
    /// changes are committed and responded to exactly as live changes are;
    /// otherwise the store is left untouched. Tamper findings always get the
    /// CRITICAL response.
    pub fn run_full_verification(&self, accept: bool) -> Result<VerificationReport> {
        let _guard = self.commit_lock.lock();
        let mut report = VerificationReport::begin(false);
        let log = self.controller.audit_log().clone();

        for status in log.verify_signatures() {
            if status.authentic {
                continue;
            }
            let detail = status.detail.clone().unwrap_or_else(|| "tag mismatch".into());
            let preserved = if status.path == log.path() {
                log.quarantine_active()
            } else {
                log.quarantine_backup(&status.path)
            };
            let detail = match preserved {
                Some(p) => format!("{detail}; preserved as {}", p.display()),
                None => detail,
            };
            report.tamper_findings.push(TamperFinding {
                target: TamperTarget::Log,
                path: Some(status.path.display().to_string()),
                detail,
            });
        }

        if let Some(detail) = self.controller.check_state_file() {
            report.tamper_findings.push(TamperFinding {
                target: TamperTarget::SafeModeState,
                path: Some(self.controller.safe_mode_path().display().to_string()),
                detail,
            });
        }

        let store = match self.records.load() {
            Ok(store) => {
                *self.last_digests.lock() = store.digests();
                Some(store)
            }
            Err(GuardError::Tampered { path, detail, .. }) => {
                report.tamper_findings.push(TamperFinding {
                    target: TamperTarget::Records,
                    path: Some(path.display().to_string()),
                    detail,
                });
                None
            }
            Err(GuardError::Missing(path)) => {
                report.tamper_findings.push(TamperFinding {
                    target: TamperTarget::Records,
                    path: Some(path.display().to_string()),
                    detail: "record store missing".into(),
                });
                None
            }
            Err(e) => return Err(e).context("loading record store"),
        };

        let scan = self.scanner.scan_full();
        report.checked_count = scan.live.len();
        report.errors = scan.errors;

        let events = match &store {
            Some(store) => store.reconcile(&scan.live),
            None => Vec::new(),
        };
        for event in &events {
            let bucket = match event.kind {
                ChangeKind::Modified => &mut report.mismatches,
                ChangeKind::Deleted => &mut report.missing,
                ChangeKind::Created => &mut report.created,
            };
            bucket.push(event.path.clone());
        }

        let digests = self.last_digests.lock().clone();
        for finding in &report.tamper_findings {
            self.controller
                .handle_tamper(finding.target, finding.path.clone(), &finding.detail, &digests)?;
        }

        if accept && !events.is_empty() {
            match &store {
                Some(store) if !self.controller.is_safe_mode() => {
                    self.accept(store, &events)?;
                    report.accepted = true;
                }
                _ => warn!("changes found but not accepted while integrity is compromised"),
            }
        }

        report.finished_at = Utc::now();
        let summary = report.summary();
        self.controller
            .log_admin(EventKind::VerificationCompleted, summary.clone())?;
        info!(clean = report.is_clean(), "{summary}");

        let body = serde_json::to_vec_pretty(&report)?;
        if let Err(e) = write_atomic(&self.paths.last_verification(), &body) {
            warn!(error = %e, "last verification report not written");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StartupOutcome;
    use fimguard_core::audit_log::path_with_suffix;
    use fimguard_core::Config;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        watch: TempDir,
        data: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let watch = tempdir().unwrap();
            fs::write(watch.path().join("a.txt"), b"alpha").unwrap();
            fs::write(watch.path().join("b.txt"), b"beta").unwrap();
            Self {
                watch,
                data: tempdir().unwrap(),
            }
        }

        fn config(&self) -> Config {
            Config {
                watch_path: self.watch.path().to_path_buf(),
                data_dir: Some(self.data.path().to_path_buf()),
                secret_key: "verifier-secret".into(),
                admin_token: "verifier-admin".into(),
                max_log_segment_bytes: 1024,
                ..Config::default()
            }
        }

        fn engine(&self) -> Engine {
            let engine = Engine::open(self.config()).unwrap();
            engine.startup_check().unwrap();
            engine
        }
    }

    #[test]
    fn clean_tree_verifies_clean() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let report = engine.run_full_verification(false).unwrap();
        assert!(report.is_clean(), "{}", report.summary());
        assert_eq!(report.checked_count, 2);
        assert!(fx.data.path().join("last-verification.json").exists());

        let last = engine.controller().audit_log().recent(1);
        assert_eq!(last[0].event_kind, EventKind::VerificationCompleted);
    }

    #[test]
    fn report_only_does_not_touch_the_store() {
        let fx = Fixture::new();
        let engine = fx.engine();
        fs::write(fx.watch.path().join("a.txt"), b"changed").unwrap();
        fs::remove_file(fx.watch.path().join("b.txt")).unwrap();
        fs::write(fx.watch.path().join("c.txt"), b"new").unwrap();

        let report = engine.run_full_verification(false).unwrap();
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.missing.len(), 1);
        assert_eq!(report.created.len(), 1);
        assert!(!report.accepted);

        // same findings again, since nothing was committed
        let again = engine.run_full_verification(false).unwrap();
        assert_eq!(again.mismatches, report.mismatches);
    }

    #[test]
    fn accepting_commits_and_responds() {
        let fx = Fixture::new();
        let engine = fx.engine();
        fs::write(fx.watch.path().join("a.txt"), b"changed").unwrap();

        let report = engine.run_full_verification(true).unwrap();
        assert!(report.accepted);
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(engine.controller().counters().medium, 1);

        let again = engine.run_full_verification(true).unwrap();
        assert!(again.is_clean());
        assert!(!again.accepted);
    }

    #[test]
    fn hand_edited_store_is_a_tamper_finding() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let records = fx.data.path().join("records.sealed");
        let text = fs::read_to_string(&records).unwrap();
        fs::write(&records, text.replace("\"version\":1", "\"version\":9")).unwrap();

        let report = engine.run_full_verification(true).unwrap();
        assert_eq!(report.tamper_findings.len(), 1);
        assert_eq!(report.tamper_findings[0].target, TamperTarget::Records);
        assert!(!report.accepted);
        assert!(engine.controller().is_safe_mode());
    }

    #[test]
    fn edited_backup_is_reported_once() {
        let fx = Fixture::new();
        let engine = fx.engine();
        for _ in 0..40 {
            engine
                .controller()
                .log_admin(EventKind::MonitorStarted, "padding entry to force rotation")
                .unwrap();
        }
        let backup = path_with_suffix(&fx.data.path().join("audit.log"), 1);
        assert!(backup.exists());
        let mut bytes = fs::read(&backup).unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0x01;
        fs::write(&backup, bytes).unwrap();

        let report = engine.run_full_verification(false).unwrap();
        assert_eq!(report.tamper_findings.len(), 1);
        assert_eq!(report.tamper_findings[0].target, TamperTarget::Log);
        let evidence: Vec<_> = fs::read_dir(fx.data.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with("audit.log.1.tampered-"))
            .collect();
        assert_eq!(evidence.len(), 1, "{evidence:?}");

        engine.controller().clear_safe_mode("verifier-admin").unwrap();
        let again = engine.run_full_verification(false).unwrap();
        assert!(again.tamper_findings.is_empty());
        assert!(!engine.controller().is_safe_mode());
    }

    #[test]
    fn startup_reports_baseline_then_ready() {
        let fx = Fixture::new();
        {
            let engine = Engine::open(fx.config()).unwrap();
            assert_eq!(
                engine.startup_check().unwrap(),
                StartupOutcome::BaselineCreated { records: 2 }
            );
        }
        let engine = Engine::open(fx.config()).unwrap();
        assert_eq!(
            engine.startup_check().unwrap(),
            StartupOutcome::Ready { records: 2 }
        );
    }
}
