//! Auto-response and safe mode controller.
//!
//! Executes the response for each severity and owns the MONITORING /
//! SAFE_MODE state machine:
//!
//! | severity | response                                   |
//! |----------|--------------------------------------------|
//! | INFO     | log                                        |
//! | MEDIUM   | log, alert                                 |
//! | HIGH     | log, alert, snapshot                       |
//! | CRITICAL | log, alert, snapshot, enter safe mode      |
//!
//! Entering safe mode persists the state and publishes `true` on the
//! suspension channel; only `clear_safe_mode` with the admin token returns
//! to monitoring.

use crate::response::notifier::{Alert, AlertDispatcher};
use crate::status::summarize;
use anyhow::{Context, Result};
use chrono::Utc;
use fimguard_core::audit_log::{AuditLog, EntryDraft, LogEntry, ResponseAction};
use fimguard_core::counters::SeverityCounters;
use fimguard_core::crypto::{secrets_match, SecretKey};
use fimguard_core::record_store::ChangeEvent;
use fimguard_core::safe_mode::{SafeModeFile, SafeModeLoad, SafeModeReason, SafeModeState};
use fimguard_core::severity::Classifier;
use fimguard_core::snapshot::{new_incident_id, IncidentSnapshot, SnapshotWriter};
use fimguard_core::{EventKind, GuardError, Severity, TamperTarget};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MonitorState {
    Monitoring,
    SafeMode,
}

pub struct Controller {
    log: Arc<AuditLog>,
    classifier: Classifier,
    snapshots: Arc<dyn SnapshotWriter>,
    alerts: AlertDispatcher,
    safe_mode_file: SafeModeFile,
    counters_path: PathBuf,
    history_depth: usize,
    key: SecretKey,
    admin_token: String,
    suspend_tx: watch::Sender<bool>,
    untrusted_state: Mutex<Option<String>>,
    inner: Mutex<ControllerState>,
}

struct ControllerState {
    safe_mode: SafeModeState,
    counters: SeverityCounters,
    last_event_summary: Option<String>,
}

pub struct ControllerParts {
    pub log: Arc<AuditLog>,
    pub classifier: Classifier,
    pub snapshots: Arc<dyn SnapshotWriter>,
    pub alerts: AlertDispatcher,
    pub safe_mode_file: SafeModeFile,
    pub counters_path: PathBuf,
    pub history_depth: usize,
    pub key: SecretKey,
    pub admin_token: String,
}

impl Controller {
    /// Starts in SAFE_MODE when the persisted state says so or cannot be
    /// trusted. A missing state file is only trusted while the log is empty;
    /// the inactive state is written then.
    pub fn new(parts: ControllerParts) -> Self {
        let has_history = parts.log.has_history();
        let loaded = parts.safe_mode_file.read();
        let untrusted = loaded.untrusted_detail(has_history);
        if loaded == SafeModeLoad::Missing && !has_history {
            if let Err(e) = parts.safe_mode_file.save(&SafeModeState::default()) {
                error!(error = %e, "initial safe mode state not persisted");
            }
        }
        let safe_mode = loaded.into_state(has_history);
        if safe_mode.active {
            warn!(
                reason = ?safe_mode.reason,
                incident = ?safe_mode.last_incident_id,
                "resuming in safe mode"
            );
        }
        let counters = SeverityCounters::load(&parts.counters_path);
        let (suspend_tx, _) = watch::channel(safe_mode.active);
        Self {
            log: parts.log,
            classifier: parts.classifier,
            snapshots: parts.snapshots,
            alerts: parts.alerts,
            safe_mode_file: parts.safe_mode_file,
            counters_path: parts.counters_path,
            history_depth: parts.history_depth,
            key: parts.key,
            admin_token: parts.admin_token,
            suspend_tx,
            untrusted_state: Mutex::new(untrusted),
            inner: Mutex::new(ControllerState {
                safe_mode,
                counters,
                last_event_summary: None,
            }),
        }
    }

    pub fn state(&self) -> MonitorState {
        if self.inner.lock().safe_mode.active {
            MonitorState::SafeMode
        } else {
            MonitorState::Monitoring
        }
    }

    pub fn is_safe_mode(&self) -> bool {
        self.state() == MonitorState::SafeMode
    }

    pub fn safe_mode(&self) -> SafeModeState {
        self.inner.lock().safe_mode.clone()
    }

    pub fn counters(&self) -> SeverityCounters {
        self.inner.lock().counters
    }

    pub fn last_event_summary(&self) -> Option<String> {
        self.inner.lock().last_event_summary.clone()
    }

    /// `true` while reconciliation is suspended.
    pub fn suspension(&self) -> watch::Receiver<bool> {
        self.suspend_tx.subscribe()
    }

    pub fn audit_log(&self) -> &Arc<AuditLog> {
        &self.log
    }

    /// Why the persisted safe mode state was not trusted at construction.
    /// Returned once.
    pub fn take_state_finding(&self) -> Option<String> {
        self.untrusted_state.lock().take()
    }

    /// Re-read the persisted state; `Some` when it can no longer be trusted.
    pub fn check_state_file(&self) -> Option<String> {
        self.safe_mode_file.read().untrusted_detail(self.log.has_history())
    }

    pub fn safe_mode_path(&self) -> &std::path::Path {
        self.safe_mode_file.path()
    }

    /// Respond to one reconciled batch, in batch order. `digests` is the
    /// record store content after the batch was applied.
    pub fn handle_changes(
        &self,
        events: &[ChangeEvent],
        digests: &BTreeMap<String, String>,
    ) -> Result<Vec<LogEntry>> {
        let severities = self.classifier.classify_batch(events);
        let mut entries = Vec::with_capacity(events.len());
        for (event, severity) in events.iter().zip(severities) {
            let kind = EventKind::from(event.kind);
            let message = format!("{kind}: {}", event.path);
            let draft = EntryDraft::event(kind, Some(event.path.clone()), severity);
            entries.push(self.respond(draft, message, digests, None)?);
        }
        Ok(entries)
    }

    /// Always CRITICAL.
    pub fn handle_tamper(
        &self,
        target: TamperTarget,
        path: Option<String>,
        detail: &str,
        digests: &BTreeMap<String, String>,
    ) -> Result<LogEntry> {
        let (kind, reason) = match target {
            TamperTarget::Log => (EventKind::TamperLog, SafeModeReason::TamperLog),
            TamperTarget::Records => (EventKind::TamperRecords, SafeModeReason::TamperRecords),
            TamperTarget::SafeModeState => (EventKind::TamperRecords, SafeModeReason::StateTampered),
        };
        let severity = self.classifier.classify(kind, 0);
        let draft = EntryDraft::event(kind, path, severity).with_detail(detail);
        let message = format!("{target} failed authentication: {detail}");
        self.respond(draft, message, digests, Some(reason))
    }

    /// Administrative entries: logged, never classified or counted.
    pub fn log_admin(&self, kind: EventKind, detail: impl Into<String>) -> Result<LogEntry> {
        let detail = detail.into();
        info!(kind = %kind, detail = %detail, "administrative event");
        let entry = self
            .log
            .append(EntryDraft::admin(kind, detail))
            .context("appending administrative entry")?;
        self.report_log_findings(&BTreeMap::new())?;
        Ok(entry)
    }

    /// Run the tamper response for segments the log set aside, at open or
    /// while appending.
    pub fn report_log_findings(&self, digests: &BTreeMap<String, String>) -> Result<()> {
        while let Some(finding) = self.log.take_tamper_finding() {
            let detail = match &finding.preserved_as {
                Some(p) => format!("{}; preserved as {}", finding.detail, p.display()),
                None => finding.detail.clone(),
            };
            self.handle_tamper(
                TamperTarget::Log,
                Some(finding.segment.display().to_string()),
                &detail,
                digests,
            )?;
        }
        Ok(())
    }

    fn respond(
        &self,
        draft: EntryDraft,
        message: String,
        digests: &BTreeMap<String, String>,
        reason: Option<SafeModeReason>,
    ) -> Result<LogEntry> {
        let severity = draft.severity;
        let mut actions = vec![ResponseAction::Logged];
        if severity >= Severity::Medium {
            actions.push(ResponseAction::Alerted);
        }
        if severity >= Severity::High {
            actions.push(ResponseAction::SnapshotTaken);
        }
        let enter_safe_mode = severity == Severity::Critical;
        if enter_safe_mode {
            actions.push(ResponseAction::SafeModeEntered);
        }

        let mut draft = draft.with_responses(actions);
        if severity >= Severity::High {
            draft = draft.with_incident(new_incident_id());
        }
        let kind = draft.kind;
        let path = draft.path.clone();
        let incident_id = draft.incident_id.clone();
        let reason = reason.unwrap_or(SafeModeReason::TamperRecords);

        if severity >= Severity::Medium {
            self.alerts.dispatch(Alert {
                timestamp: Utc::now(),
                event: kind,
                severity,
                message: message.clone(),
                path: path.clone(),
            });
        }

        let entry = match self.log.append(draft) {
            Ok(entry) => entry,
            Err(e) => {
                // Suspend even when the incident cannot be recorded.
                if enter_safe_mode {
                    self.enter_safe_mode(reason, incident_id);
                }
                return Err(e).context("appending audit entry");
            }
        };
        match severity {
            Severity::Info => info!(kind = %kind, path = ?path, "{message}"),
            Severity::Medium => warn!(kind = %kind, path = ?path, "{message}"),
            Severity::High | Severity::Critical => {
                error!(kind = %kind, path = ?path, severity = %severity, "{message}")
            }
        }

        if severity >= Severity::High {
            self.take_snapshot(&entry, digests);
        }
        if enter_safe_mode {
            self.enter_safe_mode(reason, incident_id);
        }

        {
            let mut inner = self.inner.lock();
            inner.counters.bump(severity);
            inner.last_event_summary = Some(summarize(severity, kind, path.as_deref()));
            if let Err(e) = inner.counters.save(&self.counters_path) {
                warn!(error = %e, "severity counters not persisted");
            }
        }
        self.report_log_findings(digests)?;
        Ok(entry)
    }

    fn take_snapshot(&self, entry: &LogEntry, digests: &BTreeMap<String, String>) {
        let preceding: Vec<LogEntry> = self
            .log
            .recent(self.history_depth + 1)
            .into_iter()
            .filter(|e| e.seq < entry.seq)
            .collect();
        let skip = preceding.len().saturating_sub(self.history_depth);
        let preceding = preceding.into_iter().skip(skip).collect();

        let mut snapshot = IncidentSnapshot::new(entry.clone(), preceding, digests.clone());
        if let Some(id) = &entry.incident_id {
            snapshot.id = id.clone();
        }
        // Snapshot failure must not block the rest of the response.
        if let Err(e) = self.snapshots.write_snapshot(&snapshot) {
            error!(incident = %snapshot.id, error = %e, "incident snapshot failed");
        }
    }

    fn enter_safe_mode(&self, reason: SafeModeReason, incident_id: Option<String>) {
        let state = {
            let mut inner = self.inner.lock();
            inner.safe_mode.enter(reason, incident_id);
            inner.safe_mode.clone()
        };
        if let Err(e) = self.safe_mode_file.save(&state) {
            error!(error = %e, "safe mode state not persisted");
        }
        self.suspend_tx.send_replace(true);
        error!(reason = %reason, "SAFE MODE entered; monitoring suspended");
    }

    /// Check an administrative token in constant time.
    pub fn authorize(&self, presented_token: &str) -> std::result::Result<(), GuardError> {
        if secrets_match(&self.key, &self.admin_token, presented_token) {
            Ok(())
        } else {
            warn!("administrative action rejected: bad admin token");
            Err(GuardError::Unauthorized)
        }
    }

    /// Leave safe mode. Requires the configured admin token; does not restart
    /// monitoring by itself.
    pub fn clear_safe_mode(&self, presented_token: &str) -> std::result::Result<(), GuardError> {
        self.authorize(presented_token)?;
        let (previous, state) = {
            let mut inner = self.inner.lock();
            if !inner.safe_mode.active {
                return Ok(());
            }
            let previous = inner.safe_mode.clone();
            inner.safe_mode.exit();
            (previous, inner.safe_mode.clone())
        };
        self.safe_mode_file.save(&state)?;
        let detail = format!(
            "cleared by administrator; reason was {}",
            previous
                .reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unknown".into())
        );
        self.log.append(EntryDraft::admin(EventKind::SafeModeCleared, detail))?;
        self.suspend_tx.send_replace(false);
        info!("safe mode cleared");
        if let Err(e) = self.report_log_findings(&BTreeMap::new()) {
            error!(error = %e, "tamper response after clear failed");
        }
        Ok(())
    }
}
