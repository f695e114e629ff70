use crate::engine::verifier::VerificationReport;
use crate::response::controller::{Controller, MonitorState};
use anyhow::{Context, Result};
use chrono::SecondsFormat;
use fimguard_core::audit_log::{path_with_suffix, read_tail, LogEntry};
use fimguard_core::counters::SeverityCounters;
use fimguard_core::lock::DataDirLock;
use fimguard_core::safe_mode::{SafeModeFile, SafeModeState};
use fimguard_core::{Config, EventKind, Severity};
use serde::Serialize;
use std::fmt;

pub const SAFE_MODE_HEADLINE: &str = "SAFE MODE — integrity compromised";
pub const MONITORING_HEADLINE: &str = "monitoring";

/// How far back the on-disk status looks for the last classified event.
const STATUS_TAIL: usize = 64;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatus {
    pub state: MonitorState,
    pub headline: String,
    pub last_event_summary: Option<String>,
    pub safe_mode: SafeModeState,
    pub counters: SeverityCounters,
    pub watching: bool,
    pub last_verification: Option<String>,
}

impl MonitorStatus {
    /// Status of the monitor running in this process.
    pub fn from_controller(controller: &Controller, watching: bool, last_verification: Option<String>) -> Self {
        let safe_mode = controller.safe_mode();
        Self::assemble(
            safe_mode,
            controller.counters(),
            controller.last_event_summary(),
            watching,
            last_verification,
        )
    }

    /// Status read from the data directory without taking ownership of it, so
    /// it works while another process is running the monitor.
    pub fn read_from_disk(config: &Config) -> Result<Self> {
        let paths = config.data_paths()?;
        let key = config.secret()?;
        let has_history = paths.audit_log().exists() || path_with_suffix(&paths.audit_log(), 1).exists();
        let safe_mode = SafeModeFile::new(paths.safe_mode_state(), key.clone())
            .read()
            .into_state(has_history);
        let counters = SeverityCounters::load(&paths.severity_counters());

        let last_event_summary = match read_tail(&paths.audit_log(), &key, STATUS_TAIL) {
            Ok(entries) => entries
                .iter()
                .rev()
                .find(|e| !e.event_kind.is_administrative())
                .map(summarize_entry),
            Err(e) => Some(format!("audit log unreadable: {e}")),
        };

        let watching = DataDirLock::is_held(&paths.lock_file()) && !safe_mode.active;
        let last_verification = read_last_verification(&paths.last_verification())?;
        Ok(Self::assemble(
            safe_mode,
            counters,
            last_event_summary,
            watching,
            last_verification,
        ))
    }

    fn assemble(
        safe_mode: SafeModeState,
        counters: SeverityCounters,
        last_event_summary: Option<String>,
        watching: bool,
        last_verification: Option<String>,
    ) -> Self {
        let (state, headline) = if safe_mode.active {
            (MonitorState::SafeMode, SAFE_MODE_HEADLINE)
        } else {
            (MonitorState::Monitoring, MONITORING_HEADLINE)
        };
        Self {
            state,
            headline: headline.to_string(),
            last_event_summary,
            safe_mode,
            counters,
            watching,
            last_verification,
        }
    }
}

pub fn summarize(severity: Severity, kind: EventKind, path: Option<&str>) -> String {
    format!("{severity} {kind} {}", path.unwrap_or("-"))
}

fn summarize_entry(entry: &LogEntry) -> String {
    summarize(entry.severity, entry.event_kind, entry.path.as_deref())
}

fn read_last_verification(path: &std::path::Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let report: VerificationReport = match serde_json::from_slice(&bytes) {
        Ok(report) => report,
        Err(_) => return Ok(Some("last verification report unreadable".into())),
    };
    Ok(Some(format!(
        "{} ({})",
        report.summary(),
        report.finished_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    )))
}

impl fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.headline)?;
        if self.safe_mode.active {
            if let Some(reason) = self.safe_mode.reason {
                writeln!(f, "  reason:      {reason}")?;
            }
            if let Some(at) = self.safe_mode.activated_at {
                writeln!(f, "  since:       {}", at.to_rfc3339_opts(SecondsFormat::Secs, true))?;
            }
            if let Some(id) = &self.safe_mode.last_incident_id {
                writeln!(f, "  incident:    {id}")?;
            }
        }
        writeln!(f, "  watching:    {}", if self.watching { "yes" } else { "no" })?;
        writeln!(
            f,
            "  last event:  {}",
            self.last_event_summary.as_deref().unwrap_or("none")
        )?;
        if let Some(v) = &self.last_verification {
            writeln!(f, "  verified:    {v}")?;
        }
        write!(
            f,
            "  counters:    INFO {} / MEDIUM {} / HIGH {} / CRITICAL {}",
            self.counters.info, self.counters.medium, self.counters.high, self.counters.critical
        )
    }
}
