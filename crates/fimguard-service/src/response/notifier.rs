//! Outbound alerts.
//!
//! Alerts are fire-and-forget: the dispatcher spawns each delivery on the
//! runtime with a timeout and only logs failures, so a slow or dead webhook
//! never holds up the response to an incident.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use fimguard_core::{EventKind, Severity};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub timestamp: DateTime<Utc>,
    pub event: EventKind,
    pub severity: Severity,
    pub message: String,
    pub path: Option<String>,
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, alert: &Alert) -> Result<()>;
}

/// Writes alerts to the tracing output.
pub struct TracingNotifier;

#[async_trait::async_trait]
impl Notifier for TracingNotifier {
    fn name(&self) -> &'static str {
        "tracing"
    }

    async fn notify(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            Severity::Critical => error!(
                event = %alert.event,
                severity = %alert.severity,
                path = alert.path.as_deref().unwrap_or("-"),
                "ALERT: {}",
                alert.message
            ),
            _ => warn!(
                event = %alert.event,
                severity = %alert.severity,
                path = alert.path.as_deref().unwrap_or("-"),
                "ALERT: {}",
                alert.message
            ),
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    timestamp: String,
    event: EventKind,
    severity: Severity,
    message: &'a str,
    file: Option<&'a str>,
    priority: u8,
}

fn priority(severity: Severity) -> u8 {
    match severity {
        Severity::Info => 0,
        Severity::Medium => 1,
        Severity::High => 2,
        Severity::Critical => 3,
    }
}

/// POSTs a JSON payload to a configured URL.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("fimguard/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("webhook client: {e}"))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn notify(&self, alert: &Alert) -> Result<()> {
        let payload = WebhookPayload {
            timestamp: alert.timestamp.to_rfc3339(),
            event: alert.event,
            severity: alert.severity,
            message: &alert.message,
            file: alert.path.as_deref(),
            priority: priority(alert.severity),
        };
        let res = self.client.post(&self.url).json(&payload).send().await?;
        if res.status().is_success() {
            return Ok(());
        }
        Err(anyhow!("webhook returned {}", res.status()))
    }
}

/// Fans alerts out to every notifier without waiting for delivery.
#[derive(Clone)]
pub struct AlertDispatcher {
    notifiers: Vec<Arc<dyn Notifier>>,
    timeout: Duration,
}

impl AlertDispatcher {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>, timeout: Duration) -> Self {
        Self { notifiers, timeout }
    }

    pub fn dispatch(&self, alert: Alert) {
        let handle = match Handle::try_current() {
            Ok(h) => h,
            Err(_) => {
                warn!(event = %alert.event, "no async runtime; alert not delivered");
                return;
            }
        };
        let alert = Arc::new(alert);
        for notifier in &self.notifiers {
            let notifier = notifier.clone();
            let alert = alert.clone();
            let timeout = self.timeout;
            handle.spawn(async move {
                match tokio::time::timeout(timeout, notifier.notify(&alert)).await {
                    Ok(Ok(())) => debug!(notifier = notifier.name(), "alert delivered"),
                    Ok(Err(e)) => {
                        warn!(notifier = notifier.name(), error = %e, "alert delivery failed")
                    }
                    Err(_) => warn!(
                        notifier = notifier.name(),
                        timeout_ms = timeout.as_millis() as u64,
                        "alert delivery timed out"
                    ),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recording(Arc<Mutex<Vec<Alert>>>);

    #[async_trait::async_trait]
    impl Notifier for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn notify(&self, alert: &Alert) -> Result<()> {
            self.0.lock().push(alert.clone());
            Ok(())
        }
    }

    struct Stuck;

    #[async_trait::async_trait]
    impl Notifier for Stuck {
        fn name(&self) -> &'static str {
            "stuck"
        }

        async fn notify(&self, _alert: &Alert) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn alert() -> Alert {
        Alert {
            timestamp: Utc::now(),
            event: EventKind::Modified,
            severity: Severity::Medium,
            message: "a.txt modified".into(),
            path: Some("/w/a.txt".into()),
        }
    }

    #[tokio::test]
    async fn dispatch_does_not_wait_for_slow_notifiers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = AlertDispatcher::new(
            vec![Arc::new(Stuck), Arc::new(Recording(seen.clone()))],
            Duration::from_millis(50),
        );
        let started = std::time::Instant::now();
        dispatcher.dispatch(alert());
        assert!(started.elapsed() < Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn dispatch_outside_runtime_is_dropped() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher =
            AlertDispatcher::new(vec![Arc::new(Recording(seen.clone()))], Duration::from_millis(50));
        dispatcher.dispatch(alert());
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn webhook_payload_shape() {
        let a = alert();
        let payload = WebhookPayload {
            timestamp: a.timestamp.to_rfc3339(),
            event: a.event,
            severity: a.severity,
            message: &a.message,
            file: a.path.as_deref(),
            priority: priority(a.severity),
        };
        let v = serde_json::to_value(&payload).unwrap();
        assert_eq!(v["event"], "MODIFIED");
        assert_eq!(v["severity"], "MEDIUM");
        assert_eq!(v["file"], "/w/a.txt");
        assert_eq!(v["priority"], 1);
    }
}
