// ── Alarms ──
//
// Certificate alarms raised by the expiry checker and reported upstream
// through the alarm outbox. An alarm is keyed by `(code, resource)`;
// raising an active alarm again is a no-op.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use edgeom_api::Envelope;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cert::{CertStore, FD_CRL_NAME};
use crate::error::{CoreError, codes};
use crate::outbox::Outboxes;
use crate::state::{ConnectionStatus, StatusMachine};

pub const ALARM_RESOURCE: &str = "websocket/alarm";

/// Codes owned by the certificate checker.
const CERT_ALARM_CODES: [u32; 3] = [codes::CERT_ABOUT_TO_EXPIRE, codes::CERT_EXPIRED, codes::CRL_EXPIRED];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alarm {
    pub code: u32,
    /// Affected object, a certificate name or `FD.crl`.
    pub resource: String,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl Alarm {
    pub fn new(code: u32, resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            resource: resource.into(),
            message: message.into(),
            raised_at: Utc::now(),
        }
    }
}

/// Where alarms go.
pub trait AlarmSink: Send + Sync {
    fn raise(&self, alarm: Alarm);
    fn clear(&self, code: u32, resource: &str);
    /// Currently raised alarms, oldest first.
    fn active(&self) -> Vec<Alarm>;
}

// ── AlarmQueue ───────────────────────────────────────────────────────

/// Tracks active alarms and queues raise/clear reports for the manager.
#[derive(Debug)]
pub struct AlarmQueue {
    active: Mutex<IndexMap<(u32, String), Alarm>>,
    outboxes: Arc<Outboxes>,
}

impl AlarmQueue {
    pub fn new(outboxes: Arc<Outboxes>) -> Self {
        Self {
            active: Mutex::new(IndexMap::new()),
            outboxes,
        }
    }

    fn report(&self, alarm: &Alarm, action: &str) {
        let content = json!({
            "alarm": [{
                "type": action,
                "alarmId": alarm.code.to_string(),
                "resource": alarm.resource,
                "message": alarm.message,
                "timestamp": alarm.raised_at.timestamp_millis(),
            }]
        });
        self.outboxes
            .alarms
            .push(Envelope::new(ALARM_RESOURCE, &content));
    }
}

impl AlarmSink for AlarmQueue {
    fn raise(&self, alarm: Alarm) {
        let key = (alarm.code, alarm.resource.clone());
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(&key) {
            return;
        }
        warn!(code = alarm.code, resource = %alarm.resource, message = %alarm.message, "alarm raised");
        self.report(&alarm, "alarm");
        active.insert(key, alarm);
    }

    fn clear(&self, code: u32, resource: &str) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(alarm) = active.shift_remove(&(code, resource.to_owned())) {
            info!(code, resource, "alarm cleared");
            self.report(&alarm, "clear");
        }
    }

    fn active(&self) -> Vec<Alarm> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

// ── CertExpiryChecker ────────────────────────────────────────────────

/// Periodic scan of the certificate pool for expiring chains and CRLs.
pub struct CertExpiryChecker {
    certs: Arc<CertStore>,
    status: Arc<StatusMachine>,
    alarms: Arc<dyn AlarmSink>,
    raised: Mutex<HashSet<(u32, String)>>,
    interval: Duration,
}

impl std::fmt::Debug for CertExpiryChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertExpiryChecker")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl CertExpiryChecker {
    pub fn new(certs: Arc<CertStore>, status: Arc<StatusMachine>, alarms: Arc<dyn AlarmSink>) -> Self {
        let interval = certs.policy().expiry_check;
        Self {
            certs,
            status,
            alarms,
            raised: Mutex::new(HashSet::new()),
            interval,
        }
    }

    /// Scan once. Does nothing unless the link is `Ready`.
    pub fn check_once(&self) -> Result<(), CoreError> {
        if self.status.current() != ConnectionStatus::Ready {
            debug!("expiry check skipped, link not ready");
            return Ok(());
        }

        let threshold = self.certs.policy().expiry_threshold_days;
        let mut wanted: Vec<Alarm> = Vec::new();
        for cert in self.certs.expiring_certs(threshold)? {
            wanted.push(Alarm::new(
                codes::CERT_ABOUT_TO_EXPIRE,
                &cert.name,
                format!("certificate expires at {}", cert.not_after),
            ));
        }
        for cert in self.certs.expired_certs()? {
            wanted.push(Alarm::new(
                codes::CERT_EXPIRED,
                &cert.name,
                "certificate has expired",
            ));
        }
        if !self.certs.expired_crls()?.is_empty() {
            wanted.push(Alarm::new(
                codes::CRL_EXPIRED,
                FD_CRL_NAME,
                "CRL is past its next update",
            ));
        }

        let keys: HashSet<(u32, String)> =
            wanted.iter().map(|a| (a.code, a.resource.clone())).collect();
        let mut raised = self.raised.lock().unwrap_or_else(PoisonError::into_inner);
        for (code, resource) in raised.difference(&keys) {
            self.alarms.clear(*code, resource);
        }
        for alarm in wanted {
            self.alarms.raise(alarm);
        }
        *raised = keys;
        Ok(())
    }

    /// Clear every certificate alarm, including ones raised before a restart.
    pub fn clean_fd_cert_alarm(&self) {
        let mut raised = self.raised.lock().unwrap_or_else(PoisonError::into_inner);
        raised.clear();
        for alarm in self.alarms.active() {
            if CERT_ALARM_CODES.contains(&alarm.code) {
                self.alarms.clear(alarm.code, &alarm.resource);
            }
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.check_once() {
                        warn!(error = %e, "certificate expiry check failed");
                    }
                }
            }
        }
        debug!("expiry checker stopped");
    }
}
