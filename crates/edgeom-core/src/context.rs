// ── Connection context ──
//
// The only mutable state shared between the monitor, the attempt and the
// switch: the live connection handle and the connect-result signals. The
// handle is replaced, never mutated, so a reader holding an old `Arc`
// keeps a consistent (if stale) view.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use edgeom_api::SessionSender;
use tracing::{debug, info};

// ── ConnectSignals ───────────────────────────────────────────────────

/// Connect-result signals raised by probes and read by the switch and
/// the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    AccountInvalid,
    IpLocked,
    CertInvalid,
    IpPortInvalid,
}

#[derive(Debug, Default)]
pub struct ConnectSignals {
    account_invalid: AtomicBool,
    ip_locked: AtomicBool,
    cert_invalid: AtomicBool,
    ip_port_invalid: AtomicBool,
}

impl ConnectSignals {
    fn flag(&self, signal: Signal) -> &AtomicBool {
        match signal {
            Signal::AccountInvalid => &self.account_invalid,
            Signal::IpLocked => &self.ip_locked,
            Signal::CertInvalid => &self.cert_invalid,
            Signal::IpPortInvalid => &self.ip_port_invalid,
        }
    }

    pub fn raise(&self, signal: Signal) {
        self.flag(signal).store(true, Ordering::Release);
    }

    pub fn is_set(&self, signal: Signal) -> bool {
        self.flag(signal).load(Ordering::Acquire)
    }

    /// Forget every signal of a previous attempt.
    pub fn clear(&self) {
        for signal in [
            Signal::AccountInvalid,
            Signal::IpLocked,
            Signal::CertInvalid,
            Signal::IpPortInvalid,
        ] {
            self.flag(signal).store(false, Ordering::Release);
        }
    }

    /// Account or IP-lock rejection: retrying cannot help.
    pub fn credentials_rejected(&self) -> bool {
        self.is_set(Signal::AccountInvalid) || self.is_set(Signal::IpLocked)
    }
}

// ── ActiveConnection ─────────────────────────────────────────────────

/// One open session toward the manager.
#[derive(Debug)]
pub struct ActiveConnection {
    id: u64,
    ip: String,
    sender: SessionSender,
    disconnected: AtomicBool,
}

impl ActiveConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Manager address this session was opened to.
    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn sender(&self) -> &SessionSender {
        &self.sender
    }

    /// Not yet flagged as gone. The socket itself may already be closed.
    pub fn is_marked_connected(&self) -> bool {
        !self.disconnected.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.is_marked_connected() && self.sender.is_open()
    }

    /// Flag the session as gone and close it. Idempotent.
    pub fn mark_disconnected(&self) {
        if !self.disconnected.swap(true, Ordering::AcqRel) {
            debug!(id = self.id, ip = %self.ip, "connection marked disconnected");
        }
        self.sender.close();
    }
}

// ── ConnectionContext ────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ConnectionContext {
    active: ArcSwapOption<ActiveConnection>,
    signals: ConnectSignals,
    next_id: AtomicU64,
}

impl ConnectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signals(&self) -> &ConnectSignals {
        &self.signals
    }

    pub fn current(&self) -> Option<Arc<ActiveConnection>> {
        self.active.load_full()
    }

    /// Register a freshly opened session, retiring the previous one.
    pub fn install(&self, ip: &str, sender: SessionSender) -> Arc<ActiveConnection> {
        let conn = Arc::new(ActiveConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            ip: ip.to_owned(),
            sender,
            disconnected: AtomicBool::new(false),
        });
        if let Some(old) = self.active.swap(Some(Arc::clone(&conn))) {
            old.mark_disconnected();
        }
        info!(id = conn.id, ip, "connection registered");
        conn
    }

    /// Drop the current connection, if any.
    pub fn take(&self) -> Option<Arc<ActiveConnection>> {
        let old = self.active.swap(None);
        if let Some(ref conn) = old {
            conn.mark_disconnected();
        }
        old
    }

    /// Mark connection `id` disconnected if it is still the current one.
    pub fn mark_disconnected(&self, id: u64) -> bool {
        match self.current() {
            Some(conn) if conn.id == id => {
                conn.mark_disconnected();
                true
            }
            _ => false,
        }
    }

    /// A live connection exists and can carry messages.
    pub fn ready_for_send(&self) -> bool {
        self.current().is_some_and(|c| c.is_connected())
    }
}
