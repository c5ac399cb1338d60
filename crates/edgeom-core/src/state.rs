// ── Connection status state machine ──
//
// A single process-wide status shared by every manager type. Readers
// subscribe through a `watch` channel; writers go through `transition`,
// which checks legality and applies the change in one step.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use tokio::sync::watch;

use crate::error::CoreError;

const HISTORY_LIMIT: usize = 64;

/// Link status toward the active manager.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionStatus {
    /// No remote manager configured, or switched back to Web.
    NotConfigured,
    /// A switch is in progress or the monitor is retrying.
    Connecting,
    /// Transport open with the shared initial account.
    Connected,
    /// Per-device credentials in place; fully operational.
    Ready,
    /// Bad credentials, locked IP or unusable certificate.
    ErrConfigured,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Whether `from -> to` is a legal edge. Same-state moves are handled by
/// the caller as no-ops and are not edges.
pub fn is_allowed(from: ConnectionStatus, to: ConnectionStatus) -> bool {
    use ConnectionStatus::{Connected, Connecting, ErrConfigured, NotConfigured, Ready};

    match to {
        Connecting | NotConfigured => true,
        Connected => from == Connecting,
        Ready => from == Connected,
        ErrConfigured => matches!(from, Connecting | Connected),
    }
}

/// One applied status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
    pub at: DateTime<Utc>,
}

// ── StatusMachine ────────────────────────────────────────────────────

/// The shared status value with its recent transition log.
#[derive(Debug)]
pub struct StatusMachine {
    tx: watch::Sender<ConnectionStatus>,
    history: Mutex<VecDeque<Transition>>,
}

impl StatusMachine {
    pub fn new(initial: ConnectionStatus) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            tx,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
        }
    }

    pub fn current(&self) -> ConnectionStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }

    /// Move to `to`.
    ///
    /// Returns `Ok(true)` when the status changed and `Ok(false)` when it
    /// already was `to`. Illegal edges leave the status untouched.
    pub fn transition(&self, to: ConnectionStatus) -> Result<bool, CoreError> {
        let mut outcome = Ok(None);
        self.tx.send_if_modified(|current| {
            let from = *current;
            if from == to {
                return false;
            }
            if !is_allowed(from, to) {
                outcome = Err(CoreError::InvalidTransition { from, to });
                return false;
            }
            *current = to;
            outcome = Ok(Some(from));
            true
        });

        match outcome? {
            Some(from) => {
                tracing::info!(%from, %to, "connection status changed");
                self.record(Transition {
                    from,
                    to,
                    at: Utc::now(),
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Like [`transition`](Self::transition), but an illegal edge is only logged.
    pub fn transition_or_warn(&self, to: ConnectionStatus) -> bool {
        match self.transition(to) {
            Ok(changed) => changed,
            Err(e) => {
                tracing::warn!(error = %e, "status transition refused");
                false
            }
        }
    }

    /// Most recent transitions, oldest first.
    pub fn history(&self) -> Vec<Transition> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn record(&self, transition: Transition) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(transition);
    }
}
