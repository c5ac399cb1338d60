// ── ConnectAttempt ──
//
// One try at bringing the manager link up: probe, pick a chain, open the
// session, register it, then run its task group until the session drops
// or the attempt is cancelled. Every failure lands back in `Connecting`
// for the monitor's next tick, except the terminal connect-test outcomes,
// which move the link to `ErrConfigured` and halt the monitor.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use edgeom_api::probe::{MSG_SPARE_NODE, parse_message_id};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::context::ActiveConnection;
use crate::error::CoreError;
use crate::model::{NetConfig, NetConfigPatch};
use crate::probe::{ConnectTestOutcome, connect_test};
use crate::services::Services;
use crate::state::ConnectionStatus;
use crate::tasks::{TaskEnd, run_task_group};
use crate::transport::LinkTarget;

/// Why an attempt did not end with a session.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("Network configuration unavailable: {0}")]
    Config(CoreError),

    #[error("Connect test needs operator action: {0:?}")]
    Terminal(ConnectTestOutcome),

    #[error("Connect test failed: {0:?}")]
    Probe(ConnectTestOutcome),

    #[error("Handshake failed: {0}")]
    Handshake(CoreError),

    /// The manager says this unit replaced another; it carries the node
    /// id to use from now on.
    #[error("Manager reassigned the node id to {0}")]
    SpareNodeDetected(String),

    #[error("Attempt cancelled")]
    Cancelled,
}

impl AttemptError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }
}

/// A single attempt, consumed by [`run`](Self::run).
#[derive(Debug)]
pub struct ConnectAttempt {
    services: Arc<Services>,
    /// Cancelled to stop the owning monitor on a terminal outcome.
    halt: CancellationToken,
    number: u64,
    /// Id of the registered session, 0 until one is installed.
    session: AtomicU64,
}

impl ConnectAttempt {
    pub fn new(services: Arc<Services>, halt: CancellationToken, number: u64) -> Self {
        Self {
            services,
            halt,
            number,
            session: AtomicU64::new(0),
        }
    }

    /// Run until the session ends or `scope` is cancelled.
    pub async fn run(self, scope: CancellationToken) -> Result<TaskEnd, AttemptError> {
        let number = self.number;
        let result = tokio::select! {
            biased;
            () = scope.cancelled() => Err(AttemptError::Cancelled),
            r = self.connect(&scope) => r,
        };
        match &result {
            Ok(end) => info!(attempt = number, ?end, "attempt finished"),
            Err(AttemptError::Cancelled) => {
                let id = self.session.load(Ordering::Acquire);
                if id != 0 {
                    self.services.ctx.mark_disconnected(id);
                }
                info!(attempt = number, "attempt cancelled");
            }
            Err(e) if e.is_terminal() => error!(attempt = number, error = %e, "attempt stopped"),
            Err(e) => warn!(attempt = number, error = %e, "attempt failed, retrying on next tick"),
        }
        result
    }

    async fn connect(&self, scope: &CancellationToken) -> Result<TaskEnd, AttemptError> {
        let s = &self.services;
        let config = s.net.load().map_err(AttemptError::Config)?;
        let target = LinkTarget::from_config(&config, &s.settings.device, s.cipher.as_ref())
            .map_err(AttemptError::Config)?;
        info!(attempt = self.number, addr = %target.addr, server = %target.server_name, "connecting to manager");

        let outcome =
            connect_test(&target, &s.certs, s.transport.as_ref(), s.ctx.signals()).await;
        if outcome.is_terminal() {
            s.status.transition_or_warn(ConnectionStatus::ErrConfigured);
            self.halt.cancel();
            return Err(AttemptError::Terminal(outcome));
        }
        if !outcome.is_passed() {
            return Err(AttemptError::Probe(outcome));
        }

        let pre = config.status;
        if pre.is_none() {
            s.net
                .update(NetConfigPatch::status(Some(ConnectionStatus::Connecting)))
                .map_err(AttemptError::Config)?;
        }

        let mut installed: Option<Arc<ActiveConnection>> = None;
        let result = self.open(&config, &target, scope, &mut installed).await;
        match result {
            Ok(end) => Ok(end),
            Err(e) => {
                if let Some(conn) = installed {
                    s.ctx.mark_disconnected(conn.id());
                }
                s.status.transition_or_warn(ConnectionStatus::Connecting);
                Err(e)
            }
        }
    }

    async fn open(
        &self,
        config: &NetConfig,
        target: &LinkTarget,
        scope: &CancellationToken,
        installed: &mut Option<Arc<ActiveConnection>>,
    ) -> Result<TaskEnd, AttemptError> {
        let s = &self.services;
        let tls = s
            .certs
            .client_tls(&target.handshake_target(), s.transport.as_ref(), false)
            .await
            .map_err(AttemptError::Handshake)?;

        let session = match s.transport.open(target, Arc::clone(&tls.config), scope).await {
            Ok(session) => session,
            Err(edgeom_api::Error::InvalidStatusCode { status, body }) => {
                return Err(self.rejected_upgrade(status, &body));
            }
            Err(e) => return Err(AttemptError::Handshake(e.into())),
        };

        let conn = s.ctx.install(&config.ip, session.sender);
        *installed = Some(Arc::clone(&conn));
        self.session.store(conn.id(), Ordering::Release);

        if !config.server_name.is_empty() {
            let ip: IpAddr = target.addr.ip();
            s.hosts
                .set(ip, &config.server_name)
                .map_err(AttemptError::Handshake)?;
        }

        if !config.uses_initial_account() {
            s.status.transition_or_warn(ConnectionStatus::Connected);
        }
        match config.status {
            Some(ConnectionStatus::Connected) => {
                s.net
                    .update(NetConfigPatch::status(Some(ConnectionStatus::Ready)))
                    .map_err(AttemptError::Handshake)?;
                s.status.transition_or_warn(ConnectionStatus::Ready);
                if let Err(e) = s.expiry.check_once() {
                    warn!(error = %e, "certificate expiry check failed");
                }
            }
            Some(ConnectionStatus::Ready) => {
                s.status.transition_or_warn(ConnectionStatus::Ready);
            }
            _ => {}
        }

        if s.mef.ready_for_send() {
            match s.certs.cert_to_mef() {
                Ok(Some(cert)) => {
                    if let Err(e) = s.mef.send_fd_info(cert).await {
                        warn!(error = %e, "pushing manager identity to MEF failed");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "reading in-use chain for MEF failed"),
            }
        }

        info!(attempt = self.number, id = conn.id(), chain = %tls.name, "manager session established");
        Ok(run_task_group(Arc::clone(s), conn, session.receiver, scope.clone()).await)
    }

    /// Map a rejected WebSocket upgrade, persisting a reassigned node id.
    fn rejected_upgrade(&self, status: u16, body: &[u8]) -> AttemptError {
        let new_id = match parse_message_id(body) {
            Some((id, Some(arg))) if id == MSG_SPARE_NODE && !arg.is_empty() => arg,
            _ => return AttemptError::Handshake(CoreError::Rejected { status }),
        };
        let patch = NetConfigPatch {
            node_id: Some(new_id.clone()),
            ..NetConfigPatch::default()
        };
        match self.services.net.update(patch) {
            Ok(_) => {
                info!(node_id = %new_id, "manager reassigned node id");
                AttemptError::SpareNodeDetected(new_id)
            }
            Err(e) => AttemptError::Config(e),
        }
    }
}
