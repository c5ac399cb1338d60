// ── Agent ──
//
// The assembled lifecycle layer: service graph, connect monitor, manager
// switch and the process-wide background tasks. `Agent` is a cheaply
// cloneable handle; every clone drives the same instance.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::model::{NetConfig, NetConfigPatch};
use crate::monitor::ConnectMonitor;
use crate::services::{AgentDeps, Services};
use crate::state::ConnectionStatus;
use crate::store::NetConfigStore;
use crate::switch::{ManagerSwitch, SwitchRequest, SwitchStatus};

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Reset a status persisted mid-connect back to "first handshake".
///
/// A process that died while `connecting` must not resume as if the
/// handshake had progressed. Returns the row as it is after the reset.
pub fn check_and_reset_status(net: &dyn NetConfigStore) -> Result<NetConfig, CoreError> {
    let config = net.load()?;
    if config.status == Some(ConnectionStatus::Connecting) {
        info!("resetting interrupted connect status");
        return net.update(NetConfigPatch::status(None));
    }
    Ok(config)
}

#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    services: Arc<Services>,
    monitor: ConnectMonitor,
    switch: ManagerSwitch,
    high_risk: Mutex<()>,
    cancel: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("status", &self.status())
            .field("monitor", &self.inner.monitor)
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Build the process-wide agent. Fails when one was already installed
    /// in this process.
    pub fn install(deps: AgentDeps) -> Result<Self, CoreError> {
        if INSTALLED.swap(true, Ordering::AcqRel) {
            return Err(CoreError::Internal("agent already installed".into()));
        }
        Self::new(deps).inspect_err(|_| INSTALLED.store(false, Ordering::Release))
    }

    /// Build an agent without the one-per-process check.
    pub fn new(deps: AgentDeps) -> Result<Self, CoreError> {
        let services = Services::build(deps)?;
        let monitor = ConnectMonitor::new(Arc::clone(&services));
        let switch = ManagerSwitch::new(Arc::clone(&services), monitor.clone());
        Ok(Self {
            inner: Arc::new(AgentInner {
                services,
                monitor,
                switch,
                high_risk: Mutex::new(()),
                cancel: CancellationToken::new(),
                task_handles: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.inner.services
    }

    pub fn monitor(&self) -> &ConnectMonitor {
        &self.inner.monitor
    }

    /// Live status of the manager link.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.services.status.current()
    }

    /// Start the background work for the persisted configuration.
    pub async fn boot(&self) -> Result<(), CoreError> {
        let s = &self.inner.services;
        let config = check_and_reset_status(s.net.as_ref())?;

        let expiry = Arc::clone(&s.expiry);
        let cancel = self.inner.cancel.child_token();
        self.inner
            .task_handles
            .lock()
            .await
            .push(tokio::spawn(expiry.run(cancel)));

        if config.is_fusion_director() {
            info!(ip = %config.ip, "managed by FusionDirector, starting connect monitor");
            s.status.transition_or_warn(ConnectionStatus::Connecting);
            self.inner.monitor.start().await;
        } else {
            info!(manager = %config.manager_type, "no remote manager to connect to");
        }
        Ok(())
    }

    pub async fn switch_to(&self, request: SwitchRequest) -> Result<SwitchStatus, CoreError> {
        self.inner.switch.switch_to(request).await
    }

    /// Forget every manager binding and certificate.
    ///
    /// Shares the high-risk lock with other destructive operations; a
    /// held lock returns `Busy`.
    pub async fn factory_reset(&self) -> Result<(), CoreError> {
        let Ok(_guard) = self.inner.high_risk.try_lock() else {
            warn!("a high-risk operation is already running");
            return Err(CoreError::Busy);
        };
        let s = &self.inner.services;
        info!("factory reset of the manager link");

        self.inner.monitor.stop().await;
        s.mef.stop_connect_timer().await;
        s.ctx.take();

        let config = s.net.load()?;
        if !config.server_name.is_empty() {
            s.hosts.clear(&config.server_name)?;
        }
        s.certs.clear_all()?;
        s.net.replace(NetConfig::web_defaults())?;
        s.status.transition_or_warn(ConnectionStatus::NotConfigured);
        s.expiry.clean_fd_cert_alarm();
        Ok(())
    }

    /// Stop every task this agent started.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.monitor.stop().await;
        self.inner.services.ctx.take();

        let mut handles = self.inner.task_handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        debug!("agent stopped");
    }
}
