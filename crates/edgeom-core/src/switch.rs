// ── ManagerSwitch ──
//
// Moves the device between Web, FusionDirector and MEF management. Only
// one switch runs at a time; a second caller gets `Busy` immediately. A
// switch to FusionDirector commits the new row, restarts the monitor and
// then polls for a bounded time until the link reports ready.

use std::net::Ipv4Addr;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::context::Signal;
use crate::error::{CoreError, codes};
use crate::hosts::HostsFile;
use crate::model::{ManagerType, NetConfig};
use crate::monitor::ConnectMonitor;
use crate::probe::connect_test;
use crate::services::Services;
use crate::state::ConnectionStatus;
use crate::transport::LinkTarget;

const FORBIDDEN_NAMES: [&str; 6] = [
    "localhost",
    "localhost.localdomain",
    "localhost4",
    "localhost4.localdomain4",
    "localhost6",
    "localhost6.localdomain6",
];

const MAX_SERVER_NAME: usize = 64;
const MAX_ACCOUNT: usize = 256;
const MIN_PASSWORD: usize = 8;
const MAX_PASSWORD: usize = 256;
const MAX_NODE_ID: usize = 64;

// ── Requests ─────────────────────────────────────────────────────────

/// Parameters of a switch to FusionDirector.
#[derive(Debug)]
pub struct FdSwitchRequest {
    pub ip: String,
    /// Defaults to the device's configured port.
    pub port: Option<u16>,
    /// Defaults to the device's configured server name.
    pub server_name: Option<String>,
    pub account: String,
    pub password: SecretString,
    pub node_id: String,
    /// Run the connect test before committing anything.
    pub test: bool,
}

#[derive(Debug)]
pub enum SwitchRequest {
    Web,
    FusionDirector(FdSwitchRequest),
    Mef,
}

impl SwitchRequest {
    pub fn manager_type(&self) -> ManagerType {
        match self {
            Self::Web => ManagerType::Web,
            Self::FusionDirector(_) => ManagerType::FusionDirector,
            Self::Mef => ManagerType::Mef,
        }
    }
}

/// How a successful switch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchStatus {
    /// The FusionDirector link converged to `Ready`.
    Ready,
    /// Configuration saved; the link is still converging.
    Pending,
    /// Teardown finished (Web).
    Done,
}

impl SwitchStatus {
    pub fn pair(self) -> (u32, String) {
        match self {
            Self::Ready | Self::Done => (codes::SUCCESS, String::new()),
            Self::Pending => (codes::PENDING, "save config success".to_owned()),
        }
    }
}

/// `[code, message]` of a finished switch call.
pub fn result_pair(result: &Result<SwitchStatus, CoreError>) -> (u32, String) {
    match result {
        Ok(status) => status.pair(),
        Err(e) => e.pair(),
    }
}

// ── Validation ───────────────────────────────────────────────────────

fn invalid(message: impl Into<String>) -> CoreError {
    CoreError::ValidationFailed {
        message: message.into(),
    }
}

/// A manager address: IPv4, routable as a unicast host.
pub fn validate_ip(ip: &str) -> Result<Ipv4Addr, CoreError> {
    let addr: Ipv4Addr = ip
        .parse()
        .map_err(|_| invalid(format!("'{ip}' is not an IPv4 address")))?;
    if addr.is_loopback()
        || addr.is_broadcast()
        || addr.is_unspecified()
        || addr.is_multicast()
        || addr.octets()[0] == 0
    {
        return Err(invalid(format!("'{ip}' is not a usable host address")));
    }
    Ok(addr)
}

fn is_dns_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// A server name: DNS labels, not a local alias.
pub fn validate_server_name(name: &str, hosts: &HostsFile) -> Result<(), CoreError> {
    if name.len() > MAX_SERVER_NAME || !name.split('.').all(is_dns_label) {
        return Err(invalid(format!("'{name}' is not a valid server name")));
    }
    let lower = name.to_ascii_lowercase();
    if FORBIDDEN_NAMES.contains(&lower.as_str()) || hosts.is_loopback_alias(name) {
        return Err(invalid(format!("'{name}' resolves locally")));
    }
    Ok(())
}

pub fn validate_node_id(node_id: &str) -> Result<(), CoreError> {
    let ok = !node_id.is_empty()
        && node_id.len() <= MAX_NODE_ID
        && node_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if ok {
        Ok(())
    } else {
        Err(invalid(format!("'{node_id}' is not a valid node id")))
    }
}

impl FdSwitchRequest {
    pub fn validate(&self, hosts: &HostsFile) -> Result<(), CoreError> {
        validate_ip(&self.ip)?;
        if self.port == Some(0) {
            return Err(invalid("port must be 1..=65535"));
        }
        if let Some(name) = self.server_name.as_deref().filter(|n| !n.is_empty()) {
            validate_server_name(name, hosts)?;
        }
        if self.account.is_empty() || self.account.len() > MAX_ACCOUNT {
            return Err(invalid("account must be 1..=256 characters"));
        }
        let password = self.password.expose_secret().len();
        if !(MIN_PASSWORD..=MAX_PASSWORD).contains(&password) {
            return Err(invalid("password must be 8..=256 characters"));
        }
        validate_node_id(&self.node_id)
    }
}

// ── ManagerSwitch ────────────────────────────────────────────────────

pub struct ManagerSwitch {
    services: Arc<Services>,
    monitor: ConnectMonitor,
    lock: Mutex<()>,
}

impl std::fmt::Debug for ManagerSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerSwitch")
            .field("busy", &self.lock.try_lock().is_err())
            .finish_non_exhaustive()
    }
}

impl ManagerSwitch {
    pub fn new(services: Arc<Services>, monitor: ConnectMonitor) -> Self {
        Self {
            services,
            monitor,
            lock: Mutex::new(()),
        }
    }

    /// Switch the active manager.
    ///
    /// Returns `Busy` when another switch holds the lock. Failures map to
    /// result codes through [`CoreError::pair`]; anything unexpected
    /// reports the generic internal code.
    pub async fn switch_to(&self, request: SwitchRequest) -> Result<SwitchStatus, CoreError> {
        let Ok(_guard) = self.lock.try_lock() else {
            warn!("a manager switch is already running");
            return Err(CoreError::Busy);
        };

        let target = request.manager_type();
        info!(%target, "switching manager");
        let result = match request {
            SwitchRequest::Web => self.to_web().await,
            SwitchRequest::FusionDirector(request) => self.to_fusion_director(&request).await,
            SwitchRequest::Mef => self.to_mef().await,
        };
        match &result {
            Ok(status) => info!(%target, ?status, "manager switch finished"),
            Err(e) if e.code() == codes::INTERNAL => {
                error!(%target, error = %e, "manager switch failed unexpectedly");
            }
            Err(e) => warn!(%target, code = e.code(), error = %e, "manager switch refused"),
        }
        result
    }

    /// Stop every manager-side task: monitor, live attempt, MEF timer and
    /// the registered connection.
    async fn stop_links(&self) {
        self.monitor.stop().await;
        self.services.mef.stop_connect_timer().await;
        self.services.ctx.take();
    }

    fn clear_hosts_of(&self, config: &NetConfig) -> Result<(), CoreError> {
        if config.server_name.is_empty() {
            return Ok(());
        }
        info!(name = %config.server_name, "clearing hosts entry of the previous manager");
        self.services.hosts.clear(&config.server_name)
    }

    // ── Web ──────────────────────────────────────────────────────────

    async fn to_web(&self) -> Result<SwitchStatus, CoreError> {
        let s = &self.services;
        let last = s.net.load()?;
        self.clear_hosts_of(&last)?;
        s.net.replace(NetConfig::web_defaults())?;

        info!("stopping manager tasks for Web management");
        self.stop_links().await;
        s.status.transition_or_warn(ConnectionStatus::NotConfigured);
        s.expiry.clean_fd_cert_alarm();
        Ok(SwitchStatus::Done)
    }

    // ── MEF ──────────────────────────────────────────────────────────

    async fn to_mef(&self) -> Result<SwitchStatus, CoreError> {
        let s = &self.services;
        let last = s.net.load()?;
        self.clear_hosts_of(&last)?;
        s.net.replace(NetConfig {
            manager_type: ManagerType::Mef,
            status: Some(ConnectionStatus::Connecting),
            ..NetConfig::web_defaults()
        })?;

        self.stop_links().await;
        s.status.transition_or_warn(ConnectionStatus::Connecting);
        s.expiry.clean_fd_cert_alarm();
        s.mef.start_connect_timer().await;
        Ok(SwitchStatus::Pending)
    }

    // ── FusionDirector ───────────────────────────────────────────────

    /// The row a switch to `request` persists.
    ///
    /// Re-submitting the same address and account with a new password is
    /// a manual credential update and keeps the persisted status; any
    /// other change starts over from a first handshake.
    fn candidate(&self, last: &NetConfig, request: &FdSwitchRequest) -> Result<NetConfig, CoreError> {
        let s = &self.services;
        let device = &s.settings.device;
        let new_password = request.password.expose_secret();

        let password_changed = last.cloud_pwd.is_empty()
            || !s
                .cipher
                .decrypt(&last.cloud_pwd)
                .is_ok_and(|old| old.expose_secret() == new_password);
        let manual_update =
            last.ip == request.ip && last.cloud_user == request.account && password_changed;

        Ok(NetConfig {
            manager_type: ManagerType::FusionDirector,
            ip: request.ip.clone(),
            port: request.port.unwrap_or(device.default_port),
            server_name: request
                .server_name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| device.default_server_name.clone()),
            status: if manual_update { last.status } else { None },
            cloud_user: request.account.clone(),
            cloud_pwd: s.cipher.encrypt(new_password)?,
            node_id: request.node_id.clone(),
        })
    }

    async fn to_fusion_director(&self, request: &FdSwitchRequest) -> Result<SwitchStatus, CoreError> {
        let s = &self.services;
        request.validate(&s.hosts)?;
        s.ctx.signals().clear();

        if !s.sysinfo.docker_root_mounted() {
            return Err(CoreError::DockerRootNotMounted);
        }

        let last = s.net.load()?;
        let candidate = self.candidate(&last, request)?;

        if request.test {
            info!(ip = %candidate.ip, "running connect test");
            let target = LinkTarget::from_config(&candidate, &s.settings.device, s.cipher.as_ref())?;
            let outcome = connect_test(&target, &s.certs, s.transport.as_ref(), s.ctx.signals()).await;
            s.ctx.signals().clear();
            if let Some(e) = outcome.into_error() {
                return Err(e);
            }
            info!("connect test passed");
        }

        s.net.replace(candidate)?;
        info!(ip = %request.ip, "configuration saved, waiting for the per-device credentials");

        self.stop_links().await;
        // The old attempt may have raised a verdict while it wound down.
        s.ctx.signals().clear();
        s.status.transition_or_warn(ConnectionStatus::Connecting);
        self.monitor.start().await;
        s.mef.start_connect_timer().await;

        self.await_ready().await
    }

    /// Poll until the link is ready, a credential signal arrives, or the
    /// poll window runs out.
    async fn await_ready(&self) -> Result<SwitchStatus, CoreError> {
        let s = &self.services;
        let settings = &s.settings.switch;
        let signals = s.ctx.signals();

        for round in 1..=settings.poll_rounds {
            tokio::time::sleep(settings.poll_interval).await;

            let persisted = s.net.load()?.status;
            if persisted == Some(ConnectionStatus::Ready)
                && s.status.current() == ConnectionStatus::Ready
                && s.ctx.ready_for_send()
            {
                info!(round, "manager link ready");
                return Ok(SwitchStatus::Ready);
            }

            if signals.is_set(Signal::AccountInvalid) {
                return Err(self.abandon(CoreError::AccountInvalid).await);
            }
            if signals.is_set(Signal::IpLocked) {
                return Err(self.abandon(CoreError::IpLocked).await);
            }
            if signals.is_set(Signal::CertInvalid) || signals.is_set(Signal::IpPortInvalid) {
                debug!(
                    round,
                    "certificate or address rejected, reporting pending for the caller to poll"
                );
                break;
            }
        }

        info!("manager link still converging");
        Ok(SwitchStatus::Pending)
    }

    async fn abandon(&self, err: CoreError) -> CoreError {
        error!(error = %err, "manager refused the device, stopping reconnects");
        self.services
            .status
            .transition_or_warn(ConnectionStatus::ErrConfigured);
        self.monitor.stop().await;
        err
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn hosts() -> (tempfile::TempDir, HostsFile) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1 localhost edge-box\n::1 ip6-localhost\n").unwrap();
        (dir, HostsFile::new(path))
    }

    fn request() -> FdSwitchRequest {
        FdSwitchRequest {
            ip: "10.20.0.8".into(),
            port: None,
            server_name: Some("fd.example.test".into()),
            account: "EdgeAccount".into(),
            password: SecretString::from("Initial#Pass1".to_owned()),
            node_id: "node-0001".into(),
            test: false,
        }
    }

    #[test]
    fn host_addresses_only() {
        assert!(validate_ip("10.20.0.8").is_ok());
        for bad in ["127.0.0.1", "255.255.255.255", "0.0.0.0", "0.1.2.3", "224.0.0.1", "fe80::1", "fd.example"] {
            assert!(validate_ip(bad).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn server_names_must_not_resolve_locally() {
        let (_dir, hosts) = hosts();
        assert!(validate_server_name("fd.example.test", &hosts).is_ok());
        assert!(validate_server_name("LOCALHOST", &hosts).is_err());
        assert!(validate_server_name("edge-box", &hosts).is_err());
        assert!(validate_server_name("-bad.example", &hosts).is_err());
        assert!(validate_server_name(&"a".repeat(65), &hosts).is_err());
    }

    #[test]
    fn request_limits() {
        let (_dir, hosts) = hosts();
        assert!(request().validate(&hosts).is_ok());

        let mut short = request();
        short.password = SecretString::from("short".to_owned());
        assert!(short.validate(&hosts).is_err());

        let mut no_account = request();
        no_account.account.clear();
        assert!(no_account.validate(&hosts).is_err());

        let mut bad_node = request();
        bad_node.node_id = "node_01".into();
        assert!(bad_node.validate(&hosts).is_err());

        let mut zero_port = request();
        zero_port.port = Some(0);
        assert!(zero_port.validate(&hosts).is_err());
    }

    #[test]
    fn pending_is_not_an_error() {
        assert_eq!(SwitchStatus::Ready.pair(), (0, String::new()));
        assert_eq!(SwitchStatus::Pending.pair().0, 206);
        assert_eq!(result_pair(&Err(CoreError::Busy)).0, codes::BUSY);
        assert_eq!(
            result_pair(&Err(CoreError::AccountInvalid)),
            (110_207, "The user name or password error.".to_owned())
        );
    }
}
