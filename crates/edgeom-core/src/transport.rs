// ── Manager transport seam ──
//
// Everything the lifecycle layer does on the wire goes through
// `FdTransport`, so tests can stand in for the manager with in-memory
// sessions. `WireTransport` is the real implementation over `edgeom_api`.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use edgeom_api::probe::{self, ProbeVerdict};
use edgeom_api::{DeviceHeaders, Session, SessionConfig, TransportConfig};
use rustls::ClientConfig;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::cert::{HandshakeProbe, HandshakeTarget};
use crate::cipher::PasswordCipher;
use crate::config::{DeviceIdentity, ProbeSettings, TaskSettings};
use crate::error::CoreError;
use crate::model::NetConfig;

/// Resolved endpoint and identity for one manager.
#[derive(Debug, Clone)]
pub struct LinkTarget {
    /// Where TCP connects: the configured IP and port.
    pub addr: SocketAddr,
    /// Name presented for SNI and in URIs.
    pub server_name: String,
    pub port: u16,
    pub node_id: String,
    pub headers: DeviceHeaders,
}

impl LinkTarget {
    pub fn from_config(
        config: &NetConfig,
        identity: &DeviceIdentity,
        cipher: &dyn PasswordCipher,
    ) -> Result<Self, CoreError> {
        let ip: Ipv4Addr = config.ip.parse().map_err(|_| CoreError::ValidationFailed {
            message: format!("manager address '{}' is not IPv4", config.ip),
        })?;
        let password = if config.cloud_pwd.is_empty() {
            SecretString::from(String::new())
        } else {
            cipher.decrypt(&config.cloud_pwd)?
        };
        let serial_number = if identity.serial_number.is_empty() {
            config.node_id.clone()
        } else {
            identity.serial_number.clone()
        };

        Ok(Self {
            addr: SocketAddr::from((ip, config.port)),
            server_name: config.host().to_owned(),
            port: config.port,
            node_id: config.node_id.clone(),
            headers: DeviceHeaders {
                account: config.cloud_user.clone(),
                password,
                product_name: identity.product_name.clone(),
                serial_number,
                asset_tag: identity.asset_tag.clone(),
                dev_mgmt_type: identity.dev_mgmt_type.clone(),
            },
        })
    }

    pub fn handshake_target(&self) -> HandshakeTarget {
        HandshakeTarget {
            addr: self.addr,
            server_name: self.server_name.clone(),
        }
    }

    pub fn account_check_url(&self) -> Result<Url, CoreError> {
        Url::parse(&format!(
            "https://{}:{}/websocket/{}/AccountCheck",
            self.server_name, self.port, self.node_id
        ))
        .map_err(|e| CoreError::ValidationFailed {
            message: format!("invalid manager URL: {e}"),
        })
    }
}

/// Wire operations toward the manager.
#[async_trait]
pub trait FdTransport: HandshakeProbe {
    /// Plain TCP reachability of `addr`.
    async fn reachable(&self, addr: SocketAddr) -> Result<(), CoreError>;

    /// The REST account check.
    async fn account_check(
        &self,
        target: &LinkTarget,
        tls: Arc<ClientConfig>,
    ) -> Result<ProbeVerdict, CoreError>;

    /// Open the event session. Returns the wire error untouched so the
    /// caller can inspect a rejected upgrade's body.
    async fn open(
        &self,
        target: &LinkTarget,
        tls: Arc<ClientConfig>,
        cancel: &CancellationToken,
    ) -> Result<Session, edgeom_api::Error>;
}

// ── WireTransport ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WireTransport {
    probe: ProbeSettings,
    tasks: TaskSettings,
}

impl WireTransport {
    pub fn new(probe: ProbeSettings, tasks: TaskSettings) -> Self {
        Self { probe, tasks }
    }
}

#[async_trait]
impl HandshakeProbe for WireTransport {
    async fn handshake(
        &self,
        target: &HandshakeTarget,
        tls: Arc<ClientConfig>,
    ) -> Result<(), CoreError> {
        edgeom_api::tls::handshake(
            tls,
            target.addr,
            &target.server_name,
            self.probe.handshake_timeout,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl FdTransport for WireTransport {
    async fn reachable(&self, addr: SocketAddr) -> Result<(), CoreError> {
        probe::tcp_reachable(addr, self.probe.tcp_timeout).await?;
        Ok(())
    }

    async fn account_check(
        &self,
        target: &LinkTarget,
        tls: Arc<ClientConfig>,
    ) -> Result<ProbeVerdict, CoreError> {
        let transport = TransportConfig {
            tls: Some(tls),
            timeout: self.probe.http_timeout,
            resolve: Some((target.server_name.clone(), target.addr)),
        };
        let client = transport.build_client(target.headers.header_map()?)?;
        let url = target.account_check_url()?;
        Ok(probe::account_check(&client, &url).await?)
    }

    async fn open(
        &self,
        target: &LinkTarget,
        tls: Arc<ClientConfig>,
        cancel: &CancellationToken,
    ) -> Result<Session, edgeom_api::Error> {
        let url = SessionConfig::events_url(&target.server_name, target.port, &target.node_id)?;
        let mut config = SessionConfig::new(url, target.addr);
        config.headers = target.headers.pairs();
        config.tls = Some(tls);
        config.connect_timeout = self.probe.handshake_timeout;
        config.send_timeout = self.tasks.send_timeout;
        config.channel_capacity = self.tasks.channel_capacity;
        edgeom_api::websocket::connect(config, cancel).await
    }
}
