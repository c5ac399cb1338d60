//! Configuration for the edgeom agent.
//!
//! Built-in defaults, then a TOML file, then `EDGEOM_`-prefixed environment
//! variables with `__` between section and key
//! (`EDGEOM_MONITOR__RETRY_INTERVAL_SECS=30`). [`AgentConfig::settings`]
//! resolves the result into the runtime settings `edgeom_core` consumes;
//! core itself never reads configuration files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use edgeom_core::config::{
    AgentSettings, CertPolicy, DeviceIdentity, MonitorSettings, ProbeSettings, SwitchSettings,
    TaskSettings,
};

pub const ENV_PREFIX: &str = "EDGEOM_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── Sections ────────────────────────────────────────────────────────

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    pub paths: PathsConfig,
    pub log: LogConfig,
    pub monitor: MonitorConfig,
    pub switch: SwitchConfig,
    pub probe: ProbeConfig,
    pub tasks: TasksConfig,
    pub certs: CertsConfig,
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Holds the network configuration and certificate pool files.
    pub state_dir: PathBuf,
    pub hosts_file: PathBuf,
    /// Key for the stored manager password; created on first start.
    pub key_file: PathBuf,
    /// Container storage root that must sit on its own mount before the
    /// device can be managed remotely.
    pub docker_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/edgeom"),
            hosts_file: PathBuf::from("/etc/hosts"),
            key_file: PathBuf::from("/var/lib/edgeom/password.key"),
            docker_root: PathBuf::from("/var/lib/docker"),
        }
    }
}

impl PathsConfig {
    pub fn net_config_file(&self) -> PathBuf {
        self.state_dir.join("net_config.json")
    }

    pub fn cert_pool_file(&self) -> PathBuf {
        self.state_dir.join("cert_pool.json")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
    /// Also write a daily-rotated log file here.
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            directory: None,
            file_prefix: "edgeom.log".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub retry_interval_secs: u64,
    pub gate_wait_rounds: u32,
    pub gate_poll_secs: u64,
    /// Rounds spent confirming a stopped task actually ended.
    pub wait_max_cnt: u32,
    pub stop_poll_millis: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            retry_interval_secs: 60,
            gate_wait_rounds: 60,
            gate_poll_secs: 1,
            wait_max_cnt: 30,
            stop_poll_millis: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SwitchConfig {
    pub poll_interval_secs: u64,
    pub poll_rounds: u32,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            poll_rounds: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub tcp_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            tcp_timeout_secs: 5,
            http_timeout_secs: 5,
            handshake_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TasksConfig {
    pub heartbeat_secs: u64,
    pub sys_info_secs: u64,
    pub status_secs: u64,
    pub send_timeout_secs: u64,
    pub dispatch_rate_per_sec: u32,
    pub dispatch_burst: u32,
    pub max_message_bytes: usize,
    pub channel_capacity: usize,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 30,
            sys_info_secs: 120,
            status_secs: 60,
            send_timeout_secs: 30,
            dispatch_rate_per_sec: 10,
            dispatch_burst: 20,
            max_message_bytes: 4 * 1024 * 1024,
            channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CertsConfig {
    /// Chains the manager may push.
    pub fd_limit: usize,
    pub total_limit: usize,
    pub max_chain: usize,
    pub max_file_bytes: usize,
    pub expiry_threshold_days: i64,
    pub expiry_check_hours: u64,
}

impl Default for CertsConfig {
    fn default() -> Self {
        Self {
            fd_limit: 2,
            total_limit: 3,
            max_chain: 10,
            max_file_bytes: 1024 * 1024,
            expiry_threshold_days: 10,
            expiry_check_hours: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub product_name: String,
    pub serial_number: String,
    pub asset_tag: String,
    pub dev_mgmt_type: String,
    pub default_server_name: String,
    pub default_port: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let identity = DeviceIdentity::default();
        Self {
            product_name: identity.product_name,
            serial_number: identity.serial_number,
            asset_tag: identity.asset_tag,
            dev_mgmt_type: identity.dev_mgmt_type,
            default_server_name: identity.default_server_name,
            default_port: identity.default_port,
        }
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Default config file: `/etc/edgeom/config.toml` when it exists, else the
/// platform config directory.
pub fn config_path() -> PathBuf {
    let system = PathBuf::from("/etc/edgeom/config.toml");
    if system.exists() {
        return system;
    }
    ProjectDirs::from("com", "edgeom", "edgeom")
        .map_or(system, |dirs| dirs.config_dir().join("config.toml"))
}

// ── Loading ─────────────────────────────────────────────────────────

impl AgentConfig {
    /// The provider stack, without extracting.
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate. A missing file leaves the defaults in place.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map_or_else(config_path, Path::to_path_buf);
        let config: Self = Self::figment(&path).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the agent cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("monitor.retry_interval_secs", self.monitor.retry_interval_secs),
            ("monitor.gate_poll_secs", self.monitor.gate_poll_secs),
            ("monitor.stop_poll_millis", self.monitor.stop_poll_millis),
            ("switch.poll_interval_secs", self.switch.poll_interval_secs),
            ("probe.tcp_timeout_secs", self.probe.tcp_timeout_secs),
            ("probe.http_timeout_secs", self.probe.http_timeout_secs),
            ("probe.handshake_timeout_secs", self.probe.handshake_timeout_secs),
            ("tasks.heartbeat_secs", self.tasks.heartbeat_secs),
            ("tasks.sys_info_secs", self.tasks.sys_info_secs),
            ("tasks.status_secs", self.tasks.status_secs),
            ("tasks.send_timeout_secs", self.tasks.send_timeout_secs),
            ("certs.expiry_check_hours", self.certs.expiry_check_hours),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }

        if self.monitor.wait_max_cnt == 0 {
            return Err(invalid("monitor.wait_max_cnt", "must be greater than zero"));
        }
        if self.switch.poll_rounds == 0 {
            return Err(invalid("switch.poll_rounds", "must be greater than zero"));
        }
        if self.tasks.dispatch_rate_per_sec == 0 || self.tasks.dispatch_burst == 0 {
            return Err(invalid(
                "tasks.dispatch_rate_per_sec",
                "rate and burst must be greater than zero",
            ));
        }
        if self.tasks.channel_capacity == 0 || self.tasks.max_message_bytes == 0 {
            return Err(invalid(
                "tasks.channel_capacity",
                "channel and message limits must be greater than zero",
            ));
        }

        let certs = &self.certs;
        if certs.total_limit == 0 || certs.fd_limit > certs.total_limit {
            return Err(invalid(
                "certs.fd_limit",
                format!(
                    "need fd_limit <= total_limit and total_limit >= 1, got {} / {}",
                    certs.fd_limit, certs.total_limit
                ),
            ));
        }
        if !(1..=10).contains(&certs.max_chain) {
            return Err(invalid("certs.max_chain", "must be 1..=10"));
        }
        if certs.max_file_bytes == 0 {
            return Err(invalid("certs.max_file_bytes", "must be greater than zero"));
        }
        if certs.expiry_threshold_days < 0 {
            return Err(invalid("certs.expiry_threshold_days", "must not be negative"));
        }
        if self.device.default_port == 0 {
            return Err(invalid("device.default_port", "must be 1..=65535"));
        }
        Ok(())
    }

    /// Runtime settings for `edgeom_core`.
    pub fn settings(&self) -> AgentSettings {
        AgentSettings {
            monitor: MonitorSettings {
                retry_interval: Duration::from_secs(self.monitor.retry_interval_secs),
                gate_wait_rounds: self.monitor.gate_wait_rounds,
                gate_poll: Duration::from_secs(self.monitor.gate_poll_secs),
                wait_max_cnt: self.monitor.wait_max_cnt,
                stop_poll: Duration::from_millis(self.monitor.stop_poll_millis),
            },
            switch: SwitchSettings {
                poll_interval: Duration::from_secs(self.switch.poll_interval_secs),
                poll_rounds: self.switch.poll_rounds,
            },
            probe: ProbeSettings {
                tcp_timeout: Duration::from_secs(self.probe.tcp_timeout_secs),
                http_timeout: Duration::from_secs(self.probe.http_timeout_secs),
                handshake_timeout: Duration::from_secs(self.probe.handshake_timeout_secs),
            },
            tasks: TaskSettings {
                heartbeat: Duration::from_secs(self.tasks.heartbeat_secs),
                sys_info: Duration::from_secs(self.tasks.sys_info_secs),
                status: Duration::from_secs(self.tasks.status_secs),
                send_timeout: Duration::from_secs(self.tasks.send_timeout_secs),
                dispatch_rate_per_sec: self.tasks.dispatch_rate_per_sec,
                dispatch_burst: self.tasks.dispatch_burst,
                max_message_bytes: self.tasks.max_message_bytes,
                channel_capacity: self.tasks.channel_capacity,
            },
            certs: CertPolicy {
                fd_limit: self.certs.fd_limit,
                total_limit: self.certs.total_limit,
                max_chain: self.certs.max_chain,
                max_file_bytes: self.certs.max_file_bytes,
                expiry_threshold_days: self.certs.expiry_threshold_days,
                expiry_check: Duration::from_secs(self.certs.expiry_check_hours * 3600),
            },
            device: DeviceIdentity {
                product_name: self.device.product_name.clone(),
                serial_number: self.device.serial_number.clone(),
                asset_tag: self.device.asset_tag.clone(),
                dev_mgmt_type: self.device.dev_mgmt_type.clone(),
                default_server_name: self.device.default_server_name.clone(),
                default_port: self.device.default_port,
            },
        }
    }
}
