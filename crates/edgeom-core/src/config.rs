// ── Runtime settings ──
//
// Already-resolved knobs handed to the lifecycle services. These never
// touch disk; the binary builds them from `edgeom_config::AgentConfig`.

use std::time::Duration;

use crate::model::net::DEFAULT_PORT;

/// Connect-monitor timing.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Period of the reconnect tick.
    pub retry_interval: Duration,
    /// Polls of the system-info gate before the first tick.
    pub gate_wait_rounds: u32,
    pub gate_poll: Duration,
    /// Polls confirming that a stopped task actually ended.
    pub wait_max_cnt: u32,
    pub stop_poll: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(60),
            gate_wait_rounds: 60,
            gate_poll: Duration::from_secs(1),
            wait_max_cnt: 30,
            stop_poll: Duration::from_millis(100),
        }
    }
}

/// Convergence polling of a switch to FusionDirector.
#[derive(Debug, Clone)]
pub struct SwitchSettings {
    pub poll_interval: Duration,
    pub poll_rounds: u32,
}

impl Default for SwitchSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            poll_rounds: 24,
        }
    }
}

/// Timeouts of the connectivity pre-check and TLS handshakes.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub tcp_timeout: Duration,
    pub http_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            tcp_timeout: Duration::from_secs(5),
            http_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// Background task periods of a live connection.
#[derive(Debug, Clone)]
pub struct TaskSettings {
    pub heartbeat: Duration,
    pub sys_info: Duration,
    pub status: Duration,
    pub send_timeout: Duration,
    pub dispatch_rate_per_sec: u32,
    pub dispatch_burst: u32,
    pub max_message_bytes: usize,
    pub channel_capacity: usize,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(30),
            sys_info: Duration::from_secs(120),
            status: Duration::from_secs(60),
            send_timeout: Duration::from_secs(30),
            dispatch_rate_per_sec: 10,
            dispatch_burst: 20,
            max_message_bytes: 4 * 1024 * 1024,
            channel_capacity: 256,
        }
    }
}

/// Limits of the certificate pool.
#[derive(Debug, Clone)]
pub struct CertPolicy {
    /// Most manager-pushed chains kept at once.
    pub fd_limit: usize,
    /// Most chains of any source.
    pub total_limit: usize,
    pub max_chain: usize,
    pub max_file_bytes: usize,
    pub expiry_threshold_days: i64,
    pub expiry_check: Duration,
}

impl Default for CertPolicy {
    fn default() -> Self {
        Self {
            fd_limit: 2,
            total_limit: 3,
            max_chain: 10,
            max_file_bytes: 1024 * 1024,
            expiry_threshold_days: 10,
            expiry_check: Duration::from_secs(24 * 3600),
        }
    }
}

/// Identity the device presents to the manager.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub product_name: String,
    pub serial_number: String,
    pub asset_tag: String,
    pub dev_mgmt_type: String,
    pub default_server_name: String,
    pub default_port: u16,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            product_name: "Atlas 500".into(),
            serial_number: String::new(),
            asset_tag: String::new(),
            dev_mgmt_type: "AtlasEdge".into(),
            default_server_name: String::new(),
            default_port: DEFAULT_PORT,
        }
    }
}

/// Everything the lifecycle layer is tuned by.
#[derive(Debug, Clone, Default)]
pub struct AgentSettings {
    pub monitor: MonitorSettings,
    pub switch: SwitchSettings,
    pub probe: ProbeSettings,
    pub tasks: TaskSettings,
    pub certs: CertPolicy,
    pub device: DeviceIdentity,
}
