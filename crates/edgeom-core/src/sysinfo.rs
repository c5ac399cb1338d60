// ── System information seam ──
//
// What the device reports about itself on the live connection, and the
// one-time "collected" gate the monitor waits for after boot.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde_json::{Value, json};

use crate::config::DeviceIdentity;

pub trait SystemInfoSource: Send + Sync {
    /// System information has been gathered at least once since boot.
    fn collected(&self) -> bool;

    /// Payload of `websocket/sys_info`.
    fn system_info(&self) -> Value;

    /// Payload of `websocket/sys_status`.
    fn status(&self) -> Value;

    /// The container storage root sits on its own mount.
    fn docker_root_mounted(&self) -> bool;
}

/// Reports the configured identity and checks the docker root on the
/// local filesystem.
#[derive(Debug)]
pub struct HostSystemInfo {
    identity: DeviceIdentity,
    docker_root: PathBuf,
    collected: AtomicBool,
    started: Instant,
}

impl HostSystemInfo {
    pub fn new(identity: DeviceIdentity, docker_root: impl Into<PathBuf>) -> Self {
        Self {
            identity,
            docker_root: docker_root.into(),
            collected: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    /// Open the gate.
    pub fn mark_collected(&self) {
        if !self.collected.swap(true, Ordering::AcqRel) {
            tracing::info!("system information collected");
        }
    }
}

impl SystemInfoSource for HostSystemInfo {
    fn collected(&self) -> bool {
        self.collected.load(Ordering::Acquire)
    }

    fn system_info(&self) -> Value {
        json!({
            "ProductName": self.identity.product_name,
            "SerialNumber": self.identity.serial_number,
            "AssetTag": self.identity.asset_tag,
            "DevMgmtType": self.identity.dev_mgmt_type,
            "AgentVersion": env!("CARGO_PKG_VERSION"),
        })
    }

    fn status(&self) -> Value {
        json!({
            "Health": "OK",
            "UptimeSeconds": self.started.elapsed().as_secs(),
        })
    }

    #[cfg(unix)]
    fn docker_root_mounted(&self) -> bool {
        use std::os::unix::fs::MetadataExt;

        let Some(parent) = self.docker_root.parent() else {
            return false;
        };
        match (std::fs::metadata(&self.docker_root), std::fs::metadata(parent)) {
            (Ok(dir), Ok(up)) => dir.dev() != up.dev(),
            _ => false,
        }
    }

    #[cfg(not(unix))]
    fn docker_root_mounted(&self) -> bool {
        self.docker_root.is_dir()
    }
}
