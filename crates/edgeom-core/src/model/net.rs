// ── Network configuration row ──

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::state::ConnectionStatus;

/// Shared account every device uses for its first handshake with a new
/// manager. The manager replaces it with a per-device account.
pub const FD_INIT_ACCOUNT: &str = "EdgeAccount";

pub const DEFAULT_PORT: u16 = 443;

/// Which manager governs the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString)]
pub enum ManagerType {
    #[default]
    Web,
    FusionDirector,
    #[serde(rename = "MEF")]
    #[strum(serialize = "MEF")]
    Mef,
}

/// The single active network-management row.
///
/// `status` is the persisted progress marker of the manager link, not the
/// live state machine: `None` (stored as `""`) means the next handshake is
/// the first one toward this manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetConfig {
    pub manager_type: ManagerType,
    #[serde(default)]
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub server_name: String,
    #[serde(default, with = "persisted_status")]
    pub status: Option<ConnectionStatus>,
    #[serde(default)]
    pub cloud_user: String,
    /// Encrypted with the agent's [`PasswordCipher`](crate::cipher::PasswordCipher).
    #[serde(default)]
    pub cloud_pwd: String,
    #[serde(default)]
    pub node_id: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl NetConfig {
    /// Row written at provisioning and on every switch back to Web.
    pub fn web_defaults() -> Self {
        Self {
            manager_type: ManagerType::Web,
            ip: String::new(),
            port: DEFAULT_PORT,
            server_name: String::new(),
            status: Some(ConnectionStatus::NotConfigured),
            cloud_user: String::new(),
            cloud_pwd: String::new(),
            node_id: String::new(),
        }
    }

    pub fn is_fusion_director(&self) -> bool {
        self.manager_type == ManagerType::FusionDirector
    }

    /// Host presented to the manager: the server name when set, else the IP.
    pub fn host(&self) -> &str {
        if self.server_name.is_empty() {
            &self.ip
        } else {
            &self.server_name
        }
    }

    /// Still on the shared initial account.
    pub fn uses_initial_account(&self) -> bool {
        self.cloud_user == FD_INIT_ACCOUNT
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self::web_defaults()
    }
}

/// Partial update applied atomically to the stored row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetConfigPatch {
    pub manager_type: Option<ManagerType>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub server_name: Option<String>,
    /// `Some(None)` clears the status back to `""`.
    pub status: Option<Option<ConnectionStatus>>,
    pub cloud_user: Option<String>,
    pub cloud_pwd: Option<String>,
    pub node_id: Option<String>,
}

impl NetConfigPatch {
    pub fn status(status: Option<ConnectionStatus>) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn apply(self, config: &mut NetConfig) {
        if let Some(v) = self.manager_type {
            config.manager_type = v;
        }
        if let Some(v) = self.ip {
            config.ip = v;
        }
        if let Some(v) = self.port {
            config.port = v;
        }
        if let Some(v) = self.server_name {
            config.server_name = v;
        }
        if let Some(v) = self.status {
            config.status = v;
        }
        if let Some(v) = self.cloud_user {
            config.cloud_user = v;
        }
        if let Some(v) = self.cloud_pwd {
            config.cloud_pwd = v;
        }
        if let Some(v) = self.node_id {
            config.node_id = v;
        }
    }
}

/// `Option<ConnectionStatus>` stored as a plain string, `""` for `None`.
mod persisted_status {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::state::ConnectionStatus;

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        status: &Option<ConnectionStatus>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(status.map_or("", ConnectionStatus::as_str))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<ConnectionStatus>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse().map(Some).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn status_round_trips_through_plain_strings() {
        let mut cfg = NetConfig::web_defaults();
        cfg.status = None;
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["status"], "");
        assert_eq!(json["manager_type"], "Web");

        cfg.status = Some(ConnectionStatus::Ready);
        let back: NetConfig = serde_json::from_str(&serde_json::to_string(&cfg).unwrap()).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn unknown_status_is_rejected() {
        let raw = r#"{"manager_type":"FusionDirector","status":"sleepy"}"#;
        assert!(serde_json::from_str::<NetConfig>(raw).is_err());
    }

    #[test]
    fn mef_uses_upper_case_name() {
        assert_eq!(serde_json::to_value(ManagerType::Mef).unwrap(), "MEF");
        assert_eq!("MEF".parse::<ManagerType>().unwrap(), ManagerType::Mef);
    }

    #[test]
    fn patch_only_touches_given_fields() {
        let mut cfg = NetConfig::web_defaults();
        NetConfigPatch {
            cloud_user: Some("dev-01".into()),
            status: Some(None),
            ..NetConfigPatch::default()
        }
        .apply(&mut cfg);
        assert_eq!(cfg.cloud_user, "dev-01");
        assert_eq!(cfg.status, None);
        assert_eq!(cfg.port, DEFAULT_PORT);
    }

    #[test]
    fn host_prefers_server_name() {
        let mut cfg = NetConfig::web_defaults();
        cfg.ip = "10.0.0.8".into();
        assert_eq!(cfg.host(), "10.0.0.8");
        cfg.server_name = "fd.example.test".into();
        assert_eq!(cfg.host(), "fd.example.test");
    }
}
