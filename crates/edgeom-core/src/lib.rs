// edgeom-core: Connection lifecycle toward the remote manager, the
// certificate pool it trusts, and manager switching.

pub mod agent;
pub mod alarm;
pub mod attempt;
pub mod cert;
pub mod cipher;
pub mod clock;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod hosts;
pub mod mef;
pub mod model;
pub mod monitor;
pub mod outbox;
pub mod probe;
pub mod services;
pub mod state;
pub mod store;
pub mod switch;
pub mod sysinfo;
pub mod tasks;
pub mod transport;

// ── Primary re-exports ──────────────────────────────────────────────
pub use agent::{Agent, check_and_reset_status};
pub use cert::{CertStore, HandshakeProbe, HandshakeTarget};
pub use config::AgentSettings;
pub use context::{ConnectionContext, Signal};
pub use error::CoreError;
pub use monitor::{ConnectMonitor, Decision};
pub use services::{AgentDeps, Services};
pub use state::{ConnectionStatus, StatusMachine};
pub use switch::{FdSwitchRequest, ManagerSwitch, SwitchRequest, SwitchStatus};
pub use transport::{FdTransport, LinkTarget, WireTransport};

// Re-export model types at the crate root for ergonomics.
pub use model::{
    CertEntry, CertInfoForFd, CertSource, CertSummary, CrlEntry, ManagerType, NetConfig,
    NetConfigPatch,
};
