// ── Persisted domain model ──
//
// Rows the lifecycle layer reads and writes through the persistence seams:
// the single active network configuration and the certificate pool.

pub mod cert;
pub mod net;

// ── Re-exports ──────────────────────────────────────────────────────

pub use cert::{CertEntry, CertInfoForFd, CertPool, CertSource, CertSummary, CrlEntry, MefCert};
pub use net::{FD_INIT_ACCOUNT, ManagerType, NetConfig, NetConfigPatch};
