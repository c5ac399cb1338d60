// ── Core error types ──
//
// Errors surfaced by the lifecycle layer. Every variant maps onto one of
// the numeric result codes the device management API returns, through
// `code()` and `pair()`. The `From<edgeom_api::Error>` impl translates
// wire-level failures into the same vocabulary.

use thiserror::Error;

use crate::state::ConnectionStatus;

/// Numeric result codes of the device management API.
pub mod codes {
    pub const SUCCESS: u32 = 0;
    pub const PENDING: u32 = 206;
    pub const PARAM_INVALID: u32 = 100_024;
    pub const BUSY: u32 = 100_028;
    pub const ACCOUNT_INVALID: u32 = 110_207;
    pub const INTERNAL: u32 = 110_224;
    pub const IP_LOCKED: u32 = 110_225;
    pub const DOCKER_ROOT_NOT_MOUNTED: u32 = 110_226;

    pub const CERT_ABOUT_TO_EXPIRE: u32 = 110_301;
    pub const CERT_DUPLICATE: u32 = 110_302;
    pub const CERT_TOO_LARGE: u32 = 110_303;
    pub const CERT_POOL_FULL: u32 = 110_304;
    pub const CRL_INVALID: u32 = 110_305;
    pub const CRL_EXPIRED: u32 = 110_306;
    pub const CRL_DUPLICATE: u32 = 110_307;
    pub const CERT_EXPIRED: u32 = 110_308;
    pub const CERT_IN_USE: u32 = 110_309;
    pub const CERT_NOT_FOUND: u32 = 110_310;
    pub const CERT_INVALID: u32 = 110_311;
    pub const PUBKEY_TYPE_INVALID: u32 = 110_313;
    pub const RSA_KEY_TOO_SHORT: u32 = 110_314;
    pub const EC_KEY_TOO_SHORT: u32 = 110_315;
    pub const SIGNATURE_ALGORITHM_INVALID: u32 = 110_316;
    pub const NOT_CA: u32 = 110_317;
    pub const CHAIN_TOO_LONG: u32 = 110_319;
    pub const CA_SIGNATURE_INVALID: u32 = 110_320;
}

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Certificate import ───────────────────────────────────────────
    #[error("Certificate is invalid: {reason}")]
    CertificateInvalid { reason: String },

    #[error("Certificate file is too large: {size} bytes (limit {limit})")]
    CertificateTooLarge { size: usize, limit: usize },

    #[error("Certificate has expired or is not yet valid")]
    CertificateExpired,

    #[error("Public key type is neither RSA nor EC")]
    PubkeyTypeInvalid,

    #[error("RSA public key is {bits} bits, at least 3072 required")]
    RsaKeyTooShort { bits: usize },

    #[error("EC public key is {bits} bits, at least 256 required")]
    EcKeyTooShort { bits: usize },

    #[error("Signature algorithm {algorithm} is not allowed")]
    AlgorithmUnsafe { algorithm: String },

    #[error("Certificate {subject} is not a CA")]
    NotCa { subject: String },

    #[error("Certificate chain has {len} certificates (limit {max})")]
    ChainTooLong { len: usize, max: usize },

    #[error("CA signature verification failed: {reason}")]
    CaSignatureInvalid { reason: String },

    #[error("A certificate with the same fingerprint is already imported")]
    DuplicateFinger,

    #[error("Certificate pool is full ({limit} entries)")]
    PoolFull { limit: usize },

    #[error("Certificate {name} is in use")]
    CertInUse { name: String },

    #[error("Certificate {name} not found")]
    CertNotFound { name: String },

    #[error("No usable certificate for the manager connection")]
    NoAvailableCertificate,

    // ── CRL import ───────────────────────────────────────────────────
    #[error("CRL is invalid: {reason}")]
    CrlInvalid { reason: String },

    #[error("CRL is outside its update window")]
    CrlExpired,

    #[error("A CRL is already imported for certificate {name}")]
    CrlDuplicate { name: String },

    // ── Manager link ─────────────────────────────────────────────────
    #[error("The user name or password error.")]
    AccountInvalid,

    #[error("IP locked.")]
    IpLocked,

    #[error("Manager at {addr} is unreachable: {reason}")]
    Unreachable { addr: String, reason: String },

    #[error("Manager rejected the peer certificate: {reason}")]
    PeerCertificateRejected { reason: String },

    #[error("Manager rejected the request (HTTP {status})")]
    Rejected { status: u16 },

    #[error("Connection to manager failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Manager connection timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Manager session is closed")]
    SessionClosed,

    // ── Switch / state ───────────────────────────────────────────────
    #[error("Parameter is invalid: {message}")]
    ValidationFailed { message: String },

    #[error("The operation is busy.")]
    Busy,

    #[error("docker root dir is not mounted.")]
    DockerRootNotMounted,

    #[error("Illegal status transition {from} -> {to}")]
    InvalidTransition {
        from: ConnectionStatus,
        to: ConnectionStatus,
    },

    // ── Local resources ──────────────────────────────────────────────
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Hosts file error: {message}")]
    Hosts { message: String },

    #[error("Crypto error: {message}")]
    Crypto { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ── Internal ─────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Numeric result code reported to the management API.
    pub fn code(&self) -> u32 {
        match self {
            Self::CertificateInvalid { .. }
            | Self::NoAvailableCertificate
            | Self::PeerCertificateRejected { .. } => codes::CERT_INVALID,
            Self::CertificateTooLarge { .. } => codes::CERT_TOO_LARGE,
            Self::CertificateExpired => codes::CERT_EXPIRED,
            Self::PubkeyTypeInvalid => codes::PUBKEY_TYPE_INVALID,
            Self::RsaKeyTooShort { .. } => codes::RSA_KEY_TOO_SHORT,
            Self::EcKeyTooShort { .. } => codes::EC_KEY_TOO_SHORT,
            Self::AlgorithmUnsafe { .. } => codes::SIGNATURE_ALGORITHM_INVALID,
            Self::NotCa { .. } => codes::NOT_CA,
            Self::ChainTooLong { .. } => codes::CHAIN_TOO_LONG,
            Self::CaSignatureInvalid { .. } => codes::CA_SIGNATURE_INVALID,
            Self::DuplicateFinger => codes::CERT_DUPLICATE,
            Self::PoolFull { .. } => codes::CERT_POOL_FULL,
            Self::CertInUse { .. } => codes::CERT_IN_USE,
            Self::CertNotFound { .. } => codes::CERT_NOT_FOUND,
            Self::CrlInvalid { .. } => codes::CRL_INVALID,
            Self::CrlExpired => codes::CRL_EXPIRED,
            Self::CrlDuplicate { .. } => codes::CRL_DUPLICATE,
            Self::AccountInvalid => codes::ACCOUNT_INVALID,
            Self::IpLocked => codes::IP_LOCKED,
            Self::ValidationFailed { .. } => codes::PARAM_INVALID,
            Self::Busy => codes::BUSY,
            Self::DockerRootNotMounted => codes::DOCKER_ROOT_NOT_MOUNTED,
            Self::Unreachable { .. }
            | Self::Rejected { .. }
            | Self::ConnectionFailed { .. }
            | Self::Timeout { .. }
            | Self::SessionClosed
            | Self::InvalidTransition { .. }
            | Self::Storage { .. }
            | Self::Hosts { .. }
            | Self::Crypto { .. }
            | Self::Io(_)
            | Self::Internal(_) => codes::INTERNAL,
        }
    }

    /// `[code, message]` pair as returned by switch and import operations.
    ///
    /// Internal failures are reported with the generic message so local
    /// details (paths, OS errors) never leave the device.
    pub fn pair(&self) -> (u32, String) {
        let code = self.code();
        let message = match code {
            codes::INTERNAL => "Internal error.".to_owned(),
            codes::PARAM_INVALID => "Parameter is invalid.".to_owned(),
            _ => self.to_string(),
        };
        (code, message)
    }

    /// Returns `true` if the failure is worth retrying on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. }
                | Self::ConnectionFailed { .. }
                | Self::Timeout { .. }
                | Self::SessionClosed
        )
    }

    /// Returns `true` for failures that need operator action to clear.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AccountInvalid
                | Self::IpLocked
                | Self::NoAvailableCertificate
                | Self::PeerCertificateRejected { .. }
        )
    }

    pub(crate) fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}

// ── Conversion from wire-level errors ────────────────────────────────

impl From<edgeom_api::Error> for CoreError {
    fn from(err: edgeom_api::Error) -> Self {
        use edgeom_api::Error as Api;

        if err.is_certificate_error() {
            return CoreError::PeerCertificateRejected {
                reason: err.to_string(),
            };
        }

        match err {
            Api::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            Api::ConnectionRefused { addr } => CoreError::Unreachable {
                addr,
                reason: "connection refused".into(),
            },
            Api::Tls(reason) => CoreError::CertificateInvalid { reason },
            Api::InvalidStatusCode { status, .. } => CoreError::Rejected { status },
            Api::SessionClosed | Api::WebSocketClosed { .. } => CoreError::SessionClosed,
            Api::InvalidUrl(e) => CoreError::ValidationFailed {
                message: format!("invalid manager URL: {e}"),
            },
            Api::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
            other => CoreError::ConnectionFailed {
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_errors_keep_their_wording() {
        assert_eq!(
            CoreError::AccountInvalid.pair(),
            (110_207, "The user name or password error.".to_owned())
        );
        assert_eq!(CoreError::IpLocked.pair(), (110_225, "IP locked.".to_owned()));
        assert_eq!(
            CoreError::DockerRootNotMounted.pair(),
            (110_226, "docker root dir is not mounted.".to_owned())
        );
        assert_eq!(CoreError::Busy.pair(), (100_028, "The operation is busy.".to_owned()));
    }

    #[test]
    fn internal_details_are_not_leaked() {
        let err = CoreError::Storage {
            message: "/var/lib/edgeom/net.json: permission denied".into(),
        };
        assert_eq!(err.pair(), (110_224, "Internal error.".to_owned()));
    }

    #[test]
    fn wire_errors_map_to_lifecycle_vocabulary() {
        let refused: CoreError = edgeom_api::Error::ConnectionRefused {
            addr: "10.0.0.8:443".into(),
        }
        .into();
        assert!(refused.is_transient());

        let rejected: CoreError =
            edgeom_api::Error::CertificateRejected("UnknownIssuer".into()).into();
        assert!(rejected.is_terminal());
        assert_eq!(rejected.code(), codes::CERT_INVALID);
    }
}
