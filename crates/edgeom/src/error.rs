//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` into user-facing errors carrying the device result code.

use miette::Diagnostic;
use thiserror::Error;

use edgeom_config::ConfigError;
use edgeom_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_FOUND: i32 = 4;
    pub const CONFLICT: i32 = 6;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Certificates ─────────────────────────────────────────────────
    #[error("Certificate rejected [{code}]: {message}")]
    #[diagnostic(
        code(edgeom::cert_rejected),
        help(
            "Chains must be CA certificates with RSA >= 3072 or EC >= 256 bit keys,\n\
             signed with SHA-256."
        )
    )]
    CertRejected { code: u32, message: String },

    #[error("{what} '{name}' not found")]
    #[diagnostic(code(edgeom::not_found), help("Run: edgeom cert list"))]
    NotFound { what: String, name: String },

    #[error("Certificate '{name}' is in use by the manager connection")]
    #[diagnostic(
        code(edgeom::in_use),
        help("Import another chain the manager accepts, or switch to Web management first.")
    )]
    InUse { name: String },

    #[error("Certificate pool is full ({limit} entries)")]
    #[diagnostic(
        code(edgeom::pool_full),
        help("Delete an unused chain with: edgeom cert delete --name <name>")
    )]
    PoolFull { limit: usize },

    // ── Agent ────────────────────────────────────────────────────────
    #[error("Another high-risk operation is running")]
    #[diagnostic(code(edgeom::busy), help("Retry once it has finished."))]
    Busy,

    #[error("[{code}] {message}")]
    #[diagnostic(code(edgeom::core))]
    Core { code: u32, message: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error(transparent)]
    #[diagnostic(
        code(edgeom::config),
        help("Check the configuration file and EDGEOM_* environment variables.")
    )]
    Config(#[from] ConfigError),

    // ── IO / Serialization ───────────────────────────────────────────
    #[error("Cannot read {path}: {source}")]
    #[diagnostic(code(edgeom::read))]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    #[diagnostic(code(edgeom::json))]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::InUse { .. } | Self::PoolFull { .. } | Self::Busy => exit_code::CONFLICT,
            Self::Config(_) => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::CertNotFound { name } => Self::NotFound {
                what: "Certificate".into(),
                name,
            },
            CoreError::CertInUse { name } => Self::InUse { name },
            CoreError::PoolFull { limit } => Self::PoolFull { limit },
            CoreError::Busy => Self::Busy,
            other if is_import_failure(&other) => {
                let (code, message) = other.pair();
                Self::CertRejected { code, message }
            }
            other => {
                let (code, message) = other.pair();
                Self::Core { code, message }
            }
        }
    }
}

fn is_import_failure(err: &CoreError) -> bool {
    matches!(
        err,
        CoreError::CertificateInvalid { .. }
            | CoreError::CertificateTooLarge { .. }
            | CoreError::CertificateExpired
            | CoreError::PubkeyTypeInvalid
            | CoreError::RsaKeyTooShort { .. }
            | CoreError::EcKeyTooShort { .. }
            | CoreError::AlgorithmUnsafe { .. }
            | CoreError::NotCa { .. }
            | CoreError::ChainTooLong { .. }
            | CoreError::CaSignatureInvalid { .. }
            | CoreError::DuplicateFinger
            | CoreError::CrlInvalid { .. }
            | CoreError::CrlExpired
            | CoreError::CrlDuplicate { .. }
    )
}
