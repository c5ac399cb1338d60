use thiserror::Error;

/// Top-level error type for the `edgeom-api` crate.
///
/// Covers every failure mode on the wire toward the manager: TCP
/// reachability, TLS material, the HTTP account probe, and the WebSocket
/// session. `edgeom-core` maps these into lifecycle decisions.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request or connect timed out.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// The peer actively refused the TCP connection.
    #[error("Connection to {addr} refused")]
    ConnectionRefused { addr: String },

    /// Socket-level failure other than a refusal.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ── TLS ─────────────────────────────────────────────────────────
    /// TLS material could not be assembled (bad PEM, empty roots, bad CRL).
    #[error("TLS error: {0}")]
    Tls(String),

    /// The peer's certificate was rejected during the handshake.
    #[error("Peer certificate rejected: {0}")]
    CertificateRejected(String),

    // ── HTTP probe ──────────────────────────────────────────────────
    /// Response body announced or carried more bytes than allowed.
    #[error("Response payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: u64, limit: u64 },

    /// The response had no usable `Content-Length`.
    #[error("Response is missing a valid Content-Length header")]
    MissingContentLength,

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// The upgrade request was answered with a non-101 status.
    #[error("WebSocket upgrade rejected (HTTP {status})")]
    InvalidStatusCode { status: u16, body: Vec<u8> },

    /// WebSocket closed unexpectedly.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    /// The session's outbound channel is gone.
    #[error("WebSocket session is closed")]
    SessionClosed,

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    /// A message exceeded the configured size.
    #[error("Message too large: {size} bytes (limit {limit})")]
    MessageTooLarge { size: usize, limit: usize },
}

impl Error {
    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. }
            | Self::Io(_)
            | Self::WebSocketConnect(_)
            | Self::WebSocketClosed { .. }
            | Self::SessionClosed => true,
            _ => false,
        }
    }

    /// Returns `true` if the failure came from certificate verification.
    pub fn is_certificate_error(&self) -> bool {
        match self {
            Self::CertificateRejected(_) => true,
            Self::Transport(e) => is_cert_failure(e),
            _ => false,
        }
    }
}

/// Walk an error's source chain looking for a rustls certificate rejection.
pub(crate) fn is_cert_failure(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        if let Some(tls) = e.downcast_ref::<rustls::Error>() {
            return matches!(
                tls,
                rustls::Error::InvalidCertificate(_) | rustls::Error::InvalidCertRevocationList(_)
            );
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if let Some(inner) = io.get_ref() {
                if let Some(tls) = inner.downcast_ref::<rustls::Error>() {
                    return matches!(
                        tls,
                        rustls::Error::InvalidCertificate(_)
                            | rustls::Error::InvalidCertRevocationList(_)
                    );
                }
            }
        }
        cur = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn certificate_rejection_is_detected_through_io_wrapping() {
        let tls = rustls::Error::InvalidCertificate(rustls::CertificateError::Expired);
        let io = std::io::Error::new(std::io::ErrorKind::InvalidData, tls);
        assert!(is_cert_failure(&io));

        let plain = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(!is_cert_failure(&plain));
    }

    #[test]
    fn transient_classification() {
        assert!(Error::Timeout { timeout_secs: 5 }.is_transient());
        assert!(Error::SessionClosed.is_transient());
        assert!(!Error::Tls("bad pem".into()).is_transient());
        assert!(
            !Error::InvalidStatusCode {
                status: 401,
                body: Vec::new()
            }
            .is_transient()
        );
    }
}
