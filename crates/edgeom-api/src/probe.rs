//! Connectivity pre-check against the manager.
//!
//! A probe is two steps: a bare TCP connect to prove the address is
//! reachable, then an authenticated `GET .../AccountCheck` whose answer
//! tells us whether the account, the source IP, and the node id are
//! acceptable. The verdict is returned as data; callers decide which
//! verdicts are terminal.

use std::net::SocketAddr;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use tokio::net::TcpStream;
use url::Url;

use crate::error::Error;
use crate::tls::connect_error;

/// Largest body (and `Content-Length`) the probe will accept.
pub const MAX_RESPONSE_BYTES: u64 = 1024 * 1024;

// ── Manager message ids ──────────────────────────────────────────────

pub const MSG_IP_LOCKED: &str = "FusionDirector.1.0.IAMRequestIPLocked";
pub const MSG_INVALID_ACCOUNT: [&str; 2] = [
    "Base.1.0.InsufficientPrivilege",
    "FusionDirector.1.0.AuthenticationFailure",
];
pub const MSG_SPARE_NODE: &str = "FusionDirector.1.0.SpareNodeIDInCorrect";
pub const MSG_INTERNAL_ERROR: &str = "EdgeDevMgmt.1.0.InternalError";
pub const MSG_NODE_ID_EXISTS: &str = "EdgeDevMgmt.1.0.NodeIDExist";
pub const MSG_SAME_DEVICE: &str = "EdgeDevMgmt.1.0.TheSameDevice";

// ── Verdict ──────────────────────────────────────────────────────────

/// Outcome of an account check the manager actually answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// HTTP 200.
    Accepted,
    /// The manager already knows this exact device; treated as success.
    SameDevice,
    InvalidAccount { message_id: String },
    IpLocked,
    NodeIdExists,
    PeerInternalError,
    /// HTTP 404: the endpoint is not served by this peer.
    NotFound,
    /// Any other status or an unrecognised message id.
    Rejected { status: u16, message_id: Option<String> },
}

impl ProbeVerdict {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Accepted | Self::SameDevice)
    }
}

// ── Redfish-style error body ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(rename = "@Message.ExtendedInfo", default)]
    extended_info: Vec<ExtendedInfo>,
}

#[derive(Debug, Deserialize)]
struct ExtendedInfo {
    #[serde(rename = "MessageId", default)]
    message_id: String,
    #[serde(rename = "MessageArgs", default)]
    message_args: Vec<serde_json::Value>,
}

/// First `MessageId` (and its first string argument) from a manager error body.
///
/// Returns `None` when the body is not JSON or carries no extended info.
pub fn parse_message_id(body: &[u8]) -> Option<(String, Option<String>)> {
    let parsed: ErrorBody = serde_json::from_slice(body).ok()?;
    let first = parsed.error.extended_info.into_iter().next()?;
    let arg = first
        .message_args
        .first()
        .and_then(|v| v.as_str())
        .map(String::from);
    Some((first.message_id, arg))
}

fn classify(status: StatusCode, body: &[u8]) -> ProbeVerdict {
    if status == StatusCode::OK {
        return ProbeVerdict::Accepted;
    }
    if status == StatusCode::NOT_FOUND {
        return ProbeVerdict::NotFound;
    }

    let message_id = parse_message_id(body).map(|(id, _)| id);
    match message_id.as_deref() {
        Some(id) if MSG_INVALID_ACCOUNT.contains(&id) => ProbeVerdict::InvalidAccount {
            message_id: id.to_owned(),
        },
        Some(MSG_IP_LOCKED) => ProbeVerdict::IpLocked,
        Some(MSG_INTERNAL_ERROR) => ProbeVerdict::PeerInternalError,
        Some(MSG_NODE_ID_EXISTS) => ProbeVerdict::NodeIdExists,
        Some(MSG_SAME_DEVICE) => ProbeVerdict::SameDevice,
        _ => ProbeVerdict::Rejected {
            status: status.as_u16(),
            message_id: message_id.clone(),
        },
    }
}

// ── Probe steps ──────────────────────────────────────────────────────

/// Open and immediately drop a TCP connection to `addr`.
pub async fn tcp_reachable(addr: SocketAddr, timeout: Duration) -> Result<(), Error> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(connect_error(e, addr)),
        Err(_) => Err(Error::Timeout {
            timeout_secs: timeout.as_secs(),
        }),
    }
}

/// Issue the account check and classify the manager's answer.
///
/// `client` must already carry the identity headers and TLS settings
/// (see [`TransportConfig::build_client`](crate::transport::TransportConfig::build_client)).
pub async fn account_check(client: &reqwest::Client, url: &Url) -> Result<ProbeVerdict, Error> {
    tracing::debug!(url = %url, "account check");
    let mut resp = client.get(url.clone()).send().await?;

    let length = resp.content_length().ok_or(Error::MissingContentLength)?;
    if length > MAX_RESPONSE_BYTES {
        return Err(Error::PayloadTooLarge {
            size: length,
            limit: MAX_RESPONSE_BYTES,
        });
    }

    let status = resp.status();
    tracing::info!(status = status.as_u16(), "manager answered account check");
    if status == StatusCode::OK || status == StatusCode::NOT_FOUND {
        return Ok(classify(status, &[]));
    }

    let mut body = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        body.extend_from_slice(&chunk);
        if body.len() as u64 > MAX_RESPONSE_BYTES {
            return Err(Error::PayloadTooLarge {
                size: body.len() as u64,
                limit: MAX_RESPONSE_BYTES,
            });
        }
    }

    Ok(classify(status, &body))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn body(id: &str) -> Vec<u8> {
        serde_json::json!({
            "error": {
                "code": "Base.1.0.GeneralError",
                "@Message.ExtendedInfo": [{ "MessageId": id, "MessageArgs": ["node-42"] }]
            }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn message_id_and_first_arg_are_extracted() {
        let (id, arg) = parse_message_id(&body(MSG_SPARE_NODE)).unwrap();
        assert_eq!(id, MSG_SPARE_NODE);
        assert_eq!(arg.as_deref(), Some("node-42"));
    }

    #[test]
    fn malformed_bodies_yield_nothing() {
        assert!(parse_message_id(b"<html>").is_none());
        assert!(parse_message_id(br#"{"error":{"@Message.ExtendedInfo":[]}}"#).is_none());
    }

    #[test]
    fn verdicts_follow_message_ids() {
        let unauthorized = StatusCode::UNAUTHORIZED;
        assert!(matches!(
            classify(unauthorized, &body("FusionDirector.1.0.AuthenticationFailure")),
            ProbeVerdict::InvalidAccount { .. }
        ));
        assert_eq!(classify(unauthorized, &body(MSG_IP_LOCKED)), ProbeVerdict::IpLocked);
        assert_eq!(
            classify(StatusCode::BAD_REQUEST, &body(MSG_SAME_DEVICE)),
            ProbeVerdict::SameDevice
        );
        assert_eq!(
            classify(StatusCode::BAD_REQUEST, b"nope"),
            ProbeVerdict::Rejected {
                status: 400,
                message_id: None
            }
        );
    }
}
