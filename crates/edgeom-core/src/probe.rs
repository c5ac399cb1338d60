// ── Connectivity pre-check ──
//
// `connect_test` answers one question before a switch commits or an
// attempt opens a session: will this manager take us with this account,
// from this IP, with one of our chains? Terminal answers also raise the
// matching signal on the connection context so the switch poll and the
// monitor can see them.

use edgeom_api::ProbeVerdict;
use tracing::{info, warn};

use crate::cert::CertStore;
use crate::context::{ConnectSignals, Signal};
use crate::error::CoreError;
use crate::transport::{FdTransport, LinkTarget};

/// Result of [`connect_test`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTestOutcome {
    Passed,
    AccountInvalid,
    IpLocked,
    /// No chain in the pool is accepted by the manager.
    CertInvalid,
    /// TCP connect refused or timed out.
    Unreachable,
    /// Anything else; retried on the next tick.
    Failed(String),
}

impl ConnectTestOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }

    /// Needs operator action before another try can succeed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AccountInvalid | Self::IpLocked | Self::CertInvalid)
    }

    /// The error a switch reports for this outcome.
    pub fn into_error(self) -> Option<CoreError> {
        match self {
            Self::Passed => None,
            Self::AccountInvalid => Some(CoreError::AccountInvalid),
            Self::IpLocked => Some(CoreError::IpLocked),
            Self::CertInvalid => Some(CoreError::NoAvailableCertificate),
            Self::Unreachable => Some(CoreError::Unreachable {
                addr: String::new(),
                reason: "connect test failed".into(),
            }),
            Self::Failed(reason) => Some(CoreError::ConnectionFailed { reason }),
        }
    }
}

fn failed(err: &CoreError) -> ConnectTestOutcome {
    ConnectTestOutcome::Failed(err.to_string())
}

/// Probe `target`: TCP reachability, a chain the manager accepts, then
/// the authenticated account check.
pub async fn connect_test<T>(
    target: &LinkTarget,
    certs: &CertStore,
    transport: &T,
    signals: &ConnectSignals,
) -> ConnectTestOutcome
where
    T: FdTransport + ?Sized,
{
    if let Err(e) = transport.reachable(target.addr).await {
        warn!(addr = %target.addr, error = %e, "manager unreachable");
        signals.raise(Signal::IpPortInvalid);
        return ConnectTestOutcome::Unreachable;
    }

    let tls = match certs
        .client_tls(&target.handshake_target(), transport, true)
        .await
    {
        Ok(selected) => selected,
        Err(e) if e.is_transient() => {
            warn!(error = %e, "handshake probe failed, will retry");
            return failed(&e);
        }
        Err(e) => {
            warn!(error = %e, "no chain accepted by the manager");
            signals.raise(Signal::CertInvalid);
            return ConnectTestOutcome::CertInvalid;
        }
    };

    let verdict = match transport.account_check(target, tls.config).await {
        Ok(verdict) => verdict,
        Err(e @ CoreError::PeerCertificateRejected { .. }) => {
            warn!(error = %e, "account check rejected the peer certificate");
            signals.raise(Signal::CertInvalid);
            return ConnectTestOutcome::CertInvalid;
        }
        Err(e) => {
            warn!(error = %e, "account check failed");
            return failed(&e);
        }
    };

    match verdict {
        ProbeVerdict::Accepted | ProbeVerdict::SameDevice => {
            info!(addr = %target.addr, "connect test passed");
            ConnectTestOutcome::Passed
        }
        ProbeVerdict::InvalidAccount { message_id } => {
            warn!(%message_id, "manager refused the account");
            signals.raise(Signal::AccountInvalid);
            ConnectTestOutcome::AccountInvalid
        }
        ProbeVerdict::IpLocked => {
            warn!("manager locked this device's IP");
            signals.raise(Signal::IpLocked);
            ConnectTestOutcome::IpLocked
        }
        other => {
            warn!(verdict = ?other, "account check did not pass");
            ConnectTestOutcome::Failed(format!("{other:?}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_credential_and_trust_outcomes_are_terminal() {
        assert!(ConnectTestOutcome::AccountInvalid.is_terminal());
        assert!(ConnectTestOutcome::IpLocked.is_terminal());
        assert!(ConnectTestOutcome::CertInvalid.is_terminal());
        assert!(!ConnectTestOutcome::Unreachable.is_terminal());
        assert!(!ConnectTestOutcome::Failed("x".into()).is_terminal());
        assert!(ConnectTestOutcome::Passed.into_error().is_none());
    }

    #[test]
    fn outcomes_map_to_result_codes() {
        use crate::error::codes;

        let code = |o: ConnectTestOutcome| o.into_error().map(|e| e.code());
        assert_eq!(code(ConnectTestOutcome::AccountInvalid), Some(codes::ACCOUNT_INVALID));
        assert_eq!(code(ConnectTestOutcome::IpLocked), Some(codes::IP_LOCKED));
        assert_eq!(code(ConnectTestOutcome::CertInvalid), Some(codes::CERT_INVALID));
        assert_eq!(code(ConnectTestOutcome::Unreachable), Some(codes::INTERNAL));
    }
}
