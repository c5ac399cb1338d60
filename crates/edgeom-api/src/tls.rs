// TLS client material for the manager link.
//
// The manager's trust anchors are whatever CA chain the CertStore selected;
// revocation is enforced through the CRL imported for that chain. Both the
// HTTP probe and the WebSocket session share the same `ClientConfig`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, CertificateRevocationListDer, ServerName};
use tokio::net::TcpStream;

use crate::error::{Error, is_cert_failure};

/// PEM material for one trust chain plus its optional CRL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub ca_chain_pem: String,
    pub crl_pem: Option<String>,
}

/// The crypto provider every TLS object in the agent is built with.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build a rustls client configuration trusting `material`'s chain.
///
/// Every certificate in the chain becomes a trust anchor. When a CRL is
/// present, revocation is checked for the whole presented chain and an
/// unknown status is treated as a failure.
pub fn client_config(material: &TlsMaterial) -> Result<Arc<ClientConfig>, Error> {
    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(material.ca_chain_pem.as_bytes()) {
        let cert = cert.map_err(|e| Error::Tls(format!("invalid CA PEM: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| Error::Tls(format!("CA certificate rejected: {e}")))?;
    }
    if roots.is_empty() {
        return Err(Error::Tls("no CA certificate in chain".into()));
    }

    let crls = match material.crl_pem.as_deref() {
        Some(pem) => CertificateRevocationListDer::pem_slice_iter(pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::Tls(format!("invalid CRL PEM: {e}")))?,
        None => Vec::new(),
    };

    let provider = crypto_provider();
    let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
        .with_crls(crls)
        .build()
        .map_err(|e| Error::Tls(format!("failed to build verifier: {e}")))?;

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(format!("unsupported protocol versions: {e}")))?
        .with_webpki_verifier(verifier)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

/// Parse a host string (DNS name or IP literal) into a TLS server name.
pub fn server_name(host: &str) -> Result<ServerName<'static>, Error> {
    ServerName::try_from(host.to_owned())
        .map_err(|e| Error::Tls(format!("invalid server name '{host}': {e}")))
}

/// Complete a TLS handshake against `addr` and drop the connection.
///
/// Used to confirm the peer accepts a candidate trust chain before it is
/// committed as the in-use certificate.
pub async fn handshake(
    config: Arc<ClientConfig>,
    addr: SocketAddr,
    host: &str,
    timeout: Duration,
) -> Result<(), Error> {
    let name = server_name(host)?;
    let connector = tokio_rustls::TlsConnector::from(config);

    let attempt = async {
        let tcp = TcpStream::connect(addr).await.map_err(|e| connect_error(e, addr))?;
        connector.connect(name, tcp).await.map_err(|e| {
            if is_cert_failure(&e) {
                Error::CertificateRejected(e.to_string())
            } else {
                Error::Io(e)
            }
        })?;
        Ok(())
    };

    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| Error::Timeout {
            timeout_secs: timeout.as_secs(),
        })?
}

pub(crate) fn connect_error(err: std::io::Error, addr: SocketAddr) -> Error {
    if err.kind() == std::io::ErrorKind::ConnectionRefused {
        Error::ConnectionRefused {
            addr: addr.to_string(),
        }
    } else {
        Error::Io(err)
    }
}
