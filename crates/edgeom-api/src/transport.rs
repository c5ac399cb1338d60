// Shared transport configuration for building reqwest::Client instances.
//
// The account probe and any other REST call toward the manager share TLS,
// timeout, identity headers, and the server-name pinning through this module.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use secrecy::{ExposeSecret, SecretString};

use crate::error::Error;

/// Identity the device presents on every request to the manager.
#[derive(Debug, Clone)]
pub struct DeviceHeaders {
    pub account: String,
    pub password: SecretString,
    pub product_name: String,
    pub serial_number: String,
    pub asset_tag: String,
    pub dev_mgmt_type: String,
}

impl DeviceHeaders {
    /// Header pairs in the order the manager documents them.
    ///
    /// The `Authorization` value is built here so the WebSocket upgrade and
    /// the HTTP probe send byte-identical credentials.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let basic = STANDARD.encode(format!(
            "{}:{}",
            self.account,
            self.password.expose_secret()
        ));
        vec![
            ("Authorization", format!("Basic {basic}")),
            ("ProductName", self.product_name.clone()),
            ("SerialNumber", self.serial_number.clone()),
            ("AssetTag", self.asset_tag.clone()),
            ("DevMgmtType", self.dev_mgmt_type.clone()),
        ]
    }

    pub fn header_map(&self) -> Result<HeaderMap, Error> {
        let mut headers = HeaderMap::new();
        for (name, value) in self.pairs() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Tls(format!("invalid header name {name}: {e}")))?;
            let mut value = HeaderValue::from_str(&value)
                .map_err(|e| Error::Tls(format!("invalid header value for {name}: {e}")))?;
            if name == AUTHORIZATION {
                value.set_sensitive(true);
            }
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Preconfigured rustls client config. `None` keeps reqwest's defaults,
    /// which is only useful against plain-HTTP test servers.
    pub tls: Option<Arc<rustls::ClientConfig>>,
    pub timeout: Duration,
    /// Pin `server_name` to a fixed socket address instead of resolving it.
    pub resolve: Option<(String, SocketAddr)>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: None,
            timeout: Duration::from_secs(5),
            resolve: None,
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` with the device identity as default headers.
    pub fn build_client(&self, headers: HeaderMap) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.timeout)
            .user_agent(concat!("edgeom/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::none());

        if let Some(ref tls) = self.tls {
            builder = builder.use_preconfigured_tls(rustls::ClientConfig::clone(tls));
        }

        if let Some((ref name, addr)) = self.resolve {
            builder = builder.resolve(name, addr);
        }

        builder
            .build()
            .map_err(|e| Error::Tls(format!("failed to build HTTP client: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn identity() -> DeviceHeaders {
        DeviceHeaders {
            account: "EdgeAccount".into(),
            password: SecretString::from("Secret#123"),
            product_name: "Atlas 500".into(),
            serial_number: "SN0001".into(),
            asset_tag: String::new(),
            dev_mgmt_type: "AtlasEdge".into(),
        }
    }

    #[test]
    fn authorization_is_basic_encoded() {
        let pairs = identity().pairs();
        let (name, value) = &pairs[0];
        assert_eq!(*name, "Authorization");
        assert_eq!(value, &format!("Basic {}", STANDARD.encode("EdgeAccount:Secret#123")));
    }

    #[test]
    fn header_map_marks_credentials_sensitive() {
        let headers = identity().header_map().unwrap();
        assert!(headers[AUTHORIZATION].is_sensitive());
        assert_eq!(headers["productname"], "Atlas 500");
        assert_eq!(headers["devmgmttype"], "AtlasEdge");
        assert_eq!(headers.len(), 5);
    }
}
