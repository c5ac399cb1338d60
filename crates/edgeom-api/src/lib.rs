// edgeom-api: wire-level client for the edge agent's manager link (TLS, probe, WebSocket)

pub mod envelope;
pub mod error;
pub mod probe;
pub mod tls;
pub mod transport;
pub mod websocket;

pub use envelope::Envelope;
pub use error::Error;
pub use probe::ProbeVerdict;
pub use tls::TlsMaterial;
pub use transport::{DeviceHeaders, TransportConfig};
pub use websocket::{Session, SessionConfig, SessionReceiver, SessionSender};
