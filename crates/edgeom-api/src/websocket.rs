//! WebSocket session toward the manager.
//!
//! The upgrade goes to `wss://{server_name}:{port}/websocket/{node_id}/events`
//! while the TCP connection itself is opened to the configured IP, so the
//! server name only drives SNI, certificate verification and the `Host`
//! header. Once connected, two pump tasks move text frames between the
//! socket and a pair of channels:
//!
//! - [`SessionSender`] is cheap to clone and is shared by every background
//!   sender of a connect attempt.
//! - [`SessionReceiver`] is owned by the single inbound dispatcher.
//!
//! Both pumps run under a child of the caller's [`CancellationToken`]; when
//! either side ends (peer close, I/O error, cancellation) the other is torn
//! down too and [`SessionSender::is_open`] turns false.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::envelope::Envelope;
use crate::error::{Error, is_cert_failure};
use crate::tls::connect_error;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

// ── SessionConfig ────────────────────────────────────────────────────

/// Everything needed to open one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upgrade URI. The scheme decides whether TLS is used.
    pub url: Url,
    /// Where the TCP connection actually goes.
    pub connect_addr: SocketAddr,
    /// Extra upgrade headers (device identity).
    pub headers: Vec<(&'static str, String)>,
    /// Client TLS configuration for `wss://` URIs.
    pub tls: Option<Arc<rustls::ClientConfig>>,
    /// Bound on TCP connect + TLS + upgrade.
    pub connect_timeout: Duration,
    /// Bound on queueing one outbound frame.
    pub send_timeout: Duration,
    pub channel_capacity: usize,
}

impl SessionConfig {
    pub fn new(url: Url, connect_addr: SocketAddr) -> Self {
        Self {
            url,
            connect_addr,
            headers: Vec::new(),
            tls: None,
            connect_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(30),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Standard event-channel URI for `node_id` on `server:port`.
    pub fn events_url(server: &str, port: u16, node_id: &str) -> Result<Url, Error> {
        Ok(Url::parse(&format!(
            "wss://{server}:{port}/websocket/{node_id}/events"
        ))?)
    }
}

// ── Session halves ───────────────────────────────────────────────────

/// Outbound half of a session.
#[derive(Debug, Clone)]
pub struct SessionSender {
    tx: mpsc::Sender<String>,
    open: Arc<AtomicBool>,
    cancel: CancellationToken,
    send_timeout: Duration,
}

impl SessionSender {
    /// `true` while both pumps are alive and nobody called [`close`](Self::close).
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed() && !self.cancel.is_cancelled()
    }

    /// Queue one text frame.
    pub async fn send_text(&self, text: String) -> Result<(), Error> {
        if !self.is_open() {
            return Err(Error::SessionClosed);
        }
        match tokio::time::timeout(self.send_timeout, self.tx.send(text)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::SessionClosed),
            Err(_) => Err(Error::Timeout {
                timeout_secs: self.send_timeout.as_secs(),
            }),
        }
    }

    pub async fn send(&self, envelope: &Envelope) -> Result<(), Error> {
        self.send_text(envelope.to_text()?).await
    }

    /// Close the session. Idempotent.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.cancel.cancel();
    }

    /// Token cancelled when this session ends for any reason.
    pub fn closed_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Inbound half of a session.
#[derive(Debug)]
pub struct SessionReceiver {
    rx: mpsc::Receiver<String>,
    open: Arc<AtomicBool>,
}

impl SessionReceiver {
    /// Next inbound text frame, or `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<String> {
        let frame = self.rx.recv().await;
        if frame.is_none() {
            self.open.store(false, Ordering::Release);
        }
        frame
    }
}

/// A connected session, split into its two halves.
#[derive(Debug)]
pub struct Session {
    pub sender: SessionSender,
    pub receiver: SessionReceiver,
}

/// Two in-memory sessions wired back to back.
///
/// Frames sent on one side's sender arrive on the other side's receiver.
/// Dropping one side makes the other observe a closed session, which is
/// how tests stand in for the manager.
pub fn pair(capacity: usize, send_timeout: Duration) -> (Session, Session) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);

    let side = |tx, rx| {
        let open = Arc::new(AtomicBool::new(true));
        Session {
            sender: SessionSender {
                tx,
                open: Arc::clone(&open),
                cancel: CancellationToken::new(),
                send_timeout,
            },
            receiver: SessionReceiver { rx, open },
        }
    };

    (side(a_tx, a_rx), side(b_tx, b_rx))
}

// ── Connect ──────────────────────────────────────────────────────────

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a session and spawn its pumps.
///
/// The pumps stop when `cancel` (or any parent of it) is cancelled.
pub async fn connect(config: SessionConfig, cancel: &CancellationToken) -> Result<Session, Error> {
    tracing::info!(url = %config.url, addr = %config.connect_addr, "Connecting to WebSocket");

    let uri: tungstenite::http::Uri = config
        .url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;

    let mut request = ClientRequestBuilder::new(uri);
    for (name, value) in &config.headers {
        request = request.with_header(*name, value.clone());
    }

    let addr = config.connect_addr;
    let connector = config.tls.clone().map(Connector::Rustls);
    let handshake = async {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| connect_error(e, addr))?;
        tokio_tungstenite::client_async_tls_with_config(request, tcp, None, connector)
            .await
            .map_err(map_connect_error)
    };

    let (ws_stream, _response) = tokio::time::timeout(config.connect_timeout, handshake)
        .await
        .map_err(|_| Error::Timeout {
            timeout_secs: config.connect_timeout.as_secs(),
        })??;

    tracing::info!("WebSocket connected");
    Ok(spawn_pumps(ws_stream, &config, cancel.child_token()))
}

fn spawn_pumps(ws_stream: WsStream, config: &SessionConfig, cancel: CancellationToken) -> Session {
    let (out_tx, out_rx) = mpsc::channel(config.channel_capacity);
    let (in_tx, in_rx) = mpsc::channel(config.channel_capacity);
    let open = Arc::new(AtomicBool::new(true));

    let (sink, stream) = ws_stream.split();

    tokio::spawn(write_pump(sink, out_rx, cancel.clone(), Arc::clone(&open)));
    tokio::spawn(read_pump(stream, in_tx, cancel.clone(), Arc::clone(&open)));

    Session {
        sender: SessionSender {
            tx: out_tx,
            open: Arc::clone(&open),
            cancel,
            send_timeout: config.send_timeout,
        },
        receiver: SessionReceiver { rx: in_rx, open },
    }
}

// ── Pumps ────────────────────────────────────────────────────────────

async fn write_pump(
    mut sink: futures_util::stream::SplitSink<WsStream, Message>,
    mut out_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
    open: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = out_rx.recv() => {
                let Some(text) = next else { break };
                if let Err(e) = sink.send(Message::text(text)).await {
                    tracing::warn!(error = %e, "WebSocket write failed");
                    break;
                }
            }
        }
    }

    open.store(false, Ordering::Release);
    cancel.cancel();
    let _ = sink.close().await;
    tracing::debug!("WebSocket writer exiting");
}

async fn read_pump(
    mut stream: futures_util::stream::SplitStream<WsStream>,
    in_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    open: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(text.as_str().to_owned()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // tungstenite queues the pong itself
                        tracing::trace!("WebSocket ping");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(ref cf) = frame {
                            tracing::info!(code = %cf.code, reason = %cf.reason, "WebSocket close frame received");
                        } else {
                            tracing::info!("WebSocket close frame received (no payload)");
                        }
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "WebSocket read failed");
                        break;
                    }
                    None => {
                        tracing::info!("WebSocket stream ended");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    open.store(false, Ordering::Release);
    cancel.cancel();
    tracing::debug!("WebSocket reader exiting");
}

fn map_connect_error(err: tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Http(resp) => Error::InvalidStatusCode {
            status: resp.status().as_u16(),
            body: resp.body().as_ref().map(|b| b.to_vec()).unwrap_or_default(),
        },
        other if is_cert_failure(&other) => Error::CertificateRejected(other.to_string()),
        tungstenite::Error::Io(e) => Error::Io(e),
        other => Error::WebSocketConnect(other.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn events_url_layout() {
        let url = SessionConfig::events_url("fd.example.test", 443, "node-1").unwrap();
        assert_eq!(url.as_str(), "wss://fd.example.test/websocket/node-1/events");

        let url = SessionConfig::events_url("fd.example.test", 8443, "node-1").unwrap();
        assert_eq!(url.port(), Some(8443));
    }

    #[tokio::test]
    async fn paired_sessions_exchange_frames() {
        let (agent, mut manager) = pair(4, Duration::from_secs(1));
        agent.sender.send_text("hello".into()).await.unwrap();
        assert_eq!(manager.receiver.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn dropping_the_peer_closes_the_session() {
        let (mut agent, manager) = pair(4, Duration::from_secs(1));
        drop(manager);
        assert!(!agent.sender.is_open());
        assert!(agent.receiver.recv().await.is_none());
        assert!(matches!(
            agent.sender.send_text("x".into()).await,
            Err(Error::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (agent, _manager) = pair(4, Duration::from_secs(1));
        agent.sender.close();
        agent.sender.close();
        assert!(!agent.sender.is_open());
        assert!(agent.sender.closed_token().is_cancelled());
    }
}
