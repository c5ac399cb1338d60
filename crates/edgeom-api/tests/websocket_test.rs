// Integration tests for the WebSocket session against a local tokio-tungstenite acceptor.
#![allow(clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_util::sync::CancellationToken;
use url::Url;

use edgeom_api::websocket::{self, SessionConfig};
use edgeom_api::{DeviceHeaders, Envelope, Error, probe};

// ── Helpers ─────────────────────────────────────────────────────────

type Seen = Arc<Mutex<Option<(String, HeaderMap)>>>;

fn identity() -> DeviceHeaders {
    DeviceHeaders {
        account: "EdgeAccount".into(),
        password: SecretString::from("Initial#Pass1"),
        product_name: "Atlas 500".into(),
        serial_number: "SN0001".into(),
        asset_tag: String::new(),
        dev_mgmt_type: "AtlasEdge".into(),
    }
}

/// Accept one upgrade, record its path + headers, then echo text frames
/// back prefixed with `echo:`. `reject` answers the upgrade with an HTTP
/// error instead.
async fn spawn_manager(reject: Option<(u16, String)>) -> (SocketAddr, Seen) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen: Seen = Arc::default();
    let record = Arc::clone(&seen);

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            *record.lock().unwrap() = Some((req.uri().path().to_owned(), req.headers().clone()));
            match reject {
                Some((status, body)) => {
                    let mut err = ErrorResponse::new(Some(body));
                    *err.status_mut() = status.try_into().unwrap();
                    Err(err)
                }
                None => Ok(resp),
            }
        };
        let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
            return;
        };
        while let Some(Ok(frame)) = ws.next().await {
            if let Message::Text(text) = frame {
                let reply = format!("echo:{}", text.as_str());
                if ws.send(Message::text(reply)).await.is_err() {
                    break;
                }
            }
        }
    });

    (addr, seen)
}

fn session_config(addr: SocketAddr) -> SessionConfig {
    let url = Url::parse(&format!(
        "ws://fd.example.test:{}/websocket/node-1/events",
        addr.port()
    ))
    .unwrap();
    let mut config = SessionConfig::new(url, addr);
    config.headers = identity().pairs();
    config.connect_timeout = Duration::from_secs(5);
    config
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_upgrade_carries_identity_headers() {
    let (addr, seen) = spawn_manager(None).await;
    let cancel = CancellationToken::new();

    let session = websocket::connect(session_config(addr), &cancel).await.unwrap();
    assert!(session.sender.is_open());

    let (path, headers) = seen.lock().unwrap().clone().unwrap();
    assert_eq!(path, "/websocket/node-1/events");
    assert!(headers["authorization"].to_str().unwrap().starts_with("Basic "));
    assert_eq!(headers["productname"], "Atlas 500");
    assert_eq!(headers["serialnumber"], "SN0001");
    assert_eq!(headers["devmgmttype"], "AtlasEdge");

    cancel.cancel();
}

#[tokio::test]
async fn test_frames_round_trip() {
    let (addr, _seen) = spawn_manager(None).await;
    let cancel = CancellationToken::new();

    let mut session = websocket::connect(session_config(addr), &cancel).await.unwrap();
    let msg = Envelope::new("websocket/keepalive", &serde_json::json!({"alive": true}));
    session.sender.send(&msg).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), session.receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, format!("echo:{}", msg.to_text().unwrap()));

    cancel.cancel();
}

#[tokio::test]
async fn test_cancel_closes_the_session() {
    let (addr, _seen) = spawn_manager(None).await;
    let cancel = CancellationToken::new();

    let mut session = websocket::connect(session_config(addr), &cancel).await.unwrap();
    cancel.cancel();

    let end = tokio::time::timeout(Duration::from_secs(5), session.receiver.recv())
        .await
        .unwrap();
    assert!(end.is_none());
    assert!(!session.sender.is_open());
}

#[tokio::test]
async fn test_rejected_upgrade_surfaces_status_and_body() {
    let body = serde_json::json!({
        "error": {
            "@Message.ExtendedInfo": [{
                "MessageId": probe::MSG_SPARE_NODE,
                "MessageArgs": ["node-9"]
            }]
        }
    })
    .to_string();
    let (addr, _seen) = spawn_manager(Some((400, body))).await;

    let err = websocket::connect(session_config(addr), &CancellationToken::new())
        .await
        .unwrap_err();
    let Error::InvalidStatusCode { status, body } = err else {
        panic!("expected InvalidStatusCode, got {err:?}");
    };
    assert_eq!(status, 400);
    let (id, arg) = probe::parse_message_id(&body).unwrap();
    assert_eq!(id, probe::MSG_SPARE_NODE);
    assert_eq!(arg.as_deref(), Some("node-9"));
}

#[tokio::test]
async fn test_closed_port_is_refused() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = websocket::connect(session_config(addr), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConnectionRefused { .. }));
}
