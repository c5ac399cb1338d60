// Integration tests for the account-check probe using wiremock.
#![allow(clippy::unwrap_used)]

use secrecy::SecretString;
use serde_json::json;
use url::Url;
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use edgeom_api::probe::{self, MAX_RESPONSE_BYTES, ProbeVerdict};
use edgeom_api::{DeviceHeaders, Error, TransportConfig};

// ── Helpers ─────────────────────────────────────────────────────────

const CHECK_PATH: &str = "/websocket/node-1/AccountCheck";

fn identity() -> DeviceHeaders {
    DeviceHeaders {
        account: "EdgeAccount".into(),
        password: SecretString::from("Initial#Pass1"),
        product_name: "Atlas 500".into(),
        serial_number: "SN0001".into(),
        asset_tag: "rack-7".into(),
        dev_mgmt_type: "AtlasEdge".into(),
    }
}

async fn setup() -> (MockServer, reqwest::Client, Url) {
    let server = MockServer::start().await;
    let client = TransportConfig::default()
        .build_client(identity().header_map().unwrap())
        .unwrap();
    let url = Url::parse(&format!("{}{CHECK_PATH}", server.uri())).unwrap();
    (server, client, url)
}

fn error_body(message_id: &str) -> serde_json::Value {
    json!({
        "error": {
            "code": "Base.1.0.GeneralError",
            "message": "A general error has occurred.",
            "@Message.ExtendedInfo": [{
                "MessageId": message_id,
                "MessageArgs": [],
                "Severity": "Critical"
            }]
        }
    })
}

// ── Verdicts ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_accepted_sends_identity_headers() {
    let (server, client, url) = setup().await;

    Mock::given(method("GET"))
        .and(path(CHECK_PATH))
        .and(header_exists("authorization"))
        .and(header("productname", "Atlas 500"))
        .and(header("serialnumber", "SN0001"))
        .and(header("assettag", "rack-7"))
        .and(header("devmgmttype", "AtlasEdge"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let verdict = probe::account_check(&client, &url).await.unwrap();
    assert_eq!(verdict, ProbeVerdict::Accepted);
    assert!(verdict.is_success());
}

#[tokio::test]
async fn test_not_found() {
    let (server, client, url) = setup().await;

    Mock::given(method("GET"))
        .and(path(CHECK_PATH))
        .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
        .mount(&server)
        .await;

    let verdict = probe::account_check(&client, &url).await.unwrap();
    assert_eq!(verdict, ProbeVerdict::NotFound);
    assert!(!verdict.is_success());
}

#[tokio::test]
async fn test_invalid_account() {
    let (server, client, url) = setup().await;

    Mock::given(method("GET"))
        .and(path(CHECK_PATH))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(error_body("FusionDirector.1.0.AuthenticationFailure")),
        )
        .mount(&server)
        .await;

    let verdict = probe::account_check(&client, &url).await.unwrap();
    assert!(matches!(verdict, ProbeVerdict::InvalidAccount { .. }));
}

#[tokio::test]
async fn test_ip_locked() {
    let (server, client, url) = setup().await;

    Mock::given(method("GET"))
        .and(path(CHECK_PATH))
        .respond_with(ResponseTemplate::new(403).set_body_json(error_body(probe::MSG_IP_LOCKED)))
        .mount(&server)
        .await;

    let verdict = probe::account_check(&client, &url).await.unwrap();
    assert_eq!(verdict, ProbeVerdict::IpLocked);
}

#[tokio::test]
async fn test_same_device_counts_as_success() {
    let (server, client, url) = setup().await;

    Mock::given(method("GET"))
        .and(path(CHECK_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_json(error_body(probe::MSG_SAME_DEVICE)))
        .mount(&server)
        .await;

    let verdict = probe::account_check(&client, &url).await.unwrap();
    assert_eq!(verdict, ProbeVerdict::SameDevice);
    assert!(verdict.is_success());
}

#[tokio::test]
async fn test_node_id_exists_is_a_failure() {
    let (server, client, url) = setup().await;

    Mock::given(method("GET"))
        .and(path(CHECK_PATH))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(error_body(probe::MSG_NODE_ID_EXISTS)),
        )
        .mount(&server)
        .await;

    let verdict = probe::account_check(&client, &url).await.unwrap();
    assert_eq!(verdict, ProbeVerdict::NodeIdExists);
    assert!(!verdict.is_success());
}

// ── Limits ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_oversized_response_is_refused() {
    let (server, client, url) = setup().await;

    let limit = usize::try_from(MAX_RESPONSE_BYTES).unwrap();
    Mock::given(method("GET"))
        .and(path(CHECK_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_bytes(vec![b'x'; limit + 1]))
        .mount(&server)
        .await;

    let err = probe::account_check(&client, &url).await.unwrap_err();
    assert!(matches!(err, Error::PayloadTooLarge { .. }), "got {err:?}");
}

#[tokio::test]
async fn test_unreachable_port_is_refused() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = probe::tcp_reachable(addr, std::time::Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConnectionRefused { .. }));
}

#[tokio::test]
async fn test_reachable_port() {
    let (server, _client, _url) = setup().await;
    probe::tcp_reachable(*server.address(), std::time::Duration::from_secs(2))
        .await
        .unwrap();
}
