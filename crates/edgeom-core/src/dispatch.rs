// ── Inbound dispatch ──
//
// Frames from the manager are parsed into envelopes and routed by
// resource to a registered `MessageHandler`. Until the link is `Ready`
// only the credential rotation resource is served.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use edgeom_api::{Envelope, SessionSender};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::alarm::CertExpiryChecker;
use crate::cert::CertStore;
use crate::cipher::PasswordCipher;
use crate::context::ConnectionContext;
use crate::error::CoreError;
use crate::model::{CertSource, NetConfigPatch};
use crate::state::{ConnectionStatus, StatusMachine};
use crate::store::NetConfigStore;
use crate::sysinfo::SystemInfoSource;

pub const NETMANAGER: &str = "websocket/netmanager";
pub const CERT_UPDATE: &str = "websocket/cert_update";
pub const CRL_UPDATE: &str = "websocket/crl_update";
pub const CERT_DELETE: &str = "websocket/cert_delete";
pub const CERT_QUERY: &str = "websocket/cert_query";

/// Upper bound on a blocking certificate operation run for the manager.
const CERT_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Handles one inbound resource.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn resource(&self) -> &str;

    async fn handle(&self, request: &Envelope, sender: &SessionSender) -> Result<(), CoreError>;
}

/// Payload every handler answers with.
fn reply_content(topic: &str, outcome: Result<&str, &CoreError>) -> Value {
    match outcome {
        Ok(reason) => json!({
            "topic": topic,
            "percentage": "100%",
            "result": "success",
            "reason": reason,
        }),
        Err(e) => json!({
            "topic": topic,
            "percentage": "0%",
            "result": "failed",
            "reason": format!("ERR.{}, {}", e.code(), e.pair().1),
        }),
    }
}

async fn send_reply(
    sender: &SessionSender,
    request: &Envelope,
    topic: &str,
    outcome: Result<&str, &CoreError>,
) -> Result<(), CoreError> {
    let reply = Envelope::reply(request, request.route.resource.clone(), &reply_content(topic, outcome));
    sender.send(&reply).await?;
    Ok(())
}

fn parse_content<T: for<'de> Deserialize<'de>>(request: &Envelope) -> Result<T, CoreError> {
    let value = request.content_json()?;
    serde_json::from_value(value).map_err(|e| CoreError::ValidationFailed {
        message: format!("{}: {e}", request.route.resource),
    })
}

// ── TokenBucket ──────────────────────────────────────────────────────

/// Inbound rate limit: `burst` tokens, refilled at `per_sec`.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    per_sec: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(per_sec: u32, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            capacity,
            tokens: capacity,
            per_sec: f64::from(per_sec.max(1)),
            last: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.per_sec).min(self.capacity);
        self.last = now;
    }

    pub fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait for a token.
    pub async fn take(&mut self) {
        while !self.try_take() {
            let wait = (1.0 - self.tokens) / self.per_sec;
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }
}

// ── Dispatcher ───────────────────────────────────────────────────────

pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    status: Arc<StatusMachine>,
    max_message_bytes: usize,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut resources: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        resources.sort_unstable();
        f.debug_struct("Dispatcher")
            .field("resources", &resources)
            .field("max_message_bytes", &self.max_message_bytes)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(status: Arc<StatusMachine>, max_message_bytes: usize) -> Self {
        Self {
            handlers: HashMap::new(),
            status,
            max_message_bytes,
        }
    }

    /// Register `handler`, replacing any handler of the same resource.
    pub fn register(&mut self, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(handler.resource().to_owned(), handler);
    }

    pub fn resources(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Route one inbound frame. Never fails; problems are logged.
    pub async fn dispatch(&self, frame: &str, sender: &SessionSender) {
        let request = match Envelope::from_text(frame, self.max_message_bytes) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping inbound frame");
                return;
            }
        };
        let resource = request.route.resource.as_str();

        if self.status.current() != ConnectionStatus::Ready && resource != NETMANAGER {
            debug!(resource, "link not ready, dropping message");
            return;
        }
        let Some(handler) = self.handlers.get(resource) else {
            debug!(resource, "no handler registered");
            return;
        };

        debug!(resource, msg_id = %request.header.msg_id, "dispatching");
        if let Err(e) = handler.handle(&request, sender).await {
            warn!(resource, error = %e, "handler failed");
        }
    }
}

// ── NetManagerHandler ────────────────────────────────────────────────

#[derive(Deserialize)]
struct NetManagerContent {
    account: String,
    password: String,
    #[serde(default)]
    address: Option<String>,
}

/// One-device-one-secret rotation pushed by the manager.
pub struct NetManagerHandler {
    net: Arc<dyn NetConfigStore>,
    cipher: Arc<dyn PasswordCipher>,
    ctx: Arc<ConnectionContext>,
    sysinfo: Arc<dyn SystemInfoSource>,
}

impl NetManagerHandler {
    pub fn new(
        net: Arc<dyn NetConfigStore>,
        cipher: Arc<dyn PasswordCipher>,
        ctx: Arc<ConnectionContext>,
        sysinfo: Arc<dyn SystemInfoSource>,
    ) -> Self {
        Self {
            net,
            cipher,
            ctx,
            sysinfo,
        }
    }

    fn apply(&self, content: &NetManagerContent) -> Result<(), CoreError> {
        let password = content.password.as_str();
        if content.account.is_empty()
            || content.account.len() > 256
            || !(8..=256).contains(&password.len())
        {
            return Err(CoreError::ValidationFailed {
                message: "invalid account or password".into(),
            });
        }

        let current = self.net.load()?;
        let mut patch = NetConfigPatch {
            cloud_user: Some(content.account.clone()),
            cloud_pwd: Some(self.cipher.encrypt(password)?),
            status: Some(Some(ConnectionStatus::Connected)),
            ..NetConfigPatch::default()
        };

        if let Some(address) = content.address.as_deref().filter(|a| !a.is_empty()) {
            if address.parse::<std::net::Ipv4Addr>().is_err() {
                return Err(CoreError::ValidationFailed {
                    message: format!("invalid address '{address}'"),
                });
            }
            patch.ip = Some(address.to_owned());
            if address != current.ip {
                if !self.sysinfo.docker_root_mounted() {
                    return Err(CoreError::DockerRootNotMounted);
                }
                // New manager address: the next handshake is a first one.
                patch.status = Some(None);
            }
        }

        self.net.update(patch)?;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for NetManagerHandler {
    fn resource(&self) -> &str {
        NETMANAGER
    }

    async fn handle(&self, request: &Envelope, sender: &SessionSender) -> Result<(), CoreError> {
        let result =
            parse_content::<NetManagerContent>(request).and_then(|content| self.apply(&content));
        match &result {
            Ok(()) => {
                send_reply(sender, request, "netmanager", Ok("")).await?;
                info!("manager credentials rotated, reconnecting");
                if let Some(conn) = self.ctx.current() {
                    self.ctx.mark_disconnected(conn.id());
                }
            }
            Err(e) => send_reply(sender, request, "netmanager", Err(e)).await?,
        }
        result
    }
}

// ── CertHandler ──────────────────────────────────────────────────────

/// Certificate pool operations requested by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertOp {
    Update,
    CrlUpdate,
    Delete,
    Query,
}

impl CertOp {
    fn resource(self) -> &'static str {
        match self {
            Self::Update => CERT_UPDATE,
            Self::CrlUpdate => CRL_UPDATE,
            Self::Delete => CERT_DELETE,
            Self::Query => CERT_QUERY,
        }
    }

    fn topic(self) -> &'static str {
        self.resource().trim_start_matches("websocket/")
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CertContent {
    cert_name: String,
    /// Base64 of the PEM file.
    content: String,
}

pub struct CertHandler {
    op: CertOp,
    certs: Arc<CertStore>,
    expiry: Arc<CertExpiryChecker>,
}

impl CertHandler {
    pub fn new(op: CertOp, certs: Arc<CertStore>, expiry: Arc<CertExpiryChecker>) -> Self {
        Self { op, certs, expiry }
    }

    /// Run a pool operation off the runtime, bounded by [`CERT_OP_TIMEOUT`].
    async fn blocking<T, F>(&self, f: F) -> Result<T, CoreError>
    where
        T: Send + 'static,
        F: FnOnce(&CertStore) -> Result<T, CoreError> + Send + 'static,
    {
        let certs = Arc::clone(&self.certs);
        let task = tokio::task::spawn_blocking(move || f(&certs));
        match tokio::time::timeout(CERT_OP_TIMEOUT, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(CoreError::Internal(format!("certificate task failed: {e}"))),
            Err(_) => Err(CoreError::Timeout {
                timeout_secs: CERT_OP_TIMEOUT.as_secs(),
            }),
        }
    }

    fn decode(content: &str) -> Result<Vec<u8>, CoreError> {
        base64::engine::general_purpose::STANDARD
            .decode(content.trim())
            .map_err(|e| CoreError::ValidationFailed {
                message: format!("content is not base64: {e}"),
            })
    }

    async fn run(&self, request: &Envelope) -> Result<Option<Value>, CoreError> {
        let content: CertContent = parse_content(request)?;
        match self.op {
            CertOp::Update => {
                let pem = Self::decode(&content.content)?;
                let name = content.cert_name;
                self.blocking(move |certs| {
                    if certs.cert_is_in_using(&name)? {
                        return Err(CoreError::CertInUse { name });
                    }
                    certs.import_cert(CertSource::FusionDirector, &name, &pem)
                })
                .await?;
                if let Err(e) = self.expiry.check_once() {
                    warn!(error = %e, "expiry check after import failed");
                }
                Ok(None)
            }
            CertOp::CrlUpdate => {
                let pem = Self::decode(&content.content)?;
                self.blocking(move |certs| certs.import_crl(&pem)).await?;
                Ok(None)
            }
            CertOp::Delete => {
                let name = content.cert_name;
                self.blocking(move |certs| certs.delete_cert(&name)).await?;
                Ok(None)
            }
            CertOp::Query => {
                let infos = self
                    .blocking(|certs| Ok(certs.cert_info_for_fd()?.collect::<Vec<_>>()))
                    .await?;
                Ok(Some(json!({ "cert_info": infos })))
            }
        }
    }
}

#[async_trait]
impl MessageHandler for CertHandler {
    fn resource(&self) -> &str {
        self.op.resource()
    }

    async fn handle(&self, request: &Envelope, sender: &SessionSender) -> Result<(), CoreError> {
        match self.run(request).await {
            Ok(Some(payload)) => {
                let reply = Envelope::reply(request, self.op.resource(), &payload);
                sender.send(&reply).await?;
                Ok(())
            }
            Ok(None) => send_reply(sender, request, self.op.topic(), Ok("success")).await,
            Err(e) => {
                send_reply(sender, request, self.op.topic(), Err(&e)).await?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use edgeom_api::websocket::pair;

    use super::*;

    struct Recorder {
        resource: &'static str,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        fn resource(&self) -> &str {
            self.resource
        }

        async fn handle(&self, request: &Envelope, _sender: &SessionSender) -> Result<(), CoreError> {
            self.seen.lock().unwrap().push(request.header.msg_id.clone());
            Ok(())
        }
    }

    fn frame(resource: &str) -> String {
        Envelope::new(resource, &json!({})).to_text().unwrap()
    }

    #[tokio::test]
    async fn only_netmanager_before_ready() {
        let status = Arc::new(StatusMachine::new(ConnectionStatus::Connecting));
        let net = Arc::new(Recorder {
            resource: NETMANAGER,
            seen: Mutex::new(Vec::new()),
        });
        let query = Arc::new(Recorder {
            resource: CERT_QUERY,
            seen: Mutex::new(Vec::new()),
        });
        let mut dispatcher = Dispatcher::new(Arc::clone(&status), 1024);
        dispatcher.register(net.clone());
        dispatcher.register(query.clone());
        let (session, _peer) = pair(4, Duration::from_secs(1));

        dispatcher.dispatch(&frame(CERT_QUERY), &session.sender).await;
        dispatcher.dispatch(&frame(NETMANAGER), &session.sender).await;
        assert!(query.seen.lock().unwrap().is_empty());
        assert_eq!(net.seen.lock().unwrap().len(), 1);

        status.transition(ConnectionStatus::Connected).unwrap();
        status.transition(ConnectionStatus::Ready).unwrap();
        dispatcher.dispatch(&frame(CERT_QUERY), &session.sender).await;
        assert_eq!(query.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn oversized_and_garbage_frames_are_dropped() {
        let status = Arc::new(StatusMachine::new(ConnectionStatus::Connecting));
        let net = Arc::new(Recorder {
            resource: NETMANAGER,
            seen: Mutex::new(Vec::new()),
        });
        let mut dispatcher = Dispatcher::new(status, 64);
        dispatcher.register(net.clone());
        let (session, _peer) = pair(4, Duration::from_secs(1));

        dispatcher.dispatch(&frame(NETMANAGER), &session.sender).await;
        dispatcher.dispatch("{not json", &session.sender).await;
        assert!(net.seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(1, 2);
        assert!(bucket.try_take());
        assert!(bucket.try_take());
        assert!(!bucket.try_take());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(bucket.try_take());

        let before = Instant::now();
        bucket.take().await;
        assert!(Instant::now() - before >= Duration::from_millis(900));
    }

    #[test]
    fn failure_reply_carries_code() {
        let payload = reply_content("cert_update", Err(&CoreError::PoolFull { limit: 2 }));
        assert_eq!(payload["result"], "failed");
        assert!(payload["reason"].as_str().unwrap().starts_with("ERR.110304"));
    }
}
