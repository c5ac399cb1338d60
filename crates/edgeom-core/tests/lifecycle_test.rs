#![allow(clippy::unwrap_used)]

// End-to-end lifecycle tests: a switch to FusionDirector converging
// through the credential rotation, the connect test, switching back to
// Web, and the monitor's one-attempt-at-a-time rule.
//
// The manager is played by `MockManager`, which hands the test the peer
// half of every session the agent opens. Tokio time is paused, so the
// minute-long monitor ticks and switch polls run instantly.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use edgeom_api::websocket::{SessionSender, pair};
use edgeom_api::{Envelope, ProbeVerdict, Session};
use edgeom_core::alarm::Alarm;
use edgeom_core::cipher::{AesGcmCipher, PasswordCipher};
use edgeom_core::clock::FixedClock;
use edgeom_core::config::AgentSettings;
use edgeom_core::dispatch::NETMANAGER;
use edgeom_core::error::codes;
use edgeom_core::hosts::HostsFile;
use edgeom_core::mef::MefLink;
use edgeom_core::model::MefCert;
use edgeom_core::store::{MemoryCertRepository, MemoryNetConfigStore, NetConfigStore};
use edgeom_core::switch::result_pair;
use edgeom_core::sysinfo::SystemInfoSource;
use edgeom_core::{
    Agent, AgentDeps, CertSource, ConnectionStatus, CoreError, FdSwitchRequest, FdTransport,
    HandshakeProbe, HandshakeTarget, LinkTarget, ManagerType, NetConfig, SwitchRequest,
    SwitchStatus,
};
use pretty_assertions::assert_eq;
use rustls::ClientConfig;
use secrecy::SecretString;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const ROOT: &str = include_str!("fixtures/rsa3072_root.pem");
const MANAGER_IP: &str = "192.0.2.10";
const SERVER_NAME: &str = "fd.example.test";

// ── Manager double ───────────────────────────────────────────────────

struct MockManager {
    verdict: Mutex<ProbeVerdict>,
    /// Body of a rejected upgrade, answered once.
    reject_upgrade: Mutex<Option<Vec<u8>>>,
    /// Address whose account check answers `InvalidAccount` after a delay.
    slow_reject: Mutex<Option<IpAddr>>,
    opened: Mutex<Vec<SessionSender>>,
    max_live: AtomicUsize,
    peers: mpsc::UnboundedSender<Session>,
}

impl MockManager {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Session>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            verdict: Mutex::new(ProbeVerdict::Accepted),
            reject_upgrade: Mutex::new(None),
            slow_reject: Mutex::new(None),
            opened: Mutex::new(Vec::new()),
            max_live: AtomicUsize::new(0),
            peers: tx,
        });
        (manager, rx)
    }

    fn answer(&self, verdict: ProbeVerdict) {
        *self.verdict.lock().unwrap() = verdict;
    }

    fn opened(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    /// Most sessions that were open at the same time.
    fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HandshakeProbe for MockManager {
    async fn handshake(
        &self,
        _target: &HandshakeTarget,
        _tls: Arc<ClientConfig>,
    ) -> Result<(), CoreError> {
        Ok(())
    }
}

#[async_trait]
impl FdTransport for MockManager {
    async fn reachable(&self, _addr: SocketAddr) -> Result<(), CoreError> {
        Ok(())
    }

    async fn account_check(
        &self,
        target: &LinkTarget,
        _tls: Arc<ClientConfig>,
    ) -> Result<ProbeVerdict, CoreError> {
        let slow = *self.slow_reject.lock().unwrap();
        if slow == Some(target.addr.ip()) {
            tokio::time::sleep(Duration::from_millis(50)).await;
            return Ok(ProbeVerdict::InvalidAccount {
                message_id: "FusionDirector.1.0.UserNameOrPasswordError".into(),
            });
        }
        Ok(self.verdict.lock().unwrap().clone())
    }

    async fn open(
        &self,
        _target: &LinkTarget,
        _tls: Arc<ClientConfig>,
        _cancel: &CancellationToken,
    ) -> Result<Session, edgeom_api::Error> {
        if let Some(body) = self.reject_upgrade.lock().unwrap().take() {
            return Err(edgeom_api::Error::InvalidStatusCode { status: 400, body });
        }
        let (agent, peer) = pair(64, Duration::from_secs(30));
        {
            let mut opened = self.opened.lock().unwrap();
            let live = opened.iter().filter(|s| s.is_open()).count() + 1;
            self.max_live.fetch_max(live, Ordering::SeqCst);
            opened.push(agent.sender.clone());
        }
        self.peers.send(peer).unwrap();
        Ok(agent)
    }
}

#[derive(Default)]
struct StubSysInfo {
    collected: AtomicBool,
}

impl SystemInfoSource for StubSysInfo {
    fn collected(&self) -> bool {
        self.collected.load(Ordering::SeqCst)
    }

    fn system_info(&self) -> serde_json::Value {
        json!({ "ProductName": "Atlas 500" })
    }

    fn status(&self) -> serde_json::Value {
        json!({ "Health": "OK" })
    }

    fn docker_root_mounted(&self) -> bool {
        true
    }
}

#[derive(Default)]
struct RecordingMef {
    running: AtomicBool,
    stops: AtomicUsize,
}

#[async_trait]
impl MefLink for RecordingMef {
    async fn start_connect_timer(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    async fn stop_connect_timer(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn ready_for_send(&self) -> bool {
        false
    }

    async fn send_fd_info(&self, _cert: MefCert) -> Result<(), CoreError> {
        Ok(())
    }
}

// ── Harness ──────────────────────────────────────────────────────────

struct Harness {
    agent: Agent,
    net: Arc<MemoryNetConfigStore>,
    cipher: Arc<AesGcmCipher>,
    manager: Arc<MockManager>,
    peers: mpsc::UnboundedReceiver<Session>,
    hosts: Arc<HostsFile>,
    mef: Arc<RecordingMef>,
    sysinfo: Arc<StubSysInfo>,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new(initial: impl FnOnce(&dyn PasswordCipher) -> NetConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let hosts_path = dir.path().join("hosts");
        std::fs::write(&hosts_path, "127.0.0.1 localhost edge-box\n").unwrap();
        let hosts = Arc::new(HostsFile::new(hosts_path));

        let cipher = Arc::new(AesGcmCipher::new(&[7u8; 32]).unwrap());
        let net = Arc::new(MemoryNetConfigStore::new(initial(cipher.as_ref())));
        let (manager, peers) = MockManager::new();
        let mef = Arc::new(RecordingMef::default());
        let sysinfo = Arc::new(StubSysInfo::default());
        sysinfo.collected.store(true, Ordering::SeqCst);

        let agent = Agent::new(AgentDeps {
            settings: AgentSettings::default(),
            net: net.clone(),
            cert_repo: Arc::new(MemoryCertRepository::new()),
            cipher: cipher.clone(),
            clock: Arc::new(FixedClock(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap())),
            transport: manager.clone(),
            hosts: hosts.clone(),
            mef: mef.clone(),
            sysinfo: sysinfo.clone(),
            extra_handlers: Vec::new(),
        })
        .unwrap();
        agent
            .services()
            .certs
            .import_cert(CertSource::Web, "fd-root", ROOT.as_bytes())
            .unwrap();

        Self {
            agent,
            net,
            cipher,
            manager,
            peers,
            hosts,
            mef,
            sysinfo,
            _dir: dir,
        }
    }

    /// A device already converged on FusionDirector with rotated credentials.
    fn managed() -> Self {
        Self::new(|cipher| NetConfig {
            manager_type: ManagerType::FusionDirector,
            ip: MANAGER_IP.into(),
            port: 443,
            server_name: SERVER_NAME.into(),
            status: Some(ConnectionStatus::Ready),
            cloud_user: "dev-0001".into(),
            cloud_pwd: cipher.encrypt("Device#Pass1").unwrap(),
            node_id: "node-1".into(),
        })
    }

    fn unmanaged() -> Self {
        Self::new(|_| NetConfig::web_defaults())
    }

    async fn next_peer(&mut self) -> Session {
        tokio::time::timeout(Duration::from_secs(600), self.peers.recv())
            .await
            .expect("no session opened")
            .unwrap()
    }

    async fn settle(&self) {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

fn fd_request(test: bool) -> FdSwitchRequest {
    FdSwitchRequest {
        ip: MANAGER_IP.into(),
        port: None,
        server_name: Some(SERVER_NAME.into()),
        account: "EdgeAccount".into(),
        password: SecretString::from("Initial#Pass1"),
        node_id: "node-1".into(),
        test,
    }
}

/// Read frames until the reply to `resource` arrives.
async fn reply_to(peer: &mut Session, resource: &str) -> serde_json::Value {
    loop {
        let text = peer.receiver.recv().await.expect("session closed before the reply");
        let envelope = Envelope::from_text(&text, 1 << 20).unwrap();
        if envelope.route.resource == resource && !envelope.header.parent_msg_id.is_empty() {
            return envelope.content_json().unwrap();
        }
    }
}

// ── Switch to FusionDirector ─────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn switch_converges_through_credential_rotation() {
    let mut h = Harness::unmanaged();
    let agent = h.agent.clone();
    let switch = tokio::spawn(async move {
        agent.switch_to(SwitchRequest::FusionDirector(fd_request(false))).await
    });

    // First session runs on the initial account.
    let mut first = h.next_peer().await;
    assert_eq!(h.net.load().unwrap().status, Some(ConnectionStatus::Connecting));
    assert_eq!(h.agent.status(), ConnectionStatus::Connecting);
    assert_eq!(
        h.hosts.lookup(SERVER_NAME).unwrap().map(|ip| ip.to_string()),
        Some(MANAGER_IP.to_owned())
    );

    let rotate = Envelope::new(
        NETMANAGER,
        &json!({ "account": "dev-0001", "password": "Device#Pass1" }),
    );
    first.sender.send(&rotate).await.unwrap();
    let reply = reply_to(&mut first, NETMANAGER).await;
    assert_eq!(reply["result"], "success");

    let stored = h.net.load().unwrap();
    assert_eq!(stored.cloud_user, "dev-0001");
    assert_ne!(stored.cloud_pwd, "Device#Pass1");
    assert_eq!(
        secrecy::ExposeSecret::expose_secret(&h.cipher.decrypt(&stored.cloud_pwd).unwrap()),
        "Device#Pass1"
    );

    // The agent drops the first session and reconnects on the next tick.
    let _second = h.next_peer().await;
    let result = switch.await.unwrap();
    assert_eq!(result_pair(&result), (0, String::new()));
    assert_eq!(result.unwrap(), SwitchStatus::Ready);

    assert_eq!(h.net.load().unwrap().status, Some(ConnectionStatus::Ready));
    assert_eq!(h.agent.status(), ConnectionStatus::Ready);
    assert!(h.mef.running.load(Ordering::SeqCst));

    let history = h.agent.services().status.history();
    let ready = history.iter().position(|t| t.to == ConnectionStatus::Ready).unwrap();
    assert_eq!(history[ready].from, ConnectionStatus::Connected);
    assert_eq!(h.manager.max_live(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_connect_test_changes_nothing() {
    let h = Harness::unmanaged();
    h.manager.answer(ProbeVerdict::InvalidAccount {
        message_id: "FusionDirector.1.0.UserNameOrPasswordError".into(),
    });
    let before = h.net.load().unwrap();

    let result = h
        .agent
        .switch_to(SwitchRequest::FusionDirector(fd_request(true)))
        .await;
    assert!(matches!(result, Err(CoreError::AccountInvalid)));
    assert_eq!(result_pair(&result).0, codes::ACCOUNT_INVALID);

    assert_eq!(h.net.load().unwrap(), before);
    assert_eq!(h.agent.status(), ConnectionStatus::NotConfigured);
    assert!(!h.agent.monitor().is_running());
    assert_eq!(h.manager.opened(), 0);
}

#[tokio::test(start_paused = true)]
async fn locked_ip_fails_the_connect_test() {
    let h = Harness::unmanaged();
    h.manager.answer(ProbeVerdict::IpLocked);

    let result = h
        .agent
        .switch_to(SwitchRequest::FusionDirector(fd_request(true)))
        .await;
    assert_eq!(result_pair(&result), (codes::IP_LOCKED, "IP locked.".to_owned()));
    assert_eq!(h.net.load().unwrap().manager_type, ManagerType::Web);
}

#[tokio::test(start_paused = true)]
async fn rejected_credentials_abandon_the_switch() {
    let h = Harness::unmanaged();
    h.manager.answer(ProbeVerdict::InvalidAccount {
        message_id: "FusionDirector.1.0.UserNameOrPasswordError".into(),
    });

    let result = h
        .agent
        .switch_to(SwitchRequest::FusionDirector(fd_request(false)))
        .await;
    assert!(matches!(result, Err(CoreError::AccountInvalid)));
    assert_eq!(h.agent.status(), ConnectionStatus::ErrConfigured);
    assert!(!h.agent.monitor().is_running());
    // The row was committed before the monitor found out.
    assert_eq!(h.net.load().unwrap().manager_type, ManagerType::FusionDirector);
}

#[tokio::test(start_paused = true)]
async fn concurrent_switch_is_busy() {
    let mut h = Harness::unmanaged();
    let agent = h.agent.clone();
    let first = tokio::spawn(async move {
        agent.switch_to(SwitchRequest::FusionDirector(fd_request(false))).await
    });
    let _peer = h.next_peer().await;

    let second = h.agent.switch_to(SwitchRequest::Web).await;
    assert!(matches!(second, Err(CoreError::Busy)));

    // Never rotated, so the first switch times out still converging.
    let first = first.await.unwrap();
    assert_eq!(result_pair(&first), (codes::PENDING, "save config success".to_owned()));
    assert_eq!(first.unwrap(), SwitchStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn late_verdict_from_the_old_link_does_not_fail_the_switch() {
    let mut h = Harness::managed();
    *h.manager.slow_reject.lock().unwrap() = Some(MANAGER_IP.parse().unwrap());
    h.agent.boot().await.unwrap();

    // The old attempt is still inside its account check.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let agent = h.agent.clone();
    let switch = tokio::spawn(async move {
        let request = FdSwitchRequest {
            ip: "192.0.2.77".into(),
            ..fd_request(false)
        };
        agent.switch_to(SwitchRequest::FusionDirector(request)).await
    });

    let _peer = h.next_peer().await;
    let result = switch.await.unwrap();
    assert_eq!(result_pair(&result), (codes::PENDING, "save config success".to_owned()));
    assert_ne!(h.agent.status(), ConnectionStatus::ErrConfigured);
    assert!(h.agent.monitor().is_running());
    assert_eq!(h.net.load().unwrap().ip, "192.0.2.77");
}

// ── Switch back to Web ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn switch_to_web_tears_everything_down() {
    let mut h = Harness::managed();
    h.agent.boot().await.unwrap();
    let _peer = h.next_peer().await;
    h.settle().await;
    assert_eq!(h.agent.status(), ConnectionStatus::Ready);
    assert!(h.hosts.lookup(SERVER_NAME).unwrap().is_some());

    h.agent
        .services()
        .alarms
        .raise(Alarm::new(codes::CERT_EXPIRED, "fd-root", "certificate expired"));

    let result = h.agent.switch_to(SwitchRequest::Web).await;
    assert_eq!(result_pair(&result), (0, String::new()));

    assert_eq!(h.hosts.lookup(SERVER_NAME).unwrap(), None);
    assert_eq!(
        h.hosts.lookup("edge-box").unwrap().map(|ip| ip.to_string()),
        Some("127.0.0.1".to_owned())
    );
    assert_eq!(h.net.load().unwrap(), NetConfig::web_defaults());
    assert_eq!(h.agent.status(), ConnectionStatus::NotConfigured);
    assert!(!h.agent.monitor().is_running());
    assert!(!h.agent.monitor().attempt_alive());
    assert!(!h.agent.services().ctx.ready_for_send());
    assert!(h.agent.services().alarms.active().is_empty());
    assert!(h.mef.stops.load(Ordering::SeqCst) >= 1);
}

#[tokio::test(start_paused = true)]
async fn switch_to_mef_keeps_the_link_pending() {
    let mut h = Harness::managed();
    h.agent.boot().await.unwrap();
    let _peer = h.next_peer().await;

    let result = h.agent.switch_to(SwitchRequest::Mef).await;
    assert_eq!(result.unwrap(), SwitchStatus::Pending);

    let stored = h.net.load().unwrap();
    assert_eq!(stored.manager_type, ManagerType::Mef);
    assert_eq!(stored.status, Some(ConnectionStatus::Connecting));
    assert_eq!(h.hosts.lookup(SERVER_NAME).unwrap(), None);
    assert!(!h.agent.monitor().is_running());
    assert!(h.mef.running.load(Ordering::SeqCst));
}

// ── Monitor ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn boot_resumes_a_managed_link() {
    let mut h = Harness::managed();
    h.agent.boot().await.unwrap();
    let _peer = h.next_peer().await;
    h.settle().await;

    assert!(h.agent.monitor().is_running());
    assert!(h.agent.services().ctx.ready_for_send());
    assert_eq!(h.agent.status(), ConnectionStatus::Ready);

    // Healthy link: ticks leave it alone.
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.manager.opened(), 1);
    assert_eq!(h.agent.monitor().attempt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropped_sessions_are_replaced_one_at_a_time() {
    let mut h = Harness::managed();
    h.agent.boot().await.unwrap();

    for _ in 0..3 {
        let peer = h.next_peer().await;
        h.settle().await;
        drop(peer);
    }
    let _last = h.next_peer().await;

    assert_eq!(h.manager.opened(), 4);
    assert_eq!(h.manager.max_live(), 1);
}

#[tokio::test(start_paused = true)]
async fn restarting_the_monitor_never_overlaps_attempts() {
    let mut h = Harness::managed();
    h.agent.boot().await.unwrap();
    let _first = h.next_peer().await;

    let monitor = h.agent.monitor().clone();
    monitor.stop().await;
    assert!(!monitor.attempt_alive());
    assert!(!h.agent.services().ctx.ready_for_send());

    monitor.start().await;
    let _second = h.next_peer().await;
    h.settle().await;

    assert_eq!(h.manager.max_live(), 1);
    assert!(monitor.attempt_alive());
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent() {
    let h = Harness::managed();
    let monitor = h.agent.monitor().clone();

    monitor.stop().await;
    monitor.start().await;
    monitor.start().await;
    assert!(monitor.is_running());

    monitor.stop().await;
    monitor.stop().await;
    assert!(!monitor.is_running());
    assert!(!monitor.attempt_alive());
}

#[tokio::test(start_paused = true)]
async fn closed_gate_delays_the_monitor_then_gives_up_waiting() {
    let h = Harness::managed();
    h.sysinfo.collected.store(false, Ordering::SeqCst);

    let started = tokio::time::Instant::now();
    h.agent.monitor().start().await;
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert!(h.agent.monitor().is_running());
}

#[tokio::test(start_paused = true)]
async fn gate_opening_early_starts_the_monitor_early() {
    let h = Harness::managed();
    h.sysinfo.collected.store(false, Ordering::SeqCst);

    let sysinfo = h.sysinfo.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        sysinfo.collected.store(true, Ordering::SeqCst);
    });

    let started = tokio::time::Instant::now();
    h.agent.monitor().start().await;
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn rejected_account_halts_the_monitor() {
    let h = Harness::managed();
    h.manager.answer(ProbeVerdict::InvalidAccount {
        message_id: "FusionDirector.1.0.UserNameOrPasswordError".into(),
    });
    h.agent.boot().await.unwrap();
    h.settle().await;

    assert_eq!(h.agent.status(), ConnectionStatus::ErrConfigured);
    assert!(!h.agent.monitor().is_running());

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.manager.opened(), 0);
}

#[tokio::test(start_paused = true)]
async fn spare_node_rejection_rewrites_the_node_id() {
    let mut h = Harness::managed();
    let body = json!({
        "error": {
            "@Message.ExtendedInfo": [{
                "MessageId": "FusionDirector.1.0.SpareNodeIDInCorrect",
                "MessageArgs": ["node-9"],
            }]
        }
    });
    *h.manager.reject_upgrade.lock().unwrap() = Some(serde_json::to_vec(&body).unwrap());

    h.agent.boot().await.unwrap();
    let _peer = h.next_peer().await;

    assert_eq!(h.net.load().unwrap().node_id, "node-9");
    assert_eq!(h.agent.monitor().attempt_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn interrupted_connect_restarts_from_the_first_handshake() {
    let h = Harness::new(|cipher| NetConfig {
        manager_type: ManagerType::FusionDirector,
        ip: MANAGER_IP.into(),
        port: 443,
        server_name: String::new(),
        status: Some(ConnectionStatus::Connecting),
        cloud_user: "EdgeAccount".into(),
        cloud_pwd: cipher.encrypt("Initial#Pass1").unwrap(),
        node_id: "node-1".into(),
    });
    h.agent.boot().await.unwrap();
    h.settle().await;

    // Reset to "first handshake", then the attempt marked it connecting again.
    assert_eq!(h.net.load().unwrap().status, Some(ConnectionStatus::Connecting));
    assert_eq!(h.agent.status(), ConnectionStatus::Connecting);
    assert_eq!(h.manager.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn factory_reset_forgets_the_manager() {
    let mut h = Harness::managed();
    h.agent.boot().await.unwrap();
    let _peer = h.next_peer().await;

    h.agent.factory_reset().await.unwrap();

    assert_eq!(h.net.load().unwrap(), NetConfig::web_defaults());
    assert!(h.agent.services().certs.cert_summaries().unwrap().is_empty());
    assert_eq!(h.hosts.lookup(SERVER_NAME).unwrap(), None);
    assert!(!h.agent.monitor().is_running());

    h.agent.shutdown().await;
}
