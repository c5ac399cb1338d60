// ── Service graph ──
//
// Every collaborator of the lifecycle layer, built once and shared by
// reference. Nothing here is a global; the binary (or a test) decides what
// goes in through `AgentDeps`.

use std::sync::Arc;

use crate::alarm::{AlarmQueue, AlarmSink, CertExpiryChecker};
use crate::cert::CertStore;
use crate::cipher::PasswordCipher;
use crate::clock::Clock;
use crate::config::AgentSettings;
use crate::context::ConnectionContext;
use crate::dispatch::{CertHandler, CertOp, Dispatcher, MessageHandler, NetManagerHandler};
use crate::error::CoreError;
use crate::hosts::HostsFile;
use crate::mef::MefLink;
use crate::outbox::Outboxes;
use crate::state::{ConnectionStatus, StatusMachine};
use crate::store::{CertRepository, NetConfigStore};
use crate::sysinfo::SystemInfoSource;
use crate::transport::FdTransport;

/// What the caller provides.
pub struct AgentDeps {
    pub settings: AgentSettings,
    pub net: Arc<dyn NetConfigStore>,
    pub cert_repo: Arc<dyn CertRepository>,
    pub cipher: Arc<dyn PasswordCipher>,
    pub clock: Arc<dyn Clock>,
    pub transport: Arc<dyn FdTransport>,
    pub hosts: Arc<HostsFile>,
    pub mef: Arc<dyn MefLink>,
    pub sysinfo: Arc<dyn SystemInfoSource>,
    /// Handlers for resources beyond the built-in ones.
    pub extra_handlers: Vec<Arc<dyn MessageHandler>>,
}

/// The assembled graph.
pub struct Services {
    pub settings: AgentSettings,
    pub net: Arc<dyn NetConfigStore>,
    pub certs: Arc<CertStore>,
    pub cipher: Arc<dyn PasswordCipher>,
    pub status: Arc<StatusMachine>,
    pub ctx: Arc<ConnectionContext>,
    pub transport: Arc<dyn FdTransport>,
    pub hosts: Arc<HostsFile>,
    pub outboxes: Arc<Outboxes>,
    pub alarms: Arc<dyn AlarmSink>,
    pub expiry: Arc<CertExpiryChecker>,
    pub mef: Arc<dyn MefLink>,
    pub sysinfo: Arc<dyn SystemInfoSource>,
    pub dispatcher: Arc<Dispatcher>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("status", &self.status.current())
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl Services {
    /// Assemble the graph. The status machine starts from the persisted
    /// marker, `NotConfigured` when there is none.
    pub fn build(deps: AgentDeps) -> Result<Arc<Self>, CoreError> {
        let AgentDeps {
            settings,
            net,
            cert_repo,
            cipher,
            clock,
            transport,
            hosts,
            mef,
            sysinfo,
            extra_handlers,
        } = deps;

        let initial = net.load()?.status.unwrap_or(ConnectionStatus::NotConfigured);
        let status = Arc::new(StatusMachine::new(initial));
        let certs = Arc::new(CertStore::new(cert_repo, settings.certs.clone(), clock));
        let ctx = Arc::new(ConnectionContext::new());
        let outboxes = Arc::new(Outboxes::new(settings.tasks.channel_capacity));
        let alarms: Arc<dyn AlarmSink> = Arc::new(AlarmQueue::new(Arc::clone(&outboxes)));
        let expiry = Arc::new(CertExpiryChecker::new(
            Arc::clone(&certs),
            Arc::clone(&status),
            Arc::clone(&alarms),
        ));

        let mut dispatcher = Dispatcher::new(Arc::clone(&status), settings.tasks.max_message_bytes);
        dispatcher.register(Arc::new(NetManagerHandler::new(
            Arc::clone(&net),
            Arc::clone(&cipher),
            Arc::clone(&ctx),
            Arc::clone(&sysinfo),
        )));
        for op in [CertOp::Update, CertOp::CrlUpdate, CertOp::Delete, CertOp::Query] {
            dispatcher.register(Arc::new(CertHandler::new(
                op,
                Arc::clone(&certs),
                Arc::clone(&expiry),
            )));
        }
        for handler in extra_handlers {
            dispatcher.register(handler);
        }

        Ok(Arc::new(Self {
            settings,
            net,
            certs,
            cipher,
            status,
            ctx,
            transport,
            hosts,
            outboxes,
            alarms,
            expiry,
            mef,
            sysinfo,
            dispatcher: Arc::new(dispatcher),
        }))
    }
}
