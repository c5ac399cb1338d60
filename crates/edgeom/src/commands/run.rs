//! `edgeom run`: the agent daemon.

use std::sync::Arc;

use tracing::{info, warn};

use edgeom_config::AgentConfig;
use edgeom_core::cipher::AesGcmCipher;
use edgeom_core::clock::SystemClock;
use edgeom_core::hosts::HostsFile;
use edgeom_core::mef::DisabledMef;
use edgeom_core::store::{JsonCertRepository, JsonNetConfigStore};
use edgeom_core::sysinfo::HostSystemInfo;
use edgeom_core::{Agent, AgentDeps, WireTransport};

use crate::error::CliError;

pub async fn handle(config: &AgentConfig) -> Result<(), CliError> {
    let settings = config.settings();
    let paths = &config.paths;
    std::fs::create_dir_all(&paths.state_dir)?;

    let cipher = AesGcmCipher::load_or_create(&paths.key_file)?;
    let sysinfo = Arc::new(HostSystemInfo::new(
        settings.device.clone(),
        paths.docker_root.clone(),
    ));
    let transport = WireTransport::new(settings.probe.clone(), settings.tasks.clone());

    let agent = Agent::install(AgentDeps {
        net: Arc::new(JsonNetConfigStore::new(paths.net_config_file())),
        cert_repo: Arc::new(JsonCertRepository::new(paths.cert_pool_file())),
        cipher: Arc::new(cipher),
        clock: Arc::new(SystemClock),
        transport: Arc::new(transport),
        hosts: Arc::new(HostsFile::new(paths.hosts_file.clone())),
        mef: Arc::new(DisabledMef),
        sysinfo: sysinfo.clone(),
        extra_handlers: Vec::new(),
        settings,
    })?;

    sysinfo.mark_collected();
    agent.boot().await?;
    info!(status = %agent.status(), state_dir = %paths.state_dir.display(), "agent running");

    shutdown_signal().await;
    info!("signal received, stopping");
    agent.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
