//! Command handlers.

pub mod cert;
pub mod config_cmd;
pub mod run;
pub mod status;

use std::sync::Arc;

use edgeom_config::AgentConfig;
use edgeom_core::CertStore;
use edgeom_core::clock::SystemClock;
use edgeom_core::store::JsonCertRepository;

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;

pub async fn dispatch(
    command: Command,
    global: &GlobalOpts,
    config: &AgentConfig,
) -> Result<(), CliError> {
    match command {
        Command::Run => run::handle(config).await,
        Command::Cert(cmd) => cert::handle(cmd, global, config),
        Command::Status => status::show(global, config),
        Command::ResetStatus => status::reset(global, config),
        Command::Config(cmd) => config_cmd::handle(&cmd, global, config),
        // Handled before the runtime starts.
        Command::Completions(_) => Ok(()),
    }
}

/// The certificate pool as stored under the state directory.
fn open_cert_store(config: &AgentConfig) -> CertStore {
    CertStore::new(
        Arc::new(JsonCertRepository::new(config.paths.cert_pool_file())),
        config.settings().certs,
        Arc::new(SystemClock),
    )
}
