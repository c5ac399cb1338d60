//! `edgeom status` and `edgeom reset-status`.

use std::fmt::Write;

use serde::Serialize;

use edgeom_config::AgentConfig;
use edgeom_core::store::{JsonNetConfigStore, NetConfigStore};
use edgeom_core::{CertSummary, NetConfig, check_and_reset_status};

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output;

const REDACTED: &str = "********";

/// The persisted row with the password hidden.
#[derive(Debug, Serialize)]
struct StatusView {
    manager_type: String,
    ip: String,
    port: u16,
    server_name: String,
    status: String,
    account: String,
    password: String,
    node_id: String,
    certificates: Vec<CertSummary>,
}

impl StatusView {
    fn new(net: NetConfig, certificates: Vec<CertSummary>) -> Self {
        Self {
            manager_type: net.manager_type.to_string(),
            status: net.status.map(|s| s.as_str().to_owned()).unwrap_or_default(),
            password: if net.cloud_pwd.is_empty() {
                String::new()
            } else {
                REDACTED.to_owned()
            },
            ip: net.ip,
            port: net.port,
            server_name: net.server_name,
            account: net.cloud_user,
            node_id: net.node_id,
            certificates,
        }
    }

    fn detail(&self) -> String {
        let mut out = String::new();
        let status = if self.status.is_empty() {
            "(first handshake)".to_owned()
        } else {
            output::paint_status(&self.status)
        };
        let _ = writeln!(out, "Manager:      {}", self.manager_type);
        if !self.ip.is_empty() {
            let _ = writeln!(out, "Address:      {}:{}", self.ip, self.port);
        }
        if !self.server_name.is_empty() {
            let _ = writeln!(out, "Server name:  {}", self.server_name);
        }
        let _ = writeln!(out, "Status:       {status}");
        if !self.account.is_empty() {
            let _ = writeln!(out, "Account:      {} / {}", self.account, self.password);
        }
        if !self.node_id.is_empty() {
            let _ = writeln!(out, "Node id:      {}", self.node_id);
        }
        let _ = write!(out, "Certificates: {}", self.certificates.len());
        for c in &self.certificates {
            let _ = write!(
                out,
                "\n  {}{} ({}, until {})",
                c.name,
                if c.in_use { " [in use]" } else { "" },
                c.source,
                c.not_after.format("%Y-%m-%d"),
            );
        }
        out
    }
}

fn net_store(config: &AgentConfig) -> JsonNetConfigStore {
    JsonNetConfigStore::new(config.paths.net_config_file())
}

pub fn show(global: &GlobalOpts, config: &AgentConfig) -> Result<(), CliError> {
    let net = net_store(config).load()?;
    let certs = super::open_cert_store(config).cert_summaries()?;
    let view = StatusView::new(net, certs);
    let out = output::render_single(global.output, &view, StatusView::detail)?;
    output::print_output(&out);
    Ok(())
}

pub fn reset(global: &GlobalOpts, config: &AgentConfig) -> Result<(), CliError> {
    let net = check_and_reset_status(&net_store(config))?;
    let view = StatusView::new(net, Vec::new());
    let out = output::render_single(global.output, &view, |v| {
        if v.status.is_empty() {
            "Status reset: next connect starts from the first handshake".to_owned()
        } else {
            format!("Status kept: {}", v.status)
        }
    })?;
    output::print_output(&out);
    Ok(())
}
