//! `edgeom cert`: local maintenance of the certificate pool.

use std::path::Path;

use tabled::Tabled;
use tracing::info;

use edgeom_config::AgentConfig;
use edgeom_core::{CertSource, CertSummary};

use crate::cli::{CertCommand, GlobalOpts, SourceArg};
use crate::error::CliError;
use crate::output;

#[derive(Tabled)]
pub struct CertRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Subject")]
    subject: String,
    #[tabled(rename = "Chain")]
    chain: usize,
    #[tabled(rename = "Expires")]
    not_after: String,
    #[tabled(rename = "In use")]
    in_use: String,
    #[tabled(rename = "CRL")]
    crl: String,
}

impl From<&CertSummary> for CertRow {
    fn from(c: &CertSummary) -> Self {
        let flag = |b: bool| if b { "yes" } else { "" }.to_owned();
        Self {
            name: c.name.clone(),
            source: c.source.to_string(),
            subject: c.subject.clone(),
            chain: c.chain_num,
            not_after: c.not_after.format("%Y-%m-%d").to_string(),
            in_use: flag(c.in_use),
            crl: flag(c.has_crl),
        }
    }
}

fn read(path: &Path) -> Result<Vec<u8>, CliError> {
    std::fs::read(path).map_err(|source| CliError::Read {
        path: path.display().to_string(),
        source,
    })
}

pub fn handle(
    cmd: CertCommand,
    global: &GlobalOpts,
    config: &AgentConfig,
) -> Result<(), CliError> {
    let store = super::open_cert_store(config);

    match cmd {
        CertCommand::Import { name, file, source } => {
            let source = match source {
                SourceArg::Web => CertSource::Web,
                SourceArg::Fd => CertSource::FusionDirector,
            };
            let summary = store.import_cert(source, &name, &read(&file)?)?;
            info!(name = %summary.name, "certificate imported");
            let out = output::render_single(global.output, &summary, |s| {
                format!(
                    "Imported '{}': {} ({} certificate{}), valid until {}",
                    s.name,
                    s.subject,
                    s.chain_num,
                    if s.chain_num == 1 { "" } else { "s" },
                    s.not_after.format("%Y-%m-%d"),
                )
            })?;
            output::print_output(&out);
        }
        CertCommand::ImportCrl { file } => {
            let chain = store.import_crl(&read(&file)?)?;
            let view = serde_json::json!({ "cert": chain });
            let out = output::render_single(global.output, &view, |_| {
                format!("CRL imported for '{chain}'")
            })?;
            output::print_output(&out);
        }
        CertCommand::List => {
            let certs = store.cert_summaries()?;
            let out = output::render_list(global.output, &certs, |c| CertRow::from(c))?;
            output::print_output(&out);
        }
        CertCommand::Delete { name } => {
            store.delete_cert(&name)?;
            output::print_output(&format!("Deleted '{name}'"));
        }
    }
    Ok(())
}
