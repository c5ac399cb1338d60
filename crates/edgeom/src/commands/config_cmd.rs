//! `edgeom config`: inspect the effective configuration.

use edgeom_config::AgentConfig;

use crate::cli::{ConfigCommand, GlobalOpts, OutputFormat};
use crate::error::CliError;
use crate::output;

pub fn handle(
    cmd: &ConfigCommand,
    global: &GlobalOpts,
    config: &AgentConfig,
) -> Result<(), CliError> {
    let text = match cmd {
        ConfigCommand::Show => match global.output {
            OutputFormat::Table => config.to_toml()?,
            OutputFormat::Json => serde_json::to_string_pretty(config)?,
        },
        ConfigCommand::Path => global
            .config
            .clone()
            .unwrap_or_else(edgeom_config::config_path)
            .display()
            .to_string(),
    };
    output::print_output(&text);
    Ok(())
}
