mod cli;
mod commands;
mod error;
mod logging;
mod output;

use clap::Parser;

use edgeom_config::AgentConfig;

use crate::cli::{Cli, Command};
use crate::error::CliError;

fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    if let Command::Completions(args) = &cli.command {
        use clap::CommandFactory;

        let mut cmd = Cli::command();
        clap_complete::generate(args.shell, &mut cmd, "edgeom", &mut std::io::stdout());
        return Ok(());
    }

    let config = AgentConfig::load(cli.global.config.as_deref())?;
    let baseline = if matches!(cli.command, Command::Run) {
        config.log.level.as_str()
    } else {
        "warn"
    };
    let _guard = logging::init(cli.global.verbose, baseline, &config.log);
    tracing::debug!(command = ?cli.command, "dispatching command");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(commands::dispatch(cli.command, &cli.global, &config))
}
