//! Clap derive structures for the `edgeom` binary.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// edgeom -- edge OM agent for FusionDirector management
#[derive(Debug, Parser)]
#[command(
    name = "edgeom",
    version,
    about = "Keep an edge device connected to its FusionDirector manager",
    long_about = "Runs the manager connection daemon and offers local maintenance of\n\
        the certificate pool and the persisted network configuration.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Configuration file
    #[arg(long, short = 'c', env = "EDGEOM_CONFIG_FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table", global = true)]
    pub output: OutputFormat,

    /// Increase verbosity (-v, -vv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the agent until interrupted
    Run,

    /// Manage the trusted certificate pool
    #[command(subcommand)]
    Cert(CertCommand),

    /// Show the persisted manager configuration and certificate pool
    Status,

    /// Reset a connect interrupted by a restart back to a first handshake
    ResetStatus,

    /// Inspect the effective configuration
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Debug, Subcommand)]
pub enum CertCommand {
    /// Import a CA chain (PEM)
    Import {
        /// Slot name
        #[arg(long)]
        name: String,

        /// PEM file holding the chain
        #[arg(long)]
        file: PathBuf,

        /// Who the chain is recorded as imported by
        #[arg(long, default_value = "web")]
        source: SourceArg,
    },

    /// Import a CRL for the chain that issued it
    ImportCrl {
        /// PEM file holding the CRL
        #[arg(long)]
        file: PathBuf,
    },

    /// List imported chains
    List,

    /// Delete a chain and its CRL
    Delete {
        #[arg(long)]
        name: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceArg {
    Web,
    Fd,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the merged configuration as TOML
    Show,
    /// Print the configuration file path in use
    Path,
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    #[arg(value_enum)]
    pub shell: clap_complete::Shell,
}
