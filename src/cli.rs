//! CLI struct definitions for the `patternstore` command-line interface.
//!
//! All clap-derived types live here. Dispatch lives in [`crate::run`].

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "patternstore",
    version = env!("CARGO_PKG_VERSION"),
    about = "Embedded pattern and task intelligence store for agent workflows"
)]
pub(crate) struct Cli {
    /// Database path (overrides config and PATTERNSTORE_DB).
    #[clap(long, global = true)]
    pub db: Option<PathBuf>,
    /// Directory searched for patternstore.toml.
    #[clap(long, global = true)]
    pub config_dir: Option<PathBuf>,
    #[clap(long, global = true, value_enum, default_value = "text")]
    pub format: OutputFormat,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Bring the schema up to date (fresh databases get the full schema).
    Migrate(MigrateCli),
    /// Show applied and pending migrations.
    Status,
    /// Revert applied migrations above a version, newest first.
    Rollback {
        /// Version to keep; everything above it is reverted.
        #[clap(long)]
        to: u32,
    },
    /// Print the schema fingerprint.
    Fingerprint,
    /// Build a context pack and print it as JSON.
    Context(ContextCli),
}

#[derive(clap::Args, Debug)]
pub(crate) struct MigrateCli {
    /// List what would run without applying anything.
    #[clap(long)]
    pub dry_run: bool,
    /// Apply up to and including this version.
    #[clap(long)]
    pub target: Option<u32>,
    /// Skip checksum verification of applied migrations.
    #[clap(long)]
    pub force: bool,
}

#[derive(clap::Args, Debug)]
pub(crate) struct ContextCli {
    /// Task to center the pack on.
    #[clap(long)]
    pub task: Option<String>,
    #[clap(long, default_value_t = 10)]
    pub max_active_tasks: usize,
    #[clap(long, default_value_t = 5)]
    pub max_similar: usize,
    #[clap(long, default_value_t = 10)]
    pub max_patterns: usize,
    #[clap(long, default_value_t = 0.0)]
    pub min_trust: f64,
    /// Byte ceiling for the serialized pack.
    #[clap(long)]
    pub max_size: Option<usize>,
}
