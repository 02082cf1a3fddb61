//! patternstore: an embedded pattern and task intelligence store.
//!
//! A single SQLite file holds reusable engineering *patterns* (with Bayesian
//! trust scores) and auditable *tasks* (phase handoffs, evidence,
//! checkpoints). The store keeps its own schema current through versioned,
//! checksummed migrations and keeps full-text indexes in sync whether or not
//! the active backend supports triggers.
//!
//! # Crate Structure
//!
//! - [`core`]: database adapter, migration machinery, lock, FTS sync, config
//! - [`migrations`]: the compiled-in migration units
//! - [`plugins`]: pattern and task repositories, context pack service
//!
//! # Example
//!
//! ```no_run
//! use patternstore::core::bootstrap::AutoMigrator;
//! use patternstore::core::config::StoreConfig;
//! use patternstore::core::pool::ConnectionPool;
//! use patternstore::plugins::patterns::{NewPattern, PatternRepository, PatternType};
//!
//! # fn main() -> patternstore::core::error::Result<()> {
//! let config = StoreConfig::default();
//! let pool = ConnectionPool::new(config.adapter_options());
//! let db = pool.open(&config.db_path)?;
//! AutoMigrator::new(&db, &config).auto_migrate()?;
//!
//! let patterns = PatternRepository::new(db);
//! patterns.insert(NewPattern::new(PatternType::Codebase, "Retry with backoff", "..."))?;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod migrations;
pub mod plugins;

mod cli;

pub use crate::core::error::{Result, StoreError};

use crate::cli::{Cli, Command, ContextCli, MigrateCli, OutputFormat};
use crate::core::bootstrap::AutoMigrator;
use crate::core::config::StoreConfig;
use crate::core::db::{Database, schema_fingerprint};
use crate::core::migration::{MigrationLoader, MigrationRunner, MigrationStatus, RunOptions, RunReport};
use crate::core::migration_lock::MigrationLock;
use crate::core::pool::ConnectionPool;
use crate::plugins::context::{ContextPackOptions, ContextPackService};
use clap::Parser;
use colored::Colorize;
use serde::Serialize;
use std::sync::Arc;

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_dir = match cli.config_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let mut config = StoreConfig::load(&config_dir)?;
    if let Some(path) = cli.db.clone() {
        config.db_path = path;
    }
    // The binary owns the process, so an interrupted migration may exit.
    config.lock.release_on_signal = true;

    let pool = ConnectionPool::new(config.adapter_options());
    let db = pool.open(&config.db_path)?;

    let outcome = dispatch(&cli, &config, &db);
    pool.close_all()?;
    outcome
}

fn dispatch(cli: &Cli, config: &StoreConfig, db: &Arc<Database>) -> Result<()> {
    match &cli.command {
        Command::Migrate(args) => migrate(cli.format, config, db, args),
        Command::Status => {
            let migrations = MigrationLoader::from_registry().load()?;
            let status = MigrationRunner::new(db).status(&migrations)?;
            print_status(cli.format, db, &status)
        }
        Command::Rollback { to } => {
            let migrations = MigrationLoader::from_registry().load()?;
            let _guard = MigrationLock::for_database(db.path(), config.lock_options()).acquire()?;
            let report = MigrationRunner::new(db).rollback(&migrations, *to)?;
            print_report(cli.format, "rolled back", &report)
        }
        Command::Fingerprint => {
            let fingerprint = db.with_conn(schema_fingerprint)?;
            match cli.format {
                OutputFormat::Json => emit_json(&serde_json::json!({ "fingerprint": fingerprint })),
                OutputFormat::Text => {
                    println!("{}", fingerprint);
                    Ok(())
                }
            }
        }
        Command::Context(args) => context(config, db, args),
    }
}

fn migrate(format: OutputFormat, config: &StoreConfig, db: &Database, args: &MigrateCli) -> Result<()> {
    if !args.dry_run && args.target.is_none() && !args.force {
        let report = AutoMigrator::new(db, config).auto_migrate()?;
        return match format {
            OutputFormat::Json => emit_json(&report),
            OutputFormat::Text => {
                println!(
                    "  {} {:?} path, applied {:?}",
                    "✓".bright_green(),
                    report.path,
                    report.applied
                );
                for index in &report.repaired_indexes {
                    println!("  {} repaired triggers for {}", "▸".bright_yellow(), index);
                }
                Ok(())
            }
        };
    }

    let migrations = MigrationLoader::from_registry().load()?;
    let _guard = MigrationLock::for_database(db.path(), config.lock_options()).acquire()?;
    let report = MigrationRunner::new(db).run(
        &migrations,
        &RunOptions {
            dry_run: args.dry_run,
            target_version: args.target,
            force: args.force,
        },
    )?;
    print_report(format, "applied", &report)
}

fn context(config: &StoreConfig, db: &Arc<Database>, args: &ContextCli) -> Result<()> {
    let service = ContextPackService::new(Arc::clone(db), &config.context);
    let pack = service.get_context_pack(&ContextPackOptions {
        task_id: args.task.clone(),
        max_active_tasks: args.max_active_tasks,
        max_similar: args.max_similar,
        max_patterns: args.max_patterns,
        min_trust: args.min_trust,
        max_size_bytes: args.max_size,
    })?;
    emit_json(&*pack)
}

fn print_status(format: OutputFormat, db: &Database, status: &MigrationStatus) -> Result<()> {
    if format == OutputFormat::Json {
        return emit_json(status);
    }
    println!(
        "  {} {} ({} backend)",
        "database".bright_white(),
        db.path().display(),
        db.backend()
    );
    println!(
        "  {} v{} of {}",
        "schema".bright_white(),
        status.current_version(),
        status.total
    );
    for applied in &status.applied {
        println!(
            "    {} {} {}",
            "●".bright_green(),
            applied.id,
            applied.applied_at.bright_black()
        );
    }
    for version in &status.pending {
        println!("    {} v{:03} pending", "○".bright_yellow(), version);
    }
    Ok(())
}

fn print_report(format: OutputFormat, verb: &str, report: &RunReport) -> Result<()> {
    if format == OutputFormat::Json {
        return emit_json(report);
    }
    if report.dry_run {
        println!("  {} would apply {:?}", "▸".bright_yellow(), report.planned);
        return Ok(());
    }
    if !report.restamped.is_empty() {
        println!("  {} re-stamped {:?}", "▸".bright_yellow(), report.restamped);
    }
    println!("  {} {} {:?}", "✓".bright_green(), verb, report.versions);
    Ok(())
}

fn emit_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
