//! Storage engine: database adapter, migration machinery and index sync.
//!
//! Everything the repositories in [`crate::plugins`] build on lives here.

pub mod bootstrap;
pub mod config;
pub mod db;
pub mod error;
pub mod fts;
pub mod migration;
pub mod migration_lock;
pub mod pool;
pub mod schemas;
pub mod time;
