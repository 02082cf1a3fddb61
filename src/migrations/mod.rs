//! Compile-time migration registry.
//!
//! Add a unit by creating `vNNN_snake_name.rs` with a `migration()`
//! constructor and appending it below. Applied units must never be edited:
//! their checksum is the hash of the file's source plus every shared schema
//! string the unit lists in `schema`.

use crate::core::migration::Migration;

mod v001_initial_schema;
mod v002_add_trust_beta;
mod v003_add_pattern_fts;
mod v004_add_quarantine_quality;
mod v005_add_pattern_alias;
mod v006_create_tasks;
mod v007_add_task_similarity;

pub fn registry() -> Vec<Migration> {
    vec![
        v001_initial_schema::migration(),
        v002_add_trust_beta::migration(),
        v003_add_pattern_fts::migration(),
        v004_add_quarantine_quality::migration(),
        v005_add_pattern_alias::migration(),
        v006_create_tasks::migration(),
        v007_add_task_similarity::migration(),
    ]
}

/// Highest version known to this build.
pub fn latest_version() -> u32 {
    registry().iter().map(|m| m.version).max().unwrap_or(0)
}
