use crate::core::error::Result;
use crate::core::migration::{Migration, MigrationDb};
use crate::core::schemas;

pub fn migration() -> Migration {
    Migration {
        id: "001-initial-schema",
        version: 1,
        name: "Initial patterns schema",
        up,
        down,
        validate: None,
        checksum: None,
        source: include_str!("v001_initial_schema.rs"),
        schema: vec![schemas::patterns_table_v1(), schemas::PATTERN_INDEXES.join("\n")],
        file: file!(),
    }
}

fn up(db: &MigrationDb<'_>) -> Result<()> {
    db.execute_batch(&schemas::patterns_table_v1())?;
    for sql in schemas::PATTERN_INDEXES {
        db.execute_batch(sql)?;
    }
    Ok(())
}

fn down(db: &MigrationDb<'_>) -> Result<()> {
    db.execute_batch(
        "DROP INDEX IF EXISTS idx_patterns_digest;
         DROP INDEX IF EXISTS idx_patterns_trust;
         DROP INDEX IF EXISTS idx_patterns_type;
         DROP TABLE IF EXISTS patterns;",
    )?;
    Ok(())
}
