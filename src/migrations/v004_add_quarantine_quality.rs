use crate::core::error::Result;
use crate::core::migration::{Migration, MigrationDb};
use crate::core::schemas::{self, PATTERN_COLUMNS_QUARANTINE};

pub fn migration() -> Migration {
    Migration {
        id: "004-add-quarantine-quality",
        version: 4,
        name: "Add quarantine and cached quality score",
        up,
        down,
        validate: None,
        checksum: None,
        source: include_str!("v004_add_quarantine_quality.rs"),
        schema: vec![schemas::column_defs(PATTERN_COLUMNS_QUARANTINE)],
        file: file!(),
    }
}

fn up(db: &MigrationDb<'_>) -> Result<()> {
    for (name, def) in PATTERN_COLUMNS_QUARANTINE {
        if !db.has_column("patterns", name)? {
            db.execute_batch(&format!("ALTER TABLE patterns ADD COLUMN {}", def))?;
        }
    }
    Ok(())
}

fn down(db: &MigrationDb<'_>) -> Result<()> {
    for (name, _) in PATTERN_COLUMNS_QUARANTINE.iter().rev() {
        if db.has_column("patterns", name)? {
            db.execute_batch(&format!("ALTER TABLE patterns DROP COLUMN {}", name))?;
        }
    }
    Ok(())
}
