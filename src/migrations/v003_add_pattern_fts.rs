use crate::core::error::Result;
use crate::core::fts::{self, PATTERNS_FTS};
use crate::core::migration::{Migration, MigrationDb};

pub fn migration() -> Migration {
    Migration {
        id: "003-add-pattern-fts",
        version: 3,
        name: "Add pattern full-text index",
        up,
        down,
        validate: None,
        checksum: None,
        source: include_str!("v003_add_pattern_fts.rs"),
        schema: vec![
            fts::create_index_sql(&PATTERNS_FTS),
            fts::trigger_sql(&PATTERNS_FTS).join("\n"),
        ],
        file: file!(),
    }
}

fn up(db: &MigrationDb<'_>) -> Result<()> {
    db.execute_batch(&fts::create_index_sql(&PATTERNS_FTS))?;
    if db.supports_triggers() {
        for sql in fts::trigger_sql(&PATTERNS_FTS) {
            db.execute_batch(&sql)?;
        }
    }
    fts::rebuild(db, &PATTERNS_FTS)?;
    Ok(())
}

fn down(db: &MigrationDb<'_>) -> Result<()> {
    for sql in fts::drop_trigger_sql(&PATTERNS_FTS) {
        db.execute_batch(&sql)?;
    }
    db.execute_batch(&fts::drop_index_sql(&PATTERNS_FTS))?;
    Ok(())
}
