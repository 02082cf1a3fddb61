//! Unique human-readable alias per pattern, backfilled from titles in
//! creation order so the oldest pattern keeps the bare slug.

use crate::core::error::Result;
use crate::core::migration::{Migration, MigrationDb};
use crate::core::schemas::{self, PATTERN_ALIAS_INDEX, PATTERN_COLUMNS_ALIAS};
use crate::plugins::patterns::{alias_rules, slugify, unique_alias};
use rustc_hash::FxHashSet;

pub fn migration() -> Migration {
    Migration {
        id: "005-add-pattern-alias",
        version: 5,
        name: "Add pattern alias",
        up,
        down,
        validate: Some(validate),
        checksum: None,
        source: include_str!("v005_add_pattern_alias.rs"),
        schema: vec![
            schemas::column_defs(PATTERN_COLUMNS_ALIAS),
            PATTERN_ALIAS_INDEX.to_string(),
            alias_rules(),
        ],
        file: file!(),
    }
}

fn up(db: &MigrationDb<'_>) -> Result<()> {
    for (name, def) in PATTERN_COLUMNS_ALIAS {
        if !db.has_column("patterns", name)? {
            db.execute_batch(&format!("ALTER TABLE patterns ADD COLUMN {}", def))?;
        }
    }

    let mut taken: FxHashSet<String> = FxHashSet::default();
    {
        let mut stmt = db.prepare("SELECT alias FROM patterns WHERE alias IS NOT NULL")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for r in rows {
            taken.insert(r?);
        }
    }

    let missing: Vec<(String, String)> = {
        let mut stmt = db.prepare(
            "SELECT id, title FROM patterns WHERE alias IS NULL ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        out
    };
    for (id, title) in missing {
        let alias = unique_alias(&slugify(&title), |candidate| taken.contains(candidate));
        db.execute(
            "UPDATE patterns SET alias = ?1 WHERE id = ?2",
            [alias.as_str(), id.as_str()],
        )?;
        taken.insert(alias);
    }

    db.execute_batch(PATTERN_ALIAS_INDEX)?;
    Ok(())
}

fn down(db: &MigrationDb<'_>) -> Result<()> {
    db.execute_batch("DROP INDEX IF EXISTS idx_patterns_alias;")?;
    for (name, _) in PATTERN_COLUMNS_ALIAS {
        if db.has_column("patterns", name)? {
            db.execute_batch(&format!("ALTER TABLE patterns DROP COLUMN {}", name))?;
        }
    }
    Ok(())
}

fn validate(db: &MigrationDb<'_>) -> Result<bool> {
    let unaliased: i64 = db.query_row(
        "SELECT COUNT(*) FROM patterns WHERE alias IS NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(unaliased == 0)
}
