//! Beta(alpha, beta) trust parameters. Rows that predate the columns get
//! parameters reproducing their stored score with a weight of two
//! observations, then every score is recomputed from the parameters.

use crate::core::error::Result;
use crate::core::migration::{Migration, MigrationDb};
use crate::core::schemas::{self, PATTERN_COLUMNS_TRUST};

pub fn migration() -> Migration {
    Migration {
        id: "002-add-trust-beta",
        version: 2,
        name: "Add Beta trust parameters",
        up,
        down,
        validate: Some(validate),
        checksum: None,
        source: include_str!("v002_add_trust_beta.rs"),
        schema: vec![schemas::column_defs(PATTERN_COLUMNS_TRUST)],
        file: file!(),
    }
}

fn up(db: &MigrationDb<'_>) -> Result<()> {
    let mut added = false;
    for (name, def) in PATTERN_COLUMNS_TRUST {
        if !db.has_column("patterns", name)? {
            db.execute_batch(&format!("ALTER TABLE patterns ADD COLUMN {}", def))?;
            added = true;
        }
    }
    if added {
        db.execute_batch(
            "UPDATE patterns
             SET alpha = MAX(trust_score * 2.0, 0.01),
                 beta = MAX((1.0 - trust_score) * 2.0, 0.01)
             WHERE trust_score <> 0.5;",
        )?;
    }
    db.execute_batch("UPDATE patterns SET trust_score = alpha / (alpha + beta);")?;
    Ok(())
}

fn down(db: &MigrationDb<'_>) -> Result<()> {
    for (name, _) in PATTERN_COLUMNS_TRUST.iter().rev() {
        if db.has_column("patterns", name)? {
            db.execute_batch(&format!("ALTER TABLE patterns DROP COLUMN {}", name))?;
        }
    }
    Ok(())
}

fn validate(db: &MigrationDb<'_>) -> Result<bool> {
    let drift: i64 = db.query_row(
        "SELECT COUNT(*) FROM patterns
         WHERE alpha <= 0 OR beta <= 0 OR ABS(trust_score - alpha / (alpha + beta)) > 1e-9",
        [],
        |row| row.get(0),
    )?;
    Ok(drift == 0)
}
