use crate::core::error::Result;
use crate::core::migration::{Migration, MigrationDb};
use crate::core::schemas;

pub fn migration() -> Migration {
    Migration {
        id: "007-add-task-similarity",
        version: 7,
        name: "Add task similarity cache",
        up,
        down,
        validate: None,
        checksum: None,
        source: include_str!("v007_add_task_similarity.rs"),
        schema: vec![
            schemas::TASK_SIMILARITY_TABLE_SCHEMA.to_string(),
            schemas::TASK_SIMILARITY_INDEX.to_string(),
        ],
        file: file!(),
    }
}

fn up(db: &MigrationDb<'_>) -> Result<()> {
    db.execute_batch(schemas::TASK_SIMILARITY_TABLE_SCHEMA)?;
    db.execute_batch(schemas::TASK_SIMILARITY_INDEX)?;
    Ok(())
}

fn down(db: &MigrationDb<'_>) -> Result<()> {
    db.execute_batch(
        "DROP INDEX IF EXISTS idx_task_similarity_b;
         DROP TABLE IF EXISTS task_similarity;",
    )?;
    Ok(())
}
