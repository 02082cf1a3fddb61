use crate::core::error::Result;
use crate::core::fts::{self, TASKS_FTS};
use crate::core::migration::{Migration, MigrationDb};
use crate::core::schemas;

pub fn migration() -> Migration {
    Migration {
        id: "006-create-tasks",
        version: 6,
        name: "Create task tables",
        up,
        down,
        validate: None,
        checksum: None,
        source: include_str!("v006_create_tasks.rs"),
        schema: vec![
            schemas::TASKS_TABLE_SCHEMA.to_string(),
            schemas::TASK_EVIDENCE_TABLE_SCHEMA.to_string(),
            schemas::TASK_CHECKPOINTS_TABLE_SCHEMA.to_string(),
            schemas::TASK_INDEXES.join("\n"),
            fts::create_index_sql(&TASKS_FTS),
            fts::trigger_sql(&TASKS_FTS).join("\n"),
        ],
        file: file!(),
    }
}

fn up(db: &MigrationDb<'_>) -> Result<()> {
    db.execute_batch(schemas::TASKS_TABLE_SCHEMA)?;
    db.execute_batch(schemas::TASK_EVIDENCE_TABLE_SCHEMA)?;
    db.execute_batch(schemas::TASK_CHECKPOINTS_TABLE_SCHEMA)?;
    for sql in schemas::TASK_INDEXES {
        db.execute_batch(sql)?;
    }
    db.execute_batch(&fts::create_index_sql(&TASKS_FTS))?;
    if db.supports_triggers() {
        for sql in fts::trigger_sql(&TASKS_FTS) {
            db.execute_batch(&sql)?;
        }
    }
    fts::rebuild(db, &TASKS_FTS)?;
    Ok(())
}

fn down(db: &MigrationDb<'_>) -> Result<()> {
    for sql in fts::drop_trigger_sql(&TASKS_FTS) {
        db.execute_batch(&sql)?;
    }
    db.execute_batch(&fts::drop_index_sql(&TASKS_FTS))?;
    db.execute_batch(
        "DROP INDEX IF EXISTS idx_task_checkpoints_task;
         DROP INDEX IF EXISTS idx_task_evidence_task;
         DROP INDEX IF EXISTS idx_tasks_created;
         DROP INDEX IF EXISTS idx_tasks_identifier;
         DROP INDEX IF EXISTS idx_tasks_status;
         DROP TABLE IF EXISTS task_checkpoints;
         DROP TABLE IF EXISTS task_evidence;
         DROP TABLE IF EXISTS tasks;",
    )?;
    Ok(())
}
