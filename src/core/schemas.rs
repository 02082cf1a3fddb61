//! Centralized schema definitions.
//!
//! Column lists are shared between the migration units (which evolve a table
//! with `ALTER TABLE ADD COLUMN`) and [`full_schema`] (which creates the final
//! shape in one step for fresh databases), so both paths end at the same
//! column layout.

use crate::core::db::Capabilities;
use crate::core::fts::{self, PATTERNS_FTS, TASKS_FTS};

pub const MIGRATIONS_TABLE: &str = "migrations";

/// Checksum recorded for versions marked applied by the fresh-schema path.
pub const FRESH_SCHEMA_CHECKSUM: &str = "fresh-schema";

pub const MIGRATIONS_TABLE_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS migrations (
        version INTEGER PRIMARY KEY,
        id TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        checksum TEXT NOT NULL,
        applied_at TEXT NOT NULL,
        execution_time_ms INTEGER NOT NULL DEFAULT 0
    )
";

// --- patterns ---

pub const PATTERN_TYPES_CHECK: &str =
    "CHECK (type IN ('CODEBASE','LANG','ANTI','FAILURE','POLICY','TEST','MIGRATION'))";

/// 001: core pattern columns.
pub const PATTERN_COLUMNS_V1: &[&str] = &[
    "id TEXT PRIMARY KEY",
    "schema_version TEXT NOT NULL DEFAULT '1.0.0'",
    "pattern_version TEXT NOT NULL DEFAULT '1.0.0'",
    "type TEXT NOT NULL",
    "title TEXT NOT NULL",
    "summary TEXT NOT NULL DEFAULT ''",
    "trust_score REAL NOT NULL DEFAULT 0.5",
    "created_at TEXT NOT NULL",
    "updated_at TEXT NOT NULL",
    "source_repo TEXT",
    "tags TEXT NOT NULL DEFAULT '[]'",
    "pattern_digest TEXT NOT NULL",
    "json_canonical TEXT NOT NULL",
    "invalid INTEGER NOT NULL DEFAULT 0",
    "invalid_reason TEXT",
];

/// 002: Beta-distribution trust parameters and counters.
pub const PATTERN_COLUMNS_TRUST: &[(&str, &str)] = &[
    ("alpha", "alpha REAL NOT NULL DEFAULT 1.0"),
    ("beta", "beta REAL NOT NULL DEFAULT 1.0"),
    ("usage_count", "usage_count INTEGER NOT NULL DEFAULT 0"),
    ("success_count", "success_count INTEGER NOT NULL DEFAULT 0"),
];

/// 004: quarantine metadata and cached quality score.
pub const PATTERN_COLUMNS_QUARANTINE: &[(&str, &str)] = &[
    ("quarantine_reason", "quarantine_reason TEXT"),
    ("quarantine_date", "quarantine_date TEXT"),
    ("quality_score", "quality_score REAL"),
    ("quality_score_cached_at", "quality_score_cached_at TEXT"),
];

/// 005: human readable unique alias.
pub const PATTERN_COLUMNS_ALIAS: &[(&str, &str)] = &[("alias", "alias TEXT")];

pub const PATTERN_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_patterns_type ON patterns(type)",
    "CREATE INDEX IF NOT EXISTS idx_patterns_trust ON patterns(trust_score DESC)",
    "CREATE INDEX IF NOT EXISTS idx_patterns_digest ON patterns(pattern_digest)",
];

pub const PATTERN_ALIAS_INDEX: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_patterns_alias ON patterns(alias)";

/// Column definitions of an `ALTER TABLE .. ADD COLUMN` set, one per line.
pub fn column_defs(columns: &[(&str, &str)]) -> String {
    columns
        .iter()
        .map(|(_, def)| *def)
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn patterns_table_v1() -> String {
    create_table("patterns", PATTERN_COLUMNS_V1.iter().copied(), Some(PATTERN_TYPES_CHECK))
}

pub fn patterns_table_full() -> String {
    let added = PATTERN_COLUMNS_TRUST
        .iter()
        .chain(PATTERN_COLUMNS_QUARANTINE)
        .chain(PATTERN_COLUMNS_ALIAS)
        .map(|(_, def)| *def);
    create_table(
        "patterns",
        PATTERN_COLUMNS_V1.iter().copied().chain(added),
        Some(PATTERN_TYPES_CHECK),
    )
}

// --- tasks ---

pub const TASKS_TABLE_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        identifier TEXT,
        title TEXT NOT NULL,
        intent TEXT NOT NULL,
        task_type TEXT NOT NULL DEFAULT 'feature',
        status TEXT NOT NULL DEFAULT 'active',
        phase TEXT NOT NULL DEFAULT 'ARCHITECT',
        confidence REAL NOT NULL DEFAULT 0.3,
        tags TEXT NOT NULL DEFAULT '[]',
        objectives TEXT NOT NULL DEFAULT '[]',
        constraints TEXT NOT NULL DEFAULT '[]',
        acceptance_criteria TEXT NOT NULL DEFAULT '[]',
        plan TEXT NOT NULL DEFAULT '[]',
        facts TEXT NOT NULL DEFAULT '[]',
        snippets TEXT NOT NULL DEFAULT '[]',
        phase_handoffs TEXT NOT NULL DEFAULT '[]',
        outcome TEXT,
        key_learning TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        completed_at TEXT,
        CHECK (status IN ('active','completed','failed','blocked')),
        CHECK (confidence >= 0.0 AND confidence <= 1.0)
    )
";

pub const TASK_EVIDENCE_TABLE_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS task_evidence (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        content TEXT NOT NULL,
        metadata TEXT,
        created_at TEXT NOT NULL,
        FOREIGN KEY(task_id) REFERENCES tasks(id) ON DELETE CASCADE
    )
";

pub const TASK_CHECKPOINTS_TABLE_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS task_checkpoints (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT NOT NULL,
        phase TEXT NOT NULL,
        message TEXT NOT NULL,
        confidence REAL,
        created_at TEXT NOT NULL,
        FOREIGN KEY(task_id) REFERENCES tasks(id) ON DELETE CASCADE
    )
";

pub const TASK_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_identifier ON tasks(identifier)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_task_evidence_task ON task_evidence(task_id)",
    "CREATE INDEX IF NOT EXISTS idx_task_checkpoints_task ON task_checkpoints(task_id)",
];

/// Pairwise similarity cache, one row per unordered pair.
pub const TASK_SIMILARITY_TABLE_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS task_similarity (
        task_a TEXT NOT NULL,
        task_b TEXT NOT NULL,
        similarity REAL NOT NULL,
        calculated_at TEXT NOT NULL,
        PRIMARY KEY (task_a, task_b),
        CHECK (task_a < task_b),
        FOREIGN KEY(task_a) REFERENCES tasks(id) ON DELETE CASCADE,
        FOREIGN KEY(task_b) REFERENCES tasks(id) ON DELETE CASCADE
    )
";

pub const TASK_SIMILARITY_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_task_similarity_b ON task_similarity(task_b)";

/// The complete target schema, equivalent to applying every migration unit.
pub fn full_schema(capabilities: Capabilities) -> String {
    let mut sql = Vec::new();
    sql.push(MIGRATIONS_TABLE_SCHEMA.to_string());

    sql.push(patterns_table_full());
    sql.extend(PATTERN_INDEXES.iter().map(|s| s.to_string()));
    sql.push(fts::create_index_sql(&PATTERNS_FTS));
    if capabilities.supports_triggers {
        sql.extend(fts::trigger_sql(&PATTERNS_FTS));
    }
    sql.push(PATTERN_ALIAS_INDEX.to_string());

    sql.push(TASKS_TABLE_SCHEMA.to_string());
    sql.push(TASK_EVIDENCE_TABLE_SCHEMA.to_string());
    sql.push(TASK_CHECKPOINTS_TABLE_SCHEMA.to_string());
    sql.extend(TASK_INDEXES.iter().map(|s| s.to_string()));
    sql.push(fts::create_index_sql(&TASKS_FTS));
    if capabilities.supports_triggers {
        sql.extend(fts::trigger_sql(&TASKS_FTS));
    }

    sql.push(TASK_SIMILARITY_TABLE_SCHEMA.to_string());
    sql.push(TASK_SIMILARITY_INDEX.to_string());

    let mut out = sql.join(";\n");
    out.push(';');
    out
}

fn create_table<'a>(
    name: &str,
    columns: impl Iterator<Item = &'a str>,
    constraint: Option<&str>,
) -> String {
    let mut parts: Vec<String> = columns.map(|c| format!("        {}", c)).collect();
    if let Some(c) = constraint {
        parts.push(format!("        {}", c));
    }
    format!("CREATE TABLE IF NOT EXISTS {} (\n{}\n    )", name, parts.join(",\n"))
}
