//! Full-text index synchronization.
//!
//! Each searchable table has an FTS5 shadow index described by an [`FtsIndex`].
//! On backends with trigger support the engine keeps the index current and
//! [`NativeTriggerSync`] does nothing. Otherwise [`ManualSync`] mirrors each
//! primary write into the index inside its own savepoint, so a failure rolls
//! back to that savepoint and the caller's enclosing savepoint can discard the
//! primary write as well.

use crate::core::db::{self, Capabilities};
use crate::core::error::{Result, StoreError};
use rusqlite::{Connection, params_from_iter};
use tracing::{debug, info};

/// A primary table and the FTS5 table mirroring some of its text columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FtsIndex {
    pub source_table: &'static str,
    pub index_table: &'static str,
    pub id_column: &'static str,
    pub columns: &'static [&'static str],
}

pub const PATTERNS_FTS: FtsIndex = FtsIndex {
    source_table: "patterns",
    index_table: "patterns_fts",
    id_column: "id",
    columns: &["title", "summary", "tags"],
};

pub const TASKS_FTS: FtsIndex = FtsIndex {
    source_table: "tasks",
    index_table: "tasks_fts",
    id_column: "id",
    columns: &["title", "intent", "tags"],
};

pub const ALL_INDEXES: &[FtsIndex] = &[PATTERNS_FTS, TASKS_FTS];

impl FtsIndex {
    fn trigger_names(&self) -> [String; 3] {
        [
            format!("{}_ai", self.index_table),
            format!("{}_ad", self.index_table),
            format!("{}_au", self.index_table),
        ]
    }

    fn column_list(&self) -> String {
        self.columns.join(", ")
    }

    fn prefixed(&self, prefix: &str) -> String {
        self.columns
            .iter()
            .map(|c| format!("{}.{}", prefix, c))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub fn create_index_sql(index: &FtsIndex) -> String {
    format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING fts5({} UNINDEXED, {}, tokenize = 'porter unicode61')",
        index.index_table,
        index.id_column,
        index.column_list()
    )
}

pub fn drop_index_sql(index: &FtsIndex) -> String {
    format!("DROP TABLE IF EXISTS {}", index.index_table)
}

/// Insert, delete and update triggers mirroring `index.source_table`.
pub fn trigger_sql(index: &FtsIndex) -> Vec<String> {
    let [ai, ad, au] = index.trigger_names();
    let insert_new = format!(
        "INSERT INTO {idx}({id}, {cols}) VALUES (new.{id}, {vals})",
        idx = index.index_table,
        id = index.id_column,
        cols = index.column_list(),
        vals = index.prefixed("new"),
    );
    let delete_old = format!(
        "DELETE FROM {idx} WHERE {id} = old.{id}",
        idx = index.index_table,
        id = index.id_column,
    );
    vec![
        format!(
            "CREATE TRIGGER IF NOT EXISTS {} AFTER INSERT ON {} BEGIN {}; END",
            ai, index.source_table, insert_new
        ),
        format!(
            "CREATE TRIGGER IF NOT EXISTS {} AFTER DELETE ON {} BEGIN {}; END",
            ad, index.source_table, delete_old
        ),
        format!(
            "CREATE TRIGGER IF NOT EXISTS {} AFTER UPDATE OF {} ON {} BEGIN {}; {}; END",
            au,
            index.column_list(),
            index.source_table,
            delete_old,
            insert_new
        ),
    ]
}

pub fn drop_trigger_sql(index: &FtsIndex) -> Vec<String> {
    index
        .trigger_names()
        .into_iter()
        .map(|t| format!("DROP TRIGGER IF EXISTS {}", t))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtsOp {
    Insert,
    Update,
    Delete,
}

/// Strategy for keeping an index in step with its source table.
pub trait FtsSync: Send + Sync {
    fn name(&self) -> &'static str;

    /// Mirror one primary write. `fields` holds the values of
    /// `index.columns`, in order; it is ignored for deletes.
    fn sync(
        &self,
        conn: &Connection,
        index: &FtsIndex,
        id: &str,
        fields: &[&str],
        op: FtsOp,
    ) -> Result<()>;
}

/// Triggers inside the engine maintain the index.
pub struct NativeTriggerSync;

impl FtsSync for NativeTriggerSync {
    fn name(&self) -> &'static str {
        "native"
    }

    fn sync(&self, _: &Connection, _: &FtsIndex, _: &str, _: &[&str], _: FtsOp) -> Result<()> {
        Ok(())
    }
}

/// Applies index mutations by hand, each inside a named savepoint.
pub struct ManualSync;

impl ManualSync {
    fn upsert(conn: &Connection, index: &FtsIndex, id: &str, fields: &[&str]) -> Result<()> {
        if fields.len() != index.columns.len() {
            return Err(StoreError::ValidationError(format!(
                "{} expects {} fields, got {}",
                index.index_table,
                index.columns.len(),
                fields.len()
            )));
        }
        db::with_savepoint(conn, "fts_upsert", |conn| {
            conn.execute(
                &format!(
                    "DELETE FROM {} WHERE {} = ?1",
                    index.index_table, index.id_column
                ),
                [id],
            )?;
            let placeholders = (1..=fields.len() + 1)
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ");
            let values = std::iter::once(id).chain(fields.iter().copied());
            conn.execute(
                &format!(
                    "INSERT INTO {}({}, {}) VALUES ({})",
                    index.index_table,
                    index.id_column,
                    index.column_list(),
                    placeholders
                ),
                params_from_iter(values),
            )?;
            Ok(())
        })
    }

    fn delete(conn: &Connection, index: &FtsIndex, id: &str) -> Result<()> {
        db::with_savepoint(conn, "fts_delete", |conn| {
            conn.execute(
                &format!(
                    "DELETE FROM {} WHERE {} = ?1",
                    index.index_table, index.id_column
                ),
                [id],
            )?;
            Ok(())
        })
    }
}

impl FtsSync for ManualSync {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn sync(
        &self,
        conn: &Connection,
        index: &FtsIndex,
        id: &str,
        fields: &[&str],
        op: FtsOp,
    ) -> Result<()> {
        match op {
            FtsOp::Insert | FtsOp::Update => Self::upsert(conn, index, id, fields),
            FtsOp::Delete => Self::delete(conn, index, id),
        }
    }
}

/// Chooses a sync strategy once, from the backend's capabilities.
pub struct FtsManager {
    strategy: Box<dyn FtsSync>,
}

impl FtsManager {
    pub fn for_capabilities(capabilities: Capabilities) -> Self {
        let strategy: Box<dyn FtsSync> = if capabilities.supports_triggers {
            Box::new(NativeTriggerSync)
        } else {
            Box::new(ManualSync)
        };
        Self { strategy }
    }

    pub fn with_strategy(strategy: Box<dyn FtsSync>) -> Self {
        Self { strategy }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn sync_fts(
        &self,
        conn: &Connection,
        index: &FtsIndex,
        id: &str,
        fields: &[&str],
        op: FtsOp,
    ) -> Result<()> {
        self.strategy.sync(conn, index, id, fields, op)
    }

    /// Ids matching `text`, best match first. Empty when `text` has no terms.
    pub fn search_ids(
        conn: &Connection,
        index: &FtsIndex,
        text: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        let Some(expr) = match_query(text) else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare(&format!(
            "SELECT {id} FROM {idx} WHERE {idx} MATCH ?1 ORDER BY rank LIMIT ?2",
            id = index.id_column,
            idx = index.index_table
        ))?;
        let rows = stmt.query_map(rusqlite::params![expr, limit as i64], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

/// Repopulate an index from its source table.
pub fn rebuild(conn: &Connection, index: &FtsIndex) -> Result<usize> {
    db::with_savepoint(conn, "fts_rebuild", |conn| {
        conn.execute(&format!("DELETE FROM {}", index.index_table), [])?;
        let n = conn.execute(
            &format!(
                "INSERT INTO {idx}({id}, {cols}) SELECT {id}, {cols} FROM {src}",
                idx = index.index_table,
                id = index.id_column,
                cols = index.column_list(),
                src = index.source_table
            ),
            [],
        )?;
        debug!(index = index.index_table, rows = n, "rebuilt fts index");
        Ok(n)
    })
}

/// Bring trigger state in line with the backend now serving the file.
///
/// A database created under a trigger-less backend and reopened with
/// trigger support has no triggers yet; they are created and the index is
/// rebuilt, since manual sync may have been skipped for some rows.
pub fn ensure_triggers(conn: &Connection, capabilities: Capabilities) -> Result<Vec<&'static str>> {
    let mut repaired = Vec::new();
    if !capabilities.supports_triggers {
        return Ok(repaired);
    }
    for index in ALL_INDEXES {
        if !db::table_exists(conn, index.source_table)? || !db::table_exists(conn, index.index_table)? {
            continue;
        }
        let names = index.trigger_names();
        let present: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger' AND name IN (?1, ?2, ?3)",
            rusqlite::params![names[0], names[1], names[2]],
            |row| row.get(0),
        )?;
        if present as usize == names.len() {
            continue;
        }
        for sql in trigger_sql(index) {
            conn.execute_batch(&sql)?;
        }
        rebuild(conn, index)?;
        info!(index = index.index_table, "installed missing fts triggers");
        repaired.push(index.index_table);
    }
    Ok(repaired)
}

/// Turn free text into a safe FTS5 expression: every alphanumeric run becomes
/// a quoted prefix term, terms are AND-ed.
pub fn match_query(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"*", t.to_lowercase()))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}
