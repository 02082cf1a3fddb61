//! Task repository: work items moving through the five-phase lifecycle.
//!
//! Phase handoffs, evidence and checkpoints are append-only. A handoff is
//! appended to the JSON array in SQL (`json_insert(.., '$[#]', ..)`), so two
//! handoffs into the same phase leave two entries. Completed and failed tasks
//! accept no further phase, brief or checkpoint changes.
//!
//! Optional inputs are `Option<T>` end to end and bind as SQL NULL.

use crate::core::db::{Database, json_column, with_savepoint, with_transaction};
use crate::core::error::{Result, StoreError};
use crate::core::fts::{self, FtsManager, FtsOp, TASKS_FTS};
use crate::core::time;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

pub const MAX_TASK_TAGS: usize = 15;
pub const DEFAULT_TASK_TYPE: &str = "feature";
pub const DEFAULT_CONFIDENCE: f64 = 0.3;
const MAX_TITLE_LEN: usize = 80;
/// Candidates scanned per similarity lookup, newest first.
const SIMILARITY_SCAN_LIMIT: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    Architect,
    Builder,
    Validator,
    Reviewer,
    Documenter,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Architect,
        Phase::Builder,
        Phase::Validator,
        Phase::Reviewer,
        Phase::Documenter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Architect => "ARCHITECT",
            Phase::Builder => "BUILDER",
            Phase::Validator => "VALIDATOR",
            Phase::Reviewer => "REVIEWER",
            Phase::Documenter => "DOCUMENTER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// Next phase in the lifecycle, `None` after DOCUMENTER.
    pub fn next(&self) -> Option<Self> {
        let idx = Self::ALL.iter().position(|p| p == self)?;
        Self::ALL.get(idx + 1).copied()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for Phase {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Phase {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Phase::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown phase '{}'", s).into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Some(TaskStatus::Active),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "blocked" => Some(TaskStatus::Blocked),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for TaskStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TaskStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        TaskStatus::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown task status '{}'", s).into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    Success,
    Partial,
    Failure,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Success => "success",
            TaskOutcome::Partial => "partial",
            TaskOutcome::Failure => "failure",
        }
    }

    fn final_status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Failure => TaskStatus::Failed,
            _ => TaskStatus::Completed,
        }
    }
}

/// Structured brief. Every field is an ordered list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskBrief {
    pub objectives: Vec<String>,
    pub constraints: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    pub plan: Vec<String>,
    pub facts: Vec<String>,
    pub snippets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseHandoff {
    pub phase: Phase,
    pub handoff: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub intent: String,
    /// Defaults to the intent, shortened.
    pub title: Option<String>,
    pub identifier: Option<String>,
    pub task_type: Option<String>,
    pub tags: Vec<String>,
    pub brief: TaskBrief,
    pub confidence: Option<f64>,
}

impl NewTask {
    pub fn new(intent: &str) -> Self {
        Self {
            intent: intent.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: String,
    pub identifier: Option<String>,
    pub title: String,
    pub intent: String,
    pub task_type: String,
    pub status: TaskStatus,
    pub phase: Phase,
    pub confidence: f64,
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub brief: TaskBrief,
    pub phase_handoffs: Vec<PhaseHandoff>,
    pub outcome: Option<String>,
    pub key_learning: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evidence {
    pub id: i64,
    pub task_id: String,
    pub kind: String,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checkpoint {
    pub id: i64,
    pub task_id: String,
    pub phase: Phase,
    pub message: String,
    pub confidence: Option<f64>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    /// Match tasks carrying any of these tags.
    pub tags: Vec<String>,
    pub phase: Option<Phase>,
    pub task_type: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarTask {
    pub task: Task,
    pub similarity: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskStats {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub by_phase: BTreeMap<String, i64>,
    pub average_confidence: f64,
}

const TASK_SELECT: &str = "SELECT t.id, t.identifier, t.title, t.intent, t.task_type, t.status, t.phase,
        t.confidence, t.tags, t.objectives, t.constraints, t.acceptance_criteria, t.plan,
        t.facts, t.snippets, t.phase_handoffs, t.outcome, t.key_learning,
        t.created_at, t.updated_at, t.completed_at
    FROM tasks t";

fn json_list<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<T>> {
    Ok(json_column(row, idx)?.unwrap_or_default())
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        identifier: row.get(1)?,
        title: row.get(2)?,
        intent: row.get(3)?,
        task_type: row.get(4)?,
        status: row.get(5)?,
        phase: row.get(6)?,
        confidence: row.get(7)?,
        tags: json_list(row, 8)?,
        brief: TaskBrief {
            objectives: json_list(row, 9)?,
            constraints: json_list(row, 10)?,
            acceptance_criteria: json_list(row, 11)?,
            plan: json_list(row, 12)?,
            facts: json_list(row, 13)?,
            snippets: json_list(row, 14)?,
        },
        phase_handoffs: json_list(row, 15)?,
        outcome: row.get(16)?,
        key_learning: row.get(17)?,
        created_at: row.get(18)?,
        updated_at: row.get(19)?,
        completed_at: row.get(20)?,
    })
}

pub struct TaskRepository {
    db: Arc<Database>,
    fts: FtsManager,
}

impl TaskRepository {
    pub fn new(db: Arc<Database>) -> Self {
        let fts = FtsManager::for_capabilities(db.capabilities());
        Self { db, fts }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn create(&self, new: NewTask) -> Result<Task> {
        let intent = new.intent.trim().to_string();
        if intent.is_empty() {
            return Err(StoreError::ValidationError(
                "task intent must not be empty".to_string(),
            ));
        }
        let tags = normalize_tags(&new.tags);
        if tags.len() > MAX_TASK_TAGS {
            return Err(StoreError::ValidationError(format!(
                "a task may carry at most {} tags, got {}",
                MAX_TASK_TAGS,
                tags.len()
            )));
        }
        let confidence = new.confidence.unwrap_or(DEFAULT_CONFIDENCE);
        validate_confidence(confidence)?;

        let title = match new.title.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => shorten(&intent, MAX_TITLE_LEN),
        };
        let identifier = new
            .identifier
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let task_type = new
            .task_type
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_TASK_TYPE)
            .to_string();

        let id = time::new_ulid();
        let tags_json = serde_json::to_string(&tags)?;
        let brief = &new.brief;
        let now = time::now_epoch_z();

        self.db.with_conn(|conn| {
            with_transaction(conn, |conn| {
                with_savepoint(conn, "task_create", |conn| {
                    conn.execute(
                        "INSERT INTO tasks(id, identifier, title, intent, task_type, status, phase,
                            confidence, tags, objectives, constraints, acceptance_criteria, plan,
                            facts, snippets, phase_handoffs, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                            '[]', ?16, ?16)",
                        params![
                            id,
                            identifier,
                            title,
                            intent,
                            task_type,
                            TaskStatus::Active,
                            Phase::Architect,
                            confidence,
                            tags_json,
                            serde_json::to_string(&brief.objectives)?,
                            serde_json::to_string(&brief.constraints)?,
                            serde_json::to_string(&brief.acceptance_criteria)?,
                            serde_json::to_string(&brief.plan)?,
                            serde_json::to_string(&brief.facts)?,
                            serde_json::to_string(&brief.snippets)?,
                            now
                        ],
                    )?;
                    self.fts.sync_fts(
                        conn,
                        &TASKS_FTS,
                        &id,
                        &[&title, &intent, &tags_json],
                        FtsOp::Insert,
                    )?;
                    Ok(())
                })
            })?;
            debug!(id = %id, "created task");
            require_task(conn, &id)
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<Task>> {
        self.db.with_conn(|conn| get_task(conn, id))
    }

    pub fn find(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut sql = String::from(TASK_SELECT);
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(status) = filter.status {
            clauses.push("t.status = ?".to_string());
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(phase) = filter.phase {
            clauses.push("t.phase = ?".to_string());
            values.push(Value::Text(phase.as_str().to_string()));
        }
        if let Some(task_type) = &filter.task_type {
            clauses.push("t.task_type = ?".to_string());
            values.push(Value::Text(task_type.clone()));
        }
        if !filter.tags.is_empty() {
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM json_each(t.tags) WHERE json_each.value IN ({}))",
                vec!["?"; filter.tags.len()].join(", ")
            ));
            values.extend(filter.tags.iter().map(|t| Value::Text(t.clone())));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY t.created_at DESC, t.id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(limit as i64));
        }
        self.db.all(&sql, params_from_iter(values), row_to_task)
    }

    /// Full-text search over title, intent and tags, best match first.
    pub fn search(&self, text: &str, limit: usize) -> Result<Vec<Task>> {
        let Some(expr) = fts::match_query(text) else {
            return Ok(Vec::new());
        };
        self.db.all(
            &format!(
                "{} JOIN (SELECT id, rank FROM tasks_fts WHERE tasks_fts MATCH ?1) f ON f.id = t.id
                 ORDER BY f.rank, t.created_at DESC LIMIT ?2",
                TASK_SELECT
            ),
            params![expr, limit as i64],
            row_to_task,
        )
    }

    pub fn update_brief(&self, id: &str, brief: &TaskBrief) -> Result<Task> {
        self.db.with_conn(|conn| {
            require_mutable(conn, id)?;
            conn.execute(
                "UPDATE tasks SET objectives = ?1, constraints = ?2, acceptance_criteria = ?3,
                    plan = ?4, facts = ?5, snippets = ?6, updated_at = ?7
                 WHERE id = ?8",
                params![
                    serde_json::to_string(&brief.objectives)?,
                    serde_json::to_string(&brief.constraints)?,
                    serde_json::to_string(&brief.acceptance_criteria)?,
                    serde_json::to_string(&brief.plan)?,
                    serde_json::to_string(&brief.facts)?,
                    serde_json::to_string(&brief.snippets)?,
                    time::now_epoch_z(),
                    id
                ],
            )?;
            require_task(conn, id)
        })
    }

    pub fn set_confidence(&self, id: &str, confidence: f64) -> Result<Task> {
        validate_confidence(confidence)?;
        self.db.with_conn(|conn| {
            require_mutable(conn, id)?;
            conn.execute(
                "UPDATE tasks SET confidence = ?1, updated_at = ?2 WHERE id = ?3",
                params![confidence, time::now_epoch_z(), id],
            )?;
            require_task(conn, id)
        })
    }

    /// Move to `phase`, appending a handoff entry. Earlier entries, including
    /// ones for the same phase, are kept.
    pub fn transition_phase(&self, id: &str, phase: Phase, handoff: &str) -> Result<Task> {
        let now = time::now_epoch_z();
        let entry = serde_json::to_string(&PhaseHandoff {
            phase,
            handoff: handoff.to_string(),
            timestamp: now.clone(),
        })?;
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE tasks SET
                    phase = ?1,
                    phase_handoffs = json_insert(COALESCE(phase_handoffs, '[]'), '$[#]', json(?2)),
                    updated_at = ?3
                 WHERE id = ?4 AND status NOT IN ('completed', 'failed')",
                params![phase, entry, now, id],
            )?;
            if changed == 0 {
                require_mutable(conn, id)?;
            }
            debug!(id, phase = %phase, "phase transition");
            require_task(conn, id)
        })
    }

    pub fn append_evidence(
        &self,
        id: &str,
        kind: &str,
        content: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<Evidence> {
        let metadata_json = metadata.map(serde_json::to_string).transpose()?;
        self.db.with_conn(|conn| {
            require_exists(conn, id)?;
            let now = time::now_epoch_z();
            conn.execute(
                "INSERT INTO task_evidence(task_id, kind, content, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, kind, content, metadata_json, now],
            )?;
            Ok(Evidence {
                id: conn.last_insert_rowid(),
                task_id: id.to_string(),
                kind: kind.to_string(),
                content: content.to_string(),
                metadata: metadata.cloned(),
                created_at: now,
            })
        })
    }

    pub fn evidence(&self, id: &str) -> Result<Vec<Evidence>> {
        self.db.all(
            "SELECT id, task_id, kind, content, metadata, created_at
             FROM task_evidence WHERE task_id = ?1 ORDER BY id",
            [id],
            |row| {
                Ok(Evidence {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    kind: row.get(2)?,
                    content: row.get(3)?,
                    metadata: json_column(row, 4)?,
                    created_at: row.get(5)?,
                })
            },
        )
    }

    /// Record a checkpoint at the task's current phase. A supplied confidence
    /// also becomes the task's confidence.
    pub fn add_checkpoint(
        &self,
        id: &str,
        message: &str,
        confidence: Option<f64>,
    ) -> Result<Checkpoint> {
        if let Some(c) = confidence {
            validate_confidence(c)?;
        }
        self.db.with_conn(|conn| {
            with_transaction(conn, |conn| {
                let task = require_mutable(conn, id)?;
                let now = time::now_epoch_z();
                conn.execute(
                    "INSERT INTO task_checkpoints(task_id, phase, message, confidence, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id, task.phase, message, confidence, now],
                )?;
                let checkpoint_id = conn.last_insert_rowid();
                if let Some(c) = confidence {
                    conn.execute(
                        "UPDATE tasks SET confidence = ?1, updated_at = ?2 WHERE id = ?3",
                        params![c, now, id],
                    )?;
                }
                Ok(Checkpoint {
                    id: checkpoint_id,
                    task_id: id.to_string(),
                    phase: task.phase,
                    message: message.to_string(),
                    confidence,
                    created_at: now,
                })
            })
        })
    }

    pub fn checkpoints(&self, id: &str) -> Result<Vec<Checkpoint>> {
        self.db.all(
            "SELECT id, task_id, phase, message, confidence, created_at
             FROM task_checkpoints WHERE task_id = ?1 ORDER BY id",
            [id],
            |row| {
                Ok(Checkpoint {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    phase: row.get(2)?,
                    message: row.get(3)?,
                    confidence: row.get(4)?,
                    created_at: row.get(5)?,
                })
            },
        )
    }

    /// Toggle between active and blocked. Terminal states go through
    /// [`TaskRepository::complete`].
    pub fn set_status(&self, id: &str, status: TaskStatus) -> Result<Task> {
        if status.is_terminal() {
            return Err(StoreError::ValidationError(format!(
                "use complete() to move task {} to {}",
                id, status
            )));
        }
        self.db.with_conn(|conn| {
            require_mutable(conn, id)?;
            conn.execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status, time::now_epoch_z(), id],
            )?;
            require_task(conn, id)
        })
    }

    pub fn complete(
        &self,
        id: &str,
        outcome: TaskOutcome,
        key_learning: Option<&str>,
    ) -> Result<Task> {
        self.db.with_conn(|conn| {
            require_mutable(conn, id)?;
            let now = time::now_epoch_z();
            conn.execute(
                "UPDATE tasks SET status = ?1, outcome = ?2, key_learning = ?3,
                    completed_at = ?4, updated_at = ?4
                 WHERE id = ?5",
                params![outcome.final_status(), outcome.as_str(), key_learning, now, id],
            )?;
            require_task(conn, id)
        })
    }

    /// Most similar other tasks by Jaccard overlap of tags and title words.
    /// Scores are cached once per unordered pair.
    pub fn find_similar(&self, id: &str, limit: usize) -> Result<Vec<SimilarTask>> {
        self.db.with_conn(|conn| {
            let target = require_task(conn, id)?;
            let target_tokens = similarity_tokens(&target);

            let candidates: Vec<Task> = {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE t.id <> ?1 ORDER BY t.created_at DESC, t.id DESC LIMIT ?2",
                    TASK_SELECT
                ))?;
                let rows = stmt.query_map(params![id, SIMILARITY_SCAN_LIMIT], row_to_task)?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                out
            };

            let scored = with_transaction(conn, |conn| {
                let mut scored = Vec::new();
                let mut computed = 0usize;
                for candidate in candidates {
                    let (a, b) = ordered_pair(id, &candidate.id);
                    let cached: Option<f64> = conn
                        .query_row(
                            "SELECT similarity FROM task_similarity WHERE task_a = ?1 AND task_b = ?2",
                            [a, b],
                            |row| row.get(0),
                        )
                        .optional()?;
                    let similarity = match cached {
                        Some(s) => s,
                        None => {
                            let s = jaccard(&target_tokens, &similarity_tokens(&candidate));
                            conn.execute(
                                "INSERT OR REPLACE INTO task_similarity(task_a, task_b, similarity, calculated_at)
                                 VALUES (?1, ?2, ?3, ?4)",
                                params![a, b, s, time::now_epoch_z()],
                            )?;
                            computed += 1;
                            s
                        }
                    };
                    if similarity > 0.0 {
                        scored.push(SimilarTask {
                            task: candidate,
                            similarity,
                        });
                    }
                }
                debug!(id, computed, "similarity lookup");
                Ok(scored)
            })?;

            let mut scored = scored;
            scored.sort_by(|x, y| {
                y.similarity
                    .total_cmp(&x.similarity)
                    .then_with(|| y.task.created_at.cmp(&x.task.created_at))
            });
            scored.truncate(limit);
            Ok(scored)
        })
    }

    pub fn statistics(&self) -> Result<TaskStats> {
        self.db.with_conn(|conn| {
            let mut stats = TaskStats::default();
            let (total, avg): (i64, f64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(AVG(confidence), 0.0) FROM tasks",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            stats.total = total;
            stats.average_confidence = avg;
            for (column, target) in [("status", &mut stats.by_status), ("phase", &mut stats.by_phase)] {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {0}, COUNT(*) FROM tasks GROUP BY {0} ORDER BY {0}",
                    column
                ))?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                for r in rows {
                    let (key, count) = r?;
                    target.insert(key, count);
                }
            }
            Ok(stats)
        })
    }
}

fn get_task(conn: &Connection, id: &str) -> Result<Option<Task>> {
    Ok(conn
        .query_row(&format!("{} WHERE t.id = ?1", TASK_SELECT), [id], row_to_task)
        .optional()?)
}

fn require_task(conn: &Connection, id: &str) -> Result<Task> {
    get_task(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("task {}", id)))
}

fn require_exists(conn: &Connection, id: &str) -> Result<()> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM tasks WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    found
        .map(|_| ())
        .ok_or_else(|| StoreError::NotFound(format!("task {}", id)))
}

fn require_mutable(conn: &Connection, id: &str) -> Result<Task> {
    let task = require_task(conn, id)?;
    if task.status.is_terminal() {
        return Err(StoreError::ValidationError(format!(
            "task {} is {} and can no longer change",
            id, task.status
        )));
    }
    Ok(task)
}

fn validate_confidence(confidence: f64) -> Result<()> {
    if (0.0..=1.0).contains(&confidence) {
        Ok(())
    } else {
        Err(StoreError::ValidationError(format!(
            "confidence must be within [0, 1], got {}",
            confidence
        )))
    }
}

fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut seen = FxHashSet::default();
    tags.iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.to_string()))
        .map(str::to_string)
        .collect()
}

fn shorten(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", cut.trim_end())
}

/// Pair key with the smaller id first.
pub fn ordered_pair<'a>(x: &'a str, y: &'a str) -> (&'a str, &'a str) {
    if x < y { (x, y) } else { (y, x) }
}

fn similarity_tokens(task: &Task) -> FxHashSet<String> {
    let mut tokens: FxHashSet<String> = task
        .tags
        .iter()
        .map(|t| format!("tag:{}", t.to_lowercase()))
        .collect();
    tokens.extend(
        task.title
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.chars().count() >= 3)
            .map(|w| w.to_lowercase()),
    );
    tokens
}

pub fn jaccard(a: &FxHashSet<String>, b: &FxHashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}
