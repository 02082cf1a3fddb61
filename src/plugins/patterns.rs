//! Pattern repository: reusable code and process insights with Bayesian trust.
//!
//! Each pattern carries Beta(alpha, beta) parameters and `trust_score` is
//! always written as `alpha / (alpha + beta)` in the same statement that
//! changes either parameter. Patterns are never hard-deleted; they are marked
//! invalid or quarantined instead.
//!
//! Inserts are idempotent on the pattern id: a second insert of an existing id
//! returns the stored row, including when the two inserts race from separate
//! connections.

use crate::core::db::{Database, json_column, with_savepoint, with_transaction};
use crate::core::error::{Result, StoreError};
use crate::core::fts::{FtsManager, FtsOp, PATTERNS_FTS};
use crate::core::time;
use regex::Regex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Bound on alias retries when concurrent writers keep claiming the slug.
const MAX_ALIAS_ATTEMPTS: usize = 8;
const MAX_ALIAS_LEN: usize = 64;
/// Busy errors that outlast the connection's busy timeout get a few more
/// tries with doubling delay.
const MAX_BUSY_RETRIES: u32 = 5;
const BUSY_BACKOFF: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PatternType {
    Codebase,
    Lang,
    Anti,
    Failure,
    Policy,
    Test,
    Migration,
}

impl PatternType {
    pub const ALL: [PatternType; 7] = [
        PatternType::Codebase,
        PatternType::Lang,
        PatternType::Anti,
        PatternType::Failure,
        PatternType::Policy,
        PatternType::Test,
        PatternType::Migration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::Codebase => "CODEBASE",
            PatternType::Lang => "LANG",
            PatternType::Anti => "ANTI",
            PatternType::Failure => "FAILURE",
            PatternType::Policy => "POLICY",
            PatternType::Test => "TEST",
            PatternType::Migration => "MIGRATION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for PatternType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for PatternType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        PatternType::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown pattern type '{}'", s).into()))
    }
}

/// Kind segment of internally generated ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Pat,
    Anti,
}

impl IdKind {
    fn as_str(&self) -> &'static str {
        match self {
            IdKind::Pat => "PAT",
            IdKind::Anti => "ANTI",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPattern {
    /// Namespaced id; generated as `SYSTEM:{PAT|ANTI}:AUTO:<token>` when absent.
    pub id: Option<String>,
    pub pattern_type: PatternType,
    pub title: String,
    pub summary: String,
    pub snippets: Vec<serde_json::Value>,
    pub evidence: Vec<serde_json::Value>,
    pub tags: Vec<String>,
    pub source_repo: Option<String>,
}

impl NewPattern {
    pub fn new(pattern_type: PatternType, title: &str, summary: &str) -> Self {
        Self {
            id: None,
            pattern_type,
            title: title.to_string(),
            summary: summary.to_string(),
            snippets: Vec::new(),
            evidence: Vec::new(),
            tags: Vec::new(),
            source_repo: None,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_snippet(mut self, snippet: serde_json::Value) -> Self {
        self.snippets.push(snippet);
        self
    }

    pub fn with_evidence(mut self, evidence: serde_json::Value) -> Self {
        self.evidence.push(evidence);
        self
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Pattern {
    pub id: String,
    pub schema_version: String,
    pub pattern_version: String,
    pub pattern_type: PatternType,
    pub title: String,
    pub summary: String,
    pub trust_score: f64,
    pub alpha: f64,
    pub beta: f64,
    pub usage_count: i64,
    pub success_count: i64,
    pub tags: Vec<String>,
    pub alias: Option<String>,
    pub pattern_digest: String,
    pub json_canonical: String,
    pub source_repo: Option<String>,
    pub invalid: bool,
    pub invalid_reason: Option<String>,
    pub quarantine_reason: Option<String>,
    pub quarantine_date: Option<String>,
    pub quality_score: Option<f64>,
    pub quality_score_cached_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Pattern {
    pub fn is_quarantined(&self) -> bool {
        self.quarantine_reason.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InsertOutcome {
    pub id: String,
    pub alias: Option<String>,
    /// False when the id already existed and the stored row was returned.
    pub created: bool,
}

/// Fields to replace; `None` leaves the stored value alone.
#[derive(Debug, Clone, Default)]
pub struct PatternUpdate {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub tags: Option<Vec<String>>,
    pub snippets: Option<Vec<serde_json::Value>>,
    pub evidence: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone)]
pub struct PatternQuery {
    pub text: Option<String>,
    pub types: Vec<PatternType>,
    pub min_trust: Option<f64>,
    /// Match patterns carrying any of these tags.
    pub tags: Vec<String>,
    pub include_invalid: bool,
    pub include_quarantined: bool,
    pub limit: usize,
}

impl Default for PatternQuery {
    fn default() -> Self {
        Self {
            text: None,
            types: Vec::new(),
            min_trust: None,
            tags: Vec::new(),
            include_invalid: false,
            include_quarantined: false,
            limit: 50,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PatternStats {
    pub total: i64,
    pub valid: i64,
    pub quarantined: i64,
    pub average_trust: f64,
}

const PATTERN_SELECT: &str = "SELECT p.id, p.schema_version, p.pattern_version, p.type, p.title, p.summary,
        p.trust_score, p.alpha, p.beta, p.usage_count, p.success_count, p.tags, p.alias,
        p.pattern_digest, p.json_canonical, p.source_repo, p.invalid, p.invalid_reason,
        p.quarantine_reason, p.quarantine_date, p.quality_score, p.quality_score_cached_at,
        p.created_at, p.updated_at
    FROM patterns p";

fn row_to_pattern(row: &Row<'_>) -> rusqlite::Result<Pattern> {
    Ok(Pattern {
        id: row.get(0)?,
        schema_version: row.get(1)?,
        pattern_version: row.get(2)?,
        pattern_type: row.get(3)?,
        title: row.get(4)?,
        summary: row.get(5)?,
        trust_score: row.get(6)?,
        alpha: row.get(7)?,
        beta: row.get(8)?,
        usage_count: row.get(9)?,
        success_count: row.get(10)?,
        tags: json_column(row, 11)?.unwrap_or_default(),
        alias: row.get(12)?,
        pattern_digest: row.get(13)?,
        json_canonical: row.get(14)?,
        source_repo: row.get(15)?,
        invalid: row.get(16)?,
        invalid_reason: row.get(17)?,
        quarantine_reason: row.get(18)?,
        quarantine_date: row.get(19)?,
        quality_score: row.get(20)?,
        quality_score_cached_at: row.get(21)?,
        created_at: row.get(22)?,
        updated_at: row.get(23)?,
    })
}

pub struct PatternRepository {
    db: Arc<Database>,
    fts: FtsManager,
}

impl PatternRepository {
    pub fn new(db: Arc<Database>) -> Self {
        let fts = FtsManager::for_capabilities(db.capabilities());
        Self { db, fts }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn fts_strategy(&self) -> &'static str {
        self.fts.strategy_name()
    }

    /// Insert a pattern, or return the stored one if its id already exists.
    pub fn insert(&self, new: NewPattern) -> Result<InsertOutcome> {
        let title = new.title.trim().to_string();
        if title.is_empty() {
            return Err(StoreError::ValidationError(
                "pattern title must not be empty".to_string(),
            ));
        }
        let id = match &new.id {
            Some(id) => {
                validate_pattern_id(id)?;
                id.clone()
            }
            None => generate_id(if new.pattern_type == PatternType::Anti {
                IdKind::Anti
            } else {
                IdKind::Pat
            }),
        };
        let tags = normalize_tags(&new.tags);
        let tags_json = serde_json::to_string(&tags)?;
        let canonical = canonical_json(
            &id,
            new.pattern_type,
            &title,
            &new.summary,
            &new.snippets,
            &new.evidence,
        );
        let pattern_digest = digest(&canonical);
        let base_alias = slugify(&title);

        let mut attempt = 0;
        let mut busy_retries = 0;
        while attempt < MAX_ALIAS_ATTEMPTS {
            let result = self.db.with_conn(|conn| {
                with_transaction(conn, |conn| {
                    with_savepoint(conn, "pattern_insert", |conn| {
                        if let Some((existing_id, alias)) = find_existing(conn, &id)? {
                            return Ok(InsertOutcome {
                                id: existing_id,
                                alias,
                                created: false,
                            });
                        }
                        let alias = next_free_alias(conn, &base_alias)?;
                        let now = time::now_epoch_z();
                        conn.execute(
                            "INSERT INTO patterns(id, type, title, summary, trust_score, alpha, beta,
                                created_at, updated_at, source_repo, tags, pattern_digest,
                                json_canonical, alias)
                             VALUES (?1, ?2, ?3, ?4, 0.5, 1.0, 1.0, ?5, ?5, ?6, ?7, ?8, ?9, ?10)",
                            params![
                                id,
                                new.pattern_type,
                                title,
                                new.summary,
                                now,
                                new.source_repo,
                                tags_json,
                                pattern_digest,
                                canonical,
                                alias
                            ],
                        )?;
                        self.fts.sync_fts(
                            conn,
                            &PATTERNS_FTS,
                            &id,
                            &[&title, &new.summary, &tags_json],
                            FtsOp::Insert,
                        )?;
                        Ok(InsertOutcome {
                            id: id.clone(),
                            alias: Some(alias),
                            created: true,
                        })
                    })
                })
            });

            match result {
                Ok(outcome) => {
                    if outcome.created {
                        debug!(id = %outcome.id, alias = ?outcome.alias, "inserted pattern");
                    } else {
                        debug!(id = %outcome.id, "pattern already present, insert is a no-op");
                    }
                    return Ok(outcome);
                }
                Err(e) if e.is_unique_violation() => {
                    if let Some((existing_id, alias)) =
                        self.db.with_conn(|conn| find_existing(conn, &id))?
                    {
                        info!(id = %existing_id, "concurrent insert won, returning stored pattern");
                        return Ok(InsertOutcome {
                            id: existing_id,
                            alias,
                            created: false,
                        });
                    }
                    debug!(attempt, alias = %base_alias, "alias claimed concurrently, retrying");
                    attempt += 1;
                }
                Err(e) if e.is_busy() && busy_retries < MAX_BUSY_RETRIES => {
                    let delay = BUSY_BACKOFF * 2u32.pow(busy_retries);
                    busy_retries += 1;
                    debug!(id = %id, ?delay, busy_retries, "database busy, retrying insert");
                    thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::ValidationError(format!(
            "could not allocate a unique alias for '{}' after {} attempts",
            base_alias, MAX_ALIAS_ATTEMPTS
        )))
    }

    pub fn get(&self, id: &str) -> Result<Option<Pattern>> {
        self.db.with_conn(|conn| get_pattern(conn, id))
    }

    pub fn get_by_alias(&self, alias: &str) -> Result<Option<Pattern>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("{} WHERE p.alias = ?1", PATTERN_SELECT),
                    [alias],
                    row_to_pattern,
                )
                .optional()?)
        })
    }

    pub fn update(&self, id: &str, update: PatternUpdate) -> Result<Pattern> {
        self.db.with_conn(|conn| {
            with_transaction(conn, |conn| {
                with_savepoint(conn, "pattern_update", |conn| {
                    let current = get_pattern(conn, id)?
                        .ok_or_else(|| StoreError::NotFound(format!("pattern {}", id)))?;
                    let stored: serde_json::Value = serde_json::from_str(&current.json_canonical)?;
                    let title = match update.title {
                        Some(t) if t.trim().is_empty() => {
                            return Err(StoreError::ValidationError(
                                "pattern title must not be empty".to_string(),
                            ));
                        }
                        Some(t) => t.trim().to_string(),
                        None => current.title.clone(),
                    };
                    let summary = update.summary.unwrap_or_else(|| current.summary.clone());
                    let tags = update
                        .tags
                        .map(|t| normalize_tags(&t))
                        .unwrap_or_else(|| current.tags.clone());
                    let snippets = update
                        .snippets
                        .unwrap_or_else(|| json_array(&stored, "snippets"));
                    let evidence = update
                        .evidence
                        .unwrap_or_else(|| json_array(&stored, "evidence"));

                    let tags_json = serde_json::to_string(&tags)?;
                    let canonical = canonical_json(
                        id,
                        current.pattern_type,
                        &title,
                        &summary,
                        &snippets,
                        &evidence,
                    );
                    conn.execute(
                        "UPDATE patterns SET title = ?1, summary = ?2, tags = ?3,
                            json_canonical = ?4, pattern_digest = ?5, updated_at = ?6
                         WHERE id = ?7",
                        params![
                            title,
                            summary,
                            tags_json,
                            canonical,
                            digest(&canonical),
                            time::now_epoch_z(),
                            id
                        ],
                    )?;
                    self.fts.sync_fts(
                        conn,
                        &PATTERNS_FTS,
                        id,
                        &[&title, &summary, &tags_json],
                        FtsOp::Update,
                    )?;
                    get_pattern(conn, id)?
                        .ok_or_else(|| StoreError::NotFound(format!("pattern {}", id)))
                })
            })
        })
    }

    /// Soft delete: the row stays for audit but is excluded from searches.
    pub fn mark_invalid(&self, id: &str, reason: &str) -> Result<()> {
        let changed = self.db.run(
            "UPDATE patterns SET invalid = 1, invalid_reason = ?1, updated_at = ?2 WHERE id = ?3",
            params![reason, time::now_epoch_z(), id],
        )?;
        require_changed(changed, id)
    }

    /// Set the Beta parameters; trust is recomputed as `alpha / (alpha + beta)`.
    pub fn update_trust_score(&self, id: &str, alpha: f64, beta: f64) -> Result<Pattern> {
        if !(alpha.is_finite() && beta.is_finite() && alpha > 0.0 && beta > 0.0) {
            return Err(StoreError::ValidationError(format!(
                "alpha and beta must be positive, got alpha={} beta={}",
                alpha, beta
            )));
        }
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE patterns SET alpha = ?1, beta = ?2, trust_score = ?1 / (?1 + ?2),
                    updated_at = ?3
                 WHERE id = ?4",
                params![alpha, beta, time::now_epoch_z(), id],
            )?;
            require_changed(changed, id)?;
            get_pattern(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("pattern {}", id)))
        })
    }

    /// Count one use: success increments alpha, failure increments beta.
    pub fn record_outcome(&self, id: &str, success: bool) -> Result<Pattern> {
        let (d_alpha, d_beta) = if success { (1.0, 0.0) } else { (0.0, 1.0) };
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE patterns SET
                    alpha = alpha + ?1,
                    beta = beta + ?2,
                    trust_score = (alpha + ?1) / (alpha + beta + ?1 + ?2),
                    usage_count = usage_count + 1,
                    success_count = success_count + ?3,
                    updated_at = ?4
                 WHERE id = ?5",
                params![d_alpha, d_beta, success as i64, time::now_epoch_z(), id],
            )?;
            require_changed(changed, id)?;
            get_pattern(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("pattern {}", id)))
        })
    }

    pub fn quarantine(&self, id: &str, reason: &str) -> Result<()> {
        if reason.trim().is_empty() {
            return Err(StoreError::ValidationError(
                "quarantine reason must not be empty".to_string(),
            ));
        }
        let now = time::now_epoch_z();
        let changed = self.db.run(
            "UPDATE patterns SET quarantine_reason = ?1, quarantine_date = ?2, updated_at = ?2
             WHERE id = ?3",
            params![reason, now, id],
        )?;
        require_changed(changed, id)?;
        info!(id, reason, "pattern quarantined");
        Ok(())
    }

    pub fn release_quarantine(&self, id: &str) -> Result<()> {
        let changed = self.db.run(
            "UPDATE patterns SET quarantine_reason = NULL, quarantine_date = NULL, updated_at = ?1
             WHERE id = ?2",
            params![time::now_epoch_z(), id],
        )?;
        require_changed(changed, id)
    }

    pub fn cache_quality_score(&self, id: &str, score: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&score) {
            return Err(StoreError::ValidationError(format!(
                "quality score must be within [0, 1], got {}",
                score
            )));
        }
        let changed = self.db.run(
            "UPDATE patterns SET quality_score = ?1, quality_score_cached_at = ?2 WHERE id = ?3",
            params![score, time::now_epoch_z(), id],
        )?;
        require_changed(changed, id)
    }

    pub fn search(&self, query: &PatternQuery) -> Result<Vec<Pattern>> {
        let mut sql = String::from(PATTERN_SELECT);
        let mut values: Vec<Value> = Vec::new();
        let mut order = String::from(" ORDER BY p.trust_score DESC, p.id");

        if let Some(expr) = query.text.as_deref().and_then(crate::core::fts::match_query) {
            sql.push_str(
                " JOIN (SELECT id, rank FROM patterns_fts WHERE patterns_fts MATCH ?) f ON f.id = p.id",
            );
            values.push(Value::Text(expr));
            order = String::from(" ORDER BY f.rank, p.trust_score DESC, p.id");
        } else if query.text.as_deref().is_some_and(|t| !t.trim().is_empty()) {
            return Ok(Vec::new());
        }

        let mut clauses: Vec<String> = Vec::new();
        if !query.include_invalid {
            clauses.push("p.invalid = 0".to_string());
        }
        if !query.include_quarantined {
            clauses.push("p.quarantine_reason IS NULL".to_string());
        }
        if !query.types.is_empty() {
            clauses.push(format!("p.type IN ({})", placeholders(query.types.len())));
            values.extend(query.types.iter().map(|t| Value::Text(t.as_str().to_string())));
        }
        if let Some(min) = query.min_trust {
            clauses.push("p.trust_score >= ?".to_string());
            values.push(Value::Real(min));
        }
        if !query.tags.is_empty() {
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM json_each(p.tags) WHERE json_each.value IN ({}))",
                placeholders(query.tags.len())
            ));
            values.extend(query.tags.iter().map(|t| Value::Text(t.clone())));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&order);
        sql.push_str(" LIMIT ?");
        values.push(Value::Integer(query.limit as i64));

        self.db.all(&sql, params_from_iter(values), row_to_pattern)
    }

    /// Highest-trust valid, unquarantined patterns.
    pub fn list_top(&self, limit: usize) -> Result<Vec<Pattern>> {
        self.search(&PatternQuery {
            limit,
            ..PatternQuery::default()
        })
    }

    pub fn stats(&self) -> Result<PatternStats> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN invalid = 0 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN quarantine_reason IS NOT NULL THEN 1 ELSE 0 END), 0),
                        COALESCE(AVG(CASE WHEN invalid = 0 THEN trust_score END), 0.0)
                 FROM patterns",
                [],
                |row| {
                    Ok(PatternStats {
                        total: row.get(0)?,
                        valid: row.get(1)?,
                        quarantined: row.get(2)?,
                        average_trust: row.get(3)?,
                    })
                },
            )?)
        })
    }
}

fn get_pattern(conn: &Connection, id: &str) -> Result<Option<Pattern>> {
    Ok(conn
        .query_row(
            &format!("{} WHERE p.id = ?1", PATTERN_SELECT),
            [id],
            row_to_pattern,
        )
        .optional()?)
}

fn find_existing(conn: &Connection, id: &str) -> Result<Option<(String, Option<String>)>> {
    Ok(conn
        .query_row(
            "SELECT id, alias FROM patterns WHERE id = ?1",
            [id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?)
}

fn next_free_alias(conn: &Connection, base: &str) -> Result<String> {
    let mut stmt =
        conn.prepare("SELECT alias FROM patterns WHERE alias = ?1 OR alias LIKE ?2")?;
    let rows = stmt.query_map(params![base, format!("{}-%", base)], |row| {
        row.get::<_, String>(0)
    })?;
    let mut taken = rustc_hash::FxHashSet::default();
    for r in rows {
        taken.insert(r?);
    }
    Ok(unique_alias(base, |candidate| taken.contains(candidate)))
}

fn require_changed(changed: usize, id: &str) -> Result<()> {
    if changed == 0 {
        Err(StoreError::NotFound(format!("pattern {}", id)))
    } else {
        Ok(())
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn json_array(value: &serde_json::Value, key: &str) -> Vec<serde_json::Value> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}

/// Trimmed, non-empty, first occurrence wins.
fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut seen = rustc_hash::FxHashSet::default();
    tags.iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.to_string()))
        .map(str::to_string)
        .collect()
}

fn pattern_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_-]+(?:\.[A-Za-z0-9_-]+)*:[A-Z]+:[A-Za-z0-9_.-]+:[A-Za-z0-9_.-]+$")
            .expect("static regex")
    })
}

const SLUG_SEPARATORS: &str = r"[^a-z0-9]+";

fn slug_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(SLUG_SEPARATORS).expect("static regex"))
}

/// The rules [`slugify`] applies, as text. The alias backfill hashes this
/// into its checksum.
pub fn alias_rules() -> String {
    format!("separators={} max_len={}", SLUG_SEPARATORS, MAX_ALIAS_LEN)
}

/// Accepts `ORG.TEAM:TYPE:CATEGORY:NAME`.
pub fn validate_pattern_id(id: &str) -> Result<()> {
    if pattern_id_regex().is_match(id) {
        Ok(())
    } else {
        Err(StoreError::ValidationError(format!(
            "invalid pattern id '{}': expected ORG.TEAM:TYPE:CATEGORY:NAME",
            id
        )))
    }
}

pub fn generate_id(kind: IdKind) -> String {
    format!("SYSTEM:{}:AUTO:{}", kind.as_str(), time::random_token(8))
}

/// Deterministic JSON of the pattern's semantic content (sorted keys).
pub fn canonical_json(
    id: &str,
    pattern_type: PatternType,
    title: &str,
    summary: &str,
    snippets: &[serde_json::Value],
    evidence: &[serde_json::Value],
) -> String {
    serde_json::json!({
        "id": id,
        "type": pattern_type.as_str(),
        "title": title,
        "summary": summary,
        "snippets": snippets,
        "evidence": evidence,
    })
    .to_string()
}

pub fn digest(canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Lowercase, hyphen-separated ASCII slug of `title`.
pub fn slugify(title: &str) -> String {
    let lowered = title.to_lowercase();
    let slug = slug_regex().replace_all(&lowered, "-");
    let mut slug = slug.trim_matches('-').to_string();
    if slug.len() > MAX_ALIAS_LEN {
        slug.truncate(MAX_ALIAS_LEN);
        slug = slug.trim_end_matches('-').to_string();
    }
    if slug.is_empty() {
        "pattern".to_string()
    } else {
        slug
    }
}

/// `base`, or `base-2`, `base-3`, ... whichever `taken` first rejects.
pub fn unique_alias<F>(base: &str, taken: F) -> String
where
    F: Fn(&str) -> bool,
{
    if !taken(base) {
        return base.to_string();
    }
    (2u64..)
        .map(|n| format!("{}-{}", base, n))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| format!("{}-{}", base, time::random_token(8)))
}
