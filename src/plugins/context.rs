//! Context packs: one size-bounded payload of active work, statistics,
//! relevant patterns and similar past tasks, ready for an agent prompt.
//!
//! Sections by priority, highest first: `active_tasks`, `statistics`,
//! `patterns`, `similar_tasks`. When the serialized pack exceeds its byte
//! ceiling, entries are dropped from the end of the lowest-priority non-empty
//! section until it fits, and `metadata` records what was dropped.

use crate::core::config::ContextConfig;
use crate::core::db::Database;
use crate::core::error::{Result, StoreError};
use crate::core::time;
use crate::plugins::patterns::{PatternQuery, PatternRepository, PatternStats, PatternType};
use crate::plugins::tasks::{
    Phase, PhaseHandoff, TaskFilter, TaskRepository, TaskStats, TaskStatus,
};
use moka::sync::Cache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tiktoken_rs::{CoreBPE, cl100k_base};
use tracing::{debug, info};

pub const SECTION_ACTIVE_TASKS: &str = "active_tasks";
pub const SECTION_STATISTICS: &str = "statistics";
pub const SECTION_PATTERNS: &str = "patterns";
pub const SECTION_SIMILAR_TASKS: &str = "similar_tasks";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextPackOptions {
    /// Task the pack is built around; enables similar-task lookup and
    /// tag-matched patterns.
    pub task_id: Option<String>,
    pub max_active_tasks: usize,
    pub max_similar: usize,
    pub max_patterns: usize,
    pub min_trust: f64,
    /// Byte ceiling; `None` uses the service default.
    pub max_size_bytes: Option<usize>,
}

impl Default for ContextPackOptions {
    fn default() -> Self {
        Self {
            task_id: None,
            max_active_tasks: 10,
            max_similar: 5,
            max_patterns: 10,
            min_trust: 0.0,
            max_size_bytes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub id: String,
    pub identifier: Option<String>,
    pub title: String,
    pub status: TaskStatus,
    pub phase: Phase,
    pub confidence: f64,
    pub tags: Vec<String>,
    pub last_handoff: Option<PhaseHandoff>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternSummary {
    pub id: String,
    pub alias: Option<String>,
    pub pattern_type: PatternType,
    pub title: String,
    pub summary: String,
    pub trust_score: f64,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarTaskSummary {
    pub id: String,
    pub title: String,
    pub similarity: f64,
    pub outcome: Option<String>,
    pub key_learning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackStatistics {
    pub tasks: TaskStats,
    pub patterns: PatternStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PackMetadata {
    pub truncated: bool,
    /// Entries dropped per section.
    pub dropped: BTreeMap<String, usize>,
    pub size_bytes: usize,
    pub estimated_tokens: usize,
    pub generated_at: String,
    pub generation_ms: u64,
    pub cache_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextPack {
    pub active_tasks: Vec<TaskSummary>,
    pub statistics: Option<PackStatistics>,
    pub patterns: Vec<PatternSummary>,
    pub similar_tasks: Vec<SimilarTaskSummary>,
    pub metadata: PackMetadata,
}

#[derive(Serialize)]
struct PackBody<'a> {
    active_tasks: &'a [TaskSummary],
    statistics: &'a Option<PackStatistics>,
    patterns: &'a [PatternSummary],
    similar_tasks: &'a [SimilarTaskSummary],
}

impl ContextPack {
    fn body_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&PackBody {
            active_tasks: &self.active_tasks,
            statistics: &self.statistics,
            patterns: &self.patterns,
            similar_tasks: &self.similar_tasks,
        })?)
    }

    /// Drop the last entry of the lowest-priority non-empty section.
    fn drop_one(&mut self) -> Option<&'static str> {
        let section = if self.similar_tasks.pop().is_some() {
            SECTION_SIMILAR_TASKS
        } else if self.patterns.pop().is_some() {
            SECTION_PATTERNS
        } else if self.statistics.take().is_some() {
            SECTION_STATISTICS
        } else if self.active_tasks.pop().is_some() {
            SECTION_ACTIVE_TASKS
        } else {
            return None;
        };
        *self.metadata.dropped.entry(section.to_string()).or_insert(0) += 1;
        self.metadata.truncated = true;
        Some(section)
    }

    /// Serialized size, written back into `metadata.size_bytes`. Iterates
    /// because the figure is part of what it measures.
    fn measure(&mut self) -> Result<usize> {
        for _ in 0..4 {
            let len = serde_json::to_vec(self)?.len();
            if len == self.metadata.size_bytes {
                break;
            }
            self.metadata.size_bytes = len;
        }
        Ok(self.metadata.size_bytes)
    }
}

pub struct ContextPackService {
    tasks: TaskRepository,
    patterns: PatternRepository,
    cache: Cache<String, Arc<ContextPack>>,
    default_max_size: usize,
}

impl ContextPackService {
    pub fn new(db: Arc<Database>, config: &ContextConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(Duration::from_secs(config.cache_ttl_secs))
            .build();
        Self {
            tasks: TaskRepository::new(Arc::clone(&db)),
            patterns: PatternRepository::new(db),
            cache,
            default_max_size: config.max_size_bytes,
        }
    }

    /// Build a pack, or return the cached one for identical options.
    pub fn get_context_pack(&self, options: &ContextPackOptions) -> Result<Arc<ContextPack>> {
        let resolved = ContextPackOptions {
            max_size_bytes: Some(options.max_size_bytes.unwrap_or(self.default_max_size)),
            ..options.clone()
        };
        let key = cache_key(&resolved)?;
        if let Some(pack) = self.cache.get(&key) {
            debug!(cache_key = %key, "context pack cache hit");
            return Ok(pack);
        }

        let pack = Arc::new(self.generate(&resolved, key.clone())?);
        self.cache.insert(key, Arc::clone(&pack));
        Ok(pack)
    }

    /// Drop every cached pack; the next request regenerates.
    pub fn invalidate_cache(&self) {
        self.cache.invalidate_all();
    }

    pub fn cached_entries(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    fn generate(&self, options: &ContextPackOptions, key: String) -> Result<ContextPack> {
        let started = Instant::now();
        let max_size = options.max_size_bytes.unwrap_or(self.default_max_size);

        let active_tasks = self
            .tasks
            .find(&TaskFilter {
                status: Some(TaskStatus::Active),
                limit: Some(options.max_active_tasks),
                ..TaskFilter::default()
            })?
            .into_iter()
            .map(|t| TaskSummary {
                last_handoff: t.phase_handoffs.last().cloned(),
                id: t.id,
                identifier: t.identifier,
                title: t.title,
                status: t.status,
                phase: t.phase,
                confidence: t.confidence,
                tags: t.tags,
            })
            .collect();

        let statistics = PackStatistics {
            tasks: self.tasks.statistics()?,
            patterns: self.patterns.stats()?,
        };

        let focus = match &options.task_id {
            Some(id) => Some(
                self.tasks
                    .get(id)?
                    .ok_or_else(|| StoreError::NotFound(format!("task {}", id)))?,
            ),
            None => None,
        };

        let mut patterns = Vec::new();
        if let Some(task) = focus.as_ref().filter(|t| !t.tags.is_empty()) {
            patterns = self.patterns.search(&PatternQuery {
                tags: task.tags.clone(),
                min_trust: Some(options.min_trust),
                limit: options.max_patterns,
                ..PatternQuery::default()
            })?;
        }
        if patterns.len() < options.max_patterns {
            let top = self.patterns.search(&PatternQuery {
                min_trust: Some(options.min_trust),
                limit: options.max_patterns,
                ..PatternQuery::default()
            })?;
            for p in top {
                if patterns.len() >= options.max_patterns {
                    break;
                }
                if !patterns.iter().any(|existing| existing.id == p.id) {
                    patterns.push(p);
                }
            }
        }
        let patterns = patterns
            .into_iter()
            .map(|p| PatternSummary {
                id: p.id,
                alias: p.alias,
                pattern_type: p.pattern_type,
                title: p.title,
                summary: p.summary,
                trust_score: p.trust_score,
                tags: p.tags,
            })
            .collect();

        let similar_tasks = match &focus {
            Some(task) if options.max_similar > 0 => self
                .tasks
                .find_similar(&task.id, options.max_similar)?
                .into_iter()
                .map(|s| SimilarTaskSummary {
                    id: s.task.id,
                    title: s.task.title,
                    similarity: s.similarity,
                    outcome: s.task.outcome,
                    key_learning: s.task.key_learning,
                })
                .collect(),
            _ => Vec::new(),
        };

        let mut pack = ContextPack {
            active_tasks,
            statistics: Some(statistics),
            patterns,
            similar_tasks,
            metadata: PackMetadata {
                generated_at: time::now_epoch_z(),
                cache_key: key,
                ..PackMetadata::default()
            },
        };

        loop {
            pack.metadata.estimated_tokens = estimate_tokens(&pack.body_json()?);
            pack.metadata.generation_ms = started.elapsed().as_millis() as u64;
            let size = pack.measure()?;
            if size <= max_size || pack.drop_one().is_none() {
                break;
            }
        }

        if pack.metadata.truncated {
            info!(
                dropped = ?pack.metadata.dropped,
                size_bytes = pack.metadata.size_bytes,
                max_size,
                "context pack truncated"
            );
        }
        debug!(
            size_bytes = pack.metadata.size_bytes,
            tokens = pack.metadata.estimated_tokens,
            elapsed_ms = pack.metadata.generation_ms,
            "generated context pack"
        );
        Ok(pack)
    }
}

/// sha256 over the serialized request options.
pub fn cache_key(options: &ContextPackOptions) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(options)?);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Token count under the cl100k encoding, or a bytes/4 estimate when the
/// encoder cannot be loaded.
pub fn estimate_tokens(text: &str) -> usize {
    static BPE: OnceLock<Option<CoreBPE>> = OnceLock::new();
    match BPE.get_or_init(|| cl100k_base().ok()) {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.len().div_ceil(4),
    }
}
