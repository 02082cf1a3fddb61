use patternstore::core::bootstrap::AutoMigrator;
use patternstore::core::config::{ContextConfig, StoreConfig};
use patternstore::core::db::{AdapterOptions, Database};
use patternstore::core::error::StoreError;
use patternstore::plugins::context::{
    ContextPackOptions, ContextPackService, SECTION_ACTIVE_TASKS, SECTION_SIMILAR_TASKS,
};
use patternstore::plugins::patterns::{NewPattern, PatternRepository, PatternType};
use patternstore::plugins::tasks::{NewTask, Phase, Task, TaskRepository};
use std::sync::Arc;

struct Fixture {
    tasks: TaskRepository,
    patterns: PatternRepository,
    service: ContextPackService,
    focus: Task,
}

fn fixture() -> Fixture {
    let db = Arc::new(Database::open_in_memory(&AdapterOptions::default()).expect("open"));
    AutoMigrator::new(&db, &StoreConfig::default())
        .auto_migrate()
        .expect("bootstrap");
    let tasks = TaskRepository::new(Arc::clone(&db));
    let patterns = PatternRepository::new(Arc::clone(&db));
    let service = ContextPackService::new(Arc::clone(&db), &ContextConfig::default());

    let focus = tasks
        .create(NewTask {
            tags: vec!["auth".into()],
            ..NewTask::new("Fix auth timeout")
        })
        .unwrap();
    tasks
        .transition_phase(&focus.id, Phase::Builder, "design agreed")
        .unwrap();
    tasks
        .create(NewTask {
            tags: vec!["auth".into()],
            ..NewTask::new("Auth timeout on login")
        })
        .unwrap();
    tasks.create(NewTask::new("Refresh billing docs")).unwrap();

    let auth = patterns
        .insert(
            NewPattern::new(
                PatternType::Codebase,
                "Refresh tokens early",
                "Renew session tokens before they expire",
            )
            .with_tags(["auth"]),
        )
        .unwrap();
    for (title, wins) in [("Retry with backoff", 4), ("Bound every queue", 2)] {
        let p = patterns
            .insert(NewPattern::new(PatternType::Codebase, title, "trusted practice"))
            .unwrap();
        for _ in 0..wins {
            patterns.record_outcome(&p.id, true).unwrap();
        }
    }
    assert_eq!(patterns.get(&auth.id).unwrap().unwrap().trust_score, 0.5);

    Fixture {
        tasks,
        patterns,
        service,
        focus,
    }
}

fn focused(f: &Fixture) -> ContextPackOptions {
    ContextPackOptions {
        task_id: Some(f.focus.id.clone()),
        ..ContextPackOptions::default()
    }
}

#[test]
fn pack_collects_every_section() {
    let f = fixture();
    let pack = f.service.get_context_pack(&focused(&f)).unwrap();

    assert_eq!(pack.active_tasks.len(), 3);
    let focus = pack
        .active_tasks
        .iter()
        .find(|t| t.id == f.focus.id)
        .unwrap();
    assert_eq!(focus.phase, Phase::Builder);
    assert_eq!(focus.last_handoff.as_ref().unwrap().handoff, "design agreed");

    let stats = pack.statistics.as_ref().unwrap();
    assert_eq!(stats.tasks.total, 3);
    assert_eq!(stats.patterns.total, 3);

    assert_eq!(pack.patterns.len(), 3);
    assert_eq!(pack.patterns[0].title, "Refresh tokens early", "tag matches lead");
    assert_eq!(pack.patterns[1].title, "Retry with backoff");

    assert_eq!(pack.similar_tasks.len(), 1);
    assert_eq!(pack.similar_tasks[0].title, "Auth timeout on login");

    assert!(!pack.metadata.truncated);
    assert!(pack.metadata.dropped.is_empty());
    assert_eq!(pack.metadata.size_bytes, serde_json::to_vec(&*pack).unwrap().len());
    assert!(pack.metadata.estimated_tokens > 0);
    assert_eq!(pack.metadata.cache_key.len(), 64);
}

#[test]
fn pattern_limit_and_trust_floor_apply() {
    let f = fixture();
    let pack = f
        .service
        .get_context_pack(&ContextPackOptions {
            max_patterns: 1,
            ..focused(&f)
        })
        .unwrap();
    assert_eq!(pack.patterns.len(), 1);
    assert_eq!(pack.patterns[0].title, "Refresh tokens early");

    let pack = f
        .service
        .get_context_pack(&ContextPackOptions {
            min_trust: 0.6,
            ..ContextPackOptions::default()
        })
        .unwrap();
    assert!(pack.patterns.iter().all(|p| p.trust_score >= 0.6));
    assert_eq!(pack.patterns.len(), 2);
    assert!(pack.similar_tasks.is_empty(), "no focus task, no similar tasks");
}

#[test]
fn oversized_pack_drops_lowest_priority_first() {
    let f = fixture();
    let full = f.service.get_context_pack(&focused(&f)).unwrap();
    let max = full.metadata.size_bytes - 1;

    let pack = f
        .service
        .get_context_pack(&ContextPackOptions {
            max_size_bytes: Some(max),
            ..focused(&f)
        })
        .unwrap();
    assert!(pack.metadata.truncated);
    assert_eq!(pack.metadata.dropped.len(), 1);
    assert_eq!(pack.metadata.dropped.get(SECTION_SIMILAR_TASKS), Some(&1));
    assert!(pack.similar_tasks.is_empty());
    assert_eq!(pack.patterns.len(), full.patterns.len());
    assert_eq!(pack.active_tasks.len(), full.active_tasks.len());

    let serialized = serde_json::to_vec(&*pack).unwrap().len();
    assert_eq!(pack.metadata.size_bytes, serialized);
    assert!(serialized <= max);
}

#[test]
fn impossible_ceiling_empties_every_section() {
    let f = fixture();
    let pack = f
        .service
        .get_context_pack(&ContextPackOptions {
            max_size_bytes: Some(1),
            ..focused(&f)
        })
        .unwrap();
    assert!(pack.metadata.truncated);
    assert!(pack.active_tasks.is_empty());
    assert!(pack.statistics.is_none());
    assert!(pack.patterns.is_empty());
    assert!(pack.similar_tasks.is_empty());
    assert_eq!(pack.metadata.dropped.get(SECTION_ACTIVE_TASKS), Some(&3));
}

#[test]
fn identical_requests_share_the_cached_pack_until_invalidated() {
    let f = fixture();
    let options = focused(&f);
    let first = f.service.get_context_pack(&options).unwrap();
    let second = f.service.get_context_pack(&options).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(f.service.cached_entries(), 1);

    f.tasks.create(NewTask::new("Late arrival")).unwrap();
    let stale = f.service.get_context_pack(&options).unwrap();
    assert_eq!(stale.active_tasks.len(), 3);

    f.service.invalidate_cache();
    let fresh = f.service.get_context_pack(&options).unwrap();
    assert!(!Arc::ptr_eq(&first, &fresh));
    assert_eq!(fresh.active_tasks.len(), 4);
}

#[test]
fn different_options_get_different_entries() {
    let f = fixture();
    let a = f.service.get_context_pack(&focused(&f)).unwrap();
    let b = f
        .service
        .get_context_pack(&ContextPackOptions {
            max_similar: 0,
            ..focused(&f)
        })
        .unwrap();
    assert_ne!(a.metadata.cache_key, b.metadata.cache_key);
    assert!(b.similar_tasks.is_empty());
    assert_eq!(f.service.cached_entries(), 2);
}

#[test]
fn explicit_default_size_shares_the_default_entry() {
    let f = fixture();
    let implicit = f.service.get_context_pack(&ContextPackOptions::default()).unwrap();
    let explicit = f
        .service
        .get_context_pack(&ContextPackOptions {
            max_size_bytes: Some(ContextConfig::default().max_size_bytes),
            ..ContextPackOptions::default()
        })
        .unwrap();
    assert!(Arc::ptr_eq(&implicit, &explicit));
}

#[test]
fn unknown_focus_task_is_not_found() {
    let f = fixture();
    let err = f
        .service
        .get_context_pack(&ContextPackOptions {
            task_id: Some("01JNOSUCHTASK0000000000000".into()),
            ..ContextPackOptions::default()
        })
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
    assert_eq!(f.patterns.stats().unwrap().total, 3);
}
