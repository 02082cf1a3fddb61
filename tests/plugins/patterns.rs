use patternstore::core::bootstrap::AutoMigrator;
use patternstore::core::config::StoreConfig;
use patternstore::core::db::{AdapterOptions, BackendKind, Database};
use patternstore::core::error::StoreError;
use patternstore::plugins::patterns::{
    NewPattern, PatternQuery, PatternRepository, PatternType, PatternUpdate,
};
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const RETRY_ID: &str = "ACME.PLATFORM:CODEBASE:ERRORS:RETRY-WITH-BACKOFF";

fn open(path: &Path, options: &AdapterOptions) -> Arc<Database> {
    let db = Arc::new(Database::create(path, options).expect("open"));
    AutoMigrator::new(&db, &StoreConfig::default())
        .auto_migrate()
        .expect("bootstrap");
    db
}

fn setup() -> (TempDir, PatternRepository) {
    let tmp = TempDir::new().unwrap();
    let db = open(&tmp.path().join("patterns.db"), &AdapterOptions::default());
    (tmp, PatternRepository::new(db))
}

fn retry_pattern() -> NewPattern {
    NewPattern::new(
        PatternType::Codebase,
        "Retry With Backoff",
        "Wrap flaky network calls in exponential backoff",
    )
    .with_id(RETRY_ID)
    .with_tags(["network", "resilience"])
    .with_snippet(json!({"lang": "rust", "code": "backoff::retry(op)"}))
}

fn count(repo: &PatternRepository) -> i64 {
    repo.database()
        .get("SELECT COUNT(*) FROM patterns", [])
        .unwrap()
        .unwrap_or(0)
}

#[test]
fn insert_is_idempotent_on_id() {
    let (_tmp, repo) = setup();
    let first = repo.insert(retry_pattern()).unwrap();
    assert!(first.created);
    assert_eq!(first.id, RETRY_ID);
    assert_eq!(first.alias.as_deref(), Some("retry-with-backoff"));

    let second = repo.insert(retry_pattern()).unwrap();
    assert!(!second.created);
    assert_eq!(second.id, first.id);
    assert_eq!(second.alias, first.alias);
    assert_eq!(count(&repo), 1);

    let stored = repo.get(RETRY_ID).unwrap().expect("stored");
    assert_eq!(stored.trust_score, 0.5);
    assert_eq!((stored.alpha, stored.beta), (1.0, 1.0));
    assert_eq!(stored.tags, vec!["network", "resilience"]);
    assert_eq!(stored.pattern_digest.len(), 64);
}

#[test]
fn concurrent_inserts_of_one_id_store_one_row() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("shared.db");
    open(&path, &AdapterOptions::default()).close().unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let db = Arc::new(Database::create(&path, &AdapterOptions::default()).unwrap());
                assert_eq!(db.backend(), BackendKind::Wal);
                let repo = PatternRepository::new(db);
                barrier.wait();
                repo.insert(retry_pattern()).unwrap()
            })
        })
        .collect();
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(outcomes.iter().filter(|o| o.created).count(), 1);
    assert_eq!(outcomes[0].id, outcomes[1].id);
    assert_eq!(outcomes[0].alias, outcomes[1].alias);

    let repo = PatternRepository::new(open(&path, &AdapterOptions::default()));
    assert_eq!(count(&repo), 1);
}

#[test]
fn concurrent_same_title_inserts_get_distinct_aliases() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("aliases.db");
    open(&path, &AdapterOptions::default()).close().unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = ["ACME:CODEBASE:NET:ONE", "ACME:CODEBASE:NET:TWO"]
        .into_iter()
        .map(|id| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let db = Arc::new(Database::create(&path, &AdapterOptions::default()).unwrap());
                let repo = PatternRepository::new(db);
                barrier.wait();
                repo.insert(NewPattern::new(PatternType::Codebase, "Retry With Backoff", "").with_id(id))
                    .unwrap()
            })
        })
        .collect();
    let mut aliases: Vec<String> = handles
        .into_iter()
        .map(|h| h.join().unwrap().alias.unwrap())
        .collect();
    aliases.sort();
    assert_eq!(aliases, vec!["retry-with-backoff", "retry-with-backoff-2"]);
}

#[test]
fn aliases_get_numeric_suffixes() {
    let (_tmp, repo) = setup();
    let aliases: Vec<String> = (0..3)
        .map(|_| {
            repo.insert(NewPattern::new(PatternType::Lang, "Prefer ? over unwrap", ""))
                .unwrap()
                .alias
                .unwrap()
        })
        .collect();
    assert_eq!(
        aliases,
        vec!["prefer-over-unwrap", "prefer-over-unwrap-2", "prefer-over-unwrap-3"]
    );
    let second = repo.get_by_alias("prefer-over-unwrap-2").unwrap().unwrap();
    assert!(second.id.starts_with("SYSTEM:PAT:AUTO:"));
    assert!(repo.get_by_alias("prefer-over-unwrap-4").unwrap().is_none());
}

#[test]
fn anti_patterns_get_anti_ids() {
    let (_tmp, repo) = setup();
    let outcome = repo
        .insert(NewPattern::new(PatternType::Anti, "Sleeping in async code", ""))
        .unwrap();
    assert!(outcome.id.starts_with("SYSTEM:ANTI:AUTO:"));
}

#[test]
fn invalid_input_is_rejected() {
    let (_tmp, repo) = setup();
    let err = repo
        .insert(NewPattern::new(PatternType::Codebase, "ok", "").with_id("not an id"))
        .unwrap_err();
    assert!(matches!(err, StoreError::ValidationError(_)));
    let err = repo
        .insert(NewPattern::new(PatternType::Codebase, "   ", ""))
        .unwrap_err();
    assert!(matches!(err, StoreError::ValidationError(_)));
    assert_eq!(count(&repo), 0);
}

#[test]
fn trust_always_follows_beta_parameters() {
    let (_tmp, repo) = setup();
    repo.insert(retry_pattern()).unwrap();

    let p = repo.update_trust_score(RETRY_ID, 3.0, 1.0).unwrap();
    assert!((p.trust_score - 0.75).abs() < 1e-12);

    let p = repo.record_outcome(RETRY_ID, true).unwrap();
    assert_eq!((p.alpha, p.beta), (4.0, 1.0));
    assert!((p.trust_score - 0.8).abs() < 1e-12);
    assert_eq!((p.usage_count, p.success_count), (1, 1));

    let p = repo.record_outcome(RETRY_ID, false).unwrap();
    assert_eq!((p.alpha, p.beta), (4.0, 2.0));
    assert!((p.trust_score - 4.0 / 6.0).abs() < 1e-12);
    assert_eq!((p.usage_count, p.success_count), (2, 1));

    for (alpha, beta) in [(0.0, 1.0), (1.0, -2.0), (f64::NAN, 1.0)] {
        assert!(repo.update_trust_score(RETRY_ID, alpha, beta).is_err());
    }
    let drift: Option<i64> = repo
        .database()
        .get(
            "SELECT COUNT(*) FROM patterns WHERE ABS(trust_score - alpha / (alpha + beta)) > 1e-9",
            [],
        )
        .unwrap();
    assert_eq!(drift, Some(0));

    let err = repo.record_outcome("ACME:CODEBASE:NONE:MISSING", true).unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[test]
fn search_combines_text_and_filters() {
    let (_tmp, repo) = setup();
    repo.insert(retry_pattern()).unwrap();
    let circuit = repo
        .insert(
            NewPattern::new(
                PatternType::Codebase,
                "Circuit breaker",
                "Stop calling a failing dependency",
            )
            .with_tags(["resilience"]),
        )
        .unwrap();
    repo.insert(NewPattern::new(PatternType::Test, "Golden files", "Snapshot outputs"))
        .unwrap();
    repo.update_trust_score(&circuit.id, 9.0, 1.0).unwrap();

    let by_text = repo
        .search(&PatternQuery {
            text: Some("backoff".into()),
            ..PatternQuery::default()
        })
        .unwrap();
    assert_eq!(by_text.len(), 1);
    assert_eq!(by_text[0].id, RETRY_ID);

    let by_tag = repo
        .search(&PatternQuery {
            tags: vec!["resilience".into()],
            ..PatternQuery::default()
        })
        .unwrap();
    assert_eq!(by_tag.len(), 2);
    assert_eq!(by_tag[0].id, circuit.id, "higher trust ranks first");

    let trusted = repo
        .search(&PatternQuery {
            min_trust: Some(0.8),
            ..PatternQuery::default()
        })
        .unwrap();
    assert_eq!(trusted.len(), 1);

    let tests = repo
        .search(&PatternQuery {
            types: vec![PatternType::Test],
            ..PatternQuery::default()
        })
        .unwrap();
    assert_eq!(tests.len(), 1);

    let punctuation_only = repo
        .search(&PatternQuery {
            text: Some("!!!".into()),
            ..PatternQuery::default()
        })
        .unwrap();
    assert!(punctuation_only.is_empty());
}

#[test]
fn quarantined_and_invalid_patterns_are_hidden_by_default() {
    let (_tmp, repo) = setup();
    repo.insert(retry_pattern()).unwrap();
    let other = repo
        .insert(NewPattern::new(PatternType::Policy, "Two reviewers", ""))
        .unwrap();

    repo.quarantine(RETRY_ID, "caused an outage").unwrap();
    repo.mark_invalid(&other.id, "superseded").unwrap();
    assert!(repo.list_top(10).unwrap().is_empty());
    assert!(repo.quarantine(RETRY_ID, " ").is_err());

    let everything = repo
        .search(&PatternQuery {
            include_invalid: true,
            include_quarantined: true,
            ..PatternQuery::default()
        })
        .unwrap();
    assert_eq!(everything.len(), 2);

    let stats = repo.stats().unwrap();
    assert_eq!((stats.total, stats.valid, stats.quarantined), (2, 1, 1));

    repo.release_quarantine(RETRY_ID).unwrap();
    let visible = repo.list_top(10).unwrap();
    assert_eq!(visible.len(), 1);
    assert!(!visible[0].is_quarantined());
}

#[test]
fn update_refreshes_index_and_digest() {
    let (_tmp, repo) = setup();
    repo.insert(retry_pattern()).unwrap();
    let before = repo.get(RETRY_ID).unwrap().unwrap();

    let after = repo
        .update(
            RETRY_ID,
            PatternUpdate {
                title: Some("Jittered retries".into()),
                ..PatternUpdate::default()
            },
        )
        .unwrap();
    assert_ne!(before.pattern_digest, after.pattern_digest);
    assert_eq!(after.alias, before.alias, "alias is stable across renames");

    let old = repo
        .search(&PatternQuery {
            text: Some("backoff with".into()),
            ..PatternQuery::default()
        })
        .unwrap();
    assert!(old.is_empty());
    let new = repo
        .search(&PatternQuery {
            text: Some("jitter".into()),
            ..PatternQuery::default()
        })
        .unwrap();
    assert_eq!(new.len(), 1);

    repo.cache_quality_score(RETRY_ID, 0.9).unwrap();
    assert_eq!(repo.get(RETRY_ID).unwrap().unwrap().quality_score, Some(0.9));
    assert!(repo.cache_quality_score(RETRY_ID, 1.5).is_err());
}

#[test]
fn trigger_backend_uses_native_sync() {
    let (_tmp, repo) = setup();
    assert_eq!(repo.fts_strategy(), "native");
}

#[test]
fn portable_backend_keeps_index_in_sync_manually() {
    let tmp = TempDir::new().unwrap();
    let db = open(
        &tmp.path().join("portable.db"),
        &AdapterOptions::with_backends(vec![BackendKind::Portable]),
    );
    let repo = PatternRepository::new(Arc::clone(&db));
    assert_eq!(repo.fts_strategy(), "manual");

    repo.insert(retry_pattern()).unwrap();
    let query = |text: &str| {
        repo.search(&PatternQuery {
            text: Some(text.into()),
            ..PatternQuery::default()
        })
        .unwrap()
        .len()
    };
    assert_eq!(query("backoff"), 1);

    repo.update(
        RETRY_ID,
        PatternUpdate {
            summary: Some("Add jitter to every delay".into()),
            ..PatternUpdate::default()
        },
    )
    .unwrap();
    assert_eq!(query("exponential"), 0);
    assert_eq!(query("jitter"), 1);

    let indexed: Option<i64> = db.get("SELECT COUNT(*) FROM patterns_fts", []).unwrap();
    assert_eq!(indexed, Some(1), "update replaces the index row");
}

#[test]
fn portable_insert_is_atomic_when_index_write_fails() {
    let tmp = TempDir::new().unwrap();
    let db = open(
        &tmp.path().join("portable.db"),
        &AdapterOptions::with_backends(vec![BackendKind::Portable]),
    );
    let repo = PatternRepository::new(Arc::clone(&db));
    db.exec("DROP TABLE patterns_fts").unwrap();

    assert!(repo.insert(retry_pattern()).is_err());
    assert_eq!(count(&repo), 0);
}

#[test]
fn malformed_tags_are_reported_not_dropped() {
    let tmp = TempDir::new().unwrap();
    let db = open(&tmp.path().join("patterns.db"), &AdapterOptions::default());
    let repo = PatternRepository::new(Arc::clone(&db));
    repo.insert(retry_pattern()).unwrap();

    db.run("UPDATE patterns SET tags = '[\"network\"' WHERE id = ?1", [RETRY_ID])
        .unwrap();
    let err = repo.get(RETRY_ID).unwrap_err();
    assert!(
        matches!(
            err,
            StoreError::RusqliteError(rusqlite::Error::FromSqlConversionFailure(11, _, _))
        ),
        "{err}"
    );
}

#[test]
fn insert_waits_out_a_writer_that_outlasts_the_busy_timeout() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("patterns.db");
    let options = AdapterOptions {
        busy_timeout: Duration::from_millis(10),
        ..AdapterOptions::with_backends(vec![BackendKind::Wal])
    };
    let repo = PatternRepository::new(open(&path, &options));

    let writer = Database::create(&path, &options).expect("second handle");
    writer.exec("BEGIN IMMEDIATE").unwrap();
    let committer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        writer.exec("COMMIT").unwrap();
    });

    let outcome = repo
        .insert(retry_pattern())
        .expect("insert should retry until the writer commits");
    committer.join().unwrap();
    assert!(outcome.created);
    assert_eq!(count(&repo), 1);
}
