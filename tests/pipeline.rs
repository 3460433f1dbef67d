//! End-to-end pipeline tests against temporary SQLite databases, with mock
//! providers standing in for the external embedding/search/LLM services.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tempfile::TempDir;

use reqsolve::cache::{spawn_invalidator, SearchCache};
use reqsolve::config::PolicyConfig;
use reqsolve::error::{ResolveError, Result};
use reqsolve::ingest::{ingest_sections, Section};
use reqsolve::models::{
    ContentKind, EmbeddingRecord, Generation, MatchType, NewEmbedding, ProviderKind, Requirement,
    Scope, SourceType, TaskStatus, WebHit,
};
use reqsolve::providers::{CapabilitySource, Embedder, Generator, WebSearcher};
use reqsolve::registry::{NewProvider, ProviderRegistry};
use reqsolve::resolve::Resolver;
use reqsolve::store::VectorStore;
use reqsolve::task::{CancelToken, TaskTracker};
use reqsolve::{db, migrate};

async fn test_pool() -> (TempDir, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("reqsolve.db"))
        .await
        .unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    (tmp, pool)
}

// ---- mock providers ----

/// Embedder backed by a fixed text -> vector table; unknown texts fail.
struct MockEmbedder {
    vectors: HashMap<String, Vec<f32>>,
}

impl MockEmbedder {
    fn new(entries: &[(&str, Vec<f32>)]) -> Arc<dyn Embedder> {
        let vectors = entries
            .iter()
            .map(|(text, vector)| (text.to_string(), vector.clone()))
            .collect();
        Arc::new(Self { vectors })
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    fn model_name(&self) -> &str {
        "mock-embed"
    }

    fn dims(&self) -> usize {
        2
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.vectors
            .get(text)
            .cloned()
            .ok_or_else(|| ResolveError::provider(format!("no mock vector for: {text}")))
    }
}

struct StaticSearcher(Vec<WebHit>);

#[async_trait]
impl WebSearcher for StaticSearcher {
    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<WebHit>> {
        Ok(self.0.iter().take(limit).cloned().collect())
    }
}

struct StaticGenerator(Generation);

#[async_trait]
impl Generator for StaticGenerator {
    async fn generate(&self, _prompt: &str, _context: Option<&str>) -> Result<Generation> {
        Ok(self.0.clone())
    }
}

struct FailingSearcher;

#[async_trait]
impl WebSearcher for FailingSearcher {
    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<WebHit>> {
        Err(ResolveError::provider("search backend down"))
    }
}

struct FailingGenerator;

#[async_trait]
impl Generator for FailingGenerator {
    async fn generate(&self, _prompt: &str, _context: Option<&str>) -> Result<Generation> {
        Err(ResolveError::quota("llm quota exhausted"))
    }
}

/// Capability source serving fixed mock instances; a `None` slot behaves
/// like a kind with no registered provider.
#[derive(Default)]
struct Mocks {
    embedder: Option<Arc<dyn Embedder>>,
    web: Option<Arc<dyn WebSearcher>>,
    llm: Option<Arc<dyn Generator>>,
}

#[async_trait]
impl CapabilitySource for Mocks {
    async fn embedder(&self) -> Result<Arc<dyn Embedder>> {
        self.embedder
            .clone()
            .ok_or_else(|| ResolveError::not_found("provider", "embedding/default"))
    }

    async fn web_searcher(&self) -> Result<Arc<dyn WebSearcher>> {
        self.web
            .clone()
            .ok_or_else(|| ResolveError::not_found("provider", "web_search/default"))
    }

    async fn generator(&self) -> Result<Arc<dyn Generator>> {
        self.llm
            .clone()
            .ok_or_else(|| ResolveError::not_found("provider", "llm/default"))
    }
}

fn sample_record(id: i64, document_id: &str) -> EmbeddingRecord {
    EmbeddingRecord {
        id,
        document_id: document_id.to_string(),
        chapter_id: None,
        content_kind: ContentKind::Paragraph,
        content_hash: format!("hash-{id}"),
        normalized_hash: format!("nhash-{id}"),
        content_text: "some indexed paragraph content".to_string(),
        content_summary: None,
        vector: vec![1.0, 0.0],
        model: "mock-embed".to_string(),
        dims: 2,
        metadata: serde_json::json!({}),
    }
}

// ---- vector store ----

#[tokio::test]
async fn ingest_is_idempotent() {
    let (_tmp, pool) = test_pool().await;
    let store = VectorStore::new(pool);
    let embedder = MockEmbedder::new(&[
        ("TLS 1.3 is required for all external endpoints", vec![1.0, 0.0]),
        ("Backups run nightly and are encrypted", vec![0.0, 1.0]),
    ]);

    let sections = vec![
        Section {
            chapter_id: Some("ch1".into()),
            kind: ContentKind::Paragraph,
            text: "TLS 1.3 is required for all external endpoints".into(),
        },
        Section {
            chapter_id: Some("ch2".into()),
            kind: ContentKind::Paragraph,
            text: "Backups run nightly and are encrypted".into(),
        },
        Section {
            chapter_id: None,
            kind: ContentKind::Paragraph,
            text: "tiny".into(), // below the minimum section length
        },
    ];

    let first = ingest_sections(&store, &embedder, "spec-v2", &sections)
        .await
        .unwrap();
    assert_eq!(first.inserted, 2);
    assert_eq!(first.unchanged, 0);
    assert_eq!(first.skipped, 1);

    let second = ingest_sections(&store, &embedder, "spec-v2", &sections)
        .await
        .unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.unchanged, 2);
    assert_eq!(second.skipped, 1);
}

#[tokio::test]
async fn changed_content_replaces_slot() {
    let (_tmp, pool) = test_pool().await;
    let store = VectorStore::new(pool);

    let original = NewEmbedding {
        document_id: "doc".into(),
        chapter_id: Some("ch1".into()),
        content_kind: ContentKind::Paragraph,
        content_text: "Sessions expire after 30 minutes".into(),
        content_summary: None,
        vector: vec![1.0, 0.0],
        model: "mock-embed".into(),
        metadata: serde_json::json!({}),
    };
    let first = store.upsert(&original).await.unwrap();
    assert!(first.inserted);

    let revised = NewEmbedding {
        content_text: "Sessions expire after 15 minutes".into(),
        ..original.clone()
    };
    let second = store.upsert(&revised).await.unwrap();
    assert!(second.inserted);
    assert_ne!(first.id, second.id);

    // The superseded record is gone; only the revision answers.
    assert!(store
        .exact_match("Sessions expire after 30 minutes", None)
        .await
        .unwrap()
        .is_none());
    let hit = store
        .exact_match("sessions expire after 15 minutes!", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hit.id, second.id);
}

#[tokio::test]
async fn search_respects_scope_and_ranking() {
    let (_tmp, pool) = test_pool().await;
    let store = VectorStore::new(pool);

    for (document, vector) in [
        ("doc-a", vec![1.0f32, 0.0]),
        ("doc-b", vec![0.9, 0.4358899]),
        ("doc-c", vec![0.0, 1.0]),
    ] {
        store
            .upsert(&NewEmbedding {
                document_id: document.into(),
                chapter_id: None,
                content_kind: ContentKind::Paragraph,
                content_text: format!("content for {document}"),
                content_summary: None,
                vector,
                model: "mock-embed".into(),
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();
    }

    let query = vec![1.0f32, 0.0];
    let all = store.search(&query, None, 5, 0.25).await.unwrap();
    assert_eq!(all.len(), 2); // doc-c is orthogonal, below min_score
    assert_eq!(all[0].0.document_id, "doc-a");
    assert!(all[0].1 > all[1].1);

    let scope = Scope::new(vec!["doc-b".into()]);
    let scoped = store.search(&query, Some(&scope), 5, 0.25).await.unwrap();
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].0.document_id, "doc-b");
}

// ---- search cache ----

#[tokio::test]
async fn cache_counts_hits_and_expires() {
    let (_tmp, pool) = test_pool().await;
    let cache = SearchCache::new(pool);
    let now = 1_700_000_000i64;

    let results = vec![(sample_record(1, "doc-a"), 0.91f32)];
    cache
        .put_at("what about tls?", None, Some(&[1.0, 0.0]), &results, 3600, now)
        .await
        .unwrap();

    let first = cache.get_at("what about tls?", None, now + 10).await.unwrap().unwrap();
    assert_eq!(first.hit_count, 1);
    assert_eq!(first.result_ids, vec![1]);

    let second = cache.get_at("what about tls?", None, now + 20).await.unwrap().unwrap();
    assert_eq!(second.hit_count, 2);

    // Past the TTL the entry reads as a miss and is dropped for good.
    assert!(cache
        .get_at("what about tls?", None, now + 3601)
        .await
        .unwrap()
        .is_none());
    assert!(cache
        .get_at("what about tls?", None, now + 10)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn cache_replacement_resets_hit_count() {
    let (_tmp, pool) = test_pool().await;
    let cache = SearchCache::new(pool);
    let now = 1_700_000_000i64;

    let results = vec![(sample_record(1, "doc-a"), 0.91f32)];
    cache
        .put_at("q", None, None, &results, 3600, now)
        .await
        .unwrap();
    cache.get_at("q", None, now + 1).await.unwrap();
    cache.get_at("q", None, now + 2).await.unwrap();

    let replacement = vec![(sample_record(2, "doc-b"), 0.85f32)];
    cache
        .put_at("q", None, None, &replacement, 3600, now + 3)
        .await
        .unwrap();

    let entry = cache.get_at("q", None, now + 4).await.unwrap().unwrap();
    assert_eq!(entry.result_ids, vec![2]);
    assert_eq!(entry.hit_count, 1);
}

#[tokio::test]
async fn cache_invalidated_by_document_change() {
    let (_tmp, pool) = test_pool().await;
    let cache = SearchCache::new(pool);
    let now = 1_700_000_000i64;

    let results = vec![
        (sample_record(1, "doc-a"), 0.91f32),
        (sample_record(2, "doc-b"), 0.52f32),
    ];
    cache.put_at("q1", None, None, &results, 3600, now).await.unwrap();
    let unrelated = vec![(sample_record(3, "doc-c"), 0.7f32)];
    cache.put_at("q2", None, None, &unrelated, 3600, now).await.unwrap();

    let removed = cache.invalidate_document("doc-b").await.unwrap();
    assert_eq!(removed, 1);
    assert!(cache.get_at("q1", None, now + 1).await.unwrap().is_none());
    assert!(cache.get_at("q2", None, now + 1).await.unwrap().is_some());
}

#[tokio::test]
async fn change_feed_drives_invalidation() {
    let (_tmp, pool) = test_pool().await;
    let store = VectorStore::new(pool.clone());
    let cache = SearchCache::new(pool);
    let handle = spawn_invalidator(cache.clone(), store.touched());
    let now = 1_700_000_000i64;

    let results = vec![(sample_record(1, "doc-a"), 0.9f32)];
    cache.put_at("q", None, None, &results, 3600, now).await.unwrap();

    // Writing into doc-a publishes on the feed; the subscriber drops the
    // dependent entry shortly after.
    store
        .upsert(&NewEmbedding {
            document_id: "doc-a".into(),
            chapter_id: None,
            content_kind: ContentKind::Paragraph,
            content_text: "fresh content for doc-a, long enough".into(),
            content_summary: None,
            vector: vec![0.5, 0.5],
            model: "mock-embed".into(),
            metadata: serde_json::json!({}),
        })
        .await
        .unwrap();

    let mut invalidated = false;
    for _ in 0..100 {
        if cache.get_at("q", None, now + 1).await.unwrap().is_none() {
            invalidated = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(invalidated, "cache entry should be dropped via the change feed");
    handle.abort();
}

// ---- tiered resolution ----

fn resolver_with(store: VectorStore, cache: SearchCache, mocks: Mocks) -> Resolver {
    Resolver::new(store, cache, Arc::new(mocks), PolicyConfig::default())
}

#[tokio::test]
async fn exact_match_wins_without_providers() {
    let (_tmp, pool) = test_pool().await;
    let store = VectorStore::new(pool.clone());
    let cache = SearchCache::new(pool);

    store
        .upsert(&NewEmbedding {
            document_id: "spec".into(),
            chapter_id: None,
            content_kind: ContentKind::Paragraph,
            content_text: "The system supports TLS 1.3".into(),
            content_summary: Some("TLS 1.3 supported".into()),
            vector: vec![1.0, 0.0],
            model: "mock-embed".into(),
            metadata: serde_json::json!({}),
        })
        .await
        .unwrap();

    // Every provider slot is empty: an exact hit must not need any.
    let resolver = resolver_with(store, cache, Mocks::default());
    let resolution = resolver
        .resolve("the system supports tls 1.3!", None)
        .await;

    assert_eq!(resolution.match_type, MatchType::Exact);
    assert_eq!(resolution.confidence, 1.0);
    assert_eq!(resolution.source_type, Some(SourceType::Document));
    assert_eq!(resolution.answer, "TLS 1.3 supported");
    assert_eq!(resolution.source_info["document_id"], "spec");
}

#[tokio::test]
async fn semantic_match_clears_threshold() {
    let (_tmp, pool) = test_pool().await;
    let store = VectorStore::new(pool.clone());
    let cache = SearchCache::new(pool);

    store
        .upsert(&NewEmbedding {
            document_id: "spec".into(),
            chapter_id: None,
            content_kind: ContentKind::Paragraph,
            content_text: "Data encryption at rest uses AES-256".into(),
            content_summary: None,
            vector: vec![1.0, 0.0],
            model: "mock-embed".into(),
            metadata: serde_json::json!({}),
        })
        .await
        .unwrap();

    // Unit query vector at cosine 0.86 from the stored [1, 0].
    let query = "Is stored data encrypted?";
    let mocks = Mocks {
        embedder: Some(MockEmbedder::new(&[(query, vec![0.86, 0.510_294])])),
        ..Default::default()
    };
    let resolver = resolver_with(store, cache.clone(), mocks);

    let resolution = resolver.resolve(query, None).await;
    assert_eq!(resolution.match_type, MatchType::Semantic);
    assert!((resolution.confidence - 0.86).abs() < 0.01);
    assert_eq!(resolution.source_type, Some(SourceType::Document));
    assert_eq!(resolution.answer, "Data encryption at rest uses AES-256");

    // The ranking was cached on the way through.
    let entry = cache.get(query, None).await.unwrap().unwrap();
    assert_eq!(entry.result_ids.len(), 1);
}

#[tokio::test]
async fn web_tier_answers_when_semantic_misses() {
    let (_tmp, pool) = test_pool().await;
    let store = VectorStore::new(pool.clone());
    let cache = SearchCache::new(pool);

    let query = "What is the SLA for the status page?";
    let mocks = Mocks {
        // Embeds fine, but the index is empty: semantic yields nothing.
        embedder: Some(MockEmbedder::new(&[(query, vec![1.0, 0.0])])),
        web: Some(Arc::new(StaticSearcher(vec![
            WebHit {
                title: "Status page SLA".into(),
                snippet: "99.9% monthly uptime".into(),
                url: "https://example.com/sla".into(),
                relevance: Some(0.9),
            },
            WebHit {
                title: "Unrelated".into(),
                snippet: "".into(),
                url: "https://example.com/other".into(),
                relevance: Some(0.2),
            },
        ]))),
        ..Default::default()
    };
    let resolver = resolver_with(store, cache, mocks);

    let resolution = resolver.resolve(query, None).await;
    assert_eq!(resolution.match_type, MatchType::Web);
    assert_eq!(resolution.confidence, 0.9);
    assert_eq!(resolution.source_type, Some(SourceType::Web));
    assert!(resolution.answer.contains("99.9% monthly uptime"));
    assert!(resolution.answer.contains("https://example.com/sla"));
}

#[tokio::test]
async fn llm_tier_uses_below_threshold_candidates() {
    let (_tmp, pool) = test_pool().await;
    let store = VectorStore::new(pool.clone());
    let cache = SearchCache::new(pool);

    store
        .upsert(&NewEmbedding {
            document_id: "spec".into(),
            chapter_id: None,
            content_kind: ContentKind::Paragraph,
            content_text: "Audit logs are retained for ninety days".into(),
            content_summary: None,
            vector: vec![1.0, 0.0],
            model: "mock-embed".into(),
            metadata: serde_json::json!({}),
        })
        .await
        .unwrap();

    // Cosine 0.5: a candidate exists but does not clear the 0.8 threshold.
    let query = "How long are logs kept?";
    let mocks = Mocks {
        embedder: Some(MockEmbedder::new(&[(query, vec![0.5, 0.866_025])])),
        web: Some(Arc::new(FailingSearcher)),
        llm: Some(Arc::new(StaticGenerator(Generation {
            text: "Logs are retained for 90 days.".into(),
            certainty: None,
        }))),
        ..Default::default()
    };
    let resolver = resolver_with(store, cache, mocks);

    let resolution = resolver.resolve(query, None).await;
    assert_eq!(resolution.match_type, MatchType::LlmGenerated);
    assert_eq!(resolution.confidence, PolicyConfig::default().llm_confidence);
    assert_eq!(resolution.source_type, Some(SourceType::Llm));
    assert_eq!(resolution.source_info["grounded"], true);
}

#[tokio::test]
async fn exhausted_tiers_yield_none_with_failures() {
    let (_tmp, pool) = test_pool().await;
    let store = VectorStore::new(pool.clone());
    let cache = SearchCache::new(pool);

    let mocks = Mocks {
        embedder: None,
        web: Some(Arc::new(FailingSearcher)),
        llm: Some(Arc::new(FailingGenerator)),
    };
    let resolver = resolver_with(store, cache, mocks);

    let resolution = resolver.resolve("completely unknown requirement", None).await;
    assert_eq!(resolution.match_type, MatchType::None);
    assert_eq!(resolution.confidence, 0.0);
    assert_eq!(resolution.source_type, None);
    assert!(resolution.answer.is_empty());

    let failures = resolution.source_info["failures"].as_array().unwrap();
    assert_eq!(failures.len(), 3);
    assert!(failures[0].as_str().unwrap().starts_with("semantic:"));
    assert!(failures[1].as_str().unwrap().starts_with("web:"));
    assert!(failures[2].as_str().unwrap().starts_with("llm:"));
}

#[tokio::test]
async fn dimension_mismatch_degrades_to_next_tier() {
    let (_tmp, pool) = test_pool().await;
    let store = VectorStore::new(pool.clone());
    let cache = SearchCache::new(pool);

    store
        .upsert(&NewEmbedding {
            document_id: "spec".into(),
            chapter_id: None,
            content_kind: ContentKind::Paragraph,
            content_text: "Passwords are hashed with argon2id".into(),
            content_summary: None,
            vector: vec![1.0, 0.0],
            model: "mock-embed".into(),
            metadata: serde_json::json!({}),
        })
        .await
        .unwrap();

    let query = "How are passwords stored?";
    let mocks = Mocks {
        // Wrong dimensionality: the semantic tier must fail cleanly.
        embedder: Some(MockEmbedder::new(&[(query, vec![0.5, 0.5, 0.5])])),
        web: Some(Arc::new(StaticSearcher(vec![WebHit {
            title: "Password storage".into(),
            snippet: "argon2id".into(),
            url: "https://example.com/pw".into(),
            relevance: Some(0.8),
        }]))),
        ..Default::default()
    };
    let resolver = resolver_with(store, cache, mocks);

    let resolution = resolver.resolve(query, None).await;
    assert_eq!(resolution.match_type, MatchType::Web);

    // The skipped tier's failure is still visible on the winning answer.
    let failures = resolution.source_info["failures"].as_array().unwrap();
    assert_eq!(failures.len(), 1);
    let note = failures[0].as_str().unwrap();
    assert!(note.starts_with("semantic:"));
    assert!(note.contains("dimension mismatch"));
}

// ---- batch tasks ----

#[tokio::test]
async fn batch_task_runs_to_completion() {
    let (_tmp, pool) = test_pool().await;
    let store = VectorStore::new(pool.clone());
    let cache = SearchCache::new(pool.clone());

    store
        .upsert(&NewEmbedding {
            document_id: "spec".into(),
            chapter_id: None,
            content_kind: ContentKind::Paragraph,
            content_text: "The system supports TLS 1.3".into(),
            content_summary: None,
            vector: vec![1.0, 0.0],
            model: "mock-embed".into(),
            metadata: serde_json::json!({}),
        })
        .await
        .unwrap();
    store
        .upsert(&NewEmbedding {
            document_id: "spec".into(),
            chapter_id: Some("ch2".into()),
            content_kind: ContentKind::Paragraph,
            content_text: "Data encryption at rest uses AES-256".into(),
            content_summary: None,
            vector: vec![0.0, 1.0],
            model: "mock-embed".into(),
            metadata: serde_json::json!({}),
        })
        .await
        .unwrap();

    let mocks = Mocks {
        embedder: Some(MockEmbedder::new(&[
            ("Is data encrypted at rest?", vec![0.510_294, 0.86]),
            ("Does it interface with the mainframe?", vec![-1.0, 0.0]),
        ])),
        web: Some(Arc::new(FailingSearcher)),
        llm: Some(Arc::new(FailingGenerator)),
    };
    let resolver = Arc::new(Resolver::new(
        store,
        cache,
        Arc::new(mocks),
        PolicyConfig::default(),
    ));
    let tracker = TaskTracker::new(pool, resolver, PolicyConfig::default());

    let requirements = vec![
        Requirement::from_content("The system supports TLS 1.3"),
        Requirement::from_content("Is data encrypted at rest?"),
        Requirement::from_content("Does it interface with the mainframe?"),
    ];
    let task_id = tracker
        .create_task("alice", Some("reqs.txt"), &requirements)
        .await
        .unwrap();

    let status = tracker.get_task(&task_id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Pending);
    assert_eq!(status.total_requirements, 3);

    tracker
        .run(&task_id, None, &CancelToken::new())
        .await
        .unwrap();

    let task = tracker.get_task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.processed_count, 3);
    assert!(task.completed_at.is_some());

    let results = tracker.get_results(&task_id).await.unwrap();
    assert_eq!(results.len(), 3);
    for (index, result) in results.iter().enumerate() {
        assert_eq!(result.requirement_index, index as i64);
    }
    assert_eq!(results[0].match_type, MatchType::Exact);
    assert_eq!(results[1].match_type, MatchType::Semantic);
    assert_eq!(results[2].match_type, MatchType::None);
    assert!(results[2].answer.is_empty());
}

#[tokio::test]
async fn completed_task_is_not_rerun() {
    let (_tmp, pool) = test_pool().await;
    let store = VectorStore::new(pool.clone());
    let cache = SearchCache::new(pool.clone());

    let mocks = Mocks {
        web: Some(Arc::new(FailingSearcher)),
        llm: Some(Arc::new(StaticGenerator(Generation {
            text: "Probably.".into(),
            certainty: Some(0.4),
        }))),
        ..Default::default()
    };
    let resolver = Arc::new(Resolver::new(
        store,
        cache,
        Arc::new(mocks),
        PolicyConfig::default(),
    ));
    let tracker = TaskTracker::new(pool, resolver, PolicyConfig::default());

    let requirements = vec![Requirement::from_content("Anything at all?")];
    let task_id = tracker.create_task("bob", None, &requirements).await.unwrap();
    tracker.run(&task_id, None, &CancelToken::new()).await.unwrap();

    let after_first = tracker.get_task(&task_id).await.unwrap();
    assert_eq!(after_first.status, TaskStatus::Completed);
    assert_eq!(after_first.processed_count, 1);

    // A second run is a no-op: status and progress are untouched.
    tracker.run(&task_id, None, &CancelToken::new()).await.unwrap();
    let after_second = tracker.get_task(&task_id).await.unwrap();
    assert_eq!(after_second.status, TaskStatus::Completed);
    assert_eq!(after_second.processed_count, 1);
    assert_eq!(tracker.get_results(&task_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn cancelled_task_ends_failed() {
    let (_tmp, pool) = test_pool().await;
    let store = VectorStore::new(pool.clone());
    let cache = SearchCache::new(pool.clone());
    let resolver = Arc::new(Resolver::new(
        store,
        cache,
        Arc::new(Mocks::default()),
        PolicyConfig::default(),
    ));
    let tracker = TaskTracker::new(pool, resolver, PolicyConfig::default());

    let requirements = vec![
        Requirement::from_content("first"),
        Requirement::from_content("second"),
    ];
    let task_id = tracker.create_task("carol", None, &requirements).await.unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    tracker.run(&task_id, None, &cancel).await.unwrap();

    let task = tracker.get_task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error_message.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn storage_failure_before_dispatch_fails_task() {
    let (_tmp, pool) = test_pool().await;
    let store = VectorStore::new(pool.clone());
    let cache = SearchCache::new(pool.clone());
    let resolver = Arc::new(Resolver::new(
        store,
        cache,
        Arc::new(Mocks::default()),
        PolicyConfig::default(),
    ));
    let tracker = TaskTracker::new(pool.clone(), resolver, PolicyConfig::default());

    let requirements = vec![Requirement::from_content("anything")];
    let task_id = tracker.create_task("dave", None, &requirements).await.unwrap();

    // Break the requirement batch out from under the run: loading it now
    // hits a storage error right after the task is claimed.
    sqlx::query("DROP TABLE task_requirements")
        .execute(&pool)
        .await
        .unwrap();

    let err = tracker.run(&task_id, None, &CancelToken::new()).await;
    assert!(err.is_err());

    let task = tracker.get_task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    let message = task.error_message.unwrap();
    assert!(message.starts_with("storage failure before dispatch"));
}

// ---- provider registry ----

#[tokio::test]
async fn registry_keeps_one_default_per_kind() {
    let (_tmp, pool) = test_pool().await;
    let registry = ProviderRegistry::new(pool, Duration::from_secs(5));

    let base = NewProvider {
        name: "first".into(),
        kind: ProviderKind::Embedding,
        endpoint: "http://localhost:9000/embeddings".into(),
        credentials_ref: None,
        model: Some("embed-small".into()),
        params: serde_json::json!({}),
        dims: Some(2),
        make_default: true,
    };
    registry.create(&base).await.unwrap();
    registry
        .create(&NewProvider {
            name: "second".into(),
            make_default: true,
            ..base.clone()
        })
        .await
        .unwrap();

    let default = registry.get_default(ProviderKind::Embedding).await.unwrap();
    assert_eq!(default.name, "second");

    // Exactly one default row exists.
    let all = registry.list(Some(ProviderKind::Embedding), true).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all.iter().filter(|p| p.is_default).count(), 1);
    assert_eq!(all[0].name, "second"); // defaults sort first

    registry.set_default(ProviderKind::Embedding, "first").await.unwrap();
    let default = registry.get_default(ProviderKind::Embedding).await.unwrap();
    assert_eq!(default.name, "first");

    // Deactivating the default leaves the kind without one.
    registry.deactivate(ProviderKind::Embedding, "first").await.unwrap();
    let err = registry.get_default(ProviderKind::Embedding).await.unwrap_err();
    assert!(matches!(err, ResolveError::NotFound { .. }));

    // Other kinds were never touched.
    let err = registry.get_default(ProviderKind::Llm).await.unwrap_err();
    assert!(matches!(err, ResolveError::NotFound { .. }));
}

#[tokio::test]
async fn registry_rejects_inactive_default() {
    let (_tmp, pool) = test_pool().await;
    let registry = ProviderRegistry::new(pool, Duration::from_secs(5));

    registry
        .create(&NewProvider {
            name: "only".into(),
            kind: ProviderKind::WebSearch,
            endpoint: "http://localhost:9000/search".into(),
            credentials_ref: None,
            model: None,
            params: serde_json::json!({}),
            dims: None,
            make_default: false,
        })
        .await
        .unwrap();
    registry.deactivate(ProviderKind::WebSearch, "only").await.unwrap();

    let err = registry
        .set_default(ProviderKind::WebSearch, "only")
        .await
        .unwrap_err();
    assert!(matches!(err, ResolveError::Config { .. }));
}
