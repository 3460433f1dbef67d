//! Tiered requirement resolution.
//!
//! A requirement is answered by the cheapest sufficient tier, tried in
//! strict order:
//!
//! 1. exact  — normalized-hash lookup in the vector store (confidence 1.0)
//! 2. semantic — cosine similarity over embeddings, gated by threshold
//! 3. web    — provider search, gated by reported relevance
//! 4. llm    — generation, grounded in any semantic candidates found
//!
//! Resolution never fails as a whole. Each tier's error is caught, noted,
//! and the policy advances; a requirement that exhausts every tier gets a
//! `none` result whose source info carries the accumulated failure notes.

use std::sync::Arc;

use crate::cache::SearchCache;
use crate::config::PolicyConfig;
use crate::error::Result;
use crate::models::{EmbeddingRecord, MatchType, Scope, SourceType};
use crate::providers::CapabilitySource;
use crate::store::VectorStore;

/// Outcome of resolving one requirement.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub answer: String,
    pub match_type: MatchType,
    pub confidence: f64,
    pub source_type: Option<SourceType>,
    pub source_info: serde_json::Value,
}

pub struct Resolver {
    store: VectorStore,
    cache: SearchCache,
    capabilities: Arc<dyn CapabilitySource>,
    policy: PolicyConfig,
}

impl Resolver {
    pub fn new(
        store: VectorStore,
        cache: SearchCache,
        capabilities: Arc<dyn CapabilitySource>,
        policy: PolicyConfig,
    ) -> Self {
        Self {
            store,
            cache,
            capabilities,
            policy,
        }
    }

    /// Resolve one requirement. Infallible by design: tier failures degrade
    /// the answer rather than erroring, so one bad provider cannot sink a
    /// whole batch.
    pub async fn resolve(&self, requirement_text: &str, scope: Option<&Scope>) -> Resolution {
        let mut notes: Vec<String> = Vec::new();

        // Tier 1: exact match.
        match self.store.exact_match(requirement_text, scope).await {
            Ok(Some(record)) => {
                tracing::debug!(document_id = %record.document_id, "exact match");
                return exact_resolution(&record);
            }
            Ok(None) => {}
            Err(e) => notes.push(format!("exact: {e}")),
        }

        // Tier 2: semantic similarity. The ranked candidates are kept even
        // when the threshold is not met, as grounding for the LLM tier.
        let mut candidates: Vec<(EmbeddingRecord, f32)> = Vec::new();
        match self.semantic_candidates(requirement_text, scope).await {
            Ok(found) => candidates = found,
            Err(e) => notes.push(format!("semantic: {e}")),
        }
        if let Some((record, score)) = candidates.first() {
            if *score >= self.policy.semantic_threshold {
                tracing::debug!(document_id = %record.document_id, score, "semantic match");
                return with_notes(semantic_resolution(record, *score), &notes);
            }
        }

        // Tier 3: web search.
        match self.web_answer(requirement_text).await {
            Ok(Some(resolution)) => return with_notes(resolution, &notes),
            Ok(None) => {}
            Err(e) => notes.push(format!("web: {e}")),
        }

        // Tier 4: LLM generation.
        match self.llm_answer(requirement_text, &candidates).await {
            Ok(resolution) => return with_notes(resolution, &notes),
            Err(e) => notes.push(format!("llm: {e}")),
        }

        tracing::debug!(failures = notes.len(), "requirement unresolved");
        Resolution {
            answer: String::new(),
            match_type: MatchType::None,
            confidence: 0.0,
            source_type: None,
            source_info: serde_json::json!({ "failures": notes }),
        }
    }

    /// Ranked semantic candidates for a requirement, cache-first.
    ///
    /// On a cache miss the requirement is embedded, searched, and the
    /// ranking is stored regardless of whether it clears the threshold, so
    /// repeat queries skip the embedding call either way.
    async fn semantic_candidates(
        &self,
        requirement_text: &str,
        scope: Option<&Scope>,
    ) -> Result<Vec<(EmbeddingRecord, f32)>> {
        if let Some(entry) = self.cache.get(requirement_text, scope).await? {
            let records = self.store.get_records(&entry.result_ids).await?;
            // Deleted records drop out of the ranking; scores stay aligned
            // by pairing on id.
            let scored = records
                .into_iter()
                .map(|record| {
                    let score = entry
                        .result_ids
                        .iter()
                        .position(|id| *id == record.id)
                        .and_then(|i| entry.result_scores.get(i).copied())
                        .unwrap_or(0.0);
                    (record, score)
                })
                .collect();
            return Ok(scored);
        }

        let embedder = self.capabilities.embedder().await?;
        let query_vector = embedder.embed(requirement_text).await?;
        let results = self
            .store
            .search(
                &query_vector,
                scope,
                self.policy.top_k,
                self.policy.min_score,
            )
            .await?;

        self.cache
            .put(
                requirement_text,
                scope,
                Some(&query_vector),
                &results,
                self.policy.cache_ttl_secs,
            )
            .await?;

        Ok(results)
    }

    /// Web tier: take the most relevant hit if it clears the threshold.
    async fn web_answer(&self, requirement_text: &str) -> Result<Option<Resolution>> {
        let searcher = self.capabilities.web_searcher().await?;
        let hits = searcher
            .search(requirement_text, self.policy.top_k)
            .await?;

        // Unscored hits fall back to the nominal web confidence.
        let best = hits
            .into_iter()
            .map(|hit| {
                let relevance = hit.relevance.unwrap_or(self.policy.web_confidence);
                (hit, relevance)
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .filter(|(_, relevance)| *relevance >= self.policy.web_threshold);

        Ok(best.map(|(hit, relevance)| {
            let answer = if hit.snippet.is_empty() {
                format!("{} ({})", hit.title, hit.url)
            } else {
                format!("{}: {} ({})", hit.title, hit.snippet, hit.url)
            };
            Resolution {
                answer,
                match_type: MatchType::Web,
                confidence: relevance,
                source_type: Some(SourceType::Web),
                source_info: serde_json::json!({
                    "url": hit.url,
                    "title": hit.title,
                }),
            }
        }))
    }

    /// LLM tier: generate an answer, grounded in below-threshold semantic
    /// candidates when any exist.
    async fn llm_answer(
        &self,
        requirement_text: &str,
        candidates: &[(EmbeddingRecord, f32)],
    ) -> Result<Resolution> {
        let generator = self.capabilities.generator().await?;

        let context = if candidates.is_empty() {
            None
        } else {
            let joined = candidates
                .iter()
                .take(3)
                .map(|(record, _)| {
                    record
                        .content_summary
                        .as_deref()
                        .unwrap_or(&record.content_text)
                })
                .collect::<Vec<_>>()
                .join("\n---\n");
            Some(joined)
        };

        let generation = generator
            .generate(requirement_text, context.as_deref())
            .await?;

        let confidence = generation.certainty.unwrap_or(self.policy.llm_confidence);
        Ok(Resolution {
            answer: generation.text,
            match_type: MatchType::LlmGenerated,
            confidence,
            source_type: Some(SourceType::Llm),
            source_info: serde_json::json!({
                "grounded": context.is_some(),
                "certainty_reported": generation.certainty.is_some(),
            }),
        })
    }
}

/// Carry earlier tier failures on the winning resolution, so a degraded
/// answer (e.g. after a dimension mismatch) says what it skipped over.
fn with_notes(mut resolution: Resolution, notes: &[String]) -> Resolution {
    if !notes.is_empty() {
        if let Some(map) = resolution.source_info.as_object_mut() {
            map.insert("failures".into(), serde_json::json!(notes));
        }
    }
    resolution
}

fn exact_resolution(record: &EmbeddingRecord) -> Resolution {
    Resolution {
        answer: answer_text(record),
        match_type: MatchType::Exact,
        confidence: 1.0,
        source_type: Some(SourceType::Document),
        source_info: source_info(record, None),
    }
}

fn semantic_resolution(record: &EmbeddingRecord, score: f32) -> Resolution {
    Resolution {
        answer: answer_text(record),
        match_type: MatchType::Semantic,
        confidence: score as f64,
        source_type: Some(SourceType::Document),
        source_info: source_info(record, Some(score)),
    }
}

fn answer_text(record: &EmbeddingRecord) -> String {
    record
        .content_summary
        .clone()
        .unwrap_or_else(|| record.content_text.clone())
}

fn source_info(record: &EmbeddingRecord, score: Option<f32>) -> serde_json::Value {
    let mut info = serde_json::json!({
        "record_id": record.id,
        "document_id": record.document_id,
        "chapter_id": record.chapter_id,
        "content_kind": record.content_kind.as_str(),
    });
    if let (Some(map), Some(score)) = (info.as_object_mut(), score) {
        map.insert("score".into(), serde_json::json!(score));
    }
    info
}
