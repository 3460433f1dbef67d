//! Core data models for the requirement-resolution pipeline.
//!
//! These types represent the embedding records, cached rankings, tasks, and
//! per-requirement results that flow between the vector store, the search
//! cache, the tiered resolver, and the batch task tracker.

use serde::{Deserialize, Serialize};

use crate::error::ResolveError;

/// Granularity of an indexed piece of document content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Chapter,
    Paragraph,
    TableRow,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chapter => "chapter",
            Self::Paragraph => "paragraph",
            Self::TableRow => "table_row",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ResolveError> {
        match s {
            "chapter" => Ok(Self::Chapter),
            "paragraph" => Ok(Self::Paragraph),
            "table_row" => Ok(Self::TableRow),
            other => Err(ResolveError::config(format!(
                "unknown content kind: {other}"
            ))),
        }
    }
}

/// The tier that produced a requirement's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Semantic,
    Web,
    LlmGenerated,
    None,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Semantic => "semantic",
            Self::Web => "web",
            Self::LlmGenerated => "llm_generated",
            Self::None => "none",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ResolveError> {
        match s {
            "exact" => Ok(Self::Exact),
            "semantic" => Ok(Self::Semantic),
            "web" => Ok(Self::Web),
            "llm_generated" => Ok(Self::LlmGenerated),
            "none" => Ok(Self::None),
            other => Err(ResolveError::config(format!("unknown match type: {other}"))),
        }
    }
}

/// Where an answer was sourced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Document,
    Web,
    Llm,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Web => "web",
            Self::Llm => "llm",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ResolveError> {
        match s {
            "document" => Ok(Self::Document),
            "web" => Ok(Self::Web),
            "llm" => Ok(Self::Llm),
            other => Err(ResolveError::config(format!("unknown source type: {other}"))),
        }
    }
}

/// Lifecycle state of an analysis task. Transitions are monotonic:
/// `pending → processing → {completed | failed}`, never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ResolveError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ResolveError::config(format!("unknown task status: {other}"))),
        }
    }

    /// True if this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Kind of external capability a provider config describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Llm,
    Embedding,
    WebSearch,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Embedding => "embedding",
            Self::WebSearch => "web_search",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ResolveError> {
        match s {
            "llm" => Ok(Self::Llm),
            "embedding" => Ok(Self::Embedding),
            "web_search" => Ok(Self::WebSearch),
            other => Err(ResolveError::config(format!(
                "unknown provider kind: {other}"
            ))),
        }
    }

    pub const ALL: [ProviderKind; 3] = [Self::Llm, Self::Embedding, Self::WebSearch];
}

/// An optional restriction narrowing searches and cache lookups to a set of
/// documents. Ids are kept sorted and deduplicated so the scope has one
/// canonical form, which participates in the cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    document_ids: Vec<String>,
}

impl Scope {
    pub fn new(mut document_ids: Vec<String>) -> Self {
        document_ids.sort();
        document_ids.dedup();
        Self { document_ids }
    }

    pub fn contains(&self, document_id: &str) -> bool {
        self.document_ids.binary_search_by(|d| d.as_str().cmp(document_id)).is_ok()
    }

    pub fn document_ids(&self) -> &[String] {
        &self.document_ids
    }

    /// Canonical string form, stable across construction order.
    pub fn key(&self) -> String {
        self.document_ids.join(",")
    }
}

/// A stored content embedding, keyed by content hash within its
/// `(document, chapter, kind)` slot.
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub id: i64,
    pub document_id: String,
    pub chapter_id: Option<String>,
    pub content_kind: ContentKind,
    pub content_hash: String,
    pub normalized_hash: String,
    pub content_text: String,
    pub content_summary: Option<String>,
    pub vector: Vec<f32>,
    pub model: String,
    pub dims: usize,
    pub metadata: serde_json::Value,
}

/// Input for [`VectorStore::upsert`](crate::store::VectorStore::upsert);
/// hashes and id are computed by the store.
#[derive(Debug, Clone)]
pub struct NewEmbedding {
    pub document_id: String,
    pub chapter_id: Option<String>,
    pub content_kind: ContentKind,
    pub content_text: String,
    pub content_summary: Option<String>,
    pub vector: Vec<f32>,
    pub model: String,
    pub metadata: serde_json::Value,
}

/// A cached search ranking for a normalized query within a scope.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub query_hash: String,
    pub query_text: String,
    pub query_vector: Option<Vec<f32>>,
    pub scope: Option<String>,
    pub result_ids: Vec<i64>,
    pub result_scores: Vec<f32>,
    pub hit_count: i64,
    pub created_at: i64,
    pub expires_at: i64,
}

/// A single free-text requirement within a batch.
#[derive(Debug, Clone)]
pub struct Requirement {
    pub title: String,
    pub content: String,
}

impl Requirement {
    /// Build a requirement from raw content, deriving a short title.
    pub fn from_content(content: impl Into<String>) -> Self {
        let content = content.into();
        let title: String = content.chars().take(50).collect();
        let title = if content.chars().count() > 50 {
            format!("{title}...")
        } else {
            title
        };
        Self { title, content }
    }
}

/// A multi-requirement analysis job.
#[derive(Debug, Clone)]
pub struct AnalysisTask {
    pub id: String,
    pub user_id: String,
    pub filename: Option<String>,
    pub total_requirements: i64,
    pub processed_count: i64,
    pub status: TaskStatus,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

/// One resolved requirement within a task. Exactly one row exists per
/// `requirement_index` in `[0, total_requirements)` once the task completes.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub id: i64,
    pub task_id: String,
    pub requirement_index: i64,
    pub requirement_title: String,
    pub requirement_content: String,
    pub answer: String,
    pub match_type: MatchType,
    pub confidence: f64,
    pub source_type: Option<SourceType>,
    pub source_info: serde_json::Value,
}

/// Persisted configuration for one external provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub id: i64,
    pub name: String,
    pub kind: ProviderKind,
    pub endpoint: String,
    /// Name of the environment variable holding the credential. Secrets
    /// themselves are never persisted.
    pub credentials_ref: Option<String>,
    pub model: Option<String>,
    pub params: serde_json::Value,
    pub dims: Option<usize>,
    pub is_default: bool,
    pub is_active: bool,
}

/// A single web search hit.
#[derive(Debug, Clone)]
pub struct WebHit {
    pub title: String,
    pub snippet: String,
    pub url: String,
    /// Provider-reported relevance in `[0, 1]`; `None` when the provider
    /// does not score its results, in which case policy supplies a nominal
    /// confidence.
    pub relevance: Option<f64>,
}

/// Output of the LLM generation capability.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    /// Provider-reported certainty in `[0, 1]`, when available.
    pub certainty: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_roundtrip() {
        for mt in [
            MatchType::Exact,
            MatchType::Semantic,
            MatchType::Web,
            MatchType::LlmGenerated,
            MatchType::None,
        ] {
            assert_eq!(MatchType::parse(mt.as_str()).unwrap(), mt);
        }
        for kind in ProviderKind::ALL {
            assert_eq!(ProviderKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(TaskStatus::parse("bogus").is_err());
    }

    #[test]
    fn test_scope_canonical() {
        let a = Scope::new(vec!["b".into(), "a".into(), "a".into()]);
        let b = Scope::new(vec!["a".into(), "b".into()]);
        assert_eq!(a.key(), "a,b");
        assert_eq!(a, b);
        assert!(a.contains("a"));
        assert!(!a.contains("c"));
    }

    #[test]
    fn test_requirement_title_truncation() {
        let short = Requirement::from_content("Supports TLS 1.3");
        assert_eq!(short.title, "Supports TLS 1.3");

        let long = Requirement::from_content("x".repeat(80));
        assert_eq!(long.title.chars().count(), 53);
        assert!(long.title.ends_with("..."));
    }
}
