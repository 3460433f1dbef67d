//! Provider capability abstraction and HTTP implementations.
//!
//! The resolution tiers depend only on three narrow capabilities:
//!
//! - [`Embedder`] — `embed(text) -> vector`
//! - [`WebSearcher`] — `search(query) -> ranked hits`
//! - [`Generator`] — `generate(prompt, context) -> text`
//!
//! Concrete providers sit behind these traits and are selected through a
//! [`CapabilitySource`] (in production, the provider registry), so vendors
//! are swappable without touching the resolver. Retry and rate-limit policy
//! belong to the calling layer; each implementation here makes a single
//! attempt with a request timeout and classifies HTTP 429 separately so the
//! caller can back off.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ResolveError, Result};
use crate::models::{Generation, ProviderConfig, WebHit};

/// Text-to-vector capability.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Web search capability.
#[async_trait]
pub trait WebSearcher: Send + Sync {
    /// Search the web, returning up to `limit` hits ordered by relevance.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<WebHit>>;
}

/// Text generation capability.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate an answer for `prompt`, optionally grounded in `context`.
    async fn generate(&self, prompt: &str, context: Option<&str>) -> Result<Generation>;
}

/// Source of capability instances, one per provider kind.
///
/// Each call reflects the current default provider config; a failed lookup
/// surfaces as [`ResolveError::NotFound`], which the resolver treats as
/// "tier unavailable".
#[async_trait]
pub trait CapabilitySource: Send + Sync {
    async fn embedder(&self) -> Result<Arc<dyn Embedder>>;
    async fn web_searcher(&self) -> Result<Arc<dyn WebSearcher>>;
    async fn generator(&self) -> Result<Arc<dyn Generator>>;
}

// ============ shared HTTP plumbing ============

fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ResolveError::provider(e.to_string()))
}

/// Resolve the credential named by `credentials_ref` from the environment.
fn api_key_for(config: &ProviderConfig) -> Result<Option<String>> {
    match &config.credentials_ref {
        None => Ok(None),
        Some(var) => match std::env::var(var) {
            Ok(key) => Ok(Some(key)),
            Err(_) => Err(ResolveError::provider(format!(
                "credential variable {var} not set"
            ))),
        },
    }
}

/// Map a non-success HTTP status to the error taxonomy: 429 is a quota
/// signal, everything else a plain provider error.
fn classify_status(status: reqwest::StatusCode, body: &str) -> ResolveError {
    if status.as_u16() == 429 {
        ResolveError::quota(format!("HTTP 429: {body}"))
    } else {
        ResolveError::provider(format!("HTTP {status}: {body}"))
    }
}

async fn error_from_response(response: reqwest::Response) -> ResolveError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    classify_status(status, &body)
}

// ============ embedding over HTTP ============

/// Embedding provider speaking the OpenAI-compatible `POST /embeddings`
/// shape: `{"model": ..., "input": [...]}` in,
/// `{"data": [{"embedding": [...]}]}` out.
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dims: usize,
}

impl HttpEmbedder {
    pub fn from_config(config: &ProviderConfig, timeout: Duration) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| ResolveError::config("embedding provider requires a model"))?;
        let dims = config
            .dims
            .ok_or_else(|| ResolveError::config("embedding provider requires dims"))?;

        Ok(Self {
            client: build_client(timeout)?,
            endpoint: config.endpoint.clone(),
            api_key: api_key_for(config)?,
            model,
            dims,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ResolveError::provider(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ResolveError::provider(e.to_string()))?;

        parse_embedding(&json, self.dims)
    }
}

/// Extract `data[0].embedding` from an embeddings response. Any missing or
/// non-numeric element is a malformed response, not a zero.
fn parse_embedding(json: &serde_json::Value, dims: usize) -> Result<Vec<f32>> {
    let embedding = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| ResolveError::provider("malformed embedding response"))?;

    let mut vector = Vec::with_capacity(embedding.len());
    for value in embedding {
        let value = value
            .as_f64()
            .ok_or_else(|| ResolveError::provider("malformed embedding response"))?;
        vector.push(value as f32);
    }

    if vector.len() != dims {
        return Err(ResolveError::DimensionMismatch {
            expected: dims,
            actual: vector.len(),
        });
    }

    Ok(vector)
}

// ============ web search over HTTP ============

/// Web search provider speaking a JSON GET API:
/// `GET {endpoint}?q=...&count=N` returning
/// `{"results": [{"title", "snippet", "url", "relevance"?}]}`.
///
/// Hits without a reported relevance are passed through unscored; the
/// resolution policy supplies the nominal confidence.
pub struct HttpWebSearcher {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpWebSearcher {
    pub fn from_config(config: &ProviderConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint: config.endpoint.clone(),
            api_key: api_key_for(config)?,
        })
    }
}

#[async_trait]
impl WebSearcher for HttpWebSearcher {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<WebHit>> {
        let mut request = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("count", &limit.to_string())]);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ResolveError::provider(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ResolveError::provider(e.to_string()))?;

        let items = json
            .get("results")
            .and_then(|r| r.as_array())
            .ok_or_else(|| ResolveError::provider("malformed web search response"))?;

        let hits = items
            .iter()
            .take(limit)
            .map(|item| WebHit {
                title: str_field(item, "title"),
                snippet: str_field(item, "snippet"),
                url: str_field(item, "url"),
                relevance: item.get("relevance").and_then(|v| v.as_f64()),
            })
            .collect();

        Ok(hits)
    }
}

fn str_field(value: &serde_json::Value, field: &str) -> String {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

// ============ generation over HTTP ============

/// LLM provider speaking the chat-completions shape:
/// `{"model", "messages": [...]}` in,
/// `{"choices": [{"message": {"content"}}], "certainty"?}` out.
pub struct HttpGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    params: serde_json::Value,
}

const SYSTEM_PROMPT: &str =
    "You are a technical advisor. Answer the requirement concisely; say so if unsure.";

impl HttpGenerator {
    pub fn from_config(config: &ProviderConfig, timeout: Duration) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| ResolveError::config("llm provider requires a model"))?;

        Ok(Self {
            client: build_client(timeout)?,
            endpoint: config.endpoint.clone(),
            api_key: api_key_for(config)?,
            model,
            params: config.params.clone(),
        })
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, prompt: &str, context: Option<&str>) -> Result<Generation> {
        let user_message = match context {
            Some(ctx) => format!("Requirement:\n{prompt}\n\nRelevant material:\n{ctx}"),
            None => format!("Requirement:\n{prompt}"),
        };

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": user_message},
            ],
        });
        if let (Some(body_map), Some(params)) = (body.as_object_mut(), self.params.as_object()) {
            for (k, v) in params {
                body_map.insert(k.clone(), v.clone());
            }
        }

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ResolveError::provider(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ResolveError::provider(e.to_string()))?;

        let text = json
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|choice| choice.pointer("/message/content"))
            .and_then(|t| t.as_str())
            .ok_or_else(|| ResolveError::provider("malformed generation response"))?
            .to_string();

        let certainty = json.get("certainty").and_then(|v| v.as_f64());

        Ok(Generation { text, certainty })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        let err = classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(err, ResolveError::QuotaExceeded { .. }));

        let err = classify_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert!(matches!(err, ResolveError::Provider { .. }));
    }

    #[test]
    fn test_parse_embedding_rejects_non_numeric() {
        let good = serde_json::json!({"data": [{"embedding": [0.1, -0.2, 0.3]}]});
        assert_eq!(parse_embedding(&good, 3).unwrap(), vec![0.1f32, -0.2, 0.3]);

        let bad = serde_json::json!({"data": [{"embedding": [0.1, "oops", 0.3]}]});
        assert!(matches!(
            parse_embedding(&bad, 3),
            Err(ResolveError::Provider { .. })
        ));

        let missing = serde_json::json!({"data": []});
        assert!(parse_embedding(&missing, 3).is_err());

        let wrong_dims = serde_json::json!({"data": [{"embedding": [0.1, 0.2]}]});
        assert!(matches!(
            parse_embedding(&wrong_dims, 3),
            Err(ResolveError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_api_key_requires_env() {
        let config = ProviderConfig {
            id: 1,
            name: "test".into(),
            kind: crate::models::ProviderKind::Embedding,
            endpoint: "http://localhost/embeddings".into(),
            credentials_ref: Some("REQSOLVE_TEST_KEY_THAT_IS_NOT_SET".into()),
            model: Some("m".into()),
            params: serde_json::json!({}),
            dims: Some(4),
            is_default: true,
            is_active: true,
        };
        assert!(api_key_for(&config).is_err());

        let without = ProviderConfig {
            credentials_ref: None,
            ..config
        };
        assert!(api_key_for(&without).unwrap().is_none());
    }
}
