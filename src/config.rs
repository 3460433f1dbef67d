use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Tunable resolution policy. Every value here is deployment policy, not a
/// hard-wired constant: thresholds, cache TTL, and worker count all vary by
/// corpus and provider quality.
#[derive(Debug, Deserialize, Clone)]
pub struct PolicyConfig {
    /// Minimum top cosine similarity for the semantic tier to answer.
    #[serde(default = "default_semantic_threshold")]
    pub semantic_threshold: f32,
    /// Minimum provider-reported relevance for the web tier to answer.
    #[serde(default = "default_web_threshold")]
    pub web_threshold: f64,
    /// Candidate count requested from the vector index.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Floor below which vector search candidates are discarded outright.
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    /// Lifetime of a cached search ranking, in seconds.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: i64,
    /// Concurrent requirement workers per task.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Nominal confidence for web answers when the provider reports none.
    #[serde(default = "default_web_confidence")]
    pub web_confidence: f64,
    /// Nominal confidence for LLM-generated answers when the provider
    /// reports no certainty.
    #[serde(default = "default_llm_confidence")]
    pub llm_confidence: f64,
    /// Consecutive storage failures tolerated before a task is failed.
    #[serde(default = "default_max_storage_failures")]
    pub max_consecutive_storage_failures: u32,
    /// Timeout for each external provider call, in seconds.
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            semantic_threshold: default_semantic_threshold(),
            web_threshold: default_web_threshold(),
            top_k: default_top_k(),
            min_score: default_min_score(),
            cache_ttl_secs: default_cache_ttl_secs(),
            concurrency: default_concurrency(),
            web_confidence: default_web_confidence(),
            llm_confidence: default_llm_confidence(),
            max_consecutive_storage_failures: default_max_storage_failures(),
            provider_timeout_secs: default_provider_timeout_secs(),
        }
    }
}

fn default_semantic_threshold() -> f32 {
    0.80
}
fn default_web_threshold() -> f64 {
    0.5
}
fn default_top_k() -> usize {
    5
}
fn default_min_score() -> f32 {
    0.25
}
fn default_cache_ttl_secs() -> i64 {
    3600
}
fn default_concurrency() -> usize {
    4
}
fn default_web_confidence() -> f64 {
    0.5
}
fn default_llm_confidence() -> f64 {
    0.3
}
fn default_max_storage_failures() -> u32 {
    3
}
fn default_provider_timeout_secs() -> u64 {
    30
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let p = &config.policy;

    if !(0.0..=1.0).contains(&p.semantic_threshold) {
        anyhow::bail!("policy.semantic_threshold must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&p.web_threshold) {
        anyhow::bail!("policy.web_threshold must be in [0.0, 1.0]");
    }
    if p.top_k == 0 {
        anyhow::bail!("policy.top_k must be >= 1");
    }
    if p.concurrency == 0 {
        anyhow::bail!("policy.concurrency must be >= 1");
    }
    if p.cache_ttl_secs <= 0 {
        anyhow::bail!("policy.cache_ttl_secs must be > 0");
    }
    if p.max_consecutive_storage_failures == 0 {
        anyhow::bail!("policy.max_consecutive_storage_failures must be >= 1");
    }

    Ok(())
}
