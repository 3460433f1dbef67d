//! Provider registry: named provider configs with per-kind defaults.
//!
//! Each provider kind (`llm`, `embedding`, `web_search`) has at most one
//! default config at a time; marking a new default atomically clears the
//! previous one in the same transaction. Defaults are cached in memory and
//! refreshed on every mutation, so the hot resolution path does not hit the
//! database per requirement.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;

use crate::error::{ResolveError, Result};
use crate::models::{ProviderConfig, ProviderKind};
use crate::providers::{
    CapabilitySource, Embedder, Generator, HttpEmbedder, HttpGenerator, HttpWebSearcher,
    WebSearcher,
};

/// Input for [`ProviderRegistry::create`].
#[derive(Debug, Clone)]
pub struct NewProvider {
    pub name: String,
    pub kind: ProviderKind,
    pub endpoint: String,
    pub credentials_ref: Option<String>,
    pub model: Option<String>,
    pub params: serde_json::Value,
    pub dims: Option<usize>,
    pub make_default: bool,
}

pub struct ProviderRegistry {
    pool: SqlitePool,
    defaults: RwLock<HashMap<ProviderKind, ProviderConfig>>,
    timeout: Duration,
}

impl ProviderRegistry {
    pub fn new(pool: SqlitePool, timeout: Duration) -> Self {
        Self {
            pool,
            defaults: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Load the current defaults into the in-memory cache.
    pub async fn reload(&self) -> Result<()> {
        let rows = sqlx::query(
            "SELECT * FROM provider_configs WHERE is_default = 1 AND is_active = 1",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut defaults = HashMap::new();
        for row in &rows {
            let config = config_from_row(row)?;
            defaults.insert(config.kind, config);
        }

        *self.defaults.write().await = defaults;
        Ok(())
    }

    /// The default active config for a kind.
    pub async fn get_default(&self, kind: ProviderKind) -> Result<ProviderConfig> {
        if let Some(config) = self.defaults.read().await.get(&kind) {
            return Ok(config.clone());
        }

        // Cache miss: the registry may not have been reloaded yet.
        let row = sqlx::query(
            "SELECT * FROM provider_configs WHERE kind = ? AND is_default = 1 AND is_active = 1",
        )
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let config = config_from_row(&row)?;
                self.defaults.write().await.insert(kind, config.clone());
                Ok(config)
            }
            None => Err(ResolveError::not_found(
                "provider",
                format!("{}/default", kind.as_str()),
            )),
        }
    }

    /// Look up a config by kind and name, active or not.
    pub async fn get_by_name(&self, kind: ProviderKind, name: &str) -> Result<ProviderConfig> {
        let row = sqlx::query("SELECT * FROM provider_configs WHERE kind = ? AND name = ?")
            .bind(kind.as_str())
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => config_from_row(&row),
            None => Err(ResolveError::not_found(
                "provider",
                format!("{}/{name}", kind.as_str()),
            )),
        }
    }

    /// List configs, optionally filtered by kind and activity. Defaults
    /// sort first, then insertion order.
    pub async fn list(
        &self,
        kind: Option<ProviderKind>,
        active_only: bool,
    ) -> Result<Vec<ProviderConfig>> {
        let rows = match kind {
            Some(kind) => {
                sqlx::query(
                    r#"
                    SELECT * FROM provider_configs
                    WHERE kind = ? AND (is_active = 1 OR ? = 0)
                    ORDER BY is_default DESC, id ASC
                    "#,
                )
                .bind(kind.as_str())
                .bind(active_only as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM provider_configs
                    WHERE is_active = 1 OR ? = 0
                    ORDER BY kind ASC, is_default DESC, id ASC
                    "#,
                )
                .bind(active_only as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(config_from_row).collect()
    }

    /// Register a provider config. With `make_default`, the previous
    /// default for the kind is demoted in the same transaction.
    pub async fn create(&self, new: &NewProvider) -> Result<ProviderConfig> {
        let mut tx = self.pool.begin().await?;

        if new.make_default {
            sqlx::query("UPDATE provider_configs SET is_default = 0 WHERE kind = ?")
                .bind(new.kind.as_str())
                .execute(&mut *tx)
                .await?;
        }

        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO provider_configs
                (name, kind, endpoint, credentials_ref, model, params_json, dims,
                 is_default, is_active, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(&new.name)
        .bind(new.kind.as_str())
        .bind(&new.endpoint)
        .bind(&new.credentials_ref)
        .bind(&new.model)
        .bind(new.params.to_string())
        .bind(new.dims.map(|d| d as i64))
        .bind(new.make_default as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.reload().await?;

        tracing::info!(name = %new.name, kind = new.kind.as_str(), "provider registered");

        Ok(ProviderConfig {
            id: result.last_insert_rowid(),
            name: new.name.clone(),
            kind: new.kind,
            endpoint: new.endpoint.clone(),
            credentials_ref: new.credentials_ref.clone(),
            model: new.model.clone(),
            params: new.params.clone(),
            dims: new.dims,
            is_default: new.make_default,
            is_active: true,
        })
    }

    /// Promote a named config to be its kind's default. The target must be
    /// active; an inactive config cannot serve traffic.
    pub async fn set_default(&self, kind: ProviderKind, name: &str) -> Result<()> {
        let target = self.get_by_name(kind, name).await?;
        if !target.is_active {
            return Err(ResolveError::config(format!(
                "provider {}/{name} is inactive and cannot be the default",
                kind.as_str()
            )));
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE provider_configs SET is_default = 0 WHERE kind = ?")
            .bind(kind.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE provider_configs SET is_default = 1 WHERE id = ?")
            .bind(target.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.reload().await?;
        tracing::info!(name, kind = kind.as_str(), "default provider changed");
        Ok(())
    }

    /// Deactivate a config. A deactivated default stops being the default;
    /// the kind then has no default until a new one is set.
    pub async fn deactivate(&self, kind: ProviderKind, name: &str) -> Result<()> {
        let target = self.get_by_name(kind, name).await?;

        sqlx::query("UPDATE provider_configs SET is_active = 0, is_default = 0 WHERE id = ?")
            .bind(target.id)
            .execute(&self.pool)
            .await?;

        self.reload().await?;
        tracing::info!(name, kind = kind.as_str(), "provider deactivated");
        Ok(())
    }
}

#[async_trait]
impl CapabilitySource for ProviderRegistry {
    async fn embedder(&self) -> Result<Arc<dyn Embedder>> {
        let config = self.get_default(ProviderKind::Embedding).await?;
        Ok(Arc::new(HttpEmbedder::from_config(&config, self.timeout)?))
    }

    async fn web_searcher(&self) -> Result<Arc<dyn WebSearcher>> {
        let config = self.get_default(ProviderKind::WebSearch).await?;
        Ok(Arc::new(HttpWebSearcher::from_config(
            &config,
            self.timeout,
        )?))
    }

    async fn generator(&self) -> Result<Arc<dyn Generator>> {
        let config = self.get_default(ProviderKind::Llm).await?;
        Ok(Arc::new(HttpGenerator::from_config(&config, self.timeout)?))
    }
}

fn config_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ProviderConfig> {
    let kind: String = row.get("kind");
    let params_json: String = row.get("params_json");
    let dims: Option<i64> = row.get("dims");

    Ok(ProviderConfig {
        id: row.get("id"),
        name: row.get("name"),
        kind: ProviderKind::parse(&kind)?,
        endpoint: row.get("endpoint"),
        credentials_ref: row.get("credentials_ref"),
        model: row.get("model"),
        params: serde_json::from_str(&params_json)?,
        dims: dims.map(|d| d as usize),
        is_default: row.get::<i64, _>("is_default") != 0,
        is_active: row.get::<i64, _>("is_active") != 0,
    })
}
