//! Repository configuration store.

use async_trait::async_trait;
use icarium_core::{BuildRule, GitProvider, RepositoryConfig};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::types::Json;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::{DbError, DbResult};

/// A build rule as stored in the `rules` column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleRecord {
    #[serde(rename = "type", default)]
    pub rule_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub docker_tag: String,
    #[serde(default)]
    pub dockerfile_location: String,
}

impl TryFrom<RuleRecord> for BuildRule {
    type Error = DbError;

    fn try_from(record: RuleRecord) -> DbResult<Self> {
        let kind = record
            .rule_type
            .parse()
            .map_err(|e: icarium_core::Error| DbError::InvalidRecord(e.to_string()))?;

        Ok(BuildRule {
            kind,
            name_pattern: record.name,
            image_tag: record.docker_tag,
            dockerfile_location: record.dockerfile_location,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RepositoryRow {
    full_name: String,
    username: String,
    rules: Json<Vec<RuleRecord>>,
}

impl TryFrom<RepositoryRow> for RepositoryConfig {
    type Error = DbError;

    fn try_from(row: RepositoryRow) -> DbResult<Self> {
        let build_rules = row
            .rules
            .0
            .into_iter()
            .map(BuildRule::try_from)
            .collect::<DbResult<Vec<_>>>()?;

        Ok(RepositoryConfig {
            repository_full_name: row.full_name,
            owner_username: row.username,
            build_rules,
        })
    }
}

/// Lookup of per-repository build configuration.
///
/// `Ok(None)` means the repository is not configured; only genuine store
/// failures are errors.
#[async_trait]
pub trait RepositoryStore: Send + Sync {
    async fn get(
        &self,
        provider: GitProvider,
        full_name: &str,
    ) -> DbResult<Option<RepositoryConfig>>;
}

/// PostgreSQL implementation of RepositoryStore.
pub struct PgRepositoryStore {
    pool: PgPool,
}

impl PgRepositoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RepositoryStore for PgRepositoryStore {
    async fn get(
        &self,
        provider: GitProvider,
        full_name: &str,
    ) -> DbResult<Option<RepositoryConfig>> {
        let row = sqlx::query_as::<_, RepositoryRow>(
            r#"
            SELECT full_name, username, rules
            FROM repositories
            WHERE provider = $1 AND full_name = $2
            "#,
        )
        .bind(provider.as_str())
        .bind(full_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RepositoryConfig::try_from).transpose()
    }
}

/// In-memory RepositoryStore for local runs and tests.
#[derive(Default)]
pub struct MemoryRepositoryStore {
    repositories: RwLock<HashMap<(GitProvider, String), RepositoryConfig>>,
}

impl MemoryRepositoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, provider: GitProvider, config: RepositoryConfig) {
        let mut repositories = self
            .repositories
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        repositories.insert((provider, config.repository_full_name.clone()), config);
    }
}

#[async_trait]
impl RepositoryStore for MemoryRepositoryStore {
    async fn get(
        &self,
        provider: GitProvider,
        full_name: &str,
    ) -> DbResult<Option<RepositoryConfig>> {
        let repositories = self
            .repositories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(repositories
            .get(&(provider, full_name.to_string()))
            .cloned())
    }
}
