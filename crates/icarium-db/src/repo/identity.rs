//! Credential store keyed by owner identity.

use async_trait::async_trait;
use icarium_core::BuildCredential;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::DbResult;

/// Lookup of the source-hosting token for an owner.
///
/// `Ok(None)` means no credential is configured. A stored but empty token is
/// returned as-is; deciding whether it is usable is left to the caller.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, username: &str) -> DbResult<Option<BuildCredential>>;
}

/// PostgreSQL implementation of CredentialStore.
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn get(&self, username: &str) -> DbResult<Option<BuildCredential>> {
        let row = sqlx::query_as::<_, (Option<String>,)>(
            "SELECT github_token FROM identities WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|(token,)| token).map(BuildCredential::new))
    }
}

/// In-memory CredentialStore for local runs and tests.
#[derive(Default)]
pub struct MemoryCredentialStore {
    tokens: RwLock<HashMap<String, BuildCredential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, username: impl Into<String>, credential: BuildCredential) {
        let mut tokens = self
            .tokens
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tokens.insert(username.into(), credential);
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, username: &str) -> DbResult<Option<BuildCredential>> {
        let tokens = self
            .tokens
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(tokens.get(username).cloned())
    }
}
