//! Handling of a single build trigger.

use async_trait::async_trait;
use icarium_builder::{BuildPipeline, BuildStage, BuiltImage, PipelineError};
use icarium_core::{BuildId, BuildTriggerEvent};
use icarium_db::{CredentialStore, DbError, RepositoryStore};
use std::sync::Arc;
use tracing::{info, warn};

/// How a trigger ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Built(BuiltImage),
    /// The repository has configuration but no rule matches the ref.
    NoMatchingRule,
    /// The repository has no configuration at all.
    RepositoryNotConfigured,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("rejected event: {0}")]
    Event(#[source] icarium_core::Error),

    #[error("configuration store error: {0}")]
    ConfigStore(#[source] DbError),

    #[error("invalid build rule: {0}")]
    Rule(#[source] icarium_core::Error),

    #[error("credential store error: {0}")]
    CredentialStore(#[source] DbError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl BuildError {
    /// Pipeline stage that failed. Anything before the pipeline counts as `Prepare`.
    pub fn stage(&self) -> Option<BuildStage> {
        match self {
            BuildError::Pipeline(e) => e.stage(),
            _ => Some(BuildStage::Prepare),
        }
    }
}

/// Handles one decoded `build` event.
#[async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn handle(&self, event: BuildTriggerEvent) -> Result<BuildOutcome, BuildError>;
}

/// Resolves configuration for an event and runs the pipeline on a match.
pub struct BuildService {
    repositories: Arc<dyn RepositoryStore>,
    credentials: Arc<dyn CredentialStore>,
    pipeline: BuildPipeline,
}

impl BuildService {
    pub fn new(
        repositories: Arc<dyn RepositoryStore>,
        credentials: Arc<dyn CredentialStore>,
        pipeline: BuildPipeline,
    ) -> Self {
        Self {
            repositories,
            credentials,
            pipeline,
        }
    }
}

#[async_trait]
impl TriggerHandler for BuildService {
    async fn handle(&self, event: BuildTriggerEvent) -> Result<BuildOutcome, BuildError> {
        let id = BuildId::new();
        info!(
            build_id = %id,
            provider = %event.provider,
            repo = %event.repository_full_name,
            git_ref = %event.r#ref,
            commit = %event.commit,
            "Handling build trigger"
        );

        let provider = event.provider().map_err(BuildError::Event)?;

        let Some(repository) = self
            .repositories
            .get(provider, &event.repository_full_name)
            .await
            .map_err(BuildError::ConfigStore)?
        else {
            info!(build_id = %id, repo = %event.repository_full_name, "Repository not configured");
            return Ok(BuildOutcome::RepositoryNotConfigured);
        };

        let Some(rule) = repository
            .find_matching_rule(&event.r#ref)
            .map_err(BuildError::Rule)?
        else {
            info!(build_id = %id, git_ref = %event.r#ref, "No build rule matches ref");
            return Ok(BuildOutcome::NoMatchingRule);
        };

        let credential = self
            .credentials
            .get(&repository.owner_username)
            .await
            .map_err(BuildError::CredentialStore)?;
        if credential.is_none() {
            warn!(build_id = %id, owner = %repository.owner_username, "No credential for owner");
        }

        let built = self
            .pipeline
            .build(id, &repository, rule, &event, credential.as_ref())
            .await?;

        info!(build_id = %id, image = %built.reference, pushed = built.pushed, "Build finished");
        Ok(BuildOutcome::Built(built))
    }
}
