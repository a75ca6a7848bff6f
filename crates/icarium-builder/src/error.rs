//! Pipeline error types.

use derive_more::Display;
use std::time::Duration;
use thiserror::Error;

/// Step of the pipeline an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BuildStage {
    #[display("prepare")]
    Prepare,
    #[display("workspace")]
    Workspace,
    #[display("checkout")]
    Checkout,
    #[display("image build")]
    ImageBuild,
    #[display("image push")]
    ImagePush,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no build credential configured for '{0}'")]
    MissingCredential(String),

    #[error("invalid build request: {0}")]
    InvalidRequest(#[from] icarium_core::Error),

    #[error("workspace error: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("checkout failed: {0}")]
    Checkout(String),

    #[error("image build failed: {0}")]
    ImageBuild(String),

    #[error("image push failed: {0}")]
    ImagePush(String),

    #[error("build timed out after {0:?}")]
    Timeout(Duration),
}

impl PipelineError {
    /// Stage the failure belongs to. Timeouts are not tied to one stage.
    pub fn stage(&self) -> Option<BuildStage> {
        match self {
            PipelineError::MissingCredential(_) | PipelineError::InvalidRequest(_) => {
                Some(BuildStage::Prepare)
            }
            PipelineError::Workspace(_) => Some(BuildStage::Workspace),
            PipelineError::Checkout(_) => Some(BuildStage::Checkout),
            PipelineError::ImageBuild(_) => Some(BuildStage::ImageBuild),
            PipelineError::ImagePush(_) => Some(BuildStage::ImagePush),
            PipelineError::Timeout(_) => None,
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
