//! Core domain types for the icarium image builder.
//!
//! This crate contains:
//! - Build trigger events decoded from the push queue
//! - Repository build configuration and ref matching
//! - Build credentials
//! - Build identifiers and common error types

pub mod error;
pub mod event;
pub mod id;
pub mod repository;
pub mod secret;

pub use error::{Error, Result};
pub use event::{Action, BuildTriggerEvent, GitProvider};
pub use id::BuildId;
pub use repository::{BuildRule, RefName, RepositoryConfig, RuleKind};
pub use secret::BuildCredential;
