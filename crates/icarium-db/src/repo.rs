//! Store traits and implementations.

pub mod identity;
pub mod repository;

pub use identity::{CredentialStore, MemoryCredentialStore, PgCredentialStore};
pub use repository::{
    MemoryRepositoryStore, PgRepositoryStore, RepositoryStore, RuleRecord,
};
