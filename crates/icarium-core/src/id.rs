//! Build identifiers.

use derive_more::Display;
use uuid::Uuid;

/// Identifies one build attempt.
///
/// Every dispatched event gets a fresh id, so two builds of the same
/// repository and commit never share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("{_0}")]
pub struct BuildId(Uuid);

impl BuildId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BuildId {
    fn default() -> Self {
        Self::new()
    }
}
