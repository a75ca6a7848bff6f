//! Build trigger events received from the push queue.

use serde::{Deserialize, Serialize};

use crate::repository::RefName;
use crate::{Error, Result};

/// Source-hosting provider a push came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitProvider {
    Github,
}

impl GitProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            GitProvider::Github => "github",
        }
    }
}

impl std::fmt::Display for GitProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GitProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "github" => Ok(GitProvider::Github),
            _ => Err(Error::UnsupportedProvider(s.to_string())),
        }
    }
}

/// What a queue message asks the builder to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    Build,
    Other(String),
}

impl From<String> for Action {
    fn from(value: String) -> Self {
        match value.as_str() {
            "build" => Action::Build,
            _ => Action::Other(value),
        }
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        match action {
            Action::Build => "build".to_string(),
            Action::Other(other) => other,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Build => f.write_str("build"),
            Action::Other(other) => f.write_str(other),
        }
    }
}

/// One decoded push notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTriggerEvent {
    pub action: Action,
    pub provider: String,
    /// `owner/name`
    pub repository_full_name: String,
    /// Pushed ref, e.g. `refs/heads/main` or `refs/tags/v1.0`.
    pub r#ref: String,
    /// Exact commit to build. This, not the ref tip, is what gets checked out.
    pub commit: String,
}

impl BuildTriggerEvent {
    pub fn provider(&self) -> Result<GitProvider> {
        self.provider.parse()
    }

    /// Split `repository_full_name` into owner and repository name.
    pub fn repository_parts(&self) -> Result<(&str, &str)> {
        match self.repository_full_name.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok((owner, name))
            }
            _ => Err(Error::InvalidInput(format!(
                "repository '{}' is not of the form owner/name",
                self.repository_full_name
            ))),
        }
    }

    pub fn ref_name(&self) -> Result<RefName<'_>> {
        RefName::parse(&self.r#ref)
    }
}
