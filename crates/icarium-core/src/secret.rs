//! Build credentials.

use std::fmt;

/// An access token used to check out source for one owner.
///
/// The value is only reachable through [`BuildCredential::expose`]; `Debug`
/// prints a placeholder so the token cannot leak through log fields.
#[derive(Clone, PartialEq, Eq)]
pub struct BuildCredential(String);

impl BuildCredential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Replace every occurrence of the secret in `text`.
    pub fn redact(&self, text: &str) -> String {
        if self.is_empty() {
            return text.to_string();
        }
        text.replace(&self.0, "[REDACTED]")
    }
}

impl fmt::Debug for BuildCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BuildCredential([REDACTED])")
    }
}
