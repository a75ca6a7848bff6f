//! Error types for icarium.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid ref '{0}': expected at least two '/'-separated components")]
    InvalidRef(String),

    #[error("invalid rule pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),
}

pub type Result<T> = std::result::Result<T, Error>;
