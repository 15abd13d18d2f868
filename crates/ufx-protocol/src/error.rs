//! Error types for decoding index messages.

use thiserror::Error;

/// Errors raised while decoding a signed index.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed {message}: {source}")]
    Decode {
        /// Which message failed to decode.
        message: &'static str,
        #[source]
        source: prost::DecodeError,
    },

    #[error("update for version {version} carries {count} descriptions (at most 1 allowed)")]
    TooManyDescriptions { version: i32, count: usize },

    #[error("duplicate update for version {0}")]
    DuplicateVersion(i32),
}
