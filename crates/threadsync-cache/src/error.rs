//! Error types for the entity cache.

use thiserror::Error;

/// Errors that can occur while persisting or restoring cached entities.
///
/// None of these are recoverable locally: callers are expected to drop the
/// store and rehydrate it from scratch.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Reading or writing a blob failed.
    #[error("blob store I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// A store's map could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The blob store cannot be used as configured.
    #[error("blob store error: {0}")]
    Persist(String),
}
