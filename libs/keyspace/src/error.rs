//! Error types for store access, decoding and mirroring.

use thiserror::Error;

/// Errors returned by a [`Store`](crate::Store) implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached. Retry policy belongs to the caller.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The requested revision has been compacted away.
    #[error("revision {requested} has been compacted (compacted through {compacted})")]
    Compacted { requested: i64, compacted: i64 },

    /// The watch stream was closed by the store.
    #[error("watch stream closed")]
    Closed,
}

/// A stored key or value could not be decoded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The key does not match the keyspace layout.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// The value could not be parsed.
    #[error("invalid value at {key:?}: {reason}")]
    InvalidValue { key: String, reason: String },

    /// The "R" attribute was negative.
    #[error("negative R ({value}) at {key:?}")]
    NegativeReplication { key: String, value: i64 },
}

impl DecodeError {
    pub(crate) fn invalid_key(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_value(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors from loading or watching the keyspace mirror.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeySpaceError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The watch stream skipped or reordered revisions. Requires a reload.
    #[error("watch gap: mirror at revision {mirror}, received revision {received}")]
    WatchGap { mirror: i64, received: i64 },

    /// `watch` was called before a successful `load`.
    #[error("keyspace has not been loaded")]
    NotLoaded,
}

impl KeySpaceError {
    /// Returns true if the mirror must be reloaded from scratch.
    pub fn requires_reload(&self) -> bool {
        matches!(
            self,
            Self::WatchGap { .. } | Self::Store(StoreError::Compacted { .. })
        )
    }
}
