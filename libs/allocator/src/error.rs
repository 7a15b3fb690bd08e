//! Allocator errors.

use keyalloc_keyspace::{KeySpaceError, StoreError};
use thiserror::Error;

/// Result type for allocator operations.
pub type AllocatorResult<T> = Result<T, AllocatorError>;

/// Fatal allocator errors.
///
/// Transaction conflicts are not errors: the round is retried from a fresh
/// snapshot. Rounds that change nothing are reported through the round hook.
#[derive(Debug, Error)]
pub enum AllocatorError {
    /// The mirror failed (decode error or watch gap).
    #[error("keyspace error: {0}")]
    KeySpace(#[from] KeySpaceError),

    /// The store rejected a request. Backoff is the caller's concern.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The local Member key is not present in the keyspace.
    #[error("local member {0} not found in keyspace")]
    MemberNotFound(String),

    /// Shutdown was signalled before drain completion.
    #[error("allocator cancelled")]
    Cancelled,
}
