use keyalloc_allocator::AllocatorError;
use keyalloc_keyspace::{KeySpaceError, StoreError};
use thiserror::Error;

use crate::invariants::Violation;

pub type TestingResult<T> = Result<T, TestingError>;

#[derive(Debug, Error)]
pub enum TestingError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("keyspace error: {0}")]
    KeySpace(#[from] KeySpaceError),

    #[error("allocator error: {0}")]
    Allocator(#[from] AllocatorError),

    #[error("fixture rejected: {0}")]
    Rejected(String),

    #[error("key not found: {0}")]
    Missing(String),

    #[error("mirror stalled at revision {mirror}, store at {store}")]
    Stalled { mirror: i64, store: i64 },

    #[error("fleet did not converge within {passes} passes")]
    NotConverged { passes: usize },

    #[error("invariant violated: {0}")]
    Invariant(#[from] Violation),
}
