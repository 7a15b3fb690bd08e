//! # keyalloc-testing
//!
//! Shared test support for the keyalloc crates:
//! - [`fixtures`]: JSON values and conditional insert/update helpers
//! - [`Fleet`]: runs every Member's rounds in turn against a [`MemStore`]
//! - [`invariants`]: capacity, packing, replication and zone checks
//!
//! [`MemStore`]: keyalloc_keyspace::MemStore

pub mod fixtures;
pub mod invariants;

mod error;
mod fleet;

use std::sync::Once;

pub use error::{TestingError, TestingResult};
pub use fleet::{Fleet, FleetReport};
pub use invariants::Violation;

static INIT_TRACING: Once = Once::new();

/// Install a test-writer subscriber honoring `RUST_LOG`. Idempotent.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}
