//! # keyalloc-allocator
//!
//! Decentralized allocation of replicated Items to capacity-limited Members.
//!
//! There is no leader: every Member runs [`allocate`], which repeatedly
//! observes a [`Snapshot`](keyalloc_keyspace::Snapshot) of the shared
//! keyspace, computes its own share of a deterministic plan
//! ([`engine::propose`]) and submits it as one conditional transaction.
//! Concurrent rounds by different Members serialize through the store's
//! compare-and-swap; a loser simply re-plans on a newer snapshot.
//!
//! ## Invariants
//!
//! - A Member never holds more Assignments than its `ItemLimit` because of
//!   an addition
//! - An Item's Slots form a dense prefix `0..n` at every revision
//! - An Assignment is released only while the Item keeps
//!   `DesiredReplication` consistent Assignments without it
//! - An unchanged snapshot yields an empty proposal

pub mod driver;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod state;

pub use driver::{allocate, AllocateArgs, RoundHook, DEFAULT_ROUND_TIMEOUT};
pub use engine::{
    propose, EngineConfig, Proposal, RoundStats, DEFAULT_MAX_TXN_OPS, DEFAULT_REPAIR_BUDGET,
};
pub use error::{AllocatorError, AllocatorResult};
pub use metrics::{AllocatorMetrics, MetricsSnapshot};
pub use state::{
    has_consistency_shape, is_consistent, is_densely_packed, ConvergenceStatus, ObservedState,
};
