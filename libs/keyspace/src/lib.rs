//! # keyalloc-keyspace
//!
//! The allocator's view of the coordination store.
//!
//! - [`Store`]: the minimal interface the allocator needs from a
//!   replicated, versioned key-value store (ranged read, prefix watch,
//!   conditional transaction).
//! - [`MemStore`]: an in-process implementation for tests and simulation.
//! - [`KeyLayout`]: the `members/`, `items/` and `assignments/` subtrees.
//! - [`Decoder`]: pluggable decoding of stored values into [`Entity`].
//! - [`KeySpace`]: a watched mirror publishing immutable [`Snapshot`]s.
//!
//! ## Invariants
//!
//! - Snapshot revisions observed through one `KeySpace` only increase
//! - A snapshot is fully decoded or not published at all
//! - Watch deltas apply in strictly increasing revision order; anything else
//!   is a [`KeySpaceError::WatchGap`]

mod entity;
mod error;
mod keys;
mod mem;
mod mirror;
mod snapshot;
mod store;

pub use entity::{
    encode_assignment_value, Assignment, Decoder, Entity, Item, JsonDecoder, Member, CONSISTENT,
    PENDING,
};
pub use error::{DecodeError, KeySpaceError, StoreError};
pub use keys::{KeyLayout, ParsedKey};
pub use mem::MemStore;
pub use mirror::{cancelled, KeySpace, WaitOutcome};
pub use snapshot::{Entry, Snapshot};
pub use store::{
    Compare, Event, KeyValue, Op, RangeResponse, Store, Txn, TxnResponse, WatchResponse,
    WatchStream,
};
