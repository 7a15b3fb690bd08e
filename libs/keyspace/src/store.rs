//! Store interface.
//!
//! The allocator depends only on three capabilities of the coordination
//! store:
//! - a ranged read at a single revision
//! - a prefix watch starting from a revision
//! - a conditional, all-or-nothing transaction
//!
//! Any linearizable, watchable key-value store can sit behind [`Store`].

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use crate::error::StoreError;

/// A stored key/value pair with its revisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision at which the key was created.
    pub create_revision: i64,
    /// Revision of the last modification.
    pub mod_revision: i64,
}

/// A single change observed on a watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Put(KeyValue),
    Delete { key: String, mod_revision: i64 },
}

impl Event {
    pub fn key(&self) -> &str {
        match self {
            Self::Put(kv) => &kv.key,
            Self::Delete { key, .. } => key,
        }
    }

    pub fn mod_revision(&self) -> i64 {
        match self {
            Self::Put(kv) => kv.mod_revision,
            Self::Delete { mod_revision, .. } => *mod_revision,
        }
    }
}

/// Result of a ranged read.
#[derive(Debug, Clone, Default)]
pub struct RangeResponse {
    /// Store revision the read was served at.
    pub revision: i64,
    /// Keys under the prefix, in key order.
    pub kvs: Vec<KeyValue>,
}

/// All events of one committed revision under the watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchResponse {
    pub revision: i64,
    pub events: Vec<Event>,
}

/// Stream of watch responses, in increasing revision order.
pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchResponse, StoreError>> + Send>>;

/// A guard evaluated atomically before a transaction applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    /// The key's mod revision equals `revision`. Zero means "key is absent".
    ModRevision { key: String, revision: i64 },

    /// No key under `prefix` was created, modified or deleted after
    /// `revision`.
    PrefixUnchanged { prefix: String, revision: i64 },
}

/// A write applied by a successful transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl Op {
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Conditional transaction: every compare must hold for any op to apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub ops: Vec<Op>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: Compare) -> Self {
        self.compares.push(compare);
        self
    }

    pub fn then(mut self, op: Op) -> Self {
        self.ops.push(op);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Result of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnResponse {
    /// False if a compare failed. Nothing was applied in that case.
    pub succeeded: bool,
    /// Store revision after the transaction (or current, on failure).
    pub revision: i64,
}

/// Coordination store used by the keyspace mirror and the allocator.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read every key under `prefix`. A `revision` of zero reads the latest
    /// state.
    async fn range(&self, prefix: &str, revision: i64) -> Result<RangeResponse, StoreError>;

    /// Watch `prefix` for changes at revisions `>= from_revision`.
    async fn watch(&self, prefix: &str, from_revision: i64) -> Result<WatchStream, StoreError>;

    /// Apply `txn` atomically if all of its compares hold.
    async fn txn(&self, txn: Txn) -> Result<TxnResponse, StoreError>;
}
