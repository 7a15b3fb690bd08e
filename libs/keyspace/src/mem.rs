//! In-process reference store.
//!
//! `MemStore` implements [`Store`] over a `BTreeMap`, with the revision,
//! watch and compare semantics the allocator relies on. It backs tests and
//! the simulator; production deployments substitute a real replicated
//! store.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

use crate::error::StoreError;
use crate::store::{
    Compare, Event, KeyValue, Op, RangeResponse, Store, Txn, TxnResponse, WatchResponse,
    WatchStream,
};

/// In-memory, single-process implementation of [`Store`].
pub struct MemStore {
    inner: Mutex<Inner>,
}

struct Inner {
    revision: i64,
    compacted: i64,
    kvs: BTreeMap<String, KeyValue>,
    /// Deleted keys and the revision of their deletion.
    tombstones: BTreeMap<String, i64>,
    /// Key state as of `compacted`.
    base: BTreeMap<String, KeyValue>,
    /// Committed revisions after `compacted`, oldest first.
    history: Vec<WatchResponse>,
    watchers: Vec<Watcher>,
    unavailable: bool,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<Result<WatchResponse, StoreError>>,
}

impl MemStore {
    /// Create an empty store at revision 0.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                revision: 0,
                compacted: 0,
                kvs: BTreeMap::new(),
                tombstones: BTreeMap::new(),
                base: BTreeMap::new(),
                history: Vec::new(),
                watchers: Vec::new(),
                unavailable: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current store revision.
    pub fn revision(&self) -> i64 {
        self.lock().revision
    }

    /// Latest value of `key`, if present.
    pub fn get(&self, key: &str) -> Option<KeyValue> {
        self.lock().kvs.get(key).cloned()
    }

    /// Number of live keys under `prefix`.
    pub fn count_prefix(&self, prefix: &str) -> usize {
        under_prefix(&self.lock().kvs, prefix).count()
    }

    /// Discard history through `revision`. Watches and reads before it fail
    /// with [`StoreError::Compacted`].
    pub fn compact(&self, revision: i64) {
        let mut inner = self.lock();
        let revision = revision.min(inner.revision);
        if revision <= inner.compacted {
            return;
        }
        let split = inner.history.partition_point(|r| r.revision <= revision);
        let drained: Vec<WatchResponse> = inner.history.drain(..split).collect();
        for response in &drained {
            apply_events(&mut inner.base, &response.events);
        }
        inner.tombstones.retain(|_, rev| *rev > revision);
        inner.compacted = revision;
        debug!(revision, "Compacted store history");
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Close every open watch stream.
    pub fn close_watches(&self) {
        self.lock().watchers.clear();
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("store marked unavailable".to_string()));
        }
        Ok(())
    }

    fn compare_holds(&self, compare: &Compare) -> bool {
        match compare {
            Compare::ModRevision { key, revision } => {
                let current = self.kvs.get(key).map(|kv| kv.mod_revision).unwrap_or(0);
                current == *revision
            }
            Compare::PrefixUnchanged { prefix, revision } => {
                // Tombstones before the compaction point are gone.
                if *revision < self.compacted {
                    return false;
                }
                let modified = self
                    .kvs
                    .range(prefix.clone()..)
                    .take_while(|(k, _)| k.starts_with(prefix.as_str()))
                    .any(|(_, kv)| kv.mod_revision > *revision);
                let deleted = self
                    .tombstones
                    .range(prefix.clone()..)
                    .take_while(|(k, _)| k.starts_with(prefix.as_str()))
                    .any(|(_, rev)| *rev > *revision);
                !modified && !deleted
            }
        }
    }

    fn publish(&mut self, response: &WatchResponse) {
        self.watchers.retain(|watcher| {
            let events: Vec<Event> = response
                .events
                .iter()
                .filter(|e| e.key().starts_with(&watcher.prefix))
                .cloned()
                .collect();
            if events.is_empty() {
                return !watcher.tx.is_closed();
            }
            watcher
                .tx
                .send(Ok(WatchResponse {
                    revision: response.revision,
                    events,
                }))
                .is_ok()
        });
    }
}

fn apply_events(kvs: &mut BTreeMap<String, KeyValue>, events: &[Event]) {
    for event in events {
        match event {
            Event::Put(kv) => {
                kvs.insert(kv.key.clone(), kv.clone());
            }
            Event::Delete { key, .. } => {
                kvs.remove(key);
            }
        }
    }
}

fn under_prefix<'a>(
    kvs: &'a BTreeMap<String, KeyValue>,
    prefix: &'a str,
) -> impl Iterator<Item = &'a KeyValue> + 'a {
    kvs.range(prefix.to_string()..)
        .take_while(move |(k, _)| k.starts_with(prefix))
        .map(|(_, kv)| kv)
}

#[async_trait]
impl Store for MemStore {
    async fn range(&self, prefix: &str, revision: i64) -> Result<RangeResponse, StoreError> {
        let inner = self.lock();
        inner.check_available()?;

        if revision == 0 || revision >= inner.revision {
            return Ok(RangeResponse {
                revision: inner.revision,
                kvs: under_prefix(&inner.kvs, prefix).cloned().collect(),
            });
        }
        if revision < inner.compacted {
            return Err(StoreError::Compacted {
                requested: revision,
                compacted: inner.compacted,
            });
        }

        let mut at = inner.base.clone();
        for response in inner.history.iter().take_while(|r| r.revision <= revision) {
            apply_events(&mut at, &response.events);
        }
        Ok(RangeResponse {
            revision,
            kvs: under_prefix(&at, prefix).cloned().collect(),
        })
    }

    async fn watch(&self, prefix: &str, from_revision: i64) -> Result<WatchStream, StoreError> {
        let mut inner = self.lock();
        inner.check_available()?;

        if inner.compacted > 0 && from_revision <= inner.compacted {
            return Err(StoreError::Compacted {
                requested: from_revision,
                compacted: inner.compacted,
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for response in inner.history.iter().filter(|r| r.revision >= from_revision) {
            let events: Vec<Event> = response
                .events
                .iter()
                .filter(|e| e.key().starts_with(prefix))
                .cloned()
                .collect();
            if !events.is_empty() {
                // The receiver is held below, so the send cannot fail.
                let _ = tx.send(Ok(WatchResponse {
                    revision: response.revision,
                    events,
                }));
            }
        }
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        debug!(prefix, from_revision, "Registered watch");

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse, StoreError> {
        let mut inner = self.lock();
        inner.check_available()?;

        if !txn.compares.iter().all(|c| inner.compare_holds(c)) {
            trace!(revision = inner.revision, "Transaction compare failed");
            return Ok(TxnResponse {
                succeeded: false,
                revision: inner.revision,
            });
        }

        let revision = inner.revision + 1;
        let mut events = Vec::with_capacity(txn.ops.len());
        for op in txn.ops {
            match op {
                Op::Put { key, value } => {
                    let create_revision = inner
                        .kvs
                        .get(&key)
                        .map(|kv| kv.create_revision)
                        .unwrap_or(revision);
                    let kv = KeyValue {
                        key: key.clone(),
                        value,
                        create_revision,
                        mod_revision: revision,
                    };
                    inner.tombstones.remove(&key);
                    inner.kvs.insert(key, kv.clone());
                    events.push(Event::Put(kv));
                }
                Op::Delete { key } => {
                    if inner.kvs.remove(&key).is_some() {
                        inner.tombstones.insert(key.clone(), revision);
                        events.push(Event::Delete {
                            key,
                            mod_revision: revision,
                        });
                    }
                }
            }
        }

        if events.is_empty() {
            return Ok(TxnResponse {
                succeeded: true,
                revision: inner.revision,
            });
        }

        inner.revision = revision;
        let response = WatchResponse { revision, events };
        inner.publish(&response);
        inner.history.push(response);

        Ok(TxnResponse {
            succeeded: true,
            revision,
        })
    }
}
