//! Watched, in-process mirror of the allocator keyspace.
//!
//! `KeySpace` owns the live [`Snapshot`]. [`KeySpace::load`] builds it from a
//! single ranged read; [`KeySpace::watch`] keeps it current by applying
//! watch deltas in revision order and publishing a successor snapshot.
//! Readers hold an `Arc<Snapshot>` for as long as they need a consistent
//! view; publication never blocks on them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, StreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::entity::Decoder;
use crate::error::{KeySpaceError, StoreError};
use crate::keys::KeyLayout;
use crate::snapshot::Snapshot;
use crate::store::Store;

/// Outcome of [`KeySpace::wait_for_revision`].
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    /// The mirror reached the requested revision.
    Reached(Arc<Snapshot>),
    /// The timeout fired first. Carries the latest snapshot.
    TimedOut(Arc<Snapshot>),
    /// Shutdown was signalled.
    Cancelled,
    /// The watch failed; the mirror will not advance until re-loaded.
    Failed(KeySpaceError),
}

/// Resolves once `shutdown` holds `true`. Never resolves if the sender is
/// dropped without signalling.
pub async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Mirror of the keyspace under one root.
pub struct KeySpace {
    layout: KeyLayout,
    decoder: Arc<dyn Decoder>,
    loaded: AtomicBool,
    tx: watch::Sender<Arc<Snapshot>>,
    failure: watch::Sender<Option<KeySpaceError>>,
}

impl KeySpace {
    /// Create an empty mirror for `root`.
    pub fn new(root: impl Into<String>, decoder: Arc<dyn Decoder>) -> Self {
        let layout = KeyLayout::new(root);
        let (tx, _) = watch::channel(Arc::new(Snapshot::empty(layout.clone())));
        let (failure, _) = watch::channel(None);
        Self {
            layout,
            decoder,
            loaded: AtomicBool::new(false),
            tx,
            failure,
        }
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.tx.borrow().clone()
    }

    pub fn revision(&self) -> i64 {
        self.tx.borrow().revision()
    }

    /// Receiver notified on every publication.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.tx.subscribe()
    }

    /// Replace the mirror with the subtree as of `revision` (zero: latest).
    ///
    /// Fails without touching the current snapshot if the read fails or any
    /// value cannot be decoded.
    #[instrument(skip(self, store), fields(root = %self.layout.root()))]
    pub async fn load(&self, store: &dyn Store, revision: i64) -> Result<(), KeySpaceError> {
        let response = store.range(&self.layout.prefix(), revision).await?;
        let snapshot = Snapshot::from_kvs(
            self.layout.clone(),
            response.revision,
            &response.kvs,
            self.decoder.as_ref(),
        )?;

        info!(
            revision = snapshot.revision(),
            members = snapshot.members().count(),
            items = snapshot.items().count(),
            assignments = snapshot.assignments().count(),
            "Loaded keyspace"
        );

        self.tx.send_replace(Arc::new(snapshot));
        self.failure.send_replace(None);
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Follow the store from the current snapshot revision until shutdown.
    ///
    /// Returns `Ok(())` on shutdown. A gap, reordering, decode failure or
    /// closed stream is fatal and is also reported to
    /// [`KeySpace::wait_for_revision`] callers. Either way the watch is not
    /// restartable: the mirror must be re-loaded before watching again.
    #[instrument(skip(self, store, shutdown), fields(root = %self.layout.root()))]
    pub async fn watch(
        &self,
        store: &dyn Store,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), KeySpaceError> {
        if !self.loaded.load(Ordering::SeqCst) {
            return Err(KeySpaceError::NotLoaded);
        }
        let result = self.follow(store, shutdown).await;
        self.loaded.store(false, Ordering::SeqCst);
        if let Err(e) = &result {
            self.failure.send_replace(Some(e.clone()));
        }
        result
    }

    async fn follow(
        &self,
        store: &dyn Store,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), KeySpaceError> {
        let from = self.revision() + 1;
        let mut stream = store.watch(&self.layout.prefix(), from).await?;
        debug!(from_revision = from, "Watching keyspace");

        loop {
            let first = tokio::select! {
                next = stream.next() => next,
                _ = cancelled(&mut shutdown) => {
                    info!(revision = self.revision(), "Keyspace watch shutting down");
                    return Ok(());
                }
            };

            let mut next = Snapshot::clone(&self.snapshot());
            let mut batches = 0usize;
            let mut pending = first;

            // Coalesce every response already queued into one publication.
            loop {
                let response = match pending {
                    Some(Ok(response)) => response,
                    Some(Err(e)) => {
                        error!(error = %e, "Keyspace watch failed");
                        return Err(e.into());
                    }
                    None => {
                        error!("Keyspace watch stream closed");
                        return Err(StoreError::Closed.into());
                    }
                };
                if let Err(e) = next.apply(&response, self.decoder.as_ref()) {
                    error!(error = %e, "Failed to apply keyspace delta");
                    return Err(e);
                }
                batches += 1;

                match stream.next().now_or_never() {
                    Some(more) => pending = more,
                    None => break,
                }
            }

            debug!(revision = next.revision(), batches, "Applied keyspace deltas");
            self.tx.send_replace(Arc::new(next));
        }
    }

    /// Wait until the mirror reaches `min_revision`, `timeout` elapses,
    /// shutdown is signalled, or the watch fails.
    pub async fn wait_for_revision(
        &self,
        min_revision: i64,
        timeout: Option<Duration>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> WaitOutcome {
        let mut rx = self.tx.subscribe();
        let mut failure = self.failure.subscribe();
        let deadline = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            reached = rx.wait_for(|s| s.revision() >= min_revision) => match reached {
                Ok(snapshot) => WaitOutcome::Reached(snapshot.clone()),
                // The sender lives in `self`; closing implies teardown.
                Err(_) => WaitOutcome::Cancelled,
            },
            failed = failure.wait_for(Option::is_some) => {
                match failed.ok().and_then(|e| e.clone()) {
                    Some(e) => WaitOutcome::Failed(e),
                    None => WaitOutcome::Cancelled,
                }
            }
            _ = deadline => WaitOutcome::TimedOut(self.snapshot()),
            _ = cancelled(shutdown) => WaitOutcome::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::JsonDecoder;
    use crate::mem::MemStore;
    use crate::store::{Op, Txn};

    fn put(key: &str, value: &str) -> Txn {
        Txn::new().then(Op::Put {
            key: key.to_string(),
            value: value.as_bytes().to_vec(),
        })
    }

    fn keyspace() -> Arc<KeySpace> {
        Arc::new(KeySpace::new("/root", Arc::new(JsonDecoder)))
    }

    #[tokio::test]
    async fn test_load_builds_snapshot() {
        let store = MemStore::new();
        store.txn(put("/root/members/zone-a/m1", r#"{"R": 3}"#)).await.unwrap();
        store.txn(put("/root/items/i1", r#"{"R": 1}"#)).await.unwrap();
        store.txn(put("/elsewhere/x", "ignored")).await.unwrap();

        let ks = keyspace();
        ks.load(&store, 0).await.unwrap();

        let snapshot = ks.snapshot();
        assert_eq!(snapshot.revision(), 3);
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn test_load_aborts_on_decode_error() {
        let store = MemStore::new();
        store.txn(put("/root/items/i1", r#"{"R": -1}"#)).await.unwrap();

        let ks = keyspace();
        let err = ks.load(&store, 0).await.unwrap_err();
        assert!(matches!(err, KeySpaceError::Decode(_)));
        assert_eq!(ks.revision(), 0);
    }

    #[tokio::test]
    async fn test_watch_requires_load() {
        let store = MemStore::new();
        let (_tx, rx) = watch::channel(false);
        assert_eq!(
            keyspace().watch(&store, rx).await.unwrap_err(),
            KeySpaceError::NotLoaded
        );
    }

    #[tokio::test]
    async fn test_watch_follows_store_until_shutdown() {
        let store = Arc::new(MemStore::new());
        store.txn(put("/root/items/i1", r#"{"R": 1}"#)).await.unwrap();

        let ks = keyspace();
        ks.load(store.as_ref(), 0).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn({
            let ks = Arc::clone(&ks);
            let store = Arc::clone(&store);
            async move { ks.watch(store.as_ref(), shutdown_rx).await }
        });

        store.txn(put("/root/items/i2", r#"{"R": 2}"#)).await.unwrap();

        let (_never, mut no_shutdown) = watch::channel(false);
        let outcome = ks
            .wait_for_revision(2, Some(Duration::from_secs(5)), &mut no_shutdown)
            .await;
        match outcome {
            WaitOutcome::Reached(snapshot) => {
                assert_eq!(snapshot.items().count(), 2);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        shutdown_tx.send(true).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_watch_after_shutdown_requires_reload() {
        let store = MemStore::new();
        store.txn(put("/root/items/i1", r#"{"R": 1}"#)).await.unwrap();
        let ks = keyspace();
        ks.load(&store, 0).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();
        ks.watch(&store, shutdown_rx.clone()).await.unwrap();
        assert_eq!(
            ks.watch(&store, shutdown_rx.clone()).await.unwrap_err(),
            KeySpaceError::NotLoaded
        );

        ks.load(&store, 0).await.unwrap();
        ks.watch(&store, shutdown_rx).await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_fails_on_bad_value() {
        let store = Arc::new(MemStore::new());
        let ks = keyspace();
        ks.load(store.as_ref(), 0).await.unwrap();

        store.txn(put("/root/items/i1", "nope")).await.unwrap();

        let (_tx, rx) = watch::channel(false);
        let err = ks.watch(store.as_ref(), rx).await.unwrap_err();
        assert!(matches!(err, KeySpaceError::Decode(_)));
    }

    #[tokio::test]
    async fn test_failure_reaches_waiters() {
        let store = Arc::new(MemStore::new());
        let ks = keyspace();
        ks.load(store.as_ref(), 0).await.unwrap();

        let (_tx, rx) = watch::channel(false);
        let task = tokio::spawn({
            let ks = Arc::clone(&ks);
            let store = Arc::clone(&store);
            async move { ks.watch(store.as_ref(), rx).await }
        });
        store.txn(put("/root/members/zone-a/m1", r#"{"R": "x"}"#)).await.unwrap();

        let (_never, mut no_shutdown) = watch::channel(false);
        let outcome = ks
            .wait_for_revision(5, Some(Duration::from_secs(5)), &mut no_shutdown)
            .await;
        assert!(matches!(outcome, WaitOutcome::Failed(KeySpaceError::Decode(_))));
        assert!(task.await.unwrap().is_err());

        // A fresh load clears the failure.
        store
            .txn(put("/root/members/zone-a/m1", r#"{"R": 1}"#))
            .await
            .unwrap();
        ks.load(store.as_ref(), 0).await.unwrap();
        let outcome = ks
            .wait_for_revision(1, Some(Duration::from_secs(5)), &mut no_shutdown)
            .await;
        assert!(matches!(outcome, WaitOutcome::Reached(_)));
    }

    #[tokio::test]
    async fn test_watch_after_compaction_is_a_gap() {
        let store = MemStore::new();
        store.txn(put("/root/items/i1", r#"{"R": 1}"#)).await.unwrap();

        let ks = keyspace();
        ks.load(&store, 0).await.unwrap();

        store.txn(put("/root/items/i2", r#"{"R": 1}"#)).await.unwrap();
        store.txn(put("/root/items/i3", r#"{"R": 1}"#)).await.unwrap();
        store.compact(3);

        let (_tx, rx) = watch::channel(false);
        let err = ks.watch(&store, rx).await.unwrap_err();
        assert!(err.requires_reload());
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let ks = keyspace();
        let (_tx, mut rx) = watch::channel(false);
        let outcome = ks
            .wait_for_revision(10, Some(Duration::from_millis(10)), &mut rx)
            .await;
        assert!(matches!(outcome, WaitOutcome::TimedOut(_)));
    }

    #[tokio::test]
    async fn test_wait_cancelled() {
        let ks = keyspace();
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        let outcome = ks.wait_for_revision(10, None, &mut rx).await;
        assert!(matches!(outcome, WaitOutcome::Cancelled));
    }
}
