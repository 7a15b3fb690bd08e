//! Sequential fleet simulator.
//!
//! Runs one allocation round per Member in turn, each against the latest
//! revision, and checks packing and capacity after every commit. Rounds are
//! the same [`propose`] the driver uses; only the scheduling differs, which
//! makes convergence bounds reproducible.

use std::sync::Arc;
use std::time::Duration;

use keyalloc_allocator::{propose, EngineConfig, ObservedState, Proposal, RoundStats};
use keyalloc_keyspace::{
    JsonDecoder, KeyLayout, KeySpace, KeySpaceError, MemStore, Snapshot, Store, WaitOutcome,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{TestingError, TestingResult};
use crate::fixtures::{insert, item_value, member_value, update};
use crate::invariants::{check_dense, member_loads, Violation};

const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// Totals across every round a [`Fleet`] ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FleetReport {
    pub passes: usize,
    pub rounds: u64,
    pub commits: u64,
    pub conflicts: u64,
    pub stats: RoundStats,
}

/// Members of one keyspace, driven round by round.
pub struct Fleet {
    store: Arc<MemStore>,
    keyspace: Arc<KeySpace>,
    engine: EngineConfig,
    shutdown: watch::Sender<bool>,
    watcher: JoinHandle<Result<(), KeySpaceError>>,
    report: FleetReport,
}

impl Fleet {
    /// Load and start watching `root` in `store`.
    pub async fn start(store: Arc<MemStore>, root: &str) -> TestingResult<Self> {
        let keyspace = Arc::new(KeySpace::new(root, Arc::new(JsonDecoder)));
        keyspace.load(store.as_ref(), 0).await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let watcher = tokio::spawn({
            let keyspace = Arc::clone(&keyspace);
            let store = Arc::clone(&store);
            async move { keyspace.watch(store.as_ref(), shutdown_rx).await }
        });

        Ok(Self {
            store,
            keyspace,
            engine: EngineConfig::default(),
            shutdown,
            watcher,
            report: FleetReport::default(),
        })
    }

    pub fn with_engine_config(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn store(&self) -> &Arc<MemStore> {
        &self.store
    }

    pub fn layout(&self) -> &KeyLayout {
        self.keyspace.layout()
    }

    pub fn report(&self) -> FleetReport {
        self.report
    }

    /// Create Members `(zone, id)` with `item_limit`.
    pub async fn add_members(&self, members: &[(&str, &str)], item_limit: u32) -> TestingResult<()> {
        let kvs: Vec<(String, String)> = members
            .iter()
            .map(|(zone, id)| (self.layout().member_key(zone, id), member_value(item_limit)))
            .collect();
        insert(self.store.as_ref(), &kvs).await?;
        Ok(())
    }

    /// Change the `ItemLimit` of existing Members.
    pub async fn set_limit(&self, members: &[(&str, &str)], item_limit: u32) -> TestingResult<()> {
        let kvs: Vec<(String, String)> = members
            .iter()
            .map(|(zone, id)| (self.layout().member_key(zone, id), member_value(item_limit)))
            .collect();
        update(self.store.as_ref(), &kvs).await?;
        Ok(())
    }

    /// Create Items with `desired_replication`, in batches.
    pub async fn add_items(&self, ids: &[String], desired_replication: u32) -> TestingResult<()> {
        for chunk in ids.chunks(256) {
            let kvs: Vec<(String, String)> = chunk
                .iter()
                .map(|id| (self.layout().item_key(id), item_value(desired_replication)))
                .collect();
            insert(self.store.as_ref(), &kvs).await?;
        }
        Ok(())
    }

    /// Change the `DesiredReplication` of existing Items.
    pub async fn set_replication(&self, ids: &[&str], desired_replication: u32) -> TestingResult<()> {
        let kvs: Vec<(String, String)> = ids
            .iter()
            .map(|id| (self.layout().item_key(id), item_value(desired_replication)))
            .collect();
        update(self.store.as_ref(), &kvs).await?;
        Ok(())
    }

    /// Wait until the mirror has caught up with the store.
    pub async fn sync(&self) -> TestingResult<Arc<Snapshot>> {
        let target = self.store.revision();
        let (_, mut never) = watch::channel(false);
        match self
            .keyspace
            .wait_for_revision(target, Some(SYNC_TIMEOUT), &mut never)
            .await
        {
            WaitOutcome::Reached(snapshot) => Ok(snapshot),
            WaitOutcome::TimedOut(snapshot) => Err(TestingError::Stalled {
                mirror: snapshot.revision(),
                store: target,
            }),
            WaitOutcome::Failed(e) => Err(e.into()),
            WaitOutcome::Cancelled => Err(TestingError::Stalled {
                mirror: self.keyspace.revision(),
                store: target,
            }),
        }
    }

    /// Run and commit one round for Member `(zone, id)`.
    pub async fn round(&mut self, zone: &str, id: &str) -> TestingResult<Proposal> {
        let snapshot = self.sync().await?;
        let state = ObservedState::new(Arc::clone(&self.keyspace), zone, id);
        let proposal = propose(&snapshot, &state, &self.engine)?;
        self.report.rounds += 1;

        if proposal.is_empty() {
            return Ok(proposal);
        }

        let response = self.store.txn(proposal.txn.clone()).await?;
        if !response.succeeded {
            self.report.conflicts += 1;
            return Ok(proposal);
        }
        self.report.commits += 1;
        self.report.stats.merge(&proposal.stats);

        let after = self.sync().await?;
        check_dense(&after)?;
        if proposal.stats.added > 0 {
            let load = member_loads(&after)
                .get(state.local_key())
                .copied()
                .unwrap_or(0);
            let limit = state
                .local_member(&after)
                .map(|(_, m)| m.item_limit)
                .unwrap_or(0);
            if load > limit {
                return Err(Violation(format!(
                    "{} added past its limit: {load} > {limit}",
                    state.local_key()
                ))
                .into());
            }
        }
        Ok(proposal)
    }

    /// One round for every Member, in key order. Returns true if any
    /// Member proposed a change.
    pub async fn pass(&mut self) -> TestingResult<bool> {
        let snapshot = self.sync().await?;
        let members: Vec<(String, String)> = snapshot
            .members()
            .map(|(_, m)| (m.zone.clone(), m.id.clone()))
            .collect();

        let mut busy = false;
        for (zone, id) in &members {
            let proposal = self.round(zone, id).await?;
            busy |= !proposal.is_empty();
        }
        self.report.passes += 1;
        debug!(pass = self.report.passes, busy, "Fleet pass complete");
        Ok(busy)
    }

    /// Run passes until one changes nothing.
    pub async fn run_until_idle(&mut self, max_passes: usize) -> TestingResult<FleetReport> {
        let start = self.report;
        for _ in 0..max_passes {
            if !self.pass().await? {
                let end = self.report;
                let mut stats = end.stats;
                stats.added -= start.stats.added;
                stats.removed -= start.stats.removed;
                stats.packed -= start.stats.packed;
                stats.flagged -= start.stats.flagged;
                stats.repaired -= start.stats.repaired;
                return Ok(FleetReport {
                    passes: end.passes - start.passes,
                    rounds: end.rounds - start.rounds,
                    commits: end.commits - start.commits,
                    conflicts: end.conflicts - start.conflicts,
                    stats,
                });
            }
        }
        Err(TestingError::NotConverged { passes: max_passes })
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        self.watcher.abort();
    }
}
