//! Fleet of allocator tasks sharing one in-process store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use keyalloc_allocator::{
    allocate, AllocateArgs, AllocatorError, AllocatorMetrics, MetricsSnapshot, ObservedState,
};
use keyalloc_keyspace::{JsonDecoder, KeyLayout, KeySpace, MemStore, Op, Store, Txn};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Writes per seeding transaction.
const SEED_CHUNK: usize = 512;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A round reported by one Member's hook.
#[derive(Debug)]
struct RoundEvent {
    member: usize,
    idle: bool,
    /// Mirror revision when the round finished.
    revision: i64,
}

struct Running {
    zone: String,
    id: String,
    handle: JoinHandle<Result<(), AllocatorError>>,
    metrics: Arc<AllocatorMetrics>,
    idle_at: Option<i64>,
    exited: bool,
}

/// Allocator tasks for every simulated Member.
pub struct Deployment {
    store: Arc<MemStore>,
    layout: KeyLayout,
    config: Config,
    shutdown: watch::Sender<bool>,
    events_tx: mpsc::UnboundedSender<RoundEvent>,
    events: mpsc::UnboundedReceiver<RoundEvent>,
    members: Vec<Running>,
}

impl Deployment {
    pub fn new(store: Arc<MemStore>, config: Config) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            store,
            layout: KeyLayout::new(config.root.clone()),
            config,
            shutdown,
            events_tx,
            events,
            members: Vec::new(),
        }
    }

    /// Write Member and Item keys in bulk, before any allocator runs.
    pub async fn seed(
        &self,
        members: &[(String, String, u32)],
        items: usize,
        r: u32,
    ) -> Result<()> {
        let mut ops: Vec<Op> = members
            .iter()
            .map(|(zone, id, limit)| Op::Put {
                key: self.layout.member_key(zone, id),
                value: json!({ "R": limit }).to_string().into_bytes(),
            })
            .collect();
        ops.extend((0..items).map(|i| Op::Put {
            key: self.layout.item_key(&format!("item-{i:06}")),
            value: json!({ "R": r }).to_string().into_bytes(),
        }));

        for chunk in ops.chunks(SEED_CHUNK) {
            let txn = chunk.iter().cloned().fold(Txn::new(), Txn::then);
            self.store.txn(txn).await.context("seeding keyspace")?;
        }
        info!(
            members = members.len(),
            items,
            revision = self.store.revision(),
            "Seeded keyspace"
        );
        Ok(())
    }

    /// Set a Member's `ItemLimit`, as its operator would.
    pub async fn set_limit(&self, index: usize, limit: u32) -> Result<()> {
        let member = &self.members[index];
        let txn = Txn::new().then(Op::Put {
            key: self.layout.member_key(&member.zone, &member.id),
            value: json!({ "R": limit }).to_string().into_bytes(),
        });
        let response = self.store.txn(txn).await.context("updating member limit")?;
        info!(member = %member.id, limit, revision = response.revision, "Set member limit");
        Ok(())
    }

    /// Start the allocator for a seeded Member and return its index.
    pub async fn spawn(&mut self, zone: &str, id: &str) -> Result<usize> {
        let index = self.members.len();
        let keyspace = Arc::new(KeySpace::new(self.layout.root(), Arc::new(JsonDecoder)));
        keyspace
            .load(self.store.as_ref(), 0)
            .await
            .with_context(|| format!("loading keyspace for {id}"))?;

        let metrics = Arc::new(AllocatorMetrics::new());
        let shutdown = self.shutdown.subscribe();
        let hook = {
            let events = self.events_tx.clone();
            let keyspace = Arc::clone(&keyspace);
            move |_round: u64, idle: bool| {
                let _ = events.send(RoundEvent {
                    member: index,
                    idle,
                    revision: keyspace.revision(),
                });
            }
        };
        let state = ObservedState::new(Arc::clone(&keyspace), zone, id);
        let args = AllocateArgs::new(self.store.clone(), state)
            .with_shutdown(shutdown.clone())
            .with_metrics(Arc::clone(&metrics))
            .with_round_timeout(self.config.round_timeout())
            .with_engine_config(self.config.engine())
            .with_test_hook(hook);

        let store = Arc::clone(&self.store);
        let handle = tokio::spawn(async move {
            let watcher = tokio::spawn({
                let keyspace = Arc::clone(&keyspace);
                async move { keyspace.watch(store.as_ref(), shutdown).await }
            });
            let result = allocate(args).await;
            watcher.abort();
            result
        });

        self.members.push(Running {
            zone: zone.to_string(),
            id: id.to_string(),
            handle,
            metrics,
            idle_at: None,
            exited: false,
        });
        Ok(index)
    }

    pub fn has_exited(&self, index: usize) -> bool {
        self.members[index].exited
    }

    /// Wait until every running Member's last round was idle at the
    /// current store revision.
    pub async fn settle(&mut self) -> Result<()> {
        let deadline = self.config.settle_timeout();
        let started = Instant::now();
        let mut tick = tokio::time::interval(POLL_INTERVAL);

        loop {
            tokio::select! {
                Some(event) = self.events.recv() => {
                    let member = &mut self.members[event.member];
                    member.idle_at = event.idle.then_some(event.revision);
                    continue;
                }
                _ = tick.tick() => {}
            }

            self.reap().await?;
            let revision = self.store.revision();
            let mut running = self.members.iter().filter(|m| !m.exited);
            if running.all(|m| m.idle_at == Some(revision)) {
                debug!(
                    revision,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Fleet settled"
                );
                return Ok(());
            }
            if started.elapsed() > deadline {
                bail!("fleet did not settle within {deadline:?} at revision {revision}");
            }
        }
    }

    /// Collect Members whose allocator has returned.
    async fn reap(&mut self) -> Result<()> {
        for member in self.members.iter_mut() {
            if member.exited || !member.handle.is_finished() {
                continue;
            }
            member.exited = true;
            (&mut member.handle)
                .await
                .with_context(|| format!("allocator task for {} panicked", member.id))?
                .with_context(|| format!("allocator for {} failed", member.id))?;
            info!(member = %member.id, "Member drained and exited");
        }
        Ok(())
    }

    /// Cancel the remaining allocators and sum every Member's counters.
    pub async fn shutdown(mut self) -> Result<MetricsSnapshot> {
        self.reap().await?;
        self.shutdown.send_replace(true);

        let mut total = MetricsSnapshot::default();
        for member in self.members {
            if !member.exited {
                match member.handle.await.context("allocator task panicked")? {
                    Ok(()) | Err(AllocatorError::Cancelled) => {}
                    Err(e) => warn!(member = %member.id, error = %e, "Allocator failed at shutdown"),
                }
            }
            total.merge(&member.metrics.snapshot());
        }
        Ok(total)
    }
}
