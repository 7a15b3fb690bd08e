//! Round driver.
//!
//! Runs the allocation loop for one Member: wait for a fresh snapshot,
//! compute a proposal, submit it, repeat. Phases:
//!
//! ```text
//! Idle -> Computing -> Transacting -> Idle
//!   \________\______________\_______-> Halted
//! ```
//!
//! The loop halts on drain completion (`Ok`), on cancellation, or on an
//! unrecoverable keyspace or store error.

use std::sync::Arc;
use std::time::Duration;

use keyalloc_keyspace::{cancelled, Store, WaitOutcome};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, trace};

use crate::engine::{self, EngineConfig, Proposal};
use crate::error::{AllocatorError, AllocatorResult};
use crate::metrics::AllocatorMetrics;
use crate::state::ObservedState;

/// Default wait for a newer snapshot before recomputing anyway.
pub const DEFAULT_ROUND_TIMEOUT: Duration = Duration::from_secs(30);

/// Callback invoked after every round with the round number and whether
/// the round changed nothing.
pub type RoundHook = Box<dyn FnMut(u64, bool) + Send>;

/// Arguments of [`allocate`].
pub struct AllocateArgs {
    store: Arc<dyn Store>,
    state: ObservedState,
    test_hook: Option<RoundHook>,
    round_timeout: Duration,
    shutdown: watch::Receiver<bool>,
    metrics: Arc<AllocatorMetrics>,
    engine: EngineConfig,
}

impl AllocateArgs {
    /// Arguments with default tuning and no shutdown signal.
    pub fn new(store: Arc<dyn Store>, state: ObservedState) -> Self {
        // A receiver whose sender is gone never signals shutdown.
        let (_, shutdown) = watch::channel(false);
        Self {
            store,
            state,
            test_hook: None,
            round_timeout: DEFAULT_ROUND_TIMEOUT,
            shutdown,
            metrics: Arc::new(AllocatorMetrics::new()),
            engine: EngineConfig::default(),
        }
    }

    pub fn with_test_hook(mut self, hook: impl FnMut(u64, bool) + Send + 'static) -> Self {
        self.test_hook = Some(Box::new(hook));
        self
    }

    pub fn with_round_timeout(mut self, timeout: Duration) -> Self {
        self.round_timeout = timeout;
        self
    }

    /// Stop the loop once `shutdown` holds `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<AllocatorMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_engine_config(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn metrics(&self) -> Arc<AllocatorMetrics> {
        Arc::clone(&self.metrics)
    }
}

impl std::fmt::Debug for AllocateArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocateArgs")
            .field("state", &self.state)
            .field("test_hook", &self.test_hook.is_some())
            .field("round_timeout", &self.round_timeout)
            .field("engine", &self.engine)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Computing,
    Transacting,
    Halted,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Computing => "computing",
            Self::Transacting => "transacting",
            Self::Halted => "halted",
        }
    }
}

/// Run allocation rounds for the local Member until it has drained.
///
/// The Member's `KeySpace` must be loaded and kept current by
/// [`KeySpace::watch`](keyalloc_keyspace::KeySpace::watch) for the
/// lifetime of the call. Returns `Ok(())` once the local Member has
/// `ItemLimit == 0` and holds no Assignments, and
/// [`AllocatorError::Cancelled`] if shutdown is signalled first.
/// Transaction conflicts are retried from a fresh snapshot.
#[instrument(skip(args), fields(member = %args.state.local_key()))]
pub async fn allocate(args: AllocateArgs) -> AllocatorResult<()> {
    let AllocateArgs {
        store,
        state,
        mut test_hook,
        round_timeout,
        mut shutdown,
        metrics,
        engine,
    } = args;
    let keyspace = Arc::clone(state.keyspace());

    info!(
        round_timeout_secs = round_timeout.as_secs(),
        max_txn_ops = engine.max_txn_ops,
        "Starting allocator"
    );

    let mut phase = Phase::Idle;
    let mut await_revision = keyspace.revision();
    let mut round: u64 = 0;

    loop {
        let snapshot = match keyspace
            .wait_for_revision(await_revision, Some(round_timeout), &mut shutdown)
            .await
        {
            WaitOutcome::Reached(snapshot) => snapshot,
            WaitOutcome::TimedOut(snapshot) => {
                debug!(await_revision, "Round timeout; recomputing");
                snapshot
            }
            WaitOutcome::Cancelled => {
                info!(round, "Allocator cancelled");
                return Err(AllocatorError::Cancelled);
            }
            WaitOutcome::Failed(e) => {
                transition(phase, Phase::Halted, round);
                error!(round, error = %e, "Keyspace mirror failed; allocator halting");
                return Err(e.into());
            }
        };

        round += 1;
        phase = transition(phase, Phase::Computing, round);

        let proposal = match engine::propose(&snapshot, &state, &engine) {
            Ok(proposal) => proposal,
            Err(e) => {
                transition(phase, Phase::Halted, round);
                error!(round, error = %e, "Failed to compute proposal");
                return Err(e);
            }
        };

        if proposal.drained {
            transition(phase, Phase::Halted, round);
            info!(round, revision = snapshot.revision(), "Member drained; allocator exiting");
            return Ok(());
        }

        let idle = proposal.is_empty();
        if idle {
            await_revision = snapshot.revision() + 1;
        } else {
            phase = transition(phase, Phase::Transacting, round);
            let Proposal {
                revision,
                txn,
                stats,
                deferred,
                ..
            } = proposal;
            let ops = txn.ops.len();

            let response = tokio::select! {
                response = store.txn(txn) => response,
                _ = cancelled(&mut shutdown) => {
                    info!(round, "Allocator cancelled during transaction");
                    return Err(AllocatorError::Cancelled);
                }
            };
            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    transition(phase, Phase::Halted, round);
                    error!(round, error = %e, "Allocator transaction failed");
                    return Err(e.into());
                }
            };

            if response.succeeded {
                metrics.record_commit(&stats);
                info!(
                    round,
                    revision = response.revision,
                    ops,
                    added = stats.added,
                    removed = stats.removed,
                    packed = stats.packed,
                    flagged = stats.flagged,
                    repaired = stats.repaired,
                    deferred,
                    "Committed allocation round"
                );
            } else {
                metrics.record_conflict();
                debug!(
                    round,
                    snapshot_revision = revision,
                    store_revision = response.revision,
                    "Allocation round conflicted; retrying"
                );
            }
            // A commit is under the root, so the mirror reaches its revision.
            // A conflict means some compared key under the root changed after
            // the snapshot; the next revision of the mirror carries it.
            await_revision = if response.succeeded {
                response.revision.max(revision + 1)
            } else {
                revision + 1
            };
        }

        phase = transition(phase, Phase::Idle, round);
        metrics.record_round(idle);
        debug!(round, revision = snapshot.revision(), idle, "Round complete");

        if let Some(hook) = test_hook.as_mut() {
            hook(round, idle);
        }
    }
}

fn transition(from: Phase, to: Phase, round: u64) -> Phase {
    trace!(round, from = from.as_str(), to = to.as_str(), "Round phase");
    to
}
