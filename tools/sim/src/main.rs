//! keyalloc-sim
//!
//! Replays a rolling deploy against an in-process store and reports how
//! much allocation churn it caused.
//!
//! ## Scenario
//!
//! - A leader Member (limit 1) and `5N` old Members (limit 1500) hold
//!   `2000N` Items at replication 3
//! - Each step adds `N` new Members (limit 1205), waits for the fleet to
//!   settle, then drains `N` old Members and waits again
//! - Once every old Member is replaced the leader drains
//!
//! The final add, remove and pack counters are logged as JSON.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use clap::Parser;
use keyalloc_keyspace::MemStore;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod deploy;

use config::Config;
use deploy::Deployment;

const LEADER_LIMIT: u32 = 1;
const OLD_LIMIT: u32 = 1500;
const NEW_LIMIT: u32 = 1205;
const ITEMS_PER_BLOCK: usize = 2000;
const REPLICATION: u32 = 3;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    if config.block == 0 || config.zones == 0 {
        bail!("--block and --zones must be positive");
    }
    let n = config.block;
    info!(
        block = n,
        zones = config.zones,
        root = %config.root,
        max_txn_ops = config.max_txn_ops,
        "Starting simulated deploy"
    );

    let started = Instant::now();
    let zone = |i: usize| format!("zone-{}", i % config.zones);
    let mut fleet = Deployment::new(Arc::new(MemStore::new()), config.clone());

    let leader = (zone(0), "leader".to_string(), LEADER_LIMIT);
    let old: Vec<(String, String, u32)> = (0..5 * n)
        .map(|i| (zone(i), format!("old-{i:04}"), OLD_LIMIT))
        .collect();
    let mut seeded = vec![leader.clone()];
    seeded.extend(old.iter().cloned());
    fleet.seed(&seeded, ITEMS_PER_BLOCK * n, REPLICATION).await?;

    let leader = fleet.spawn(&leader.0, &leader.1).await?;
    let mut old_members = Vec::with_capacity(old.len());
    for (zone, id, _) in &old {
        old_members.push(fleet.spawn(zone, id).await?);
    }
    fleet.settle().await?;
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Initial allocation settled"
    );

    for (step, block) in old_members.chunks(n).enumerate() {
        let joining: Vec<(String, String, u32)> = (step * n..(step + 1) * n)
            .map(|i| (zone(i), format!("new-{i:04}"), NEW_LIMIT))
            .collect();
        fleet.seed(&joining, 0, REPLICATION).await?;
        for (zone, id, _) in &joining {
            fleet.spawn(zone, id).await?;
        }
        fleet.settle().await?;

        for &index in block {
            fleet.set_limit(index, 0).await?;
        }
        fleet.settle().await?;
        info!(
            step,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Deploy step complete"
        );
    }

    fleet.set_limit(leader, 0).await?;
    fleet.settle().await?;
    if !fleet.has_exited(leader) {
        bail!("leader did not finish draining");
    }
    let stuck = old_members.iter().filter(|&&i| !fleet.has_exited(i)).count();
    if stuck > 0 {
        warn!(stuck, "Some old members are still draining");
    }

    let totals = fleet.shutdown().await?;
    info!(
        adds = totals.added,
        removes = totals.removed,
        packs = totals.packed,
        flags = totals.flagged,
        repairs = totals.repaired,
        rounds = totals.rounds,
        conflicts = totals.conflicts,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Simulated deploy complete"
    );
    Ok(())
}
