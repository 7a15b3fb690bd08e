//! Configuration for the simulator.

use std::time::Duration;

use clap::Parser;
use keyalloc_allocator::{EngineConfig, DEFAULT_MAX_TXN_OPS, DEFAULT_REPAIR_BUDGET};

/// Simulated rolling deploy: a block of new Members joins, a block of old
/// Members drains, until every old Member has been replaced.
#[derive(Debug, Clone, Parser)]
#[command(name = "keyalloc-sim")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Keyspace root.
    #[arg(long, env = "KEYALLOC_ROOT", default_value = "/keyalloc")]
    pub root: String,

    /// Block size N. The fleet starts with 5N Members and 2000N Items.
    #[arg(short = 'n', long, env = "KEYALLOC_BLOCK", default_value_t = 1)]
    pub block: usize,

    /// Number of zones Members are spread across.
    #[arg(long, env = "KEYALLOC_ZONES", default_value_t = 3)]
    pub zones: usize,

    /// Milliseconds an idle allocator waits before recomputing anyway.
    #[arg(long, env = "KEYALLOC_ROUND_TIMEOUT_MS", default_value_t = 1000)]
    pub round_timeout_ms: u64,

    /// Maximum write operations per round transaction.
    #[arg(long, env = "KEYALLOC_MAX_TXN_OPS", default_value_t = DEFAULT_MAX_TXN_OPS)]
    pub max_txn_ops: usize,

    /// Maximum repair deletions and zone-spread moves per round.
    #[arg(long, env = "KEYALLOC_REPAIR_BUDGET", default_value_t = DEFAULT_REPAIR_BUDGET)]
    pub repair_budget: usize,

    /// Seconds to wait for the fleet to settle after each step.
    #[arg(long, env = "KEYALLOC_SETTLE_TIMEOUT_SECS", default_value_t = 300)]
    pub settle_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "KEYALLOC_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.settle_timeout_secs)
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            max_txn_ops: self.max_txn_ops,
            repair_budget: self.repair_budget,
        }
    }
}
