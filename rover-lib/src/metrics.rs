use arc_swap::ArcSwap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters shared across rover tasks.
#[derive(Default)]
pub struct RoverMetrics {
    blocks_emitted: AtomicU64,
    txs_marked: AtomicU64,
    batches_dispatched: AtomicU64,
    collect_failures: AtomicU64,
    peers_verified: AtomicU64,
    latest_block: ArcSwap<String>,
}

pub type SharedMetrics = Arc<RoverMetrics>;

pub fn create_shared_metrics() -> SharedMetrics {
    Arc::new(RoverMetrics::default())
}

impl RoverMetrics {
    pub fn inc_blocks_emitted(&self) {
        self.blocks_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_txs_marked(&self, count: u64) {
        self.txs_marked.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_batches_dispatched(&self) {
        self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_collect_failures(&self) {
        self.collect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_peers_verified(&self, count: u64) {
        self.peers_verified.store(count, Ordering::Relaxed);
    }

    pub fn set_latest_block(&self, hash: String) {
        self.latest_block.store(Arc::new(hash));
    }

    pub fn snapshot(&self) -> RoverMetricsSnapshot {
        RoverMetricsSnapshot {
            blocks_emitted: self.blocks_emitted.load(Ordering::Relaxed),
            txs_marked: self.txs_marked.load(Ordering::Relaxed),
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            collect_failures: self.collect_failures.load(Ordering::Relaxed),
            peers_verified: self.peers_verified.load(Ordering::Relaxed),
            latest_block: self.latest_block.load().as_ref().clone(),
        }
    }
}

/// A copy of all rover counters as plain values.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoverMetricsSnapshot {
    pub blocks_emitted: u64,
    pub txs_marked: u64,
    pub batches_dispatched: u64,
    pub collect_failures: u64,
    pub peers_verified: u64,
    pub latest_block: String,
}

impl Display for RoverMetricsSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Rover Metrics Snapshot:")?;
        writeln!(f, "  Blocks emitted: {}", self.blocks_emitted)?;
        writeln!(f, "  Transactions marked: {}", self.txs_marked)?;
        writeln!(f, "  Batches dispatched: {}", self.batches_dispatched)?;
        writeln!(f, "  Collect failures: {}", self.collect_failures)?;
        writeln!(f, "  Verified peers: {}", self.peers_verified)?;
        writeln!(f, "  Latest block: {}", self.latest_block)
    }
}
