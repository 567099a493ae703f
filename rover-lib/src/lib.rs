use std::time::{SystemTime, UNIX_EPOCH};

pub mod builder;
pub mod cache;
pub mod collector;
pub mod control;
pub mod marker;
pub mod metrics;
pub mod planner;
pub mod tracker;

/// Cadence of the batch watchdog and the peer-availability retry.
pub const WATCHDOG_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// Size of the emitted-block dedup cache, sized to each chain's cadence.
pub fn emitted_cache_size(chain: rover_protocol::Chain) -> usize {
    match chain {
        rover_protocol::Chain::Eth => 118,
        rover_protocol::Chain::Lsk => 200,
    }
}

pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}
