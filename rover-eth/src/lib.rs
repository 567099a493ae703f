use crate::params::{BLOCK_CACHE_SIZE, NetworkParams, TX_CACHE_SIZE};
use crate::pool::PoolEvent;
use crate::primitives::EthHeader;
use alloy_primitives::B256;
use parking_lot::{Mutex, RwLock};
use rover_lib::cache::{FifoSet, TtlCache};
use rover_lib::control::RoverEvent;
use rover_lib::tracker::SharedHeights;
use std::sync::atomic::AtomicU32;
use std::time::Duration;
use thiserror::Error;

pub mod codec;
pub mod params;
pub mod peer;
pub mod pool;
pub mod primitives;
pub mod rover;
pub mod validate;
pub mod wire;

/// Unrecoverable local failures; the process exits with code 3 on these.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error(
        "no free discovery port in {}..={}",
        params::PORT_SCAN_START,
        params::PORT_SCAN_END
    )]
    PortExhaustion,
}

/// State shared between peer sessions, the pool, and the rover driver.
///
/// The requested-heights set has exactly two writers (the batch dispatcher
/// and the body-receipt path); caches are only touched from session
/// handlers. Everything here is lock-per-field, never held across awaits.
pub struct EthContext {
    pub params: NetworkParams,
    pub requested: SharedHeights,
    pub block_cache: Mutex<TtlCache<B256, ()>>,
    pub tx_cache: Mutex<FifoSet<B256>>,
    pub best_seen: RwLock<Option<EthHeader>>,
    pub invalid_streak: AtomicU32,
    pub events: flume::Sender<RoverEvent>,
    pub pool_events: flume::Sender<PoolEvent>,
}

impl EthContext {
    pub fn new(
        params: NetworkParams,
        requested: SharedHeights,
        events: flume::Sender<RoverEvent>,
        pool_events: flume::Sender<PoolEvent>,
    ) -> Self {
        Self {
            params,
            requested,
            block_cache: Mutex::new(TtlCache::new(
                BLOCK_CACHE_SIZE,
                Some(Duration::from_secs(3600)),
            )),
            tx_cache: Mutex::new(FifoSet::new(TX_CACHE_SIZE)),
            best_seen: RwLock::new(None),
            invalid_streak: AtomicU32::new(0),
            events,
            pool_events,
        }
    }
}
