use crate::EthContext;
use crate::params::NetworkParams;
use crate::pool::{PeerPool, PoolCommand, bind_endpoint};
use crate::primitives::EthBlock;
use alloy_primitives::{TxKind, hex};
use async_trait::async_trait;
use rover_lib::builder::{ForeignTx, UnifiedSource};
use rover_lib::control::{ChainDriver, DispatchOutcome, RoverEvent};
use rover_lib::metrics::SharedMetrics;
use rover_lib::planner::Batch;
use rover_lib::tracker::SharedHeights;
use rover_protocol::{BcNetwork, Chain};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct EthRoverConfig {
    pub network: BcNetwork,
    pub maximum_peers: usize,
    pub alt_boot_nodes: Vec<String>,
}

/// Ethereum half of the rover: owns the peer pool task and routes batch
/// dispatches into it.
pub struct EthDriver {
    ctx: Arc<EthContext>,
    pool_commands: flume::Sender<PoolCommand>,
    pool_shutdown: tokio::sync::mpsc::Sender<()>,
    pool_task: Option<tokio::task::JoinHandle<anyhow::Result<()>>>,
}

impl EthDriver {
    /// Binds the devp2p endpoint, starts the peer pool, and returns the
    /// driver for the control loop. Port exhaustion surfaces as
    /// [`crate::FatalError`] inside the returned error.
    pub async fn start(
        config: EthRoverConfig,
        requested: SharedHeights,
        events: flume::Sender<RoverEvent>,
        metrics: SharedMetrics,
    ) -> anyhow::Result<Self> {
        let params = NetworkParams::for_network(config.network, &config.alt_boot_nodes)?;
        let (discovery_socket, listener, port) = bind_endpoint().await?;
        info!(port, network = %config.network, "devp2p endpoint bound");

        let (pool_events_tx, pool_events_rx) = flume::unbounded();
        let ctx = Arc::new(EthContext::new(
            params,
            requested,
            events,
            pool_events_tx,
        ));

        let (pool_commands_tx, pool_commands_rx) = flume::bounded(8);
        let (pool_shutdown_tx, pool_shutdown_rx) = tokio::sync::mpsc::channel(1);
        let pool = PeerPool::new(
            ctx.clone(),
            config.maximum_peers,
            listener,
            discovery_socket,
            pool_events_rx,
            pool_commands_rx,
            pool_shutdown_rx,
            metrics,
        );
        let pool_task = tokio::spawn(pool.run());

        Ok(Self {
            ctx,
            pool_commands: pool_commands_tx,
            pool_shutdown: pool_shutdown_tx,
            pool_task: Some(pool_task),
        })
    }

    pub fn context(&self) -> Arc<EthContext> {
        self.ctx.clone()
    }
}

#[async_trait]
impl ChainDriver for EthDriver {
    fn chain(&self) -> Chain {
        Chain::Eth
    }

    fn tip_height(&self) -> Option<u64> {
        self.ctx.best_seen.read().as_ref().map(|header| header.number)
    }

    async fn dispatch(&mut self, batch: Batch) -> anyhow::Result<DispatchOutcome> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.pool_commands
            .send_async(PoolCommand::DispatchRange {
                batch,
                reply: reply_tx,
            })
            .await?;
        match reply_rx.await {
            Ok(true) => Ok(DispatchOutcome::Dispatched),
            Ok(false) | Err(_) => Ok(DispatchOutcome::NotReady),
        }
    }

    fn poll_interval(&self) -> Duration {
        // live blocks arrive over NEW_BLOCK pushes; polling is a no-op here
        Duration::from_secs(Chain::Eth.seconds_per_block())
    }

    async fn shutdown(&mut self) {
        let _ = self.pool_shutdown.send(()).await;
        if let Some(task) = self.pool_task.take() {
            let _ = task.await;
        }
    }
}

fn hex_prefixed(bytes: impl AsRef<[u8]>) -> String {
    format!("0x{}", hex::encode(bytes))
}

impl UnifiedSource for EthBlock {
    fn hash(&self) -> String {
        hex_prefixed(self.header.hash())
    }

    fn previous_hash(&self) -> String {
        hex_prefixed(self.header.parent_hash)
    }

    fn height(&self) -> u64 {
        self.header.number
    }

    fn timestamp_ms(&self) -> u64 {
        self.header.timestamp * 1000
    }

    fn merkle_root(&self) -> String {
        hex_prefixed(self.header.transactions_root)
    }

    fn transactions(&self) -> Vec<ForeignTx> {
        self.transactions
            .iter()
            .map(|tx| {
                // senders were recovered during validation, so this only
                // misses for blocks injected without a validation pass
                let sender = tx
                    .recover_sender()
                    .map(hex_prefixed)
                    .unwrap_or_default();
                let recipient = match tx.to {
                    TxKind::Call(address) => hex_prefixed(address),
                    TxKind::Create => String::new(),
                };
                ForeignTx {
                    hash: hex_prefixed(tx.hash()),
                    sender_key: sender.trim_start_matches("0x").to_string(),
                    sender,
                    recipient,
                    value: tx.value.to_be_bytes_trimmed_vec(),
                    is_value_transfer: matches!(tx.to, TxKind::Call(_)),
                }
            })
            .collect()
    }
}
