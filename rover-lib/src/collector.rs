use crate::marker::SettlementProbe;
use anyhow::Context;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use jsonrpsee::core::client::{ClientT, Subscription, SubscriptionClientT};
use jsonrpsee::rpc_params;
use jsonrpsee::ws_client::{WsClient, WsClientBuilder};
use rover_protocol::{Chain, RoverIdent, RoverMessage, RoverSyncStatus, UnifiedBlock};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Upstream sink for validated unified blocks.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn collect_block(&self, block: &UnifiedBlock) -> anyhow::Result<()>;
    async fn report_sync_status(&self, status: RoverSyncStatus) -> anyhow::Result<()>;
}

/// WebSocket client for the parent coordinator's `rover` namespace.
///
/// The underlying connection is swappable so the directive pump can
/// re-establish it without invalidating handles held by the control loop.
pub struct RpcCollector {
    url: String,
    client: ArcSwap<WsClient>,
}

impl RpcCollector {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = WsClientBuilder::default()
            .build(url)
            .await
            .with_context(|| format!("connecting to collector at {url}"))?;
        info!(%url, "connected to parent coordinator");
        Ok(Self {
            url: url.to_string(),
            client: ArcSwap::new(Arc::new(client)),
        })
    }

    pub async fn reconnect(&self) -> anyhow::Result<()> {
        let client = WsClientBuilder::default()
            .build(&self.url)
            .await
            .with_context(|| format!("reconnecting to collector at {}", self.url))?;
        self.client.store(Arc::new(client));
        info!(url = %self.url, "reconnected to parent coordinator");
        Ok(())
    }

    fn client(&self) -> Arc<WsClient> {
        self.client.load_full()
    }

    /// Joins the parent's directive stream for the given chain.
    pub async fn join(&self, chain: Chain) -> anyhow::Result<Subscription<RoverMessage>> {
        let subscription = self
            .client()
            .subscribe("rover_join", rpc_params![RoverIdent { chain }], "rover_unjoin")
            .await
            .context("rover_join subscription failed")?;
        Ok(subscription)
    }
}

#[async_trait]
impl Collector for RpcCollector {
    async fn collect_block(&self, block: &UnifiedBlock) -> anyhow::Result<()> {
        self.client()
            .request::<serde_json::Value, _>("rover_collectBlock", rpc_params![block])
            .await
            .context("rover_collectBlock failed")?;
        Ok(())
    }

    async fn report_sync_status(&self, status: RoverSyncStatus) -> anyhow::Result<()> {
        self.client()
            .request::<serde_json::Value, _>("rover_reportSyncStatus", rpc_params![status])
            .await
            .context("rover_reportSyncStatus failed")?;
        Ok(())
    }
}

#[async_trait]
impl SettlementProbe for RpcCollector {
    async fn is_before_settle_height(&self, from: &str, to: &str, chain: Chain) -> bool {
        match self
            .client()
            .request::<bool, _>("rover_isBeforeSettleHeight", rpc_params![from, to, chain])
            .await
        {
            Ok(within) => within,
            Err(err) => {
                warn!(%err, "settlement lookup failed, treating as outside window");
                false
            }
        }
    }
}

/// Collector used without a parent: blocks are logged, nothing leaves the
/// process, and no settlement windows are ever open.
pub struct StandaloneCollector;

#[async_trait]
impl Collector for StandaloneCollector {
    async fn collect_block(&self, block: &UnifiedBlock) -> anyhow::Result<()> {
        info!(
            chain = %block.chain,
            height = block.height,
            hash = %block.hash,
            marked = block.marked_txs.len(),
            "unified block (standalone)"
        );
        Ok(())
    }

    async fn report_sync_status(&self, status: RoverSyncStatus) -> anyhow::Result<()> {
        info!(chain = %status.chain, ok = status.ok, "sync status (standalone)");
        Ok(())
    }
}

#[async_trait]
impl SettlementProbe for StandaloneCollector {
    async fn is_before_settle_height(&self, _from: &str, _to: &str, _chain: Chain) -> bool {
        false
    }
}

/// Pumps parent directives into the control loop, reconnecting on stream
/// loss until shutdown.
pub fn spawn_directive_pump(
    collector: Arc<RpcCollector>,
    chain: Chain,
    directive_tx: flume::Sender<RoverMessage>,
    mut shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let mut subscription = tokio::select! {
                biased;
                _ = &mut shutdown_rx => {
                    info!("directive pump shutting down");
                    return;
                }
                joined = collector.join(chain) => match joined {
                    Ok(subscription) => subscription,
                    Err(err) => {
                        error!(%err, "failed to join directive stream, retrying");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        if let Err(err) = collector.reconnect().await {
                            error!(%err, "collector reconnect failed");
                        }
                        continue;
                    }
                },
            };

            loop {
                let item = tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => {
                        info!("directive pump shutting down");
                        return;
                    }
                    item = subscription.next() => item,
                };
                match item {
                    Some(Ok(message)) => {
                        if directive_tx.send_async(message).await.is_err() {
                            warn!("control loop gone, stopping directive pump");
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        // unknown or malformed directive, skip it
                        warn!(%err, "undecodable rover directive");
                    }
                    None => {
                        warn!("directive stream closed, reconnecting");
                        break;
                    }
                }
            }
        }
    })
}
