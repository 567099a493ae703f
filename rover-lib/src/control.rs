use crate::builder::{UnifiedSource, build_unified};
use crate::cache::TtlCache;
use crate::collector::Collector;
use crate::marker::{SettlementProbe, TxMarker};
use crate::metrics::SharedMetrics;
use crate::planner::{Batch, clamp_fetch, plan_resync};
use crate::tracker::RequestTracker;
use crate::{WATCHDOG_INTERVAL, unix_now_ms};
use async_trait::async_trait;
use rover_protocol::{Chain, RoverMessage, RoverSyncStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Result of handing a batch to the chain driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched,
    /// Too few verified peers (or an otherwise unready source); the batch
    /// is retried on the next watchdog tick.
    NotReady,
}

/// Chain-specific half of a rover: talks to the foreign network and feeds
/// blocks back through the event channel.
#[async_trait]
pub trait ChainDriver: Send {
    fn chain(&self) -> Chain;

    /// Best known remote tip height, when one has been observed.
    fn tip_height(&self) -> Option<u64>;

    /// Requests every height of the batch from the foreign chain.
    async fn dispatch(&mut self, batch: Batch) -> anyhow::Result<DispatchOutcome>;

    /// One live-follow cycle. Push-based drivers leave this a no-op.
    async fn poll_live(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn poll_interval(&self) -> Duration;

    async fn shutdown(&mut self) {}
}

/// Events produced by chain drivers and peer sessions.
pub enum RoverEvent {
    /// A validated foreign block ready for translation and emission.
    Block {
        source: Box<dyn UnifiedSource + Send>,
        from_initial_sync: bool,
    },
    /// A live block implied missing predecessors; fill [from, to].
    Gap { from: u64, to: u64 },
    /// The current resync session cannot be completed.
    SessionFailed,
}

/// The rover control loop: consumes parent directives, schedules batches,
/// translates validated blocks, and emits them upstream.
pub struct RoverControl<D, C>
where
    D: ChainDriver,
    C: Collector + SettlementProbe,
{
    driver: D,
    collector: Arc<C>,
    marker: TxMarker,
    tracker: RequestTracker,
    directive_rx: flume::Receiver<RoverMessage>,
    event_rx: flume::Receiver<RoverEvent>,
    shutdown_rx: tokio::sync::mpsc::Receiver<()>,
    emitted: TtlCache<String, ()>,
    metrics: SharedMetrics,
    /// Back-off: each collect failure skips one upcoming poll cycle.
    skip_ticks: u32,
}

impl<D, C> RoverControl<D, C>
where
    D: ChainDriver,
    C: Collector + SettlementProbe,
{
    pub fn new(
        driver: D,
        collector: Arc<C>,
        marker: TxMarker,
        tracker: RequestTracker,
        directive_rx: flume::Receiver<RoverMessage>,
        event_rx: flume::Receiver<RoverEvent>,
        shutdown_rx: tokio::sync::mpsc::Receiver<()>,
        emitted_cache_size: usize,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            driver,
            collector,
            marker,
            tracker,
            directive_rx,
            event_rx,
            shutdown_rx,
            emitted: TtlCache::new(emitted_cache_size, Some(Duration::from_secs(3600))),
            metrics,
            skip_ticks: 0,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        info!(chain = %self.driver.chain(), "rover control loop started");
        let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);
        let mut poll = tokio::time::interval(self.driver.poll_interval());

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => {
                    info!(chain = %self.driver.chain(), "shutdown received");
                    self.driver.shutdown().await;
                    return Ok(());
                }
                directive = self.directive_rx.recv_async() => {
                    match directive {
                        Ok(message) => self.handle_directive(message).await,
                        Err(_) => {
                            warn!("directive channel closed, stopping rover");
                            self.driver.shutdown().await;
                            return Ok(());
                        }
                    }
                }
                event = self.event_rx.recv_async() => {
                    let Ok(event) = event else {
                        warn!("event channel closed, stopping rover");
                        self.driver.shutdown().await;
                        return Ok(());
                    };
                    self.handle_event(event).await;
                }
                _ = watchdog.tick() => {
                    self.pump_batches().await;
                }
                _ = poll.tick() => {
                    if self.skip_ticks > 0 {
                        self.skip_ticks -= 1;
                        debug!(remaining = self.skip_ticks, "skipping poll cycle");
                    } else if let Err(err) = self.driver.poll_live().await {
                        warn!(%err, "live poll failed");
                    }
                }
            }
        }
    }

    async fn handle_directive(&mut self, message: RoverMessage) {
        match message {
            RoverMessage::RequestResync(directive) => {
                let tip = self.driver.tip_height();
                let batches =
                    plan_resync(&directive, tip, self.driver.chain(), unix_now_ms());
                if batches.is_empty() {
                    warn!("resync directive produced no batches");
                    return;
                }
                self.tracker.begin_session(batches);
                self.pump_batches().await;
            }
            RoverMessage::FetchBlock {
                current_last,
                previous_last,
            } => {
                let max_batch = self.driver.chain().max_batch();
                match clamp_fetch(&previous_last, &current_last, max_batch) {
                    Some(batch) => {
                        debug!(from = batch.from, to = batch.to, "fetch-block batch queued");
                        self.tracker.enqueue_back(batch);
                        self.pump_batches().await;
                    }
                    None => debug!("fetch-block directive already satisfied"),
                }
            }
        }
    }

    async fn handle_event(&mut self, event: RoverEvent) {
        match event {
            RoverEvent::Block {
                source,
                from_initial_sync,
            } => {
                self.handle_block(source, from_initial_sync).await;
            }
            RoverEvent::Gap { from, to } => {
                let batch = Batch { from, to }.prefer_recent(self.driver.chain().max_batch());
                info!(from = batch.from, to = batch.to, "filling live gap");
                self.dispatch_now(batch).await;
            }
            RoverEvent::SessionFailed => {
                if self.tracker.abort_session() {
                    let status = RoverSyncStatus {
                        chain: self.driver.chain(),
                        ok: false,
                    };
                    if let Err(err) = self.collector.report_sync_status(status).await {
                        warn!(%err, "failed to report sync failure");
                    }
                }
            }
        }
    }

    async fn handle_block(&mut self, source: Box<dyn UnifiedSource + Send>, from_initial_sync: bool) {
        let height = source.height();
        let hash = source.hash();

        if self.emitted.contains(&hash) {
            debug!(height, hash = %hash, "block already emitted, skipping");
        } else {
            let unified = build_unified(
                self.driver.chain(),
                source.as_ref(),
                &self.marker,
                self.collector.as_ref(),
            )
            .await;
            match self.collector.collect_block(&unified).await {
                Ok(()) => {
                    self.emitted.insert(hash.clone(), ());
                    self.metrics.inc_blocks_emitted();
                    self.metrics.add_txs_marked(unified.marked_txs.len() as u64);
                    self.metrics.set_latest_block(hash.clone());
                    debug!(
                        height,
                        hash = %hash,
                        marked = unified.marked_txs.len(),
                        from_initial_sync,
                        "unified block emitted"
                    );
                }
                Err(err) => {
                    error!(%err, height, "collect_block failed, backing off one cycle");
                    self.metrics.inc_collect_failures();
                    self.skip_ticks += 1;
                }
            }
        }

        if from_initial_sync {
            self.tracker.complete_height(height);
            if self.tracker.take_session_complete() {
                info!(chain = %self.driver.chain(), "resync session complete");
                let status = RoverSyncStatus {
                    chain: self.driver.chain(),
                    ok: true,
                };
                // not retried: a later resync will carry a fresh status
                if let Err(err) = self.collector.report_sync_status(status).await {
                    warn!(%err, "failed to report sync completion");
                }
            } else {
                self.pump_batches().await;
            }
        }
    }

    /// Dispatches the next batch once the outstanding set has drained.
    async fn pump_batches(&mut self) {
        let Some(batch) = self.tracker.pop_next() else {
            return;
        };
        self.dispatch_now(batch).await;
    }

    async fn dispatch_now(&mut self, batch: Batch) {
        match self.driver.dispatch(batch).await {
            Ok(DispatchOutcome::Dispatched) => {
                self.tracker.mark_dispatched(&batch);
                self.metrics.inc_batches_dispatched();
            }
            Ok(DispatchOutcome::NotReady) => {
                debug!(from = batch.from, to = batch.to, "dispatch postponed");
                self.tracker.requeue(batch);
            }
            Err(err) => {
                warn!(%err, from = batch.from, to = batch.to, "dispatch failed, requeueing");
                self.tracker.requeue(batch);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ForeignTx;
    use crate::collector::Collector;
    use crate::metrics::create_shared_metrics;
    use crate::tracker::shared_heights;
    use parking_lot::Mutex;
    use rover_protocol::{BlockRef, Interval, ResyncDirective, UnifiedBlock};

    struct ScriptedDriver {
        tip: Option<u64>,
        dispatched: Arc<Mutex<Vec<Batch>>>,
        ready: bool,
    }

    #[async_trait]
    impl ChainDriver for ScriptedDriver {
        fn chain(&self) -> Chain {
            Chain::Eth
        }

        fn tip_height(&self) -> Option<u64> {
            self.tip
        }

        async fn dispatch(&mut self, batch: Batch) -> anyhow::Result<DispatchOutcome> {
            if !self.ready {
                return Ok(DispatchOutcome::NotReady);
            }
            self.dispatched.lock().push(batch);
            Ok(DispatchOutcome::Dispatched)
        }

        fn poll_interval(&self) -> Duration {
            Duration::from_secs(3600)
        }
    }

    #[derive(Default)]
    struct RecordingCollector {
        blocks: Mutex<Vec<UnifiedBlock>>,
        statuses: Mutex<Vec<RoverSyncStatus>>,
    }

    #[async_trait]
    impl Collector for RecordingCollector {
        async fn collect_block(&self, block: &UnifiedBlock) -> anyhow::Result<()> {
            self.blocks.lock().push(block.clone());
            Ok(())
        }

        async fn report_sync_status(&self, status: RoverSyncStatus) -> anyhow::Result<()> {
            self.statuses.lock().push(status);
            Ok(())
        }
    }

    #[async_trait]
    impl SettlementProbe for RecordingCollector {
        async fn is_before_settle_height(&self, _from: &str, _to: &str, _chain: Chain) -> bool {
            false
        }
    }

    struct StubBlock {
        height: u64,
        hash: String,
    }

    impl UnifiedSource for StubBlock {
        fn hash(&self) -> String {
            self.hash.clone()
        }
        fn previous_hash(&self) -> String {
            String::new()
        }
        fn height(&self) -> u64 {
            self.height
        }
        fn timestamp_ms(&self) -> u64 {
            1
        }
        fn merkle_root(&self) -> String {
            "root".into()
        }
        fn transactions(&self) -> Vec<ForeignTx> {
            Vec::new()
        }
    }

    struct Harness {
        control: RoverControl<ScriptedDriver, RecordingCollector>,
        collector: Arc<RecordingCollector>,
        dispatched: Arc<Mutex<Vec<Batch>>>,
        directive_tx: flume::Sender<RoverMessage>,
        event_tx: flume::Sender<RoverEvent>,
        _shutdown_tx: tokio::sync::mpsc::Sender<()>,
    }

    fn harness(tip: Option<u64>, ready: bool) -> Harness {
        let dispatched = Arc::new(Mutex::new(Vec::new()));
        let driver = ScriptedDriver {
            tip,
            dispatched: dispatched.clone(),
            ready,
        };
        let collector = Arc::new(RecordingCollector::default());
        let (directive_tx, directive_rx) = flume::unbounded();
        let (event_tx, event_rx) = flume::unbounded();
        let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel(1);
        let control = RoverControl::new(
            driver,
            collector.clone(),
            TxMarker::new(None, true),
            RequestTracker::new(shared_heights()),
            directive_rx,
            event_rx,
            shutdown_rx,
            118,
            create_shared_metrics(),
        );
        Harness {
            control,
            collector,
            dispatched,
            directive_tx,
            event_tx,
            _shutdown_tx: shutdown_tx,
        }
    }

    #[tokio::test]
    async fn resync_session_reports_exactly_one_success() {
        let mut h = harness(Some(2000), true);
        let directive = RoverMessage::RequestResync(ResyncDirective {
            intervals: vec![Interval { from: 1000, to: 1127 }],
            latest_known: None,
        });
        h.control.handle_directive(directive).await;
        assert_eq!(
            h.dispatched.lock().as_slice(),
            &[Batch { from: 1000, to: 1127 }]
        );

        for height in 1000..=1127 {
            let source = Box::new(StubBlock {
                height,
                hash: format!("{height:x}"),
            });
            h.control
                .handle_event(RoverEvent::Block {
                    source,
                    from_initial_sync: true,
                })
                .await;
        }

        assert_eq!(h.collector.blocks.lock().len(), 128);
        let statuses = h.collector.statuses.lock();
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].ok);
        assert_eq!(statuses[0].chain, Chain::Eth);
    }

    #[tokio::test]
    async fn duplicate_block_hash_is_emitted_once() {
        let mut h = harness(Some(100), true);
        for _ in 0..2 {
            let source = Box::new(StubBlock {
                height: 42,
                hash: "42".into(),
            });
            h.control
                .handle_event(RoverEvent::Block {
                    source,
                    from_initial_sync: false,
                })
                .await;
        }
        assert_eq!(h.collector.blocks.lock().len(), 1);
    }

    #[tokio::test]
    async fn not_ready_dispatch_keeps_batch_queued() {
        let mut h = harness(Some(2000), false);
        let directive = RoverMessage::RequestResync(ResyncDirective {
            intervals: vec![Interval { from: 1000, to: 1127 }],
            latest_known: None,
        });
        h.control.handle_directive(directive).await;
        assert!(h.dispatched.lock().is_empty());
        assert_eq!(h.control.tracker.remaining_batches(), 1);

        // watchdog path: peers became available
        h.control.driver.ready = true;
        h.control.pump_batches().await;
        assert_eq!(h.dispatched.lock().len(), 1);
    }

    #[tokio::test]
    async fn oversized_fetch_block_keeps_newest_range() {
        let mut h = harness(Some(2000), true);
        let directive = RoverMessage::FetchBlock {
            current_last: BlockRef {
                height: 1000,
                hash: "b".into(),
                timestamp_ms: 2,
            },
            previous_last: BlockRef {
                height: 0,
                hash: "a".into(),
                timestamp_ms: 1,
            },
        };
        h.control.handle_directive(directive).await;
        assert_eq!(
            h.dispatched.lock().as_slice(),
            &[Batch { from: 873, to: 1000 }]
        );
    }

    #[tokio::test]
    async fn gap_event_dispatches_clamped_batch() {
        let mut h = harness(Some(2000), true);
        h.control
            .handle_event(RoverEvent::Gap { from: 101, to: 109 })
            .await;
        assert_eq!(
            h.dispatched.lock().as_slice(),
            &[Batch { from: 101, to: 109 }]
        );
    }

    #[tokio::test]
    async fn session_failure_reports_not_ok() {
        let mut h = harness(Some(2000), true);
        let directive = RoverMessage::RequestResync(ResyncDirective {
            intervals: vec![Interval { from: 1, to: 2 }],
            latest_known: None,
        });
        h.control.handle_directive(directive).await;
        h.control.handle_event(RoverEvent::SessionFailed).await;

        let statuses = h.collector.statuses.lock();
        assert_eq!(statuses.len(), 1);
        assert!(!statuses[0].ok);
    }

    #[tokio::test]
    async fn directive_without_tip_or_intervals_is_harmless() {
        let mut h = harness(None, true);
        h.control
            .handle_directive(RoverMessage::RequestResync(ResyncDirective::default()))
            .await;
        assert!(h.dispatched.lock().is_empty());
        assert!(h.collector.statuses.lock().is_empty());
    }

    #[tokio::test]
    async fn directive_sender_can_feed_the_running_loop() {
        let h = harness(Some(2000), true);
        let dispatched = h.dispatched.clone();
        let directive_tx = h.directive_tx.clone();
        let _event_tx = h.event_tx.clone();
        let handle = tokio::spawn(h.control.run());

        directive_tx
            .send_async(RoverMessage::RequestResync(ResyncDirective {
                intervals: vec![Interval { from: 10, to: 20 }],
                latest_known: None,
            }))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dispatched.lock().as_slice(), &[Batch { from: 10, to: 20 }]);
        handle.abort();
    }
}
