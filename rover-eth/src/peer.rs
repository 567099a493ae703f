use crate::EthContext;
use crate::codec::{Frame, FrameCodec};
use crate::params::{FORK_PROBE_TIMEOUT, MAX_INVALID_COUNT, PEER_MAX_AGE, REQUEST_DELAY, dao_fork_header};
use crate::pool::PoolEvent;
use crate::primitives::{EthBlock, EthBlockBody, EthHeader, EthTransaction};
use crate::validate::{has_valid_difficulty, validate_block};
use crate::wire::{
    DisconnectReason, EMPTY_LIST_PAYLOAD, EthMessage, GetBlockHeaders, HashOrNumber,
    StatusMessage, WireError,
};
use alloy_primitives::{B256, Bytes};
use futures_util::{SinkExt, StreamExt};
use rover_lib::control::RoverEvent;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

/// Commands the pool sends into a live session.
#[derive(Debug)]
pub enum SessionCommand {
    /// One GET_BLOCK_HEADERS covering `count` heights ascending from `from`.
    RequestRange { from: u64, count: u64 },
    Disconnect(DisconnectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connected,
    StatusSent,
    ForkProbe,
    Verified,
    Rejected,
    Refreshing,
}

/// One peer's lifecycle: handshake, fork probe, message dispatch, and
/// per-peer request bookkeeping.
pub struct PeerSession<S> {
    addr: SocketAddr,
    stream: Framed<S, FrameCodec>,
    state: PeerState,
    ctx: Arc<EthContext>,
    commands: flume::Receiver<SessionCommand>,
    /// Hashes announced via NEW_BLOCK_HASHES we probed headers for.
    pending_hashes: VecDeque<B256>,
    /// Headers awaiting their bodies, in request order.
    pending_headers: VecDeque<EthHeader>,
    fork_deadline: Option<Instant>,
    refresh_at: Option<Instant>,
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl<S> PeerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        addr: SocketAddr,
        transport: S,
        ctx: Arc<EthContext>,
        commands: flume::Receiver<SessionCommand>,
    ) -> Self {
        Self {
            addr,
            stream: Framed::new(transport, FrameCodec),
            state: PeerState::Connected,
            ctx,
            commands,
            pending_hashes: VecDeque::new(),
            pending_headers: VecDeque::new(),
            fork_deadline: None,
            refresh_at: None,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        self.send_status().await?;
        self.state = PeerState::StatusSent;

        loop {
            let fork_at = self.fork_deadline;
            let refresh_at = self.refresh_at;
            tokio::select! {
                biased;
                command = self.commands.recv_async() => match command {
                    Ok(SessionCommand::RequestRange { from, count }) => {
                        self.request_range(from, count).await?;
                    }
                    Ok(SessionCommand::Disconnect(reason)) => {
                        return self.finish(reason, false).await;
                    }
                    Err(_) => {
                        return self.finish(DisconnectReason::DisconnectRequested, false).await;
                    }
                },
                frame = self.stream.next() => match frame {
                    Some(Ok(frame)) => match self.handle_frame(frame).await? {
                        ControlFlow::Continue(()) => {}
                        ControlFlow::Break(reason) => {
                            let ban = reason == DisconnectReason::ProtocolBreach;
                            return self.finish(reason, ban).await;
                        }
                    },
                    Some(Err(err)) if err.kind() == io::ErrorKind::ConnectionReset => {
                        trace!(peer = %self.addr, "connection reset");
                        return self.closed(false).await;
                    }
                    Some(Err(err)) => {
                        warn!(peer = %self.addr, %err, "transport error, banning peer");
                        return self.finish(DisconnectReason::ProtocolBreach, true).await;
                    }
                    None => {
                        debug!(peer = %self.addr, "peer closed the connection");
                        return self.closed(false).await;
                    }
                },
                _ = deadline(fork_at), if fork_at.is_some() => {
                    warn!(peer = %self.addr, "fork probe timed out");
                    self.state = PeerState::Rejected;
                    return self.finish(DisconnectReason::UselessPeer, false).await;
                }
                _ = deadline(refresh_at), if refresh_at.is_some() => {
                    info!(peer = %self.addr, "refreshing long-lived peer");
                    self.state = PeerState::Refreshing;
                    return self.finish(DisconnectReason::DisconnectRequested, false).await;
                }
            }
        }
    }

    async fn handle_frame(
        &mut self,
        frame: Frame,
    ) -> anyhow::Result<ControlFlow<DisconnectReason>> {
        let message = match EthMessage::decode(frame.code, &frame.payload) {
            Ok(message) => message,
            Err(WireError::UnknownCode(code)) => {
                debug!(peer = %self.addr, code, "ignoring unknown message code");
                return Ok(ControlFlow::Continue(()));
            }
            Err(err) => {
                warn!(peer = %self.addr, %err, "undecodable frame, banning peer");
                return Ok(ControlFlow::Break(DisconnectReason::ProtocolBreach));
            }
        };

        match message {
            EthMessage::Status(status) => self.on_status(status).await,
            EthMessage::NewBlockHashes(entries) => {
                if self.state == PeerState::Verified {
                    self.on_new_block_hashes(entries).await?;
                }
                Ok(ControlFlow::Continue(()))
            }
            EthMessage::Transactions(txs) => {
                self.on_transactions(txs);
                Ok(ControlFlow::Continue(()))
            }
            EthMessage::GetBlockHeaders(request) => {
                self.serve_headers(request).await?;
                Ok(ControlFlow::Continue(()))
            }
            EthMessage::BlockHeaders(headers) => self.on_block_headers(headers).await,
            EthMessage::GetBlockBodies(_) => {
                self.send(EthMessage::BlockBodies(Vec::new())).await?;
                Ok(ControlFlow::Continue(()))
            }
            EthMessage::BlockBodies(bodies) => self.on_block_bodies(bodies).await,
            EthMessage::NewBlock(payload) => self.on_new_block(payload.block).await,
            EthMessage::GetNodeData(_) => {
                self.send(EthMessage::NodeData(Bytes::from_static(&EMPTY_LIST_PAYLOAD)))
                    .await?;
                Ok(ControlFlow::Continue(()))
            }
            EthMessage::GetReceipts(_) => {
                self.send(EthMessage::Receipts(Bytes::from_static(&EMPTY_LIST_PAYLOAD)))
                    .await?;
                Ok(ControlFlow::Continue(()))
            }
            EthMessage::NodeData(_) | EthMessage::Receipts(_) => {
                trace!(peer = %self.addr, "ignoring state-sync payload");
                Ok(ControlFlow::Continue(()))
            }
        }
    }

    async fn on_status(
        &mut self,
        status: StatusMessage,
    ) -> anyhow::Result<ControlFlow<DisconnectReason>> {
        if self.state != PeerState::StatusSent {
            debug!(peer = %self.addr, "unexpected repeated STATUS");
            return Ok(ControlFlow::Continue(()));
        }
        if status.network_id != self.ctx.params.network_id
            || status.genesis_hash != self.ctx.params.genesis_hash
        {
            warn!(
                peer = %self.addr,
                network_id = status.network_id,
                "peer is on a different network"
            );
            return Ok(ControlFlow::Break(DisconnectReason::UselessPeer));
        }

        match self.ctx.params.fork_check {
            Some(check) => {
                self.send(EthMessage::GetBlockHeaders(GetBlockHeaders {
                    origin: HashOrNumber::Number(check.height),
                    max_headers: 1,
                    skip: 0,
                    reverse: false,
                }))
                .await?;
                self.state = PeerState::ForkProbe;
                self.fork_deadline = Some(Instant::now() + FORK_PROBE_TIMEOUT);
            }
            None => self.mark_verified().await,
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn mark_verified(&mut self) {
        info!(peer = %self.addr, "peer verified");
        self.state = PeerState::Verified;
        self.fork_deadline = None;
        self.refresh_at = Some(Instant::now() + PEER_MAX_AGE);
        let _ = self
            .ctx
            .pool_events
            .send_async(PoolEvent::Verified(self.addr))
            .await;
    }

    async fn on_block_headers(
        &mut self,
        headers: Vec<EthHeader>,
    ) -> anyhow::Result<ControlFlow<DisconnectReason>> {
        match self.state {
            PeerState::ForkProbe => {
                let check = self
                    .ctx
                    .params
                    .fork_check
                    .expect("fork probe state without fork check");
                if headers.len() == 1 && headers[0].hash() == check.hash {
                    self.mark_verified().await;
                    Ok(ControlFlow::Continue(()))
                } else {
                    warn!(
                        peer = %self.addr,
                        headers = headers.len(),
                        "fork probe failed, peer is on the wrong chain"
                    );
                    self.state = PeerState::Rejected;
                    Ok(ControlFlow::Break(DisconnectReason::UselessPeer))
                }
            }
            PeerState::Verified => {
                for header in headers {
                    self.on_header(header).await?;
                }
                Ok(ControlFlow::Continue(()))
            }
            _ => {
                debug!(peer = %self.addr, "headers from unverified peer, dropping");
                Ok(ControlFlow::Continue(()))
            }
        }
    }

    async fn on_header(&mut self, header: EthHeader) -> anyhow::Result<()> {
        let hash = header.hash();
        if self.ctx.block_cache.lock().contains(&hash) {
            return Ok(());
        }

        let mut wanted = self.ctx.requested.read().contains(&header.number);
        if !wanted {
            match self.pending_hashes.pop_front() {
                Some(expected) if expected == hash => wanted = true,
                Some(expected) => debug!(
                    peer = %self.addr,
                    expected = %expected,
                    got = %hash,
                    "header does not match pending announcement, dropping"
                ),
                None => debug!(
                    peer = %self.addr,
                    number = header.number,
                    "unsolicited header, dropping"
                ),
            }
        }

        if wanted {
            tokio::time::sleep(REQUEST_DELAY).await;
            self.send(EthMessage::GetBlockBodies(vec![hash])).await?;
            self.pending_headers.push_back(header);
        }
        Ok(())
    }

    async fn on_block_bodies(
        &mut self,
        mut bodies: Vec<EthBlockBody>,
    ) -> anyhow::Result<ControlFlow<DisconnectReason>> {
        if self.state != PeerState::Verified {
            return Ok(ControlFlow::Continue(()));
        }
        if bodies.len() != 1 {
            warn!(
                peer = %self.addr,
                bodies = bodies.len(),
                "expected exactly one block body"
            );
            return Ok(ControlFlow::Break(DisconnectReason::UselessPeer));
        }
        let Some(header) = self.pending_headers.pop_front() else {
            debug!(peer = %self.addr, "body without a pending header, dropping");
            return Ok(ControlFlow::Continue(()));
        };

        let block = EthBlock::from_parts(header, bodies.remove(0));
        match validate_block(&block) {
            Ok(()) => {
                let from_initial_sync = self.ctx.requested.write().remove(&block.header.number);
                self.emit_block(block, from_initial_sync).await?;
                Ok(ControlFlow::Continue(()))
            }
            Err(err) => {
                warn!(peer = %self.addr, %err, "invalid block body");
                Ok(ControlFlow::Break(DisconnectReason::UselessPeer))
            }
        }
    }

    async fn on_new_block(
        &mut self,
        block: EthBlock,
    ) -> anyhow::Result<ControlFlow<DisconnectReason>> {
        if self.state != PeerState::Verified {
            debug!(peer = %self.addr, "NEW_BLOCK from unverified peer, dropping");
            return Ok(ControlFlow::Continue(()));
        }
        if let Err(err) = validate_block(&block) {
            warn!(peer = %self.addr, %err, "malformed live block");
            return Ok(ControlFlow::Continue(()));
        }

        let best = self.ctx.best_seen.read().clone();
        match best {
            None => {
                self.ctx.invalid_streak.store(0, Ordering::Relaxed);
                self.emit_block(block, false).await?;
            }
            Some(best) => {
                if has_valid_difficulty(&best, &block.header) {
                    self.ctx.invalid_streak.store(0, Ordering::Relaxed);
                    self.emit_block(block, false).await?;
                } else if block.header.number > best.number {
                    // tolerated: the peer is ahead of us, fill the gap
                    let from = best.number + 1;
                    let to = block.header.number - 1;
                    if to >= from {
                        let _ = self
                            .ctx
                            .events
                            .send_async(RoverEvent::Gap { from, to })
                            .await;
                    }
                    self.emit_block(block, false).await?;
                } else {
                    let streak = self.ctx.invalid_streak.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        peer = %self.addr,
                        height = block.header.number,
                        streak,
                        "live block with invalid difficulty"
                    );
                    if streak >= MAX_INVALID_COUNT {
                        self.ctx.invalid_streak.store(0, Ordering::Relaxed);
                        return Ok(ControlFlow::Break(DisconnectReason::UselessPeer));
                    }
                }
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn on_new_block_hashes(
        &mut self,
        entries: Vec<crate::wire::BlockHashNumber>,
    ) -> anyhow::Result<()> {
        for entry in entries {
            if self.ctx.block_cache.lock().contains(&entry.hash) {
                continue;
            }
            self.pending_hashes.push_back(entry.hash);
            // rate limit between announcement and header probe
            tokio::time::sleep(REQUEST_DELAY).await;
            self.send(EthMessage::GetBlockHeaders(GetBlockHeaders {
                origin: HashOrNumber::Hash(entry.hash),
                max_headers: 1,
                skip: 0,
                reverse: false,
            }))
            .await?;
        }
        Ok(())
    }

    fn on_transactions(&mut self, txs: Vec<EthTransaction>) {
        let mut cache = self.ctx.tx_cache.lock();
        for tx in txs {
            if tx.recover_sender().is_ok() {
                cache.insert(tx.hash());
            }
        }
    }

    async fn serve_headers(&mut self, request: GetBlockHeaders) -> anyhow::Result<()> {
        let headers = match (self.ctx.params.fork_check, request.origin) {
            (Some(check), HashOrNumber::Number(number)) if number == check.height => {
                vec![dao_fork_header()]
            }
            _ => Vec::new(),
        };
        self.send(EthMessage::BlockHeaders(headers)).await
    }

    async fn emit_block(&mut self, block: EthBlock, from_initial_sync: bool) -> anyhow::Result<()> {
        {
            let mut best = self.ctx.best_seen.write();
            if best
                .as_ref()
                .is_none_or(|current| block.header.number > current.number)
            {
                *best = Some(block.header.clone());
            }
        }
        self.ctx.block_cache.lock().insert(block.hash(), ());
        self.ctx
            .events
            .send_async(RoverEvent::Block {
                source: Box::new(block),
                from_initial_sync,
            })
            .await?;
        Ok(())
    }

    async fn request_range(&mut self, from: u64, count: u64) -> anyhow::Result<()> {
        self.send(EthMessage::GetBlockHeaders(GetBlockHeaders {
            origin: HashOrNumber::Number(from),
            max_headers: count,
            skip: 0,
            reverse: false,
        }))
        .await
    }

    async fn send_status(&mut self) -> anyhow::Result<()> {
        let (total_difficulty, best_hash) = {
            let best = self.ctx.best_seen.read();
            match best.as_ref() {
                Some(header) => (header.difficulty, header.hash()),
                None => (
                    self.ctx.params.genesis_difficulty,
                    self.ctx.params.genesis_hash,
                ),
            }
        };
        self.send(EthMessage::Status(StatusMessage {
            protocol_version: crate::params::ETH_PROTOCOL_VERSION,
            network_id: self.ctx.params.network_id,
            total_difficulty,
            best_hash,
            genesis_hash: self.ctx.params.genesis_hash,
        }))
        .await
    }

    async fn send(&mut self, message: EthMessage) -> anyhow::Result<()> {
        let frame = Frame {
            code: message.code(),
            payload: message.encode_payload().into(),
        };
        self.stream.send(frame).await?;
        Ok(())
    }

    async fn finish(self, reason: DisconnectReason, ban: bool) -> anyhow::Result<()> {
        info!(peer = %self.addr, %reason, ban, "disconnecting peer");
        self.closed(ban).await
    }

    async fn closed(mut self, ban: bool) -> anyhow::Result<()> {
        let _ = self.stream.close().await;
        let _ = self
            .ctx
            .pool_events
            .send_async(PoolEvent::Closed {
                addr: self.addr,
                ban,
            })
            .await;
        Ok(())
    }
}
