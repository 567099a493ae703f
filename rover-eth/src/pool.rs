use crate::FatalError;
use crate::params::{DPT_BAN_DURATION, NodeRecord, PORT_SCAN_END, PORT_SCAN_START};
use crate::peer::{PeerSession, SessionCommand};
use crate::wire::DisconnectReason;
use crate::EthContext;
use rover_lib::metrics::SharedMetrics;
use rover_lib::planner::Batch;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DIAL_INTERVAL: Duration = Duration::from_secs(10);
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Jitter never pushes the effective peer target below this.
const MIN_PEER_TARGET: usize = 3;

/// Events flowing from peer sessions (and dial tasks) into the pool.
#[derive(Debug)]
pub enum PoolEvent {
    Verified(SocketAddr),
    Closed { addr: SocketAddr, ban: bool },
    Outbound { record: NodeRecord, stream: TcpStream },
}

#[derive(Debug)]
pub enum PoolCommand {
    DispatchRange {
        batch: Batch,
        reply: tokio::sync::oneshot::Sender<bool>,
    },
}

/// Claims a devp2p endpoint by scanning for the first free port: UDP for
/// discovery, TCP for the peer transport, both on the same port.
pub async fn bind_endpoint() -> Result<(UdpSocket, TcpListener, u16), FatalError> {
    for port in PORT_SCAN_START..=PORT_SCAN_END {
        let Ok(udp) = UdpSocket::bind(("0.0.0.0", port)).await else {
            continue;
        };
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => return Ok((udp, listener, port)),
            Err(_) => continue,
        }
    }
    Err(FatalError::PortExhaustion)
}

/// Discovery bootstrap state: the candidate rotation and the ban list. The
/// UDP socket holds the DPT port; the kademlia neighbor exchange sits
/// behind this seam.
pub struct Discovery {
    _socket: UdpSocket,
    candidates: VecDeque<NodeRecord>,
    banned: HashMap<SocketAddr, Instant>,
}

impl Discovery {
    pub fn new(socket: UdpSocket, bootnodes: Vec<NodeRecord>) -> Self {
        Self {
            _socket: socket,
            candidates: bootnodes.into(),
            banned: HashMap::new(),
        }
    }

    pub fn ban(&mut self, addr: SocketAddr) {
        warn!(peer = %addr, "banning peer in discovery");
        self.banned.insert(addr, Instant::now() + DPT_BAN_DURATION);
    }

    pub fn is_banned(&self, addr: &SocketAddr) -> bool {
        self.banned
            .get(addr)
            .is_some_and(|until| *until > Instant::now())
    }

    fn prune_bans(&mut self) {
        let now = Instant::now();
        self.banned.retain(|_, until| *until > now);
    }

    /// Next dial targets, rotating through the candidate list and skipping
    /// banned or already-connected addresses.
    fn take_candidates(
        &mut self,
        count: usize,
        connected: &HashSet<SocketAddr>,
    ) -> Vec<NodeRecord> {
        self.prune_bans();
        let mut picked = Vec::new();
        for _ in 0..self.candidates.len() {
            if picked.len() == count {
                break;
            }
            let Some(candidate) = self.candidates.pop_front() else {
                break;
            };
            self.candidates.push_back(candidate.clone());
            if connected.contains(&candidate.addr) || self.is_banned(&candidate.addr) {
                continue;
            }
            picked.push(candidate);
        }
        picked
    }
}

struct SessionHandle {
    commands: flume::Sender<SessionCommand>,
}

/// Owns every peer session and the verified-peer map; all mutation happens
/// on this task, driven by events from sessions and commands from the
/// rover driver.
pub struct PeerPool {
    ctx: Arc<EthContext>,
    max_peers: usize,
    listener: TcpListener,
    discovery: Discovery,
    sessions: HashMap<SocketAddr, SessionHandle>,
    verified: HashSet<SocketAddr>,
    events_rx: flume::Receiver<PoolEvent>,
    commands_rx: flume::Receiver<PoolCommand>,
    shutdown_rx: tokio::sync::mpsc::Receiver<()>,
    metrics: SharedMetrics,
}

/// Random subset size used when routing one request: any k >= 2 satisfies
/// the dispatch invariant, the square root keeps fan-out economical.
fn selection_count(verified: usize) -> usize {
    usize::max(2, (verified as f64).sqrt().ceil() as usize)
}

impl PeerPool {
    pub fn new(
        ctx: Arc<EthContext>,
        configured_max_peers: usize,
        listener: TcpListener,
        discovery_socket: UdpSocket,
        events_rx: flume::Receiver<PoolEvent>,
        commands_rx: flume::Receiver<PoolCommand>,
        shutdown_rx: tokio::sync::mpsc::Receiver<()>,
        metrics: SharedMetrics,
    ) -> Self {
        let jitter: i64 = rand::random_range(-9..=9);
        let max_peers =
            usize::max(MIN_PEER_TARGET, (configured_max_peers as i64 + jitter).max(0) as usize);
        info!(max_peers, jitter, "peer pool starting");

        let discovery = Discovery::new(discovery_socket, ctx.params.bootnodes.clone());
        Self {
            ctx,
            max_peers,
            listener,
            discovery,
            sessions: HashMap::new(),
            verified: HashSet::new(),
            events_rx,
            commands_rx,
            shutdown_rx,
            metrics,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("peer pool task started");
        let mut dial_tick = tokio::time::interval(DIAL_INTERVAL);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => {
                    info!("peer pool shutting down");
                    self.disconnect_all().await;
                    return Ok(());
                }
                event = self.events_rx.recv_async() => {
                    let Ok(event) = event else {
                        warn!("pool event channel closed");
                        self.disconnect_all().await;
                        return Ok(());
                    };
                    self.handle_event(event);
                }
                command = self.commands_rx.recv_async() => {
                    let Ok(command) = command else {
                        warn!("pool command channel closed");
                        self.disconnect_all().await;
                        return Ok(());
                    };
                    match command {
                        PoolCommand::DispatchRange { batch, reply } => {
                            let dispatched = self.dispatch(batch).await;
                            let _ = reply.send(dispatched);
                        }
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.admit_inbound(addr, stream),
                        Err(err) => debug!(%err, "accept failed"),
                    }
                }
                _ = dial_tick.tick() => {
                    self.dial_candidates();
                }
            }
        }
    }

    fn handle_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Verified(addr) => {
                if self.sessions.contains_key(&addr) {
                    self.verified.insert(addr);
                    self.metrics.set_peers_verified(self.verified.len() as u64);
                }
            }
            PoolEvent::Closed { addr, ban } => {
                self.sessions.remove(&addr);
                self.verified.remove(&addr);
                if ban {
                    self.discovery.ban(addr);
                }
                self.metrics.set_peers_verified(self.verified.len() as u64);
            }
            PoolEvent::Outbound { record, stream } => {
                if self.sessions.len() < self.max_peers
                    && !self.sessions.contains_key(&record.addr)
                {
                    self.spawn_session(record.addr, stream);
                }
            }
        }
    }

    fn admit_inbound(&mut self, addr: SocketAddr, stream: TcpStream) {
        if self.sessions.len() >= self.max_peers {
            debug!(peer = %addr, "at capacity, refusing inbound peer");
            return;
        }
        if self.discovery.is_banned(&addr) {
            debug!(peer = %addr, "refusing banned inbound peer");
            return;
        }
        self.spawn_session(addr, stream);
    }

    fn spawn_session(&mut self, addr: SocketAddr, stream: TcpStream) {
        debug!(peer = %addr, "starting peer session");
        let (commands_tx, commands_rx) = flume::bounded(16);
        let session = PeerSession::new(addr, stream, self.ctx.clone(), commands_rx);
        let events_tx = self.ctx.pool_events.clone();
        tokio::spawn(async move {
            _ = session
                .run()
                .await
                .inspect_err(|err| debug!(peer = %addr, %err, "peer session ended with error"));
            // errored sessions bypass the session's own close path; a
            // duplicate Closed for clean ones is idempotent
            let _ = events_tx
                .send_async(PoolEvent::Closed { addr, ban: false })
                .await;
        });
        self.sessions.insert(
            addr,
            SessionHandle {
                commands: commands_tx,
            },
        );
    }

    fn dial_candidates(&mut self) {
        let deficit = self.max_peers.saturating_sub(self.sessions.len());
        if deficit == 0 {
            return;
        }
        let connected: HashSet<SocketAddr> = self.sessions.keys().copied().collect();
        for record in self.discovery.take_candidates(deficit, &connected) {
            let events_tx = self.ctx.pool_events.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(record.addr)).await {
                    Ok(Ok(stream)) => {
                        let _ = events_tx
                            .send_async(PoolEvent::Outbound { record, stream })
                            .await;
                    }
                    Ok(Err(err)) => debug!(peer = %record.addr, %err, "dial failed"),
                    Err(_) => debug!(peer = %record.addr, "dial timed out"),
                }
            });
        }
    }

    /// Sends one header request per chosen peer. Returns false when fewer
    /// than two verified peers are available; the caller retries later.
    async fn dispatch(&mut self, batch: Batch) -> bool {
        if self.verified.len() < 2 {
            debug!(
                verified = self.verified.len(),
                "not enough verified peers for dispatch"
            );
            return false;
        }
        let chosen: Vec<SocketAddr> = {
            use rand::seq::IndexedRandom;
            let verified: Vec<SocketAddr> = self.verified.iter().copied().collect();
            let k = selection_count(verified.len());
            let mut rng = rand::rng();
            verified.choose_multiple(&mut rng, k).copied().collect()
        };
        debug!(
            from = batch.from,
            to = batch.to,
            peers = chosen.len(),
            "dispatching batch"
        );
        for addr in chosen {
            if let Some(handle) = self.sessions.get(&addr) {
                let _ = handle
                    .commands
                    .send_async(SessionCommand::RequestRange {
                        from: batch.from,
                        count: batch.len(),
                    })
                    .await
                    .inspect_err(|_| debug!(peer = %addr, "session command channel closed"));
            }
        }
        true
    }

    async fn disconnect_all(&mut self) {
        for (addr, handle) in self.sessions.drain() {
            let _ = handle
                .commands
                .send_async(SessionCommand::Disconnect(
                    DisconnectReason::DisconnectRequested,
                ))
                .await
                .inspect_err(|_| debug!(peer = %addr, "session already gone"));
        }
        self.verified.clear();
        self.metrics.set_peers_verified(0);
    }
}
