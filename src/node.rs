/// The per-node actor shell around the repair engine.
///
/// A `RepairNode` owns the replica store, the orchestrator, the peer
/// sampler and the address book, and wires them to the network and the
/// clock:
///
/// - an accept loop dispatches incoming repair messages to the
///   orchestrator (every connection opens with a `hello` identifying the
///   sender);
/// - a trigger ticker fires repair rounds;
/// - a sweep ticker enforces session TTLs, replays backed-off rounds and
///   ages the sampler cache.
///
/// Outgoing traffic is grouped per peer and sent over short-lived
/// connections; transport failures are reported back to the orchestrator,
/// which owns the retry policy.
use crate::config::RepairConfig;
use crate::error::{RepairError, RepairResult};
use crate::keyspace::RingKey;
use crate::network::{Connection, Listener, Message, NodeId, PeerInfo, DEFAULT_PORT};
use crate::orchestrator::{Outbound, RepairOrchestrator};
use crate::sampler::{CyclonSampler, PeerSampler, DEFAULT_CACHE_SIZE};
use crate::stats::{RepairStats, StatsSnapshot};
use crate::store::ReplicaStore;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value as JsonValue;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::interval;
use tracing::{debug, warn};

/// Configuration for a repair node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address to bind for repair traffic.
    pub bind_addr: SocketAddr,
    /// Optional address of an existing node to join.
    pub join_addr: Option<SocketAddr>,
    /// This node's position on the ring (random if `None`).
    pub position: Option<RingKey>,
    /// Repair engine tunables.
    pub repair: RepairConfig,
    /// Peer sampler cache capacity.
    pub sampler_cache: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            join_addr: None,
            position: None,
            repair: RepairConfig::default(),
            sampler_cache: DEFAULT_CACHE_SIZE,
        }
    }
}

impl NodeConfig {
    /// Create a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set an address to join.
    pub fn join(mut self, addr: SocketAddr) -> Self {
        self.join_addr = Some(addr);
        self
    }

    /// Set the ring position.
    pub fn position(mut self, position: RingKey) -> Self {
        self.position = Some(position);
        self
    }

    /// Set the repair tunables.
    pub fn repair(mut self, repair: RepairConfig) -> Self {
        self.repair = repair;
        self
    }
}

/// Point-in-time view of a node.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub position: RingKey,
    pub is_running: bool,
    pub peer_count: usize,
    pub open_sessions: usize,
    pub stats: StatsSnapshot,
}

/// One ring node running the repair engine.
pub struct RepairNode {
    node_id: NodeId,
    position: RingKey,
    config: NodeConfig,
    store: Arc<ReplicaStore>,
    stats: Arc<RepairStats>,
    orchestrator: Arc<Mutex<RepairOrchestrator>>,
    sampler: Arc<CyclonSampler>,
    peers: Arc<DashMap<NodeId, PeerInfo>>,
    shutdown_tx: broadcast::Sender<()>,
    running: Arc<RwLock<bool>>,
    actual_addr: Arc<RwLock<Option<SocketAddr>>>,
}

impl RepairNode {
    /// Create a node. Nothing runs until [`RepairNode::start`].
    pub fn new(config: NodeConfig) -> RepairResult<Self> {
        config.repair.validate()?;
        let node_id = NodeId::new();
        let position = config
            .position
            .unwrap_or_else(|| rand::random::<u128>());
        let store = Arc::new(ReplicaStore::new());
        let stats = Arc::new(RepairStats::new());
        let mut orchestrator = RepairOrchestrator::new(
            node_id,
            Arc::clone(&store),
            config.repair.clone(),
            Arc::clone(&stats),
        );
        orchestrator.routing_mut().insert(position, node_id);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            node_id,
            position,
            sampler: Arc::new(CyclonSampler::new(config.sampler_cache)),
            config,
            store,
            stats,
            orchestrator: Arc::new(Mutex::new(orchestrator)),
            peers: Arc::new(DashMap::new()),
            shutdown_tx,
            running: Arc::new(RwLock::new(false)),
            actual_addr: Arc::new(RwLock::new(None)),
        })
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// This node's ring position.
    pub fn position(&self) -> RingKey {
        self.position
    }

    /// The replica store, for seeding and inspection.
    pub fn store(&self) -> Arc<ReplicaStore> {
        Arc::clone(&self.store)
    }

    /// Store a value locally.
    pub fn put(&self, key: RingKey, value: JsonValue, version: u64) {
        self.store.put(key, value, version);
    }

    /// The address actually bound (useful when binding port 0).
    pub async fn actual_addr(&self) -> Option<SocketAddr> {
        *self.actual_addr.read().await
    }

    /// Whether the node is running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// A snapshot of the node.
    pub async fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.node_id,
            position: self.position,
            is_running: self.is_running().await,
            peer_count: self.peers.len(),
            open_sessions: self.orchestrator.lock().await.open_sessions(),
            stats: self.stats.snapshot(),
        }
    }

    /// Fire one repair trigger immediately. A node that knows no peer
    /// (per the sampler) skips the round outright.
    pub async fn trigger_once(&self) -> RepairResult<()> {
        if self.sampler.random_peer().await.is_none() {
            debug!("no known peers; skipping repair trigger");
            return Ok(());
        }
        let outbound = {
            let mut orch = self.orchestrator.lock().await;
            orch.on_trigger(Instant::now())
        };
        self.send_outbound(outbound).await;
        Ok(())
    }

    /// Open a repair session for a specific key and quadrant offset.
    pub async fn repair_key(&self, key: RingKey, offset: u8) -> RepairResult<()> {
        let outbound = {
            let mut orch = self.orchestrator.lock().await;
            orch.start_session_for(key, offset, Instant::now())?
        };
        self.send_outbound(outbound).await;
        Ok(())
    }

    /// Start the node: bind, join, and spawn the background loops.
    pub async fn start(&self) -> RepairResult<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Err(RepairError::Network("node already running".to_string()));
            }
            *running = true;
        }

        let listener = Listener::bind(self.config.bind_addr).await?;
        let actual_addr = listener.local_addr();
        {
            let mut guard = self.actual_addr.write().await;
            *guard = Some(actual_addr);
        }

        if let Some(join_addr) = self.config.join_addr {
            self.join_ring(join_addr, actual_addr).await?;
        }

        // Accept loop.
        let ctx = self.context(actual_addr);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        if let Ok(conn) = result {
                            let ctx = ctx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(conn, ctx).await {
                                    debug!(error = %e, "connection closed");
                                }
                            });
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        // Repair trigger loop.
        let ctx = self.context(actual_addr);
        let trigger_interval = self.config.repair.trigger_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(trigger_interval);
            ticker.tick().await; // the first tick is immediate; skip it
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Lonely nodes have nothing to reconcile against.
                        if ctx.sampler.random_peer().await.is_none() {
                            continue;
                        }
                        let outbound = {
                            let mut orch = ctx.orchestrator.lock().await;
                            orch.on_trigger(Instant::now())
                        };
                        ctx.send_outbound(outbound).await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        // Session sweep and sampler ageing loop.
        let ctx = self.context(actual_addr);
        let gc_interval = self.config.repair.gc_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(gc_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let outbound = {
                            let mut orch = ctx.orchestrator.lock().await;
                            orch.on_gc_tick(Instant::now())
                        };
                        ctx.send_outbound(outbound).await;
                        ctx.sampler.age_cycle().await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Ok(())
    }

    /// Stop the node.
    pub async fn stop(&self) -> RepairResult<()> {
        let mut running = self.running.write().await;
        if !*running {
            return Ok(());
        }
        *running = false;
        let _ = self.shutdown_tx.send(());
        Ok(())
    }

    /// Join an existing ring through a seed node.
    async fn join_ring(&self, seed: SocketAddr, own_addr: SocketAddr) -> RepairResult<()> {
        let mut conn = Connection::connect(seed).await?;
        conn.send(&Message::Hello {
            node_id: self.node_id,
            position: self.position,
            address: own_addr,
        })
        .await?;
        let reply = conn.receive().await?;
        let Message::HelloAck {
            node_id,
            position,
            peers,
        } = reply
        else {
            return Err(RepairError::Network(format!(
                "unexpected join reply: {:?}",
                reply
            )));
        };

        let ctx = self.context(own_addr);
        ctx.register_peer(PeerInfo::new(node_id, position, seed)).await;
        let known: Vec<PeerInfo> = peers
            .into_iter()
            .filter(|p| p.node_id != self.node_id)
            .collect();
        for info in &known {
            ctx.register_peer(info.clone()).await;
        }

        // Introduce ourselves to everyone we just learned about.
        let hello = Message::Hello {
            node_id: self.node_id,
            position: self.position,
            address: own_addr,
        };
        let sends = known.iter().map(|info| {
            let hello = hello.clone();
            let addr = info.address;
            async move {
                match Connection::connect(addr).await {
                    Ok(mut conn) => conn.send(&hello).await,
                    Err(e) => Err(e),
                }
            }
        });
        for result in join_all(sends).await {
            if let Err(e) = result {
                debug!(error = %e, "introduction failed");
            }
        }
        Ok(())
    }

    fn context(&self, own_addr: SocketAddr) -> NodeContext {
        NodeContext {
            node_id: self.node_id,
            position: self.position,
            own_addr,
            orchestrator: Arc::clone(&self.orchestrator),
            sampler: Arc::clone(&self.sampler),
            peers: Arc::clone(&self.peers),
        }
    }

    async fn send_outbound(&self, outbound: Vec<Outbound>) {
        let own_addr = self
            .actual_addr
            .read()
            .await
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0)));
        self.context(own_addr).send_outbound(outbound).await;
    }
}

/// The shared state background tasks operate on.
#[derive(Clone)]
struct NodeContext {
    node_id: NodeId,
    position: RingKey,
    own_addr: SocketAddr,
    orchestrator: Arc<Mutex<RepairOrchestrator>>,
    sampler: Arc<CyclonSampler>,
    peers: Arc<DashMap<NodeId, PeerInfo>>,
}

impl NodeContext {
    async fn register_peer(&self, info: PeerInfo) {
        if info.node_id == self.node_id {
            return;
        }
        {
            let mut orch = self.orchestrator.lock().await;
            orch.routing_mut().insert(info.position, info.node_id);
        }
        self.sampler
            .on_neighbourhood_change(std::slice::from_ref(&info))
            .await;
        self.peers
            .entry(info.node_id)
            .and_modify(|existing| {
                existing.address = info.address;
                existing.position = info.position;
                existing.touch();
            })
            .or_insert(info);
    }

    /// Group messages per peer and deliver them over short-lived
    /// connections, reporting failures to the orchestrator.
    async fn send_outbound(&self, outbound: Vec<Outbound>) {
        if outbound.is_empty() {
            return;
        }
        let mut by_peer: Vec<(NodeId, Vec<Message>)> = Vec::new();
        for out in outbound {
            match by_peer.iter_mut().find(|(peer, _)| *peer == out.to) {
                Some((_, msgs)) => msgs.push(out.msg),
                None => by_peer.push((out.to, vec![out.msg])),
            }
        }

        let sends = by_peer.into_iter().map(|(peer, msgs)| {
            let ctx = self.clone();
            async move {
                let Some(address) = ctx.peers.get(&peer).map(|p| p.address) else {
                    warn!(peer = %peer, "no address for peer; dropping messages");
                    return;
                };
                let hello = Message::Hello {
                    node_id: ctx.node_id,
                    position: ctx.position,
                    address: ctx.own_addr,
                };
                let result = async {
                    let mut conn = Connection::connect(address).await?;
                    conn.send(&hello).await?;
                    for msg in &msgs {
                        conn.send(msg).await?;
                    }
                    // Consume the hello ack before closing so the peer
                    // never writes into a reset socket, which could drop
                    // our still-buffered messages with it.
                    let _ = conn.receive().await;
                    Ok::<(), RepairError>(())
                }
                .await;
                if let Err(e) = result {
                    debug!(peer = %peer, error = %e, "send failed");
                    let now = Instant::now();
                    let mut orch = ctx.orchestrator.lock().await;
                    for msg in &msgs {
                        orch.on_send_failure(peer, msg, now);
                    }
                }
            }
        });
        join_all(sends).await;
    }
}

/// Serve one incoming connection. The first message must be a `hello`
/// identifying the sender; repair messages are dispatched under that
/// identity.
async fn handle_connection(mut conn: Connection, ctx: NodeContext) -> RepairResult<()> {
    let first = conn.receive().await?;
    let Message::Hello {
        node_id,
        position,
        address,
    } = first
    else {
        return Err(RepairError::Network(
            "connection did not open with hello".to_string(),
        ));
    };
    ctx.register_peer(PeerInfo::new(node_id, position, address)).await;

    // Reply with our view of the ring; joiners read it, senders may not.
    let ack = Message::HelloAck {
        node_id: ctx.node_id,
        position: ctx.position,
        peers: ctx.peers.iter().map(|p| p.value().clone()).collect(),
    };
    if conn.send(&ack).await.is_err() {
        debug!(peer = %node_id, "peer did not read hello ack");
    }

    loop {
        let msg = match conn.receive().await {
            Ok(msg) => msg,
            Err(_) => break, // peer closed the connection
        };
        let outbound = {
            let mut orch = ctx.orchestrator.lock().await;
            orch.on_message(node_id, msg, Instant::now())
        };
        ctx.send_outbound(outbound).await;
    }
    Ok(())
}
