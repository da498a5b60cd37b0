/// Peer-sampling service, CYCLON style.
///
/// The repair orchestrator needs one thing from gossip: a uniformly random
/// known peer. The contract is the [`PeerSampler`] trait; the bundled
/// implementation keeps a bounded cache of peer descriptors with age-based
/// eviction, seeded from known hosts at bootstrap and refreshed from
/// neighbourhood-change notifications. The shuffle exchange itself (cycle
/// length, shuffle width) lives with the gossip layer and is configuration
/// from this module's point of view.
use crate::network::{NodeId, PeerInfo};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::sync::RwLock;

/// Default cache capacity.
pub const DEFAULT_CACHE_SIZE: usize = 20;

/// Contract between the repair engine and the gossip layer.
#[async_trait]
pub trait PeerSampler: Send + Sync {
    /// A uniformly random known peer, `None` when no peer is known.
    async fn random_peer(&self) -> Option<NodeId>;

    /// Notification that the neighbourhood (predecessor/successor set)
    /// changed; implementations may seed their cache from it.
    async fn on_neighbourhood_change(&self, neighbours: &[PeerInfo]);
}

#[derive(Debug, Clone)]
struct CacheEntry {
    peer: NodeId,
    age: u32,
}

/// Gossip-backed sampler with a bounded, age-evicted cache.
#[derive(Debug)]
pub struct CyclonSampler {
    capacity: usize,
    cache: RwLock<Vec<CacheEntry>>,
}

impl CyclonSampler {
    /// Create an empty sampler.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            cache: RwLock::new(Vec::new()),
        }
    }

    /// Seed the cache from the bootstrap host list.
    pub async fn bootstrap(&self, known_hosts: &[NodeId]) {
        let mut cache = self.cache.write().await;
        for &peer in known_hosts {
            upsert(&mut cache, peer);
        }
        evict(&mut cache, self.capacity);
    }

    /// One ageing cycle: every entry grows older, the oldest entries are
    /// evicted beyond capacity.
    pub async fn age_cycle(&self) {
        let mut cache = self.cache.write().await;
        for entry in cache.iter_mut() {
            entry.age += 1;
        }
        evict(&mut cache, self.capacity);
    }

    /// Number of cached peers.
    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Whether the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }

    /// Drop a peer (e.g. it was found unreachable).
    pub async fn forget(&self, peer: NodeId) {
        self.cache.write().await.retain(|e| e.peer != peer);
    }
}

#[async_trait]
impl PeerSampler for CyclonSampler {
    async fn random_peer(&self) -> Option<NodeId> {
        let cache = self.cache.read().await;
        cache.choose(&mut rand::thread_rng()).map(|e| e.peer)
    }

    async fn on_neighbourhood_change(&self, neighbours: &[PeerInfo]) {
        let mut cache = self.cache.write().await;
        for info in neighbours {
            upsert(&mut cache, info.node_id);
        }
        evict(&mut cache, self.capacity);
    }
}

/// Insert a peer or refresh its age to zero.
fn upsert(cache: &mut Vec<CacheEntry>, peer: NodeId) {
    match cache.iter_mut().find(|e| e.peer == peer) {
        Some(entry) => entry.age = 0,
        None => cache.push(CacheEntry { peer, age: 0 }),
    }
}

/// Evict the oldest entries down to capacity.
fn evict(cache: &mut Vec<CacheEntry>, capacity: usize) {
    if cache.len() > capacity {
        cache.sort_by_key(|e| e.age);
        cache.truncate(capacity);
    }
}
