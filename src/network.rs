/// Network layer for the repair protocol.
///
/// This module provides the node-to-node wire protocol: the message types,
/// the blob codec for resolve payloads, and TCP connection management.
///
/// # Protocol Design
///
/// Messages travel over TCP as a 4-byte big-endian length header followed
/// by a JSON-encoded payload. Message names are part of the wire contract
/// (`request_sync`, `bloom_summary`, `merkle_summary`, `art_summary`,
/// `resolve_update`, `resolve_regen`, `session_done`, `session_abort`);
/// every repair message carries the session id, which is monotonically
/// increasing and unique per initiator.
///
/// Ordering is FIFO per sender/receiver pair and nothing more; sessions
/// are robust to reordering across peers.
use crate::error::{RepairError, RepairResult};
use crate::keyspace::{Interval, RingKey};
use crate::reconciliation::{BloomParts, MerkleDigest, ReconMethod};
use crate::session::{AbortReason, SessionStats};
use crate::store::DbEntry;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

/// Default port for repair traffic.
pub const DEFAULT_PORT: u16 = 14195;

/// Maximum message size (16 MB).
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Unique identifier for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Generate a new random node ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Information about a peer node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Unique node identifier.
    pub node_id: NodeId,
    /// The peer's position on the ring.
    pub position: RingKey,
    /// Network address of the peer.
    pub address: SocketAddr,
    /// When this peer was first seen.
    pub first_seen: DateTime<Utc>,
    /// When this peer was last seen.
    pub last_seen: DateTime<Utc>,
}

impl PeerInfo {
    /// Create new peer info.
    pub fn new(node_id: NodeId, position: RingKey, address: SocketAddr) -> Self {
        let now = Utc::now();
        Self {
            node_id,
            position,
            address,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Update the last seen timestamp.
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}

/// Protocol messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Message {
    // ─────────────────────────────────────────────────────────────────────
    // Membership envelope
    // ─────────────────────────────────────────────────────────────────────
    /// Introduce ourselves to a peer.
    Hello {
        node_id: NodeId,
        position: RingKey,
        address: SocketAddr,
    },

    /// Reply to a hello with the peers we know.
    HelloAck {
        node_id: NodeId,
        position: RingKey,
        peers: Vec<PeerInfo>,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Repair protocol
    // ─────────────────────────────────────────────────────────────────────
    /// Open a reconciliation session toward the peer responsible for
    /// `replica_key`. `interval` is the session scope in logical (home)
    /// coordinates.
    RequestSync {
        session: u64,
        method: ReconMethod,
        replica_key: RingKey,
        interval: Interval,
    },

    /// A Bloom filter over the item fingerprints of `interval`. The
    /// filter carries its `(filter_bytes, m, k, seed)` wire parameters.
    BloomSummary {
        session: u64,
        interval: Interval,
        filter: BloomParts,
    },

    /// One round of Merkle signature descent.
    MerkleSummary {
        session: u64,
        level: u32,
        hashes: Vec<MerkleDigest>,
    },

    /// An approximate reconciliation tree, all levels at once.
    ArtSummary {
        session: u64,
        level: u32,
        interval: Interval,
        #[serde(rename = "filter_bytes")]
        filters: Vec<BloomParts>,
        leaf_filter: BloomParts,
    },

    /// Push one replica entry toward the peer.
    ResolveUpdate { session: u64, entry: DbEntry },

    /// Ask the peer to send its replica of `key`.
    ResolveRegen { session: u64, key: RingKey },

    /// The sender considers the session complete.
    SessionDone { session: u64, stats: SessionStats },

    /// The sender has terminated the session.
    SessionAbort { session: u64, reason: AbortReason },
}

impl Message {
    /// Serialize to bytes.
    pub fn to_bytes(&self) -> RepairResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(RepairError::Serialization)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> RepairResult<Self> {
        serde_json::from_slice(bytes).map_err(RepairError::Serialization)
    }

    /// The session id carried by repair messages, if any.
    pub fn session(&self) -> Option<u64> {
        match self {
            Message::RequestSync { session, .. }
            | Message::BloomSummary { session, .. }
            | Message::MerkleSummary { session, .. }
            | Message::ArtSummary { session, .. }
            | Message::ResolveUpdate { session, .. }
            | Message::ResolveRegen { session, .. }
            | Message::SessionDone { session, .. }
            | Message::SessionAbort { session, .. } => Some(*session),
            Message::Hello { .. } | Message::HelloAck { .. } => None,
        }
    }
}

/// Blob codec for resolve payloads: a value and its version, bincode
/// encoded. `decode(encode(v, n)) == (v, n)`.
pub fn encode_blob<T: Serialize>(value: &T, version: u64) -> RepairResult<Vec<u8>> {
    Ok(bincode::serialize(&(value, version))?)
}

/// Inverse of [`encode_blob`].
pub fn decode_blob<T: DeserializeOwned>(bytes: &[u8]) -> RepairResult<(T, u64)> {
    Ok(bincode::deserialize(bytes)?)
}

/// Network connection to a peer.
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl Connection {
    /// Wrap an accepted TCP stream.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self { stream, peer_addr }
    }

    /// Connect to a peer.
    pub async fn connect(addr: SocketAddr) -> RepairResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| RepairError::Network(format!("failed to connect to {}: {}", addr, e)))?;
        Ok(Self::new(stream, addr))
    }

    /// The peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Send one framed message.
    pub async fn send(&mut self, message: &Message) -> RepairResult<()> {
        let bytes = message.to_bytes()?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(RepairError::Network(format!(
                "message too large: {} bytes (max: {})",
                bytes.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let len = bytes.len() as u32;
        self.stream
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| RepairError::Network(format!("failed to write message length: {}", e)))?;
        self.stream
            .write_all(&bytes)
            .await
            .map_err(|e| RepairError::Network(format!("failed to write message body: {}", e)))?;
        self.stream
            .flush()
            .await
            .map_err(|e| RepairError::Network(format!("failed to flush stream: {}", e)))?;
        Ok(())
    }

    /// Receive one framed message.
    pub async fn receive(&mut self) -> RepairResult<Message> {
        let mut len_bytes = [0u8; 4];
        self.stream
            .read_exact(&mut len_bytes)
            .await
            .map_err(|e| RepairError::Network(format!("failed to read message length: {}", e)))?;

        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(RepairError::Network(format!(
                "message too large: {} bytes (max: {})",
                len, MAX_MESSAGE_SIZE
            )));
        }

        let mut bytes = vec![0u8; len];
        self.stream
            .read_exact(&mut bytes)
            .await
            .map_err(|e| RepairError::Network(format!("failed to read message body: {}", e)))?;
        Message::from_bytes(&bytes)
    }
}

/// TCP listener for incoming repair connections.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind and start listening.
    pub async fn bind(addr: SocketAddr) -> RepairResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RepairError::Network(format!("failed to bind to {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RepairError::Network(format!("failed to get local address: {}", e)))?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept one incoming connection.
    pub async fn accept(&self) -> RepairResult<Connection> {
        let (stream, peer_addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| RepairError::Network(format!("failed to accept connection: {}", e)))?;
        Ok(Connection::new(stream, peer_addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_node_id_uniqueness() {
        assert_ne!(NodeId::new(), NodeId::new());
    }

    #[test]
    fn test_message_wire_names() {
        let msg = Message::RequestSync {
            session: 1,
            method: ReconMethod::Bloom,
            replica_key: 99,
            interval: Interval::arc(0, 10),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("request_sync").is_some());

        let msg = Message::SessionAbort {
            session: 1,
            reason: AbortReason::Conflict,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["session_abort"]["reason"], "conflict");
    }

    #[test]
    fn test_bloom_summary_carries_filter_params() {
        let msg = Message::BloomSummary {
            session: 3,
            interval: Interval::arc(0, 10),
            filter: BloomParts {
                filter_bytes: vec![1, 2, 3],
                m: 24,
                k: 2,
                seed: 7,
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        let filter = &json["bloom_summary"]["filter"];
        assert_eq!(filter["m"], 24);
        assert_eq!(filter["k"], 2);
        assert_eq!(filter["seed"], 7);
        assert!(filter.get("filter_bytes").is_some());
    }

    #[test]
    fn test_large_keys_survive_the_wire() {
        let msg = Message::ResolveRegen {
            session: 1,
            key: u128::MAX - 5,
        };
        let decoded = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert!(matches!(decoded, Message::ResolveRegen { key, .. } if key == u128::MAX - 5));
    }

    #[test]
    fn test_message_round_trip() {
        let msg = Message::ResolveRegen {
            session: 17,
            key: 1 << 100,
        };
        let bytes = msg.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();
        match decoded {
            Message::ResolveRegen { session, key } => {
                assert_eq!(session, 17);
                assert_eq!(key, 1 << 100);
            }
            other => panic!("expected resolve_regen, got {:?}", other),
        }
    }

    #[test]
    fn test_blob_codec_round_trip() {
        let bytes = encode_blob(&180_000_001u64, 4).unwrap();
        let (value, version): (u64, u64) = decode_blob(&bytes).unwrap();
        assert_eq!((value, version), (180_000_001, 4));
    }

    #[tokio::test]
    async fn test_listener_and_connection() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 0);
        let listener = Listener::bind(addr).await.unwrap();
        let listen_addr = listener.local_addr();

        let accept_handle = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let msg = conn.receive().await.unwrap();
            conn.send(&Message::SessionDone {
                session: 1,
                stats: SessionStats::default(),
            })
            .await
            .unwrap();
            msg
        });

        let mut client = Connection::connect(listen_addr).await.unwrap();
        client
            .send(&Message::ResolveRegen { session: 1, key: 5 })
            .await
            .unwrap();

        let response = client.receive().await.unwrap();
        assert!(matches!(response, Message::SessionDone { session: 1, .. }));

        let received = accept_handle.await.unwrap();
        assert!(matches!(received, Message::ResolveRegen { session: 1, .. }));
    }
}
