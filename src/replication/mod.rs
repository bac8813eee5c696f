//! Replication fabric (spec.md §4.6): peer connection, message framing,
//! loop suppression, snapshot exchange, multi-transport muxing.
//!
//! Architecture is grounded on the teacher's `S2sManager`
//! (`s2s.rs::S2sManager`/`PeerEntry`): a connection map keyed by peer id,
//! an ordered broadcast queue so fan-out preserves submission order, and a
//! background task that applies inbound messages. Where the teacher is
//! IRC-event-specific, this module generalises to the three message types
//! spec.md §4.6 defines.

pub mod dht;
pub mod relay;
pub mod socket;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::record::NodeRecord;

/// Wire-level message (spec.md §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "put")]
    Put {
        #[serde(rename = "originId")]
        origin_id: String,
        node: NodeRecord,
    },
    /// Legacy compatibility shape: accepted on inbound, never produced.
    #[serde(rename = "put_legacy")]
    PutLegacy {
        #[serde(rename = "originId")]
        origin_id: String,
        id: String,
        data: crate::record::DataMap,
    },
    #[serde(rename = "delete")]
    Delete {
        #[serde(rename = "originId")]
        origin_id: String,
        id: String,
    },
    #[serde(rename = "sync_request")]
    SyncRequest {
        #[serde(rename = "originId")]
        origin_id: String,
    },
}

impl Message {
    pub fn origin_id(&self) -> &str {
        match self {
            Message::Put { origin_id, .. } => origin_id,
            Message::PutLegacy { origin_id, .. } => origin_id,
            Message::Delete { origin_id, .. } => origin_id,
            Message::SyncRequest { origin_id } => origin_id,
        }
    }
}

/// An established connection to a peer. Transports (`socket`, `dht`,
/// `relay`) each provide an implementation; the fabric is generic over it
/// (spec.md §9 "Polymorphism over transports").
#[async_trait]
pub trait Connection: Send + Sync {
    /// Best-effort peer identifier for this connection (spec.md §4.6:
    /// iroh public key hex on the DHT transport, connection index/remote
    /// address otherwise).
    fn peer_id(&self) -> &str;

    async fn send(&self, msg: &Message) -> anyhow::Result<()>;

    async fn close(&self);
}

/// A transport accepts inbound connections and dials outbound ones.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start listening, if this transport supports inbound connections.
    /// New connections are registered with `fabric` as they arrive.
    async fn listen(&self, fabric: Arc<ReplicationFabric>) -> anyhow::Result<()>;

    /// Dial an outbound peer, registering the resulting connection with
    /// `fabric` and returning its connection id so the caller can address
    /// that connection specifically (spec.md §4.6 "On `OPEN` (outbound
    /// dial), send a `sync_request` once" — scoped to the new connection,
    /// not a fabric-wide broadcast). Honours a per-attempt timeout (spec.md
    /// §5).
    async fn dial(&self, address: &str, fabric: Arc<ReplicationFabric>) -> anyhow::Result<String>;
}

/// An inbound message, tagged with which connection it arrived on (so
/// re-broadcast can exclude it) — spec.md §4.6 loop suppression.
pub struct InboundMessage {
    pub from_connection: String,
    pub message: Message,
}

/// Per-connection state machine (spec.md §4.6). Transports report
/// transitions; the fabric only acts on `Open`/`Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Open,
    Closing,
    Closed,
    Error,
}

/// Owns the connection map and the self peer id; performs loop suppression
/// and fan-out. Exclusively owned by `facade::Database` (spec.md §3.6).
pub struct ReplicationFabric {
    self_id: String,
    connections: SyncMutex<HashMap<String, Arc<dyn Connection>>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    peers_connected: AtomicU64,
    pub metrics: SyncMutex<ReplicationMetrics>,
}

/// Observability counters (SPEC_FULL.md §2.5, grounded on the teacher's
/// `CrdtMetrics`).
#[derive(Debug, Clone, Default)]
pub struct ReplicationMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_failures: u64,
    pub parse_failures: u64,
}

impl ReplicationFabric {
    /// Create a fabric and return it along with the receiver the façade
    /// should drain in its serialised domain.
    pub fn new(self_id: String) -> (Arc<Self>, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(1024);
        let fabric = Arc::new(Self {
            self_id,
            connections: SyncMutex::new(HashMap::new()),
            inbound_tx: tx,
            peers_connected: AtomicU64::new(0),
            metrics: SyncMutex::new(ReplicationMetrics::default()),
        });
        (fabric, rx)
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn peers_connected(&self) -> u64 {
        self.peers_connected.load(Ordering::Relaxed)
    }

    /// Register a newly-opened connection (spec.md §4.6 peer lifecycle:
    /// `CONNECTING -> OPEN`).
    pub fn register_connection(&self, conn: Arc<dyn Connection>) {
        let id = conn.peer_id().to_string();
        self.connections.lock().insert(id, conn);
        self.peers_connected.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove a connection on close/error (spec.md §4.6: "remove the
    /// connection from the fabric's connection map and deduct from the
    /// peers-connected counter").
    pub fn remove_connection(&self, peer_id: &str) {
        if self.connections.lock().remove(peer_id).is_some() {
            self.peers_connected.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Deliver an inbound frame to the façade's serialised domain, after
    /// loop suppression (spec.md §4.6: "every inbound message with
    /// originId == self is silently dropped before any side effect").
    pub async fn deliver_inbound(&self, from_connection: String, message: Message) {
        if message.origin_id() == self.self_id {
            tracing::trace!(peer = %from_connection, "dropping self-origin echo");
            return;
        }
        {
            let mut m = self.metrics.lock();
            m.messages_received += 1;
        }
        if self.inbound_tx.send(InboundMessage { from_connection, message }).await.is_err() {
            tracing::warn!("inbound channel closed, dropping message");
        }
    }

    /// Broadcast `msg` to every connected peer except `exclude` (spec.md
    /// §4.6: "re-broadcast accepted messages to all other peers"). Send
    /// failures on one connection are logged and ignored — they never
    /// interrupt delivery to the rest (spec.md §7).
    pub async fn broadcast(&self, msg: Message, exclude: Option<&str>) {
        let targets: Vec<Arc<dyn Connection>> = {
            let conns = self.connections.lock();
            conns
                .iter()
                .filter(|(id, _)| Some(id.as_str()) != exclude)
                .map(|(_, c)| Arc::clone(c))
                .collect()
        };
        for conn in targets {
            match conn.send(&msg).await {
                Ok(()) => {
                    let mut m = self.metrics.lock();
                    m.messages_sent += 1;
                }
                Err(e) => {
                    tracing::warn!(peer = %conn.peer_id(), "S2S-style broadcast send failed: {e}");
                    let mut m = self.metrics.lock();
                    m.send_failures += 1;
                }
            }
        }
    }

    /// Send `msg` to exactly one peer (used to answer `sync_request`
    /// without fanning out to the rest of the mesh).
    pub async fn send_to(&self, peer_id: &str, msg: &Message) -> anyhow::Result<()> {
        let conn = {
            let conns = self.connections.lock();
            conns.get(peer_id).cloned()
        };
        match conn {
            Some(c) => c.send(msg).await,
            None => Err(anyhow::anyhow!("no connection for peer {peer_id}")),
        }
    }

    /// Tear down every connection (spec.md §5 resource release order:
    /// connections first).
    pub async fn close_all(&self) {
        let conns: Vec<Arc<dyn Connection>> = {
            let mut map = self.connections.lock();
            map.drain().map(|(_, c)| c).collect()
        };
        for conn in conns {
            conn.close().await;
        }
        self.peers_connected.store(0, Ordering::Relaxed);
    }
}
