//! DHT-style discovery transport (spec.md §4.6 variant (b)).
//!
//! Grounded on the teacher's `iroh.rs`: a persistent secret key gives the
//! endpoint a stable identity across restarts, and peers rendezvous over
//! iroh's QUIC transport keyed by an ALPN. The sync key (spec.md §4.6 "a
//! shared 32-byte secret selects which mesh a node joins") selects the
//! ALPN the same way the teacher derives `S2S_ALPN`, and framing follows
//! `s2s.rs`'s newline-delimited JSON over a single bidirectional stream.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use iroh::endpoint::Connection as IrohConnection;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use super::{Connection, Message, ReplicationFabric, Transport};
use crate::error::{CoreError, CoreResult};

/// Derive an ALPN for a given sync key so only nodes sharing the same key
/// negotiate a connection (spec.md §4.6: "nodes with different sync keys
/// never see each other on the DHT transport").
fn alpn_for_sync_key(sync_key: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(b"graphdb-core/dht/1/");
    hasher.update(sync_key.as_bytes());
    let digest = hasher.finalize();
    format!("graphdb/dht/{}", hex::encode(&digest[..8])).into_bytes()
}

/// Load a persistent iroh secret key from `path`, generating and
/// persisting one on first use (teacher's `load_or_create_secret_key`).
fn load_or_create_secret_key(path: &Path) -> CoreResult<iroh::SecretKey> {
    if path.exists() {
        let hex_str = std::fs::read_to_string(path)
            .map_err(|e| CoreError::StorageRead(e.to_string()))?;
        hex_str
            .trim()
            .parse()
            .map_err(|e| CoreError::StorageRead(format!("invalid iroh secret key: {e}")))
    } else {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let key = iroh::SecretKey::from_bytes(&bytes);
        let hex_str: String = key.to_bytes().iter().map(|b| format!("{b:02x}")).collect();
        std::fs::write(path, &hex_str).map_err(|e| CoreError::StorageWrite(e.to_string()))?;
        tracing::info!(path = %path.display(), "generated new dht identity key");
        Ok(key)
    }
}

struct DhtConnection {
    id: String,
    outbound: mpsc::Sender<String>,
}

#[async_trait]
impl Connection for DhtConnection {
    fn peer_id(&self) -> &str {
        &self.id
    }

    async fn send(&self, msg: &Message) -> anyhow::Result<()> {
        let json = serde_json::to_string(msg)?;
        self.outbound
            .send(json)
            .await
            .map_err(|_| anyhow::anyhow!("dht connection {} closed", self.id))
    }

    async fn close(&self) {}
}

/// DHT-style discovery transport over iroh.
pub struct DhtTransport {
    endpoint: iroh::Endpoint,
    alpn: Vec<u8>,
}

impl DhtTransport {
    /// Bind a fresh iroh endpoint keyed by `sync_key`, persisting its
    /// identity under `identity_path` (spec.md §4.6: stable peer id across
    /// restarts).
    pub async fn bind(identity_path: &Path, sync_key: &str) -> CoreResult<Self> {
        let secret_key = load_or_create_secret_key(identity_path)?;
        let alpn = alpn_for_sync_key(sync_key);
        let endpoint = iroh::Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![alpn.clone()])
            .bind()
            .await
            .map_err(|e| CoreError::TransportFailure(e.to_string()))?;
        tracing::info!(id = %endpoint.id(), "dht transport endpoint bound");
        Ok(Self { endpoint, alpn })
    }

    pub fn endpoint_id(&self) -> String {
        self.endpoint.id().to_string()
    }
}

/// Bridge a single bidirectional iroh stream to newline-delimited JSON
/// frames, same shape as `s2s.rs::handle_s2s_connection`'s read/write
/// halves but without the IRC-specific dedup/hello bookkeeping (loop
/// suppression here lives in `ReplicationFabric::deliver_inbound`).
///
/// Registers the connection and returns its peer id as soon as the stream
/// is open; the read/write pump runs detached so callers (in particular
/// `dial`) aren't blocked for the life of the connection.
async fn bridge_stream(
    conn: IrohConnection,
    incoming: bool,
    fabric: Arc<ReplicationFabric>,
) -> anyhow::Result<String> {
    let peer_id = conn.remote_id().to_string();
    let (mut send, recv) = if incoming { conn.accept_bi().await } else { conn.open_bi().await }?;

    let (tx, mut rx) = mpsc::channel::<String>(256);
    fabric.register_connection(Arc::new(DhtConnection { id: peer_id.clone(), outbound: tx }));

    let write_peer = peer_id.clone();
    let write_handle = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let framed = format!("{line}\n");
            if send.write_all(framed.as_bytes()).await.is_err() {
                tracing::debug!(peer = %write_peer, "dht write failed, stopping");
                break;
            }
        }
        let _ = send.finish();
    });

    let read_peer = peer_id.clone();
    let read_fabric = Arc::clone(&fabric);
    let read_handle = tokio::spawn(async move {
        let mut lines = BufReader::new(recv).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match serde_json::from_str::<Message>(&line) {
                    Ok(msg) => read_fabric.deliver_inbound(read_peer.clone(), msg).await,
                    Err(e) => {
                        tracing::warn!(peer = %read_peer, "malformed dht frame: {e}");
                        read_fabric.metrics.lock().parse_failures += 1;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(peer = %read_peer, "dht read error: {e}");
                    break;
                }
            }
        }
    });

    let cleanup_peer = peer_id.clone();
    let cleanup_fabric = Arc::clone(&fabric);
    tokio::spawn(async move {
        tokio::select! {
            _ = write_handle => {}
            _ = read_handle => {}
        }
        cleanup_fabric.remove_connection(&cleanup_peer);
    });

    Ok(peer_id)
}

#[async_trait]
impl Transport for DhtTransport {
    async fn listen(&self, fabric: Arc<ReplicationFabric>) -> anyhow::Result<()> {
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                let fabric = Arc::clone(&fabric);
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => {
                            if let Err(e) = bridge_stream(conn, true, fabric).await {
                                tracing::warn!("dht stream setup failed: {e}");
                            }
                        }
                        Err(e) => tracing::warn!("dht incoming connection failed: {e}"),
                    }
                });
            }
        });
        Ok(())
    }

    async fn dial(&self, address: &str, fabric: Arc<ReplicationFabric>) -> anyhow::Result<String> {
        let endpoint_id: iroh::EndpointId = address
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid dht peer id {address}: {e}"))?;
        let addr = iroh::EndpointAddr::new(endpoint_id);
        let conn = self.endpoint.connect(addr, &self.alpn).await?;
        bridge_stream(conn, false, fabric).await
    }
}
