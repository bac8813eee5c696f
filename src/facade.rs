//! `Database`: the façade orchestrating storage, merge, vector index,
//! subscriptions, rules, and the replication fabric (spec.md §4.4).
//!
//! Grounded on the teacher's `server.rs::SharedState`/`Server`: a single
//! struct owning every subsystem behind locks, constructed once at startup
//! and handed out as an `Arc` so background tasks (here: the replication
//! inbound pump) can hold a reference without borrowing the stack.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::merge;
use crate::record::{DataMap, Embedding, NodeRecord, Value, VectorClock};
use crate::replication::dht::DhtTransport;
use crate::replication::relay;
use crate::replication::socket::SocketTransport;
use crate::replication::{InboundMessage, Message, ReplicationFabric, Transport};
use crate::rules::{Rule, RuleContext, RuleEngine};
use crate::sanitize::{sanitize, sanitize_data_map, RawValue};
use crate::storage::memory::MemoryStorage;
use crate::storage::sqlite::SqliteStorage;
use crate::storage::Storage;
use crate::vector::VectorIndex;

/// Derive the `vector` field for a write (spec.md §3.1): embed a `text` or
/// `content` string field if present, else use an explicit `vector` field
/// from the payload, else inherit the previous record's vector.
fn derive_vector(data: &DataMap, existing: Option<&NodeRecord>) -> Option<Embedding> {
    if let Some(Value::Text(t)) = data.get("text").or_else(|| data.get("content")) {
        return Some(crate::embedding::embed(t));
    }
    if let Some(Value::Sequence(seq)) = data.get("vector") {
        let numbers: Option<Vec<f32>> = seq
            .iter()
            .map(|v| match v {
                Value::Number(n) => Some(*n as f32),
                _ => None,
            })
            .collect();
        if let Some(numbers) = numbers {
            return Some(numbers);
        }
    }
    existing.and_then(|r| r.vector.clone())
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A vector-search query: either an embedding already, or text to embed
/// first (spec.md §4.4 `vectorSearch`).
pub enum VectorQuery {
    Vector(Vec<f32>),
    Text(String),
}

impl VectorQuery {
    fn resolve(self) -> Vec<f32> {
        match self {
            VectorQuery::Vector(v) => v,
            VectorQuery::Text(t) => crate::embedding::embed(&t),
        }
    }
}

/// Aggregate counters returned by `stats()` (spec.md §6.4).
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Stats {
    pub total_nodes: usize,
    pub type_counts: std::collections::BTreeMap<String, usize>,
}

/// A registered `on`/`onAny` callback.
type Callback = Arc<dyn Fn(Option<NodeRecord>) + Send + Sync>;

#[derive(Default)]
struct Subscriptions {
    by_id: std::collections::HashMap<String, Vec<(u64, Callback)>>,
    any: Vec<(u64, Callback)>,
}

/// Returned by `on`/`onAny`; pass to `Database::unsubscribe` to stop
/// receiving emissions (spec.md §9 "weak/back references": the registry
/// never keeps the caller's callback alive past an explicit unsubscribe,
/// but it is the caller's job to call it — there is no automatic GC hook).
pub struct SubscriptionHandle {
    id: u64,
    target: Option<String>,
}

/// The document/graph store façade (spec.md §4.4).
pub struct Database {
    actor_id: String,
    config: CoreConfig,
    storage: Arc<dyn Storage>,
    vector_index: VectorIndex,
    rules: RwLock<RuleEngine>,
    subscriptions: RwLock<Subscriptions>,
    next_sub_id: AtomicU64,
    fabric: Arc<ReplicationFabric>,
    socket_transport: RwLock<Option<Arc<SocketTransport>>>,
    dht_transport: RwLock<Option<Arc<DhtTransport>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    ready: AtomicBool,
}

impl Database {
    /// Open a database: `config.kv_path` selects a durable `SqliteStorage`
    /// backend; omitting it opens an ephemeral `MemoryStorage` (spec.md
    /// §4.2). The vector index is rebuilt from every stored record with a
    /// non-empty vector (spec.md §4.3).
    pub async fn open(config: CoreConfig) -> CoreResult<Arc<Self>> {
        let storage: Arc<dyn Storage> = match &config.kv_path {
            Some(path) => Arc::new(SqliteStorage::open(path)?),
            None => Arc::new(MemoryStorage::default()),
        };

        let actor_id = match &config.peer_id {
            Some(id) => id.clone(),
            None => Self::load_or_create_actor_id(&config)?,
        };

        let vector_index = VectorIndex::new();
        for record in storage.list_nodes()? {
            if record.has_vector() {
                vector_index.upsert(&record.id, record.vector.clone().unwrap());
            }
        }

        let (fabric, inbound_rx) = ReplicationFabric::new(actor_id.clone());

        let db = Arc::new(Self {
            actor_id,
            config,
            storage,
            vector_index,
            rules: RwLock::new(RuleEngine::new()),
            subscriptions: RwLock::new(Subscriptions::default()),
            next_sub_id: AtomicU64::new(0),
            fabric,
            socket_transport: RwLock::new(None),
            dht_transport: RwLock::new(None),
            background: Mutex::new(Vec::new()),
            ready: AtomicBool::new(true),
        });

        let pump_db = Arc::clone(&db);
        let pump = tokio::spawn(async move { pump_db.run_inbound_pump(inbound_rx).await });
        db.background.lock().push(pump);

        Ok(db)
    }

    /// Peer identity persisted under `data_dir` so restarts keep the same
    /// actor id (teacher's `load_or_create_secret_key` idiom, SPEC_FULL.md
    /// §2.5, applied to a plain id since this crate doesn't do at-rest
    /// cryptographic identity — see DESIGN.md).
    fn load_or_create_actor_id(config: &CoreConfig) -> CoreResult<String> {
        let path = config.data_dir().join("peer-id");
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| CoreError::StorageRead(e.to_string()))?;
            Ok(contents.trim().to_string())
        } else {
            let id = uuid::Uuid::new_v4().to_string();
            std::fs::write(&path, &id).map_err(|e| CoreError::StorageWrite(e.to_string()))?;
            Ok(id)
        }
    }

    fn require_ready(&self) -> CoreResult<()> {
        if self.ready.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CoreError::NotReady)
        }
    }

    pub fn get_actor_id(&self) -> &str {
        &self.actor_id
    }

    // ── read path ───────────────────────────────────────────────────

    /// `get(id) -> record | none` (spec.md §4.4). No side effects.
    pub fn get(&self, id: &str) -> CoreResult<Option<NodeRecord>> {
        self.require_ready()?;
        Ok(self.storage.get_node(id)?.map(|mut r| {
            r.data = sanitize_data_map(r.data);
            r
        }))
    }

    /// `instancesOf(typeName)` (spec.md §4.4): scan storage for matching type.
    pub fn instances_of(&self, type_name: &str) -> CoreResult<Vec<NodeRecord>> {
        self.require_ready()?;
        Ok(self
            .storage
            .list_nodes()?
            .into_iter()
            .filter(|r| r.node_type.as_deref() == Some(type_name))
            .collect())
    }

    /// `getNodeHistory(id)` (spec.md §4.4).
    pub fn get_node_history(&self, id: &str) -> CoreResult<Vec<NodeRecord>> {
        self.require_ready()?;
        Ok(self.storage.get_node_history(id)?)
    }

    /// Drop all but the most recent `max_keep` history entries for `id`
    /// (SPEC_FULL.md §2.5 operator knob, analogous to the teacher's
    /// `prune_messages`). History retention is not required for
    /// convergence.
    pub fn prune_history(&self, id: &str, max_keep: usize) -> CoreResult<()> {
        self.require_ready()?;
        self.storage.prune_history(id, max_keep)
    }

    /// `vectorSearch(query, k)` (spec.md §4.4): search the index; if it's
    /// empty, fall back to a brute-force scan over storage.
    pub fn vector_search(&self, query: VectorQuery, k: usize) -> CoreResult<Vec<(NodeRecord, f32)>> {
        self.require_ready()?;
        let query_vec = query.resolve();

        if !self.vector_index.is_empty() {
            let hits = self.vector_index.search(&query_vec, k);
            let mut out = Vec::with_capacity(hits.len());
            for (id, score) in hits {
                if let Some(record) = self.storage.get_node(&id)? {
                    out.push((record, score));
                }
            }
            return Ok(out);
        }

        let mut scored: Vec<(NodeRecord, f32, usize)> = self
            .storage
            .list_nodes()?
            .into_iter()
            .enumerate()
            .filter_map(|(order, record)| {
                let vector = record.vector.clone()?;
                let score = crate::vector::cosine_similarity(&query_vec, &vector);
                score.is_finite().then_some((record, score, order))
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.2.cmp(&b.2)));
        scored.truncate(k);
        Ok(scored.into_iter().map(|(r, s, _)| (r, s)).collect())
    }

    /// `stats()` (spec.md §6.4).
    pub fn stats(&self) -> CoreResult<Stats> {
        self.require_ready()?;
        let nodes = self.storage.list_nodes()?;
        let mut type_counts = std::collections::BTreeMap::new();
        for node in &nodes {
            if let Some(t) = &node.node_type {
                *type_counts.entry(t.clone()).or_insert(0) += 1;
            }
        }
        Ok(Stats { total_nodes: nodes.len(), type_counts })
    }

    // ── subscriptions ───────────────────────────────────────────────

    /// `on(id, cb) -> unsubscribe` (spec.md §4.4).
    pub fn on(&self, id: &str, cb: impl Fn(Option<NodeRecord>) + Send + Sync + 'static) -> SubscriptionHandle {
        let sub_id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions
            .write()
            .by_id
            .entry(id.to_string())
            .or_default()
            .push((sub_id, Arc::new(cb)));
        SubscriptionHandle { id: sub_id, target: Some(id.to_string()) }
    }

    /// `onAny(cb) -> unsubscribe` (spec.md §4.4).
    pub fn on_any(&self, cb: impl Fn(Option<NodeRecord>) + Send + Sync + 'static) -> SubscriptionHandle {
        let sub_id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.write().any.push((sub_id, Arc::new(cb)));
        SubscriptionHandle { id: sub_id, target: None }
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut subs = self.subscriptions.write();
        match &handle.target {
            Some(id) => {
                if let Some(list) = subs.by_id.get_mut(id) {
                    list.retain(|(sid, _)| *sid != handle.id);
                }
            }
            None => subs.any.retain(|(sid, _)| *sid != handle.id),
        }
    }

    /// Deliver `record` to id-specific and any-listener subscribers.
    /// Fire-and-forget: spawned on the tokio runtime so `put`/`delete`
    /// never block on a slow callback (spec.md §4.4: "emission is
    /// scheduled to run outside the current call").
    fn emit(&self, id: &str, record: Option<NodeRecord>) {
        let callbacks: Vec<Callback> = {
            let subs = self.subscriptions.read();
            let mut cbs: Vec<Callback> = subs.by_id.get(id).map(|v| v.iter().map(|(_, c)| Arc::clone(c)).collect()).unwrap_or_default();
            cbs.extend(subs.any.iter().map(|(_, c)| Arc::clone(c)));
            cbs
        };
        if callbacks.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for cb in callbacks {
                cb(record.clone());
            }
        });
    }

    // ── write path ──────────────────────────────────────────────────

    /// Core synchronous write shared by `put`, rule actions (suppressed),
    /// `restoreNodeVersion`, and inbound replication. `bump_clock` decides
    /// whether this is a local write (increments `self`'s vector clock
    /// entry) or the application of an already-clocked incoming record.
    fn apply_local(&self, id: &str, data: DataMap, incoming_clock: Option<VectorClock>, evaluate_rules: bool) -> CoreResult<NodeRecord> {
        let sanitized = sanitize_data_map(data);
        let existing = self.storage.get_node(id)?;

        let clock = match incoming_clock {
            Some(c) => c,
            None => {
                let mut clock = existing.as_ref().map(|r| r.vector_clock.clone()).unwrap_or_default();
                let count = clock.get(&self.actor_id).copied().unwrap_or(0) + 1;
                clock.insert(self.actor_id.clone(), count);
                clock
            }
        };

        let vector = derive_vector(&sanitized, existing.as_ref());
        let candidate = NodeRecord::new(id, sanitized, None, vector, now_millis(), clock);
        let merged = merge::merge(existing.as_ref(), &candidate)?;

        self.storage.set_node(&merged)?;
        match merged.vector.clone() {
            Some(v) if !v.is_empty() => self.vector_index.upsert(id, v),
            _ => self.vector_index.remove(id),
        }

        self.emit(id, Some(merged.clone()));

        if evaluate_rules {
            let ctx = SuppressedContext { db: self };
            self.rules.read().evaluate(&merged, &ctx);
        }

        Ok(merged)
    }

    /// `put(id, data)` (spec.md §4.4).
    pub async fn put(&self, id: &str, data: DataMap) -> CoreResult<NodeRecord> {
        self.require_ready()?;
        let merged = self.apply_local(id, data, None, true)?;
        self.fabric
            .broadcast(Message::Put { origin_id: self.actor_id.clone(), node: merged.clone() }, None)
            .await;
        Ok(merged)
    }

    /// `put(id, data)` for a payload coming from a dynamic host binding
    /// (spec.md §4.4, §9 "Cycles in input payloads"; P12). Bindings that
    /// hand the façade a possibly self-referential object graph — rather
    /// than an already-flat `DataMap` — go through `sanitize::sanitize`
    /// first, which strips functions and cuts cycles with a sentinel before
    /// anything reaches `put`'s merge-friendly tree.
    pub async fn put_raw(&self, id: &str, raw: &Rc<RefCell<RawValue>>) -> CoreResult<NodeRecord> {
        let sanitized = sanitize(raw);
        let data = match sanitized {
            Value::Mapping(map) => map.into_iter().collect(),
            _ => DataMap::new(),
        };
        self.put(id, data).await
    }

    /// `delete(id)` (spec.md §4.4).
    pub async fn delete(&self, id: &str) -> CoreResult<()> {
        self.require_ready()?;
        self.storage.delete_node(id)?;
        self.vector_index.remove(id);
        self.emit(id, None);
        self.fabric
            .broadcast(Message::Delete { origin_id: self.actor_id.clone(), id: id.to_string() }, None)
            .await;
        Ok(())
    }

    /// `setType(id, typeName)` (spec.md §4.4): convenience put that merges
    /// `{type: typeName}` into the record without touching `data`.
    pub async fn set_type(&self, id: &str, type_name: &str) -> CoreResult<NodeRecord> {
        self.require_ready()?;
        let existing = self.storage.get_node(id)?;

        let mut clock = existing.as_ref().map(|r| r.vector_clock.clone()).unwrap_or_default();
        let count = clock.get(&self.actor_id).copied().unwrap_or(0) + 1;
        clock.insert(self.actor_id.clone(), count);

        // Empty incoming data: deep_merge leaves every existing field and its
        // per-field timestamp untouched, only `node_type` changes.
        let candidate = NodeRecord::new(id, DataMap::new(), Some(type_name.to_string()), None, now_millis(), clock);
        let merged = merge::merge(existing.as_ref(), &candidate)?;

        self.storage.set_node(&merged)?;
        self.emit(id, Some(merged.clone()));
        {
            let ctx = SuppressedContext { db: self };
            self.rules.read().evaluate(&merged, &ctx);
        }
        self.fabric
            .broadcast(Message::Put { origin_id: self.actor_id.clone(), node: merged.clone() }, None)
            .await;
        Ok(merged)
    }

    /// `restoreNodeVersion(id, timestamp)` (spec.md §4.4): locate the
    /// matching history entry and `put` its data back as a new current
    /// state.
    pub async fn restore_node_version(&self, id: &str, timestamp: i64) -> CoreResult<NodeRecord> {
        self.require_ready()?;
        let history = self.storage.get_node_history(id)?;
        let entry = history
            .into_iter()
            .find(|r| r.timestamp == timestamp)
            .ok_or(CoreError::VersionNotFound { id: id.to_string(), timestamp })?;
        self.put(id, entry.data).await
    }

    // ── rules ───────────────────────────────────────────────────────

    pub fn add_rule(&self, rule: Rule) {
        self.rules.write().add_rule(rule);
    }

    pub fn remove_rule(&self, name: &str) {
        self.rules.write().remove_rule(name);
    }

    // ── replication fabric ──────────────────────────────────────────

    /// `serve(port)` (spec.md §4.4): start the server-hosted socket
    /// transport.
    pub async fn serve(&self, port: u16) -> CoreResult<()> {
        self.require_ready()?;
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let transport = Arc::new(SocketTransport::new(addr));
        transport
            .listen(Arc::clone(&self.fabric))
            .await
            .map_err(|e| CoreError::TransportFailure(e.to_string()))?;
        *self.socket_transport.write() = Some(transport);
        Ok(())
    }

    /// `connect(url)` (spec.md §4.4): dial an outbound peer and send a
    /// `sync_request` once connected.
    pub async fn connect(&self, url: &str) -> CoreResult<()> {
        self.require_ready()?;
        let transport = {
            let existing = self.socket_transport.read().clone();
            match existing {
                Some(t) => t,
                None => Arc::new(SocketTransport::new(([0, 0, 0, 0], 0).into())),
            }
        };
        let conn_id = transport
            .dial(url, Arc::clone(&self.fabric))
            .await
            .map_err(|e| CoreError::TransportFailure(e.to_string()))?;
        if let Err(e) = self
            .fabric
            .send_to(&conn_id, &Message::SyncRequest { origin_id: self.actor_id.clone() })
            .await
        {
            tracing::warn!(peer = %conn_id, "failed to send initial sync_request: {e}");
        }
        Ok(())
    }

    /// `enableSync(key)` (spec.md §4.4): validate and start the
    /// DHT-discovery transport keyed by `key`.
    pub async fn enable_sync(&self, key: &str) -> CoreResult<()> {
        self.require_ready()?;
        if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
            return Err(CoreError::InvalidSyncKey);
        }
        let identity_path = self.config.data_dir().join("dht-identity.secret");
        let transport = Arc::new(
            DhtTransport::bind(&identity_path, key)
                .await
                .map_err(|_| CoreError::TransportFailure("failed to bind dht transport".into()))?,
        );
        transport
            .listen(Arc::clone(&self.fabric))
            .await
            .map_err(|e| CoreError::TransportFailure(e.to_string()))?;
        *self.dht_transport.write() = Some(transport);
        Ok(())
    }

    /// `disableSync()` (spec.md §4.4). Dropping the transport drops its
    /// iroh endpoint, tearing down the DHT listener.
    pub fn disable_sync(&self) -> CoreResult<()> {
        self.require_ready()?;
        *self.dht_transport.write() = None;
        Ok(())
    }

    /// This node's DHT endpoint id, once `enableSync` has bound a
    /// transport. Used by a collaborator that has discovered a peer's
    /// endpoint id through some out-of-band channel to dial it.
    pub fn dht_endpoint_id(&self) -> Option<String> {
        self.dht_transport.read().as_ref().map(|t| t.endpoint_id())
    }

    /// Dial a peer directly on the DHT transport (spec.md §4.6 variant (b)):
    /// requires `enableSync` to have bound a transport first. Two nodes
    /// enabled with different sync keys derive different ALPNs
    /// (`dht.rs::alpn_for_sync_key`) and fail the handshake before any
    /// message is exchanged — they never converge (spec.md P10).
    pub async fn connect_dht(&self, endpoint_id: &str) -> CoreResult<()> {
        self.require_ready()?;
        let transport = self
            .dht_transport
            .read()
            .clone()
            .ok_or_else(|| CoreError::TransportFailure("dht transport not enabled".into()))?;
        let conn_id = transport
            .dial(endpoint_id, Arc::clone(&self.fabric))
            .await
            .map_err(|e| CoreError::TransportFailure(e.to_string()))?;
        if let Err(e) = self
            .fabric
            .send_to(&conn_id, &Message::SyncRequest { origin_id: self.actor_id.clone() })
            .await
        {
            tracing::warn!(peer = %conn_id, "failed to send initial sync_request: {e}");
        }
        Ok(())
    }

    /// Attach an already-established relayed stream as a peer connection
    /// (spec.md §4.6 variant (c)). The relay rendezvous itself is outside
    /// the core's scope — callers hand in a connected stream.
    pub fn attach_relay<S>(&self, stream: S, peer_id: String)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let fabric = Arc::clone(&self.fabric);
        let handle = tokio::spawn(relay::attach_relay_stream(stream, peer_id, fabric));
        self.background.lock().push(handle);
    }

    /// Drain inbound replication messages, applying each in the façade's
    /// serialised domain and re-broadcasting to every other peer (spec.md
    /// §4.6 loop suppression + mesh fan-out).
    async fn run_inbound_pump(self: Arc<Self>, mut rx: tokio::sync::mpsc::Receiver<InboundMessage>) {
        while let Some(inbound) = rx.recv().await {
            self.apply_inbound(inbound).await;
        }
    }

    async fn apply_inbound(&self, inbound: InboundMessage) {
        let InboundMessage { from_connection, message } = inbound;
        match message {
            Message::Put { origin_id, node } => {
                if let Err(e) = self.accept_inbound_put(&node) {
                    tracing::warn!(peer = %from_connection, "failed to apply inbound put: {e}");
                    return;
                }
                self.fabric.broadcast(Message::Put { origin_id, node }, Some(&from_connection)).await;
            }
            Message::PutLegacy { origin_id, id, data } => {
                let existing = self.storage.get_node(&id).ok().flatten();
                let vector = derive_vector(&data, existing.as_ref());
                let node = NodeRecord::new(&id, data, None, vector, now_millis(), VectorClock::new());
                if let Err(e) = self.accept_inbound_put(&node) {
                    tracing::warn!(peer = %from_connection, "failed to apply legacy inbound put: {e}");
                    return;
                }
                self.fabric.broadcast(Message::Put { origin_id, node }, Some(&from_connection)).await;
            }
            Message::Delete { origin_id, id } => {
                if let Err(e) = self.storage.delete_node(&id) {
                    tracing::warn!(peer = %from_connection, "failed to apply inbound delete: {e}");
                    return;
                }
                self.vector_index.remove(&id);
                self.emit(&id, None);
                self.fabric.broadcast(Message::Delete { origin_id, id }, Some(&from_connection)).await;
            }
            Message::SyncRequest { .. } => {
                let nodes = match self.storage.list_nodes() {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!("failed to list nodes for snapshot reply: {e}");
                        return;
                    }
                };
                for node in nodes {
                    let snapshot = Message::Put { origin_id: self.actor_id.clone(), node };
                    if let Err(e) = self.fabric.send_to(&from_connection, &snapshot).await {
                        tracing::debug!(peer = %from_connection, "snapshot send failed: {e}");
                        break;
                    }
                }
            }
        }
    }

    /// Apply an inbound replicated put through the same read-merge-persist-
    /// emit-evaluate path as a local write (spec.md's inbound data flow:
    /// "read existing, merge, persist, emit, update index, evaluate rules,
    /// re-broadcast"). Rule actions run through `SuppressedContext` so a
    /// rule triggered by a peer's write can't itself recurse or re-broadcast.
    fn accept_inbound_put(&self, incoming: &NodeRecord) -> CoreResult<()> {
        let existing = self.storage.get_node(&incoming.id)?;
        let merged = merge::merge(existing.as_ref(), incoming)?;
        self.storage.set_node(&merged)?;
        match merged.vector.clone() {
            Some(v) if !v.is_empty() => self.vector_index.upsert(&incoming.id, v),
            _ => self.vector_index.remove(&incoming.id),
        }
        self.emit(&incoming.id, Some(merged.clone()));

        let ctx = SuppressedContext { db: self };
        self.rules.read().evaluate(&merged, &ctx);

        Ok(())
    }

    // ── lifecycle ───────────────────────────────────────────────────

    /// `close()` (spec.md §4.4): terminate all transports, clear
    /// subscription registries, stop accepting further operations.
    /// Idempotent.
    pub async fn close(&self) {
        if !self.ready.swap(false, Ordering::AcqRel) {
            return; // already closed
        }
        self.fabric.close_all().await;
        *self.socket_transport.write() = None;
        *self.dht_transport.write() = None;
        {
            let mut subs = self.subscriptions.write();
            subs.by_id.clear();
            subs.any.clear();
        }
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
    }
}

/// Rule-action capability object: a suppressed-broadcast, non-recursive
/// put path (spec.md §4.5 — "may call back through a broadcast-suppressed
/// put path"). Does not re-run the rule engine or fan out to the
/// replication fabric, breaking the recursion a naive `put` call from
/// inside a rule action would cause.
struct SuppressedContext<'a> {
    db: &'a Database,
}

impl RuleContext for SuppressedContext<'_> {
    fn put(&self, id: &str, data: DataMap) -> CoreResult<()> {
        self.db.apply_local(id, data, None, false).map(|_| ())
    }

    fn get(&self, id: &str) -> CoreResult<Option<NodeRecord>> {
        self.db.get(id)
    }
}
