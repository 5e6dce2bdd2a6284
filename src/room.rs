//! Per-document collaborative session.
//!
//! A room owns one CRDT document and one awareness store, multiplexes the
//! connections editing that document, relays accepted deltas to everyone but
//! the origin, and persists snapshots on a debounce timer off the real-time
//! path.
//!
//! ```text
//! Connection A ──┐
//!                ├── Room (room id) ── DocHandle ── dirty flag ── debounce ── VersionStore
//! Connection B ──┘        │
//!                         └── AwarenessStore (presence, never persisted)
//! ```
//!
//! All mutation for one room is serialized behind a single mutex: CRDT merge
//! is commutative for the document but not for the room's own bookkeeping
//! (connection set, awareness attribution, dirty flag). Different rooms are
//! fully independent.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::awareness::{AwarenessStore, ClientId};
use crate::document::{DocError, DocHandle};
use crate::protocol::{self, WireMessage};
use crate::storage::VersionStore;

/// Debounce window between the last accepted delta and a snapshot save.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1500);

/// Transport-level connection identifier.
pub type ConnectionId = Uuid;

/// Send/close handle for one connected peer.
///
/// Sends are fire-and-forget: a peer with a broken socket fails its own send
/// and is cleaned up by the subsequent transport close event; it never
/// aborts a broadcast to the remaining peers.
pub struct Connection {
    id: ConnectionId,
    sender: mpsc::UnboundedSender<Message>,
}

impl Connection {
    pub fn new(sender: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a text frame. Returns false if the peer's writer is gone.
    pub fn send_text(&self, text: String) -> bool {
        self.sender.send(Message::Text(text.into())).is_ok()
    }
}

/// Operational snapshot of one room.
#[derive(Debug, Clone, Serialize)]
pub struct RoomStats {
    pub id: String,
    pub connection_count: usize,
    pub logical_clock: u64,
    pub awareness_count: usize,
}

struct ConnEntry {
    conn: Connection,
    /// Awareness client ids this connection introduced, retracted on
    /// disconnect. Never touches ids owned by other connections.
    client_ids: HashSet<ClientId>,
}

struct RoomInner {
    doc: DocHandle,
    awareness: AwarenessStore,
    connections: HashMap<ConnectionId, ConnEntry>,
    /// Set on every accepted delta, cleared when a snapshot lands.
    dirty: bool,
    /// True from the moment a debounce timer is armed until it wakes.
    /// Distinct from the task handle: the timer task stays unfinished for
    /// the whole store write, and a delta accepted during that write still
    /// needs a cycle of its own.
    save_armed: bool,
    /// Handle of the pending debounce timer, kept for abort on close.
    save_task: Option<JoinHandle<()>>,
    /// When the room last dropped to zero connections.
    idle_since: Option<Instant>,
    /// Set by `close`; a closed room never arms another timer.
    closed: bool,
}

/// One collaborative document session.
pub struct Room {
    id: String,
    inner: Mutex<RoomInner>,
    store: Option<Arc<VersionStore>>,
    debounce: Duration,
}

impl Room {
    pub fn new(id: impl Into<String>, store: Option<Arc<VersionStore>>, debounce: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            inner: Mutex::new(RoomInner {
                doc: DocHandle::new(),
                awareness: AwarenessStore::new(),
                connections: HashMap::new(),
                dirty: false,
                save_armed: false,
                save_task: None,
                idle_since: Some(Instant::now()),
                closed: false,
            }),
            store,
            debounce,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Apply a stored snapshot without marking the room dirty.
    ///
    /// Used when a room is created from a persisted version.
    pub async fn hydrate(&self, snapshot: &[u8]) -> Result<(), DocError> {
        let inner = self.inner.lock().await;
        inner.doc.apply_update(snapshot)
    }

    /// Register a connection and bootstrap it: the current full document
    /// state goes out immediately as a `sync` frame, followed by the current
    /// awareness states so the joiner sees who is already here without
    /// waiting for peers to re-announce.
    pub async fn connect(&self, conn: Connection) -> ConnectionId {
        let mut inner = self.inner.lock().await;
        inner.idle_since = None;

        let state = inner.doc.encode_state_as_update();
        let sync = WireMessage::Sync {
            room_id: self.id.clone(),
            update: state,
        };
        match protocol::encode(&sync) {
            Ok(text) => {
                if !conn.send_text(text) {
                    log::warn!("room {}: bootstrap send failed for {}", self.id, conn.id());
                }
            }
            Err(e) => log::error!("room {}: failed to encode bootstrap sync: {e}", self.id),
        }

        if !inner.awareness.is_empty() {
            match inner.awareness.encode_states() {
                Ok(payload) => self.send_awareness_to(&conn, payload),
                Err(e) => log::error!("room {}: failed to encode awareness bootstrap: {e}", self.id),
            }
        }

        let id = conn.id();
        inner.connections.insert(
            id,
            ConnEntry {
                conn,
                client_ids: HashSet::new(),
            },
        );
        log::info!(
            "room {}: connection {id} joined ({} total)",
            self.id,
            inner.connections.len()
        );
        id
    }

    /// Deregister a connection and retract every awareness client id it
    /// introduced, broadcasting the removal to the remaining peers.
    pub async fn disconnect(&self, conn_id: ConnectionId) {
        let mut inner = self.inner.lock().await;
        let entry = match inner.connections.remove(&conn_id) {
            Some(entry) => entry,
            None => return,
        };

        let mut removed: Vec<ClientId> = Vec::new();
        for client_id in entry.client_ids {
            if inner.awareness.set_local_state(client_id, None).is_some() {
                removed.push(client_id);
            }
        }

        if !removed.is_empty() && !inner.connections.is_empty() {
            removed.sort_unstable();
            match AwarenessStore::encode_removal(&removed) {
                Ok(payload) => {
                    let msg = WireMessage::Awareness {
                        room_id: self.id.clone(),
                        payload,
                    };
                    match protocol::encode(&msg) {
                        Ok(text) => Self::broadcast(&inner.connections, None, &text),
                        Err(e) => log::error!("room {}: failed to encode retraction: {e}", self.id),
                    }
                }
                Err(e) => log::error!("room {}: failed to encode retraction: {e}", self.id),
            }
        }

        if inner.connections.is_empty() {
            inner.idle_since = Some(Instant::now());
        }
        log::info!(
            "room {}: connection {conn_id} left ({} remaining)",
            self.id,
            inner.connections.len()
        );
    }

    /// Process one inbound text frame from a connection.
    ///
    /// Anything that fails validation — bad JSON, unknown type, a `roomId`
    /// that is not this room's — is dropped without a reply; a misrouted or
    /// replayed frame must never corrupt unrelated state.
    pub async fn handle_message(self: &Arc<Self>, origin: ConnectionId, raw: &str) {
        let msg = match protocol::decode(raw) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("room {}: dropping invalid frame: {e}", self.id);
                return;
            }
        };
        if msg.room_id() != self.id {
            log::debug!(
                "room {}: dropping misrouted {} frame for {:?}",
                self.id,
                msg.kind(),
                msg.room_id()
            );
            return;
        }

        let mut inner = self.inner.lock().await;
        match msg {
            // A client-sent sync is handled exactly like an update once past
            // validation; only the room's own bootstrap frame is a sync.
            WireMessage::Sync { update, .. } | WireMessage::Update { update, .. } => {
                if let Err(e) = inner.doc.apply_update(&update) {
                    log::warn!("room {}: dropping malformed delta from {origin}: {e}", self.id);
                    return;
                }
                inner.dirty = true;

                let relay = WireMessage::Update {
                    room_id: self.id.clone(),
                    update,
                };
                match protocol::encode(&relay) {
                    Ok(text) => Self::broadcast(&inner.connections, Some(origin), &text),
                    Err(e) => log::error!("room {}: failed to encode relay: {e}", self.id),
                }

                self.arm_save(&mut inner);
            }

            WireMessage::Awareness { payload, .. } => {
                let diff = match inner.awareness.apply_update(&payload) {
                    Ok(diff) => diff,
                    Err(e) => {
                        log::debug!("room {}: dropping awareness frame from {origin}: {e}", self.id);
                        return;
                    }
                };

                // Newly observed client ids belong to the sender; removed ids
                // stop belonging to whoever held them.
                for entry in inner.connections.values_mut() {
                    for id in &diff.removed {
                        entry.client_ids.remove(id);
                    }
                }
                if let Some(entry) = inner.connections.get_mut(&origin) {
                    entry.client_ids.extend(diff.added.iter().copied());
                }

                // Opaque relay: peers get the payload bytes unchanged.
                let relay = WireMessage::Awareness {
                    room_id: self.id.clone(),
                    payload,
                };
                match protocol::encode(&relay) {
                    Ok(text) => Self::broadcast(&inner.connections, Some(origin), &text),
                    Err(e) => log::error!("room {}: failed to encode awareness relay: {e}", self.id),
                }
            }
        }
    }

    /// Persist the current state now if the room is dirty.
    ///
    /// The snapshot is encoded under the room lock, but the store write runs
    /// on the blocking pool so a slow disk cannot stall message processing.
    /// A failed save is logged, re-marks the room dirty, and re-arms the
    /// timer for a retry; it never propagates to the real-time path.
    pub async fn flush(self: &Arc<Self>) {
        let store = match &self.store {
            Some(store) => Arc::clone(store),
            None => return,
        };

        let (snapshot, clock) = {
            let mut inner = self.inner.lock().await;
            // The timer has woken: deltas accepted from here on arm a fresh
            // cycle instead of piggybacking on this one.
            inner.save_armed = false;
            if !inner.dirty {
                return;
            }
            inner.dirty = false;
            (inner.doc.encode_state_as_update(), inner.doc.logical_clock())
        };

        let room_id = self.id.clone();
        let result =
            tokio::task::spawn_blocking(move || store.save(&room_id, &snapshot, Some(clock))).await;

        match result {
            Ok(Ok(meta)) => {
                log::debug!(
                    "room {}: persisted version {} ({} bytes, clock {clock})",
                    self.id,
                    meta.id,
                    meta.size
                );
            }
            Ok(Err(e)) => {
                log::error!("room {}: snapshot save failed, will retry: {e}", self.id);
                let mut inner = self.inner.lock().await;
                inner.dirty = true;
                self.arm_save(&mut inner);
            }
            Err(e) => {
                log::error!("room {}: snapshot task failed, will retry: {e}", self.id);
                let mut inner = self.inner.lock().await;
                inner.dirty = true;
                self.arm_save(&mut inner);
            }
        }
    }

    /// Tear the room down: cancel any pending timer, take a final snapshot
    /// if there are unsaved edits, and clear awareness. Eviction only.
    pub async fn close(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().await;
            inner.closed = true;
            if let Some(task) = inner.save_task.take() {
                task.abort();
            }
        }
        self.flush().await;
        let mut inner = self.inner.lock().await;
        inner.awareness.destroy();
        inner.connections.clear();
    }

    /// Operational counters for the inspection API.
    pub async fn stats(&self) -> RoomStats {
        let inner = self.inner.lock().await;
        RoomStats {
            id: self.id.clone(),
            connection_count: inner.connections.len(),
            logical_clock: inner.doc.logical_clock(),
            awareness_count: inner.awareness.len(),
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    /// Refresh the idle deadline: a connection is on its way.
    ///
    /// Called by the registry under its own lock on every lookup, so an
    /// eviction sweep running between lookup and `connect` sees a freshly
    /// renewed deadline and spares the room.
    pub async fn touch(&self) {
        let mut inner = self.inner.lock().await;
        if inner.idle_since.is_some() {
            inner.idle_since = Some(Instant::now());
        }
    }

    /// True when the room has had zero connections for at least `timeout`.
    pub async fn idle_for(&self, timeout: Duration) -> bool {
        let inner = self.inner.lock().await;
        match inner.idle_since {
            Some(since) if inner.connections.is_empty() => since.elapsed() >= timeout,
            _ => false,
        }
    }

    /// Arm the single-shot debounce timer unless one is already pending.
    fn arm_save(self: &Arc<Self>, inner: &mut RoomInner) {
        if self.store.is_none() || inner.save_armed || inner.closed {
            return;
        }
        inner.save_armed = true;

        let room = Arc::clone(self);
        let debounce = self.debounce;
        inner.save_task = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            room.flush().await;
        }));
    }

    /// Fan a frame out to every connection except `skip`. Each send has its
    /// own failure boundary; broken peers are reaped by their close event.
    fn broadcast(
        connections: &HashMap<ConnectionId, ConnEntry>,
        skip: Option<ConnectionId>,
        text: &str,
    ) {
        for (id, entry) in connections {
            if Some(*id) == skip {
                continue;
            }
            if !entry.conn.send_text(text.to_string()) {
                log::warn!("broadcast send to {id} failed");
            }
        }
    }

    fn send_awareness_to(&self, conn: &Connection, payload: Vec<u8>) {
        let msg = WireMessage::Awareness {
            room_id: self.id.clone(),
            payload,
        };
        match protocol::encode(&msg) {
            Ok(text) => {
                let _ = conn.send_text(text);
            }
            Err(e) => log::error!("room {}: failed to encode awareness frame: {e}", self.id),
        }
    }
}
