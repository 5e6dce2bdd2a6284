//! Ephemeral per-room presence state, keyed by numeric client id.
//!
//! Awareness entries (cursor, selection, user profile) are never persisted
//! and never touch the CRDT document. Each mutation produces a diff
//! classified into `added` / `updated` / `removed`, which the room relays
//! to peers and uses to attribute client ids to connections.
//!
//! Wire payload: a JSON object mapping client id to state, UTF-8 encoded.
//! `null` state means the client left.
//! ```text
//! { "5": { "user": "alice", "cursor": { "line": 3 } }, "9": null }
//! ```

use std::collections::{HashMap, HashSet};

use serde_json::Value;

/// Numeric client identifier, allocated by the editing client.
pub type ClientId = u64;

/// Diff emitted by every awareness mutation.
///
/// The three sets are mutually exclusive per mutation: an id appears in at
/// most one of them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AwarenessUpdate {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessUpdate {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    fn merge(&mut self, other: AwarenessUpdate) {
        self.added.extend(other.added);
        self.updated.extend(other.updated);
        self.removed.extend(other.removed);
    }
}

/// Awareness errors.
#[derive(Debug, Clone)]
pub enum AwarenessError {
    /// Payload bytes did not decode as a client-id → state object.
    Malformed(String),
}

impl std::fmt::Display for AwarenessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AwarenessError::Malformed(e) => write!(f, "Malformed awareness payload: {e}"),
        }
    }
}

impl std::error::Error for AwarenessError {}

/// Subscription handle returned by [`AwarenessStore::on`].
pub type SubscriptionId = u64;

type UpdateHandler = Box<dyn Fn(&AwarenessUpdate) + Send + Sync>;

/// Per-room store of ephemeral presence entries.
///
/// Invariant: exactly one entry per live client; the owning room retracts
/// entries when their connection disconnects, so no orphaned presence
/// survives a disconnect.
pub struct AwarenessStore {
    states: HashMap<ClientId, Value>,
    subscribers: HashMap<SubscriptionId, UpdateHandler>,
    next_subscription: SubscriptionId,
}

impl AwarenessStore {
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            subscribers: HashMap::new(),
            next_subscription: 0,
        }
    }

    /// Set or clear one client's state.
    ///
    /// `None` removes the entry (explicit leave). Removing an id that was
    /// never present is a no-op and emits nothing. Overwriting an existing
    /// id is always classified `updated`, never `added`.
    pub fn set_local_state(
        &mut self,
        client_id: ClientId,
        state: Option<Value>,
    ) -> Option<AwarenessUpdate> {
        let update = match state {
            Some(state) => {
                let existed = self.states.insert(client_id, state).is_some();
                if existed {
                    AwarenessUpdate {
                        updated: vec![client_id],
                        ..AwarenessUpdate::default()
                    }
                } else {
                    AwarenessUpdate {
                        added: vec![client_id],
                        ..AwarenessUpdate::default()
                    }
                }
            }
            None => {
                if self.states.remove(&client_id).is_none() {
                    return None;
                }
                AwarenessUpdate {
                    removed: vec![client_id],
                    ..AwarenessUpdate::default()
                }
            }
        };

        self.emit(&update);
        Some(update)
    }

    /// Apply an opaque wire payload: every entry goes through
    /// [`set_local_state`](Self::set_local_state). Returns the merged diff.
    ///
    /// The whole payload is validated before any entry is applied: a frame
    /// that mixes valid and malformed keys leaves the store untouched.
    pub fn apply_update(&mut self, payload: &[u8]) -> Result<AwarenessUpdate, AwarenessError> {
        let entries: serde_json::Map<String, Value> = serde_json::from_slice(payload)
            .map_err(|e| AwarenessError::Malformed(e.to_string()))?;

        let mut parsed: Vec<(ClientId, Option<Value>)> = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let client_id: ClientId = key
                .parse()
                .map_err(|_| AwarenessError::Malformed(format!("non-numeric client id {key:?}")))?;
            let state = if value.is_null() { None } else { Some(value) };
            parsed.push((client_id, state));
        }

        let mut merged = AwarenessUpdate::default();
        for (client_id, state) in parsed {
            if let Some(update) = self.set_local_state(client_id, state) {
                merged.merge(update);
            }
        }
        Ok(merged)
    }

    /// Full current snapshot: who else is here.
    pub fn get_states(&self) -> &HashMap<ClientId, Value> {
        &self.states
    }

    /// Ids of all currently present clients.
    pub fn client_ids(&self) -> HashSet<ClientId> {
        self.states.keys().copied().collect()
    }

    /// Number of present clients.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Encode the full state map as a wire payload (new-joiner bootstrap).
    pub fn encode_states(&self) -> Result<Vec<u8>, AwarenessError> {
        let map: serde_json::Map<String, Value> = self
            .states
            .iter()
            .map(|(id, state)| (id.to_string(), state.clone()))
            .collect();
        serde_json::to_vec(&map).map_err(|e| AwarenessError::Malformed(e.to_string()))
    }

    /// Encode a retraction payload for the given ids (disconnect cleanup).
    pub fn encode_removal(client_ids: &[ClientId]) -> Result<Vec<u8>, AwarenessError> {
        let map: serde_json::Map<String, Value> = client_ids
            .iter()
            .map(|id| (id.to_string(), Value::Null))
            .collect();
        serde_json::to_vec(&map).map_err(|e| AwarenessError::Malformed(e.to_string()))
    }

    /// Register an update handler. Handlers run synchronously on every
    /// emitted diff until removed with [`off`](Self::off).
    pub fn on<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: Fn(&AwarenessUpdate) + Send + Sync + 'static,
    {
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.subscribers.insert(id, Box::new(handler));
        id
    }

    /// Remove a handler. Unknown ids are a no-op.
    pub fn off(&mut self, id: SubscriptionId) {
        self.subscribers.remove(&id);
    }

    /// Clear all state and subscribers (room eviction).
    pub fn destroy(&mut self) {
        self.states.clear();
        self.subscribers.clear();
    }

    fn emit(&self, update: &AwarenessUpdate) {
        for handler in self.subscribers.values() {
            handler(update);
        }
    }
}

impl Default for AwarenessStore {
    fn default() -> Self {
        Self::new()
    }
}
