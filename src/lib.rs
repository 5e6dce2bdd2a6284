//! # kn-collab — Real-time collaborative editing sync engine
//!
//! The synchronization core of the Knowledge Network editor: many clients
//! concurrently edit the same document over WebSocket and converge on an
//! identical, conflict-free state, with ephemeral presence relay and
//! debounced snapshot history off the real-time path.
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐   ws (JSON envelope)   ┌──────────────┐
//!            ├──────────────────────► │ SyncServer   │ auth gate, room routing
//! Client B ──┘                        └──────┬───────┘
//!                                            │
//!                                     ┌──────┴───────┐
//!                                     │ RoomRegistry │ atomic get-or-create
//!                                     └──────┬───────┘
//!                                            │ one per document
//!                                     ┌──────┴───────┐
//!                                     │ Room         │ relay, origin exclusion
//!                                     │  ├ DocHandle │ yrs CRDT (opaque deltas)
//!                                     │  └ Awareness │ presence, never persisted
//!                                     └──────┬───────┘
//!                                            │ debounced, fire-and-forget
//!                                     ┌──────┴───────┐
//!                                     │ VersionStore │ RocksDB + LZ4 snapshots
//!                                     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire envelope (`sync` / `update` / `awareness`)
//! - [`document`] — CRDT boundary around `yrs` (apply / encode / clock)
//! - [`awareness`] — ephemeral presence store with add/update/remove diffs
//! - [`room`] — per-document session: connections, relay, debounced saves
//! - [`registry`] — room lifecycle: get-or-create, hydration, idle eviction
//! - [`server`] — WebSocket gateway (auth gate, room binding)
//! - [`storage`] — append-only version history (RocksDB, LZ4)
//! - [`http`] — read-only inspection API (stats, versions, metrics)

pub mod awareness;
pub mod document;
pub mod http;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use awareness::{AwarenessError, AwarenessStore, AwarenessUpdate, ClientId};
pub use document::{DocError, DocHandle};
pub use protocol::{ProtocolError, WireMessage};
pub use registry::{RegistryConfig, RoomRegistry};
pub use room::{Connection, ConnectionId, Room, RoomStats, DEFAULT_DEBOUNCE};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{StoreConfig, StoreError, VersionMeta, VersionStore};
