//! Persistent version history for collaborative documents.
//!
//! Architecture:
//! ```text
//! ┌────────────┐   debounced save   ┌──────────────┐
//! │ Room       │ ─────────────────► │ VersionStore │
//! │ (in-memory)│                    │ (RocksDB)    │
//! └─────┬──────┘                    └──────┬───────┘
//!       │                                  │ column families
//!       │ hydrate on first connect         ▼
//!       ▼                  ┌────────────────────────────────────┐
//! ┌────────────┐           │ CF "snapshots" — full state (LZ4)  │
//! │ CRDT doc   │           │ CF "meta"      — version metadata  │
//! └────────────┘           └────────────────────────────────────┘
//! ```
//!
//! Versions are append-only and timestamp-keyed; the store never mutates or
//! deletes an existing version (retention is an external concern).

pub mod versions;

pub use versions::{StoreConfig, StoreError, VersionMeta, VersionStore};
