//! Durable snapshots of the server's tree.
//!
//! ```text
//! ┌─────────────┐  dirty worlds   ┌───────────────┐
//! │ StoreServer │ ──────────────► │ SnapshotStore │
//! │ (in-memory) │  every interval │ (RocksDB)     │
//! └──────┬──────┘                 └───────┬───────┘
//!        │ on startup                     │ column families
//!        ▼                                ▼
//! ┌─────────────┐     ┌──────────────────────────────────────┐
//! │ MemoryStore │     │ CF "worlds"  : LZ4-compressed JSON   │
//! │ (restored)  │     │ CF "metadata": version, sizes, times │
//! └─────────────┘     └──────────────────────────────────────┘
//! ```
//!
//! One entry per world, keyed by the world root path (`world/{owner}/{world}`).

pub mod rocks;

pub use rocks::{PersistConfig, PersistError, SnapshotStore, WorldMetadata};
