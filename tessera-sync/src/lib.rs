//! # tessera-sync: Multi-writer world-state synchronization
//!
//! Keeps a sparse world map consistent between any number of concurrent
//! editors sharing one real-time tree store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  users/{sid}/data  ┌─────────────────┐   data    ┌──────────────┐
//! │ WorldSession │ ─────────────────► │ CanonicalMerger │ ────────► │ canonical    │
//! │ (per editor) │   ChannelWriter    │ (LWW per cell)  │           │ world state  │
//! └──────┬───────┘                    └─────────────────┘           └──────┬───────┘
//!        ▲                                                                 │
//!        └──────────────── Reconciler (rebase pending edits) ◄─────────────┘
//! ```
//!
//! Every editor writes only its own channel; the merger folds channels
//! into the canonical path by timestamp and cleans up what it consumed.
//! Editors subscribe to the canonical path and rebase their unsaved edits
//! onto each snapshot.
//!
//! ## Modules
//!
//! - [`store`]: `RealtimeStore` trait, in-memory store and access rules
//! - [`tracker`], [`channel`], [`merger`], [`reconciler`]: the sync pipeline
//! - [`history`]: bounded undo/redo
//! - [`record`]: last-write-wins settings and clipboard
//! - [`machine`], [`session`]: the per-world session and its event loop
//! - [`protocol`], [`server`], [`client`], [`storage`]: networked store

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod feed;
pub mod history;
pub mod machine;
pub mod merger;
pub mod protocol;
pub mod reconciler;
pub mod record;
pub mod server;
pub mod session;
pub mod storage;
pub mod store;
pub mod tracker;

pub use channel::{ChannelEntry, ChannelWriter, FlushOutcome, SkipReason};
pub use client::{ClientConfig, ConnectionState, RemoteStore};
pub use config::{SyncConfig, WriteMode};
pub use error::SyncError;
pub use feed::{ChangeBatch, ChangeFeed, FeedStats};
pub use history::HistoryManager;
pub use machine::{SyncStatus, WorldEdit, WorldMachine};
pub use merger::{fold_channels, spawn_merger, CanonicalMerger, ChannelFold, MergeOutcome};
pub use protocol::{GuardedUpdate, Hello, MessageType, ProtocolError, StoreMessage};
pub use reconciler::{Reconciled, Reconciler};
pub use record::{RecordFlush, RecordSync};
pub use server::{RunningServer, ServerConfig, ServerError, ServerStats, StoreServer};
pub use session::{SessionIdentity, SessionSnapshot, WorldSession};
pub use storage::{PersistConfig, PersistError, SnapshotStore, WorldMetadata};
pub use store::{
    Auth, MemoryConnection, MemoryStore, RealtimeStore, SharedStore, Snapshot, StoreError,
    StoreResult, Subscription,
};
pub use tracker::LocalEditTracker;

pub use tessera_core::{ClipboardState, DiffPatch, ThemeSettings, WorldPath, WorldState};
