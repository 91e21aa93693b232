//! # tessera-core: World-state model and structural diffing
//!
//! Shared types for the Tessera synchronization engine:
//!
//! - [`world`]: `WorldState` (sparse cell map) and the auxiliary
//!   `ThemeSettings` / `ClipboardState` records
//! - [`diff`]: path-addressed structural diff/patch over JSON trees
//! - [`paths`]: logical store path layout for a world
//!
//! The round-trip law `patch(base, diff(current, base)) == current` holds
//! for every pair of acyclic trees; everything in `tessera-sync` leans on it.

pub mod diff;
pub mod paths;
pub mod world;

pub use diff::{apply, diff, escape_segment, join_path, patch, split_path, unescape_segment, DiffPatch};
pub use paths::{validate_id, PathError, WorldPath};
pub use world::{ClipboardState, ThemeSettings, WorldState};

/// Re-exported so downstream crates agree on the tree representation.
pub use serde_json::{Map, Value};
