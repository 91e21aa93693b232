//! World state and auxiliary records.
//!
//! A world is a sparse grid: coordinate keys such as `"5,10"` map to an
//! opaque cell value (a glyph string, a style record, an image reference).
//! The sync engine never interprets cell values; it only diffs, merges and
//! stores them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::diff::{self, DiffPatch};

/// Sparse coordinate-key → cell-value map.
///
/// Null is never stored: setting a key to `Value::Null` removes it, matching
/// the backing store, where null means "absent".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorldState {
    cells: Map<String, Value>,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a raw map, dropping null cells.
    pub fn from_map(mut cells: Map<String, Value>) -> Self {
        cells.retain(|_, v| !v.is_null());
        Self { cells }
    }

    /// Build from a store snapshot. Anything but a record is an empty world.
    pub fn from_snapshot(snapshot: Option<Value>) -> Self {
        match snapshot {
            Some(Value::Object(cells)) => Self::from_map(cells),
            Some(Value::Null) | None => Self::new(),
            Some(other) => {
                log::warn!("Ignoring non-record world snapshot: {other}");
                Self::new()
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.cells.get(key)
    }

    /// Set a cell, returning the previous value. Null removes the cell.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        let key = key.into();
        if value.is_null() {
            self.cells.remove(&key)
        } else {
            self.cells.insert(key, value)
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.cells.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.cells.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.cells.iter()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.cells
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.cells
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.cells.clone())
    }

    /// Patch that turns `base` into `self`.
    pub fn diff(&self, base: &WorldState) -> DiffPatch {
        diff::diff(&self.cells, &base.cells)
    }

    /// Copy of `self` with `patch` applied.
    pub fn patched(&self, patch: &DiffPatch) -> WorldState {
        Self::from_map(diff::patch(&self.cells, patch))
    }
}

impl FromIterator<(String, Value)> for WorldState {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

/// Canvas theme, synchronized as one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThemeSettings {
    pub background_color: String,
    pub text_color: String,
    pub font_family: String,
    pub font_size: u32,
    pub show_grid: bool,
}

impl Default for ThemeSettings {
    fn default() -> Self {
        Self {
            background_color: "#000000".to_string(),
            text_color: "#ffffff".to_string(),
            font_family: "monospace".to_string(),
            font_size: 16,
            show_grid: false,
        }
    }
}

/// Copied region of cells, keyed relative to the selection origin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipboardState {
    pub cells: Map<String, Value>,
    pub width: u32,
    pub height: u32,
}

impl ClipboardState {
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
