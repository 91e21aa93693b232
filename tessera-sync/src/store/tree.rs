//! In-memory tree with real-time-store write semantics.
//!
//! - Null and empty records are never stored; writing one removes the key
//!   and prunes parents that become empty.
//! - `{".sv": "timestamp"}` anywhere in a written value is replaced by the
//!   store clock. One timestamp per write call, strictly increasing.
//! - Path segments use the same escaping as `tessera_core::diff`.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};
use tessera_core::{split_path, unescape_segment};

use super::{Snapshot, StoreError, StoreResult};

/// Key of the server-value placeholder record.
pub const SERVER_VALUE_KEY: &str = ".sv";

/// Placeholder the store replaces with its clock at write time.
pub fn server_timestamp() -> Value {
    json!({ SERVER_VALUE_KEY: "timestamp" })
}

/// Monotonic millisecond clock.
#[derive(Debug, Clone, Default)]
pub struct ServerClock {
    last: u64,
}

impl ServerClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp: wall-clock millis, bumped past the previous value.
    pub fn next(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.last = now.max(self.last + 1);
        self.last
    }

    /// Never hand out a timestamp at or below `floor`.
    pub fn observe(&mut self, floor: u64) {
        self.last = self.last.max(floor);
    }

    pub fn last(&self) -> u64 {
        self.last
    }
}

/// The stored tree.
#[derive(Debug, Clone, Default)]
pub struct StoreTree {
    root: Map<String, Value>,
    clock: ServerClock,
}

impl StoreTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clock(&self) -> &ServerClock {
        &self.clock
    }

    /// Read the subtree at `path`.
    pub fn get(&self, path: &str) -> Snapshot {
        let segments = segments(path);
        if segments.is_empty() {
            return if self.root.is_empty() {
                None
            } else {
                Some(Value::Object(self.root.clone()))
            };
        }

        let mut node = &self.root;
        let (last, parents) = segments.split_last()?;
        for seg in parents {
            match node.get(seg.as_str()) {
                Some(Value::Object(child)) => node = child,
                _ => return None,
            }
        }
        node.get(last.as_str()).cloned()
    }

    /// Overwrite the subtree at `path`. Returns the normalized written path.
    pub fn set(&mut self, path: &str, value: Value) -> StoreResult<Vec<String>> {
        let now = self.clock.next();
        let normalized = normalize(path);
        self.write(&normalized, resolve_server_values(value, now))?;
        Ok(vec![normalized])
    }

    /// Apply several writes atomically. Either all apply or none do.
    pub fn update(&mut self, values: BTreeMap<String, Value>) -> StoreResult<Vec<String>> {
        let normalized: BTreeMap<String, Value> = values
            .into_iter()
            .map(|(path, value)| (normalize(&path), value))
            .collect();
        check_disjoint(normalized.keys())?;
        for path in normalized.keys() {
            if path.is_empty() {
                return Err(StoreError::InvalidPath("multi-path update cannot target the root".into()));
            }
        }

        let now = self.clock.next();
        let mut written = Vec::with_capacity(normalized.len());
        for (path, value) in normalized {
            self.write(&path, resolve_server_values(value, now))?;
            written.push(path);
        }
        Ok(written)
    }

    /// [`StoreTree::update`] guarded by the current snapshots of
    /// `expected`. `None` when a guard no longer matches.
    pub fn update_if(
        &mut self,
        expected: &BTreeMap<String, Snapshot>,
        values: BTreeMap<String, Value>,
    ) -> StoreResult<Option<Vec<String>>> {
        for (path, snapshot) in expected {
            if &self.get(path) != snapshot {
                log::trace!("Guard on {path} no longer matches");
                return Ok(None);
            }
        }
        self.update(values).map(Some)
    }

    /// Replace the subtree at `path` without touching the clock. Used when
    /// restoring persisted data; the clock is advanced past any restored
    /// timestamp it can see.
    pub fn restore(&mut self, path: &str, value: Value) -> StoreResult<()> {
        if let Some(max) = max_number(&value) {
            self.clock.observe(max);
        }
        self.write(&normalize(path), value)
    }

    fn write(&mut self, path: &str, value: Value) -> StoreResult<()> {
        let value = prune(value);
        let segments = segments(path);
        if segments.is_empty() {
            return match value {
                Some(Value::Object(map)) => {
                    self.root = map;
                    Ok(())
                }
                None => {
                    self.root.clear();
                    Ok(())
                }
                Some(_) => Err(StoreError::InvalidPath("root must be a record".into())),
            };
        }
        write_at(&mut self.root, &segments, value);
        Ok(())
    }
}

/// Whether a write at one path can change the snapshot at the other.
pub fn paths_overlap(a: &str, b: &str) -> bool {
    let a = a.trim_matches('/');
    let b = b.trim_matches('/');
    if a.is_empty() || b.is_empty() || a == b {
        return true;
    }
    is_ancestor(a, b) || is_ancestor(b, a)
}

fn is_ancestor(ancestor: &str, path: &str) -> bool {
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

fn segments(path: &str) -> Vec<String> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        Vec::new()
    } else {
        split_path(trimmed)
    }
}

fn check_disjoint<'a>(paths: impl Iterator<Item = &'a String>) -> StoreResult<()> {
    let paths: Vec<&String> = paths.collect();
    for (i, a) in paths.iter().enumerate() {
        for b in &paths[i + 1..] {
            if is_ancestor(a, b) || is_ancestor(b, a) {
                return Err(StoreError::InvalidPath(format!(
                    "overlapping paths in update: {a} and {b}"
                )));
            }
        }
    }
    Ok(())
}

fn write_at(node: &mut Map<String, Value>, segments: &[String], value: Option<Value>) {
    match segments {
        [] => {}
        [last] => match value {
            Some(v) => {
                node.insert(last.clone(), v);
            }
            None => {
                node.remove(last.as_str());
            }
        },
        [head, rest @ ..] => {
            if value.is_none() {
                let now_empty = match node.get_mut(head.as_str()) {
                    Some(Value::Object(child)) => {
                        write_at(child, rest, None);
                        child.is_empty()
                    }
                    _ => false,
                };
                if now_empty {
                    node.remove(head.as_str());
                }
                return;
            }

            let entry = node
                .entry(head.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(child) = entry {
                write_at(child, rest, value);
            }
        }
    }
}

/// Drop nulls and empty records, bottom-up. `None` means nothing is left.
fn prune(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let pruned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| prune(v).map(|v| (k, v)))
                .collect();
            if pruned.is_empty() {
                None
            } else {
                Some(Value::Object(pruned))
            }
        }
        other => Some(other),
    }
}

fn resolve_server_values(value: Value, now: u64) -> Value {
    match value {
        Value::Object(map) if is_timestamp_placeholder(&map) => Value::from(now),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, resolve_server_values(v, now)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| resolve_server_values(v, now))
                .collect(),
        ),
        other => other,
    }
}

fn is_timestamp_placeholder(map: &Map<String, Value>) -> bool {
    map.len() == 1 && map.get(SERVER_VALUE_KEY).and_then(Value::as_str) == Some("timestamp")
}

fn max_number(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::Object(map) => map.values().filter_map(max_number).max(),
        Value::Array(items) => items.iter().filter_map(max_number).max(),
        _ => None,
    }
}

/// Unescaped last segment of a path.
pub(crate) fn last_segment(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    let last = trimmed.rsplit('/').next().unwrap_or_default();
    unescape_segment(last).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut tree = StoreTree::new();
        tree.set("world/a/w/data", json!({"1,1": "x"})).unwrap();
        assert_eq!(tree.get("world/a/w/data/1,1"), Some(json!("x")));
        assert_eq!(tree.get("world/a/w"), Some(json!({"data": {"1,1": "x"}})));
        assert_eq!(tree.get("world/a/w/missing"), None);
        assert_eq!(tree.get("world/a/w/data/1,1/deeper"), None);
    }

    #[test]
    fn test_null_removes_and_prunes_parents() {
        let mut tree = StoreTree::new();
        tree.set("world/a/w/users/s1/data/k", json!("v")).unwrap();
        tree.set("world/a/w/data/k", json!("v")).unwrap();
        tree.set("world/a/w/users/s1/data/k", Value::Null).unwrap();
        assert_eq!(tree.get("world/a/w/users"), None);
        assert_eq!(tree.get("world/a/w/data/k"), Some(json!("v")));
    }

    #[test]
    fn test_empty_records_are_not_stored() {
        let mut tree = StoreTree::new();
        tree.set("a/b", json!({"c": {}, "d": null})).unwrap();
        assert_eq!(tree.get("a"), None);
        assert_eq!(tree.get(""), None);
    }

    #[test]
    fn test_update_is_atomic_multi_path() {
        let mut tree = StoreTree::new();
        tree.set("w/data", json!({"a": 1, "b": 2})).unwrap();
        let mut writes = BTreeMap::new();
        writes.insert("w/data/a".to_string(), Value::Null);
        writes.insert("w/data/c".to_string(), json!(3));
        let written = tree.update(writes).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(tree.get("w/data"), Some(json!({"b": 2, "c": 3})));
    }

    #[test]
    fn test_update_if_skips_when_guard_changed() {
        let mut tree = StoreTree::new();
        tree.set("w/users/s1/data/k", json!({"value": "old"})).unwrap();

        let mut expected = BTreeMap::new();
        expected.insert("w/users/s1/data/k".to_string(), Some(json!({"value": "old"})));
        expected.insert("w/users/s2".to_string(), None);
        let mut writes = BTreeMap::new();
        writes.insert("w/users/s1/data/k".to_string(), Value::Null);

        tree.set("w/users/s1/data/k", json!({"value": "new"})).unwrap();
        assert_eq!(tree.update_if(&expected, writes.clone()).unwrap(), None);
        assert_eq!(tree.get("w/users/s1/data/k"), Some(json!({"value": "new"})));

        expected.insert("w/users/s1/data/k".to_string(), Some(json!({"value": "new"})));
        assert_eq!(tree.update_if(&expected, writes).unwrap().map(|w| w.len()), Some(1));
        assert_eq!(tree.get("w"), None);
    }

    #[test]
    fn test_update_rejects_overlapping_paths() {
        let mut tree = StoreTree::new();
        let mut writes = BTreeMap::new();
        writes.insert("w/data".to_string(), json!({"a": 1}));
        writes.insert("w/data/b".to_string(), json!(2));
        assert!(matches!(tree.update(writes), Err(StoreError::InvalidPath(_))));
        assert_eq!(tree.get("w"), None);
    }

    #[test]
    fn test_server_timestamps_resolved_and_monotonic() {
        let mut tree = StoreTree::new();
        tree.set("e1", json!({"value": "x", "timestamp": server_timestamp()})).unwrap();
        tree.set("e2", json!({"value": "y", "timestamp": server_timestamp()})).unwrap();
        let t1 = tree.get("e1/timestamp").and_then(|v| v.as_u64()).unwrap();
        let t2 = tree.get("e2/timestamp").and_then(|v| v.as_u64()).unwrap();
        assert!(t2 > t1);
        assert_eq!(tree.clock().last(), t2);
    }

    #[test]
    fn test_one_timestamp_per_update() {
        let mut tree = StoreTree::new();
        let mut writes = BTreeMap::new();
        writes.insert("a".to_string(), json!({"t": server_timestamp()}));
        writes.insert("b".to_string(), json!({"t": server_timestamp()}));
        tree.update(writes).unwrap();
        assert_eq!(tree.get("a/t"), tree.get("b/t"));
    }

    #[test]
    fn test_escaped_segments() {
        let mut tree = StoreTree::new();
        tree.set("w/data/a~1b", json!(1)).unwrap();
        assert_eq!(tree.get("w/data"), Some(json!({"a/b": 1})));
        assert_eq!(tree.get("w/data/a~1b"), Some(json!(1)));
    }

    #[test]
    fn test_scalar_parent_is_replaced() {
        let mut tree = StoreTree::new();
        tree.set("a", json!(5)).unwrap();
        tree.set("a/b", json!(6)).unwrap();
        assert_eq!(tree.get("a"), Some(json!({"b": 6})));
    }

    #[test]
    fn test_root_write_rules() {
        let mut tree = StoreTree::new();
        assert!(tree.set("", json!(1)).is_err());
        tree.set("", json!({"a": 1})).unwrap();
        assert_eq!(tree.get(""), Some(json!({"a": 1})));
        tree.set("/", Value::Null).unwrap();
        assert_eq!(tree.get(""), None);
    }

    #[test]
    fn test_restore_advances_clock() {
        let mut tree = StoreTree::new();
        let far_future = 10_000_000_000_000u64;
        tree.restore("w", json!({"t": far_future})).unwrap();
        tree.set("x", json!({"t": server_timestamp()})).unwrap();
        assert!(tree.get("x/t").and_then(|v| v.as_u64()).unwrap() > far_future);
    }

    #[test]
    fn test_paths_overlap() {
        assert!(paths_overlap("a/b", "a/b"));
        assert!(paths_overlap("a/b", "a/b/c"));
        assert!(paths_overlap("a/b/c", "a/b"));
        assert!(paths_overlap("", "a"));
        assert!(!paths_overlap("a/b", "a/bc"));
        assert!(!paths_overlap("a/b", "a/c"));
    }

    #[test]
    fn test_last_segment() {
        assert_eq!(last_segment("w/data/a~1b"), "a/b");
        assert_eq!(last_segment("w/users/s1/"), "s1");
    }
}
