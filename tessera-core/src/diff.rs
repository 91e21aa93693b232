//! Structural diff/patch over nested JSON records.
//!
//! A [`DiffPatch`] is a flat map from slash-delimited path to the new value
//! at that path. `null` means "delete". Records (JSON objects) are recursed
//! into; arrays and scalars are atomic leaves.
//!
//! ```text
//!   base    {"5,10": "X", "style": {"fg": "red", "bg": "black"}}
//!   current {"5,11": "Y", "style": {"fg": "blue", "bg": "black"}}
//!
//!   diff    {"5,10": null, "5,11": "Y", "style/fg": "blue"}
//! ```
//!
//! Segments use JSON-Pointer escaping (`~` → `~0`, `/` → `~1`) so any key
//! survives the trip through a path.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Flat path → value-or-null delta between two trees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiffPatch {
    entries: BTreeMap<String, Value>,
}

impl DiffPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value` at `path`. `Value::Null` records a delete.
    pub fn insert(&mut self, path: impl Into<String>, value: Value) {
        self.entries.insert(path.into(), value);
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.entries.get(path)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterate entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries that delete a path.
    pub fn deletions(&self) -> usize {
        self.entries.values().filter(|v| v.is_null()).count()
    }

    /// Unescaped top-level keys touched by this patch, deduplicated and sorted.
    ///
    /// `{"5,10/fg": .., "5,10/bg": .., "7,7": ..}` → `["5,10", "7,7"]`.
    pub fn touched_keys(&self) -> Vec<String> {
        let keys: BTreeSet<String> = self
            .entries
            .keys()
            .map(|path| {
                let head = path.split('/').next().unwrap_or_default();
                unescape_segment(head).into_owned()
            })
            .collect();
        keys.into_iter().collect()
    }

    /// Rebase every path under `prefix`, producing a multi-path write map.
    pub fn prefixed(&self, prefix: &str) -> BTreeMap<String, Value> {
        self.entries
            .iter()
            .map(|(path, value)| (format!("{prefix}/{path}"), value.clone()))
            .collect()
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.entries
    }
}

impl FromIterator<(String, Value)> for DiffPatch {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Compute the patch that turns `base` into `current`.
///
/// Null values on either side count as absent keys.
pub fn diff(current: &Map<String, Value>, base: &Map<String, Value>) -> DiffPatch {
    let mut out = DiffPatch::new();
    diff_map(&mut out, None, current, base);
    out
}

fn diff_map(out: &mut DiffPatch, prefix: Option<&str>, current: &Map<String, Value>, base: &Map<String, Value>) {
    for (key, cur) in current {
        if cur.is_null() {
            continue;
        }
        let path = child_path(prefix, key);
        match base.get(key) {
            Some(old) if !old.is_null() => diff_value(out, &path, cur, old),
            _ => out.insert(path, cur.clone()),
        }
    }

    for (key, old) in base {
        if old.is_null() {
            continue;
        }
        if current.get(key).map_or(true, Value::is_null) {
            out.insert(child_path(prefix, key), Value::Null);
        }
    }
}

fn diff_value(out: &mut DiffPatch, path: &str, cur: &Value, old: &Value) {
    if cur == old {
        return;
    }
    match (cur, old) {
        (Value::Object(c), Value::Object(o)) => diff_map(out, Some(path), c, o),
        _ => out.insert(path.to_string(), cur.clone()),
    }
}

/// Apply `patch` to a copy of `base`.
pub fn patch(base: &Map<String, Value>, patch: &DiffPatch) -> Map<String, Value> {
    let mut merged = base.clone();
    apply(&mut merged, patch);
    merged
}

/// Apply `patch` in place.
///
/// Missing intermediate records are created; a scalar sitting where a record
/// is needed gets replaced. Deletes of absent paths are ignored.
pub fn apply(target: &mut Map<String, Value>, patch: &DiffPatch) {
    for (path, value) in patch.iter() {
        let segments = split_path(path);
        apply_at(target, &segments, value);
    }
}

fn apply_at(root: &mut Map<String, Value>, segments: &[String], value: &Value) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut node = root;
    for seg in parents {
        node = if value.is_null() {
            match node.get_mut(seg.as_str()) {
                Some(Value::Object(child)) => child,
                _ => return,
            }
        } else {
            let entry = node
                .entry(seg.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            match entry {
                Value::Object(child) => child,
                _ => return,
            }
        };
    }

    if value.is_null() {
        node.remove(last.as_str());
    } else {
        node.insert(last.clone(), value.clone());
    }
}

/// Escape one key for use as a path segment.
pub fn escape_segment(key: &str) -> Cow<'_, str> {
    if !key.contains(['~', '/']) {
        return Cow::Borrowed(key);
    }
    let mut out = String::with_capacity(key.len() + 2);
    for ch in key.chars() {
        match ch {
            '~' => out.push_str("~0"),
            '/' => out.push_str("~1"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Reverse of [`escape_segment`]. Unknown escapes are kept verbatim.
pub fn unescape_segment(segment: &str) -> Cow<'_, str> {
    if !segment.contains('~') {
        return Cow::Borrowed(segment);
    }
    let mut out = String::with_capacity(segment.len());
    let mut chars = segment.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '~' {
            out.push(ch);
            continue;
        }
        match chars.peek() {
            Some('0') => {
                chars.next();
                out.push('~');
            }
            Some('1') => {
                chars.next();
                out.push('/');
            }
            _ => out.push('~'),
        }
    }
    Cow::Owned(out)
}

/// Join raw keys into an escaped path.
pub fn join_path<'a>(keys: impl IntoIterator<Item = &'a str>) -> String {
    keys.into_iter()
        .map(escape_segment)
        .collect::<Vec<_>>()
        .join("/")
}

/// Split an escaped path into raw keys.
pub fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .map(|seg| unescape_segment(seg).into_owned())
        .collect()
}

fn child_path(prefix: Option<&str>, key: &str) -> String {
    let seg = escape_segment(key);
    match prefix {
        Some(prefix) => format!("{prefix}/{seg}"),
        None => seg.into_owned(),
    }
}
