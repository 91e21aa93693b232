//! Single-writer record sync (settings, clipboard).
//!
//! Whole-record last-write-wins: a pending local value is written to its
//! path as one `set`; a remote value is adopted only when nothing local is
//! pending. Absent records read as `T::default()`.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SyncError;
use crate::store::{SharedStore, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFlush {
    Written,
    Unchanged,
    Denied,
}

#[derive(Debug, Clone)]
pub struct RecordSync<T> {
    path: String,
    current: T,
    last_synced: T,
}

impl<T> RecordSync<T>
where
    T: Serialize + DeserializeOwned + Clone + PartialEq + Default,
{
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            current: T::default(),
            last_synced: T::default(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn current(&self) -> &T {
        &self.current
    }

    /// Local edit. Returns false if the value is unchanged.
    pub fn set(&mut self, value: T) -> bool {
        if self.current == value {
            return false;
        }
        self.current = value;
        true
    }

    pub fn has_pending(&self) -> bool {
        self.current != self.last_synced
    }

    /// Reconcile a remote snapshot. Returns true if `current` changed.
    pub fn on_snapshot(&mut self, snapshot: Snapshot) -> bool {
        let incoming = match snapshot {
            None => T::default(),
            Some(value) => match serde_json::from_value::<T>(value) {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("Ignoring malformed record at {}: {e}", self.path);
                    return false;
                }
            },
        };

        let pending = self.has_pending();
        self.last_synced = incoming.clone();
        if pending || self.current == incoming {
            return false;
        }
        self.current = incoming;
        true
    }

    /// Forget local state, e.g. after the record was deleted remotely by us.
    pub fn reset(&mut self) {
        self.current = T::default();
        self.last_synced = T::default();
    }

    /// Write the pending value, if any. A denied write drops the local
    /// value so later remote snapshots are adopted again.
    pub async fn flush(&mut self, store: &SharedStore) -> Result<RecordFlush, SyncError> {
        if !self.has_pending() {
            return Ok(RecordFlush::Unchanged);
        }
        let written = self.current.clone();
        let value = serde_json::to_value(&written)?;
        match store.set(&self.path, value).await {
            Ok(()) => {
                self.last_synced = written;
                Ok(RecordFlush::Written)
            }
            Err(e) if e.is_permission_denied() => {
                log::debug!("Write to {} denied, dropping local value", self.path);
                self.current = self.last_synced.clone();
                Ok(RecordFlush::Denied)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Auth, MemoryStore};
    use serde_json::json;
    use tessera_core::{ClipboardState, ThemeSettings};

    const PATH: &str = "world/alice/w1/settings";

    #[tokio::test]
    async fn test_flush_writes_whole_record_once() {
        let store = MemoryStore::new();
        let conn = store.connect(Auth::user("alice")).into_shared();
        let mut settings: RecordSync<ThemeSettings> = RecordSync::new(PATH);

        assert_eq!(settings.flush(&conn).await.unwrap(), RecordFlush::Unchanged);
        let theme = ThemeSettings {
            font_size: 22,
            ..ThemeSettings::default()
        };
        assert!(settings.set(theme.clone()));
        assert_eq!(settings.flush(&conn).await.unwrap(), RecordFlush::Written);
        assert_eq!(settings.flush(&conn).await.unwrap(), RecordFlush::Unchanged);

        let stored = store.snapshot(PATH).await.unwrap();
        assert_eq!(stored["fontSize"], json!(22));
    }

    #[test]
    fn test_remote_adopted_only_without_pending() {
        let mut settings: RecordSync<ThemeSettings> = RecordSync::new(PATH);
        assert!(settings.on_snapshot(Some(json!({"fontSize": 30}))));
        assert_eq!(settings.current().font_size, 30);

        settings.set(ThemeSettings {
            font_size: 12,
            ..ThemeSettings::default()
        });
        assert!(!settings.on_snapshot(Some(json!({"fontSize": 40}))));
        assert_eq!(settings.current().font_size, 12);
        assert!(settings.has_pending());
    }

    #[test]
    fn test_absent_and_malformed_snapshots() {
        let mut clipboard: RecordSync<ClipboardState> = RecordSync::new("c");
        assert!(!clipboard.on_snapshot(None));
        assert!(clipboard.current().is_empty());
        assert!(!clipboard.on_snapshot(Some(json!("garbage"))));
    }

    #[tokio::test]
    async fn test_denied_flush() {
        let store = MemoryStore::new();
        let conn = store.connect(Auth::user("bob")).into_shared();
        let mut settings: RecordSync<ThemeSettings> = RecordSync::new(PATH);
        settings.set(ThemeSettings {
            show_grid: true,
            ..ThemeSettings::default()
        });
        assert_eq!(settings.flush(&conn).await.unwrap(), RecordFlush::Denied);
        assert!(!settings.has_pending());
        assert!(!settings.current().show_grid);
        assert_eq!(settings.flush(&conn).await.unwrap(), RecordFlush::Unchanged);

        assert!(settings.on_snapshot(Some(json!({"fontSize": 18}))));
        assert_eq!(settings.current().font_size, 18);
    }
}
