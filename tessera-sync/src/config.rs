//! Engine configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a session publishes its world edits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Write the canonical path directly. Only safe with a single writer.
    Direct,
    /// Write to the session's own channel; the merger folds channels into
    /// the canonical path.
    #[default]
    Channelled,
}

impl FromStr for WriteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(WriteMode::Direct),
            "channelled" | "channeled" => Ok(WriteMode::Channelled),
            other => Err(format!("unknown write mode: {other}")),
        }
    }
}

/// Sync engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Quiet period before pending edits are written and history records.
    pub save_debounce: Duration,
    /// Canonical merge period.
    pub merge_interval: Duration,
    /// Undo/redo stack cap.
    pub max_history_states: usize,
    pub write_mode: WriteMode,
    /// Give up waiting for the first canonical snapshot after this long.
    pub initial_load_timeout: Duration,
    /// Delay before retrying a failed write.
    pub write_retry_delay: Duration,
    /// Run the canonical merger inside the session loop. Only takes effect
    /// for the world owner's sessions.
    pub run_merger: bool,
    /// Never write anything.
    pub read_only: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            save_debounce: Duration::from_millis(10),
            merge_interval: Duration::from_millis(100),
            max_history_states: 100,
            write_mode: WriteMode::Channelled,
            initial_load_timeout: Duration::from_millis(5000),
            write_retry_delay: Duration::from_millis(500),
            run_merger: true,
            read_only: false,
        }
    }
}

impl SyncConfig {
    /// Short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            save_debounce: Duration::from_millis(5),
            merge_interval: Duration::from_millis(20),
            max_history_states: 10,
            initial_load_timeout: Duration::from_millis(500),
            write_retry_delay: Duration::from_millis(30),
            ..Self::default()
        }
    }

    /// Defaults overridden by `TESSERA_*` environment variables.
    ///
    /// `TESSERA_SAVE_DEBOUNCE_MS`, `TESSERA_MERGE_INTERVAL_MS`,
    /// `TESSERA_MAX_HISTORY_STATES`, `TESSERA_WRITE_MODE`,
    /// `TESSERA_INITIAL_LOAD_TIMEOUT_MS`, `TESSERA_WRITE_RETRY_MS`,
    /// `TESSERA_RUN_MERGER`, `TESSERA_READ_ONLY`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let millis = |key: &str| lookup(key).and_then(|v| parse_logged::<u64>(key, &v));

        if let Some(ms) = millis("TESSERA_SAVE_DEBOUNCE_MS") {
            config.save_debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = millis("TESSERA_MERGE_INTERVAL_MS") {
            config.merge_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(cap) = lookup("TESSERA_MAX_HISTORY_STATES")
            .and_then(|v| parse_logged::<usize>("TESSERA_MAX_HISTORY_STATES", &v))
        {
            config.max_history_states = cap.max(1);
        }
        if let Some(mode) = lookup("TESSERA_WRITE_MODE")
            .and_then(|v| parse_logged::<WriteMode>("TESSERA_WRITE_MODE", &v))
        {
            config.write_mode = mode;
        }
        if let Some(ms) = millis("TESSERA_INITIAL_LOAD_TIMEOUT_MS") {
            config.initial_load_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = millis("TESSERA_WRITE_RETRY_MS") {
            config.write_retry_delay = Duration::from_millis(ms);
        }
        if let Some(flag) = lookup("TESSERA_RUN_MERGER").and_then(|v| parse_flag(&v)) {
            config.run_merger = flag;
        }
        if let Some(flag) = lookup("TESSERA_READ_ONLY").and_then(|v| parse_flag(&v)) {
            config.read_only = flag;
        }
        config
    }
}

pub(crate) fn parse_logged<T: FromStr>(key: &str, value: &str) -> Option<T> {
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("Ignoring invalid {key}={value}");
            None
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
