//! World session: one event loop per connected world.
//!
//! ```text
//!  WorldSession (handle)                     session task (one per world)
//!  ─────────────────────                     ─────────────────────────────
//!  set_cell / undo / ...  ── Command ──►  ┌─► select! {
//!                           (mpsc)        │     command            → WorldMachine
//!                                         │     canonical snapshot → reconcile
//!                                         │     settings/clipboard → RecordSync
//!                                         │     save deadline      → ChannelWriter
//!                                         │     history deadline   → HistoryManager
//!                                         │     load timeout       → empty world
//!                                         │     merge tick         → CanonicalMerger
//!                                         │   }
//!  watch() / snapshot()  ◄── SessionSnapshot (watch) ──┘
//! ```
//!
//! Events are handled strictly in arrival order. Writes are awaited inline,
//! so at most one write is in flight; commands queue meanwhile. Dropping the
//! handle or calling [`WorldSession::disconnect`] stops the loop after the
//! current event, cancelling pending deadlines and subscriptions.

use std::collections::BTreeMap;

use serde_json::Value;
use tessera_core::{validate_id, ClipboardState, DiffPatch, PathError, ThemeSettings, WorldPath, WorldState};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::channel::ChannelWriter;
use crate::config::{SyncConfig, WriteMode};
use crate::error::SyncError;
use crate::machine::{SaveFollowUp, SyncStatus, WorldEdit, WorldMachine};
use crate::merger::{CanonicalMerger, MergeOutcome};
use crate::reconciler::Reconciled;
use crate::record::RecordSync;
use crate::store::{SharedStore, Snapshot, Subscription};

/// Who is editing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: Option<String>,
    /// Channel this session writes to. Defaults to the user id, which is
    /// the only channel a non-owner may write.
    pub session_id: Option<String>,
}

impl SessionIdentity {
    /// Read-only viewer.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(user_id: impl Into<String>) -> Result<Self, PathError> {
        let user_id = user_id.into();
        validate_id("user id", &user_id)?;
        Ok(Self {
            session_id: Some(user_id.clone()),
            user_id: Some(user_id),
        })
    }

    /// Write through a channel other than the user's own. The id becomes a
    /// path segment, so it is validated like owner and world ids.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Result<Self, PathError> {
        let session_id = session_id.into();
        validate_id("session id", &session_id)?;
        self.session_id = Some(session_id);
        Ok(self)
    }

    fn owns(&self, world: &WorldPath) -> bool {
        self.user_id.as_deref() == Some(world.owner_id())
    }
}

/// Everything a consumer can observe about a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub status: SyncStatus,
    pub world: WorldState,
    pub settings: ThemeSettings,
    pub clipboard: ClipboardState,
    pub error: Option<String>,
    pub can_undo: bool,
    pub can_redo: bool,
    records_saving: bool,
}

impl SessionSnapshot {
    pub fn is_loading(&self) -> bool {
        matches!(self.status, SyncStatus::Idle | SyncStatus::Loading)
    }

    pub fn is_saving(&self) -> bool {
        self.status == SyncStatus::Saving || self.records_saving
    }
}

type Reply = oneshot::Sender<Result<(), SyncError>>;

enum Command {
    Edit(WorldEdit),
    Undo,
    Redo,
    SetSettings(ThemeSettings),
    SetClipboard(ClipboardState),
    ClearWorld(Reply),
    Flush(Reply),
    Disconnect(oneshot::Sender<()>),
}

/// Handle to a running world session.
pub struct WorldSession {
    world: WorldPath,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

impl WorldSession {
    /// Start syncing `world`. Must be called inside a tokio runtime.
    pub fn connect(
        store: SharedStore,
        world: WorldPath,
        identity: SessionIdentity,
        config: SyncConfig,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(SessionSnapshot::default());

        let task = SessionTask::new(store, world.clone(), identity, config, snapshot_tx);
        let task = tokio::spawn(task.run(command_rx));

        Self {
            world,
            commands,
            snapshot,
            task,
        }
    }

    pub fn world(&self) -> &WorldPath {
        &self.world
    }

    pub fn set_cell(&self, key: impl Into<String>, value: Value) -> Result<(), SyncError> {
        self.send(Command::Edit(WorldEdit::Set {
            key: key.into(),
            value,
        }))
    }

    pub fn remove_cell(&self, key: impl Into<String>) -> Result<(), SyncError> {
        self.send(Command::Edit(WorldEdit::Remove { key: key.into() }))
    }

    /// Apply a batch of path writes (null deletes).
    pub fn apply(&self, patch: DiffPatch) -> Result<(), SyncError> {
        self.send(Command::Edit(WorldEdit::Patch(patch)))
    }

    pub fn replace(&self, state: WorldState) -> Result<(), SyncError> {
        self.send(Command::Edit(WorldEdit::Replace(state)))
    }

    pub fn undo(&self) -> Result<(), SyncError> {
        self.send(Command::Undo)
    }

    pub fn redo(&self) -> Result<(), SyncError> {
        self.send(Command::Redo)
    }

    pub fn set_settings(&self, settings: ThemeSettings) -> Result<(), SyncError> {
        self.send(Command::SetSettings(settings))
    }

    pub fn set_clipboard(&self, clipboard: ClipboardState) -> Result<(), SyncError> {
        self.send(Command::SetClipboard(clipboard))
    }

    /// Remove canonical data, every channel and the clipboard in one write.
    pub async fn clear_world(&self) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ClearWorld(tx))?;
        rx.await.map_err(|_| SyncError::Closed)?
    }

    /// Write anything pending now instead of waiting for the debounce.
    pub async fn flush(&self) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Flush(tx))?;
        rx.await.map_err(|_| SyncError::Closed)?
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn state(&self) -> WorldState {
        self.snapshot.borrow().world.clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.snapshot.borrow().status
    }

    pub fn is_loading(&self) -> bool {
        self.snapshot.borrow().is_loading()
    }

    pub fn is_saving(&self) -> bool {
        self.snapshot.borrow().is_saving()
    }

    pub fn error(&self) -> Option<String> {
        self.snapshot.borrow().error.clone()
    }

    pub fn can_undo(&self) -> bool {
        self.snapshot.borrow().can_undo
    }

    pub fn can_redo(&self) -> bool {
        self.snapshot.borrow().can_redo
    }

    pub fn settings(&self) -> ThemeSettings {
        self.snapshot.borrow().settings.clone()
    }

    pub fn clipboard(&self) -> ClipboardState {
        self.snapshot.borrow().clipboard.clone()
    }

    /// Wait until `pred` holds for the published snapshot.
    pub async fn wait_for(
        &self,
        pred: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot, SyncError> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx.wait_for(pred).await.map_err(|_| SyncError::Closed)?;
        Ok(snapshot.clone())
    }

    pub async fn wait_until_loaded(&self) -> Result<SessionSnapshot, SyncError> {
        self.wait_for(|s| !s.is_loading()).await
    }

    /// Stop the session and wait for its loop to exit.
    pub async fn disconnect(self) {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Disconnect(tx)).is_ok() {
            let _ = rx.await;
        }
        let _ = self.task.await;
    }

    fn send(&self, command: Command) -> Result<(), SyncError> {
        self.commands.send(command).map_err(|_| SyncError::Closed)
    }
}

struct SessionTask {
    store: SharedStore,
    world: WorldPath,
    config: SyncConfig,
    can_write: bool,
    owns_world: bool,
    machine: WorldMachine,
    writer: ChannelWriter,
    merger: CanonicalMerger,
    settings: RecordSync<ThemeSettings>,
    clipboard: RecordSync<ClipboardState>,
    records_saving: bool,
    records_failed: bool,
    save_at: Option<Instant>,
    history_at: Option<Instant>,
    records_at: Option<Instant>,
    load_deadline: Option<Instant>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl SessionTask {
    fn new(
        store: SharedStore,
        world: WorldPath,
        identity: SessionIdentity,
        config: SyncConfig,
        snapshot_tx: watch::Sender<SessionSnapshot>,
    ) -> Self {
        let can_write = identity.session_id.is_some() && !config.read_only;
        let owns_world = identity.owns(&world);
        let writer = ChannelWriter::new(
            store.clone(),
            world.clone(),
            identity.session_id.clone(),
            config.write_mode,
            config.read_only,
        );
        let merger = CanonicalMerger::new(
            store.clone(),
            world.clone(),
            config.write_mode,
            config.read_only,
        );

        Self {
            settings: RecordSync::new(world.settings()),
            clipboard: RecordSync::new(world.clipboard()),
            machine: WorldMachine::new(config.max_history_states),
            store,
            world,
            config,
            can_write,
            owns_world,
            writer,
            merger,
            records_saving: false,
            records_failed: false,
            save_at: None,
            history_at: None,
            records_at: None,
            load_deadline: None,
            snapshot_tx,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        log::info!("Session for {} starting ({:?} mode)", self.world, self.config.write_mode);
        self.machine.start_loading();
        self.publish();

        let mut canonical = self.open(&self.world.canonical()).await;
        let mut settings = self.open(&self.world.settings()).await;
        let mut clipboard = self.open(&self.world.clipboard()).await;
        self.load_deadline = Some(Instant::now() + self.config.initial_load_timeout);

        let mut merge_tick = self.merge_ticker();
        let mut disconnected = None;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Disconnect(done)) => {
                        disconnected = Some(done);
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                snapshot = next_snapshot(&mut canonical) => self.on_canonical(snapshot),
                snapshot = next_snapshot(&mut settings) => {
                    self.settings.on_snapshot(snapshot);
                }
                snapshot = next_snapshot(&mut clipboard) => {
                    self.clipboard.on_snapshot(snapshot);
                }
                _ = sleep_until_opt(self.save_at) => {
                    self.save_at = None;
                    let _ = self.save_world().await;
                }
                _ = sleep_until_opt(self.history_at) => {
                    self.history_at = None;
                    if self.machine.record_history() {
                        log::trace!("History frame recorded for {}", self.world);
                    }
                }
                _ = sleep_until_opt(self.records_at) => {
                    self.records_at = None;
                    let _ = self.save_records().await;
                }
                _ = sleep_until_opt(self.load_deadline) => {
                    self.load_deadline = None;
                    if self.machine.on_load_timeout() {
                        log::warn!(
                            "No snapshot for {} within {:?}, starting from an empty world",
                            self.world,
                            self.config.initial_load_timeout
                        );
                    }
                }
                _ = tick_opt(&mut merge_tick) => self.merge().await,
            }
            self.publish();
        }

        drop((canonical, settings, clipboard));
        log::info!("Session for {} stopped", self.world);
        if let Some(done) = disconnected {
            let _ = done.send(());
        }
    }

    async fn open(&mut self, path: &str) -> Option<Subscription> {
        match self.store.subscribe(path).await {
            Ok(sub) => Some(sub),
            Err(e) => {
                log::error!("Failed to subscribe to {path}: {e}");
                self.machine.set_error(Some(e.to_string()));
                None
            }
        }
    }

    /// Only the owner may write canonical, so only its session merges.
    fn merge_ticker(&self) -> Option<Interval> {
        let enabled = self.config.run_merger
            && self.can_write
            && self.owns_world
            && self.config.write_mode == WriteMode::Channelled;
        enabled.then(|| {
            let mut ticker = tokio::time::interval(self.config.merge_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        })
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Edit(edit) => {
                if self.machine.apply_edit(edit) {
                    self.schedule_save();
                    self.history_at = Some(Instant::now() + self.config.save_debounce);
                }
            }
            Command::Undo => {
                if self.machine.undo() {
                    self.schedule_save();
                }
            }
            Command::Redo => {
                if self.machine.redo() {
                    self.schedule_save();
                }
            }
            Command::SetSettings(settings) => {
                if self.settings.set(settings) {
                    self.schedule_records();
                }
            }
            Command::SetClipboard(clipboard) => {
                if self.clipboard.set(clipboard) {
                    self.schedule_records();
                }
            }
            Command::ClearWorld(reply) => {
                let _ = reply.send(self.clear_world().await);
            }
            Command::Flush(reply) => {
                self.save_at = None;
                self.records_at = None;
                let world = self.save_world().await;
                let records = self.save_records().await;
                let _ = reply.send(world.and(records));
            }
            Command::Disconnect(_) => {}
        }
    }

    fn on_canonical(&mut self, snapshot: Snapshot) {
        let incoming = WorldState::from_snapshot(snapshot);
        match self.machine.on_canonical(incoming) {
            Reconciled::Initial => {
                self.load_deadline = None;
                log::info!("Loaded {} ({} cells)", self.world, self.machine.state().len());
            }
            Reconciled::Adopted => {}
            Reconciled::Rebased { pending } => {
                log::debug!("Rebased {pending} pending paths onto remote {}", self.world);
            }
        }
        if self.machine.wants_save() && self.save_at.is_none() {
            self.schedule_save();
        }
    }

    fn schedule_save(&mut self) {
        self.save_at = Some(Instant::now() + self.config.save_debounce);
    }

    fn schedule_records(&mut self) {
        if self.can_write {
            self.records_at = Some(Instant::now() + self.config.save_debounce);
        }
    }

    async fn save_world(&mut self) -> Result<(), SyncError> {
        if !self.machine.wants_save() {
            return Ok(());
        }
        self.machine.begin_save();
        self.publish();

        let result = self.writer.flush(self.machine.tracker()).await;
        let surfaced = match &result {
            Err(e) if !e.is_permission_denied() => Err(e.clone()),
            _ => Ok(()),
        };

        if self.machine.finish_save(result) == SaveFollowUp::Retry && self.save_at.is_none() {
            let delay = if surfaced.is_err() {
                self.config.write_retry_delay
            } else {
                self.config.save_debounce
            };
            self.save_at = Some(Instant::now() + delay);
        }
        surfaced
    }

    async fn save_records(&mut self) -> Result<(), SyncError> {
        if !self.can_write || !(self.settings.has_pending() || self.clipboard.has_pending()) {
            return Ok(());
        }
        self.records_saving = true;
        self.publish();

        let settings = self.settings.flush(&self.store).await;
        let clipboard = self.clipboard.flush(&self.store).await;
        self.records_saving = false;

        match settings.and(clipboard) {
            Ok(_) => {
                if self.records_failed {
                    self.records_failed = false;
                    self.machine.set_error(None);
                }
                Ok(())
            }
            Err(e) => {
                log::warn!("Record write for {} failed: {e}", self.world);
                self.records_failed = true;
                self.machine.set_error(Some(e.to_string()));
                self.records_at = Some(Instant::now() + self.config.write_retry_delay);
                Err(e)
            }
        }
    }

    async fn clear_world(&mut self) -> Result<(), SyncError> {
        if !self.can_write {
            log::debug!("Ignoring clear of {} from a read-only session", self.world);
            return Ok(());
        }

        let mut writes = BTreeMap::new();
        writes.insert(self.world.canonical(), Value::Null);
        writes.insert(self.world.users(), Value::Null);
        writes.insert(self.world.clipboard(), Value::Null);

        match self.store.update(writes).await {
            Ok(()) => {
                log::info!("Cleared {}", self.world);
                self.machine.cleared();
                self.clipboard.reset();
                self.save_at = None;
                self.history_at = Some(Instant::now() + self.config.save_debounce);
                Ok(())
            }
            Err(e) if e.is_permission_denied() => {
                log::debug!("Clear of {} denied", self.world);
                Ok(())
            }
            Err(e) => {
                self.machine.set_error(Some(e.to_string()));
                Err(e.into())
            }
        }
    }

    async fn merge(&mut self) {
        match self.merger.merge_once().await {
            Ok(MergeOutcome::Merged { cells, cleaned }) => {
                log::trace!("Merge for {}: {cells} cells, {cleaned} cleaned", self.world);
            }
            Ok(_) => {}
            Err(e) => log::warn!("Merge for {} failed, retrying next interval: {e}", self.world),
        }
    }

    fn publish(&self) {
        let snapshot = SessionSnapshot {
            status: self.machine.status(),
            world: self.machine.state().clone(),
            settings: self.settings.current().clone(),
            clipboard: self.clipboard.current().clone(),
            error: self.machine.error().map(str::to_string),
            can_undo: self.machine.can_undo(),
            can_redo: self.machine.can_redo(),
            records_saving: self.records_saving,
        };
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

async fn next_snapshot(sub: &mut Option<Subscription>) -> Snapshot {
    match sub {
        Some(s) => match s.next().await {
            Some(snapshot) => snapshot,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}
