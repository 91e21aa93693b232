//! WebSocket store server.
//!
//! ```text
//! RemoteStore A ──┐                          ┌── persister ──► SnapshotStore (RocksDB)
//!                 ├── connection ── MemoryStore ── ChangeFeed
//! RemoteStore B ──┘    (Auth)          │          └── merge sweep (optional)
//!                                      └── watchers ──► Snapshot frames
//! ```
//!
//! Every connection writes as the identity announced in its `Hello` frame
//! and is checked against the same access rules as in-process clients.
//! The persister saves each world whose subtree changed since the last
//! interval; on startup every saved world is restored before the listener
//! accepts connections.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::Value;
use tessera_core::paths::WORLD_ROOT;
use tessera_core::WorldPath;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;

use crate::config::{parse_logged, WriteMode};
use crate::merger::{CanonicalMerger, MergeOutcome};
use crate::protocol::{GuardedUpdate, Hello, MessageType, ProtocolError, StoreMessage};
use crate::storage::{PersistConfig, PersistError, SnapshotStore};
use crate::store::{Auth, MemoryStore, Snapshot, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Change-feed buffer per watcher
    pub broadcast_capacity: usize,
    /// Snapshot directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// How often changed worlds are saved
    pub persist_interval: Duration,
    /// Run a server-side canonical merge at this period (None = clients merge)
    pub merge_interval: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 1024,
            storage_path: None,
            persist_interval: Duration::from_secs(1),
            merge_interval: None,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port and short timers.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 256,
            storage_path: None,
            persist_interval: Duration::from_millis(50),
            merge_interval: None,
        }
    }

    /// Defaults overridden by `TESSERA_BIND`, `TESSERA_STORAGE_PATH`,
    /// `TESSERA_BROADCAST_CAPACITY`, `TESSERA_PERSIST_INTERVAL_MS` and
    /// `TESSERA_SERVER_MERGE_MS` (0 disables the server-side merge).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(bind) = lookup("TESSERA_BIND") {
            config.bind_addr = bind;
        }
        if let Some(path) = lookup("TESSERA_STORAGE_PATH").filter(|p| !p.trim().is_empty()) {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Some(cap) = lookup("TESSERA_BROADCAST_CAPACITY")
            .and_then(|v| parse_logged::<usize>("TESSERA_BROADCAST_CAPACITY", &v))
        {
            config.broadcast_capacity = cap.max(1);
        }
        if let Some(ms) = lookup("TESSERA_PERSIST_INTERVAL_MS")
            .and_then(|v| parse_logged::<u64>("TESSERA_PERSIST_INTERVAL_MS", &v))
        {
            config.persist_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = lookup("TESSERA_SERVER_MERGE_MS")
            .and_then(|v| parse_logged::<u64>("TESSERA_SERVER_MERGE_MS", &v))
        {
            config.merge_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }
        config
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_subscriptions: u64,
    pub persisted_worlds: u64,
    pub merges: u64,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

type Stats = Arc<RwLock<ServerStats>>;

pub struct StoreServer {
    config: ServerConfig,
    store: MemoryStore,
    snapshots: Option<Arc<SnapshotStore>>,
    stats: Stats,
}

impl StoreServer {
    /// Create the server, opening snapshot storage if configured.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let snapshots = match &config.storage_path {
            Some(path) => {
                let persist = PersistConfig {
                    path: path.clone(),
                    ..PersistConfig::default()
                };
                Some(Arc::new(SnapshotStore::open(persist)?))
            }
            None => None,
        };
        Ok(Self {
            store: MemoryStore::with_capacity(config.broadcast_capacity),
            config,
            snapshots,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The backing store; in-process clients may connect to it directly.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Load every saved world into the store.
    pub async fn recover(&self) -> Result<usize, ServerError> {
        let Some(snapshots) = &self.snapshots else {
            return Ok(0);
        };

        let roots = snapshots.list_worlds()?;
        let mut recovered = 0;
        for root in &roots {
            match snapshots.load_world(root) {
                Ok(world) => {
                    self.store.restore(root, world).await?;
                    recovered += 1;
                    log::debug!("Recovered world {root}");
                }
                Err(e) => log::error!("Failed to recover world {root}: {e}"),
            }
        }
        log::info!("Recovery complete: {recovered}/{} worlds restored", roots.len());
        Ok(recovered)
    }

    /// Recover, bind and start serving in the background.
    pub async fn start(self) -> Result<RunningServer, ServerError> {
        self.recover().await?;

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Store server listening on {local_addr}");

        let mut tasks = Vec::new();
        if let Some(snapshots) = &self.snapshots {
            tasks.push(spawn_persister(
                self.store.clone(),
                snapshots.clone(),
                self.config.persist_interval,
                self.stats.clone(),
            ));
        }
        if let Some(interval) = self.config.merge_interval {
            tasks.push(spawn_merge_sweep(self.store.clone(), interval, self.stats.clone()));
        }

        let store = self.store.clone();
        let stats = self.stats.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::error!("Accept failed: {e}");
                        continue;
                    }
                };
                log::debug!("New TCP connection from {addr}");

                let store = store.clone();
                let stats = stats.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, addr, store, stats).await {
                        log::error!("Connection error from {addr}: {e}");
                    }
                });
            }
        }));

        Ok(RunningServer {
            local_addr,
            server: self,
            tasks,
        })
    }

    /// Run until the process is stopped.
    pub async fn run(self) -> Result<(), ServerError> {
        let running = self.start().await?;
        tokio::signal::ctrl_c().await?;
        log::info!("Shutting down");
        running.shutdown().await
    }

    /// Save every world now.
    pub async fn persist_all(&self) -> Result<usize, ServerError> {
        let Some(snapshots) = &self.snapshots else {
            return Ok(0);
        };
        let mut roots: BTreeSet<String> = live_worlds(&self.store).await.into_iter().collect();
        roots.extend(snapshots.list_worlds()?);
        let saved = persist_worlds(&self.store, snapshots, roots).await?;
        snapshots.sync()?;
        Ok(saved)
    }
}

/// A started server. Dropping it leaves the tasks running; call
/// [`RunningServer::shutdown`] to stop them and save.
pub struct RunningServer {
    local_addr: SocketAddr,
    server: StoreServer,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL clients connect to.
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn store(&self) -> &MemoryStore {
        self.server.store()
    }

    pub async fn stats(&self) -> ServerStats {
        self.server.stats().await
    }

    /// Stop accepting, stop background tasks and save every world.
    pub async fn shutdown(self) -> Result<(), ServerError> {
        for task in self.tasks {
            task.abort();
            // Wait for the abort so nothing still holds the database.
            let _ = task.await;
        }
        let saved = self.server.persist_all().await?;
        if saved > 0 {
            log::info!("Saved {saved} worlds on shutdown");
        }
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    store: MemoryStore,
    stats: Stats,
) -> Result<(), ServerError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let (outgoing, mut pushed) = mpsc::unbounded_channel();
    let mut conn = Connection {
        store,
        stats: stats.clone(),
        auth: Auth::Anonymous,
        subscriptions: HashMap::new(),
        outgoing,
    };

    let result = loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    {
                        let mut s = stats.write().await;
                        s.total_messages += 1;
                        s.total_bytes += bytes.len() as u64;
                    }
                    let request = match StoreMessage::decode(&bytes) {
                        Ok(request) => request,
                        Err(e) => {
                            log::warn!("Failed to decode message from {addr}: {e}");
                            continue;
                        }
                    };
                    let reply = match conn.handle(request).await {
                        Ok(reply) => reply,
                        Err(e) => break Err(e.into()),
                    };
                    if let Some(reply) = reply {
                        if let Err(e) = send(&mut ws_sender, &reply).await {
                            break Err(e);
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("Connection closed from {addr}");
                    break Ok(());
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                        break Err(e.into());
                    }
                }
                Some(Err(e)) => {
                    log::error!("WebSocket error from {addr}: {e}");
                    break Ok(());
                }
                _ => {}
            },
            Some(frame) = pushed.recv() => {
                if let Err(e) = send(&mut ws_sender, &frame).await {
                    break Err(e);
                }
            }
        }
    };

    let open = conn.close();
    {
        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_subscriptions = s.active_subscriptions.saturating_sub(open);
    }
    log::debug!("{addr} ({:?}) disconnected", conn.auth);
    result
}

async fn send<S>(sink: &mut S, msg: &StoreMessage) -> Result<(), ServerError>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    sink.send(Message::Binary(msg.encode()?.into())).await?;
    Ok(())
}

/// Per-connection request state.
struct Connection {
    store: MemoryStore,
    stats: Stats,
    auth: Auth,
    /// Subscription id → forwarding task
    subscriptions: HashMap<u64, JoinHandle<()>>,
    /// Pushed snapshot frames, drained by the connection loop
    outgoing: mpsc::UnboundedSender<StoreMessage>,
}

impl Connection {
    async fn handle(&mut self, request: StoreMessage) -> Result<Option<StoreMessage>, ProtocolError> {
        let id = request.request_id;
        let reply = match request.msg_type {
            MessageType::Hello => {
                let hello: Hello = match request.json() {
                    Ok(hello) => hello,
                    Err(e) => return StoreMessage::error(id, &StoreError::from(e)).map(Some),
                };
                self.auth = match hello.auth {
                    // Service access is only for in-process callers
                    Auth::Service => {
                        log::warn!("Client {} asked for service access; treating as anonymous", hello.client_id);
                        Auth::Anonymous
                    }
                    auth => auth,
                };
                log::info!("Client {} identified as {:?}", hello.client_id, self.auth);
                StoreMessage::ack(id)
            }
            MessageType::Get => {
                let snapshot = self.store.snapshot(&request.path).await;
                StoreMessage::value(id, &request.path, &snapshot)?
            }
            MessageType::Set => {
                let result = match request.json::<Value>() {
                    Ok(value) => self.store.set_as(&self.auth, &request.path, value).await,
                    Err(e) => Err(e.into()),
                };
                ack_or_error(id, result)?
            }
            MessageType::Update => {
                let result = match request.json::<BTreeMap<String, Value>>() {
                    Ok(values) => self.store.update_as(&self.auth, values).await,
                    Err(e) => Err(e.into()),
                };
                ack_or_error(id, result)?
            }
            MessageType::UpdateIf => {
                let result = match request.json::<GuardedUpdate>() {
                    Ok(update) => {
                        self.store
                            .update_if_as(&self.auth, update.expected, update.values)
                            .await
                    }
                    Err(e) => Err(e.into()),
                };
                match result {
                    Ok(written) => StoreMessage::value(id, "", &Some(Value::Bool(written.is_some())))?,
                    Err(e) => StoreMessage::error(id, &e)?,
                }
            }
            MessageType::Subscribe => {
                self.subscribe(id, &request.path).await;
                return Ok(None);
            }
            MessageType::Unsubscribe => {
                if let Some(task) = self.subscriptions.remove(&id) {
                    task.abort();
                    let mut s = self.stats.write().await;
                    s.active_subscriptions = s.active_subscriptions.saturating_sub(1);
                }
                return Ok(None);
            }
            MessageType::Ping => StoreMessage::pong(id),
            other => {
                let err = StoreError::Protocol(format!("unexpected {other:?} from client"));
                StoreMessage::error(id, &err)?
            }
        };
        Ok(Some(reply))
    }

    async fn subscribe(&mut self, id: u64, path: &str) {
        let mut watcher = self.store.watch(path);
        let tx = self.outgoing.clone();
        let path = watcher.path().to_string();
        let task = tokio::spawn(async move {
            while let Some(snapshot) = watcher.next().await {
                match StoreMessage::snapshot(id, &path, &snapshot) {
                    Ok(frame) => {
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Dropping snapshot of {path}: {e}"),
                }
            }
        });
        match self.subscriptions.insert(id, task) {
            Some(previous) => previous.abort(),
            None => self.stats.write().await.active_subscriptions += 1,
        }
    }

    /// Stop every forwarder. Returns how many were open.
    fn close(&mut self) -> u64 {
        let open = self.subscriptions.len() as u64;
        for (_, task) in self.subscriptions.drain() {
            task.abort();
        }
        open
    }
}

fn ack_or_error<T>(id: u64, result: Result<T, StoreError>) -> Result<StoreMessage, ProtocolError> {
    match result {
        Ok(_) => Ok(StoreMessage::ack(id)),
        Err(e) => StoreMessage::error(id, &e),
    }
}

/// Roots of every world currently holding data.
async fn live_worlds(store: &MemoryStore) -> Vec<String> {
    let Some(Value::Object(owners)) = store.snapshot(WORLD_ROOT).await else {
        return Vec::new();
    };
    let mut roots = Vec::new();
    for (owner, worlds) in &owners {
        let Some(worlds) = worlds.as_object() else {
            continue;
        };
        for world in worlds.keys() {
            if let Ok(path) = WorldPath::new(owner.as_str(), world.as_str()) {
                roots.push(path.root());
            }
        }
    }
    roots
}

/// Worlds touched by a change batch. `None` when a write above world level
/// may have touched any of them.
fn touched_worlds(paths: &[String]) -> Option<BTreeSet<WorldPath>> {
    let mut worlds = BTreeSet::new();
    for path in paths {
        match WorldPath::containing(path) {
            Some(world) => {
                worlds.insert(world);
            }
            None if path.split('/').next() == Some(WORLD_ROOT) || path.is_empty() => return None,
            None => {}
        }
    }
    Some(worlds)
}

async fn persist_worlds(
    store: &MemoryStore,
    snapshots: &Arc<SnapshotStore>,
    roots: impl IntoIterator<Item = String>,
) -> Result<usize, ServerError> {
    let mut batch: Vec<(String, Snapshot)> = Vec::new();
    for root in roots {
        let snapshot = store.snapshot(&root).await;
        batch.push((root, snapshot));
    }

    let snapshots = snapshots.clone();
    let saved = tokio::task::spawn_blocking(move || -> Result<usize, PersistError> {
        let mut saved = 0;
        for (root, snapshot) in &batch {
            match snapshot {
                Some(world) => {
                    snapshots.save_world(root, world)?;
                }
                None => snapshots.delete_world(root)?,
            }
            saved += 1;
        }
        Ok(saved)
    })
    .await
    .map_err(|e| PersistError::Database(e.to_string()))??;
    Ok(saved)
}

fn spawn_persister(
    store: MemoryStore,
    snapshots: Arc<SnapshotStore>,
    interval: Duration,
    stats: Stats,
) -> JoinHandle<()> {
    let mut changes = store.feed().subscribe();
    tokio::spawn(async move {
        let mut dirty: BTreeSet<String> = BTreeSet::new();
        let mut everything = false;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                batch = changes.recv() => match batch {
                    Ok(paths) => match touched_worlds(&paths) {
                        Some(worlds) => dirty.extend(worlds.iter().map(WorldPath::root)),
                        None => everything = true,
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        store.feed().record_lag(skipped);
                        everything = true;
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    if everything {
                        dirty.extend(live_worlds(&store).await);
                        match snapshots.list_worlds() {
                            Ok(saved) => dirty.extend(saved),
                            Err(e) => log::error!("Failed to list saved worlds: {e}"),
                        }
                        everything = false;
                    }
                    if dirty.is_empty() {
                        continue;
                    }
                    let roots = std::mem::take(&mut dirty);
                    let count = roots.len();
                    match persist_worlds(&store, &snapshots, roots.clone()).await {
                        Ok(saved) => {
                            stats.write().await.persisted_worlds += saved as u64;
                            log::debug!("Persisted {saved}/{count} worlds");
                        }
                        Err(e) => {
                            log::error!("Persisting {count} worlds failed: {e}");
                            dirty.extend(roots);
                        }
                    }
                }
            }
        }
    })
}

fn spawn_merge_sweep(store: MemoryStore, interval: Duration, stats: Stats) -> JoinHandle<()> {
    let mut changes = store.feed().subscribe();
    tokio::spawn(async move {
        let admin = store.admin().into_shared();
        let mut dirty: BTreeSet<WorldPath> = BTreeSet::new();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                batch = changes.recv() => match batch {
                    Ok(paths) => {
                        // Only channel writes can change the merge result
                        for path in paths.iter() {
                            if let Some(world) = WorldPath::containing(path) {
                                let users = world.users();
                                if path.starts_with(&users) || *path == world.root() {
                                    dirty.insert(world);
                                }
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        store.feed().record_lag(skipped);
                        for root in live_worlds(&store).await {
                            if let Some(world) = WorldPath::containing(&root) {
                                dirty.insert(world);
                            }
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    for world in std::mem::take(&mut dirty) {
                        let merger = CanonicalMerger::new(admin.clone(), world.clone(), WriteMode::Channelled, false);
                        match merger.merge_once().await {
                            Ok(MergeOutcome::Merged { cells, cleaned }) => {
                                stats.write().await.merges += 1;
                                log::debug!("Merged {cells} cells into {world} ({cleaned} entries cleaned)");
                            }
                            Ok(_) => {}
                            Err(e) => {
                                log::warn!("Server merge of {world} failed: {e}");
                                dirty.insert(world);
                            }
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RealtimeStore;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 1024);
        assert!(config.storage_path.is_none());
        assert!(config.merge_interval.is_none());
    }

    #[test]
    fn test_server_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("TESSERA_BIND", "0.0.0.0:7000"),
            ("TESSERA_STORAGE_PATH", "/tmp/tessera"),
            ("TESSERA_PERSIST_INTERVAL_MS", "250"),
            ("TESSERA_SERVER_MERGE_MS", "100"),
            ("TESSERA_BROADCAST_CAPACITY", "lots"),
        ]
        .into_iter()
        .collect();
        let config = ServerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.storage_path, Some(PathBuf::from("/tmp/tessera")));
        assert_eq!(config.persist_interval, Duration::from_millis(250));
        assert_eq!(config.merge_interval, Some(Duration::from_millis(100)));
        assert_eq!(config.broadcast_capacity, 1024);
    }

    #[test]
    fn test_touched_worlds() {
        let paths = vec![
            "world/a/w/data/1,1".to_string(),
            "world/a/w/users/s/data/1,1".to_string(),
            "world/b/x/settings".to_string(),
            "elsewhere/k".to_string(),
        ];
        let worlds = touched_worlds(&paths).unwrap();
        assert_eq!(worlds.len(), 2);
        assert!(touched_worlds(&["world/a".to_string()]).is_none());
    }

    #[tokio::test]
    async fn test_live_worlds() {
        let server = StoreServer::new(ServerConfig::for_testing()).unwrap();
        let admin = server.store().admin();
        admin.set("world/a/w1/data/k", Value::from(1)).await.unwrap();
        admin.set("world/b/w2/settings", serde_json::json!({"fontSize": 3})).await.unwrap();
        let mut roots = live_worlds(server.store()).await;
        roots.sort();
        assert_eq!(roots, vec!["world/a/w1", "world/b/w2"]);
    }

    #[tokio::test]
    async fn test_recovery_without_storage() {
        let server = StoreServer::new(ServerConfig::for_testing()).unwrap();
        assert_eq!(server.recover().await.unwrap(), 0);
        assert_eq!(server.persist_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recovery_from_storage() {
        let dir = tempfile::tempdir().unwrap();
        {
            let snapshots = SnapshotStore::open(PersistConfig::for_testing(dir.path())).unwrap();
            snapshots
                .save_world("world/a/w", &serde_json::json!({"data": {"0,0": "A"}}))
                .unwrap();
        }
        let config = ServerConfig {
            storage_path: Some(dir.path().to_path_buf()),
            ..ServerConfig::for_testing()
        };
        let server = StoreServer::new(config).unwrap();
        assert_eq!(server.recover().await.unwrap(), 1);
        assert_eq!(
            server.store().snapshot("world/a/w/data/0,0").await,
            Some(Value::from("A"))
        );
    }

    #[tokio::test]
    async fn test_start_reports_bound_address() {
        let running = StoreServer::new(ServerConfig::for_testing())
            .unwrap()
            .start()
            .await
            .unwrap();
        assert_ne!(running.local_addr().port(), 0);
        assert!(running.url().starts_with("ws://127.0.0.1:"));
        assert_eq!(running.stats().await, ServerStats::default());
        running.shutdown().await.unwrap();
    }
}
