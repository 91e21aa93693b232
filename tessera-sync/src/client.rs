//! WebSocket client for [`crate::server::StoreServer`].
//!
//! [`RemoteStore`] implements [`RealtimeStore`], so a world session runs
//! unchanged against a remote server. A writer task drains outgoing
//! frames into the socket; a reader task routes responses to waiting
//! requests by id and pushed snapshots to their subscriptions.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{GuardedUpdate, Hello, MessageType, StoreMessage};
use crate::store::{Auth, RealtimeStore, Snapshot, StoreError, StoreResult, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// How long a request waits for its response
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
        }
    }
}

enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

/// State shared with the reader task.
struct Shared {
    state: RwLock<ConnectionState>,
    pending: Mutex<HashMap<u64, oneshot::Sender<StoreMessage>>>,
    subscriptions: Mutex<HashMap<u64, mpsc::UnboundedSender<Snapshot>>>,
}

#[derive(Clone)]
pub struct RemoteStore {
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    next_id: Arc<AtomicU64>,
    auth: Auth,
    config: ClientConfig,
}

impl RemoteStore {
    /// Connect and identify as `auth`.
    pub async fn connect(url: &str, auth: Auth, config: ClientConfig) -> StoreResult<Self> {
        let shared = Arc::new(Shared {
            state: RwLock::new(ConnectionState::Connecting),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
        });

        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            log::warn!("Connecting to {url} failed: {e}");
            StoreError::Disconnected
        })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
        tokio::spawn(async move {
            while let Some(outgoing) = out_rx.recv().await {
                let sent = match outgoing {
                    Outgoing::Frame(bytes) => ws_writer.send(Message::Binary(bytes.into())).await,
                    Outgoing::Close => break,
                };
                if sent.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let reader_shared = shared.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match StoreMessage::decode(&bytes) {
                            Ok(frame) => route(&reader_shared, frame).await,
                            Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *reader_shared.state.write().await = ConnectionState::Disconnected;
            // Dropping the senders fails waiting requests and ends subscriptions.
            reader_shared.pending.lock().await.clear();
            reader_shared.subscriptions.lock().await.clear();
            log::info!("Store connection closed");
        });

        let store = Self {
            shared,
            outgoing: out_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            auth,
            config,
        };

        let hello = Hello::new(store.auth.clone());
        let reply = store.request(StoreMessage::hello(&hello)?).await?;
        expect_ack(reply)?;
        *store.shared.state.write().await = ConnectionState::Connected;
        log::info!("Connected to {url} as {:?} (client {})", store.auth, hello.client_id);
        Ok(store)
    }

    pub fn auth(&self) -> &Auth {
        &self.auth
    }

    pub async fn state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Round-trip a ping.
    pub async fn ping(&self) -> StoreResult<()> {
        let reply = self.request(StoreMessage::ping(self.next_id())).await?;
        match reply.msg_type {
            MessageType::Pong => Ok(()),
            other => Err(StoreError::Protocol(format!("expected Pong, got {other:?}"))),
        }
    }

    /// Close the socket. In-flight requests fail with `Disconnected`.
    pub fn disconnect(&self) {
        let _ = self.outgoing.send(Outgoing::Close);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, frame: &StoreMessage) -> StoreResult<()> {
        let bytes = frame.encode()?;
        self.outgoing
            .send(Outgoing::Frame(bytes))
            .map_err(|_| StoreError::Disconnected)
    }

    async fn request(&self, frame: StoreMessage) -> StoreResult<StoreMessage> {
        if *self.shared.state.read().await == ConnectionState::Disconnected {
            return Err(StoreError::Disconnected);
        }
        let id = frame.request_id;
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);

        if let Err(e) = self.send(&frame) {
            self.shared.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(StoreError::Disconnected),
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                log::warn!("{:?} request {id} timed out", frame.msg_type);
                Err(StoreError::Timeout)
            }
        }
    }
}

async fn route(shared: &Shared, frame: StoreMessage) {
    let id = frame.request_id;
    match frame.msg_type {
        MessageType::Snapshot => {
            let snapshot = match frame.snapshot_payload() {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    log::warn!("Bad snapshot for subscription {id}: {e}");
                    return;
                }
            };
            let mut subscriptions = shared.subscriptions.lock().await;
            if let Some(tx) = subscriptions.get(&id) {
                if tx.send(snapshot).is_err() {
                    subscriptions.remove(&id);
                }
            }
        }
        MessageType::Ack | MessageType::Value | MessageType::Error | MessageType::Pong => {
            if let Some(waiter) = shared.pending.lock().await.remove(&id) {
                let _ = waiter.send(frame);
            } else if frame.msg_type == MessageType::Error {
                // A failed subscription; ending it tells the subscriber.
                if shared.subscriptions.lock().await.remove(&id).is_some() {
                    log::warn!("Subscription {id} rejected: {:?}", frame.error_payload());
                }
            } else {
                log::debug!("Late {:?} for request {id}", frame.msg_type);
            }
        }
        other => log::debug!("Ignoring {other:?} from server"),
    }
}

fn expect_ack(reply: StoreMessage) -> StoreResult<()> {
    match reply.msg_type {
        MessageType::Ack => Ok(()),
        MessageType::Error => Err(reply.error_payload()?),
        other => Err(StoreError::Protocol(format!("expected Ack, got {other:?}"))),
    }
}

#[async_trait]
impl RealtimeStore for RemoteStore {
    async fn subscribe(&self, path: &str) -> StoreResult<Subscription> {
        if *self.shared.state.read().await == ConnectionState::Disconnected {
            return Err(StoreError::Disconnected);
        }
        let id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subscriptions.lock().await.insert(id, tx);
        if let Err(e) = self.send(&StoreMessage::subscribe(id, path)) {
            self.shared.subscriptions.lock().await.remove(&id);
            return Err(e);
        }

        let outgoing = self.outgoing.clone();
        Ok(Subscription::with_cancel(path, rx, move || {
            if let Ok(bytes) = StoreMessage::unsubscribe(id).encode() {
                let _ = outgoing.send(Outgoing::Frame(bytes));
            }
        }))
    }

    async fn get(&self, path: &str) -> StoreResult<Snapshot> {
        let reply = self.request(StoreMessage::get(self.next_id(), path)).await?;
        match reply.msg_type {
            MessageType::Value => Ok(reply.snapshot_payload()?),
            MessageType::Error => Err(reply.error_payload()?),
            other => Err(StoreError::Protocol(format!("expected Value, got {other:?}"))),
        }
    }

    async fn set(&self, path: &str, value: Value) -> StoreResult<()> {
        let frame = StoreMessage::set(self.next_id(), path, &value)?;
        expect_ack(self.request(frame).await?)
    }

    async fn update(&self, values: BTreeMap<String, Value>) -> StoreResult<()> {
        let frame = StoreMessage::update(self.next_id(), &values)?;
        expect_ack(self.request(frame).await?)
    }

    async fn update_if(
        &self,
        expected: BTreeMap<String, Snapshot>,
        values: BTreeMap<String, Value>,
    ) -> StoreResult<bool> {
        let frame = StoreMessage::update_if(self.next_id(), &GuardedUpdate { expected, values })?;
        let reply = self.request(frame).await?;
        match reply.msg_type {
            MessageType::Value => match reply.snapshot_payload()? {
                Some(Value::Bool(applied)) => Ok(applied),
                other => Err(StoreError::Protocol(format!("expected a boolean, got {other:?}"))),
            },
            MessageType::Error => Err(reply.error_payload()?),
            other => Err(StoreError::Protocol(format!("expected Value, got {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        assert_eq!(ClientConfig::default().request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_expect_ack() {
        assert_eq!(expect_ack(StoreMessage::ack(1)), Ok(()));
        let denied = StoreError::PermissionDenied { path: "world/a/w".into() };
        assert_eq!(expect_ack(StoreMessage::error(1, &denied).unwrap()), Err(denied));
        assert!(matches!(
            expect_ack(StoreMessage::pong(1)),
            Err(StoreError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_route_delivers_to_waiter_and_subscription() {
        let shared = Shared {
            state: RwLock::new(ConnectionState::Connected),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        shared.pending.lock().await.insert(4, reply_tx);
        let (snap_tx, mut snap_rx) = mpsc::unbounded_channel();
        shared.subscriptions.lock().await.insert(9, snap_tx);

        route(&shared, StoreMessage::ack(4)).await;
        assert_eq!(reply_rx.await.unwrap().msg_type, MessageType::Ack);

        let frame = StoreMessage::snapshot(9, "p", &Some(Value::from(3))).unwrap();
        route(&shared, frame).await;
        assert_eq!(snap_rx.recv().await, Some(Some(Value::from(3))));

        drop(snap_rx);
        route(&shared, StoreMessage::snapshot(9, "p", &None).unwrap()).await;
        assert!(shared.subscriptions.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let result = RemoteStore::connect("ws://127.0.0.1:1", Auth::Anonymous, ClientConfig::default()).await;
        assert_eq!(result.err(), Some(StoreError::Disconnected));
    }
}
