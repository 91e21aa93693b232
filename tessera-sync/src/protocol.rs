//! Binary wire protocol between [`crate::client::RemoteStore`] and
//! [`crate::server::StoreServer`].
//!
//! Frame (bincode-encoded, one per WebSocket binary message):
//! ```text
//! ┌──────────┬────────────┬──────────┬──────────────────────┐
//! │ msg_type │ request_id │ path     │ payload              │
//! │ 1 byte   │ varint     │ string   │ JSON bytes           │
//! └──────────┴────────────┴──────────┴──────────────────────┘
//! ```
//!
//! Requests carry a client-chosen `request_id`; the response (`Ack`,
//! `Value` or `Error`) echoes it. For `Subscribe` the id names the
//! subscription and every `Snapshot` pushed for it carries the same id.
//! `UpdateIf` is answered with a `Value` holding `true` if it was applied.
//! Payloads are JSON because tree values are self-describing and bincode
//! cannot decode them.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::store::{Auth, Snapshot, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client identity; first frame on a connection
    Hello = 1,
    Get = 2,
    Set = 3,
    /// Atomic multi-path write
    Update = 4,
    Subscribe = 5,
    Unsubscribe = 6,
    Ping = 7,
    /// Write accepted
    Ack = 8,
    /// Response to Get
    Value = 9,
    /// Pushed subtree for a subscription
    Snapshot = 10,
    Error = 11,
    Pong = 12,
    /// Atomic multi-path write guarded by expected snapshots
    UpdateIf = 13,
}

/// Payload of a `Hello` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub client_id: Uuid,
    pub auth: Auth,
}

impl Hello {
    pub fn new(auth: Auth) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            auth,
        }
    }
}

/// Payload of an `UpdateIf` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardedUpdate {
    pub expected: BTreeMap<String, Snapshot>,
    pub values: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("unexpected message type {0:?}")]
    UnexpectedType(MessageType),
}

impl From<ProtocolError> for StoreError {
    fn from(e: ProtocolError) -> Self {
        StoreError::Protocol(e.to_string())
    }
}

/// One frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMessage {
    pub msg_type: MessageType,
    pub request_id: u64,
    pub path: String,
    pub payload: Vec<u8>,
}

impl StoreMessage {
    pub fn new(msg_type: MessageType, request_id: u64, path: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            request_id,
            path: path.into(),
            payload,
        }
    }

    pub fn hello(hello: &Hello) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Hello, 0, "", to_json(hello)?))
    }

    pub fn get(request_id: u64, path: &str) -> Self {
        Self::new(MessageType::Get, request_id, path, Vec::new())
    }

    pub fn set(request_id: u64, path: &str, value: &Value) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Set, request_id, path, to_json(value)?))
    }

    pub fn update(request_id: u64, values: &BTreeMap<String, Value>) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Update, request_id, "", to_json(values)?))
    }

    pub fn update_if(request_id: u64, update: &GuardedUpdate) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::UpdateIf, request_id, "", to_json(update)?))
    }

    pub fn subscribe(subscription_id: u64, path: &str) -> Self {
        Self::new(MessageType::Subscribe, subscription_id, path, Vec::new())
    }

    pub fn unsubscribe(subscription_id: u64) -> Self {
        Self::new(MessageType::Unsubscribe, subscription_id, "", Vec::new())
    }

    pub fn ping(request_id: u64) -> Self {
        Self::new(MessageType::Ping, request_id, "", Vec::new())
    }

    pub fn pong(request_id: u64) -> Self {
        Self::new(MessageType::Pong, request_id, "", Vec::new())
    }

    pub fn ack(request_id: u64) -> Self {
        Self::new(MessageType::Ack, request_id, "", Vec::new())
    }

    pub fn value(request_id: u64, path: &str, snapshot: &Snapshot) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Value, request_id, path, to_json(snapshot)?))
    }

    pub fn snapshot(subscription_id: u64, path: &str, snapshot: &Snapshot) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Snapshot, subscription_id, path, to_json(snapshot)?))
    }

    pub fn error(request_id: u64, error: &StoreError) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Error, request_id, "", to_json(error)?))
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the JSON payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_slice(&self.payload).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
    }

    /// Snapshot carried by a `Value` or `Snapshot` frame.
    pub fn snapshot_payload(&self) -> Result<Snapshot, ProtocolError> {
        match self.msg_type {
            MessageType::Value | MessageType::Snapshot => {
                let value: Value = self.json()?;
                Ok((!value.is_null()).then_some(value))
            }
            other => Err(ProtocolError::UnexpectedType(other)),
        }
    }

    /// Store error carried by an `Error` frame.
    pub fn error_payload(&self) -> Result<StoreError, ProtocolError> {
        match self.msg_type {
            MessageType::Error => self.json(),
            other => Err(ProtocolError::UnexpectedType(other)),
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(value).map_err(|e| ProtocolError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(msg: &StoreMessage) -> StoreMessage {
        StoreMessage::decode(&msg.encode().unwrap()).unwrap()
    }

    #[test]
    fn test_set_frame() {
        let msg = StoreMessage::set(7, "world/a/w/data/5,10", &json!({"ch": "X"})).unwrap();
        let decoded = roundtrip(&msg);
        assert_eq!(decoded, msg);
        assert_eq!(decoded.json::<Value>().unwrap(), json!({"ch": "X"}));
    }

    #[test]
    fn test_update_frame_keeps_nulls() {
        let mut values = BTreeMap::new();
        values.insert("a/b".to_string(), Value::Null);
        values.insert("a/c".to_string(), json!(1));
        let decoded = roundtrip(&StoreMessage::update(1, &values).unwrap());
        let parsed: BTreeMap<String, Value> = decoded.json().unwrap();
        assert_eq!(parsed, values);
    }

    #[test]
    fn test_guarded_update_frame() {
        let update = GuardedUpdate {
            expected: BTreeMap::from([
                ("u/s1/data/k".to_string(), Some(json!({"value": 1}))),
                ("u/s2/data/k".to_string(), None),
            ]),
            values: BTreeMap::from([("u/s1/data/k".to_string(), Value::Null)]),
        };
        let decoded = roundtrip(&StoreMessage::update_if(5, &update).unwrap());
        assert_eq!(decoded.msg_type, MessageType::UpdateIf);
        assert_eq!(decoded.json::<GuardedUpdate>().unwrap(), update);
    }

    #[test]
    fn test_snapshot_payload() {
        let some = roundtrip(&StoreMessage::snapshot(3, "p", &Some(json!({"k": 1}))).unwrap());
        assert_eq!(some.snapshot_payload().unwrap(), Some(json!({"k": 1})));

        let none = roundtrip(&StoreMessage::value(4, "p", &None).unwrap());
        assert_eq!(none.snapshot_payload().unwrap(), None);

        assert_eq!(
            StoreMessage::ack(1).snapshot_payload(),
            Err(ProtocolError::UnexpectedType(MessageType::Ack))
        );
    }

    #[test]
    fn test_error_frame() {
        let err = StoreError::PermissionDenied { path: "world/a/w/data".into() };
        let decoded = roundtrip(&StoreMessage::error(9, &err).unwrap());
        assert_eq!(decoded.request_id, 9);
        assert_eq!(decoded.error_payload().unwrap(), err);
    }

    #[test]
    fn test_hello_frame() {
        let hello = Hello::new(Auth::user("alice"));
        let decoded = roundtrip(&StoreMessage::hello(&hello).unwrap());
        assert_eq!(decoded.msg_type, MessageType::Hello);
        assert_eq!(decoded.json::<Hello>().unwrap(), hello);
    }

    #[test]
    fn test_garbage_is_decode_error() {
        assert!(matches!(
            StoreMessage::decode(&[0xff, 0xff, 0xff]),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_small_frames_stay_small() {
        let encoded = StoreMessage::get(1, "world/a/w/data").encode().unwrap();
        assert!(encoded.len() < 32, "get frame is {} bytes", encoded.len());
    }
}
