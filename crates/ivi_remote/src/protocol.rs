//! Wire Protocol
//!
//! Messages exchanged between a source (the process hosting a backend) and a
//! replica (the process whose features use it). Every message travels as one
//! frame: a type byte followed by a JSON payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{RemoteError, RemoteResult};
use crate::ipc::Frame;

/// Frame type byte
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Source → Replica
    Ready = 1,
    PropertyChanged = 2,
    RemoteSignal = 3,
    CallReply = 4,
    CallError = 5,
    PendingResultAvailable = 6,

    // Replica → Source
    Call = 20,
    Acquire = 21,
}

impl TryFrom<u8> for MessageType {
    type Error = RemoteError;

    fn try_from(value: u8) -> RemoteResult<Self> {
        match value {
            1 => Ok(MessageType::Ready),
            2 => Ok(MessageType::PropertyChanged),
            3 => Ok(MessageType::RemoteSignal),
            4 => Ok(MessageType::CallReply),
            5 => Ok(MessageType::CallError),
            6 => Ok(MessageType::PendingResultAvailable),
            20 => Ok(MessageType::Call),
            21 => Ok(MessageType::Acquire),
            _ => Err(RemoteError::UnknownMessageType(value)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Values
// ─────────────────────────────────────────────────────────────────────────────

const VARIANT_KEY: &str = "variant";

/// Box a value so that it survives the generic call path unchanged, even
/// when it is itself an object or null.
pub fn to_remote_variant(value: Value) -> Value {
    let mut boxed = Map::new();
    boxed.insert(VARIANT_KEY.to_string(), value);
    Value::Object(boxed)
}

/// Undo [`to_remote_variant`]. Values that are not boxed pass through.
pub fn from_remote_variant(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.len() == 1 && map.contains_key(VARIANT_KEY) => {
            map.remove(VARIANT_KEY).unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Object name implied by a signature: everything before the revision suffix
pub fn object_name(signature: &str) -> &str {
    signature.split('/').next().unwrap_or(signature)
}

/// Correlation record for a call whose result is delivered later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingResult {
    pub id: u64,
    #[serde(default)]
    pub failed: bool,
}

impl PendingResult {
    pub fn new(id: u64) -> Self {
        Self { id, failed: false }
    }

    pub fn failed(id: u64) -> Self {
        Self { id, failed: true }
    }
}

/// What a call hands back: the value itself, or a pending result id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallReturn {
    Value { value: Value },
    Pending { result: PendingResult },
}

// ─────────────────────────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Snapshot of the acquired object, the first message a replica receives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ready {
    #[serde(default)]
    pub name: String,
    pub signature: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyChanged {
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSignal {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallReply {
    pub call_id: u64,
    #[serde(rename = "return")]
    pub ret: CallReturn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallError {
    pub call_id: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingResultAvailable {
    pub id: u64,
    pub success: bool,
    #[serde(default)]
    pub value: Value,
}

/// Names the object a replica wants; sent once, before any call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acquire {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub call_id: u64,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Messages sent by a source
#[derive(Debug, Clone, PartialEq)]
pub enum SourceMessage {
    Ready(Ready),
    PropertyChanged(PropertyChanged),
    RemoteSignal(RemoteSignal),
    CallReply(CallReply),
    CallError(CallError),
    PendingResultAvailable(PendingResultAvailable),
}

impl SourceMessage {
    pub fn to_frame(&self) -> RemoteResult<Frame> {
        let (msg_type, payload) = match self {
            SourceMessage::Ready(m) => (MessageType::Ready, serde_json::to_vec(m)?),
            SourceMessage::PropertyChanged(m) => {
                (MessageType::PropertyChanged, serde_json::to_vec(m)?)
            }
            SourceMessage::RemoteSignal(m) => (MessageType::RemoteSignal, serde_json::to_vec(m)?),
            SourceMessage::CallReply(m) => (MessageType::CallReply, serde_json::to_vec(m)?),
            SourceMessage::CallError(m) => (MessageType::CallError, serde_json::to_vec(m)?),
            SourceMessage::PendingResultAvailable(m) => {
                (MessageType::PendingResultAvailable, serde_json::to_vec(m)?)
            }
        };
        Ok(Frame::new(msg_type, payload))
    }

    pub fn from_frame(frame: &Frame) -> RemoteResult<Self> {
        Ok(match frame.msg_type {
            MessageType::Ready => SourceMessage::Ready(frame.parse_json()?),
            MessageType::PropertyChanged => SourceMessage::PropertyChanged(frame.parse_json()?),
            MessageType::RemoteSignal => SourceMessage::RemoteSignal(frame.parse_json()?),
            MessageType::CallReply => SourceMessage::CallReply(frame.parse_json()?),
            MessageType::CallError => SourceMessage::CallError(frame.parse_json()?),
            MessageType::PendingResultAvailable => {
                SourceMessage::PendingResultAvailable(frame.parse_json()?)
            }
            MessageType::Call | MessageType::Acquire => {
                return Err(RemoteError::UnknownMessageType(frame.msg_type as u8));
            }
        })
    }
}

/// Messages sent by a replica
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaMessage {
    Acquire(Acquire),
    Call(Call),
}

impl ReplicaMessage {
    pub fn to_frame(&self) -> RemoteResult<Frame> {
        match self {
            ReplicaMessage::Acquire(m) => Ok(Frame::new(MessageType::Acquire, serde_json::to_vec(m)?)),
            ReplicaMessage::Call(m) => Ok(Frame::new(MessageType::Call, serde_json::to_vec(m)?)),
        }
    }

    pub fn from_frame(frame: &Frame) -> RemoteResult<Self> {
        match frame.msg_type {
            MessageType::Acquire => Ok(ReplicaMessage::Acquire(frame.parse_json()?)),
            MessageType::Call => Ok(ReplicaMessage::Call(frame.parse_json()?)),
            other => Err(RemoteError::UnknownMessageType(other as u8)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection state
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle of a replica's view of its source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicaState {
    #[default]
    Uninitialized,
    /// Connecting, no snapshot received yet
    Default,
    Valid,
    /// The connection to the source was lost
    Suspect,
    /// The source speaks a different interface revision
    SignatureMismatch,
}

/// Node-level failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeError {
    RegistryNotAcquired,
    HostUrlInvalid,
    ProtocolMismatch,
    ListenFailed,
    SocketAccessError,
    ConnectionRefused,
}

impl NodeError {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeError::RegistryNotAcquired => "RegistryNotAcquired",
            NodeError::HostUrlInvalid => "HostUrlInvalid",
            NodeError::ProtocolMismatch => "ProtocolMismatch",
            NodeError::ListenFailed => "ListenFailed",
            NodeError::SocketAccessError => "SocketAccessError",
            NodeError::ConnectionRefused => "ConnectionRefused",
        }
    }
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
