//! Wire protocol messages
//!
//! Every message travels as a JSON envelope `{"Type": .., "Payload": ..}`,
//! one per UDP datagram or per TCP frame. Election-port traffic uses the
//! smaller [`Announcement`] type instead.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::registry::{PeerId, StateSnapshot, UserRequest};

/// Protocol messages exchanged between nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    // === Membership ===
    /// Master liveness signal
    Heartbeat,
    /// A node asking who the master is
    JoinRequest(JoinRequestMsg),
    /// The master's answer to a join, carrying the full state
    JoinResponse(StateSnapshot),
    /// A node leaving the cluster
    LeaveNotification(LeaveMsg),
    /// Manual master override
    ForceMaster(ForceMasterMsg),

    // === Replication ===
    /// Slave asking for the current state
    FetchState,
    /// Full state sent in reply to `FetchState`
    StateUpdate(StateSnapshot),
    /// Write-intent forwarded from a slave
    ActionRequest(ActionRequestMsg),
}

/// Join request payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequestMsg {
    pub peer_id: PeerId,
}

/// Leave notification payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveMsg {
    pub peer_id: PeerId,
}

/// Force-master payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceMasterMsg {
    pub requested_by: PeerId,
}

/// Forwarded write-request payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequestMsg {
    pub user_request: UserRequest,
}

/// Why a received buffer could not be turned into a [`Message`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("message type '{0}' requires a payload")]
    MissingPayload(&'static str),

    #[error("invalid payload for '{kind}': {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Payload", default)]
    payload: Value,
}

impl Message {
    /// Envelope `Type` string of this message
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Heartbeat => "Heartbeat",
            Message::JoinRequest(_) => "JoinRequest",
            Message::JoinResponse(_) => "JoinResponse",
            Message::LeaveNotification(_) => "LeaveNotification",
            Message::ForceMaster(_) => "ForceMaster",
            Message::FetchState => "FetchState",
            Message::StateUpdate(_) => "StateUpdate",
            Message::ActionRequest(_) => "ActionRequest",
        }
    }

    fn payload(&self) -> Value {
        match self {
            Message::Heartbeat | Message::FetchState => Value::Null,
            Message::JoinRequest(p) => json!(p),
            Message::JoinResponse(s) | Message::StateUpdate(s) => json!(s),
            Message::LeaveNotification(p) => json!(p),
            Message::ForceMaster(p) => json!(p),
            Message::ActionRequest(p) => json!(p),
        }
    }
}

/// Encode a message into its JSON envelope
pub fn encode(message: &Message) -> Vec<u8> {
    json!({
        "Type": message.type_name(),
        "Payload": message.payload(),
    })
    .to_string()
    .into_bytes()
}

fn payload<T: serde::de::DeserializeOwned>(kind: &'static str, value: Value) -> Result<T, DecodeError> {
    if value.is_null() {
        return Err(DecodeError::MissingPayload(kind));
    }
    serde_json::from_value(value).map_err(|e| DecodeError::InvalidPayload {
        kind,
        reason: e.to_string(),
    })
}

/// Decode a JSON envelope; fails closed on anything unexpected
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let message = match envelope.kind.as_str() {
        "Heartbeat" => Message::Heartbeat,
        "FetchState" => Message::FetchState,
        "JoinRequest" => Message::JoinRequest(payload("JoinRequest", envelope.payload)?),
        "JoinResponse" => Message::JoinResponse(payload("JoinResponse", envelope.payload)?),
        "LeaveNotification" => {
            Message::LeaveNotification(payload("LeaveNotification", envelope.payload)?)
        }
        "ForceMaster" => Message::ForceMaster(payload("ForceMaster", envelope.payload)?),
        "StateUpdate" => Message::StateUpdate(payload("StateUpdate", envelope.payload)?),
        "ActionRequest" => Message::ActionRequest(payload("ActionRequest", envelope.payload)?),
        other => return Err(DecodeError::UnknownType(other.to_string())),
    };

    Ok(message)
}

/// Election-port announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Announcement {
    /// Periodic presence beacon sent by every node
    #[serde(rename = "hello")]
    Presence { id: PeerId },
    /// Result of an election round
    Master { id: PeerId },
    /// The sender is resigning
    Leave { id: PeerId },
}

impl Announcement {
    /// Peer the announcement is about
    pub fn id(&self) -> &str {
        match self {
            Announcement::Presence { id } | Announcement::Master { id } | Announcement::Leave { id } => id,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        json!(self).to_string().into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))
    }
}
