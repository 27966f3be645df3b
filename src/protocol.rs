//! Wire types for both framed sub-protocols (§1, §4.E, §4.F).
//!
//! Two channels: a one-byte-tagged binary frame for the CRDT/awareness
//! channel, and a `#[serde(tag = "type")]` JSON enum for the control
//! channel.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

const FRAME_KIND_SYNC: u8 = 0;
const FRAME_KIND_AWARENESS: u8 = 1;

/// A classified binary CRDT-channel frame (§4.E "concrete binding").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryFrame {
    /// A `loro` document update or snapshot, opaque to the relay beyond
    /// being handed to the Sync Engine.
    Sync(Vec<u8>),
    /// An awareness/presence payload, relayed byte-for-byte with no CRDT
    /// interpretation at all.
    Awareness(Vec<u8>),
}

impl BinaryFrame {
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        match bytes.split_first() {
            Some((&FRAME_KIND_SYNC, rest)) => Ok(BinaryFrame::Sync(rest.to_vec())),
            Some((&FRAME_KIND_AWARENESS, rest)) => Ok(BinaryFrame::Awareness(rest.to_vec())),
            _ => Err(ProtocolError::MalformedBinaryFrame),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let (kind, payload) = match self {
            BinaryFrame::Sync(data) => (FRAME_KIND_SYNC, data),
            BinaryFrame::Awareness(data) => (FRAME_KIND_AWARENESS, data),
        };
        let mut out = Vec::with_capacity(1 + payload.len());
        out.push(kind);
        out.extend_from_slice(payload);
        out
    }
}

/// One entry in a `client-update` roster broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSummary {
    #[serde(rename = "clientId")]
    pub client_id: u64,
    pub username: String,
}

/// Messages recognised inbound on the JSON control channel (§4.F).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum InboundControl {
    #[serde(rename = "client-joined")]
    ClientJoined {
        #[serde(rename = "clientId")]
        client_id: u64,
        username: String,
    },
    #[serde(rename = "client-left")]
    ClientLeft {
        #[serde(rename = "clientId")]
        client_id: u64,
        username: String,
        #[serde(default)]
        room: Option<String>,
    },
    #[serde(rename = "end-room")]
    EndRoom {
        #[serde(rename = "clientId")]
        client_id: u64,
        username: String,
        #[serde(default)]
        room: Option<String>,
    },
}

/// Messages the relay sends on the JSON control channel (§4.F, §4.A).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutboundControl {
    #[serde(rename = "room-full")]
    RoomFull { error: String },
    #[serde(rename = "client-update")]
    ClientUpdate {
        #[serde(rename = "connectedClients")]
        connected_clients: Vec<ClientSummary>,
    },
    #[serde(rename = "client-joined")]
    ClientJoined {
        #[serde(rename = "clientId")]
        client_id: u64,
        username: String,
        message: String,
    },
    #[serde(rename = "client-left")]
    ClientLeft {
        #[serde(rename = "clientId")]
        client_id: u64,
        username: String,
        message: String,
    },
    #[serde(rename = "room-ended")]
    RoomEnded { message: String },
    /// Supplemental diagnostic (SPEC_FULL.md §3, §7): sent only to the
    /// session whose update was rejected for exceeding the document byte
    /// budget. Not part of spec.md's closed set; clients are required by
    /// §4.F to ignore control types they do not recognise.
    #[serde(rename = "update-rejected")]
    UpdateRejected { message: String },
}

/// Parses one inbound JSON control frame.
///
/// `Ok(None)` means the frame was valid JSON with a `type` the relay does
/// not recognise — a forward-compatible no-op, not a protocol violation.
/// `Err` means the frame was not valid JSON, or a recognised `type` was
/// missing required fields — a protocol violation (§7).
pub fn parse_inbound_control(text: &str) -> Result<Option<InboundControl>, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|_| ProtocolError::MalformedJson)?;

    let Some(type_tag) = value.get("type").and_then(|t| t.as_str()) else {
        return Err(ProtocolError::MalformedJson);
    };

    match type_tag {
        "client-joined" | "client-left" | "end-room" => {
            serde_json::from_value(value)
                .map(Some)
                .map_err(|_| ProtocolError::MalformedJson)
        }
        _ => Ok(None),
    }
}
