//! Wire message shapes exchanged between peers after the handshake.

use crate::document::CrdtOperation;
use crate::vector_clock::VectorClock;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    SyncRequest,
    SyncResponse,
    Operation,
    Heartbeat,
    CollectionAnnounce,
    CollectionRequest,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::SyncRequest => "sync_request",
            MessageType::SyncResponse => "sync_response",
            MessageType::Operation => "operation",
            MessageType::Heartbeat => "heartbeat",
            MessageType::CollectionAnnounce => "collection_announce",
            MessageType::CollectionRequest => "collection_request",
        };
        f.write_str(s)
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "sync_request" => MessageType::SyncRequest,
            "sync_response" => MessageType::SyncResponse,
            "operation" => MessageType::Operation,
            "heartbeat" => MessageType::Heartbeat,
            "collection_announce" => MessageType::CollectionAnnounce,
            "collection_request" => MessageType::CollectionRequest,
            other => return Err(format!("unknown message type '{other}'")),
        })
    }
}

/// The envelope every message on the wire is wrapped in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolMessage {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub network_id: String,
    pub sender_id: String,
    pub timestamp: i64,
    pub payload: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationPayload {
    pub collection: String,
    pub operation: CrdtOperation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequestPayload {
    pub collection: String,
    pub vector: VectorClock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponsePayload {
    pub collection: String,
    pub operations: Vec<CrdtOperation>,
    pub vector: VectorClock,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_display_matches_wire_tokens() {
        assert_eq!(MessageType::SyncRequest.to_string(), "sync_request");
        assert_eq!(MessageType::CollectionAnnounce.to_string(), "collection_announce");
    }

    #[test]
    fn message_type_round_trips_through_from_str() {
        for mt in [
            MessageType::SyncRequest,
            MessageType::SyncResponse,
            MessageType::Operation,
            MessageType::Heartbeat,
            MessageType::CollectionAnnounce,
            MessageType::CollectionRequest,
        ] {
            assert_eq!(MessageType::from_str(&mt.to_string()).unwrap(), mt);
        }
    }

    #[test]
    fn protocol_message_serializes_type_as_snake_case() {
        let msg = ProtocolMessage {
            msg_type: MessageType::Heartbeat,
            network_id: "net1".into(),
            sender_id: "peer1".into(),
            timestamp: 0,
            payload: JsonValue::Null,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"heartbeat\""));
    }
}
