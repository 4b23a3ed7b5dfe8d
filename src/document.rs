//! The document and operation shapes replicated between peers.

use crate::vector_clock::VectorClock;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Closed set of document kinds. Collections are typed by the entries they
/// hold; the encryption manager and auto-post policy both key off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    Memory,
    Auth,
    Credential,
    Session,
    Audit,
    PQCKey,
    DeviceStatus,
    Metric,
    HealthCheck,
    ThreatEvent,
    RateLimit,
    AccessControl,
    SchemaVersion,
    BackupLog,
    Job,
    Config,
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryType::Memory => "memory",
            EntryType::Auth => "auth",
            EntryType::Credential => "credential",
            EntryType::Session => "session",
            EntryType::Audit => "audit",
            EntryType::PQCKey => "pqc_key",
            EntryType::DeviceStatus => "device_status",
            EntryType::Metric => "metric",
            EntryType::HealthCheck => "health_check",
            EntryType::ThreatEvent => "threat_event",
            EntryType::RateLimit => "rate_limit",
            EntryType::AccessControl => "access_control",
            EntryType::SchemaVersion => "schema_version",
            EntryType::BackupLog => "backup_log",
            EntryType::Job => "job",
            EntryType::Config => "config",
        };
        f.write_str(s)
    }
}

impl FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "memory" => EntryType::Memory,
            "auth" => EntryType::Auth,
            "credential" => EntryType::Credential,
            "session" => EntryType::Session,
            "audit" => EntryType::Audit,
            "pqc_key" => EntryType::PQCKey,
            "device_status" => EntryType::DeviceStatus,
            "metric" => EntryType::Metric,
            "health_check" => EntryType::HealthCheck,
            "threat_event" => EntryType::ThreatEvent,
            "rate_limit" => EntryType::RateLimit,
            "access_control" => EntryType::AccessControl,
            "schema_version" => EntryType::SchemaVersion,
            "backup_log" => EntryType::BackupLog,
            "job" => EntryType::Job,
            "config" => EntryType::Config,
            other => return Err(format!("unknown entry type '{other}'")),
        })
    }
}

/// The stage marker used to queue a document for external publication.
pub const STAGE_POST_PENDING: &str = "post-pending";

/// A document as it exists on the replication plane: identity, payload,
/// and the CRDT metadata (vector clock, timestamp, origin, tombstone).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedDocument {
    pub id: String,
    pub entry_type: EntryType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<HashMap<String, JsonValue>>,
    pub vector: VectorClock,
    pub timestamp: i64,
    pub peer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub deleted: bool,
}

impl DistributedDocument {
    pub fn new(
        id: impl Into<String>,
        entry_type: EntryType,
        payload: HashMap<String, JsonValue>,
        vector: VectorClock,
        timestamp: i64,
        peer_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            entry_type,
            payload: Some(payload),
            vector,
            timestamp,
            peer_id: peer_id.into(),
            stage: None,
            deleted: false,
        }
    }

    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.payload.as_ref().and_then(|p| p.get(name))
    }

    pub fn is_staged(&self) -> bool {
        self.stage.as_deref() == Some(STAGE_POST_PENDING)
    }
}

/// The kind of change a CRDT operation records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Insert,
    Update,
    Delete,
}

/// An immutable, append-only record of a single local mutation, broadcast
/// to peers and replayed by them via the CRDT resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrdtOperation {
    pub id: String,
    pub op_type: OperationType,
    pub collection: String,
    pub document_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<DistributedDocument>,
    pub vector: VectorClock,
    pub timestamp: i64,
    pub peer_id: String,
}
