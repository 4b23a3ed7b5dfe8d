//! Local CRUD plus CRDT replication for a single named collection.

use crate::crypto::EncryptionManager;
use crate::document::{CrdtOperation, DistributedDocument, EntryType, OperationType, STAGE_POST_PENDING};
use crate::error::{DbError, DbResult};
use crate::index::{IndexManager, IndexMetadata};
use crate::network::protocol::{MessageType, OperationPayload, ProtocolMessage, SyncRequestPayload, SyncResponsePayload};
use crate::network::NetworkManager;
use crate::query::{self, Query};
use crate::resolver;
use crate::storage::StorageBackend;
use crate::vector_clock::VectorClock;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

const DEFAULT_MAX_LOG_SIZE: usize = 10_000;
const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-(collection, network) replication bookkeeping.
#[derive(Debug, Clone)]
pub struct SyncState {
    pub collection: String,
    pub network_id: String,
    pub local_vector: VectorClock,
    pub last_sync: Option<chrono::DateTime<chrono::Utc>>,
    pub staged_entries: Vec<String>,
    pub sync_in_progress: bool,
    pub sync_started_at: Option<Instant>,
    pub pending_operation_count: usize,
}

impl SyncState {
    fn new(collection: impl Into<String>, network_id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            network_id: network_id.into(),
            local_vector: VectorClock::new(),
            last_sync: None,
            staged_entries: Vec::new(),
            sync_in_progress: false,
            sync_started_at: None,
            pending_operation_count: 0,
        }
    }
}

struct Inner {
    log: Vec<CrdtOperation>,
    max_log_size: usize,
    sync: Option<SyncState>,
}

/// A single named collection: storage + indexes + (optionally) CRDT
/// replication over a network.
pub struct DistributedCollection {
    name: String,
    storage: Arc<dyn StorageBackend>,
    indexes: Arc<IndexManager>,
    encryption: Arc<EncryptionManager>,
    local_peer_id: String,
    base_dir: Option<PathBuf>,
    inner: Mutex<Inner>,
}

impl DistributedCollection {
    pub fn new(
        name: impl Into<String>,
        storage: Arc<dyn StorageBackend>,
        indexes: Arc<IndexManager>,
        encryption: Arc<EncryptionManager>,
        local_peer_id: impl Into<String>,
    ) -> Self {
        Self::with_base_dir(name, storage, indexes, encryption, local_peer_id, None)
    }

    /// Same as [`Self::new`], but index definitions created on this
    /// collection are also persisted under `<base_dir>/<name>/indexes/`.
    pub fn with_base_dir(
        name: impl Into<String>,
        storage: Arc<dyn StorageBackend>,
        indexes: Arc<IndexManager>,
        encryption: Arc<EncryptionManager>,
        local_peer_id: impl Into<String>,
        base_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            storage,
            indexes,
            encryption,
            local_peer_id: local_peer_id.into(),
            base_dir,
            inner: Mutex::new(Inner {
                log: Vec::new(),
                max_log_size: DEFAULT_MAX_LOG_SIZE,
                sync: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn create_index(&self, metadata: IndexMetadata) -> DbResult<()> {
        self.indexes.create_index(metadata.clone())?;
        if let Some(base_dir) = &self.base_dir {
            crate::index::save_index_metadata(base_dir, &self.name, &metadata)?;
        }
        Ok(())
    }

    /// Marks this collection as replicated on `network_id`. The network
    /// manager itself is owned by the database facade and passed into
    /// each call that needs it, so collections stay reusable across
    /// networks.
    pub fn attach_to_network(&self, network_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.sync = Some(SyncState::new(self.name.clone(), network_id.to_string()));
    }

    fn next_vector(&self, inner: &mut Inner) -> VectorClock {
        let sync = inner.sync.as_mut().expect("network attached");
        sync.local_vector = sync.local_vector.increment(&self.local_peer_id);
        sync.local_vector.clone()
    }

    fn append_log(&self, inner: &mut Inner, op: CrdtOperation) {
        inner.log.push(op);
        if inner.log.len() > inner.max_log_size {
            let overflow = inner.log.len() - inner.max_log_size;
            inner.log.drain(0..overflow);
        }
    }

    // -- Local CRUD --------------------------------------------------

    pub async fn insert(
        &self,
        id: impl Into<String>,
        entry_type: EntryType,
        payload: HashMap<String, JsonValue>,
        network: Option<&Arc<NetworkManager>>,
    ) -> DbResult<DistributedDocument> {
        let id = id.into();
        let timestamp = chrono::Utc::now().timestamp_millis();
        let mut doc = DistributedDocument::new(
            id.clone(),
            entry_type,
            payload,
            VectorClock::new(),
            timestamp,
            self.local_peer_id.clone(),
        );

        if let Some(network) = network {
            self.maybe_stage_for_posting(network, &mut doc).await;
        }

        let previous = self.storage.get(&self.name, &id)?;
        // Index constraints (uniqueness) are enforced before the document
        // ever touches storage, so a rejected write leaves nothing behind.
        self.indexes.on_write(&self.name, &doc, previous.as_ref())?;
        self.encryption.seal(&mut doc)?;
        self.storage.insert(&self.name, doc.clone())?;

        self.broadcast_if_networked(OperationType::Insert, &doc, network).await?;
        self.encryption.unseal(&mut doc)?;
        Ok(doc)
    }

    /// Marks `doc` staged for external posting if its entry type is on the
    /// attached network's auto-post list; otherwise leaves it untouched
    /// and it broadcasts as a normal operation.
    async fn maybe_stage_for_posting(&self, network: &Arc<NetworkManager>, doc: &mut DistributedDocument) {
        let network_id = match self.sync_state() {
            Some(sync) => sync.network_id,
            None => return,
        };
        let classifications = network.auto_post_classifications(&network_id).await;
        if classifications.contains(&doc.entry_type) {
            self.stage_for_posting(doc);
        }
    }

    pub async fn update(
        &self,
        id: &str,
        patch: HashMap<String, JsonValue>,
        network: Option<&Arc<NetworkManager>>,
    ) -> DbResult<DistributedDocument> {
        let mut existing = self
            .storage
            .get(&self.name, id)?
            .ok_or_else(|| DbError::not_found(&self.name, id))?;
        self.encryption.unseal(&mut existing)?;

        let mut payload = existing.payload.clone().unwrap_or_default();
        for (k, v) in patch {
            payload.insert(k, v);
        }
        existing.payload = Some(payload);
        existing.timestamp = chrono::Utc::now().timestamp_millis();
        existing.peer_id = self.local_peer_id.clone();

        let previous = self.storage.get(&self.name, id)?;
        self.indexes.on_write(&self.name, &existing, previous.as_ref())?;
        let mut to_store = existing.clone();
        self.encryption.seal(&mut to_store)?;
        self.storage.insert(&self.name, to_store.clone())?;

        self.broadcast_if_networked(OperationType::Update, &to_store, network).await?;
        Ok(existing)
    }

    pub async fn delete(&self, id: &str, network: Option<&Arc<NetworkManager>>) -> DbResult<()> {
        let mut doc = self
            .storage
            .get(&self.name, id)?
            .ok_or_else(|| DbError::not_found(&self.name, id))?;
        doc.deleted = true;
        doc.timestamp = chrono::Utc::now().timestamp_millis();
        doc.peer_id = self.local_peer_id.clone();

        let previous = self.storage.get(&self.name, id)?;
        self.storage.insert(&self.name, doc.clone())?;
        self.indexes.on_write(&self.name, &doc, previous.as_ref())?;

        self.broadcast_if_networked(OperationType::Delete, &doc, network).await?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> DbResult<Option<DistributedDocument>> {
        let stored = self.storage.get(&self.name, id)?;
        match stored {
            Some(mut doc) if !doc.deleted => {
                self.encryption.unseal(&mut doc)?;
                Ok(Some(doc))
            }
            _ => Ok(None),
        }
    }

    pub fn find(&self, query: &Query) -> DbResult<Vec<DistributedDocument>> {
        let mut results = query::execute(&self.storage, &self.indexes, &self.name, query)?;
        for doc in &mut results {
            self.encryption.unseal(doc)?;
        }
        Ok(results)
    }

    /// Called by the facade once it knows whether `entry_type` is on the
    /// attached network's auto-post list.
    pub fn stage_for_posting(&self, doc: &mut DistributedDocument) {
        doc.stage = Some(STAGE_POST_PENDING.to_string());
        let mut inner = self.inner.lock().unwrap();
        if let Some(sync) = inner.sync.as_mut() {
            sync.staged_entries.push(doc.id.clone());
        }
    }

    pub fn mark_posted(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(sync) = inner.sync.as_mut() {
            sync.staged_entries.retain(|staged| staged != id);
        }
    }

    async fn broadcast_if_networked(
        &self,
        op_type: OperationType,
        doc: &DistributedDocument,
        network: Option<&Arc<NetworkManager>>,
    ) -> DbResult<()> {
        let Some(network) = network else { return Ok(()) };
        if doc.is_staged() {
            return Ok(());
        }

        let (vector, network_id) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.sync.is_none() {
                return Ok(());
            }
            let vector = self.next_vector(&mut inner);
            let network_id = inner.sync.as_ref().unwrap().network_id.clone();

            let op = CrdtOperation {
                id: Uuid::new_v4().to_string(),
                op_type,
                collection: self.name.clone(),
                document_id: doc.id.clone(),
                data: if op_type == OperationType::Delete {
                    None
                } else {
                    Some(strip_blobs(doc))
                },
                vector: vector.clone(),
                timestamp: doc.timestamp,
                peer_id: self.local_peer_id.clone(),
            };
            self.append_log(&mut inner, op);
            (vector, network_id)
        };

        let op = {
            let inner = self.inner.lock().unwrap();
            inner.log.last().cloned().unwrap()
        };

        let message = ProtocolMessage {
            msg_type: MessageType::Operation,
            network_id,
            sender_id: self.local_peer_id.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            payload: serde_json::to_value(OperationPayload {
                collection: self.name.clone(),
                operation: op,
            })?,
        };
        network.broadcast_message(&message.network_id, message).await?;
        let _ = vector;
        Ok(())
    }

    /// Applies an operation received from a peer. Errors are swallowed by
    /// design: a malformed or stale operation must not abort processing
    /// of the rest of a sync response.
    pub fn apply_remote_operation(&self, op: &CrdtOperation) {
        let existing = match self.storage.get(&self.name, &op.document_id) {
            Ok(v) => v,
            Err(_) => return,
        };

        let resolved = resolver::apply_operation(existing.as_ref(), op);
        let previous = existing.clone();

        match resolved {
            None => {
                let _ = self.storage.delete(&self.name, &op.document_id);
                if let Some(prev) = previous {
                    self.indexes.on_delete(&self.name, &prev);
                }
            }
            Some(doc) => {
                if self.storage.insert(&self.name, doc.clone()).is_ok() {
                    let _ = self.indexes.on_write(&self.name, &doc, previous.as_ref());
                }
            }
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(sync) = inner.sync.as_mut() {
            sync.local_vector = sync.local_vector.merge(&op.vector);
        }
    }

    pub fn operation_log(&self) -> Vec<CrdtOperation> {
        self.inner.lock().unwrap().log.clone()
    }

    pub fn sync_state(&self) -> Option<SyncState> {
        self.inner.lock().unwrap().sync.clone()
    }

    /// Builds the `sync_request` payload for the current local vector.
    pub fn build_sync_request(&self) -> DbResult<SyncRequestPayload> {
        let mut inner = self.inner.lock().unwrap();
        let sync = inner
            .sync
            .as_mut()
            .ok_or_else(|| DbError::not_initialized("collection not attached to a network"))?;

        if sync.sync_in_progress {
            if let Some(started) = sync.sync_started_at {
                if started.elapsed() < SYNC_TIMEOUT {
                    return Err(DbError::conflict("sync already in progress"));
                }
            }
        }
        sync.sync_in_progress = true;
        sync.sync_started_at = Some(Instant::now());

        Ok(SyncRequestPayload {
            collection: self.name.clone(),
            vector: sync.local_vector.clone(),
        })
    }

    /// Answers a peer's `sync_request`: every logged operation whose
    /// originator-counter exceeds the requester's knowledge of it.
    pub fn answer_sync_request(&self, request: &SyncRequestPayload) -> SyncResponsePayload {
        let inner = self.inner.lock().unwrap();
        let local_vector = inner
            .sync
            .as_ref()
            .map(|s| s.local_vector.clone())
            .unwrap_or_default();

        let operations = inner
            .log
            .iter()
            .filter(|op| op.vector.get(&op.peer_id) > request.vector.get(&op.peer_id))
            .cloned()
            .collect();

        SyncResponsePayload {
            collection: self.name.clone(),
            operations,
            vector: local_vector,
        }
    }

    pub fn apply_sync_response(&self, response: &SyncResponsePayload) {
        for op in &response.operations {
            self.apply_remote_operation(op);
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(sync) = inner.sync.as_mut() {
            sync.local_vector = sync.local_vector.merge(&response.vector);
            sync.last_sync = Some(chrono::Utc::now());
            sync.sync_in_progress = false;
            sync.sync_started_at = None;
        }
    }
}

fn strip_blobs(doc: &DistributedDocument) -> DistributedDocument {
    let mut out = doc.clone();
    if let Some(payload) = out.payload.as_mut() {
        payload.retain(|_, v| !matches!(v, JsonValue::String(s) if s.starts_with("blob://")));
    }
    out
}
