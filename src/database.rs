//! The embedded database facade: collection registry plus network
//! lifecycle management.

use crate::collection::DistributedCollection;
use crate::config::DbConfig;
use crate::crypto::EncryptionManager;
use crate::error::{DbError, DbResult};
use crate::index::IndexManager;
use crate::network::{NetworkConfig, NetworkManager};
use crate::storage::{FileStorage, MemoryStorage, StorageBackend};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Top-level handle to an embedded KNIRVBASE instance. Collections are
/// created lazily on first access and memoized for the lifetime of the
/// database.
pub struct Database {
    config: DbConfig,
    storage: Arc<dyn StorageBackend>,
    encryption: Arc<EncryptionManager>,
    network: Arc<NetworkManager>,
    collections: DashMap<String, Arc<DistributedCollection>>,
}

impl Database {
    pub fn open(config: DbConfig) -> DbResult<Self> {
        let storage: Arc<dyn StorageBackend> = match &config.base_dir {
            Some(dir) => Arc::new(FileStorage::new(dir.clone())?),
            None => Arc::new(MemoryStorage::new()),
        };
        let network = Arc::new(NetworkManager::new(config.local_peer_id.clone()));
        let encryption = Arc::new(EncryptionManager::open(
            config.base_dir.as_deref(),
            config.master_passphrase.as_deref(),
        )?);
        Ok(Self {
            encryption,
            network,
            collections: DashMap::new(),
            storage,
            config,
        })
    }

    pub async fn start_networking(&self) -> DbResult<()> {
        self.network.initialize(&self.config.bind_addr).await?;
        info!(addr = %self.config.bind_addr, "network listener started");
        Ok(())
    }

    /// Returns the named collection, creating it on first access. Index
    /// definitions persisted under `base_dir` (if any) are recreated and
    /// rebuilt from storage before the collection is handed back.
    pub fn collection(&self, name: &str) -> Arc<DistributedCollection> {
        if let Some(existing) = self.collections.get(name) {
            return existing.clone();
        }
        let indexes = Arc::new(IndexManager::with_hnsw_defaults(self.config.default_hnsw));
        self.load_persisted_indexes(name, &indexes);
        let collection = Arc::new(DistributedCollection::with_base_dir(
            name,
            self.storage.clone(),
            indexes,
            self.encryption.clone(),
            self.config.local_peer_id.clone(),
            self.config.base_dir.clone(),
        ));
        self.collections.insert(name.to_string(), collection.clone());
        collection
    }

    /// Recreates every index definition persisted for `name` and replays
    /// the collection's current documents through it. Index contents
    /// themselves are never written to disk directly, only rebuilt.
    fn load_persisted_indexes(&self, name: &str, indexes: &Arc<IndexManager>) {
        let Some(base_dir) = &self.config.base_dir else { return };
        let metadata = match crate::index::load_index_metadata(base_dir, name) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(collection = name, error = %e, "failed to load persisted index metadata");
                return;
            }
        };
        if metadata.is_empty() {
            return;
        }
        for meta in metadata {
            if let Err(e) = indexes.create_index(meta) {
                warn!(collection = name, error = %e, "failed to recreate persisted index");
            }
        }

        let docs = match self.storage.find_all(name) {
            Ok(docs) => docs,
            Err(e) => {
                warn!(collection = name, error = %e, "failed to read documents for index rebuild");
                return;
            }
        };
        for mut doc in docs {
            if doc.deleted {
                continue;
            }
            if let Err(e) = self.encryption.unseal(&mut doc) {
                warn!(collection = name, id = %doc.id, error = %e, "failed to unseal document for index rebuild");
                continue;
            }
            if let Err(e) = indexes.on_write(name, &doc, None) {
                warn!(collection = name, id = %doc.id, error = %e, "failed to index document on rebuild");
            }
        }
    }

    pub fn network(&self) -> &Arc<NetworkManager> {
        &self.network
    }

    pub async fn create_network(&self, config: NetworkConfig) -> DbResult<()> {
        self.network.create_network(config).await
    }

    pub async fn join_network(&self, network_id: &str) -> DbResult<()> {
        self.network
            .join_network(network_id, self.config.bootstrap_peers.clone())
            .await
    }

    pub async fn leave_network(&self, network_id: &str) -> DbResult<()> {
        self.network.leave_network(network_id).await
    }

    pub async fn add_collection_to_network(&self, network_id: &str, collection: &str) -> DbResult<()> {
        self.network.add_collection_to_network(network_id, collection).await?;
        self.collection(collection).attach_to_network(network_id);
        Ok(())
    }

    pub async fn remove_collection_from_network(&self, network_id: &str, collection: &str) -> DbResult<()> {
        self.network.remove_collection_from_network(network_id, collection).await
    }

    /// Clears the in-memory key store, dropping every cached key record,
    /// and tears the network down. Storage needs no explicit flush: every
    /// write already lands on disk synchronously.
    pub async fn shutdown(&self) -> DbResult<()> {
        self.encryption.key_store().clear();
        self.network.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::EntryType;
    use std::collections::HashMap;

    #[tokio::test]
    async fn collection_is_memoized_across_calls() {
        let db = Database::open(DbConfig::in_memory("peer1")).unwrap();
        let a = db.collection("things");
        let b = db.collection("things");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn writes_through_the_facade_are_visible_via_get() {
        let db = Database::open(DbConfig::in_memory("peer1")).unwrap();
        let things = db.collection("things");
        things
            .insert("a", EntryType::Memory, HashMap::new(), None)
            .await
            .unwrap();
        assert!(things.get("a").unwrap().is_some());
    }

    #[tokio::test]
    async fn adding_collection_to_unknown_network_fails() {
        let db = Database::open(DbConfig::in_memory("peer1")).unwrap();
        let err = db.add_collection_to_network("ghost", "things").await.unwrap_err();
        assert!(matches!(err, DbError::NotInitialized { .. }));
    }

    #[tokio::test]
    async fn create_then_join_then_leave_network() {
        let db = Database::open(DbConfig::in_memory("peer1")).unwrap();
        db.create_network(NetworkConfig::new("net1", "Test Net")).await.unwrap();
        db.join_network("net1").await.unwrap();
        db.leave_network("net1").await.unwrap();
        assert!(db.network().get_network_stats("net1").await.is_none());
    }
}
