//! In-memory storage backend. Backs unit tests that should not touch disk;
//! mirrors the on-disk backend's semantics exactly.

use super::StorageBackend;
use crate::document::DistributedDocument;
use crate::error::DbResult;
use dashmap::DashMap;
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryStorage {
    documents: DashMap<String, DashMap<String, DistributedDocument>>,
    blobs: DashMap<String, DashMap<String, Vec<u8>>>,
    locks: DashMap<String, RwLock<()>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self, collection: &str) {
        self.locks.entry(collection.to_string()).or_insert_with(|| RwLock::new(()));
    }
}

impl StorageBackend for MemoryStorage {
    fn insert(&self, collection: &str, doc: DistributedDocument) -> DbResult<()> {
        self.lock(collection);
        let guard = self.locks.get(collection).unwrap();
        let _write = guard.write().unwrap();
        self.documents
            .entry(collection.to_string())
            .or_default()
            .insert(doc.id.clone(), doc);
        Ok(())
    }

    fn get(&self, collection: &str, id: &str) -> DbResult<Option<DistributedDocument>> {
        Ok(self
            .documents
            .get(collection)
            .and_then(|m| m.get(id).map(|e| e.value().clone())))
    }

    fn delete(&self, collection: &str, id: &str) -> DbResult<()> {
        if let Some(m) = self.documents.get(collection) {
            m.remove(id);
        }
        Ok(())
    }

    fn find_all(&self, collection: &str) -> DbResult<Vec<DistributedDocument>> {
        Ok(self
            .documents
            .get(collection)
            .map(|m| m.iter().map(|e| e.value().clone()).collect())
            .unwrap_or_default())
    }

    fn put_blob(&self, collection: &str, id: &str, bytes: &[u8]) -> DbResult<()> {
        self.blobs
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get_blob(&self, collection: &str, id: &str) -> DbResult<Option<Vec<u8>>> {
        Ok(self
            .blobs
            .get(collection)
            .and_then(|m| m.get(id).map(|e| e.value().clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::EntryType;
    use crate::vector_clock::VectorClock;
    use std::collections::HashMap;

    fn sample(id: &str) -> DistributedDocument {
        DistributedDocument::new(
            id,
            EntryType::Memory,
            HashMap::new(),
            VectorClock::new().increment("p1"),
            1,
            "p1",
        )
    }

    #[test]
    fn insert_then_get_round_trips() {
        let store = MemoryStorage::new();
        store.insert("things", sample("a")).unwrap();
        let got = store.get("things", "a").unwrap().unwrap();
        assert_eq!(got.id, "a");
    }

    #[test]
    fn missing_document_is_none() {
        let store = MemoryStorage::new();
        assert!(store.get("things", "missing").unwrap().is_none());
    }

    #[test]
    fn delete_removes_document() {
        let store = MemoryStorage::new();
        store.insert("things", sample("a")).unwrap();
        store.delete("things", "a").unwrap();
        assert!(store.get("things", "a").unwrap().is_none());
    }

    #[test]
    fn blobs_are_isolated_from_documents() {
        let store = MemoryStorage::new();
        store.put_blob("things", "a", b"raw").unwrap();
        assert!(store.get("things", "a").unwrap().is_none());
        assert_eq!(store.get_blob("things", "a").unwrap().unwrap(), b"raw");
    }
}
