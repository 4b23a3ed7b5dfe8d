//! Secondary index maintenance: B-tree, inverted, and ANN indexes kept in
//! sync with every write.

pub mod ann;
pub mod btree;
pub mod inverted;

use crate::config::HnswDefaults;
use crate::document::DistributedDocument;
use crate::error::{DbError, DbResult};
use ann::{AnnIndex, HnswConfig, HnswIndex, Vector};
use btree::{encode_key, BTreeIndex};
use inverted::InvertedIndex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::Path;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexType {
    BTree,
    Inverted,
    Ann,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Created,
    Loading,
    Ready,
    Dropping,
}

/// A single-field=value partial-inclusion predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialPredicate {
    pub field: String,
    pub value: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub name: String,
    pub collection: String,
    pub index_type: IndexType,
    pub key_fields: Vec<String>,
    pub unique: bool,
    pub partial: Option<PartialPredicate>,
    pub dimension: Option<usize>,
}

/// Writes `<base>/<collection>/indexes/<name>/metadata.json`, creating
/// parent directories as needed.
pub fn save_index_metadata(base_dir: &Path, collection: &str, metadata: &IndexMetadata) -> DbResult<()> {
    let dir = base_dir.join(collection).join("indexes").join(&metadata.name);
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join("metadata.json"), serde_json::to_vec_pretty(metadata)?)?;
    Ok(())
}

/// Reads back every index definition persisted for `collection`. Returns
/// an empty list if the collection has never persisted an index.
pub fn load_index_metadata(base_dir: &Path, collection: &str) -> DbResult<Vec<IndexMetadata>> {
    let dir = base_dir.join(collection).join("indexes");
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let path = entry?.path().join("metadata.json");
        if path.exists() {
            out.push(serde_json::from_slice(&std::fs::read(&path)?)?);
        }
    }
    Ok(out)
}

enum IndexImpl {
    BTree(BTreeIndex),
    Inverted(InvertedIndex),
    Ann(HnswIndex),
}

struct IndexEntry {
    metadata: IndexMetadata,
    state: RwLock<IndexState>,
    imp: IndexImpl,
}

impl IndexEntry {
    fn matches_predicate(&self, doc: &DistributedDocument) -> bool {
        match &self.metadata.partial {
            None => true,
            Some(p) => doc.field(&p.field) == Some(&p.value),
        }
    }

    fn key_values(&self, doc: &DistributedDocument) -> Option<Vec<JsonValue>> {
        let mut values = Vec::with_capacity(self.metadata.key_fields.len());
        for field in &self.metadata.key_fields {
            values.push(doc.field(field)?.clone());
        }
        Some(values)
    }
}

/// Owns every index across every collection and keeps them consistent
/// with the storage backend on each write.
pub struct IndexManager {
    indexes: RwLock<Vec<Arc<IndexEntry>>>,
    default_hnsw: HnswDefaults,
}

impl Default for IndexManager {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexManager {
    pub fn new() -> Self {
        Self::with_hnsw_defaults(HnswDefaults::default())
    }

    /// Same as [`Self::new`], but every `Ann` index this manager creates is
    /// tuned with `defaults` instead of `HnswConfig::default()`.
    pub fn with_hnsw_defaults(defaults: HnswDefaults) -> Self {
        Self {
            indexes: RwLock::new(Vec::new()),
            default_hnsw: defaults,
        }
    }

    pub fn create_index(&self, metadata: IndexMetadata) -> DbResult<()> {
        let imp = match metadata.index_type {
            IndexType::BTree => IndexImpl::BTree(BTreeIndex::new(metadata.unique)),
            IndexType::Inverted => IndexImpl::Inverted(InvertedIndex::new()),
            IndexType::Ann => {
                let config = HnswConfig::with_m(self.default_hnsw.m)
                    .ef_construction(self.default_hnsw.ef_construction)
                    .ef_search(self.default_hnsw.ef);
                IndexImpl::Ann(HnswIndex::new(config))
            }
        };
        let entry = Arc::new(IndexEntry {
            metadata,
            state: RwLock::new(IndexState::Ready),
            imp,
        });
        self.indexes.write().unwrap().push(entry);
        Ok(())
    }

    /// Every index definition currently registered, for persistence.
    pub fn metadata_snapshot(&self) -> Vec<IndexMetadata> {
        self.indexes.read().unwrap().iter().map(|e| e.metadata.clone()).collect()
    }

    pub fn drop_index(&self, name: &str) {
        let mut indexes = self.indexes.write().unwrap();
        if let Some(entry) = indexes.iter().find(|e| e.metadata.name == name) {
            *entry.state.write().unwrap() = IndexState::Dropping;
        }
        indexes.retain(|e| e.metadata.name != name);
    }

    fn indexes_for(&self, collection: &str) -> Vec<Arc<IndexEntry>> {
        let mut matched: Vec<Arc<IndexEntry>> = self
            .indexes
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.metadata.collection == collection)
            .cloned()
            .collect();
        // Fixed lock-acquisition order across indexes for a single write,
        // avoiding deadlock against a concurrent write touching the same set.
        matched.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        matched
    }

    /// Applies a write to every index on `collection`. `previous` is the
    /// document's prior state (if any), used to remove stale entries
    /// before inserting the new ones.
    pub fn on_write(
        &self,
        collection: &str,
        doc: &DistributedDocument,
        previous: Option<&DistributedDocument>,
    ) -> DbResult<()> {
        for entry in self.indexes_for(collection) {
            if *entry.state.read().unwrap() != IndexState::Ready {
                continue;
            }

            if let Some(prev) = previous {
                remove_entry(&entry, prev);
            }

            if doc.deleted {
                continue;
            }
            if !entry.matches_predicate(doc) {
                continue;
            }

            insert_entry(&entry, doc)?;
        }
        Ok(())
    }

    pub fn on_delete(&self, collection: &str, doc: &DistributedDocument) {
        for entry in self.indexes_for(collection) {
            remove_entry(&entry, doc);
        }
    }

    pub fn query_eq(&self, collection: &str, field: &str, value: &JsonValue) -> Option<Vec<String>> {
        self.find_btree(collection, field)
            .map(|btree| btree.lookup_eq(&encode_key(std::slice::from_ref(value))))
    }

    pub fn query_contains(&self, collection: &str, field: &str, term: &str) -> Option<Vec<String>> {
        self.find_inverted(collection, field).map(|idx| idx.contains(term))
    }

    pub fn query_similar(
        &self,
        collection: &str,
        field: &str,
        query: &Vector,
        k: usize,
    ) -> Option<DbResult<Vec<(String, f32)>>> {
        self.find_ann(collection, field).map(|idx| {
            idx.search(query, k)
                .map(|hits| hits.into_iter().map(|h| (h.id, h.score)).collect())
        })
    }

    fn find_btree(&self, collection: &str, field: &str) -> Option<Arc<BTreeIndexHandle>> {
        self.indexes
            .read()
            .unwrap()
            .iter()
            .find(|e| {
                e.metadata.collection == collection
                    && e.metadata.index_type == IndexType::BTree
                    && e.metadata.key_fields.first().map(String::as_str) == Some(field)
            })
            .map(|e| Arc::new(BTreeIndexHandle(e.clone())))
    }

    fn find_inverted(&self, collection: &str, field: &str) -> Option<Arc<InvertedIndexHandle>> {
        self.indexes
            .read()
            .unwrap()
            .iter()
            .find(|e| {
                e.metadata.collection == collection
                    && e.metadata.index_type == IndexType::Inverted
                    && e.metadata.key_fields.first().map(String::as_str) == Some(field)
            })
            .map(|e| Arc::new(InvertedIndexHandle(e.clone())))
    }

    fn find_ann(&self, collection: &str, field: &str) -> Option<Arc<AnnIndexHandle>> {
        self.indexes
            .read()
            .unwrap()
            .iter()
            .find(|e| {
                e.metadata.collection == collection
                    && e.metadata.index_type == IndexType::Ann
                    && e.metadata.key_fields.first().map(String::as_str) == Some(field)
            })
            .map(|e| Arc::new(AnnIndexHandle(e.clone())))
    }
}

fn insert_entry(entry: &Arc<IndexEntry>, doc: &DistributedDocument) -> DbResult<()> {
    match &entry.imp {
        IndexImpl::BTree(btree) => {
            if let Some(values) = entry.key_values(doc) {
                btree.insert(&encode_key(&values), &doc.id)?;
            }
        }
        IndexImpl::Inverted(inverted) => {
            if let Some(field) = entry.metadata.key_fields.first() {
                if let Some(JsonValue::String(text)) = doc.field(field) {
                    inverted.index_document(&doc.id, text);
                }
            }
        }
        IndexImpl::Ann(ann) => {
            if let Some(field) = entry.metadata.key_fields.first() {
                if let Some(JsonValue::Array(values)) = doc.field(field) {
                    let floats: Vec<f32> = values.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect();
                    if floats.len() == values.len() {
                        ann.add(doc.id.clone(), Vector::new(floats))?;
                    }
                }
            }
        }
    }
    Ok(())
}

fn remove_entry(entry: &Arc<IndexEntry>, doc: &DistributedDocument) {
    match &entry.imp {
        IndexImpl::BTree(btree) => {
            if let Some(values) = entry.key_values(doc) {
                btree.remove(&encode_key(&values), &doc.id);
            }
        }
        IndexImpl::Inverted(inverted) => {
            if let Some(field) = entry.metadata.key_fields.first() {
                if let Some(JsonValue::String(text)) = doc.field(field) {
                    inverted.remove_document(&doc.id, text);
                }
            }
        }
        IndexImpl::Ann(ann) => {
            ann.remove(&doc.id);
        }
    }
}

// Thin handles so query_* can return owned results without holding the
// RwLock across the call.
struct BTreeIndexHandle(Arc<IndexEntry>);
impl BTreeIndexHandle {
    fn lookup_eq(&self, key: &str) -> Vec<String> {
        match &self.0.imp {
            IndexImpl::BTree(b) => b.lookup_eq(key),
            _ => Vec::new(),
        }
    }
}

struct InvertedIndexHandle(Arc<IndexEntry>);
impl InvertedIndexHandle {
    fn contains(&self, term: &str) -> Vec<String> {
        match &self.0.imp {
            IndexImpl::Inverted(i) => i.contains(term),
            _ => Vec::new(),
        }
    }
}

struct AnnIndexHandle(Arc<IndexEntry>);
impl AnnIndexHandle {
    fn search(&self, query: &Vector, k: usize) -> DbResult<Vec<ann::AnnResult>> {
        match &self.0.imp {
            IndexImpl::Ann(a) => a.search(query, k),
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::EntryType;
    use crate::vector_clock::VectorClock;
    use serde_json::json;
    use std::collections::HashMap;

    fn doc(id: &str, field: &str, value: JsonValue) -> DistributedDocument {
        let mut payload = HashMap::new();
        payload.insert(field.to_string(), value);
        DistributedDocument::new(id, EntryType::Memory, payload, VectorClock::new(), 1, "p1")
    }

    #[test]
    fn btree_index_maintains_membership_on_write_and_delete() {
        let manager = IndexManager::new();
        manager
            .create_index(IndexMetadata {
                name: "by_email".into(),
                collection: "users".into(),
                index_type: IndexType::BTree,
                key_fields: vec!["email".into()],
                unique: true,
                partial: None,
                dimension: None,
            })
            .unwrap();

        let d1 = doc("u1", "email", json!("a@example.com"));
        manager.on_write("users", &d1, None).unwrap();
        assert_eq!(
            manager.query_eq("users", "email", &json!("a@example.com")).unwrap(),
            vec!["u1".to_string()]
        );

        let mut deleted = d1.clone();
        deleted.deleted = true;
        manager.on_write("users", &deleted, Some(&d1)).unwrap();
        assert!(manager
            .query_eq("users", "email", &json!("a@example.com"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn unique_btree_index_rejects_conflicting_insert() {
        let manager = IndexManager::new();
        manager
            .create_index(IndexMetadata {
                name: "by_email".into(),
                collection: "users".into(),
                index_type: IndexType::BTree,
                key_fields: vec!["email".into()],
                unique: true,
                partial: None,
                dimension: None,
            })
            .unwrap();

        manager
            .on_write("users", &doc("u1", "email", json!("a@example.com")), None)
            .unwrap();
        let err = manager
            .on_write("users", &doc("u2", "email", json!("a@example.com")), None)
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict { .. }));
    }

    #[test]
    fn partial_predicate_excludes_non_matching_documents() {
        let manager = IndexManager::new();
        manager
            .create_index(IndexMetadata {
                name: "active_by_name".into(),
                collection: "users".into(),
                index_type: IndexType::BTree,
                key_fields: vec!["name".into()],
                unique: false,
                partial: Some(PartialPredicate {
                    field: "active".into(),
                    value: json!(true),
                }),
                dimension: None,
            })
            .unwrap();

        let mut inactive = doc("u1", "name", json!("bob"));
        inactive.payload.as_mut().unwrap().insert("active".into(), json!(false));
        manager.on_write("users", &inactive, None).unwrap();
        assert!(manager.query_eq("users", "name", &json!("bob")).unwrap().is_empty());
    }
}
