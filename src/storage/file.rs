//! File-backed storage: one JSON file per document under
//! `<base>/<collection>/<id>.json`, written atomically via
//! write-temp-then-rename.

use super::StorageBackend;
use crate::document::DistributedDocument;
use crate::error::{DbError, DbResult};
use dashmap::DashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

#[derive(Debug)]
pub struct FileStorage {
    base: PathBuf,
    locks: DashMap<String, RwLock<()>>,
}

impl FileStorage {
    pub fn new(base: impl Into<PathBuf>) -> DbResult<Self> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        Ok(Self {
            base,
            locks: DashMap::new(),
        })
    }

    fn collection_dir(&self, collection: &str) -> PathBuf {
        self.base.join(collection)
    }

    fn document_path(&self, collection: &str, id: &str) -> PathBuf {
        self.collection_dir(collection).join(format!("{id}.json"))
    }

    fn blob_dir(&self, collection: &str) -> PathBuf {
        self.collection_dir(collection).join("blobs")
    }

    fn lock(&self, collection: &str) -> dashmap::mapref::one::Ref<'_, String, RwLock<()>> {
        self.locks
            .entry(collection.to_string())
            .or_insert_with(|| RwLock::new(()));
        self.locks.get(collection).unwrap()
    }

    fn atomic_write(path: &Path, bytes: &[u8]) -> DbResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl StorageBackend for FileStorage {
    fn insert(&self, collection: &str, doc: DistributedDocument) -> DbResult<()> {
        let guard = self.lock(collection);
        let _write = guard.write().unwrap();
        let path = self.document_path(collection, &doc.id);
        let bytes = serde_json::to_vec_pretty(&doc)?;
        Self::atomic_write(&path, &bytes)
    }

    fn get(&self, collection: &str, id: &str) -> DbResult<Option<DistributedDocument>> {
        let guard = self.lock(collection);
        let _read = guard.read().unwrap();
        let path = self.document_path(collection, id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn delete(&self, collection: &str, id: &str) -> DbResult<()> {
        let guard = self.lock(collection);
        let _write = guard.write().unwrap();
        let path = self.document_path(collection, id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DbError::Storage(e)),
        }
    }

    fn find_all(&self, collection: &str) -> DbResult<Vec<DistributedDocument>> {
        let guard = self.lock(collection);
        let _read = guard.read().unwrap();
        let dir = self.collection_dir(collection);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut docs = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path)?;
            docs.push(serde_json::from_slice(&bytes)?);
        }
        Ok(docs)
    }

    fn put_blob(&self, collection: &str, id: &str, bytes: &[u8]) -> DbResult<()> {
        let path = self.blob_dir(collection).join(id);
        Self::atomic_write(&path, bytes)
    }

    fn get_blob(&self, collection: &str, id: &str) -> DbResult<Option<Vec<u8>>> {
        let path = self.blob_dir(collection).join(id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(&path)?))
    }
}
