//! Durable per-collection document storage.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use crate::document::DistributedDocument;
use crate::error::DbResult;

/// The storage backend interface. A collection's `LocalCollection` is
/// generic over this trait so tests can swap in `MemoryStorage` without
/// touching disk.
pub trait StorageBackend: Send + Sync {
    fn insert(&self, collection: &str, doc: DistributedDocument) -> DbResult<()>;
    fn get(&self, collection: &str, id: &str) -> DbResult<Option<DistributedDocument>>;
    fn delete(&self, collection: &str, id: &str) -> DbResult<()>;
    fn find_all(&self, collection: &str) -> DbResult<Vec<DistributedDocument>>;

    /// Local-only blob storage; blobs never enter replication payloads.
    fn put_blob(&self, collection: &str, id: &str, bytes: &[u8]) -> DbResult<()>;
    fn get_blob(&self, collection: &str, id: &str) -> DbResult<Option<Vec<u8>>>;
}
