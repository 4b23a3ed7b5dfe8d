//! # KNIRVBASE — embedded, local-first, document-oriented CRDT database
//!
//! KNIRVBASE gives every collection of documents:
//! - **Causal convergence** - concurrent writes on different peers merge
//!   deterministically via vector clocks, with no central coordinator
//! - **Pluggable indexing** - B-tree, inverted-text, and HNSW/ANN indexes
//!   kept in sync with every write, chosen by a cost-based query planner
//! - **Encryption at rest** - sensitive fields are sealed behind a hybrid
//!   post-quantum (Kyber-768 + Dilithium-3) and AES-256-GCM envelope
//! - **Peer-to-peer sync** - newline-delimited JSON over TCP, anti-entropy
//!   driven by vector-clock deltas
//!
//! ## Quick Start
//!
//! ```ignore
//! use knirvbase::{Database, DbConfig};
//! use knirvbase::document::EntryType;
//! use serde_json::json;
//! use std::collections::HashMap;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::open(DbConfig::in_memory("peer1"))?;
//!
//!     let mut payload = HashMap::new();
//!     payload.insert("name".to_string(), json!("alice"));
//!     db.collection("users")
//!         .insert("u1", EntryType::Memory, payload, None)
//!         .await?;
//!
//!     let user = db.collection("users").get("u1")?;
//!     println!("{user:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! KNIRVBASE is built in layers:
//!
//! 1. **[`database`]** - the `Database` facade: collection registry, network lifecycle
//! 2. **[`collection`]** - per-collection CRUD, operation log, anti-entropy
//! 3. **[`resolver`]** and **[`vector_clock`]** - the CRDT merge algebra
//! 4. **[`storage`]** - durable per-document persistence
//! 5. **[`index`]** and **[`query`]** - secondary indexes and the query planner
//! 6. **[`crypto`]** - field-level encryption at rest
//! 7. **[`network`]** - peer transport and the replication wire protocol
//!
//! ## Thread Safety
//!
//! `Database` and `DistributedCollection` are `Send + Sync` and cheap to
//! clone behind an `Arc`; every internal table is guarded by its own lock
//! so readers on one collection never block writers on another.

pub mod collection;
pub mod config;
pub mod crypto;
pub mod database;
pub mod document;
pub mod error;
pub mod index;
pub mod network;
pub mod query;
pub mod resolver;
pub mod storage;
pub mod vector_clock;

pub use collection::DistributedCollection;
pub use config::DbConfig;
pub use database::Database;
pub use document::{CrdtOperation, DistributedDocument, EntryType, OperationType};
pub use error::{DbError, DbResult};
pub use vector_clock::VectorClock;

pub use query::{Filter, Operator, Query, Sort};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use knirvbase::prelude::*;
/// ```
pub mod prelude {
    pub use crate::collection::DistributedCollection;
    pub use crate::config::DbConfig;
    pub use crate::database::Database;
    pub use crate::document::{CrdtOperation, DistributedDocument, EntryType, OperationType};
    pub use crate::error::{DbError, DbResult};
    pub use crate::query::{Filter, Operator, Query, Sort};
    pub use crate::vector_clock::VectorClock;
    pub use serde_json::{json, Value as JsonValue};
}

// ============================================================================
// Logging and Observability
// ============================================================================

/// Initializes the tracing subscriber with an environment filter.
///
/// Call once at application startup. The log level is controlled via the
/// `KNIRV_LOG` environment variable:
/// - `KNIRV_LOG=error` - only errors
/// - `KNIRV_LOG=warn` - errors and warnings
/// - `KNIRV_LOG=info` - general information (default)
/// - `KNIRV_LOG=debug` - debug information
/// - `KNIRV_LOG=trace` - verbose tracing
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("KNIRV_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Initializes logging with an explicit level, bypassing `KNIRV_LOG`.
pub fn init_logging_with_level(level: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::registry()
        .with(EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
