//! Database-wide configuration: storage location, bootstrap peers, and the
//! passphrase that wraps the master encryption key.

use std::path::PathBuf;

/// Configuration for a single `Database` instance.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Root directory for file-backed storage. `None` runs fully in memory,
    /// useful for tests.
    pub base_dir: Option<PathBuf>,
    pub bind_addr: String,
    pub local_peer_id: String,
    pub bootstrap_peers: Vec<String>,
    pub master_passphrase: Option<String>,
    pub default_hnsw: HnswDefaults,
}

#[derive(Debug, Clone, Copy)]
pub struct HnswDefaults {
    pub m: usize,
    pub ef_construction: usize,
    pub ef: usize,
}

impl Default for HnswDefaults {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef: 50,
        }
    }
}

impl DbConfig {
    pub fn in_memory(local_peer_id: impl Into<String>) -> Self {
        Self {
            base_dir: None,
            bind_addr: "127.0.0.1:0".to_string(),
            local_peer_id: local_peer_id.into(),
            bootstrap_peers: Vec::new(),
            master_passphrase: None,
            default_hnsw: HnswDefaults::default(),
        }
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn with_bootstrap_peers(mut self, peers: Vec<String>) -> Self {
        self.bootstrap_peers = peers;
        self
    }

    pub fn with_master_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.master_passphrase = Some(passphrase.into());
        self
    }
}
