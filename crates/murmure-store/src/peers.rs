//! Durable peer directory: `peers.json`.
//!
//! The file is versioned and rewritten in full through an atomic rename on
//! every mutation; the directory is small (peers a human can call) so the
//! write cost is negligible next to losing verification state in a crash.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use murmure_shared::destination::DestinationHash;
use murmure_shared::types::NodeId;

use crate::error::{Result, StoreError};
use crate::paths::atomic_write;

const PEERS_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerRecord {
    pub node_id: NodeId,
    #[serde(default)]
    pub display_name: String,
    pub call_dest: DestinationHash,
    /// Base64 of the raw public key; the only place keys are persisted.
    pub public_key: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub announce_count: u64,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub blocked: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct PeersFile {
    version: u32,
    peers: Vec<PeerRecord>,
}

pub struct PeersStore {
    path: PathBuf,
    peers: HashMap<NodeId, PeerRecord>,
}

impl PeersStore {
    pub fn open(path: &Path) -> Self {
        let mut store = Self {
            path: path.to_path_buf(),
            peers: HashMap::new(),
        };
        store.load();
        store
    }

    fn load(&mut self) {
        if !self.path.exists() {
            return;
        }
        match self.parse_file() {
            Ok(peers) => {
                info!(count = peers.len(), path = %self.path.display(), "Loaded peer directory");
                self.peers = peers;
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "Failed to load peer directory");
            }
        }
    }

    fn parse_file(&self) -> Result<HashMap<NodeId, PeerRecord>> {
        let bytes = std::fs::read(&self.path)?;
        let file: PeersFile = serde_json::from_slice(&bytes)?;
        if file.version != PEERS_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "unsupported peers file version {}",
                file.version
            )));
        }
        Ok(file
            .peers
            .into_iter()
            .map(|peer| (peer.node_id, peer))
            .collect())
    }

    /// Rewrite the whole directory. Failures are logged; the in-memory
    /// directory stays authoritative.
    pub fn save(&self) {
        let mut peers: Vec<&PeerRecord> = self.peers.values().collect();
        peers.sort_by_key(|p| p.node_id);
        let file = serde_json::json!({
            "version": PEERS_VERSION,
            "peers": peers,
        });
        match serde_json::to_vec_pretty(&file) {
            Ok(bytes) => {
                if let Err(err) = atomic_write(&self.path, &bytes) {
                    tracing::error!(path = %self.path.display(), error = %err, "Failed to write peer directory");
                }
            }
            Err(err) => tracing::error!(error = %err, "Failed to serialize peer directory"),
        }
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&PeerRecord> {
        self.peers.get(node_id)
    }

    pub fn insert(&mut self, record: PeerRecord) {
        self.peers.insert(record.node_id, record);
        self.save();
    }

    /// Apply `update` to an existing record and persist. Returns false when
    /// the peer is unknown.
    pub fn update<F: FnOnce(&mut PeerRecord)>(&mut self, node_id: &NodeId, update: F) -> bool {
        match self.peers.get_mut(node_id) {
            Some(record) => {
                update(record);
                self.save();
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, node_id: &NodeId) -> bool {
        let removed = self.peers.remove(node_id).is_some();
        if removed {
            self.save();
        }
        removed
    }

    pub fn all(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmure_shared::constants::ASPECT_CALL;
    use murmure_shared::destination::derive_destination;
    use murmure_shared::identity::Identity;

    fn record(identity: &Identity) -> PeerRecord {
        let now = Utc::now();
        PeerRecord {
            node_id: identity.node_id(),
            display_name: "Test Peer".to_string(),
            call_dest: derive_destination(&identity.node_id(), ASPECT_CALL),
            public_key: identity.public_key_base64(),
            first_seen: now,
            last_seen: now,
            announce_count: 1,
            verified: false,
            blocked: false,
        }
    }

    #[test]
    fn test_insert_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        let identity = Identity::generate();

        let mut store = PeersStore::open(&path);
        store.insert(record(&identity));
        assert_eq!(store.len(), 1);

        let reloaded = PeersStore::open(&path);
        let peer = reloaded.get(&identity.node_id()).unwrap();
        assert_eq!(peer.display_name, "Test Peer");
        assert_eq!(peer.public_key, identity.public_key_base64());
    }

    #[test]
    fn test_update_persists_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        let identity = Identity::generate();

        let mut store = PeersStore::open(&path);
        store.insert(record(&identity));
        assert!(store.update(&identity.node_id(), |p| p.blocked = true));

        let reloaded = PeersStore::open(&path);
        assert!(reloaded.get(&identity.node_id()).unwrap().blocked);
    }

    #[test]
    fn test_update_unknown_peer() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PeersStore::open(&dir.path().join("peers.json"));
        assert!(!store.update(&Identity::generate().node_id(), |p| p.verified = true));
    }

    #[test]
    fn test_versioned_file_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        let mut store = PeersStore::open(&path);
        store.insert(record(&Identity::generate()));

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert!(raw["peers"].is_array());
        assert!(raw["peers"][0]["call_dest"].is_string());
    }

    #[test]
    fn test_unsupported_version_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        std::fs::write(&path, r#"{"version":99,"peers":[]}"#).unwrap();
        let store = PeersStore::open(&path);
        assert!(store.is_empty());
    }
}
