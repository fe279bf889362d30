//! Peer directory: announce ingest and lookup.
//!
//! Announces are the only source of public keys. Each accepted announce is
//! verified against the destination hash derivable from the announced key,
//! then merged into the durable store with `verified` and `blocked`
//! preserved across updates.

use std::sync::Arc;

use tracing::{debug, info, warn};

use murmure_net::Announce;
use murmure_shared::constants::ASPECT_CALL;
use murmure_shared::destination::{derive_destination, DestinationHash};
use murmure_shared::identity::{decode_public_key_base64, node_id_from_public_key};
use murmure_shared::protocol::AnnounceAppData;
use murmure_shared::types::NodeId;
use murmure_store::{PeerRecord, PeersStore};

use crate::clock::Clock;

/// A resolved peer: everything signaling needs to reach it.
#[derive(Debug, Clone)]
pub struct ResolvedPeer {
    pub node_id: NodeId,
    pub public_key: [u8; 32],
    pub call_dest: DestinationHash,
    pub display_name: Option<String>,
    pub verified: bool,
    pub blocked: bool,
}

pub struct PeerDirectory {
    store: PeersStore,
    local_node: NodeId,
    clock: Arc<dyn Clock>,
}

impl PeerDirectory {
    pub fn new(store: PeersStore, local_node: NodeId, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            local_node,
            clock,
        }
    }

    /// Ingest one transport announce. Returns the peer's node id when the
    /// announce was accepted into the directory.
    pub fn handle_announce(&mut self, announce: &Announce) -> Option<NodeId> {
        let app_data = match AnnounceAppData::decode(&announce.app_data) {
            Ok(data) => data,
            Err(_) => {
                debug!("Dropping announce with unparseable app data");
                return None;
            }
        };
        if !app_data.is_ours() {
            debug!(app = %app_data.app, "Dropping announce from foreign app");
            return None;
        }

        let node_id = node_id_from_public_key(&announce.public_key);
        if node_id == self.local_node {
            debug!("Dropping our own announce");
            return None;
        }

        let expected = derive_destination(&node_id, ASPECT_CALL);
        if announce.destination != expected {
            // Should be impossible on a well-behaved transport; kept as
            // defence in depth and logged for diagnosis.
            warn!(
                peer = %node_id.short(),
                announced = %announce.destination,
                expected = %expected,
                "Dropping announce with mismatching destination hash"
            );
            return None;
        }

        let now = self.clock.wall_now();
        let updated = self.store.update(&node_id, |record| {
            if let Some(name) = &app_data.display_name {
                record.display_name = name.clone();
            }
            record.last_seen = now;
            record.announce_count += 1;
        });
        if !updated {
            use base64::Engine as _;
            info!(
                peer = %node_id.short(),
                name = app_data.display_name.as_deref().unwrap_or(""),
                "Discovered new peer"
            );
            self.store.insert(PeerRecord {
                node_id,
                display_name: app_data.display_name.clone().unwrap_or_default(),
                call_dest: expected,
                public_key: base64::engine::general_purpose::STANDARD
                    .encode(announce.public_key),
                first_seen: now,
                last_seen: now,
                announce_count: 1,
                verified: false,
                blocked: false,
            });
        }
        Some(node_id)
    }

    /// Look a peer up for signaling. `None` means the peer has never
    /// announced (or its stored key is unusable).
    pub fn resolve(&self, node_id: &NodeId) -> Option<ResolvedPeer> {
        let record = self.store.get(node_id)?;
        let public_key = match decode_public_key_base64(&record.public_key) {
            Ok(key) => key,
            Err(_) => {
                warn!(peer = %node_id.short(), "Stored public key is invalid");
                return None;
            }
        };
        Some(ResolvedPeer {
            node_id: *node_id,
            public_key,
            call_dest: record.call_dest,
            display_name: (!record.display_name.is_empty()).then(|| record.display_name.clone()),
            verified: record.verified,
            blocked: record.blocked,
        })
    }

    pub fn is_blocked(&self, node_id: &NodeId) -> bool {
        self.store.get(node_id).is_some_and(|p| p.blocked)
    }

    pub fn is_verified(&self, node_id: &NodeId) -> bool {
        self.store.get(node_id).is_some_and(|p| p.verified)
    }

    /// User confirmed a matching SAS; persists immediately.
    pub fn mark_verified(&mut self, node_id: &NodeId) -> bool {
        self.store.update(node_id, |record| record.verified = true)
    }

    pub fn set_blocked(&mut self, node_id: &NodeId, blocked: bool) -> bool {
        self.store.update(node_id, |record| record.blocked = blocked)
    }

    pub fn remove(&mut self, node_id: &NodeId) -> bool {
        self.store.remove(node_id)
    }

    pub fn list(&self) -> Vec<PeerRecord> {
        self.store.all()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}
