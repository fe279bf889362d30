//! Append-only call history, encrypted at rest.
//!
//! Records are serialised as JSON and sealed with XChaCha20-Poly1305 under a
//! key derived from the identity secret, so the history file leaks nothing
//! about who was called. Plaintext files from older installs are still
//! readable and get encrypted on the next save.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use murmure_shared::constants::KDF_CONTEXT_HISTORY_KEY;
use murmure_shared::types::{CallDirection, CallId, CallOutcome, NodeId};

use crate::error::{Result, StoreError};
use crate::paths::atomic_write;

const HISTORY_VERSION: u32 = 1;
const MAX_ENTRIES: usize = 1000;
const NONCE_SIZE: usize = 24;

pub type HistoryKey = [u8; 32];

/// Derive the history encryption key from the identity secret.
pub fn derive_history_key(identity_secret: &[u8; 32]) -> HistoryKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_HISTORY_KEY);
    hasher.update(identity_secret);
    let hash = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash.as_bytes()[..32]);
    key
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    pub call_id: CallId,
    pub remote_id: NodeId,
    #[serde(default)]
    pub display_name: String,
    pub direction: CallDirection,
    pub outcome: CallOutcome,
    pub duration_s: u64,
    pub start_ts: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryPlain {
    version: u32,
    calls: Vec<HistoryRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HistorySealed {
    encrypted: bool,
    version: u32,
    /// Base64 of nonce || ciphertext.
    data: String,
}

pub struct CallHistory {
    path: PathBuf,
    key: Option<HistoryKey>,
    calls: Vec<HistoryRecord>,
}

impl CallHistory {
    pub fn open(path: &Path, key: Option<HistoryKey>) -> Self {
        let mut history = Self {
            path: path.to_path_buf(),
            key,
            calls: Vec::new(),
        };
        history.load();
        history
    }

    fn load(&mut self) {
        if !self.path.exists() {
            debug!("No call history file, starting fresh");
            return;
        }
        match self.parse_file() {
            Ok(calls) => {
                info!(count = calls.len(), "Loaded call history");
                self.calls = calls;
            }
            Err(err) => {
                error!(path = %self.path.display(), error = %err, "Failed to load call history");
            }
        }
    }

    fn parse_file(&self) -> Result<Vec<HistoryRecord>> {
        let bytes = std::fs::read(&self.path)?;

        if let Ok(sealed) = serde_json::from_slice::<HistorySealed>(&bytes) {
            if sealed.encrypted {
                let Some(key) = &self.key else {
                    return Err(StoreError::InvalidFormat(
                        "history is encrypted but no key is available".to_string(),
                    ));
                };
                let blob = base64::engine::general_purpose::STANDARD
                    .decode(&sealed.data)
                    .map_err(|e| StoreError::InvalidFormat(e.to_string()))?;
                let plain_bytes = open_sealed(key, &blob)?;
                let plain: HistoryPlain = serde_json::from_slice(&plain_bytes)?;
                return Ok(plain.calls);
            }
        }

        // Plaintext fallback from before encryption was introduced
        let plain: HistoryPlain = serde_json::from_slice(&bytes)?;
        if self.key.is_some() {
            warn!("Call history file is not encrypted; it will be on next save");
        }
        Ok(plain.calls)
    }

    /// Persist the full history; failures are logged and the in-memory list
    /// stays authoritative.
    pub fn save(&mut self) {
        if self.calls.len() > MAX_ENTRIES {
            let excess = self.calls.len() - MAX_ENTRIES;
            self.calls.drain(..excess);
        }

        let plain = HistoryPlain {
            version: HISTORY_VERSION,
            calls: self.calls.clone(),
        };
        let result = match &self.key {
            Some(key) => serde_json::to_vec(&plain)
                .map_err(StoreError::from)
                .and_then(|bytes| seal(key, &bytes))
                .and_then(|blob| {
                    let sealed = HistorySealed {
                        encrypted: true,
                        version: HISTORY_VERSION,
                        data: base64::engine::general_purpose::STANDARD.encode(blob),
                    };
                    Ok(serde_json::to_vec_pretty(&sealed)?)
                }),
            None => serde_json::to_vec_pretty(&plain).map_err(StoreError::from),
        };

        match result.and_then(|bytes| atomic_write(&self.path, &bytes)) {
            Ok(()) => debug!(count = self.calls.len(), "Saved call history"),
            Err(err) => error!(path = %self.path.display(), error = %err, "Failed to save call history"),
        }
    }

    pub fn append(&mut self, record: HistoryRecord) {
        info!(
            remote = %record.remote_id.short(),
            direction = record.direction.as_str(),
            outcome = record.outcome.as_str(),
            duration_s = record.duration_s,
            "Recording call"
        );
        self.calls.push(record);
        self.save();
    }

    /// Most recent calls first.
    pub fn recent(&self, limit: usize) -> Vec<HistoryRecord> {
        let mut calls = self.calls.clone();
        calls.sort_by(|a, b| b.start_ts.cmp(&a.start_ts));
        calls.truncate(limit);
        calls
    }

    pub fn for_peer(&self, peer: &NodeId, limit: usize) -> Vec<HistoryRecord> {
        let mut calls: Vec<HistoryRecord> = self
            .calls
            .iter()
            .filter(|c| c.remote_id == *peer)
            .cloned()
            .collect();
        calls.sort_by(|a, b| b.start_ts.cmp(&a.start_ts));
        calls.truncate(limit);
        calls
    }

    pub fn statistics(&self) -> HistoryStatistics {
        HistoryStatistics {
            total_calls: self.calls.len(),
            completed_calls: self
                .calls
                .iter()
                .filter(|c| c.outcome == CallOutcome::Completed)
                .count(),
            incoming_calls: self
                .calls
                .iter()
                .filter(|c| c.direction == CallDirection::Incoming)
                .count(),
            outgoing_calls: self
                .calls
                .iter()
                .filter(|c| c.direction == CallDirection::Outgoing)
                .count(),
            total_duration_s: self.calls.iter().map(|c| c.duration_s).sum(),
        }
    }

    pub fn clear(&mut self) {
        self.calls.clear();
        self.save();
        info!("Call history cleared");
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryStatistics {
    pub total_calls: usize,
    pub completed_calls: usize,
    pub incoming_calls: usize,
    pub outgoing_calls: usize,
    pub total_duration_s: u64,
}

// Returns nonce || ciphertext
fn seal(key: &HistoryKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| StoreError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open_sealed(key: &HistoryKey, blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < NONCE_SIZE {
        return Err(StoreError::DecryptionFailed);
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| StoreError::DecryptionFailed)
}
