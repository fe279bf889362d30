use std::path::Path;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::IdentityError;
use crate::types::NodeId;

// Ed25519-based node identity. The node id is the SHA-256 of the public key
// and stands in for a phone number.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        Self { signing_key }
    }

    /// Load an identity file, or create and persist a fresh one.
    ///
    /// The file holds the raw 32-byte Ed25519 secret. `force_new` overwrites
    /// any existing file with a newly generated key.
    pub fn load_or_create(path: &Path, force_new: bool) -> Result<Self, IdentityError> {
        if path.exists() && !force_new {
            let bytes = std::fs::read(path)?;
            let secret: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                IdentityError::KeyFile(format!(
                    "{} holds {} bytes, expected 32",
                    path.display(),
                    bytes.len()
                ))
            })?;
            return Ok(Self::from_secret_bytes(&secret));
        }

        let identity = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, identity.signing_key.as_bytes())?;
        tracing::info!(path = %path.display(), node_id = %identity.node_id().short(), "Wrote new identity file");
        Ok(identity)
    }

    pub fn node_id(&self) -> NodeId {
        node_id_from_public_key(&self.public_key_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn public_key_base64(&self) -> String {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode(self.public_key_bytes())
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }
}

/// Node id of any peer, given only its serialised public key.
pub fn node_id_from_public_key(public_key: &[u8]) -> NodeId {
    let digest = Sha256::digest(public_key);
    let mut id = [0u8; 32];
    id.copy_from_slice(&digest);
    NodeId(id)
}

pub fn decode_public_key_base64(encoded: &str) -> Result<[u8; 32], IdentityError> {
    use base64::Engine as _;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| IdentityError::InvalidKeyBytes)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| IdentityError::InvalidKeyBytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_is_pubkey_hash() {
        let id = Identity::generate();
        assert_eq!(id.node_id(), node_id_from_public_key(&id.public_key_bytes()));
    }

    #[test]
    fn test_secret_roundtrip() {
        let id = Identity::generate();
        let restored = Identity::from_secret_bytes(id.secret_bytes());
        assert_eq!(id.node_id(), restored.node_id());
    }

    #[test]
    fn test_public_key_base64_roundtrip() {
        let id = Identity::generate();
        let decoded = decode_public_key_base64(&id.public_key_base64()).unwrap();
        assert_eq!(decoded, id.public_key_bytes());
    }

    #[test]
    fn test_load_or_create_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity");

        let first = Identity::load_or_create(&path, false).unwrap();
        let second = Identity::load_or_create(&path, false).unwrap();
        assert_eq!(first.node_id(), second.node_id());

        let fresh = Identity::load_or_create(&path, true).unwrap();
        assert_ne!(first.node_id(), fresh.node_id());
    }
}
