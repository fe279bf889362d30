use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::constants::APP_NAME;
use crate::error::IdentityError;
use crate::identity::node_id_from_public_key;
use crate::types::NodeId;

/// Addressable endpoint on the transport, derived from an identity and an
/// aspect string. Anyone holding the public key computes the same hash; only
/// the identity holder can decrypt packets sent to it.
/// Serialized as 64-hex, like [`NodeId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DestinationHash(pub [u8; 32]);

impl Serialize for DestinationHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for DestinationHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        DestinationHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl DestinationHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s).map_err(|_| IdentityError::InvalidNodeId(s.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidNodeId(s.to_string()))?;
        Ok(Self(arr))
    }

    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl std::fmt::Display for DestinationHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Destination hash for `(identity, aspect)`: SHA256(node_id || app || aspect).
pub fn derive_destination(node_id: &NodeId, aspect: &str) -> DestinationHash {
    let mut hasher = Sha256::new();
    hasher.update(node_id.as_bytes());
    hasher.update(APP_NAME.as_bytes());
    hasher.update(aspect.as_bytes());
    let digest = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&digest);
    DestinationHash(hash)
}

/// Reconstruct a peer's destination from its serialised public key alone.
pub fn destination_for_public_key(public_key: &[u8], aspect: &str) -> DestinationHash {
    derive_destination(&node_id_from_public_key(public_key), aspect)
}
