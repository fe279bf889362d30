//! Short Authentication String derivation.
//!
//! Both call parties read a 4-digit code to each other over the established
//! voice channel; matching codes rule out a man-in-the-middle on the link.

use sha2::{Digest, Sha256};

use crate::types::NodeId;

const SAS_DIGITS: u32 = 4;

/// Derive the SAS code from session key material (normally the link id):
/// the first four bytes of SHA-256, big-endian, modulo 10^4, zero-padded.
pub fn generate_sas(key_material: &[u8]) -> String {
    let digest = Sha256::digest(key_material);
    let value = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let code = value % 10u32.pow(SAS_DIGITS);
    format!("{code:0width$}", width = SAS_DIGITS as usize)
}

/// Fallback key material when no link id is available: both node ids,
/// lexicographically sorted so either side computes the same bytes.
pub fn fallback_key_material(a: &NodeId, b: &NodeId) -> Vec<u8> {
    let (lo, hi) = if a.as_bytes() <= b.as_bytes() {
        (a, b)
    } else {
        (b, a)
    };
    let mut material = Vec::with_capacity(64);
    material.extend_from_slice(lo.as_bytes());
    material.extend_from_slice(hi.as_bytes());
    material
}
