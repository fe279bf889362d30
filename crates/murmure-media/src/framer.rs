//! Media frame layout inside the encrypted link:
//! `[type:1][seq:4 BE][payload]`.
//!
//! The sequence number increments per audio frame and wraps modulo 2^32.
//! Ping payloads carry the sender's monotonic clock in milliseconds as
//! 8 bytes big-endian; a pong echoes the payload untouched.

use thiserror::Error;

use murmure_shared::types::FrameType;

pub const HEADER_LEN: usize = 5;
pub const PING_PAYLOAD_LEN: usize = 8;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FramerError {
    #[error("Media frame is {0} bytes, shorter than the {HEADER_LEN}-byte header")]
    TooShort(usize),

    #[error("Unknown media frame type {0:#04x}")]
    UnknownType(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    pub frame_type: FrameType,
    pub seq: u32,
    pub payload: Vec<u8>,
}

pub fn frame(frame_type: FrameType, seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(frame_type as u8);
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn parse(raw: &[u8]) -> Result<MediaFrame, FramerError> {
    if raw.len() < HEADER_LEN {
        return Err(FramerError::TooShort(raw.len()));
    }
    let frame_type = FrameType::from_byte(raw[0]).ok_or(FramerError::UnknownType(raw[0]))?;
    let seq = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]);
    Ok(MediaFrame {
        frame_type,
        seq,
        payload: raw[HEADER_LEN..].to_vec(),
    })
}

pub fn ping_payload(monotonic_millis: u64) -> Vec<u8> {
    monotonic_millis.to_be_bytes().to_vec()
}

pub fn parse_ping_payload(payload: &[u8]) -> Option<u64> {
    let bytes: [u8; PING_PAYLOAD_LEN] = payload.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}
