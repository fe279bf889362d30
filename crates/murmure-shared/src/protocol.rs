//! Call signaling wire protocol.
//!
//! Every signaling packet is a single UTF-8 JSON object with mandatory
//! `type`, `call_id`, `from`, `to` fields. The encrypted transport packet is
//! capped at 500 bytes, which leaves [`MAX_SIGNALING_PAYLOAD`] bytes for the
//! JSON after encryption overhead. Public keys are never carried in signaling
//! messages; recipients resolve them from the peer directory instead.

use serde::{Deserialize, Serialize};

use crate::constants::MAX_SIGNALING_PAYLOAD;
use crate::destination::DestinationHash;
use crate::error::SignalError;
use crate::types::{CallId, CodecType, NodeId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageType {
    #[serde(rename = "CALL_INVITE")]
    Invite,
    #[serde(rename = "CALL_RINGING")]
    Ringing,
    #[serde(rename = "CALL_ACCEPT")]
    Accept,
    #[serde(rename = "CALL_REJECT")]
    Reject,
    #[serde(rename = "CALL_END")]
    End,
    #[serde(rename = "PRESENCE_ANNOUNCE")]
    PresenceAnnounce,
}

/// One signaling packet. Optional fields are omitted from the JSON when
/// unset; unknown fields are ignored on parse for forward compatibility.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallMessage {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub call_id: CallId,
    pub from: NodeId,
    pub to: NodeId,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub call_dest: Option<DestinationHash>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub codec_type: Option<CodecType>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub codec_bitrate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timestamp: Option<f64>,
}

impl CallMessage {
    /// Serialize to the JSON wire form, enforcing the signaling size budget.
    pub fn encode(&self) -> Result<Vec<u8>, SignalError> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_SIGNALING_PAYLOAD {
            return Err(SignalError::MessageTooLarge {
                size: bytes.len(),
                limit: MAX_SIGNALING_PAYLOAD,
            });
        }
        Ok(bytes)
    }

    /// Parse a signaling packet and enforce the per-type required fields.
    pub fn decode(data: &[u8]) -> Result<Self, SignalError> {
        if data.len() > MAX_SIGNALING_PAYLOAD {
            return Err(SignalError::MessageTooLarge {
                size: data.len(),
                limit: MAX_SIGNALING_PAYLOAD,
            });
        }
        let msg: CallMessage = serde_json::from_slice(data)?;
        msg.validate()?;
        Ok(msg)
    }

    /// Required-field check for the message's type.
    pub fn validate(&self) -> Result<(), SignalError> {
        match self.msg_type {
            MessageType::Invite | MessageType::Accept => {
                if self.call_dest.is_none() {
                    return Err(SignalError::MissingField("call_dest"));
                }
                if self.codec_type.is_none() {
                    return Err(SignalError::MissingField("codec_type"));
                }
                if self.codec_bitrate.is_none() {
                    return Err(SignalError::MissingField("codec_bitrate"));
                }
            }
            MessageType::Ringing
            | MessageType::Reject
            | MessageType::End
            | MessageType::PresenceAnnounce => {}
        }
        Ok(())
    }
}

fn wall_clock_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Build a `CALL_INVITE` carrying the caller's media destination and codec
/// preference. Fails with [`SignalError::MessageTooLarge`] before anything is
/// transmitted if the display name pushes the JSON over budget.
#[allow(clippy::too_many_arguments)]
pub fn build_invite(
    from: NodeId,
    to: NodeId,
    call_id: CallId,
    call_dest: DestinationHash,
    codec_type: CodecType,
    codec_bitrate: u32,
    display_name: Option<String>,
) -> Result<CallMessage, SignalError> {
    let msg = CallMessage {
        msg_type: MessageType::Invite,
        call_id,
        from,
        to,
        display_name,
        call_dest: Some(call_dest),
        codec_type: Some(codec_type),
        codec_bitrate: Some(codec_bitrate),
        timestamp: Some(wall_clock_now()),
    };
    msg.encode()?;
    Ok(msg)
}

/// Build a `CALL_ACCEPT` carrying the *negotiated* codec values, not the
/// recipient's raw preference.
pub fn build_accept(
    from: NodeId,
    to: NodeId,
    call_id: CallId,
    call_dest: DestinationHash,
    codec_type: CodecType,
    codec_bitrate: u32,
) -> Result<CallMessage, SignalError> {
    let msg = CallMessage {
        msg_type: MessageType::Accept,
        call_id,
        from,
        to,
        display_name: None,
        call_dest: Some(call_dest),
        codec_type: Some(codec_type),
        codec_bitrate: Some(codec_bitrate),
        timestamp: Some(wall_clock_now()),
    };
    msg.encode()?;
    Ok(msg)
}

pub fn build_ringing(from: NodeId, to: NodeId, call_id: CallId) -> CallMessage {
    bare_message(MessageType::Ringing, from, to, call_id)
}

pub fn build_reject(from: NodeId, to: NodeId, call_id: CallId) -> CallMessage {
    bare_message(MessageType::Reject, from, to, call_id)
}

pub fn build_end(from: NodeId, to: NodeId, call_id: CallId) -> CallMessage {
    bare_message(MessageType::End, from, to, call_id)
}

fn bare_message(msg_type: MessageType, from: NodeId, to: NodeId, call_id: CallId) -> CallMessage {
    CallMessage {
        msg_type,
        call_id,
        from,
        to,
        display_name: None,
        call_dest: None,
        codec_type: None,
        codec_bitrate: None,
        timestamp: Some(wall_clock_now()),
    }
}

/// App-data blob broadcast inside transport announces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnnounceAppData {
    pub app: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub display_name: Option<String>,
}

impl AnnounceAppData {
    pub fn new(display_name: Option<String>) -> Self {
        Self {
            app: crate::constants::APP_NAME.to_string(),
            display_name,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SignalError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, SignalError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn is_ours(&self) -> bool {
        self.app == crate::constants::APP_NAME
    }
}

/// A side's codec preference during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecOffer {
    pub codec: CodecType,
    pub bitrate: u32,
}

impl CodecOffer {
    pub fn new(codec: CodecType, bitrate: u32) -> Self {
        Self { codec, bitrate }
    }

    // Codec2 mode values are numerically bits-per-second already
    fn bits_per_second(&self) -> u32 {
        self.bitrate
    }
}

/// Pick the codec both sides will run.
///
/// Rules, in order: a missing remote offer means the local values win;
/// Codec2 always beats Opus to conserve bandwidth on constrained links;
/// with the same codec on both sides the lower bitrate wins, and a tie keeps
/// the local values. Symmetric whenever both sides supply an offer.
pub fn negotiate_codec(local: CodecOffer, remote: Option<CodecOffer>) -> CodecOffer {
    let Some(remote) = remote else {
        return local;
    };

    match (local.codec, remote.codec) {
        (CodecType::Codec2, CodecType::Opus) => return local,
        (CodecType::Opus, CodecType::Codec2) => return remote,
        _ => {}
    }

    if local.bits_per_second() <= remote.bits_per_second() {
        local
    } else {
        remote
    }
}
