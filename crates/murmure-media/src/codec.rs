//! Voice codec abstraction.
//!
//! Two concrete codecs sit behind the [`Encoder`]/[`Decoder`] traits:
//! Opus (48 kHz mono, 20 ms frames, 8-64 kbps) and Codec2 (8 kHz mono,
//! low-bitrate modes where the mode value is the bitrate in bit/s).

use thiserror::Error;

use murmure_shared::constants::{
    CODEC2_SAMPLE_RATE, OPUS_FRAME_MS, OPUS_SAMPLE_RATE,
};
use murmure_shared::protocol::CodecOffer;
use murmure_shared::types::CodecType;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to initialise {codec} codec: {reason}")]
    Init { codec: CodecType, reason: String },

    #[error("Unsupported codec2 mode {0}")]
    UnsupportedMode(u32),

    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Decode failed: {0}")]
    Decode(String),
}

/// Turns one PCM window into an opaque encoded frame.
pub trait Encoder: Send {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError>;
    /// Samples per PCM window.
    fn frame_size(&self) -> usize;
    fn sample_rate(&self) -> u32;
    fn frame_ms(&self) -> u32;
}

/// Turns an encoded frame back into one PCM window.
pub trait Decoder: Send {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>, CodecError>;
    fn frame_size(&self) -> usize;
    fn sample_rate(&self) -> u32;
    fn frame_ms(&self) -> u32;
}

/// Build the encoder/decoder pair for a negotiated offer.
pub fn create_codec(offer: CodecOffer) -> Result<(Box<dyn Encoder>, Box<dyn Decoder>), CodecError> {
    match offer.codec {
        CodecType::Opus => {
            let encoder = OpusEncoder::new(offer.bitrate)?;
            let decoder = OpusDecoder::new()?;
            Ok((Box::new(encoder), Box::new(decoder)))
        }
        CodecType::Codec2 => {
            let encoder = Codec2Codec::new(offer.bitrate)?;
            let decoder = Codec2Codec::new(offer.bitrate)?;
            Ok((Box::new(encoder), Box::new(decoder)))
        }
    }
}

// ---------------------------------------------------------------------------
// Opus
// ---------------------------------------------------------------------------

pub struct OpusEncoder {
    inner: opus::Encoder,
    frame_size: usize,
}

impl OpusEncoder {
    pub fn new(bitrate: u32) -> Result<Self, CodecError> {
        let mut inner = opus::Encoder::new(
            OPUS_SAMPLE_RATE,
            opus::Channels::Mono,
            opus::Application::Voip,
        )
        .map_err(|e| CodecError::Init {
            codec: CodecType::Opus,
            reason: e.to_string(),
        })?;
        inner
            .set_bitrate(opus::Bitrate::Bits(bitrate as i32))
            .map_err(|e| CodecError::Init {
                codec: CodecType::Opus,
                reason: e.to_string(),
            })?;
        let frame_size = (OPUS_SAMPLE_RATE as usize * OPUS_FRAME_MS as usize) / 1000;
        tracing::info!(bitrate, "Opus encoder initialised");
        Ok(Self { inner, frame_size })
    }
}

impl Encoder for OpusEncoder {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        if pcm.len() != self.frame_size {
            return Err(CodecError::Encode(format!(
                "window holds {} samples, expected {}",
                pcm.len(),
                self.frame_size
            )));
        }
        self.inner
            .encode_vec(pcm, 4000)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn sample_rate(&self) -> u32 {
        OPUS_SAMPLE_RATE
    }

    fn frame_ms(&self) -> u32 {
        OPUS_FRAME_MS
    }
}

pub struct OpusDecoder {
    inner: opus::Decoder,
    frame_size: usize,
}

impl OpusDecoder {
    pub fn new() -> Result<Self, CodecError> {
        let inner =
            opus::Decoder::new(OPUS_SAMPLE_RATE, opus::Channels::Mono).map_err(|e| {
                CodecError::Init {
                    codec: CodecType::Opus,
                    reason: e.to_string(),
                }
            })?;
        let frame_size = (OPUS_SAMPLE_RATE as usize * OPUS_FRAME_MS as usize) / 1000;
        Ok(Self { inner, frame_size })
    }
}

impl Decoder for OpusDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>, CodecError> {
        let mut pcm = vec![0i16; self.frame_size];
        let decoded = self
            .inner
            .decode(data, &mut pcm, false)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        pcm.truncate(decoded);
        Ok(pcm)
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn sample_rate(&self) -> u32 {
        OPUS_SAMPLE_RATE
    }

    fn frame_ms(&self) -> u32 {
        OPUS_FRAME_MS
    }
}

// ---------------------------------------------------------------------------
// Codec2
// ---------------------------------------------------------------------------

// Codec2 state is not splittable, so the same type serves as both halves;
// create_codec builds two instances.
pub struct Codec2Codec {
    inner: codec2::Codec2,
    frame_size: usize,
    frame_ms: u32,
}

impl Codec2Codec {
    pub fn new(mode: u32) -> Result<Self, CodecError> {
        let mode = match mode {
            700 => codec2::Codec2Mode::MODE_700C,
            1200 => codec2::Codec2Mode::MODE_1200,
            1300 => codec2::Codec2Mode::MODE_1300,
            1400 => codec2::Codec2Mode::MODE_1400,
            1600 => codec2::Codec2Mode::MODE_1600,
            2400 => codec2::Codec2Mode::MODE_2400,
            3200 => codec2::Codec2Mode::MODE_3200,
            other => return Err(CodecError::UnsupportedMode(other)),
        };
        let inner = codec2::Codec2::new(mode);
        let frame_size = inner.samples_per_frame();
        let frame_ms = (frame_size as u32 * 1000) / CODEC2_SAMPLE_RATE;
        tracing::info!(?mode, frame_size, "Codec2 initialised");
        Ok(Self {
            inner,
            frame_size,
            frame_ms,
        })
    }

    fn packed_bytes(&self) -> usize {
        (self.inner.bits_per_frame() + 7) / 8
    }
}

impl Encoder for Codec2Codec {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        if pcm.len() != self.frame_size {
            return Err(CodecError::Encode(format!(
                "window holds {} samples, expected {}",
                pcm.len(),
                self.frame_size
            )));
        }
        let mut packed = vec![0u8; self.packed_bytes()];
        self.inner.encode(&mut packed, pcm);
        Ok(packed)
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn sample_rate(&self) -> u32 {
        CODEC2_SAMPLE_RATE
    }

    fn frame_ms(&self) -> u32 {
        self.frame_ms
    }
}

impl Decoder for Codec2Codec {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>, CodecError> {
        if data.len() != self.packed_bytes() {
            return Err(CodecError::Decode(format!(
                "frame holds {} bytes, expected {}",
                data.len(),
                self.packed_bytes()
            )));
        }
        let mut pcm = vec![0i16; self.frame_size];
        self.inner.decode(&mut pcm, data);
        Ok(pcm)
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn sample_rate(&self) -> u32 {
        CODEC2_SAMPLE_RATE
    }

    fn frame_ms(&self) -> u32 {
        self.frame_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opus_roundtrip_window() {
        let (mut enc, mut dec) = create_codec(CodecOffer::new(CodecType::Opus, 24_000)).unwrap();
        assert_eq!(enc.frame_size(), 960);
        assert_eq!(enc.sample_rate(), 48_000);

        let pcm: Vec<i16> = (0..960).map(|i| ((i % 64) * 256) as i16).collect();
        let encoded = enc.encode(&pcm).unwrap();
        assert!(!encoded.is_empty());

        let decoded = dec.decode(&encoded).unwrap();
        assert_eq!(decoded.len(), 960);
    }

    #[test]
    fn test_opus_rejects_short_window() {
        let (mut enc, _dec) = create_codec(CodecOffer::new(CodecType::Opus, 24_000)).unwrap();
        assert!(enc.encode(&[0i16; 100]).is_err());
    }

    #[test]
    fn test_codec2_roundtrip_window() {
        let (mut enc, mut dec) = create_codec(CodecOffer::new(CodecType::Codec2, 3_200)).unwrap();
        let frame = enc.frame_size();
        assert_eq!(enc.sample_rate(), 8_000);

        let pcm = vec![0i16; frame];
        let encoded = enc.encode(&pcm).unwrap();
        assert!(!encoded.is_empty());

        let decoded = dec.decode(&encoded).unwrap();
        assert_eq!(decoded.len(), frame);
    }

    #[test]
    fn test_codec2_unknown_mode() {
        assert!(matches!(
            Codec2Codec::new(9_999),
            Err(CodecError::UnsupportedMode(9_999))
        ));
    }
}
