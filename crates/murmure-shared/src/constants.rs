/// Application name carried in announces and destination derivation
pub const APP_NAME: &str = "lxst_phone";

/// Destination aspect for call signaling packets
pub const ASPECT_CALL: &str = "call";

/// Destination aspect for per-call media links
pub const ASPECT_MEDIA: &str = "media";

/// Node ID / destination hash size in bytes (SHA-256)
pub const HASH_SIZE: usize = 32;

/// Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Transport MTU for encrypted signaling packets
pub const MAX_PACKET_SIZE: usize = 500;

/// JSON payload budget: MTU minus the transport's encryption overhead
pub const MAX_SIGNALING_PAYLOAD: usize = 436;

/// Seconds an outgoing invite waits for any reply before giving up
pub const INVITE_TIMEOUT_SECS: u64 = 30;

/// Seconds a pending media link may take to establish
pub const LINK_TIMEOUT_SECS: u64 = 10;

/// Default incoming-call rate limits per peer
pub const MAX_CALLS_PER_MINUTE: u32 = 5;
pub const MAX_CALLS_PER_HOUR: u32 = 20;

/// Default presence announce period in minutes
pub const DEFAULT_ANNOUNCE_PERIOD_MIN: u64 = 5;

/// Opus defaults: 48 kHz mono, 20 ms frames
pub const OPUS_SAMPLE_RATE: u32 = 48_000;
pub const OPUS_FRAME_MS: u32 = 20;
pub const OPUS_DEFAULT_BITRATE: u32 = 24_000;

/// Codec2 runs at 8 kHz mono with 40 ms frames; the mode value is the bitrate
pub const CODEC2_SAMPLE_RATE: u32 = 8_000;
pub const CODEC2_FRAME_MS: u32 = 40;
pub const CODEC2_DEFAULT_MODE: u32 = 3_200;

/// Default jitter buffer target delay
pub const DEFAULT_TARGET_JITTER_MS: u32 = 60;

/// Key derivation context for call-history encryption (BLAKE3)
pub const KDF_CONTEXT_HISTORY_KEY: &str = "murmure-history-key-v1";
