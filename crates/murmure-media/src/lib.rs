pub mod audio;
pub mod codec;
pub mod framer;
pub mod jitter;
pub mod metrics;
pub mod session;

pub use codec::{create_codec, CodecError, Decoder, Encoder};
pub use jitter::{JitterBuffer, JitterStats};
pub use metrics::{CallMetrics, ConnectionQuality};
pub use session::{MediaSession, MediaSessionConfig, SecurityInfo, SessionEvent};
