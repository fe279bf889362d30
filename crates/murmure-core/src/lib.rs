pub mod admission;
pub mod clock;
pub mod directory;
pub mod engine;
pub mod events;
pub mod ratelimit;
pub mod state;

pub use admission::AdmissionDecision;
pub use clock::{Clock, ManualClock, SystemClock};
pub use directory::PeerDirectory;
pub use engine::{CallEngine, EngineConfig, EngineError};
pub use events::CoreEvent;
pub use ratelimit::RateLimiter;
pub use state::{CallInfo, CallPhase, CallStateMachine, InvalidTransition};
