pub mod constants;
pub mod destination;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod sas;
pub mod types;

pub use error::{IdentityError, SignalError};
pub use types::{CallId, CodecType, NodeId};
