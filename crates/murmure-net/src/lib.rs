// Transport seam for the call engine.
//
// The mesh transport itself is an external collaborator; this crate carries
// only the capability traits the engine consumes, plus an in-memory mock
// implementation used by the test suites.

pub mod mock;
pub mod transport;

pub use mock::{MockNetwork, MockTransport};
pub use transport::{
    Announce, AnnounceCallback, IncomingLinkCallback, Link, LinkEvent, LinkEventCallback,
    LinkState, NetError, PacketCallback, Transport,
};
