use std::sync::Arc;

use thiserror::Error;

use murmure_shared::destination::DestinationHash;
use murmure_shared::types::NodeId;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Identity {0} is already registered on this transport")]
    AlreadyRegistered(NodeId),

    #[error("Transport send failed: {0}")]
    SendFailed(String),

    #[error("No route to destination {0}")]
    NoRoute(DestinationHash),

    #[error("Link is not established")]
    LinkNotEstablished,

    #[error("Transport is shut down")]
    ShutDown,
}

/// A received transport announce: the announced destination, the announcer's
/// serialised public key, and the application data blob.
#[derive(Debug, Clone)]
pub struct Announce {
    pub destination: DestinationHash,
    pub public_key: [u8; 32],
    pub app_data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Pending,
    Established,
    Closed,
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    Established,
    Packet(Vec<u8>),
    Closed,
}

pub type PacketCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;
pub type AnnounceCallback = Arc<dyn Fn(Announce) + Send + Sync>;
pub type LinkEventCallback = Arc<dyn Fn(LinkEvent) + Send + Sync>;
pub type IncomingLinkCallback = Arc<dyn Fn(Arc<dyn Link>) + Send + Sync>;

/// One end of a transport-provided bidirectional encrypted stream.
///
/// Callbacks may fire on transport threads; implementations serialise events
/// per link. `link_id` is the per-session key-material identifier both ends
/// agree on once the link is established.
pub trait Link: Send + Sync {
    fn send(&self, payload: &[u8]) -> Result<(), NetError>;
    fn state(&self) -> LinkState;
    fn link_id(&self) -> Option<Vec<u8>>;
    fn set_event_callback(&self, callback: LinkEventCallback);
    fn close(&self);
}

/// The transport capability set the call engine consumes.
///
/// Destinations are always reconstructed from a peer's public key, so every
/// send carries the key material needed to encrypt. `send_packet` may block
/// briefly on the transport's internal queue but is treated as non-blocking;
/// a reported failure is surfaced, never retried here.
pub trait Transport: Send + Sync {
    /// Send an encrypted datagram to the destination derived from
    /// `public_key` under `aspect`.
    fn send_packet(&self, public_key: &[u8; 32], aspect: &str, payload: &[u8])
        -> Result<(), NetError>;

    /// Register the handler for packets arriving at the local destination
    /// under `aspect`.
    fn register_packet_callback(&self, aspect: &str, callback: PacketCallback);

    /// Register the handler invoked for every received announce.
    fn register_announce_handler(&self, callback: AnnounceCallback);

    /// Broadcast an announce for the local destination under `aspect`.
    fn announce(&self, aspect: &str, app_data: &[u8]) -> Result<(), NetError>;

    /// Open an outbound link to the destination derived from `public_key`
    /// under `aspect`. The returned link starts in [`LinkState::Pending`];
    /// establishment is reported through the link's event callback.
    fn open_link(&self, public_key: &[u8; 32], aspect: &str) -> Result<Arc<dyn Link>, NetError>;

    /// Register the handler for inbound links on the local destination under
    /// `aspect`.
    fn accept_links(&self, aspect: &str, callback: IncomingLinkCallback);
}
