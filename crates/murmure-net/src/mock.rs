//! In-memory transport used by the test suites.
//!
//! A [`MockNetwork`] hub connects any number of [`MockTransport`] nodes.
//! Delivery is synchronous on the caller's thread; link events are buffered
//! until the consumer installs its event callback, matching the asynchronous
//! establishment contract of the real transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use murmure_shared::destination::{derive_destination, destination_for_public_key, DestinationHash};
use murmure_shared::identity::node_id_from_public_key;
use murmure_shared::types::NodeId;

use crate::transport::{
    Announce, AnnounceCallback, IncomingLinkCallback, Link, LinkEvent, LinkEventCallback,
    LinkState, NetError, PacketCallback, Transport,
};

#[derive(Default)]
struct NodeHooks {
    packet_callbacks: HashMap<String, PacketCallback>,
    announce_handler: Option<AnnounceCallback>,
    link_callbacks: HashMap<String, IncomingLinkCallback>,
}

#[derive(Default)]
struct NetworkInner {
    nodes: HashMap<NodeId, NodeHooks>,
    /// Links kept in `Pending` while `hold_links` is set.
    held: Vec<(Arc<MockLink>, Arc<MockLink>)>,
    hold_links: bool,
    fail_sends: bool,
    link_counter: u64,
}

/// Shared hub connecting mock transports.
#[derive(Default)]
pub struct MockNetwork {
    inner: Mutex<NetworkInner>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Keep future links in `Pending` until [`MockNetwork::release_links`].
    pub fn set_hold_links(&self, hold: bool) {
        self.inner.lock().unwrap().hold_links = hold;
    }

    /// Make every `send_packet` report a transport failure.
    pub fn set_fail_sends(&self, fail: bool) {
        self.inner.lock().unwrap().fail_sends = fail;
    }

    /// Establish all links held back by `set_hold_links`.
    pub fn release_links(&self) {
        let held = std::mem::take(&mut self.inner.lock().unwrap().held);
        for (a, b) in held {
            MockLink::establish_pair(&a, &b);
        }
    }

    fn next_link_id(&self) -> Vec<u8> {
        let mut inner = self.inner.lock().unwrap();
        inner.link_counter += 1;
        let mut id = vec![0u8; 8];
        id.extend_from_slice(&inner.link_counter.to_be_bytes());
        id
    }
}

/// One node's view of the mock network.
pub struct MockTransport {
    network: Arc<MockNetwork>,
    node_id: NodeId,
    public_key: [u8; 32],
}

impl MockTransport {
    /// Register this identity on the hub. Fails when the identity is
    /// already registered, the mesh equivalent of a bind failure.
    pub fn new(network: Arc<MockNetwork>, public_key: [u8; 32]) -> Result<Arc<Self>, NetError> {
        let node_id = node_id_from_public_key(&public_key);
        {
            let mut inner = network.inner.lock().unwrap();
            if inner.nodes.contains_key(&node_id) {
                return Err(NetError::AlreadyRegistered(node_id));
            }
            inner.nodes.insert(node_id, NodeHooks::default());
        }
        Ok(Arc::new(Self {
            network,
            node_id,
            public_key,
        }))
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn local_destination(&self, aspect: &str) -> DestinationHash {
        derive_destination(&self.node_id, aspect)
    }
}

impl Transport for MockTransport {
    fn send_packet(
        &self,
        public_key: &[u8; 32],
        aspect: &str,
        payload: &[u8],
    ) -> Result<(), NetError> {
        let target = node_id_from_public_key(public_key);
        let callback = {
            let inner = self.network.inner.lock().unwrap();
            if inner.fail_sends {
                return Err(NetError::SendFailed("mock send failure".to_string()));
            }
            inner
                .nodes
                .get(&target)
                .and_then(|hooks| hooks.packet_callbacks.get(aspect))
                .cloned()
        };
        match callback {
            Some(cb) => {
                cb(payload.to_vec());
                Ok(())
            }
            None => Err(NetError::NoRoute(destination_for_public_key(
                public_key, aspect,
            ))),
        }
    }

    fn register_packet_callback(&self, aspect: &str, callback: PacketCallback) {
        let mut inner = self.network.inner.lock().unwrap();
        inner
            .nodes
            .entry(self.node_id)
            .or_default()
            .packet_callbacks
            .insert(aspect.to_string(), callback);
    }

    fn register_announce_handler(&self, callback: AnnounceCallback) {
        let mut inner = self.network.inner.lock().unwrap();
        inner
            .nodes
            .entry(self.node_id)
            .or_default()
            .announce_handler = Some(callback);
    }

    fn announce(&self, aspect: &str, app_data: &[u8]) -> Result<(), NetError> {
        let announce = Announce {
            destination: derive_destination(&self.node_id, aspect),
            public_key: self.public_key,
            app_data: app_data.to_vec(),
        };
        let handlers: Vec<AnnounceCallback> = {
            let inner = self.network.inner.lock().unwrap();
            inner
                .nodes
                .iter()
                .filter(|(id, _)| **id != self.node_id)
                .filter_map(|(_, hooks)| hooks.announce_handler.clone())
                .collect()
        };
        for handler in handlers {
            handler(announce.clone());
        }
        Ok(())
    }

    fn open_link(&self, public_key: &[u8; 32], aspect: &str) -> Result<Arc<dyn Link>, NetError> {
        let target = node_id_from_public_key(public_key);
        let accept = {
            let inner = self.network.inner.lock().unwrap();
            inner
                .nodes
                .get(&target)
                .and_then(|hooks| hooks.link_callbacks.get(aspect))
                .cloned()
        };
        let Some(accept) = accept else {
            return Err(NetError::NoRoute(destination_for_public_key(
                public_key, aspect,
            )));
        };

        let link_id = self.network.next_link_id();
        let (local, remote) = MockLink::pair(link_id);

        accept(remote.clone());

        let hold = {
            let mut inner = self.network.inner.lock().unwrap();
            if inner.hold_links {
                inner.held.push((local.clone(), remote.clone()));
                true
            } else {
                false
            }
        };
        if !hold {
            MockLink::establish_pair(&local, &remote);
        }

        Ok(local)
    }

    fn accept_links(&self, aspect: &str, callback: IncomingLinkCallback) {
        let mut inner = self.network.inner.lock().unwrap();
        inner
            .nodes
            .entry(self.node_id)
            .or_default()
            .link_callbacks
            .insert(aspect.to_string(), callback);
    }
}

/// One end of a mock link. Events are queued until the consumer installs its
/// callback so no establishment races are possible.
pub struct MockLink {
    state: Mutex<LinkState>,
    link_id: Vec<u8>,
    callback: Mutex<Option<LinkEventCallback>>,
    pending: Mutex<Vec<LinkEvent>>,
    peer: Mutex<Weak<MockLink>>,
}

impl MockLink {
    fn pair(link_id: Vec<u8>) -> (Arc<Self>, Arc<Self>) {
        let make = || {
            Arc::new(Self {
                state: Mutex::new(LinkState::Pending),
                link_id: link_id.clone(),
                callback: Mutex::new(None),
                pending: Mutex::new(Vec::new()),
                peer: Mutex::new(Weak::new()),
            })
        };
        let a = make();
        let b = make();
        *a.peer.lock().unwrap() = Arc::downgrade(&b);
        *b.peer.lock().unwrap() = Arc::downgrade(&a);
        (a, b)
    }

    fn establish_pair(a: &Arc<Self>, b: &Arc<Self>) {
        for end in [a, b] {
            let mut state = end.state.lock().unwrap();
            if *state == LinkState::Pending {
                *state = LinkState::Established;
                drop(state);
                end.deliver(LinkEvent::Established);
            }
        }
    }

    fn deliver(&self, event: LinkEvent) {
        let callback = self.callback.lock().unwrap().clone();
        match callback {
            Some(cb) => cb(event),
            None => self.pending.lock().unwrap().push(event),
        }
    }
}

impl Link for MockLink {
    fn send(&self, payload: &[u8]) -> Result<(), NetError> {
        if *self.state.lock().unwrap() != LinkState::Established {
            return Err(NetError::LinkNotEstablished);
        }
        if let Some(peer) = self.peer.lock().unwrap().upgrade() {
            peer.deliver(LinkEvent::Packet(payload.to_vec()));
            Ok(())
        } else {
            Err(NetError::LinkNotEstablished)
        }
    }

    fn state(&self) -> LinkState {
        *self.state.lock().unwrap()
    }

    fn link_id(&self) -> Option<Vec<u8>> {
        match *self.state.lock().unwrap() {
            LinkState::Established => Some(self.link_id.clone()),
            _ => None,
        }
    }

    fn set_event_callback(&self, callback: LinkEventCallback) {
        let queued = {
            let mut cb = self.callback.lock().unwrap();
            *cb = Some(callback.clone());
            std::mem::take(&mut *self.pending.lock().unwrap())
        };
        for event in queued {
            callback(event);
        }
    }

    fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == LinkState::Closed {
                return;
            }
            *state = LinkState::Closed;
        }
        self.deliver(LinkEvent::Closed);
        if let Some(peer) = self.peer.lock().unwrap().upgrade() {
            peer.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmure_shared::constants::{ASPECT_CALL, ASPECT_MEDIA};
    use murmure_shared::identity::Identity;

    fn node(network: &Arc<MockNetwork>) -> (Identity, Arc<MockTransport>) {
        let id = Identity::generate();
        let transport = MockTransport::new(network.clone(), id.public_key_bytes()).unwrap();
        (id, transport)
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let network = MockNetwork::new();
        let id = Identity::generate();
        let _first = MockTransport::new(network.clone(), id.public_key_bytes()).unwrap();
        assert!(matches!(
            MockTransport::new(network.clone(), id.public_key_bytes()),
            Err(NetError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_packet_delivery() {
        let network = MockNetwork::new();
        let (_a_id, a) = node(&network);
        let (b_id, b) = node(&network);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        b.register_packet_callback(
            ASPECT_CALL,
            Arc::new(move |payload| sink.lock().unwrap().push(payload)),
        );

        a.send_packet(&b_id.public_key_bytes(), ASPECT_CALL, b"hello")
            .unwrap();
        assert_eq!(received.lock().unwrap().as_slice(), &[b"hello".to_vec()]);
    }

    #[test]
    fn test_unroutable_packet_errors() {
        let network = MockNetwork::new();
        let (_a_id, a) = node(&network);
        let stranger = Identity::generate();
        assert!(matches!(
            a.send_packet(&stranger.public_key_bytes(), ASPECT_CALL, b"x"),
            Err(NetError::NoRoute(_))
        ));
    }

    #[test]
    fn test_announce_reaches_other_nodes_only() {
        let network = MockNetwork::new();
        let (_a_id, a) = node(&network);
        let (_b_id, b) = node(&network);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        b.register_announce_handler(Arc::new(move |ann| sink.lock().unwrap().push(ann)));

        let own = Arc::new(Mutex::new(0usize));
        let own_sink = own.clone();
        a.register_announce_handler(Arc::new(move |_| *own_sink.lock().unwrap() += 1));

        a.announce(ASPECT_CALL, b"{}").unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(*own.lock().unwrap(), 0);
        assert_eq!(
            seen.lock().unwrap()[0].destination,
            a.local_destination(ASPECT_CALL)
        );
    }

    #[test]
    fn test_link_roundtrip_and_shared_id() {
        let network = MockNetwork::new();
        let (_a_id, a) = node(&network);
        let (b_id, b) = node(&network);

        let inbound: Arc<Mutex<Option<Arc<dyn Link>>>> = Arc::new(Mutex::new(None));
        let inbound_sink = inbound.clone();
        b.accept_links(
            ASPECT_MEDIA,
            Arc::new(move |link| *inbound_sink.lock().unwrap() = Some(link)),
        );

        let link = a.open_link(&b_id.public_key_bytes(), ASPECT_MEDIA).unwrap();
        let remote = inbound.lock().unwrap().clone().unwrap();

        assert_eq!(link.state(), LinkState::Established);
        assert_eq!(remote.state(), LinkState::Established);
        assert_eq!(link.link_id(), remote.link_id());

        let got = Arc::new(Mutex::new(Vec::new()));
        let got_sink = got.clone();
        remote.set_event_callback(Arc::new(move |event| {
            if let LinkEvent::Packet(payload) = event {
                got_sink.lock().unwrap().push(payload);
            }
        }));

        link.send(b"frame").unwrap();
        assert_eq!(got.lock().unwrap().as_slice(), &[b"frame".to_vec()]);
    }

    #[test]
    fn test_held_links_stay_pending() {
        let network = MockNetwork::new();
        let (_a_id, a) = node(&network);
        let (b_id, b) = node(&network);
        b.accept_links(ASPECT_MEDIA, Arc::new(|_| {}));

        network.set_hold_links(true);
        let link = a.open_link(&b_id.public_key_bytes(), ASPECT_MEDIA).unwrap();
        assert_eq!(link.state(), LinkState::Pending);
        assert!(link.link_id().is_none());
        assert!(link.send(b"x").is_err());

        network.release_links();
        assert_eq!(link.state(), LinkState::Established);
    }

    #[test]
    fn test_close_propagates() {
        let network = MockNetwork::new();
        let (_a_id, a) = node(&network);
        let (b_id, b) = node(&network);

        let inbound: Arc<Mutex<Option<Arc<dyn Link>>>> = Arc::new(Mutex::new(None));
        let inbound_sink = inbound.clone();
        b.accept_links(
            ASPECT_MEDIA,
            Arc::new(move |link| *inbound_sink.lock().unwrap() = Some(link)),
        );

        let link = a.open_link(&b_id.public_key_bytes(), ASPECT_MEDIA).unwrap();
        let remote = inbound.lock().unwrap().clone().unwrap();

        link.close();
        assert_eq!(link.state(), LinkState::Closed);
        assert_eq!(remote.state(), LinkState::Closed);
    }
}
