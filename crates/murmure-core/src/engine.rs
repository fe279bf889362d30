//! The call engine: signaling wiring, admission, media session lifecycle.
//!
//! One engine per process. It owns the peer directory, rate limiter, state
//! machine, call history and the active media session, and translates
//! transport callbacks into state-machine events. UI-facing notifications
//! leave over an mpsc channel; the engine never calls UI code directly.
//!
//! Lock order is `directory` -> `core` -> `history`, and nothing is ever
//! sent over the transport while a lock is held: handlers decide under the
//! lock, release, then transmit.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use murmure_media::codec::CodecError;
use murmure_media::metrics::CallMetrics;
use murmure_media::session::{MediaSession, MediaSessionConfig, SecurityInfo, SessionEvent};
use murmure_net::{Link, NetError, Transport};
use murmure_shared::constants::{ASPECT_CALL, ASPECT_MEDIA, INVITE_TIMEOUT_SECS};
use murmure_shared::destination::{derive_destination, DestinationHash};
use murmure_shared::error::SignalError;
use murmure_shared::identity::Identity;
use murmure_shared::protocol::{
    self, negotiate_codec, AnnounceAppData, CallMessage, CodecOffer, MessageType,
};
use murmure_shared::types::{CallDirection, CallId, CallOutcome, NodeId};
use murmure_store::{CallHistory, HistoryRecord, PeerRecord, PeersStore};

use crate::admission::{admit_invite, AdmissionDecision};
use crate::clock::Clock;
use crate::directory::{PeerDirectory, ResolvedPeer};
use crate::events::CoreEvent;
use crate::ratelimit::RateLimiter;
use crate::state::{CallInfo, CallPhase, CallStateMachine, InvalidTransition};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Peer {0} has not announced")]
    UnknownPeer(NodeId),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error("Transport error: {0}")]
    Net(#[from] NetError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("No active call")]
    NoActiveCall,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub display_name: Option<String>,
    pub codec: CodecOffer,
    pub target_jitter_ms: u32,
    pub audio_enabled: bool,
    pub input_device: Option<usize>,
    pub output_device: Option<usize>,
    pub max_calls_per_minute: u32,
    pub max_calls_per_hour: u32,
    /// Record busy-rejected invites in the call history.
    pub record_busy: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        use murmure_shared::constants::*;
        use murmure_shared::types::CodecType;
        Self {
            display_name: None,
            codec: CodecOffer::new(CodecType::Opus, OPUS_DEFAULT_BITRATE),
            target_jitter_ms: DEFAULT_TARGET_JITTER_MS,
            audio_enabled: true,
            input_device: None,
            output_device: None,
            max_calls_per_minute: MAX_CALLS_PER_MINUTE,
            max_calls_per_hour: MAX_CALLS_PER_HOUR,
            record_busy: false,
        }
    }
}

/// State guarded by the coarse per-call mutex.
struct CallCore {
    machine: CallStateMachine,
    limiter: RateLimiter,
    session: Option<Arc<MediaSession>>,
}

struct EngineInner {
    /// Handle to ourselves for timer and forwarder tasks.
    self_weak: Weak<EngineInner>,
    identity: Identity,
    local_node: NodeId,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    directory: Mutex<PeerDirectory>,
    core: Mutex<CallCore>,
    history: Mutex<CallHistory>,
    events: mpsc::UnboundedSender<CoreEvent>,
    runtime: tokio::runtime::Handle,
}

pub struct CallEngine {
    inner: Arc<EngineInner>,
}

impl CallEngine {
    /// Wire the engine into the transport and hand back the UI event
    /// stream. Must be called from within a tokio runtime.
    pub fn start(
        identity: Identity,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
        peers: PeersStore,
        history: CallHistory,
    ) -> (Self, mpsc::UnboundedReceiver<CoreEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let local_node = identity.node_id();

        let mut machine = CallStateMachine::new();
        let observer_tx = events_tx.clone();
        machine.set_observer(Box::new(move |phase, call| {
            let _ = observer_tx.send(CoreEvent::PhaseChanged {
                phase,
                call: call.cloned(),
            });
        }));

        let limiter = RateLimiter::new(
            clock.clone(),
            config.max_calls_per_minute,
            config.max_calls_per_hour,
        );

        let inner = Arc::new_cyclic(|self_weak| EngineInner {
            self_weak: self_weak.clone(),
            identity,
            local_node,
            transport: transport.clone(),
            clock: clock.clone(),
            config,
            directory: Mutex::new(PeerDirectory::new(peers, local_node, clock)),
            core: Mutex::new(CallCore {
                machine,
                limiter,
                session: None,
            }),
            history: Mutex::new(history),
            events: events_tx,
            runtime: tokio::runtime::Handle::current(),
        });

        // Transport callbacks hold weak references; the transport outlives
        // nothing here, so a cycle would never drop.
        let weak = Arc::downgrade(&inner);
        transport.register_packet_callback(
            ASPECT_CALL,
            Arc::new({
                let weak = weak.clone();
                move |payload| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_signaling_packet(&payload);
                    }
                }
            }),
        );
        transport.register_announce_handler(Arc::new({
            let weak = weak.clone();
            move |announce| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_announce(&announce);
                }
            }
        }));
        transport.accept_links(
            ASPECT_MEDIA,
            Arc::new(move |link| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_incoming_link(link);
                }
            }),
        );

        // Rate limiter cleanup every 5 min, evicting peers idle for an hour
        let purge = inner.self_weak.clone();
        inner.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(300));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = purge.upgrade() else { break };
                inner.core.lock().unwrap().limiter.purge_stale();
            }
        });

        info!(node_id = %local_node, "Call engine started");
        (Self { inner }, events_rx)
    }

    // -----------------------------------------------------------------------
    // UI operations
    // -----------------------------------------------------------------------

    /// Dial a peer. Fails before anything is transmitted if the peer has
    /// never announced or the invite cannot be encoded within budget.
    pub fn start_call(&self, remote: NodeId) -> Result<CallId, EngineError> {
        self.inner.start_call(remote)
    }

    /// Accept the pending incoming call.
    pub fn accept_call(&self) -> Result<(), EngineError> {
        self.inner.accept_call()
    }

    /// Reject the pending incoming call.
    pub fn reject_call(&self) -> Result<(), EngineError> {
        self.inner.reject_call()
    }

    /// End the current call (or cancel an unanswered outgoing one).
    pub fn hangup(&self) -> Result<(), EngineError> {
        self.inner.hangup()
    }

    /// Broadcast a presence announce for our call destination.
    pub fn announce_presence(&self) -> Result<(), EngineError> {
        self.inner.announce_presence()
    }

    /// User confirmed the SAS codes match; persists peer verification.
    pub fn confirm_sas_match(&self) -> Result<(), EngineError> {
        self.inner.confirm_sas_match()
    }

    /// User reported mismatching SAS codes. Verification state is left
    /// untouched; a security warning is raised so the UI can offer hangup.
    pub fn report_sas_mismatch(&self) -> Result<(), EngineError> {
        self.inner.report_sas_mismatch()
    }

    pub fn set_muted(&self, muted: bool) {
        if let Some(session) = self.inner.current_session() {
            session.set_muted(muted);
        }
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn local_node_id(&self) -> NodeId {
        self.inner.local_node
    }

    /// Base64 public key, the value peers see in our announces.
    pub fn local_public_key_base64(&self) -> String {
        self.inner.identity.public_key_base64()
    }

    pub fn phase(&self) -> CallPhase {
        self.inner.core.lock().unwrap().machine.phase()
    }

    pub fn current_call(&self) -> Option<CallInfo> {
        self.inner.core.lock().unwrap().machine.current_call().cloned()
    }

    pub fn call_metrics(&self) -> Option<CallMetrics> {
        self.inner.current_session().map(|s| s.metrics())
    }

    pub fn security_info(&self) -> Option<SecurityInfo> {
        self.inner.current_session().map(|s| s.security_info())
    }

    // -----------------------------------------------------------------------
    // Peer management
    // -----------------------------------------------------------------------

    pub fn list_peers(&self) -> Vec<PeerRecord> {
        self.inner.directory.lock().unwrap().list()
    }

    pub fn block_peer(&self, node_id: &NodeId) -> bool {
        self.inner
            .directory
            .lock()
            .unwrap()
            .set_blocked(node_id, true)
    }

    pub fn unblock_peer(&self, node_id: &NodeId) -> bool {
        let unblocked = self
            .inner
            .directory
            .lock()
            .unwrap()
            .set_blocked(node_id, false);
        if unblocked {
            self.inner.core.lock().unwrap().limiter.reset_peer(node_id);
        }
        unblocked
    }

    pub fn remove_peer(&self, node_id: &NodeId) -> bool {
        self.inner.directory.lock().unwrap().remove(node_id)
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    pub fn recent_calls(&self, limit: usize) -> Vec<HistoryRecord> {
        self.inner.history.lock().unwrap().recent(limit)
    }

    pub fn calls_with_peer(&self, peer: &NodeId, limit: usize) -> Vec<HistoryRecord> {
        self.inner.history.lock().unwrap().for_peer(peer, limit)
    }

    pub fn history_statistics(&self) -> murmure_store::history::HistoryStatistics {
        self.inner.history.lock().unwrap().statistics()
    }
}

impl EngineInner {
    fn local_media_dest(&self) -> DestinationHash {
        derive_destination(&self.local_node, ASPECT_MEDIA)
    }

    fn current_session(&self) -> Option<Arc<MediaSession>> {
        self.core.lock().unwrap().session.clone()
    }

    fn resolve(&self, node_id: &NodeId) -> Option<ResolvedPeer> {
        self.directory.lock().unwrap().resolve(node_id)
    }

    fn send_signal(&self, public_key: &[u8; 32], msg: &CallMessage) -> Result<(), EngineError> {
        let payload = msg.encode()?;
        self.transport
            .send_packet(public_key, ASPECT_CALL, &payload)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // UI operations
    // -----------------------------------------------------------------------

    fn start_call(&self, remote: NodeId) -> Result<CallId, EngineError> {
        let peer = self
            .resolve(&remote)
            .ok_or(EngineError::UnknownPeer(remote))?;

        let call_id = CallId::new();
        // Built before any state change so an oversize message can never
        // leave a half-started call behind.
        let invite = protocol::build_invite(
            self.local_node,
            remote,
            call_id,
            self.local_media_dest(),
            self.config.codec.codec,
            self.config.codec.bitrate,
            self.config.display_name.clone(),
        )?;

        self.core.lock().unwrap().machine.start_outgoing(
            self.local_node,
            remote,
            peer.display_name.clone(),
            Some(call_id),
            self.clock.wall_now(),
        )?;

        info!(remote = %remote.short(), %call_id, "Starting outgoing call");
        if let Err(err) = self.send_signal(&peer.public_key, &invite) {
            warn!(error = %err, "Failed to send invite");
            let _ = self
                .core
                .lock()
                .unwrap()
                .machine
                .transport_failed(call_id);
            self.finish_call();
            return Err(err);
        }

        // Invite timeout: give up if no reply arrives
        let weak = self.self_weak.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(Duration::from_secs(INVITE_TIMEOUT_SECS)).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_invite_timeout(call_id);
            }
        });

        Ok(call_id)
    }

    fn accept_call(&self) -> Result<(), EngineError> {
        let (call_id, remote, negotiated) = {
            let core = self.core.lock().unwrap();
            let call = core
                .machine
                .current_call()
                .filter(|_| core.machine.phase() == CallPhase::IncomingCall)
                .ok_or(EngineError::NoActiveCall)?;
            let negotiated = call.negotiated_codec.ok_or(EngineError::NoActiveCall)?;
            (call.call_id, call.remote_id, negotiated)
        };
        let peer = self
            .resolve(&remote)
            .ok_or(EngineError::UnknownPeer(remote))?;

        let accept = protocol::build_accept(
            self.local_node,
            remote,
            call_id,
            self.local_media_dest(),
            negotiated.codec,
            negotiated.bitrate,
        )?;

        self.core
            .lock()
            .unwrap()
            .machine
            .accept_local(negotiated, self.clock.wall_now())?;

        info!(remote = %remote.short(), codec = %negotiated.codec, "Accepted incoming call");
        if let Err(err) = self.send_signal(&peer.public_key, &accept) {
            warn!(error = %err, "Failed to send accept");
            let _ = self
                .core
                .lock()
                .unwrap()
                .machine
                .transport_failed(call_id);
            self.finish_call();
            return Err(err);
        }
        // The media session starts when the caller's link arrives.
        Ok(())
    }

    fn reject_call(&self) -> Result<(), EngineError> {
        let (call_id, remote) = {
            let core = self.core.lock().unwrap();
            let call = core
                .machine
                .current_call()
                .filter(|_| core.machine.phase() == CallPhase::IncomingCall)
                .ok_or(EngineError::NoActiveCall)?;
            (call.call_id, call.remote_id)
        };
        self.core.lock().unwrap().machine.reject_local()?;

        if let Some(peer) = self.resolve(&remote) {
            let reject = protocol::build_reject(self.local_node, remote, call_id);
            if let Err(err) = self.send_signal(&peer.public_key, &reject) {
                warn!(error = %err, "Failed to send reject");
            }
        }
        self.finish_call();
        Ok(())
    }

    fn hangup(&self) -> Result<(), EngineError> {
        let (call_id, remote) = {
            let core = self.core.lock().unwrap();
            let call = core.machine.current_call().ok_or(EngineError::NoActiveCall)?;
            (call.call_id, call.remote_id)
        };
        self.core.lock().unwrap().machine.local_hangup()?;

        if let Some(peer) = self.resolve(&remote) {
            let end = protocol::build_end(self.local_node, remote, call_id);
            if let Err(err) = self.send_signal(&peer.public_key, &end) {
                warn!(error = %err, "Failed to send end");
            }
        }
        self.finish_call();
        Ok(())
    }

    fn announce_presence(&self) -> Result<(), EngineError> {
        let app_data = AnnounceAppData::new(self.config.display_name.clone()).encode()?;
        self.transport.announce(ASPECT_CALL, &app_data)?;
        debug!("Broadcast presence announce");
        Ok(())
    }

    fn confirm_sas_match(&self) -> Result<(), EngineError> {
        let (remote, session) = {
            let core = self.core.lock().unwrap();
            let call = core.machine.current_call().ok_or(EngineError::NoActiveCall)?;
            (call.remote_id, core.session.clone())
        };
        let session = session.ok_or(EngineError::NoActiveCall)?;
        session.mark_sas_verified();
        self.directory.lock().unwrap().mark_verified(&remote);
        info!(remote = %remote.short(), "SAS verified, peer marked trusted");
        Ok(())
    }

    fn report_sas_mismatch(&self) -> Result<(), EngineError> {
        let call_id = {
            let core = self.core.lock().unwrap();
            core.machine
                .current_call()
                .map(|c| c.call_id)
                .ok_or(EngineError::NoActiveCall)?
        };
        warn!(%call_id, "SAS mismatch reported");
        let _ = self.events.send(CoreEvent::SecurityWarning {
            call_id,
            message: "Verification codes do not match; the call may be intercepted. \
                      Consider hanging up."
                .to_string(),
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transport callbacks
    // -----------------------------------------------------------------------

    fn on_signaling_packet(&self, payload: &[u8]) {
        let msg = match CallMessage::decode(payload) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(error = %err, len = payload.len(), "Dropping malformed signaling packet");
                return;
            }
        };
        debug!(
            msg_type = ?msg.msg_type,
            from = %msg.from.short(),
            call_id = %msg.call_id,
            "Signaling packet"
        );

        match msg.msg_type {
            MessageType::Invite => self.on_invite(msg),
            MessageType::Ringing => {
                let result = self
                    .core
                    .lock()
                    .unwrap()
                    .machine
                    .remote_ringing(msg.call_id);
                if let Err(err) = result {
                    info!(error = %err, "Ignoring ringing");
                }
            }
            MessageType::Accept => self.on_accept(msg),
            MessageType::Reject => {
                let result = self
                    .core
                    .lock()
                    .unwrap()
                    .machine
                    .remote_rejected(msg.call_id);
                match result {
                    Ok(()) => self.finish_call(),
                    Err(err) => info!(error = %err, "Ignoring reject"),
                }
            }
            MessageType::End => {
                let result = self.core.lock().unwrap().machine.remote_ended(msg.call_id);
                match result {
                    Ok(()) => self.finish_call(),
                    Err(err) => info!(error = %err, "Ignoring end"),
                }
            }
            MessageType::PresenceAnnounce => {
                debug!("Ignoring presence message on signaling destination");
            }
        }
    }

    fn on_invite(&self, msg: CallMessage) {
        let from = msg.from;
        let decision = {
            let directory = self.directory.lock().unwrap();
            let mut core = self.core.lock().unwrap();
            let phase = core.machine.phase();
            admit_invite(&directory, &mut core.limiter, phase, &from)
        };

        if decision != AdmissionDecision::Allow {
            info!(
                from = %from.short(),
                decision = decision.as_str(),
                "Refusing invite"
            );
            self.refuse_invite(&msg, decision);
            return;
        }

        // decode() enforced these for invites
        let (Some(call_dest), Some(codec_type), Some(codec_bitrate)) =
            (msg.call_dest, msg.codec_type, msg.codec_bitrate)
        else {
            return;
        };
        let negotiated = negotiate_codec(
            self.config.codec,
            Some(CodecOffer::new(codec_type, codec_bitrate)),
        );

        let call = CallInfo {
            call_id: msg.call_id,
            local_id: self.local_node,
            remote_id: from,
            display_name: msg.display_name.clone(),
            initiated_by_local: false,
            remote_call_dest: Some(call_dest),
            negotiated_codec: Some(negotiated),
            start_ts: self.clock.wall_now(),
            connected_ts: None,
            outcome: None,
        };

        if let Err(err) = self.core.lock().unwrap().machine.incoming_invite(call.clone()) {
            info!(error = %err, "Ignoring invite");
            return;
        }

        if let Some(peer) = self.resolve(&from) {
            let ringing = protocol::build_ringing(self.local_node, from, msg.call_id);
            if let Err(err) = self.send_signal(&peer.public_key, &ringing) {
                warn!(error = %err, "Failed to send ringing");
                let _ = self.events.send(CoreEvent::TransportError {
                    message: format!("Could not signal ringing: {err}"),
                });
            }
        }

        info!(from = %from.short(), call_id = %msg.call_id, "Incoming call");
        let _ = self.events.send(CoreEvent::IncomingCall { call });
    }

    fn refuse_invite(&self, msg: &CallMessage, decision: AdmissionDecision) {
        match decision {
            AdmissionDecision::RejectUnknown => {
                // No public key for the sender, so no reply can be
                // encrypted. Graceful degradation: log and drop.
                warn!(from = %msg.from.short(), "Invite from unannounced peer dropped");
            }
            AdmissionDecision::RejectBlocked
            | AdmissionDecision::RejectRateLimited
            | AdmissionDecision::RejectBusy => {
                if let Some(peer) = self.resolve(&msg.from) {
                    let reject = protocol::build_reject(self.local_node, msg.from, msg.call_id);
                    if let Err(err) = self.send_signal(&peer.public_key, &reject) {
                        warn!(error = %err, "Failed to send reject");
                    }
                }
                if decision == AdmissionDecision::RejectBusy && self.config.record_busy {
                    self.history.lock().unwrap().append(HistoryRecord {
                        call_id: msg.call_id,
                        remote_id: msg.from,
                        display_name: msg.display_name.clone().unwrap_or_default(),
                        direction: CallDirection::Incoming,
                        outcome: CallOutcome::Missed,
                        duration_s: 0,
                        start_ts: self.clock.wall_now(),
                    });
                }
            }
            AdmissionDecision::Allow => unreachable!("allow is not a refusal"),
        }
    }

    fn on_accept(&self, msg: CallMessage) {
        let (Some(call_dest), Some(codec_type), Some(codec_bitrate)) =
            (msg.call_dest, msg.codec_type, msg.codec_bitrate)
        else {
            return;
        };
        // ACCEPT carries the negotiated values; the initiator adopts them.
        let negotiated = CodecOffer::new(codec_type, codec_bitrate);

        {
            let mut core = self.core.lock().unwrap();
            let result = core.machine.remote_accepted(
                msg.call_id,
                negotiated,
                call_dest,
                self.clock.wall_now(),
            );
            match result {
                Ok(()) if core.machine.phase() == CallPhase::InCall => {}
                Ok(()) => return, // call id mismatch, ignored
                Err(err) => {
                    info!(error = %err, "Ignoring accept");
                    return;
                }
            }
        }

        info!(call_id = %msg.call_id, codec = %negotiated.codec, "Call accepted, opening media link");
        let Some(peer) = self.resolve(&msg.from) else {
            warn!("Accepted call from unknown peer");
            return;
        };
        match self.transport.open_link(&peer.public_key, ASPECT_MEDIA) {
            Ok(link) => self.start_session(msg.call_id, link),
            Err(err) => {
                warn!(error = %err, "Failed to open media link");
                let _ = self
                    .core
                    .lock()
                    .unwrap()
                    .machine
                    .transport_failed(msg.call_id);
                self.finish_call();
            }
        }
    }

    fn on_announce(&self, announce: &murmure_net::Announce) {
        let node_id = self.directory.lock().unwrap().handle_announce(announce);
        if let Some(node_id) = node_id {
            let display_name = self
                .resolve(&node_id)
                .and_then(|peer| peer.display_name);
            let _ = self.events.send(CoreEvent::PeerDiscovered {
                node_id,
                display_name,
            });
        }
    }

    fn on_incoming_link(&self, link: Arc<dyn Link>) {
        let accepted = {
            let core = self.core.lock().unwrap();
            match core.machine.current_call() {
                Some(call)
                    if core.machine.phase() == CallPhase::InCall
                        && !call.initiated_by_local
                        && core.session.is_none() =>
                {
                    Some(call.call_id)
                }
                _ => None,
            }
        };
        match accepted {
            Some(call_id) => {
                debug!(%call_id, "Inbound media link for accepted call");
                self.start_session(call_id, link);
            }
            None => {
                warn!("Closing unexpected inbound media link");
                link.close();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Media session lifecycle
    // -----------------------------------------------------------------------

    fn start_session(&self, call_id: CallId, link: Arc<dyn Link>) {
        let (negotiated, remote) = {
            let core = self.core.lock().unwrap();
            match core.machine.current_call() {
                Some(call) if call.call_id == call_id => (
                    call.negotiated_codec.unwrap_or(self.config.codec),
                    call.remote_id,
                ),
                _ => {
                    link.close();
                    return;
                }
            }
        };

        let (session_tx, mut session_rx) = mpsc::unbounded_channel();
        let session_config = MediaSessionConfig {
            codec: negotiated,
            target_jitter_ms: self.config.target_jitter_ms,
            audio_enabled: self.config.audio_enabled,
            input_device: self.config.input_device,
            output_device: self.config.output_device,
            local_node: self.local_node,
            remote_node: remote,
        };

        match MediaSession::start(link, session_config, session_tx) {
            Ok(session) => {
                self.core.lock().unwrap().session = Some(session);
                let weak = self.self_weak.clone();
                self.runtime.spawn(async move {
                    while let Some(event) = session_rx.recv().await {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.on_session_event(call_id, event);
                    }
                });
            }
            Err(err) => {
                warn!(error = %err, "Codec initialisation failed, ending call");
                let remote_peer = self.resolve(&remote);
                let _ = self.core.lock().unwrap().machine.codec_failed(call_id);
                if let Some(peer) = remote_peer {
                    let end = protocol::build_end(self.local_node, remote, call_id);
                    let _ = self.send_signal(&peer.public_key, &end);
                }
                self.finish_call();
            }
        }
    }

    fn on_session_event(&self, call_id: CallId, event: SessionEvent) {
        match event {
            SessionEvent::Established { sas_code } => {
                let current = {
                    let core = self.core.lock().unwrap();
                    core.machine
                        .current_call()
                        .is_some_and(|c| c.call_id == call_id)
                };
                if current {
                    info!(%call_id, sas = %sas_code, "Call media established");
                    let _ = self
                        .events
                        .send(CoreEvent::CallEstablished { call_id, sas_code });
                }
            }
            SessionEvent::LinkFailed => {
                info!(%call_id, "Media link failed to establish");
                let _ = self.core.lock().unwrap().machine.link_failed(call_id);
                self.finish_call();
            }
            SessionEvent::Closed => {
                let result = self.core.lock().unwrap().machine.link_failed(call_id);
                if result.is_ok() {
                    info!(%call_id, "Media link closed unexpectedly");
                    self.finish_call();
                }
            }
        }
    }

    fn on_invite_timeout(&self, call_id: CallId) {
        let timed_out = {
            let mut core = self.core.lock().unwrap();
            match core.machine.phase() {
                CallPhase::OutgoingCall | CallPhase::Ringing => {
                    core.machine.invite_timeout(call_id).is_ok()
                        && core.machine.phase() == CallPhase::Ended
                }
                _ => false,
            }
        };
        if !timed_out {
            return;
        }

        info!(%call_id, "Invite timed out without a reply");
        let remote = {
            let core = self.core.lock().unwrap();
            core.machine.current_call().map(|c| c.remote_id)
        };
        if let Some(remote) = remote {
            if let Some(peer) = self.resolve(&remote) {
                let end = protocol::build_end(self.local_node, remote, call_id);
                if let Err(err) = self.send_signal(&peer.public_key, &end) {
                    warn!(error = %err, "Failed to send end after timeout");
                }
            }
        }
        self.finish_call();
    }

    /// Common tail for every path into `ENDED`: stop media, write the
    /// history record, return the machine to `IDLE`.
    fn finish_call(&self) {
        let (session, closed) = {
            let mut core = self.core.lock().unwrap();
            if core.machine.phase() != CallPhase::Ended {
                return;
            }
            let session = core.session.take();
            let closed = core.machine.finalize().ok();
            (session, closed)
        };

        if let Some(session) = session {
            session.stop();
        }

        let Some(call) = closed else { return };
        let outcome = call.outcome.unwrap_or(CallOutcome::Completed);
        let duration_s = call
            .connected_ts
            .map(|connected| {
                (self.clock.wall_now() - connected)
                    .num_seconds()
                    .max(0) as u64
            })
            .unwrap_or(0);

        self.history.lock().unwrap().append(HistoryRecord {
            call_id: call.call_id,
            remote_id: call.remote_id,
            display_name: call.display_name.clone().unwrap_or_default(),
            direction: if call.initiated_by_local {
                CallDirection::Outgoing
            } else {
                CallDirection::Incoming
            },
            outcome,
            duration_s,
            start_ts: call.start_ts,
        });

        let _ = self.events.send(CoreEvent::CallEnded {
            call_id: call.call_id,
            remote_id: call.remote_id,
            outcome,
        });
    }
}
