//! End-to-end engine tests over the in-memory transport.
//!
//! Each node is a full engine (directory, limiter, state machine, history)
//! wired to a shared mock network; tests drive calls exactly as a UI would
//! and observe the event streams of both sides.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use murmure_core::{
    CallEngine, CallPhase, CoreEvent, EngineConfig, EngineError, ManualClock,
};
use murmure_net::{MockNetwork, MockTransport, Transport};
use murmure_shared::constants::ASPECT_CALL;
use murmure_shared::error::SignalError;
use murmure_shared::identity::Identity;
use murmure_shared::protocol::CodecOffer;
use murmure_shared::types::{CallOutcome, CodecType, NodeId};
use murmure_store::{CallHistory, PeersStore};

struct Node {
    engine: CallEngine,
    events: UnboundedReceiver<CoreEvent>,
    node_id: NodeId,
    _tmp: tempfile::TempDir,
}

fn spawn_node(
    network: &Arc<MockNetwork>,
    clock: &Arc<ManualClock>,
    config: EngineConfig,
) -> Node {
    let tmp = tempfile::tempdir().unwrap();
    let identity = Identity::generate();
    let node_id = identity.node_id();
    let transport = MockTransport::new(network.clone(), identity.public_key_bytes()).unwrap();
    let peers = PeersStore::open(&tmp.path().join("peers.json"));
    let history = CallHistory::open(&tmp.path().join("call_history.json"), None);

    let (engine, events) = CallEngine::start(
        identity,
        transport,
        clock.clone(),
        config,
        peers,
        history,
    );
    Node {
        engine,
        events,
        node_id,
        _tmp: tmp,
    }
}

fn test_config(codec: CodecType, bitrate: u32) -> EngineConfig {
    EngineConfig {
        codec: CodecOffer::new(codec, bitrate),
        audio_enabled: false,
        ..EngineConfig::default()
    }
}

/// Announce every node to every other node.
fn introduce(nodes: &mut [&mut Node]) {
    for node in nodes.iter() {
        node.engine.announce_presence().unwrap();
    }
    for node in nodes.iter_mut() {
        while let Ok(event) = node.events.try_recv() {
            assert!(matches!(event, CoreEvent::PeerDiscovered { .. }));
        }
    }
}

async fn next_event(node: &mut Node) -> CoreEvent {
    // Generous bound: under paused time the engine's own timers (invite 30 s,
    // link 10 s) must fire before this guard does.
    tokio::time::timeout(Duration::from_secs(60), node.events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn wait_for<F: Fn(&CoreEvent) -> bool>(node: &mut Node, pred: F) -> CoreEvent {
    loop {
        let event = next_event(node).await;
        if pred(&event) {
            return event;
        }
    }
}

fn drain(node: &mut Node) {
    while node.events.try_recv().is_ok() {}
}

#[tokio::test]
async fn test_outgoing_happy_path() {
    let network = MockNetwork::new();
    let clock = Arc::new(ManualClock::new());
    let mut caller = spawn_node(&network, &clock, test_config(CodecType::Opus, 24_000));
    let mut callee = spawn_node(&network, &clock, test_config(CodecType::Opus, 16_000));
    introduce(&mut [&mut caller, &mut callee]);

    let call_id = caller.engine.start_call(callee.node_id).unwrap();

    let CoreEvent::IncomingCall { call } =
        wait_for(&mut callee, |e| matches!(e, CoreEvent::IncomingCall { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(call.call_id, call_id);
    assert_eq!(call.remote_id, caller.node_id);

    // Caller saw the ringing notification
    wait_for(&mut caller, |e| {
        matches!(e, CoreEvent::PhaseChanged { phase: CallPhase::Ringing, .. })
    })
    .await;

    callee.engine.accept_call().unwrap();

    assert_eq!(caller.engine.phase(), CallPhase::InCall);
    assert_eq!(callee.engine.phase(), CallPhase::InCall);

    // Negotiation picked the lower bitrate on both sides
    let negotiated = CodecOffer::new(CodecType::Opus, 16_000);
    assert_eq!(
        caller.engine.current_call().unwrap().negotiated_codec,
        Some(negotiated)
    );
    assert_eq!(
        callee.engine.current_call().unwrap().negotiated_codec,
        Some(negotiated)
    );

    // Media established on both sides with the same SAS
    let CoreEvent::CallEstablished { sas_code: sas_a, .. } =
        wait_for(&mut caller, |e| matches!(e, CoreEvent::CallEstablished { .. })).await
    else {
        unreachable!()
    };
    let CoreEvent::CallEstablished { sas_code: sas_b, .. } =
        wait_for(&mut callee, |e| matches!(e, CoreEvent::CallEstablished { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(sas_a, sas_b);
    assert!(caller.engine.security_info().unwrap().encrypted);

    caller.engine.hangup().unwrap();

    assert_eq!(caller.engine.phase(), CallPhase::Idle);
    assert_eq!(callee.engine.phase(), CallPhase::Idle);

    let caller_history = caller.engine.recent_calls(10);
    assert_eq!(caller_history.len(), 1);
    assert_eq!(caller_history[0].outcome, CallOutcome::Completed);
    assert_eq!(caller_history[0].remote_id, callee.node_id);

    let callee_history = callee.engine.recent_calls(10);
    assert_eq!(callee_history.len(), 1);
    assert_eq!(callee_history[0].outcome, CallOutcome::Completed);
}

#[tokio::test]
async fn test_codec2_wins_negotiation() {
    let network = MockNetwork::new();
    let clock = Arc::new(ManualClock::new());
    let mut caller = spawn_node(&network, &clock, test_config(CodecType::Codec2, 1_600));
    let mut callee = spawn_node(&network, &clock, test_config(CodecType::Opus, 48_000));
    introduce(&mut [&mut caller, &mut callee]);

    caller.engine.start_call(callee.node_id).unwrap();
    wait_for(&mut callee, |e| matches!(e, CoreEvent::IncomingCall { .. })).await;
    callee.engine.accept_call().unwrap();

    let negotiated = Some(CodecOffer::new(CodecType::Codec2, 1_600));
    assert_eq!(
        caller.engine.current_call().unwrap().negotiated_codec,
        negotiated
    );
    assert_eq!(
        callee.engine.current_call().unwrap().negotiated_codec,
        negotiated
    );

    caller.engine.hangup().unwrap();
}

#[tokio::test]
async fn test_blocked_peer_rejected_silently() {
    let network = MockNetwork::new();
    let clock = Arc::new(ManualClock::new());
    let mut caller = spawn_node(&network, &clock, test_config(CodecType::Opus, 24_000));
    let mut callee = spawn_node(&network, &clock, test_config(CodecType::Opus, 24_000));
    introduce(&mut [&mut caller, &mut callee]);

    assert!(callee.engine.block_peer(&caller.node_id));
    drain(&mut callee);

    caller.engine.start_call(callee.node_id).unwrap();

    // Caller's attempt was auto-rejected
    let CoreEvent::CallEnded { outcome, .. } =
        wait_for(&mut caller, |e| matches!(e, CoreEvent::CallEnded { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(outcome, CallOutcome::Rejected);
    assert_eq!(caller.engine.phase(), CallPhase::Idle);

    // Callee saw nothing: no incoming-call event, phase never left idle
    assert_eq!(callee.engine.phase(), CallPhase::Idle);
    while let Ok(event) = callee.events.try_recv() {
        assert!(
            !matches!(event, CoreEvent::IncomingCall { .. }),
            "blocked peer must not ring"
        );
    }
    assert!(callee.engine.recent_calls(10).is_empty());
}

#[tokio::test]
async fn test_rate_limit_sixth_invite() {
    let network = MockNetwork::new();
    let clock = Arc::new(ManualClock::new());
    let mut caller = spawn_node(&network, &clock, test_config(CodecType::Opus, 24_000));
    let mut callee = spawn_node(&network, &clock, test_config(CodecType::Opus, 24_000));
    introduce(&mut [&mut caller, &mut callee]);

    // Five invites reach the callee; each is rejected by the user
    for _ in 0..5 {
        caller.engine.start_call(callee.node_id).unwrap();
        wait_for(&mut callee, |e| matches!(e, CoreEvent::IncomingCall { .. })).await;
        callee.engine.reject_call().unwrap();
        wait_for(&mut caller, |e| matches!(e, CoreEvent::CallEnded { .. })).await;
        clock.advance(Duration::from_secs(5));
    }

    // The sixth is refused by the admission layer without ringing
    drain(&mut callee);
    caller.engine.start_call(callee.node_id).unwrap();
    let CoreEvent::CallEnded { outcome, .. } =
        wait_for(&mut caller, |e| matches!(e, CoreEvent::CallEnded { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(outcome, CallOutcome::Rejected);
    while let Ok(event) = callee.events.try_recv() {
        assert!(!matches!(event, CoreEvent::IncomingCall { .. }));
    }
    assert_eq!(callee.engine.phase(), CallPhase::Idle);
}

#[tokio::test]
async fn test_busy_rejects_second_caller() {
    let network = MockNetwork::new();
    let clock = Arc::new(ManualClock::new());
    let mut alice = spawn_node(&network, &clock, test_config(CodecType::Opus, 24_000));
    let mut bob = spawn_node(&network, &clock, test_config(CodecType::Opus, 24_000));
    let mut carol = spawn_node(&network, &clock, test_config(CodecType::Opus, 24_000));
    introduce(&mut [&mut alice, &mut bob, &mut carol]);

    alice.engine.start_call(bob.node_id).unwrap();
    wait_for(&mut bob, |e| matches!(e, CoreEvent::IncomingCall { .. })).await;
    bob.engine.accept_call().unwrap();
    assert_eq!(bob.engine.phase(), CallPhase::InCall);

    carol.engine.start_call(bob.node_id).unwrap();
    let CoreEvent::CallEnded { outcome, .. } =
        wait_for(&mut carol, |e| matches!(e, CoreEvent::CallEnded { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(outcome, CallOutcome::Rejected);

    // The first call is untouched, and the busy attempt is not recorded by default
    assert_eq!(alice.engine.phase(), CallPhase::InCall);
    assert_eq!(bob.engine.phase(), CallPhase::InCall);
    assert!(bob.engine.recent_calls(10).is_empty());

    alice.engine.hangup().unwrap();
}

#[tokio::test]
async fn test_busy_recorded_when_configured() {
    let network = MockNetwork::new();
    let clock = Arc::new(ManualClock::new());
    let mut alice = spawn_node(&network, &clock, test_config(CodecType::Opus, 24_000));
    let mut bob = spawn_node(
        &network,
        &clock,
        EngineConfig {
            record_busy: true,
            ..test_config(CodecType::Opus, 24_000)
        },
    );
    let mut carol = spawn_node(&network, &clock, test_config(CodecType::Opus, 24_000));
    introduce(&mut [&mut alice, &mut bob, &mut carol]);

    alice.engine.start_call(bob.node_id).unwrap();
    wait_for(&mut bob, |e| matches!(e, CoreEvent::IncomingCall { .. })).await;
    bob.engine.accept_call().unwrap();

    carol.engine.start_call(bob.node_id).unwrap();
    wait_for(&mut carol, |e| matches!(e, CoreEvent::CallEnded { .. })).await;

    let history = bob.engine.recent_calls(10);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, CallOutcome::Missed);
    assert_eq!(history[0].remote_id, carol.node_id);

    alice.engine.hangup().unwrap();
}

#[tokio::test]
async fn test_oversize_invite_refused_before_transmission() {
    let network = MockNetwork::new();
    let clock = Arc::new(ManualClock::new());
    let mut caller = spawn_node(
        &network,
        &clock,
        EngineConfig {
            display_name: Some("x".repeat(400)),
            ..test_config(CodecType::Opus, 24_000)
        },
    );
    let mut callee = spawn_node(&network, &clock, test_config(CodecType::Opus, 24_000));
    introduce(&mut [&mut caller, &mut callee]);

    let err = caller.engine.start_call(callee.node_id).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Signal(SignalError::MessageTooLarge { .. })
    ));

    // Nothing was transmitted and no call state exists anywhere
    assert_eq!(caller.engine.phase(), CallPhase::Idle);
    assert_eq!(callee.engine.phase(), CallPhase::Idle);
    assert!(callee.events.try_recv().is_err());
}

#[tokio::test]
async fn test_call_to_unannounced_peer_fails() {
    let network = MockNetwork::new();
    let clock = Arc::new(ManualClock::new());
    let caller = spawn_node(&network, &clock, test_config(CodecType::Opus, 24_000));
    let stranger = Identity::generate().node_id();

    assert!(matches!(
        caller.engine.start_call(stranger),
        Err(EngineError::UnknownPeer(_))
    ));
    assert_eq!(caller.engine.phase(), CallPhase::Idle);
}

#[tokio::test]
async fn test_reject_reaches_caller() {
    let network = MockNetwork::new();
    let clock = Arc::new(ManualClock::new());
    let mut caller = spawn_node(&network, &clock, test_config(CodecType::Opus, 24_000));
    let mut callee = spawn_node(&network, &clock, test_config(CodecType::Opus, 24_000));
    introduce(&mut [&mut caller, &mut callee]);

    caller.engine.start_call(callee.node_id).unwrap();
    wait_for(&mut callee, |e| matches!(e, CoreEvent::IncomingCall { .. })).await;
    callee.engine.reject_call().unwrap();

    let CoreEvent::CallEnded { outcome, .. } =
        wait_for(&mut caller, |e| matches!(e, CoreEvent::CallEnded { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(outcome, CallOutcome::Rejected);
    assert_eq!(caller.engine.phase(), CallPhase::Idle);

    let callee_history = callee.engine.recent_calls(10);
    assert_eq!(callee_history.len(), 1);
    assert_eq!(callee_history[0].outcome, CallOutcome::Rejected);
}

#[tokio::test]
async fn test_remote_end_while_ringing_is_missed() {
    let network = MockNetwork::new();
    let clock = Arc::new(ManualClock::new());
    let mut caller = spawn_node(&network, &clock, test_config(CodecType::Opus, 24_000));
    let mut callee = spawn_node(&network, &clock, test_config(CodecType::Opus, 24_000));
    introduce(&mut [&mut caller, &mut callee]);

    caller.engine.start_call(callee.node_id).unwrap();
    wait_for(&mut callee, |e| matches!(e, CoreEvent::IncomingCall { .. })).await;

    // Caller gives up before the callee answers
    caller.engine.hangup().unwrap();

    assert_eq!(callee.engine.phase(), CallPhase::Idle);
    let callee_history = callee.engine.recent_calls(10);
    assert_eq!(callee_history.len(), 1);
    assert_eq!(callee_history[0].outcome, CallOutcome::Missed);

    let caller_history = caller.engine.recent_calls(10);
    assert_eq!(caller_history[0].outcome, CallOutcome::NoAnswer);
}

#[tokio::test(start_paused = true)]
async fn test_invite_timeout_gives_up() {
    let network = MockNetwork::new();
    let clock = Arc::new(ManualClock::new());
    let mut caller = spawn_node(&network, &clock, test_config(CodecType::Opus, 24_000));

    // A peer that announced but whose node silently swallows signaling
    let mute_identity = Identity::generate();
    let mute = MockTransport::new(network.clone(), mute_identity.public_key_bytes()).unwrap();
    mute.register_packet_callback(ASPECT_CALL, Arc::new(|_| {}));
    mute.announce(
        ASPECT_CALL,
        &murmure_shared::protocol::AnnounceAppData::new(None)
            .encode()
            .unwrap(),
    )
    .unwrap();
    drain(&mut caller);

    caller.engine.start_call(mute_identity.node_id()).unwrap();
    assert_eq!(caller.engine.phase(), CallPhase::OutgoingCall);

    // Paused clock auto-advances through the 30 s invite timer
    let CoreEvent::CallEnded { outcome, .. } =
        wait_for(&mut caller, |e| matches!(e, CoreEvent::CallEnded { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(outcome, CallOutcome::NoAnswer);
    assert_eq!(caller.engine.phase(), CallPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_link_establishment_timeout_fails_call() {
    let network = MockNetwork::new();
    let clock = Arc::new(ManualClock::new());
    let mut caller = spawn_node(&network, &clock, test_config(CodecType::Opus, 24_000));
    let mut callee = spawn_node(&network, &clock, test_config(CodecType::Opus, 24_000));
    introduce(&mut [&mut caller, &mut callee]);

    // Links stall in PENDING from here on
    network.set_hold_links(true);

    caller.engine.start_call(callee.node_id).unwrap();
    wait_for(&mut callee, |e| matches!(e, CoreEvent::IncomingCall { .. })).await;
    callee.engine.accept_call().unwrap();
    assert_eq!(caller.engine.phase(), CallPhase::InCall);

    // 10 s later the pending link is declared dead
    let CoreEvent::CallEnded { outcome, .. } =
        wait_for(&mut caller, |e| matches!(e, CoreEvent::CallEnded { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(outcome, CallOutcome::LinkFailed);
    assert_eq!(caller.engine.phase(), CallPhase::Idle);
}

#[tokio::test]
async fn test_sas_confirmation_marks_peer_verified() {
    let network = MockNetwork::new();
    let clock = Arc::new(ManualClock::new());
    let mut caller = spawn_node(&network, &clock, test_config(CodecType::Opus, 24_000));
    let mut callee = spawn_node(&network, &clock, test_config(CodecType::Opus, 24_000));
    introduce(&mut [&mut caller, &mut callee]);

    caller.engine.start_call(callee.node_id).unwrap();
    wait_for(&mut callee, |e| matches!(e, CoreEvent::IncomingCall { .. })).await;
    callee.engine.accept_call().unwrap();
    wait_for(&mut caller, |e| matches!(e, CoreEvent::CallEstablished { .. })).await;

    caller.engine.confirm_sas_match().unwrap();
    let peers = caller.engine.list_peers();
    let record = peers.iter().find(|p| p.node_id == callee.node_id).unwrap();
    assert!(record.verified);

    // A reported mismatch raises a warning but does not verify
    callee.engine.report_sas_mismatch().unwrap();
    wait_for(&mut callee, |e| matches!(e, CoreEvent::SecurityWarning { .. })).await;
    let peers = callee.engine.list_peers();
    let record = peers.iter().find(|p| p.node_id == caller.node_id).unwrap();
    assert!(!record.verified);

    caller.engine.hangup().unwrap();
}

#[tokio::test]
async fn test_unblock_resets_rate_limits() {
    let network = MockNetwork::new();
    let clock = Arc::new(ManualClock::new());
    let mut caller = spawn_node(&network, &clock, test_config(CodecType::Opus, 24_000));
    let mut callee = spawn_node(&network, &clock, test_config(CodecType::Opus, 24_000));
    introduce(&mut [&mut caller, &mut callee]);

    for _ in 0..5 {
        caller.engine.start_call(callee.node_id).unwrap();
        wait_for(&mut callee, |e| matches!(e, CoreEvent::IncomingCall { .. })).await;
        callee.engine.reject_call().unwrap();
        wait_for(&mut caller, |e| matches!(e, CoreEvent::CallEnded { .. })).await;
    }

    // Saturated: the next attempt is refused without ringing
    drain(&mut callee);
    caller.engine.start_call(callee.node_id).unwrap();
    wait_for(&mut caller, |e| matches!(e, CoreEvent::CallEnded { .. })).await;
    assert!(callee.events.try_recv().is_err());

    // Block then unblock clears the window
    callee.engine.block_peer(&caller.node_id);
    callee.engine.unblock_peer(&caller.node_id);

    caller.engine.start_call(callee.node_id).unwrap();
    wait_for(&mut callee, |e| matches!(e, CoreEvent::IncomingCall { .. })).await;
    callee.engine.reject_call().unwrap();
}
