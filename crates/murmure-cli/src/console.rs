//! Line-oriented console driving the call engine.
//!
//! Engine events and user commands are multiplexed on one task so output
//! never interleaves mid-line.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

use murmure_core::{CallEngine, CoreEvent};
use murmure_shared::types::NodeId;

const HELP: &str = "\
commands:
  call <node_id>     dial a peer
  accept             answer the ringing call
  reject             refuse the ringing call
  hangup             end the current call
  mute / unmute      toggle the microphone
  sas ok             confirm the verification code matches
  sas bad            report a mismatching verification code
  peers              list known peers
  block <node_id>    auto-reject a peer's calls
  unblock <node_id>  lift a block
  history            show recent calls
  status             show call phase and quality
  announce           broadcast presence now
  quit               exit";

pub async fn run(
    engine: Arc<CallEngine>,
    mut events: UnboundedReceiver<CoreEvent>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("type `help` for commands");

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => print_event(&event),
                    None => break,
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_command(&engine, line.trim()) {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn print_event(event: &CoreEvent) {
    match event {
        CoreEvent::IncomingCall { call } => {
            let name = call.display_name.as_deref().unwrap_or("unknown");
            println!(
                "incoming call from {} ({}) — `accept` or `reject`",
                name,
                call.remote_id.short()
            );
        }
        CoreEvent::PhaseChanged { phase, .. } => {
            debug!(phase = phase.as_str(), "phase changed");
        }
        CoreEvent::CallEstablished { sas_code, .. } => {
            println!("call connected — verification code: {sas_code}");
            println!("read the code to your peer; `sas ok` if it matches");
        }
        CoreEvent::CallEnded { outcome, .. } => {
            println!("call ended ({})", outcome.as_str());
        }
        CoreEvent::PeerDiscovered {
            node_id,
            display_name,
        } => {
            println!(
                "peer announced: {} ({})",
                display_name.as_deref().unwrap_or("unnamed"),
                node_id.short()
            );
        }
        CoreEvent::SecurityWarning { message, .. } => {
            println!("SECURITY WARNING: {message}");
        }
        CoreEvent::TransportError { message } => {
            println!("transport problem: {message}");
        }
    }
}

/// Returns false when the console should exit.
fn handle_command(engine: &CallEngine, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    match parts.next() {
        None => {}
        Some("help") => println!("{HELP}"),
        Some("call") => match parts.next().map(NodeId::from_hex) {
            Some(Ok(remote)) => match engine.start_call(remote) {
                Ok(call_id) => println!("calling {} ({call_id})", remote.short()),
                Err(err) => println!("cannot call: {err}"),
            },
            _ => println!("usage: call <64-hex node id>"),
        },
        Some("accept") => report(engine.accept_call()),
        Some("reject") => report(engine.reject_call()),
        Some("hangup") => report(engine.hangup()),
        Some("mute") => engine.set_muted(true),
        Some("unmute") => engine.set_muted(false),
        Some("sas") => match parts.next() {
            Some("ok") => report(engine.confirm_sas_match()),
            Some("bad") => report(engine.report_sas_mismatch()),
            _ => println!("usage: sas ok | sas bad"),
        },
        Some("peers") => {
            let peers = engine.list_peers();
            if peers.is_empty() {
                println!("no peers known yet (waiting for announces)");
            }
            for peer in peers {
                println!(
                    "{}  {:20}  announces={} verified={} blocked={}",
                    peer.node_id,
                    peer.display_name,
                    peer.announce_count,
                    peer.verified,
                    peer.blocked
                );
            }
        }
        Some("block") => match parts.next().map(NodeId::from_hex) {
            Some(Ok(peer)) => {
                if !engine.block_peer(&peer) {
                    println!("unknown peer");
                }
            }
            _ => println!("usage: block <node id>"),
        },
        Some("unblock") => match parts.next().map(NodeId::from_hex) {
            Some(Ok(peer)) => {
                if !engine.unblock_peer(&peer) {
                    println!("unknown peer");
                }
            }
            _ => println!("usage: unblock <node id>"),
        },
        Some("history") => {
            for call in engine.recent_calls(20) {
                println!(
                    "{}  {:9}  {:11}  {:4}s  {}",
                    call.start_ts.format("%Y-%m-%d %H:%M"),
                    call.direction.as_str(),
                    call.outcome.as_str(),
                    call.duration_s,
                    call.remote_id.short()
                );
            }
        }
        Some("status") => {
            println!("phase: {}", engine.phase().as_str());
            if let Some(metrics) = engine.call_metrics() {
                println!(
                    "rtt: {}  loss: {:.1}%  bitrate: {:.1} kbps  quality: {}",
                    metrics
                        .rtt_avg_ms
                        .map(|ms| format!("{ms:.0} ms"))
                        .unwrap_or_else(|| "n/a".to_string()),
                    metrics.loss_percentage(),
                    metrics.avg_bitrate_kbps(),
                    metrics.connection_quality().as_str()
                );
            }
        }
        Some("announce") => report(engine.announce_presence()),
        Some("quit") | Some("exit") => return false,
        Some(other) => println!("unknown command `{other}` (try `help`)"),
    }
    true
}

fn report<E: std::fmt::Display>(result: Result<(), E>) {
    if let Err(err) = result {
        println!("error: {err}");
    }
}
