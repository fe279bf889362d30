//! Events the engine pushes to the UI over its channel.
//!
//! The core never calls UI code directly; the UI consumes these on its own
//! loop and issues engine calls in response.

use murmure_shared::types::{CallId, CallOutcome, NodeId};

use crate::state::{CallInfo, CallPhase};

#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// An admitted invite is waiting for the user to accept or reject.
    IncomingCall { call: CallInfo },

    /// The state machine moved; mirrors the `on_state_changed` observer.
    PhaseChanged {
        phase: CallPhase,
        call: Option<CallInfo>,
    },

    /// Media link is up and audio is flowing. Show the SAS code.
    CallEstablished { call_id: CallId, sas_code: String },

    /// The call closed; a history record has been written.
    CallEnded {
        call_id: CallId,
        remote_id: NodeId,
        outcome: CallOutcome,
    },

    /// A peer announced (new or refreshed directory entry).
    PeerDiscovered {
        node_id: NodeId,
        display_name: Option<String>,
    },

    /// A mismatching SAS was reported; the user should consider hanging up.
    SecurityWarning { call_id: CallId, message: String },

    /// A transport send failed outside a call; shown as a toast.
    TransportError { message: String },
}
