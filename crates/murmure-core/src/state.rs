//! Pure call state machine.
//!
//! No networking, no audio, no clocks: state transitions only. The engine
//! feeds it events and reacts to the synchronous `on_state_changed`
//! observer. At most one call exists at a time; `current_call` is populated
//! exactly while the phase is not `Idle`.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use murmure_shared::destination::DestinationHash;
use murmure_shared::protocol::CodecOffer;
use murmure_shared::types::{CallId, CallOutcome, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    OutgoingCall,
    Ringing,
    IncomingCall,
    InCall,
    Ended,
}

impl CallPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::OutgoingCall => "outgoing_call",
            Self::Ringing => "ringing",
            Self::IncomingCall => "incoming_call",
            Self::InCall => "in_call",
            Self::Ended => "ended",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Event `{event}` is not legal in phase {phase:?}")]
pub struct InvalidTransition {
    pub event: &'static str,
    pub phase: CallPhase,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallInfo {
    pub call_id: CallId,
    pub local_id: NodeId,
    pub remote_id: NodeId,
    pub display_name: Option<String>,
    pub initiated_by_local: bool,
    /// The remote side's media-link destination, once known.
    pub remote_call_dest: Option<DestinationHash>,
    pub negotiated_codec: Option<CodecOffer>,
    pub start_ts: DateTime<Utc>,
    /// Set on transition to `InCall`; duration runs from here.
    pub connected_ts: Option<DateTime<Utc>>,
    pub outcome: Option<CallOutcome>,
}

pub type StateObserver = Box<dyn Fn(CallPhase, Option<&CallInfo>) + Send>;

pub struct CallStateMachine {
    phase: CallPhase,
    current_call: Option<CallInfo>,
    observer: Option<StateObserver>,
}

impl CallStateMachine {
    pub fn new() -> Self {
        Self {
            phase: CallPhase::Idle,
            current_call: None,
            observer: None,
        }
    }

    /// Observer invoked synchronously after every successful transition.
    pub fn set_observer(&mut self, observer: StateObserver) {
        self.observer = Some(observer);
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn current_call(&self) -> Option<&CallInfo> {
        self.current_call.as_ref()
    }

    pub fn current_call_mut(&mut self) -> Option<&mut CallInfo> {
        self.current_call.as_mut()
    }

    fn set_phase(&mut self, phase: CallPhase) {
        self.phase = phase;
        if let Some(observer) = &self.observer {
            observer(self.phase, self.current_call.as_ref());
        }
    }

    /// True when the event's call id addresses the current call.
    fn matches_current(&self, call_id: CallId) -> bool {
        match &self.current_call {
            Some(call) if call.call_id == call_id => true,
            _ => {
                debug!(%call_id, "Ignoring event for unknown call id");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Local events
    // -----------------------------------------------------------------------

    /// `IDLE -> OUTGOING_CALL`. Allocates the call id unless one is given.
    pub fn start_outgoing(
        &mut self,
        local_id: NodeId,
        remote_id: NodeId,
        display_name: Option<String>,
        call_id: Option<CallId>,
        now: DateTime<Utc>,
    ) -> Result<CallInfo, InvalidTransition> {
        if self.phase != CallPhase::Idle {
            return Err(InvalidTransition {
                event: "start_outgoing",
                phase: self.phase,
            });
        }
        let call = CallInfo {
            call_id: call_id.unwrap_or_default(),
            local_id,
            remote_id,
            display_name,
            initiated_by_local: true,
            remote_call_dest: None,
            negotiated_codec: None,
            start_ts: now,
            connected_ts: None,
            outcome: None,
        };
        self.current_call = Some(call.clone());
        self.set_phase(CallPhase::OutgoingCall);
        Ok(call)
    }

    /// `IDLE -> INCOMING_CALL`.
    pub fn incoming_invite(&mut self, call: CallInfo) -> Result<(), InvalidTransition> {
        if self.phase != CallPhase::Idle {
            return Err(InvalidTransition {
                event: "incoming_invite",
                phase: self.phase,
            });
        }
        self.current_call = Some(call);
        self.set_phase(CallPhase::IncomingCall);
        Ok(())
    }

    /// `INCOMING_CALL -> IN_CALL`.
    pub fn accept_local(
        &mut self,
        negotiated: CodecOffer,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if self.phase != CallPhase::IncomingCall {
            return Err(InvalidTransition {
                event: "accept_local",
                phase: self.phase,
            });
        }
        if let Some(call) = &mut self.current_call {
            call.negotiated_codec = Some(negotiated);
            call.connected_ts = Some(now);
        }
        self.set_phase(CallPhase::InCall);
        Ok(())
    }

    /// `INCOMING_CALL -> ENDED`.
    pub fn reject_local(&mut self) -> Result<(), InvalidTransition> {
        if self.phase != CallPhase::IncomingCall {
            return Err(InvalidTransition {
                event: "reject_local",
                phase: self.phase,
            });
        }
        self.end_with(CallOutcome::Rejected);
        Ok(())
    }

    /// `IN_CALL | OUTGOING_CALL | RINGING -> ENDED`. A hangup before the
    /// remote answered is recorded as unanswered.
    pub fn local_hangup(&mut self) -> Result<(), InvalidTransition> {
        match self.phase {
            CallPhase::InCall => {
                self.end_with(CallOutcome::Completed);
                Ok(())
            }
            CallPhase::OutgoingCall | CallPhase::Ringing => {
                self.end_with(CallOutcome::NoAnswer);
                Ok(())
            }
            phase => Err(InvalidTransition {
                event: "local_hangup",
                phase,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Remote events (validated against the current call id)
    // -----------------------------------------------------------------------

    /// `OUTGOING_CALL -> RINGING`. Optional; repeated ringing is ignored.
    pub fn remote_ringing(&mut self, call_id: CallId) -> Result<(), InvalidTransition> {
        if !self.matches_current(call_id) {
            return Ok(());
        }
        match self.phase {
            CallPhase::OutgoingCall => {
                self.set_phase(CallPhase::Ringing);
                Ok(())
            }
            CallPhase::Ringing => Ok(()),
            phase => Err(InvalidTransition {
                event: "remote_ringing",
                phase,
            }),
        }
    }

    /// `OUTGOING_CALL | RINGING -> IN_CALL`.
    pub fn remote_accepted(
        &mut self,
        call_id: CallId,
        negotiated: CodecOffer,
        remote_call_dest: DestinationHash,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !self.matches_current(call_id) {
            return Ok(());
        }
        match self.phase {
            CallPhase::OutgoingCall | CallPhase::Ringing => {
                if let Some(call) = &mut self.current_call {
                    call.negotiated_codec = Some(negotiated);
                    call.remote_call_dest = Some(remote_call_dest);
                    call.connected_ts = Some(now);
                }
                self.set_phase(CallPhase::InCall);
                Ok(())
            }
            phase => Err(InvalidTransition {
                event: "remote_accepted",
                phase,
            }),
        }
    }

    /// `OUTGOING_CALL | RINGING -> ENDED`.
    pub fn remote_rejected(&mut self, call_id: CallId) -> Result<(), InvalidTransition> {
        if !self.matches_current(call_id) {
            return Ok(());
        }
        match self.phase {
            CallPhase::OutgoingCall | CallPhase::Ringing => {
                self.end_with(CallOutcome::Rejected);
                Ok(())
            }
            phase => Err(InvalidTransition {
                event: "remote_rejected",
                phase,
            }),
        }
    }

    /// `IN_CALL -> ENDED`; also clears an incoming call the caller gave up
    /// on before it was answered.
    pub fn remote_ended(&mut self, call_id: CallId) -> Result<(), InvalidTransition> {
        if !self.matches_current(call_id) {
            return Ok(());
        }
        match self.phase {
            CallPhase::InCall => {
                self.end_with(CallOutcome::Completed);
                Ok(())
            }
            CallPhase::IncomingCall => {
                self.end_with(CallOutcome::Missed);
                Ok(())
            }
            phase => Err(InvalidTransition {
                event: "remote_ended",
                phase,
            }),
        }
    }

    /// `IN_CALL -> ENDED` on link loss.
    pub fn link_failed(&mut self, call_id: CallId) -> Result<(), InvalidTransition> {
        if !self.matches_current(call_id) {
            return Ok(());
        }
        match self.phase {
            CallPhase::InCall => {
                self.end_with(CallOutcome::LinkFailed);
                Ok(())
            }
            phase => Err(InvalidTransition {
                event: "link_failed",
                phase,
            }),
        }
    }

    /// `OUTGOING_CALL | RINGING -> ENDED` when no reply arrived in time.
    pub fn invite_timeout(&mut self, call_id: CallId) -> Result<(), InvalidTransition> {
        if !self.matches_current(call_id) {
            return Ok(());
        }
        match self.phase {
            CallPhase::OutgoingCall | CallPhase::Ringing => {
                self.end_with(CallOutcome::NoAnswer);
                Ok(())
            }
            phase => Err(InvalidTransition {
                event: "invite_timeout",
                phase,
            }),
        }
    }

    /// The transport refused a send for this call. Mid-call this is
    /// equivalent to losing the link; before answer it ends the attempt.
    pub fn transport_failed(&mut self, call_id: CallId) -> Result<(), InvalidTransition> {
        if !self.matches_current(call_id) {
            return Ok(());
        }
        match self.phase {
            CallPhase::InCall
            | CallPhase::OutgoingCall
            | CallPhase::Ringing
            | CallPhase::IncomingCall => {
                self.end_with(CallOutcome::LinkFailed);
                Ok(())
            }
            phase => Err(InvalidTransition {
                event: "transport_failed",
                phase,
            }),
        }
    }

    /// Session setup failed fatally; any active phase collapses to `ENDED`.
    pub fn codec_failed(&mut self, call_id: CallId) -> Result<(), InvalidTransition> {
        if !self.matches_current(call_id) {
            return Ok(());
        }
        match self.phase {
            CallPhase::InCall
            | CallPhase::OutgoingCall
            | CallPhase::Ringing
            | CallPhase::IncomingCall => {
                self.end_with(CallOutcome::CodecError);
                Ok(())
            }
            phase => Err(InvalidTransition {
                event: "codec_failed",
                phase,
            }),
        }
    }

    /// `ENDED -> IDLE`, handing back the closed call for the history record.
    pub fn finalize(&mut self) -> Result<CallInfo, InvalidTransition> {
        if self.phase != CallPhase::Ended {
            return Err(InvalidTransition {
                event: "finalize",
                phase: self.phase,
            });
        }
        let call = self
            .current_call
            .take()
            .expect("ENDED phase always carries a call");
        self.set_phase(CallPhase::Idle);
        Ok(call)
    }

    fn end_with(&mut self, outcome: CallOutcome) {
        if let Some(call) = &mut self.current_call {
            call.outcome = Some(outcome);
        }
        self.set_phase(CallPhase::Ended);
    }
}

impl Default for CallStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
