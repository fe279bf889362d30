//! Admission checks for inbound invites.
//!
//! One function, one ordered decision. The first failing check wins and the
//! caller routes the corresponding reply; a blocked peer is refused before
//! the rate limiter ever sees the attempt, so blocking leaves no
//! rate-limiter trace.

use murmure_shared::types::NodeId;

use crate::directory::PeerDirectory;
use crate::ratelimit::RateLimiter;
use crate::state::CallPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Allow,
    /// The sender never announced; no key material to even reply with.
    RejectUnknown,
    RejectBlocked,
    RejectRateLimited,
    RejectBusy,
}

impl AdmissionDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::RejectUnknown => "reject_unknown",
            Self::RejectBlocked => "reject_blocked",
            Self::RejectRateLimited => "reject_rate_limited",
            Self::RejectBusy => "reject_busy",
        }
    }
}

pub fn admit_invite(
    directory: &PeerDirectory,
    limiter: &mut RateLimiter,
    phase: CallPhase,
    from: &NodeId,
) -> AdmissionDecision {
    if directory.resolve(from).is_none() {
        return AdmissionDecision::RejectUnknown;
    }
    if directory.is_blocked(from) {
        return AdmissionDecision::RejectBlocked;
    }
    if !limiter.is_allowed(from) {
        return AdmissionDecision::RejectRateLimited;
    }
    if !matches!(phase, CallPhase::Idle | CallPhase::Ended) {
        return AdmissionDecision::RejectBusy;
    }
    AdmissionDecision::Allow
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::sync::Arc;

    use murmure_net::Announce;
    use murmure_shared::constants::ASPECT_CALL;
    use murmure_shared::destination::derive_destination;
    use murmure_shared::identity::Identity;
    use murmure_shared::protocol::AnnounceAppData;
    use murmure_store::PeersStore;

    struct Fixture {
        directory: PeerDirectory,
        limiter: RateLimiter,
        peer: NodeId,
        _tmp: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let local = Identity::generate();
        let remote = Identity::generate();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let mut directory = PeerDirectory::new(
            PeersStore::open(&tmp.path().join("peers.json")),
            local.node_id(),
            clock.clone(),
        );
        directory.handle_announce(&Announce {
            destination: derive_destination(&remote.node_id(), ASPECT_CALL),
            public_key: remote.public_key_bytes(),
            app_data: AnnounceAppData::new(None).encode().unwrap(),
        });
        Fixture {
            directory,
            limiter: RateLimiter::new(clock, 5, 20),
            peer: remote.node_id(),
            _tmp: tmp,
        }
    }

    #[test]
    fn test_known_idle_peer_allowed() {
        let mut f = fixture();
        assert_eq!(
            admit_invite(&f.directory, &mut f.limiter, CallPhase::Idle, &f.peer),
            AdmissionDecision::Allow
        );
    }

    #[test]
    fn test_unknown_peer_rejected_first() {
        let mut f = fixture();
        let stranger = Identity::generate().node_id();
        assert_eq!(
            admit_invite(&f.directory, &mut f.limiter, CallPhase::Idle, &stranger),
            AdmissionDecision::RejectUnknown
        );
    }

    #[test]
    fn test_blocked_peer_skips_rate_limiter() {
        let mut f = fixture();
        f.directory.set_blocked(&f.peer, true);
        assert_eq!(
            admit_invite(&f.directory, &mut f.limiter, CallPhase::Idle, &f.peer),
            AdmissionDecision::RejectBlocked
        );
        // The attempt left no trace in the limiter
        assert_eq!(f.limiter.peer_stats(&f.peer).calls_last_hour, 0);
    }

    #[test]
    fn test_rate_limit_applies_before_busy() {
        let mut f = fixture();
        for _ in 0..5 {
            f.limiter.is_allowed(&f.peer);
        }
        assert_eq!(
            admit_invite(&f.directory, &mut f.limiter, CallPhase::InCall, &f.peer),
            AdmissionDecision::RejectRateLimited
        );
    }

    #[test]
    fn test_busy_while_in_call() {
        let mut f = fixture();
        assert_eq!(
            admit_invite(&f.directory, &mut f.limiter, CallPhase::InCall, &f.peer),
            AdmissionDecision::RejectBusy
        );
        assert_eq!(
            admit_invite(
                &f.directory,
                &mut f.limiter,
                CallPhase::IncomingCall,
                &f.peer
            ),
            AdmissionDecision::RejectBusy
        );
    }
}
