//! Per-peer sliding-window admission control for incoming invites.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use murmure_shared::constants::{MAX_CALLS_PER_HOUR, MAX_CALLS_PER_MINUTE};
use murmure_shared::types::NodeId;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

use crate::clock::Clock;

pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    max_per_minute: u32,
    max_per_hour: u32,
    attempts: HashMap<NodeId, VecDeque<Instant>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerRateStats {
    pub calls_last_minute: u32,
    pub calls_last_hour: u32,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>, max_per_minute: u32, max_per_hour: u32) -> Self {
        Self {
            clock,
            max_per_minute,
            max_per_hour,
            attempts: HashMap::new(),
        }
    }

    pub fn with_defaults(clock: Arc<dyn Clock>) -> Self {
        Self::new(clock, MAX_CALLS_PER_MINUTE, MAX_CALLS_PER_HOUR)
    }

    /// Admit or refuse a call attempt from `peer`. Refused attempts are not
    /// recorded, so a rejected flood cannot extend its own penalty.
    pub fn is_allowed(&mut self, peer: &NodeId) -> bool {
        let now = self.clock.now();
        let timestamps = self.attempts.entry(*peer).or_default();

        while timestamps
            .front()
            .is_some_and(|&ts| now.duration_since(ts) >= HOUR)
        {
            timestamps.pop_front();
        }

        let calls_in_minute = timestamps
            .iter()
            .filter(|&&ts| now.duration_since(ts) < MINUTE)
            .count() as u32;
        let calls_in_hour = timestamps.len() as u32;

        if calls_in_minute >= self.max_per_minute {
            warn!(
                peer = %peer.short(),
                calls_in_minute,
                limit = self.max_per_minute,
                "Rate limit exceeded (minute window)"
            );
            return false;
        }
        if calls_in_hour >= self.max_per_hour {
            warn!(
                peer = %peer.short(),
                calls_in_hour,
                limit = self.max_per_hour,
                "Rate limit exceeded (hour window)"
            );
            return false;
        }

        timestamps.push_back(now);
        true
    }

    pub fn peer_stats(&self, peer: &NodeId) -> PeerRateStats {
        let now = self.clock.now();
        let Some(timestamps) = self.attempts.get(peer) else {
            return PeerRateStats::default();
        };
        PeerRateStats {
            calls_last_minute: timestamps
                .iter()
                .filter(|&&ts| now.duration_since(ts) < MINUTE)
                .count() as u32,
            calls_last_hour: timestamps
                .iter()
                .filter(|&&ts| now.duration_since(ts) < HOUR)
                .count() as u32,
        }
    }

    /// Forget a peer entirely, e.g. after unblocking it.
    pub fn reset_peer(&mut self, peer: &NodeId) {
        if self.attempts.remove(peer).is_some() {
            info!(peer = %peer.short(), "Reset rate limits");
        }
    }

    /// Drop peers with no attempt in the last hour.
    pub fn purge_stale(&mut self) {
        let now = self.clock.now();
        let before = self.attempts.len();
        self.attempts.retain(|_, timestamps| {
            while timestamps
                .front()
                .is_some_and(|&ts| now.duration_since(ts) >= HOUR)
            {
                timestamps.pop_front();
            }
            !timestamps.is_empty()
        });
        let removed = before - self.attempts.len();
        if removed > 0 {
            debug!(removed, "Purged idle peers from rate limiter");
        }
    }

    pub fn tracked_peers(&self) -> usize {
        self.attempts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(clock: &Arc<ManualClock>) -> RateLimiter {
        RateLimiter::new(clock.clone(), 5, 20)
    }

    fn peer(n: u8) -> NodeId {
        NodeId([n; 32])
    }

    #[test]
    fn test_minute_cap() {
        let clock = Arc::new(ManualClock::new());
        let mut limiter = limiter(&clock);
        let p = peer(1);

        for _ in 0..5 {
            assert!(limiter.is_allowed(&p));
        }
        assert!(!limiter.is_allowed(&p));

        // Sixth attempt was not recorded; a minute later the window is clear
        clock.advance(Duration::from_secs(61));
        assert!(limiter.is_allowed(&p));
    }

    #[test]
    fn test_hour_cap() {
        let clock = Arc::new(ManualClock::new());
        let mut limiter = limiter(&clock);
        let p = peer(1);

        for _ in 0..4 {
            for _ in 0..5 {
                assert!(limiter.is_allowed(&p));
            }
            clock.advance(Duration::from_secs(120));
        }
        // 20 calls within the hour
        assert!(!limiter.is_allowed(&p));

        clock.advance(Duration::from_secs(3600));
        assert!(limiter.is_allowed(&p));
    }

    #[test]
    fn test_peers_are_independent() {
        let clock = Arc::new(ManualClock::new());
        let mut limiter = limiter(&clock);

        for _ in 0..5 {
            assert!(limiter.is_allowed(&peer(1)));
        }
        assert!(!limiter.is_allowed(&peer(1)));
        assert!(limiter.is_allowed(&peer(2)));
    }

    #[test]
    fn test_rejected_attempts_not_recorded() {
        let clock = Arc::new(ManualClock::new());
        let mut limiter = limiter(&clock);
        let p = peer(1);

        for _ in 0..5 {
            limiter.is_allowed(&p);
        }
        for _ in 0..10 {
            assert!(!limiter.is_allowed(&p));
        }
        assert_eq!(limiter.peer_stats(&p).calls_last_minute, 5);
    }

    #[test]
    fn test_reset_peer() {
        let clock = Arc::new(ManualClock::new());
        let mut limiter = limiter(&clock);
        let p = peer(1);

        for _ in 0..5 {
            limiter.is_allowed(&p);
        }
        assert!(!limiter.is_allowed(&p));
        limiter.reset_peer(&p);
        assert!(limiter.is_allowed(&p));
    }

    #[test]
    fn test_purge_stale() {
        let clock = Arc::new(ManualClock::new());
        let mut limiter = limiter(&clock);

        limiter.is_allowed(&peer(1));
        clock.advance(Duration::from_secs(1800));
        limiter.is_allowed(&peer(2));
        clock.advance(Duration::from_secs(1801));

        limiter.purge_stale();
        assert_eq!(limiter.tracked_peers(), 1);
    }
}
