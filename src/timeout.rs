//! Adaptive per-request timeouts.
//!
//! Every outbound request registers here and gets a deadline computed from
//! an EWMA of observed round-trip times, clamped to a configured range. A
//! matching response clears the entry and feeds the EWMA; an expired entry
//! is handed back exactly once so the owner can synthesize the request's
//! failure event. Late responses find no entry and are dropped.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::constants::{
    INITIAL_REQUEST_TIMEOUT_MS, MAX_REQUEST_TIMEOUT_MS, MIN_REQUEST_TIMEOUT_MS,
};
use crate::ids::{Id, ShortId};

/// Identity of one outstanding request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub peer: ShortId,
    pub chain_id: Id,
    pub request_id: u32,
}

#[derive(Clone, Debug)]
struct Outstanding<T> {
    tag: T,
    issued: Instant,
    deadline: Instant,
}

/// Timeout bookkeeping for requests tagged with `T` (the message kind).
#[derive(Debug)]
pub struct TimeoutManager<T> {
    outstanding: HashMap<RequestKey, Outstanding<T>>,
    /// EWMA of observed RTTs, milliseconds.
    mean_rtt_ms: f64,
    /// Timeout = clamp(mean_rtt * multiplier, min, max).
    multiplier: f64,
    ewma_weight: f64,
    min: Duration,
    max: Duration,
    current: Duration,
}

impl<T> Default for TimeoutManager<T> {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(MIN_REQUEST_TIMEOUT_MS),
            Duration::from_millis(MAX_REQUEST_TIMEOUT_MS),
            Duration::from_millis(INITIAL_REQUEST_TIMEOUT_MS),
        )
    }
}

impl<T> TimeoutManager<T> {
    pub fn new(min: Duration, max: Duration, initial: Duration) -> Self {
        TimeoutManager {
            outstanding: HashMap::new(),
            mean_rtt_ms: initial.as_millis() as f64 / 2.0,
            multiplier: 2.0,
            ewma_weight: 0.1,
            min,
            max,
            current: initial.clamp(min, max),
        }
    }

    /// The timeout that would be assigned to a request registered now.
    pub fn current_timeout(&self) -> Duration {
        self.current
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    /// Register an outbound request; returns its deadline.
    pub fn register(&mut self, key: RequestKey, tag: T, now: Instant) -> Instant {
        let deadline = now + self.current;
        self.outstanding.insert(
            key,
            Outstanding {
                tag,
                issued: now,
                deadline,
            },
        );
        deadline
    }

    /// Match a response to its request. Returns the request's tag, or
    /// `None` if the request already completed or timed out (the response
    /// is late and must be dropped). A match feeds the RTT estimate.
    pub fn response(&mut self, key: &RequestKey, now: Instant) -> Option<T> {
        let entry = self.outstanding.remove(key)?;
        let rtt_ms = now.saturating_duration_since(entry.issued).as_millis() as f64;
        self.observe(rtt_ms);
        Some(entry.tag)
    }

    fn observe(&mut self, rtt_ms: f64) {
        self.mean_rtt_ms += self.ewma_weight * (rtt_ms - self.mean_rtt_ms);
        let timeout = Duration::from_millis((self.mean_rtt_ms * self.multiplier) as u64);
        self.current = timeout.clamp(self.min, self.max);
    }

    /// Remove and return every request whose deadline has passed. Each
    /// expired request is returned exactly once.
    pub fn expired(&mut self, now: Instant) -> Vec<(RequestKey, T)> {
        let due: Vec<RequestKey> = self
            .outstanding
            .iter()
            .filter(|(_, o)| o.deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        due.into_iter()
            .filter_map(|key| self.outstanding.remove(&key).map(|o| (key, o.tag)))
            .collect()
    }

    /// Remove and return everything outstanding, regardless of deadline.
    /// Used at shutdown to fire all pending failures immediately.
    pub fn drain(&mut self) -> Vec<(RequestKey, T)> {
        self.outstanding.drain().map(|(k, o)| (k, o.tag)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(peer: u8, request_id: u32) -> RequestKey {
        RequestKey {
            peer: ShortId([peer; 20]),
            chain_id: Id([1u8; 32]),
            request_id,
        }
    }

    #[test]
    fn response_matches_exactly_once() {
        let mut tm: TimeoutManager<&'static str> = TimeoutManager::default();
        let now = Instant::now();
        tm.register(key(1, 7), "get_ancestors", now);

        assert_eq!(tm.response(&key(1, 7), now), Some("get_ancestors"));
        // Second (late/duplicate) response is dropped.
        assert_eq!(tm.response(&key(1, 7), now), None);
    }

    #[test]
    fn unknown_response_dropped() {
        let mut tm: TimeoutManager<u8> = TimeoutManager::default();
        assert_eq!(tm.response(&key(1, 99), Instant::now()), None);
    }

    #[test]
    fn expiry_fires_once_and_clears() {
        let mut tm: TimeoutManager<u8> = TimeoutManager::default();
        let now = Instant::now();
        let deadline = tm.register(key(1, 1), 7, now);
        tm.register(key(2, 2), 8, now);

        assert!(tm.expired(now).is_empty());
        let fired = tm.expired(deadline);
        assert_eq!(fired.len(), 2);
        assert!(tm.expired(deadline).is_empty());
        // Expired requests no longer match responses.
        assert_eq!(tm.response(&key(1, 1), deadline), None);
    }

    #[test]
    fn fast_rtts_shrink_timeout_toward_min() {
        let mut tm: TimeoutManager<u8> =
            TimeoutManager::new(Duration::from_millis(100), Duration::from_secs(30), Duration::from_secs(5));
        let start = tm.current_timeout();
        let now = Instant::now();
        for i in 0..200 {
            tm.register(key(1, i), 0, now);
            // Instant response: observed RTT ~ 0.
            tm.response(&key(1, i), now);
        }
        assert!(tm.current_timeout() < start);
        assert!(tm.current_timeout() >= Duration::from_millis(100));
    }

    #[test]
    fn timeout_clamped_to_max() {
        let mut tm: TimeoutManager<u8> = TimeoutManager::new(
            Duration::from_millis(100),
            Duration::from_millis(400),
            Duration::from_millis(200),
        );
        let now = Instant::now();
        for i in 0..200 {
            tm.register(key(1, i), 0, now);
            let later = now + Duration::from_secs(10);
            tm.response(&key(1, i), later);
        }
        assert_eq!(tm.current_timeout(), Duration::from_millis(400));
    }

    #[test]
    fn drain_returns_everything() {
        let mut tm: TimeoutManager<u8> = TimeoutManager::default();
        let now = Instant::now();
        tm.register(key(1, 1), 1, now);
        tm.register(key(2, 2), 2, now);
        assert_eq!(tm.drain().len(), 2);
        assert_eq!(tm.outstanding_len(), 0);
    }
}
