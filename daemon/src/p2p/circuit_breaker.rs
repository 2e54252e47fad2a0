// Per-peer circuit breaker
//
// Closed counts consecutive failures; at the threshold the circuit opens
// and every call is rejected until the timeout elapses. The first call
// after that is the half-open probe: its outcome alone decides between
// closing the circuit and re-opening it.

use dashmap::DashMap;
use log::{debug, info};

use stratos_common::time::{get_current_time_in_seconds, TimestampSeconds};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum PeerCircuit {
    Closed { failures: u32 },
    Open { until: TimestampSeconds },
    HalfOpen,
}

pub struct CircuitBreaker {
    threshold: u32,
    timeout_secs: u64,
    circuits: DashMap<String, PeerCircuit>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, timeout_secs: u64) -> Self {
        CircuitBreaker {
            threshold,
            timeout_secs,
            circuits: DashMap::new(),
        }
    }

    /// Whether a call to this peer may proceed right now. Transitions
    /// Open -> HalfOpen once the timeout has elapsed, in which case the
    /// allowed call is the probe.
    pub fn allow(&self, peer_id: &str) -> bool {
        self.allow_at(peer_id, get_current_time_in_seconds())
    }

    pub fn allow_at(&self, peer_id: &str, now: TimestampSeconds) -> bool {
        let mut entry = self
            .circuits
            .entry(peer_id.to_string())
            .or_insert(PeerCircuit::Closed { failures: 0 });
        match *entry.value() {
            PeerCircuit::Closed { .. } => true,
            PeerCircuit::Open { until } => {
                if now >= until {
                    debug!("circuit for {} half-open, probing", peer_id);
                    *entry.value_mut() = PeerCircuit::HalfOpen;
                    true
                } else {
                    false
                }
            }
            // a probe is already in flight
            PeerCircuit::HalfOpen => false,
        }
    }

    pub fn record_success(&self, peer_id: &str) {
        if let Some(mut entry) = self.circuits.get_mut(peer_id) {
            if !matches!(*entry.value(), PeerCircuit::Closed { failures: 0 }) {
                debug!("circuit for {} closed", peer_id);
            }
            *entry.value_mut() = PeerCircuit::Closed { failures: 0 };
        }
    }

    pub fn record_failure(&self, peer_id: &str) {
        self.record_failure_at(peer_id, get_current_time_in_seconds())
    }

    pub fn record_failure_at(&self, peer_id: &str, now: TimestampSeconds) {
        let mut entry = self
            .circuits
            .entry(peer_id.to_string())
            .or_insert(PeerCircuit::Closed { failures: 0 });
        match *entry.value() {
            PeerCircuit::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.threshold {
                    info!(
                        "circuit for {} opened after {} consecutive failures",
                        peer_id, failures
                    );
                    *entry.value_mut() = PeerCircuit::Open {
                        until: now + self.timeout_secs,
                    };
                } else {
                    *entry.value_mut() = PeerCircuit::Closed { failures };
                }
            }
            // failed probe re-opens for a full timeout
            PeerCircuit::HalfOpen => {
                info!("circuit probe for {} failed, re-opening", peer_id);
                *entry.value_mut() = PeerCircuit::Open {
                    until: now + self.timeout_secs,
                };
            }
            PeerCircuit::Open { .. } => {}
        }
    }

    pub fn state(&self, peer_id: &str) -> CircuitState {
        match self.circuits.get(peer_id).map(|entry| *entry.value()) {
            Some(PeerCircuit::Open { .. }) => CircuitState::Open,
            Some(PeerCircuit::HalfOpen) => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(5, 30);
        for _ in 0..4 {
            breaker.record_failure_at("peer-a", 100);
            assert!(breaker.allow_at("peer-a", 100));
        }
        breaker.record_failure_at("peer-a", 100);
        assert_eq!(breaker.state("peer-a"), CircuitState::Open);
        assert!(!breaker.allow_at("peer-a", 100));
        // still open one second before the timeout
        assert!(!breaker.allow_at("peer-a", 129));
    }

    #[test]
    fn test_probe_success_closes() {
        let breaker = CircuitBreaker::new(5, 30);
        for _ in 0..5 {
            breaker.record_failure_at("peer-a", 100);
        }
        // timeout elapsed: exactly one probe goes through
        assert!(breaker.allow_at("peer-a", 130));
        assert_eq!(breaker.state("peer-a"), CircuitState::HalfOpen);
        assert!(!breaker.allow_at("peer-a", 130));

        breaker.record_success("peer-a");
        assert_eq!(breaker.state("peer-a"), CircuitState::Closed);
        assert!(breaker.allow_at("peer-a", 131));
    }

    #[test]
    fn test_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(5, 30);
        for _ in 0..5 {
            breaker.record_failure_at("peer-a", 100);
        }
        assert!(breaker.allow_at("peer-a", 130));
        breaker.record_failure_at("peer-a", 130);
        assert_eq!(breaker.state("peer-a"), CircuitState::Open);
        assert!(!breaker.allow_at("peer-a", 159));
        assert!(breaker.allow_at("peer-a", 160));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(5, 30);
        for _ in 0..4 {
            breaker.record_failure_at("peer-a", 100);
        }
        breaker.record_success("peer-a");
        for _ in 0..4 {
            breaker.record_failure_at("peer-a", 100);
        }
        assert_eq!(breaker.state("peer-a"), CircuitState::Closed);
    }
}
