// Peer selection with failover
//
// Candidates are scored health * (reputation / 100): health comes from the
// circuit breaker (Open excluded entirely, HalfOpen discounted) and the
// failed-peer memory. The operation is tried against candidates in order
// until one succeeds or the attempt budget runs out.

use log::{debug, warn};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use crate::p2p::{
    circuit_breaker::{CircuitBreaker, CircuitState},
    error::P2pError,
    peer_list::{PeerRegistry, PeerSnapshot},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    HealthBased,
    RoundRobin,
}

pub struct LoadBalancer {
    registry: Arc<PeerRegistry>,
    breaker: Arc<CircuitBreaker>,
    max_attempts: usize,
    strategy: SelectionStrategy,
    round_robin_cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(
        registry: Arc<PeerRegistry>,
        breaker: Arc<CircuitBreaker>,
        max_attempts: usize,
        strategy: SelectionStrategy,
    ) -> Self {
        LoadBalancer {
            registry,
            breaker,
            max_attempts,
            strategy,
            round_robin_cursor: AtomicUsize::new(0),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Active peers eligible right now, ordered by the configured strategy.
    pub fn candidates(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<(f64, PeerSnapshot)> = self
            .registry
            .active_peers()
            .into_iter()
            .filter(|peer| self.breaker.state(&peer.id) != CircuitState::Open)
            .filter(|peer| !self.registry.is_suppressed(&peer.id))
            .map(|peer| (self.score(&peer), peer))
            .collect();

        match self.strategy {
            SelectionStrategy::HealthBased => {
                peers.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            }
            SelectionStrategy::RoundRobin => {
                if !peers.is_empty() {
                    let offset =
                        self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) % peers.len();
                    peers.rotate_left(offset);
                }
            }
        }
        peers.into_iter().map(|(_, peer)| peer).collect()
    }

    fn score(&self, peer: &PeerSnapshot) -> f64 {
        let health = match self.breaker.state(&peer.id) {
            CircuitState::Closed => 1.0,
            CircuitState::HalfOpen => 0.5,
            CircuitState::Open => 0.0,
        };
        health * (peer.reputation as f64 / 100.0)
    }

    /// Run `operation` against candidate peers until one succeeds, for at
    /// most `max_attempts` peers. Success and failure are fed back into the
    /// registry and the circuit breaker. Returns the result together with
    /// the id of the peer that served it.
    pub async fn execute_with_failover<T, F, Fut>(
        &self,
        op_name: &str,
        operation: F,
    ) -> Result<(T, String), P2pError>
    where
        F: Fn(PeerSnapshot) -> Fut,
        Fut: Future<Output = Result<T, P2pError>>,
    {
        let candidates = self.candidates();
        if candidates.is_empty() {
            return Err(P2pError::NoPeerAvailable(op_name.to_string()));
        }

        let mut attempts = 0;
        let mut last_error: Option<P2pError> = None;
        for peer in candidates {
            if attempts >= self.max_attempts {
                break;
            }
            if !self.breaker.allow(&peer.id) {
                continue;
            }
            attempts += 1;

            let peer_id = peer.id.clone();
            let started = Instant::now();
            match operation(peer).await {
                Ok(result) => {
                    let elapsed = started.elapsed().as_millis() as u64;
                    debug!("{} served by {} in {}ms", op_name, peer_id, elapsed);
                    self.registry.record_latency(&peer_id, elapsed);
                    self.registry.record_success(&peer_id);
                    self.breaker.record_success(&peer_id);
                    return Ok((result, peer_id));
                }
                Err(error) => {
                    warn!("{} failed on {}: {}", op_name, peer_id, error);
                    self.registry.record_failure(&peer_id);
                    self.breaker.record_failure(&peer_id);
                    last_error = Some(error);
                }
            }
        }

        Err(P2pError::AllAttemptsFailed {
            attempts,
            last: last_error
                .map(|error| error.to_string())
                .unwrap_or_else(|| "no peer admitted by circuit breaker".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::peer_list::PeerRecord;
    use std::sync::atomic::AtomicU32;

    fn setup(peer_ids: &[(&str, u8)]) -> (Arc<PeerRegistry>, Arc<CircuitBreaker>, LoadBalancer) {
        let registry = Arc::new(PeerRegistry::new());
        for (id, reputation) in peer_ids {
            let mut record = PeerRecord::new(*id, format!("http://{}", id));
            record.reputation = *reputation;
            registry.add_peer(record);
        }
        let breaker = Arc::new(CircuitBreaker::new(5, 30));
        let balancer = LoadBalancer::new(
            registry.clone(),
            breaker.clone(),
            3,
            SelectionStrategy::HealthBased,
        );
        (registry, breaker, balancer)
    }

    #[tokio::test]
    async fn test_failover_to_next_peer() {
        let (_registry, _breaker, balancer) =
            setup(&[("good", 80), ("bad", 90), ("idle", 60)]);

        let calls = AtomicU32::new(0);
        let (result, served_by) = balancer
            .execute_with_failover("fetch", |peer| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if peer.id == "bad" {
                        Err(P2pError::RequestFailed {
                            peer: peer.id.clone(),
                            reason: "boom".to_string(),
                        })
                    } else {
                        Ok(peer.id.clone())
                    }
                }
            })
            .await
            .unwrap();

        // "bad" has the best reputation so it is tried first and fails over
        assert_eq!(result, "good");
        assert_eq!(served_by, "good");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_open_circuit_excluded() {
        let (_registry, breaker, balancer) = setup(&[("a", 80), ("b", 70)]);
        for _ in 0..5 {
            breaker.record_failure("a");
        }

        let candidates: Vec<String> =
            balancer.candidates().into_iter().map(|peer| peer.id).collect();
        assert_eq!(candidates, vec!["b"]);
    }

    #[tokio::test]
    async fn test_all_attempts_exhausted() {
        let (_registry, _breaker, balancer) = setup(&[("a", 80), ("b", 70)]);

        let error = balancer
            .execute_with_failover("fetch", |peer| async move {
                Err::<(), _>(P2pError::RequestFailed {
                    peer: peer.id.clone(),
                    reason: "down".to_string(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            P2pError::AllAttemptsFailed { attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_no_peers() {
        let (_registry, _breaker, balancer) = setup(&[]);
        let error = balancer
            .execute_with_failover("fetch", |peer| async move { Ok(peer.id) })
            .await
            .unwrap_err();
        assert!(matches!(error, P2pError::NoPeerAvailable(_)));
    }
}
