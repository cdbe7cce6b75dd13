//! Load-balancing strategies for sandbox selection.
//!
//! A strategy is a pure choice over a candidate slice: it returns the
//! index of the winner and never mutates the candidates. Connection
//! accounting (increment on dispatch, decrement on completion) is the
//! pool's job.
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::core::route::SandboxInstance;

/// Trait for load-balancing strategies.
///
/// Implementors must be cheap and internally synchronized; `pick` runs in
/// the request hot path under the pool lock.
pub trait BalanceStrategy: Send + Sync + 'static {
    /// Pick an index into `candidates`, or `None` when the slice is empty.
    fn pick(&self, candidates: &[SandboxInstance]) -> Option<usize>;
}

/// Argmin over the in-flight `load` counter. The first instance among
/// equals wins, which keeps the choice stable for a fixed candidate order.
pub struct LeastConnections;

impl BalanceStrategy for LeastConnections {
    fn pick(&self, candidates: &[SandboxInstance]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, instance)| instance.load)
            .map(|(index, _)| index)
    }
}

/// Atomic counter cycling through the candidate index space.
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl BalanceStrategy for RoundRobin {
    fn pick(&self, candidates: &[SandboxInstance]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(count % candidates.len())
    }
}

/// Uniform random pick.
pub struct Random;

impl BalanceStrategy for Random {
    fn pick(&self, candidates: &[SandboxInstance]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(rand::rng().random_range(0..candidates.len()))
    }
}

/// A named strategy resolved from configuration.
pub struct LoadBalancer {
    name: String,
    strategy: Box<dyn BalanceStrategy>,
}

impl LoadBalancer {
    /// Resolve a strategy by its configuration name. Unknown names fall
    /// back to `least-connections`.
    pub fn from_name(name: &str) -> Self {
        let strategy: Box<dyn BalanceStrategy> = match name {
            "round-robin" => Box::new(RoundRobin::new()),
            "random" => Box::new(Random),
            "least-connections" => Box::new(LeastConnections),
            other => {
                if !other.is_empty() {
                    tracing::warn!(
                        strategy = other,
                        "unknown load balancer strategy, using least-connections"
                    );
                }
                Box::new(LeastConnections)
            }
        };
        Self {
            name: name.to_string(),
            strategy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pick(&self, candidates: &[SandboxInstance]) -> Option<usize> {
        self.strategy.pick(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::route::{InstanceStatus, SandboxKind};

    fn instance(id: &str, load: i64) -> SandboxInstance {
        SandboxInstance {
            id: id.to_string(),
            url: format!("http://{id}:8194"),
            kind: SandboxKind::Python,
            status: InstanceStatus::Healthy,
            load,
            last_ping: 0,
        }
    }

    #[test]
    fn least_connections_picks_lowest_load() {
        let candidates = vec![instance("a", 5), instance("b", 1), instance("c", 3)];
        assert_eq!(LeastConnections.pick(&candidates), Some(1));
    }

    #[test]
    fn least_connections_is_stable_on_ties() {
        let candidates = vec![instance("a", 2), instance("b", 2)];
        assert_eq!(LeastConnections.pick(&candidates), Some(0));
    }

    #[test]
    fn round_robin_cycles_through_candidates() {
        let rr = RoundRobin::new();
        let candidates = vec![instance("a", 0), instance("b", 0), instance("c", 0)];
        let picks: Vec<usize> = (0..6).map(|_| rr.pick(&candidates).unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn random_stays_in_bounds() {
        let candidates = vec![instance("a", 0), instance("b", 0)];
        for _ in 0..32 {
            let index = Random.pick(&candidates).unwrap();
            assert!(index < candidates.len());
        }
    }

    #[test]
    fn empty_candidates_yield_none() {
        assert_eq!(LeastConnections.pick(&[]), None);
        assert_eq!(RoundRobin::new().pick(&[]), None);
        assert_eq!(Random.pick(&[]), None);
    }

    #[test]
    fn unknown_strategy_falls_back_to_least_connections() {
        let lb = LoadBalancer::from_name("weighted-magic");
        let candidates = vec![instance("a", 9), instance("b", 0)];
        assert_eq!(lb.pick(&candidates), Some(1));
    }
}
