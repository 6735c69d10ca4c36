//! Load-balancing policies over a model's active targets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use super::target::TargetState;

/// How `RequestRouter` picks among a model's active targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalancePolicy {
    #[default]
    RoundRobin,
    Weighted,
    LeastConnections,
    ResponseTime,
}

/// Per-model round-robin cursor. Deliberately per-model rather than a single
/// global counter, so traffic to one model can't perturb another's rotation.
#[derive(Default)]
pub struct RoundRobinCounter(AtomicUsize);

impl RoundRobinCounter {
    pub fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    fn next(&self, len: usize) -> usize {
        self.0.fetch_add(1, Ordering::Relaxed) % len
    }
}

impl LoadBalancePolicy {
    /// Picks one target from a non-empty slice of active targets.
    pub fn select<'a>(
        &self,
        targets: &'a [Arc<TargetState>],
        counter: &RoundRobinCounter,
    ) -> &'a Arc<TargetState> {
        debug_assert!(!targets.is_empty());
        match self {
            LoadBalancePolicy::RoundRobin => &targets[counter.next(targets.len())],
            LoadBalancePolicy::Weighted => select_weighted(targets, counter),
            LoadBalancePolicy::LeastConnections => select_by_key(targets, |t| t.in_flight_count() as f64),
            LoadBalancePolicy::ResponseTime => select_by_key(targets, |t| t.mean_response_time_ms()),
        }
    }
}

fn select_weighted<'a>(targets: &'a [Arc<TargetState>], counter: &RoundRobinCounter) -> &'a Arc<TargetState> {
    let total_weight: u32 = targets.iter().map(|t| t.weight.max(1)).sum();
    let mut point = (counter.next(total_weight as usize) as u32) % total_weight;
    for target in targets {
        let w = target.weight.max(1);
        if point < w {
            return target;
        }
        point -= w;
    }
    &targets[targets.len() - 1]
}

/// Lowest-key wins; ties broken at random to avoid herding every request
/// onto one target when several are exactly tied.
fn select_by_key<'a>(targets: &'a [Arc<TargetState>], key: impl Fn(&TargetState) -> f64) -> &'a Arc<TargetState> {
    let mut best = key(&targets[0]);
    let mut winners = vec![0usize];
    for (i, target) in targets.iter().enumerate().skip(1) {
        let k = key(target);
        if k < best {
            best = k;
            winners.clear();
            winners.push(i);
        } else if k == best {
            winners.push(i);
        }
    }
    let pick = if winners.len() == 1 {
        winners[0]
    } else {
        winners[rand::thread_rng().gen_range(0..winners.len())]
    };
    &targets[pick]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(n: usize) -> Vec<Arc<TargetState>> {
        (0..n)
            .map(|i| Arc::new(TargetState::new(format!("http://t{i}"), 5, 1)))
            .collect()
    }

    #[test]
    fn round_robin_cycles_through_all_targets() {
        let targets = targets(3);
        let counter = RoundRobinCounter::new();
        let picks: Vec<_> = (0..6)
            .map(|_| LoadBalancePolicy::RoundRobin.select(&targets, &counter).endpoint_url.clone())
            .collect();
        assert_eq!(picks, vec!["http://t0", "http://t1", "http://t2", "http://t0", "http://t1", "http://t2"]);
    }

    #[test]
    fn least_connections_prefers_idle_target() {
        let targets = targets(2);
        targets[0].begin_request();
        targets[0].begin_request();
        let counter = RoundRobinCounter::new();
        let picked = LoadBalancePolicy::LeastConnections.select(&targets, &counter);
        assert_eq!(picked.endpoint_url, "http://t1");
    }

    #[test]
    fn response_time_prefers_faster_target() {
        let targets = targets(2);
        targets[0].begin_request();
        targets[0].finish_request(1000, false);
        targets[1].begin_request();
        targets[1].finish_request(10, false);
        let counter = RoundRobinCounter::new();
        let picked = LoadBalancePolicy::ResponseTime.select(&targets, &counter);
        assert_eq!(picked.endpoint_url, "http://t1");
    }

    #[test]
    fn weighted_favors_heavier_target_over_many_picks() {
        let targets = vec![
            Arc::new(TargetState::new("http://heavy".into(), 5, 9)),
            Arc::new(TargetState::new("http://light".into(), 5, 1)),
        ];
        let counter = RoundRobinCounter::new();
        let heavy_picks = (0..100)
            .filter(|_| LoadBalancePolicy::Weighted.select(&targets, &counter).endpoint_url == "http://heavy")
            .count();
        assert!(heavy_picks > 70, "expected heavy target to dominate, got {heavy_picks}/100");
    }
}
