//! Candidate ordering per tier strategy.
//!
//! The selector only produces the attempt order; termination is owned by the
//! retry orchestrator.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::Strategy;
use crate::health::{HealthRegistry, WEIGHT_FLOOR};

/// Sharpening exponent for adaptive sampling. Linear weights leave badly
/// degraded models with too much probability mass; squaring keeps a model at
/// failure score 20 under 5% of first picks.
const ADAPTIVE_SHARPNESS: f64 = 2.0;

/// Produce the full attempt sequence for one request.
///
/// * `sequential` — the configured order repeated `rounds` times.
/// * `random` — uniformly random permutations, truncated to `max_retries`.
/// * `adaptive` — weighted sampling without replacement, truncated to
///   `max_retries`.
///
/// For the bounded strategies, duplicates appear only when the pool is
/// smaller than the budget (the permutation restarts).
pub fn plan(
    pool: &[String],
    strategy: Strategy,
    rounds: u32,
    max_retries: u32,
    health: &HealthRegistry,
) -> Vec<String> {
    if pool.is_empty() {
        return Vec::new();
    }
    match strategy {
        Strategy::Sequential => {
            let rounds = rounds.max(1) as usize;
            let mut out = Vec::with_capacity(pool.len() * rounds);
            for _ in 0..rounds {
                out.extend(pool.iter().cloned());
            }
            out
        }
        Strategy::Random => {
            let budget = max_retries.max(1) as usize;
            let mut rng = rand::thread_rng();
            let mut out = Vec::with_capacity(budget);
            while out.len() < budget {
                let mut permutation: Vec<String> = pool.to_vec();
                permutation.shuffle(&mut rng);
                out.extend(permutation);
            }
            out.truncate(budget);
            out
        }
        Strategy::Adaptive => {
            let budget = max_retries.max(1) as usize;
            let weights: Vec<f64> = pool
                .iter()
                .map(|model| health.weight(model).powf(ADAPTIVE_SHARPNESS))
                .collect();
            let mut rng = rand::thread_rng();
            let mut out = Vec::with_capacity(budget);
            while out.len() < budget {
                out.extend(adaptive_order(pool, &weights, &mut rng));
            }
            out.truncate(budget);
            out
        }
    }
}

/// One weighted permutation without replacement.
///
/// Models at effectively-zero weight are withheld from sampling and appended
/// in configured order as a last resort; ties between equal weights resolve
/// toward the configured order via the stable cumulative walk.
fn adaptive_order<R: Rng>(pool: &[String], weights: &[f64], rng: &mut R) -> Vec<String> {
    let mut live: Vec<usize> = (0..pool.len())
        .filter(|&i| weights[i] > WEIGHT_FLOOR)
        .collect();
    let dead: Vec<usize> = (0..pool.len())
        .filter(|&i| weights[i] <= WEIGHT_FLOOR)
        .collect();

    let mut order = Vec::with_capacity(pool.len());
    while !live.is_empty() {
        let total: f64 = live.iter().map(|&i| weights[i]).sum();
        let mut draw = rng.gen_range(0.0..total);
        let mut picked = live.len() - 1;
        for (pos, &i) in live.iter().enumerate() {
            if draw < weights[i] {
                picked = pos;
                break;
            }
            draw -= weights[i];
        }
        order.push(pool[live.remove(picked)].clone());
    }
    order.extend(dead.into_iter().map(|i| pool[i].clone()));
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn pool(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_sequential_repeats_rounds_in_order() {
        let health = HealthRegistry::new(0.0);
        let out = plan(&pool(&["a/x", "b/y"]), Strategy::Sequential, 3, 0, &health);
        assert_eq!(out, pool(&["a/x", "b/y", "a/x", "b/y", "a/x", "b/y"]));
        // bound: rounds x pool size
        assert_eq!(out.len(), 3 * 2);
    }

    #[test]
    fn test_random_is_bounded_and_distinct_within_pool() {
        let health = HealthRegistry::new(0.0);
        let models = pool(&["a/x", "b/y", "c/z", "d/w"]);
        let out = plan(&models, Strategy::Random, 0, 3, &health);
        assert_eq!(out.len(), 3);
        let distinct: HashSet<&String> = out.iter().collect();
        assert_eq!(distinct.len(), 3);
    }

    #[test]
    fn test_random_duplicates_only_when_pool_smaller_than_budget() {
        let health = HealthRegistry::new(0.0);
        let out = plan(&pool(&["a/x"]), Strategy::Random, 0, 3, &health);
        assert_eq!(out, pool(&["a/x", "a/x", "a/x"]));
    }

    #[test]
    fn test_empty_pool_yields_nothing() {
        let health = HealthRegistry::new(0.0);
        assert!(plan(&[], Strategy::Sequential, 2, 2, &health).is_empty());
    }

    #[test]
    fn test_adaptive_skews_toward_healthy_model() {
        use crate::error::FailureKind;

        let health = HealthRegistry::new(0.0);
        // push "bad" to failure_score 20 (10 x 2.0)
        for _ in 0..10 {
            health.on_failure("bad", FailureKind::Http5xx);
        }
        let models = pool(&["good", "bad"]);

        let mut good_first = 0;
        for _ in 0..1_000 {
            let out = plan(&models, Strategy::Adaptive, 0, 2, &health);
            if out[0] == "good" {
                good_first += 1;
            }
        }
        assert!(
            good_first >= 900,
            "good selected first only {good_first}/1000 times"
        );
    }

    #[test]
    fn test_adaptive_zero_weight_is_last_resort() {
        let models = pool(&["dead-1", "alive", "dead-2"]);
        let weights = vec![0.0, 1.0, 0.0];
        let mut rng = rand::thread_rng();
        let order = adaptive_order(&models, &weights, &mut rng);
        assert_eq!(order[0], "alive");
        // dead models keep configured order at the tail
        assert_eq!(order[1], "dead-1");
        assert_eq!(order[2], "dead-2");
    }

    #[test]
    fn test_adaptive_samples_all_live_models() {
        let health = HealthRegistry::new(0.0);
        let models = pool(&["a/x", "b/y", "c/z"]);
        let out = plan(&models, Strategy::Adaptive, 0, 3, &health);
        let distinct: HashSet<&String> = out.iter().collect();
        assert_eq!(distinct.len(), 3);
    }
}
