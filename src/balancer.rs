//! Power-of-two-choices selection over healthy deployments.
//!
//! Two candidates are drawn uniformly at random and the less utilized one
//! wins. This gives near-optimal load spread with no shared state, which
//! is what lets independent switchboard instances across processes
//! balance the same pool without coordination. Ties break on the lower
//! in-flight count, then lexicographically by name.

use crate::deployment::DeploymentClient;
use rand::Rng;
use std::cmp::Ordering;
use std::sync::Arc;

/// Pick a deployment from a slice of currently healthy candidates.
/// Returns `None` on an empty slice.
pub(crate) fn pick(candidates: &[Arc<DeploymentClient>]) -> Option<&Arc<DeploymentClient>> {
    match candidates {
        [] => None,
        [only] => Some(only),
        _ => {
            let mut rng = rand::rng();
            let first = rng.random_range(0..candidates.len());
            // Second draw over the remaining indices keeps the pair distinct.
            let mut second = rng.random_range(0..candidates.len() - 1);
            if second >= first {
                second += 1;
            }

            let a = &candidates[first];
            let b = &candidates[second];
            match compare(a, b) {
                Ordering::Greater => Some(b),
                _ => Some(a),
            }
        }
    }
}

fn compare(a: &DeploymentClient, b: &DeploymentClient) -> Ordering {
    a.utilization()
        .partial_cmp(&b.utilization())
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.in_flight().cmp(&b.in_flight()))
        .then_with(|| a.name().cmp(b.name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{stub_deployment, test_config};
    use std::collections::HashMap;

    fn deployment(name: &str, rpm_limit: u64) -> Arc<DeploymentClient> {
        stub_deployment(test_config(name, 0, rpm_limit))
    }

    #[test]
    fn empty_slice_yields_none() {
        assert!(pick(&[]).is_none());
    }

    #[test]
    fn single_candidate_is_returned_directly() {
        let pool = vec![deployment("only", 0)];
        assert_eq!(pick(&pool).unwrap().name(), "only");
    }

    #[test]
    fn lower_utilization_wins() {
        // "busy" at 90% request utilization, "idle" at 10%
        let busy = deployment("busy", 10);
        let idle = deployment("idle", 10);
        for _ in 0..9 {
            busy.note_request_for_test();
        }
        idle.note_request_for_test();

        let pool = vec![busy, idle];
        for _ in 0..50 {
            assert_eq!(pick(&pool).unwrap().name(), "idle");
        }
    }

    #[test]
    fn equal_utilization_ties_break_by_name() {
        let pool = vec![deployment("beta", 0), deployment("alpha", 0)];
        // Both unlimited (utilization 0) with zero in-flight, so the
        // lexicographically smaller name must win every draw.
        for _ in 0..50 {
            assert_eq!(pick(&pool).unwrap().name(), "alpha");
        }
    }

    #[test]
    fn selection_converges_to_uniform_under_load() {
        // Each pick accounts one request against the winner, so the
        // two-choices dynamic should spread load close to evenly.
        let pool: Vec<_> = ["a", "b", "c", "d"]
            .iter()
            .map(|n| deployment(n, 1_000_000))
            .collect();

        let trials = 2000;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..trials {
            let selected = pick(&pool).unwrap();
            selected.note_request_for_test();
            *counts.entry(selected.name().to_string()).or_insert(0) += 1;
        }

        for (name, count) in &counts {
            assert!(
                (350..=650).contains(count),
                "expected ~500 selections for {name}, got {count}"
            );
        }
        assert_eq!(counts.len(), 4);
    }
}
