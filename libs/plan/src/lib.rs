//! Batch planning primitives for fleet reboots.
//!
//! This library holds the pure, deterministic decisions the orchestrator makes
//! before touching any instance:
//!
//! - **Batch sizing**: how many instances are rebooted together and how many
//!   batches the queue needs.
//! - **Placement**: which worker node each instance is accounted against.
//! - **Node-local splitting**: how a node's group is cut down to the node's
//!   concurrency cap.
//! - **Retry budgeting**: the bounded `(attempts, deadline)` loop used for
//!   per-instance retries.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs (same order in, same
//!   order out).
//! - A non-empty queue always produces a batch size of at least one.
//! - No sub-batch is larger than the node cap it was split for.

use std::collections::HashMap;
use std::hash::Hash;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Planning errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// The batch strategy name is not recognised.
    #[error("unknown batch strategy: {0}")]
    UnknownStrategy(String),
}

/// How the batch size is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStrategy {
    /// Derive the batch size from node count and per-node concurrency.
    #[default]
    Auto,

    /// Use a fixed batch size.
    Fixed,
}

impl FromStr for BatchStrategy {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "fixed" => Ok(Self::Fixed),
            other => Err(PlanError::UnknownStrategy(other.to_string())),
        }
    }
}

impl std::fmt::Display for BatchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Fixed => write!(f, "fixed"),
        }
    }
}

/// Batch sizing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    pub strategy: BatchStrategy,

    /// Batch size for the `fixed` strategy.
    pub max_batch_size: usize,

    /// Concurrent reboots allowed per node for the `auto` strategy.
    pub max_concurrent_per_node: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            strategy: BatchStrategy::Auto,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_concurrent_per_node: DEFAULT_MAX_CONCURRENT_PER_NODE,
        }
    }
}

/// Result of batch planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPlan {
    pub batch_size: usize,
    pub total_batches: usize,
}

impl BatchPlan {
    /// A plan with nothing to do.
    pub const EMPTY: Self = Self {
        batch_size: 0,
        total_batches: 0,
    };

    /// Returns true if the plan contains no batches.
    pub fn is_empty(&self) -> bool {
        self.total_batches == 0
    }
}

/// Compute batch size and batch count for a queue.
///
/// - `fixed`: `batch_size = max_batch_size`
/// - `auto`: `batch_size = min(queue_len, node_count * max_concurrent_per_node)`
///
/// `total_batches = ceil(queue_len / batch_size)`. An empty queue yields
/// [`BatchPlan::EMPTY`]; otherwise the batch size is clamped to at least one,
/// so zero discovered nodes behave like a single node.
pub fn plan_batches(node_count: usize, queue_len: usize, config: &BatchConfig) -> BatchPlan {
    if queue_len == 0 {
        return BatchPlan::EMPTY;
    }

    let raw = match config.strategy {
        BatchStrategy::Fixed => config.max_batch_size,
        BatchStrategy::Auto => {
            let capacity = node_count.max(1) * config.max_concurrent_per_node;
            queue_len.min(capacity)
        }
    };
    let batch_size = raw.max(1);

    BatchPlan {
        batch_size,
        total_batches: queue_len.div_ceil(batch_size),
    }
}

/// Assign instances to nodes round-robin.
///
/// Deterministic given stable input order. No resource awareness: the
/// capacity guarantee is enforced by count when groups are executed.
/// Returns an empty map when there are no nodes.
pub fn map_instances_to_nodes<I, N>(instances: &[I], nodes: &[N]) -> HashMap<I, N>
where
    I: Clone + Eq + Hash,
    N: Clone,
{
    if nodes.is_empty() {
        return HashMap::new();
    }

    instances
        .iter()
        .enumerate()
        .map(|(i, instance)| (instance.clone(), nodes[i % nodes.len()].clone()))
        .collect()
}

/// Group instances by their assigned node.
///
/// Groups are ordered by the first instance assigned to each node and keep the
/// input order inside each group. Instances without an assignment are skipped.
pub fn group_by_node<I, N>(instances: &[I], assignment: &HashMap<I, N>) -> Vec<(N, Vec<I>)>
where
    I: Clone + Eq + Hash,
    N: Clone + Eq,
{
    let mut groups: Vec<(N, Vec<I>)> = Vec::new();

    for instance in instances {
        let Some(node) = assignment.get(instance) else {
            continue;
        };
        match groups.iter_mut().find(|(n, _)| n == node) {
            Some((_, members)) => members.push(instance.clone()),
            None => groups.push((node.clone(), vec![instance.clone()])),
        }
    }

    groups
}

/// Split a node-group into sequential sub-batches of at most `cap` items.
///
/// A cap of zero is treated as one.
pub fn sub_batches<T: Clone>(items: &[T], cap: usize) -> Vec<Vec<T>> {
    items.chunks(cap.max(1)).map(<[T]>::to_vec).collect()
}

/// Decision after recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after waiting `backoff`.
    Retry { attempt: u32, backoff: Duration },

    /// The attempt limit was reached.
    AttemptsExhausted { attempts: u32 },

    /// The absolute time ceiling was reached.
    DeadlineExceeded { attempts: u32, elapsed: Duration },
}

impl RetryDecision {
    /// Returns true if another attempt should be made.
    pub fn should_retry(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

/// Bounded retry budget: an attempt limit plus an independent time ceiling.
///
/// The caller supplies elapsed time, so the budget works with any clock.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    limit: u32,
    ceiling: Duration,
    backoff_base: Duration,
    attempts: u32,
}

impl RetryBudget {
    /// Create a new retry budget.
    pub fn new(limit: u32, ceiling: Duration, backoff_base: Duration) -> Self {
        Self {
            limit,
            ceiling,
            backoff_base,
            attempts: 0,
        }
    }

    /// Failed attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failed attempt, `elapsed` after the job started.
    ///
    /// Retries while `attempts < limit` and `elapsed < ceiling`. Backoff grows
    /// linearly with the attempt count (`backoff_base * attempts`).
    pub fn record_failure(&mut self, elapsed: Duration) -> RetryDecision {
        self.attempts += 1;

        if self.attempts >= self.limit {
            return RetryDecision::AttemptsExhausted {
                attempts: self.attempts,
            };
        }

        if elapsed >= self.ceiling {
            return RetryDecision::DeadlineExceeded {
                attempts: self.attempts,
                elapsed,
            };
        }

        RetryDecision::Retry {
            attempt: self.attempts,
            backoff: self.backoff_base * self.attempts,
        }
    }
}

/// Default fixed batch size.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 5;

/// Default concurrent reboots per node.
pub const DEFAULT_MAX_CONCURRENT_PER_NODE: usize = 2;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn auto(per_node: usize) -> BatchConfig {
        BatchConfig {
            strategy: BatchStrategy::Auto,
            max_batch_size: 99,
            max_concurrent_per_node: per_node,
        }
    }

    #[rstest]
    #[case(3, 10, 2, 6, 2)]
    #[case(3, 4, 2, 4, 1)]
    #[case(1, 7, 1, 1, 7)]
    #[case(0, 5, 2, 2, 3)]
    fn test_auto_strategy(
        #[case] nodes: usize,
        #[case] queue: usize,
        #[case] per_node: usize,
        #[case] batch_size: usize,
        #[case] total: usize,
    ) {
        let plan = plan_batches(nodes, queue, &auto(per_node));
        assert_eq!(plan.batch_size, batch_size);
        assert_eq!(plan.total_batches, total);
    }

    #[test]
    fn test_fixed_strategy() {
        let config = BatchConfig {
            strategy: BatchStrategy::Fixed,
            max_batch_size: 4,
            max_concurrent_per_node: 1,
        };
        let plan = plan_batches(10, 10, &config);
        assert_eq!(plan, BatchPlan { batch_size: 4, total_batches: 3 });
    }

    #[test]
    fn test_empty_queue() {
        assert!(plan_batches(3, 0, &BatchConfig::default()).is_empty());
    }

    #[test]
    fn test_zero_fixed_size_clamped() {
        let config = BatchConfig {
            strategy: BatchStrategy::Fixed,
            max_batch_size: 0,
            max_concurrent_per_node: 2,
        };
        let plan = plan_batches(2, 3, &config);
        assert_eq!(plan.batch_size, 1);
        assert_eq!(plan.total_batches, 3);
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("AUTO".parse::<BatchStrategy>().unwrap(), BatchStrategy::Auto);
        assert_eq!(" fixed ".parse::<BatchStrategy>().unwrap(), BatchStrategy::Fixed);
        assert!(matches!(
            "greedy".parse::<BatchStrategy>(),
            Err(PlanError::UnknownStrategy(_))
        ));
    }

    #[test]
    fn test_round_robin_mapping() {
        let instances = ["a", "b", "c", "d", "e"];
        let nodes = ["n1", "n2"];
        let map = map_instances_to_nodes(&instances, &nodes);
        assert_eq!(map["a"], "n1");
        assert_eq!(map["b"], "n2");
        assert_eq!(map["c"], "n1");
        assert_eq!(map["e"], "n1");
    }

    #[test]
    fn test_mapping_without_nodes() {
        let map = map_instances_to_nodes::<&str, &str>(&["a"], &[]);
        assert!(map.is_empty());
    }

    #[test]
    fn test_group_by_node_preserves_order() {
        let instances = ["a", "b", "c", "d", "e"];
        let map = map_instances_to_nodes(&instances, &["n1", "n2"]);
        let groups = group_by_node(&instances, &map);
        assert_eq!(groups, vec![("n1", vec!["a", "c", "e"]), ("n2", vec!["b", "d"])]);
    }

    #[test]
    fn test_sub_batches() {
        let groups = sub_batches(&[1, 2, 3, 4, 5], 2);
        assert_eq!(groups, vec![vec![1, 2], vec![3, 4], vec![5]]);
        assert_eq!(sub_batches(&[1, 2], 0), vec![vec![1], vec![2]]);
        assert!(sub_batches::<u8>(&[], 3).is_empty());
    }

    #[test]
    fn test_retry_budget_attempt_limit() {
        let mut budget = RetryBudget::new(3, Duration::from_secs(2700), Duration::from_secs(10));
        assert_eq!(
            budget.record_failure(Duration::from_secs(60)),
            RetryDecision::Retry { attempt: 1, backoff: Duration::from_secs(10) }
        );
        assert_eq!(
            budget.record_failure(Duration::from_secs(120)),
            RetryDecision::Retry { attempt: 2, backoff: Duration::from_secs(20) }
        );
        assert_eq!(
            budget.record_failure(Duration::from_secs(180)),
            RetryDecision::AttemptsExhausted { attempts: 3 }
        );
    }

    #[test]
    fn test_retry_budget_deadline() {
        let mut budget = RetryBudget::new(10, Duration::from_secs(2700), Duration::from_secs(10));
        let decision = budget.record_failure(Duration::from_secs(2700));
        assert!(!decision.should_retry());
        assert!(matches!(decision, RetryDecision::DeadlineExceeded { attempts: 1, .. }));
    }

    proptest! {
        #[test]
        fn prop_batches_cover_queue(nodes in 0usize..16, queue in 1usize..500, per_node in 0usize..8) {
            let plan = plan_batches(nodes, queue, &auto(per_node));
            prop_assert!(plan.batch_size >= 1);
            prop_assert!(plan.batch_size * plan.total_batches >= queue);
            prop_assert!(plan.batch_size * (plan.total_batches - 1) < queue);
        }

        #[test]
        fn prop_sub_batches_respect_cap(len in 0usize..64, cap in 1usize..8) {
            let items: Vec<usize> = (0..len).collect();
            let chunks = sub_batches(&items, cap);
            prop_assert!(chunks.iter().all(|c| c.len() <= cap));
            prop_assert_eq!(chunks.concat(), items);
        }
    }
}
