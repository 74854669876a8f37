//! # Network Metrics
//!
//! Counters and snapshots describing a network. Observers only: nothing here
//! influences matching.
//!
//! - `NetworkMetrics`: monotonic counters updated during propagation
//! - `NetworkStats`: point-in-time sizes, computed on demand

use crate::node::NodeType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Monotonic counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMetrics {
    /// Facts inserted into the network.
    pub facts_submitted: u64,
    /// Facts retracted from the network.
    pub facts_retracted: u64,
    /// Node activations processed.
    pub activations: u64,
    /// Terminal firings (new complete matches).
    pub firings: u64,
    /// Conditions whose evaluation failed and counted as a non-match.
    pub evaluation_errors: u64,
    /// Arithmetic cache hits.
    pub cache_hits: u64,
    /// Arithmetic cache misses.
    pub cache_misses: u64,
    /// Nodes obtained from a sharing registry instead of built.
    pub shared_reuses: u64,
    /// Rules added.
    pub rules_added: u64,
    /// Rules removed.
    pub rules_removed: u64,
    /// Transactions committed.
    pub commits: u64,
    /// Transactions rolled back.
    pub rollbacks: u64,
}

impl NetworkMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Share of cache lookups that hit, in `[0, 1]`.
    #[must_use]
    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / total as f64
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Point-in-time description of a network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    /// Node count per node type.
    pub nodes: BTreeMap<NodeType, usize>,
    pub total_nodes: usize,
    pub facts: usize,
    pub types: usize,
    pub rules: usize,
    pub alpha_registry: usize,
    pub beta_registry: usize,
    /// Tokens currently stored in terminals.
    pub matches: usize,
}

impl NetworkStats {
    /// Nodes of one type.
    #[must_use]
    pub fn count(&self, node_type: NodeType) -> usize {
        self.nodes.get(&node_type).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_ratio_handles_no_lookups() {
        let mut metrics = NetworkMetrics::new();
        assert_eq!(metrics.cache_hit_ratio(), 0.0);
        metrics.cache_hits = 3;
        metrics.cache_misses = 1;
        assert!((metrics.cache_hit_ratio() - 0.75).abs() < f64::EPSILON);
        metrics.reset();
        assert_eq!(metrics, NetworkMetrics::default());
    }

    #[test]
    fn stats_count_defaults_to_zero() {
        let stats = NetworkStats::default();
        assert_eq!(stats.count(NodeType::Alpha), 0);
    }
}
