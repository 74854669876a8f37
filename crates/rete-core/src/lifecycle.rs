//! # Lifecycle Manager
//!
//! Tracks which rules own which nodes.
//!
//! Every node a builder creates or reuses is recorded against the rule being
//! built. A node's refcount is the number of distinct rules owning it; when it
//! reaches zero the network deletes the node.

use crate::node::NodeType;
use crate::types::{NodeId, RuleId};
use std::collections::{BTreeMap, BTreeSet};

/// Ownership record of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLifecycle {
    pub node_type: NodeType,
    pub rules: BTreeSet<RuleId>,
}

impl NodeLifecycle {
    #[must_use]
    pub fn refcount(&self) -> usize {
        self.rules.len()
    }
}

/// Rule to node ownership, both directions.
#[derive(Debug, Clone, Default)]
pub struct LifecycleManager {
    nodes: BTreeMap<NodeId, NodeLifecycle>,
    /// Nodes per rule, in the order the rule first referenced them.
    rule_nodes: BTreeMap<RuleId, Vec<NodeId>>,
}

impl LifecycleManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `rule` owns `node`. Returns the node's refcount.
    ///
    /// Adding the same rule twice is a no-op.
    pub fn add_reference(&mut self, node: NodeId, node_type: NodeType, rule: &RuleId) -> usize {
        let record = self.nodes.entry(node).or_insert_with(|| NodeLifecycle {
            node_type,
            rules: BTreeSet::new(),
        });
        if record.rules.insert(rule.clone()) {
            self.rule_nodes.entry(rule.clone()).or_default().push(node);
        }
        record.refcount()
    }

    /// Drop `rule`'s ownership of `node`. Returns the remaining refcount.
    pub fn remove_reference(&mut self, node: NodeId, rule: &RuleId) -> usize {
        if let Some(nodes) = self.rule_nodes.get_mut(rule) {
            nodes.retain(|n| *n != node);
            if nodes.is_empty() {
                self.rule_nodes.remove(rule);
            }
        }
        match self.nodes.get_mut(&node) {
            Some(record) => {
                record.rules.remove(rule);
                record.refcount()
            }
            None => 0,
        }
    }

    /// Forget a deleted node.
    pub fn forget(&mut self, node: NodeId) {
        self.nodes.remove(&node);
    }

    /// Nodes owned by `rule`, in first-reference order.
    #[must_use]
    pub fn nodes_of(&self, rule: &RuleId) -> Vec<NodeId> {
        self.rule_nodes.get(rule).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn refcount(&self, node: NodeId) -> usize {
        self.nodes.get(&node).map_or(0, NodeLifecycle::refcount)
    }

    #[must_use]
    pub fn get(&self, node: NodeId) -> Option<&NodeLifecycle> {
        self.nodes.get(&node)
    }

    #[must_use]
    pub fn owners(&self, node: NodeId) -> Vec<RuleId> {
        self.nodes
            .get(&node)
            .map(|r| r.rules.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every tracked node with its ownership record.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &NodeLifecycle)> {
        self.nodes.iter().map(|(id, record)| (*id, record))
    }

    #[must_use]
    pub fn tracked(&self) -> usize {
        self.nodes.len()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.rule_nodes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refcount_counts_distinct_rules() {
        let mut lifecycle = LifecycleManager::new();
        let a = RuleId::new("a");
        let b = RuleId::new("b");
        assert_eq!(lifecycle.add_reference(NodeId(1), NodeType::Alpha, &a), 1);
        assert_eq!(lifecycle.add_reference(NodeId(1), NodeType::Alpha, &a), 1);
        assert_eq!(lifecycle.add_reference(NodeId(1), NodeType::Alpha, &b), 2);
        assert_eq!(lifecycle.owners(NodeId(1)), vec![a.clone(), b.clone()]);
        assert_eq!(lifecycle.remove_reference(NodeId(1), &a), 1);
        assert_eq!(lifecycle.remove_reference(NodeId(1), &b), 0);
    }

    #[test]
    fn nodes_of_keeps_first_reference_order() {
        let mut lifecycle = LifecycleManager::new();
        let rule = RuleId::new("r");
        lifecycle.add_reference(NodeId(5), NodeType::Alpha, &rule);
        lifecycle.add_reference(NodeId(2), NodeType::Join, &rule);
        lifecycle.add_reference(NodeId(5), NodeType::Alpha, &rule);
        assert_eq!(lifecycle.nodes_of(&rule), vec![NodeId(5), NodeId(2)]);

        lifecycle.remove_reference(NodeId(5), &rule);
        lifecycle.remove_reference(NodeId(2), &rule);
        assert!(lifecycle.nodes_of(&rule).is_empty());
        lifecycle.forget(NodeId(5));
        assert_eq!(lifecycle.tracked(), 1);
    }
}
