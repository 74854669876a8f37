//! # Network Nodes
//!
//! The node taxonomy of the discrimination network.
//!
//! Every node is a `Node` holding an id, a kind, a working memory and an
//! ordered child list. Parents hold children; children never point back, so
//! the graph has no ownership cycles.
//!
//! ## Activation Protocol
//!
//! | Activation | Meaning |
//! |------------|---------|
//! | `Right` | a fact arrives from the tuple dimension |
//! | `Left` | a partial-match token arrives from the joined prefix |
//! | `Retract` | a fact left the store; dependent state must be purged |
//! | `RetractToken` | an upstream node withdrew a token it emitted |
//!
//! `Node::activate` consumes one activation and returns the activations every
//! child receives, in order. The network drives propagation with an explicit
//! work stack, depth-first, children in insertion order.

pub mod accumulator;
pub mod alpha;
pub mod exists;
pub mod join;
pub mod terminal;

pub use accumulator::{
    AccumulatorNode, AggregateState, AggregationSpec, MultiAccumulatorNode, Threshold,
};
pub use alpha::{AlphaCondition, AlphaNode, PassthroughNode, Side};
pub use exists::ExistsNode;
pub use join::{JoinIndex, JoinNode};
pub use terminal::TerminalNode;

use crate::action::ActionExecutor;
use crate::expr::eval::{ArithmeticCache, EvaluationContext};
use crate::fact::{Fact, FactId, TypeDefinition};
use crate::memory::WorkingMemory;
use crate::metrics::NetworkMetrics;
use crate::store::FactStore;
use crate::token::{Token, TokenKey};
use crate::types::{NodeId, ReteError, RuleId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// ACTIVATIONS
// =============================================================================

/// One unit of propagation.
#[derive(Debug, Clone)]
pub enum Activation {
    /// A fact, with the evaluation context of a decomposed alpha chain.
    Right {
        fact: Arc<Fact>,
        context: Option<EvaluationContext>,
    },
    Left(Token),
    Retract(FactId),
    RetractToken(TokenKey),
}

impl Activation {
    #[must_use]
    pub fn right(fact: Arc<Fact>) -> Self {
        Self::Right {
            fact,
            context: None,
        }
    }
}

/// Network-owned services a node may use while activating.
pub struct ActivationEnv<'a> {
    pub cache: &'a mut ArithmeticCache,
    pub executor: &'a mut ActionExecutor,
    pub metrics: &'a mut NetworkMetrics,
}

// =============================================================================
// NODE TYPES
// =============================================================================

/// Type tag of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Root,
    Type,
    Alpha,
    Passthrough,
    Join,
    Exists,
    Accumulator,
    MultiAccumulator,
    Router,
    Terminal,
}

impl NodeType {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Type => "type",
            Self::Alpha => "alpha",
            Self::Passthrough => "passthrough",
            Self::Join => "join",
            Self::Exists => "exists",
            Self::Accumulator => "accumulator",
            Self::MultiAccumulator => "multi_accumulator",
            Self::Router => "router",
            Self::Terminal => "terminal",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Type node: admits facts of one declared type.
#[derive(Debug, Clone)]
pub struct TypeNode {
    pub definition: TypeDefinition,
}

/// Forwards a shared join's output to one rule's terminal.
#[derive(Debug, Clone)]
pub struct RouterNode {
    pub rule: RuleId,
    pub upstream: NodeId,
    pub terminal: NodeId,
}

/// Node variants and their state.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Root,
    Type(TypeNode),
    Alpha(AlphaNode),
    Passthrough(PassthroughNode),
    Join(JoinNode),
    Exists(ExistsNode),
    Accumulator(AccumulatorNode),
    MultiAccumulator(MultiAccumulatorNode),
    Router(RouterNode),
    Terminal(TerminalNode),
}

impl NodeKind {
    #[must_use]
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Root => NodeType::Root,
            Self::Type(_) => NodeType::Type,
            Self::Alpha(_) => NodeType::Alpha,
            Self::Passthrough(_) => NodeType::Passthrough,
            Self::Join(_) => NodeType::Join,
            Self::Exists(_) => NodeType::Exists,
            Self::Accumulator(_) => NodeType::Accumulator,
            Self::MultiAccumulator(_) => NodeType::MultiAccumulator,
            Self::Router(_) => NodeType::Router,
            Self::Terminal(_) => NodeType::Terminal,
        }
    }
}

// =============================================================================
// NODE
// =============================================================================

/// A node of the network.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub memory: WorkingMemory,
    pub children: Vec<NodeId>,
}

impl Node {
    #[must_use]
    pub fn new(id: NodeId, kind: NodeKind) -> Self {
        Self {
            id,
            kind,
            memory: WorkingMemory::new(),
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    /// Append a child. Returns `false` if it was already attached.
    pub fn add_child(&mut self, child: NodeId) -> bool {
        if self.children.contains(&child) {
            return false;
        }
        self.children.push(child);
        true
    }

    pub fn remove_child(&mut self, child: NodeId) -> bool {
        let before = self.children.len();
        self.children.retain(|c| *c != child);
        self.children.len() != before
    }

    /// Process one activation and return what the children receive.
    ///
    /// Only a Type node rejecting a malformed fact fails. Evaluation errors
    /// are non-matches and action failures are logged.
    pub fn activate(
        &mut self,
        activation: Activation,
        env: &mut ActivationEnv<'_>,
    ) -> Result<Vec<Activation>, ReteError> {
        let id = self.id;
        let memory = &mut self.memory;
        match &mut self.kind {
            NodeKind::Root => Ok(vec![activation]),
            NodeKind::Type(node) => activate_type(node, memory, activation),
            NodeKind::Alpha(node) => Ok(node.activate(memory, activation, env)),
            NodeKind::Passthrough(node) => Ok(node.activate(id, memory, activation)),
            NodeKind::Join(node) => Ok(node.activate(id, memory, activation, env)),
            NodeKind::Exists(node) => Ok(node.activate(id, memory, activation, env)),
            NodeKind::Accumulator(node) => Ok(node.activate(id, memory, activation)),
            NodeKind::MultiAccumulator(node) => Ok(node.activate(id, memory, activation)),
            NodeKind::Router(_) => Ok(vec![activation]),
            NodeKind::Terminal(node) => {
                node.activate(id, memory, activation, env);
                Ok(Vec::new())
            }
        }
    }

    /// What this node has emitted so far, as activations for a new child.
    ///
    /// Replaying this into a freshly attached child brings it up to date
    /// without re-entering the node itself.
    #[must_use]
    pub fn replay(&self, store: &dyn FactStore) -> Vec<Activation> {
        match &self.kind {
            NodeKind::Root => store.all().into_iter().map(Activation::right).collect(),
            NodeKind::Type(node) => store
                .by_type(&node.definition.name)
                .into_iter()
                .map(Activation::right)
                .collect(),
            NodeKind::Alpha(_) => self.memory.facts().cloned().map(Activation::right).collect(),
            NodeKind::Passthrough(node) => self
                .memory
                .facts()
                .map(|fact| node.emit(self.id, Arc::clone(fact)))
                .collect(),
            NodeKind::Join(_)
            | NodeKind::Exists(_)
            | NodeKind::Accumulator(_)
            | NodeKind::MultiAccumulator(_) => {
                self.memory.tokens().cloned().map(Activation::Left).collect()
            }
            NodeKind::Router(_) | NodeKind::Terminal(_) => Vec::new(),
        }
    }

    /// Drop all per-node state, keeping structure.
    pub fn clear_state(&mut self) {
        self.memory.clear();
        match &mut self.kind {
            NodeKind::Join(node) => node.clear(),
            NodeKind::Exists(node) => node.clear(),
            NodeKind::Accumulator(node) => node.clear(),
            NodeKind::MultiAccumulator(node) => node.clear(),
            NodeKind::Root
            | NodeKind::Type(_)
            | NodeKind::Alpha(_)
            | NodeKind::Passthrough(_)
            | NodeKind::Router(_)
            | NodeKind::Terminal(_) => {}
        }
    }
}

// =============================================================================
// NODE ARENA
// =============================================================================

/// Owner of every node of a network, keyed by id.
///
/// Ids are allocated monotonically and never reused.
#[derive(Debug, Clone, Default)]
pub struct NodeArena {
    nodes: BTreeMap<NodeId, Node>,
    next_id: u64,
}

impl NodeArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a node.
    pub fn insert(&mut self, kind: NodeKind) -> NodeId {
        self.next_id += 1;
        let id = NodeId(self.next_id);
        self.nodes.insert(id, Node::new(id, kind));
        id
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Attach `child` under `parent`. Returns `true` if the edge is new.
    pub fn connect(&mut self, parent: NodeId, child: NodeId) -> bool {
        self.nodes
            .get_mut(&parent)
            .is_some_and(|p| p.add_child(child))
    }

    /// Parents of a node.
    #[must_use]
    pub fn parents(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.children.contains(&id))
            .map(|n| n.id)
            .collect()
    }

    /// Remove a node and every edge into it.
    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        for node in self.nodes.values_mut() {
            node.remove_child(id);
        }
        self.nodes.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Keep only the nodes matching `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&Node) -> bool) {
        self.nodes.retain(|_, n| keep(n));
        let live: Vec<NodeId> = self.nodes.keys().copied().collect();
        for node in self.nodes.values_mut() {
            node.children.retain(|c| live.contains(c));
        }
    }
}

fn activate_type(
    node: &TypeNode,
    memory: &mut WorkingMemory,
    activation: Activation,
) -> Result<Vec<Activation>, ReteError> {
    match activation {
        Activation::Right { fact, .. } => {
            if fact.fact_type != node.definition.name {
                return Ok(Vec::new());
            }
            node.definition.validate(&fact)?;
            if memory.add_fact(Arc::clone(&fact)) {
                Ok(vec![Activation::right(fact)])
            } else {
                Ok(Vec::new())
            }
        }
        Activation::Retract(id) => {
            if id.fact_type == node.definition.name && memory.remove_fact(&id).is_some() {
                Ok(vec![Activation::Retract(id)])
            } else {
                Ok(Vec::new())
            }
        }
        Activation::Left(_) | Activation::RetractToken(_) => Ok(Vec::new()),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::FieldType;
    use crate::store::MemoryStore;

    struct Services {
        cache: ArithmeticCache,
        executor: ActionExecutor,
        metrics: NetworkMetrics,
    }

    impl Services {
        fn new() -> Self {
            Self {
                cache: ArithmeticCache::new(),
                executor: ActionExecutor::new(),
                metrics: NetworkMetrics::new(),
            }
        }

        fn env(&mut self) -> ActivationEnv<'_> {
            ActivationEnv {
                cache: &mut self.cache,
                executor: &mut self.executor,
                metrics: &mut self.metrics,
            }
        }
    }

    fn person_node() -> Node {
        Node::new(
            NodeId(1),
            NodeKind::Type(TypeNode {
                definition: TypeDefinition::new("Person").with_field("age", FieldType::Number),
            }),
        )
    }

    #[test]
    fn type_node_admits_matching_facts_once() {
        let mut services = Services::new();
        let mut node = person_node();
        let fact = Arc::new(Fact::new("Person", "P1").with_field("age", 30));

        let out = node
            .activate(Activation::right(Arc::clone(&fact)), &mut services.env())
            .expect("admit");
        assert_eq!(out.len(), 1);
        let again = node
            .activate(Activation::right(fact), &mut services.env())
            .expect("repeat");
        assert!(again.is_empty());
        assert_eq!(node.memory.fact_count(), 1);
    }

    #[test]
    fn type_node_ignores_other_types_and_rejects_malformed() {
        let mut services = Services::new();
        let mut node = person_node();
        let order = Arc::new(Fact::new("Order", "O1"));
        assert!(node
            .activate(Activation::right(order), &mut services.env())
            .expect("ignore")
            .is_empty());

        let bad = Arc::new(Fact::new("Person", "P2").with_field("age", "old"));
        let result = node.activate(Activation::right(bad), &mut services.env());
        assert!(matches!(result, Err(ReteError::Validation { .. })));
        assert_eq!(node.memory.fact_count(), 0);
    }

    #[test]
    fn type_node_retracts_only_known_facts() {
        let mut services = Services::new();
        let mut node = person_node();
        let fact = Arc::new(Fact::new("Person", "P1").with_field("age", 30));
        node.activate(Activation::right(fact), &mut services.env())
            .expect("admit");

        let unknown = node
            .activate(
                Activation::Retract(FactId::new("Person", "P9")),
                &mut services.env(),
            )
            .expect("retract");
        assert!(unknown.is_empty());
        let known = node
            .activate(
                Activation::Retract(FactId::new("Person", "P1")),
                &mut services.env(),
            )
            .expect("retract");
        assert_eq!(known.len(), 1);
        assert_eq!(node.memory.fact_count(), 0);
    }

    #[test]
    fn type_replay_reads_the_store() {
        let mut store = MemoryStore::new();
        store
            .add(Arc::new(Fact::new("Person", "P1").with_field("age", 1)))
            .expect("add");
        store.add(Arc::new(Fact::new("Order", "O1"))).expect("add");
        let node = person_node();
        assert_eq!(node.replay(&store).len(), 1);
    }

    #[test]
    fn arena_removal_drops_incoming_edges() {
        let mut arena = NodeArena::new();
        let root = arena.insert(NodeKind::Root);
        let ty = arena.insert(person_node().kind);
        assert!(arena.connect(root, ty));
        assert!(!arena.connect(root, ty));
        assert_eq!(arena.parents(ty), vec![root]);
        assert!(arena.remove(ty).is_some());
        assert!(arena.get(root).is_some_and(|r| r.children.is_empty()));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn children_are_unique_and_ordered() {
        let mut node = person_node();
        assert!(node.add_child(NodeId(3)));
        assert!(node.add_child(NodeId(2)));
        assert!(!node.add_child(NodeId(3)));
        assert_eq!(node.children, vec![NodeId(3), NodeId(2)]);
        assert!(node.remove_child(NodeId(3)));
        assert!(!node.remove_child(NodeId(3)));
    }
}
