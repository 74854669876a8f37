//! # Network
//!
//! The RETE network: node arena, fact store, rule table, sharing registries,
//! lifecycle manager, action executor and the active transaction.
//!
//! ## Propagation
//!
//! Every mutation enters at a node and is propagated with an explicit work
//! stack, depth-first, children in insertion order. An activation returns
//! only after every downstream node has observed it.
//!
//! ## Mutation Paths
//!
//! Public mutators wrap their work in a [`Command`](crate::transaction::Command).
//! With a transaction active the command is recorded on its log; otherwise it
//! runs directly. The `apply_*` functions below are what commands call.
//!
//! ## Exclusivity
//!
//! All mutators take `&mut self`. Callers sharing a network across threads
//! wrap it in a mutex, which serializes every operation including the
//! transaction log.

use crate::action::{ActionExecutor, ActionHandler};
use crate::builder::{BuildReport, RuleBuilder};
use crate::expr::eval::ArithmeticCache;
use crate::fact::{Fact, FactId, TypeDefinition};
use crate::lifecycle::LifecycleManager;
use crate::metrics::{NetworkMetrics, NetworkStats};
use crate::node::{Activation, ActivationEnv, Node, NodeArena, NodeKind, NodeType, TypeNode};
use crate::registry::SharingRegistry;
use crate::rule::RuleDefinition;
use crate::store::{FactStore, MemoryStore};
use crate::token::Token;
use crate::transaction::{
    AddFact, AddRule, AddType, Command, RemoveFact, RemoveRule, Transaction, TransactionState,
};
use crate::types::{NodeId, ReteError, RuleId, TransactionId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

fn integrity(reason: impl Into<String>) -> ReteError {
    ReteError::Integrity(reason.into())
}

/// A registered rule and what its build produced.
#[derive(Debug, Clone)]
struct RuleEntry {
    definition: RuleDefinition,
    report: BuildReport,
}

/// A RETE network.
#[derive(Debug)]
pub struct Network {
    pub(crate) arena: NodeArena,
    root: NodeId,
    pub(crate) types: BTreeMap<String, NodeId>,
    rules: BTreeMap<RuleId, RuleEntry>,
    store: Box<dyn FactStore>,
    pub(crate) alpha_registry: SharingRegistry,
    pub(crate) beta_registry: SharingRegistry,
    pub(crate) passthrough_registry: SharingRegistry,
    pub(crate) lifecycle: LifecycleManager,
    cache: ArithmeticCache,
    executor: ActionExecutor,
    pub(crate) metrics: NetworkMetrics,
    transaction: Option<Transaction>,
    finished: BTreeMap<TransactionId, TransactionState>,
    next_transaction: u64,
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

impl Network {
    // =========================================================================
    // CONSTRUCTION
    // =========================================================================

    /// An empty network over an in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_store(Box::new(MemoryStore::new()))
    }

    /// An empty network over `store`.
    #[must_use]
    pub fn with_store(store: Box<dyn FactStore>) -> Self {
        let mut arena = NodeArena::new();
        let root = arena.insert(NodeKind::Root);
        Self {
            arena,
            root,
            types: BTreeMap::new(),
            rules: BTreeMap::new(),
            store,
            alpha_registry: SharingRegistry::new(),
            beta_registry: SharingRegistry::new(),
            passthrough_registry: SharingRegistry::new(),
            lifecycle: LifecycleManager::new(),
            cache: ArithmeticCache::new(),
            executor: ActionExecutor::new(),
            metrics: NetworkMetrics::new(),
            transaction: None,
            finished: BTreeMap::new(),
            next_transaction: 0,
        }
    }

    // =========================================================================
    // TYPES
    // =========================================================================

    /// Declare a fact type. Idempotent on the name.
    pub fn add_type(&mut self, definition: TypeDefinition) -> Result<NodeId, ReteError> {
        let name = definition.name.clone();
        self.run(Box::new(AddType::new(definition)))?;
        self.types
            .get(&name)
            .copied()
            .ok_or(ReteError::UnknownType(name))
    }

    #[must_use]
    pub fn has_type(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    #[must_use]
    pub fn type_definition(&self, name: &str) -> Option<&TypeDefinition> {
        let id = self.types.get(name)?;
        match &self.arena.get(*id)?.kind {
            NodeKind::Type(node) => Some(&node.definition),
            _ => None,
        }
    }

    #[must_use]
    pub fn type_names(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }

    #[must_use]
    pub fn type_node(&self, name: &str) -> Option<NodeId> {
        self.types.get(name).copied()
    }

    // =========================================================================
    // RULES
    // =========================================================================

    /// Build a rule and bring it up to date with the stored facts.
    pub fn add_rule(&mut self, definition: RuleDefinition) -> Result<BuildReport, ReteError> {
        let id = definition.rule_id.clone();
        self.run(Box::new(AddRule::new(definition)))?;
        self.rules
            .get(&id)
            .map(|e| e.report.clone())
            .ok_or(ReteError::RuleNotFound(id))
    }

    /// Remove a rule and every node no other rule owns.
    pub fn remove_rule(&mut self, id: &RuleId) -> Result<RuleDefinition, ReteError> {
        let definition = self
            .rules
            .get(id)
            .map(|e| e.definition.clone())
            .ok_or_else(|| ReteError::RuleNotFound(id.clone()))?;
        self.run(Box::new(RemoveRule::new(id.clone())))?;
        Ok(definition)
    }

    #[must_use]
    pub fn rule(&self, id: &RuleId) -> Option<&RuleDefinition> {
        self.rules.get(id).map(|e| &e.definition)
    }

    #[must_use]
    pub fn build_report(&self, id: &RuleId) -> Option<&BuildReport> {
        self.rules.get(id).map(|e| &e.report)
    }

    #[must_use]
    pub fn has_rule(&self, id: &RuleId) -> bool {
        self.rules.contains_key(id)
    }

    #[must_use]
    pub fn rule_ids(&self) -> Vec<RuleId> {
        self.rules.keys().cloned().collect()
    }

    /// Complete matches currently held by a rule's terminal.
    pub fn matches(&self, id: &RuleId) -> Result<Vec<Token>, ReteError> {
        let entry = self
            .rules
            .get(id)
            .ok_or_else(|| ReteError::RuleNotFound(id.clone()))?;
        Ok(self
            .arena
            .get(entry.report.terminal)
            .map(|n| n.memory.tokens().cloned().collect())
            .unwrap_or_default())
    }

    // =========================================================================
    // FACTS
    // =========================================================================

    /// Insert a fact, replacing any stored fact with the same id.
    ///
    /// The replacement is validated first; an invalid one leaves the stored
    /// fact in place.
    pub fn submit_fact(&mut self, fact: Fact) -> Result<(), ReteError> {
        let id = fact.internal_id();
        if self.store.contains(&id) {
            self.check_fact(&fact)?;
            self.run(Box::new(RemoveFact::new(id)))?;
        }
        self.run(Box::new(AddFact::new(Arc::new(fact))))
    }

    /// Insert a new fact. An id already stored is a `Duplicate`.
    pub fn insert_fact(&mut self, fact: Fact) -> Result<(), ReteError> {
        let id = fact.internal_id();
        if self.store.contains(&id) {
            return Err(ReteError::Duplicate(id));
        }
        self.run(Box::new(AddFact::new(Arc::new(fact))))
    }

    /// Replace a stored fact: retract then insert.
    pub fn update_fact(&mut self, fact: Fact) -> Result<(), ReteError> {
        let id = fact.internal_id();
        if !self.store.contains(&id) {
            return Err(ReteError::NotFound(id));
        }
        self.check_fact(&fact)?;
        self.run(Box::new(RemoveFact::new(id)))?;
        self.run(Box::new(AddFact::new(Arc::new(fact))))
    }

    /// Retract a fact if stored. Returns whether it was.
    pub fn remove_fact(&mut self, id: &FactId) -> Result<bool, ReteError> {
        if !self.store.contains(id) {
            return Ok(false);
        }
        self.run(Box::new(RemoveFact::new(id.clone())))?;
        Ok(true)
    }

    /// Retract a fact. A missing id is `NotFound`.
    pub fn retract_fact(&mut self, id: &FactId) -> Result<(), ReteError> {
        if !self.store.contains(id) {
            return Err(ReteError::NotFound(id.clone()));
        }
        self.run(Box::new(RemoveFact::new(id.clone())))
    }

    /// Check a fact against its declared type without storing it.
    pub fn check_fact(&self, fact: &Fact) -> Result<(), ReteError> {
        self.type_definition(&fact.fact_type)
            .ok_or_else(|| ReteError::UnknownType(fact.fact_type.clone()))?
            .validate(fact)
    }

    #[must_use]
    pub fn get_fact(&self, id: &FactId) -> Option<Arc<Fact>> {
        self.store.get(id)
    }

    #[must_use]
    pub fn facts(&self) -> Vec<Arc<Fact>> {
        self.store.all()
    }

    #[must_use]
    pub fn fact_count(&self) -> usize {
        self.store.len()
    }

    // =========================================================================
    // TRANSACTIONS
    // =========================================================================

    /// Start recording mutations. Only one transaction is active at a time.
    pub fn begin_transaction(&mut self) -> Result<TransactionId, ReteError> {
        if let Some(active) = &self.transaction {
            return Err(ReteError::InvalidState(format!(
                "transaction {} is already active",
                active.id()
            )));
        }
        self.next_transaction += 1;
        let id = TransactionId(self.next_transaction);
        self.transaction = Some(Transaction::new(id));
        debug!(transaction = %id, "transaction started");
        Ok(id)
    }

    pub fn commit(&mut self, id: TransactionId) -> Result<(), ReteError> {
        let mut tx = self.take_transaction(id, "commit")?;
        let recorded = tx.len();
        tx.commit()?;
        self.finished.insert(id, tx.state());
        self.metrics.commits += 1;
        debug!(transaction = %id, commands = recorded, "transaction committed");
        Ok(())
    }

    /// Undo every recorded mutation in reverse.
    ///
    /// If an undo fails the transaction stays active with the failing
    /// command on its log.
    pub fn rollback(&mut self, id: TransactionId) -> Result<(), ReteError> {
        let mut tx = self.take_transaction(id, "roll back")?;
        let recorded = tx.len();
        match tx.rollback(self) {
            Ok(()) => {
                self.finished.insert(id, tx.state());
                self.metrics.rollbacks += 1;
                info!(transaction = %id, commands = recorded, "transaction rolled back");
                Ok(())
            }
            Err(e) => {
                warn!(transaction = %id, error = %e, "rollback incomplete");
                self.transaction = Some(tx);
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn transaction_state(&self, id: TransactionId) -> Option<TransactionState> {
        match &self.transaction {
            Some(tx) if tx.id() == id => Some(tx.state()),
            _ => self.finished.get(&id).copied(),
        }
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    #[must_use]
    pub fn active_transaction(&self) -> Option<TransactionId> {
        self.transaction.as_ref().map(Transaction::id)
    }

    fn take_transaction(&mut self, id: TransactionId, operation: &str) -> Result<Transaction, ReteError> {
        match self.transaction.take() {
            Some(tx) if tx.id() == id => Ok(tx),
            other => {
                self.transaction = other;
                Err(match self.finished.get(&id) {
                    Some(state) => ReteError::InvalidState(format!(
                        "cannot {operation} transaction {id}: already {state}"
                    )),
                    None => ReteError::InvalidState(format!("transaction {id} is not active")),
                })
            }
        }
    }

    fn ensure_idle(&self, operation: &str) -> Result<(), ReteError> {
        match &self.transaction {
            Some(tx) => Err(ReteError::InvalidState(format!(
                "cannot {operation} while transaction {} is active",
                tx.id()
            ))),
            None => Ok(()),
        }
    }

    // =========================================================================
    // CLEARING
    // =========================================================================

    /// Empty every node memory. Topology, rules and stored facts remain.
    pub fn clear_memory(&mut self) -> Result<(), ReteError> {
        self.ensure_idle("clear memory")?;
        for node in self.arena.iter_mut() {
            node.memory.clear();
            node.clear_state();
        }
        self.cache.clear();
        info!("network memory cleared");
        Ok(())
    }

    /// Drop every type, rule and node except the root. Stored facts remain.
    pub fn reset(&mut self) -> Result<(), ReteError> {
        self.ensure_idle("reset")?;
        let root = self.root;
        self.arena.retain(|n| n.id == root);
        if let Some(node) = self.arena.get_mut(root) {
            node.memory.clear();
        }
        self.types.clear();
        self.rules.clear();
        self.alpha_registry.clear();
        self.beta_registry.clear();
        self.passthrough_registry.clear();
        self.lifecycle.clear();
        self.cache.clear();
        info!("network reset");
        Ok(())
    }

    /// [`reset`](Self::reset), then empty the store, the firing history and
    /// the metrics.
    pub fn garbage_collect(&mut self) -> Result<(), ReteError> {
        self.reset()?;
        self.store.clear();
        self.executor.clear_history();
        self.metrics.reset();
        info!("network garbage collected");
        Ok(())
    }

    // =========================================================================
    // INSPECTION
    // =========================================================================

    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.arena.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.arena.iter()
    }

    #[must_use]
    pub fn store(&self) -> &dyn FactStore {
        self.store.as_ref()
    }

    #[must_use]
    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    #[must_use]
    pub fn alpha_registry(&self) -> &SharingRegistry {
        &self.alpha_registry
    }

    #[must_use]
    pub fn beta_registry(&self) -> &SharingRegistry {
        &self.beta_registry
    }

    #[must_use]
    pub fn passthrough_registry(&self) -> &SharingRegistry {
        &self.passthrough_registry
    }

    #[must_use]
    pub fn metrics(&self) -> &NetworkMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn executor(&self) -> &ActionExecutor {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut ActionExecutor {
        &mut self.executor
    }

    /// Register an action handler, replacing one with the same name.
    pub fn register_handler(&mut self, handler: Arc<dyn ActionHandler>) {
        if let Some(previous) = self.executor.register(handler) {
            debug!(action = %previous.name(), "action handler replaced");
        }
    }

    /// Snapshot of the network's shape.
    #[must_use]
    pub fn stats(&self) -> NetworkStats {
        let mut nodes: BTreeMap<NodeType, usize> = BTreeMap::new();
        let mut matches = 0;
        for node in self.arena.iter() {
            *nodes.entry(node.node_type()).or_insert(0) += 1;
            if node.node_type() == NodeType::Terminal {
                matches += node.memory.token_count();
            }
        }
        NetworkStats {
            nodes,
            total_nodes: self.arena.len(),
            facts: self.store.len(),
            types: self.types.len(),
            rules: self.rules.len(),
            alpha_registry: self.alpha_registry.len(),
            beta_registry: self.beta_registry.len(),
            matches,
        }
    }

    // =========================================================================
    // VALIDATION
    // =========================================================================

    /// Check the network's structure against its bookkeeping.
    ///
    /// Fails with `Integrity` on the first inconsistency:
    ///
    /// - an edge to a missing node, a non-Type child of the root, a type
    ///   table entry not naming its Type node, or a node without a parent;
    /// - a rule node the lifecycle manager does not track with its real
    ///   type, owned by no rule or by an unregistered one;
    /// - a lifecycle record or registry entry for a deleted node;
    /// - registry owners differing from lifecycle owners;
    /// - a node memory holding a fact the store does not;
    /// - any failure of [`validate_rule`](Self::validate_rule).
    pub fn validate(&self) -> Result<(), ReteError> {
        self.validate_structure()?;
        self.validate_lifecycle()?;
        self.validate_registries()?;
        self.validate_memories()?;
        for id in self.rules.keys() {
            self.validate_rule(id)?;
        }
        Ok(())
    }

    /// Check that a rule's nodes exist and end in its own terminal.
    pub fn validate_rule(&self, id: &RuleId) -> Result<(), ReteError> {
        let entry = self
            .rules
            .get(id)
            .ok_or_else(|| ReteError::RuleNotFound(id.clone()))?;
        let terminal = entry.report.terminal;
        match self.arena.get(terminal).map(|n| &n.kind) {
            Some(NodeKind::Terminal(node)) if node.rule == *id => {}
            _ => return Err(integrity(format!("rule {id} has no terminal at {terminal}"))),
        }
        let nodes = self.lifecycle.nodes_of(id);
        if !nodes.contains(&terminal) {
            return Err(integrity(format!("rule {id} does not own its terminal {terminal}")));
        }
        if let Some(missing) = nodes.iter().find(|n| !self.arena.contains(**n)) {
            return Err(integrity(format!("rule {id} owns deleted node {missing}")));
        }
        Ok(())
    }

    fn validate_structure(&self) -> Result<(), ReteError> {
        let root = self
            .arena
            .get(self.root)
            .ok_or_else(|| integrity("root node is missing"))?;
        for child in &root.children {
            match self.arena.get(*child).map(|n| n.node_type()) {
                Some(NodeType::Type) => {}
                Some(other) => return Err(integrity(format!("root has {other} child {child}"))),
                None => return Err(integrity(format!("root has dangling child {child}"))),
            }
        }
        for (name, id) in &self.types {
            match self.arena.get(*id).map(|n| &n.kind) {
                Some(NodeKind::Type(node)) if node.definition.name == *name => {}
                _ => return Err(integrity(format!("type {name} does not resolve to its node {id}"))),
            }
            if !root.children.contains(id) {
                return Err(integrity(format!("type {name} is not attached to the root")));
            }
        }

        let mut with_parent = BTreeSet::new();
        for node in self.arena.iter() {
            for child in &node.children {
                if !self.arena.contains(*child) {
                    return Err(integrity(format!("{} has dangling child {child}", node.id)));
                }
                with_parent.insert(*child);
            }
        }
        if let Some(orphan) = self
            .arena
            .iter()
            .find(|n| n.id != self.root && !with_parent.contains(&n.id))
        {
            return Err(integrity(format!("{} node {} has no parent", orphan.node_type(), orphan.id)));
        }
        Ok(())
    }

    fn validate_lifecycle(&self) -> Result<(), ReteError> {
        for node in self.arena.iter() {
            let node_type = node.node_type();
            if matches!(node_type, NodeType::Root | NodeType::Type) {
                continue;
            }
            let record = self
                .lifecycle
                .get(node.id)
                .ok_or_else(|| integrity(format!("{node_type} node {} is not tracked", node.id)))?;
            if record.node_type != node_type {
                return Err(integrity(format!(
                    "{} is tracked as {} but is {node_type}",
                    node.id, record.node_type
                )));
            }
            if record.rules.is_empty() {
                return Err(integrity(format!("{node_type} node {} is owned by no rule", node.id)));
            }
            if let Some(rule) = record.rules.iter().find(|r| !self.rules.contains_key(*r)) {
                return Err(integrity(format!("{} is owned by unregistered rule {rule}", node.id)));
            }
        }
        if let Some((stale, _)) = self.lifecycle.iter().find(|(id, _)| !self.arena.contains(*id)) {
            return Err(integrity(format!("lifecycle still tracks deleted node {stale}")));
        }
        Ok(())
    }

    fn validate_registries(&self) -> Result<(), ReteError> {
        for (label, registry) in [
            ("alpha", &self.alpha_registry),
            ("beta", &self.beta_registry),
            ("passthrough", &self.passthrough_registry),
        ] {
            for (hash, entry) in registry.entries() {
                if !self.arena.contains(entry.node) {
                    return Err(integrity(format!("{label} entry {hash} names deleted node {}", entry.node)));
                }
                if registry.hash_of(entry.node) != Some(hash.as_str()) {
                    return Err(integrity(format!("{label} entry {hash} is not indexed by node")));
                }
                let owners = self.lifecycle.get(entry.node).map(|r| &r.rules);
                if owners != Some(&entry.rules) {
                    return Err(integrity(format!(
                        "{label} entry {hash} has refcount {} but node {} has {}",
                        entry.refcount(),
                        entry.node,
                        self.lifecycle.refcount(entry.node)
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_memories(&self) -> Result<(), ReteError> {
        for node in self.arena.iter() {
            if let Some(fact) = node
                .memory
                .facts()
                .find(|f| !self.store.contains(&f.internal_id()))
            {
                return Err(integrity(format!(
                    "{} holds fact {} missing from the store",
                    node.id,
                    fact.internal_id()
                )));
            }
        }
        Ok(())
    }

    // =========================================================================
    // COMMAND TARGETS
    // =========================================================================

    fn run(&mut self, mut command: Box<dyn Command>) -> Result<(), ReteError> {
        match self.transaction.take() {
            Some(mut tx) => {
                let result = tx.record_and_execute(command, self);
                self.transaction = Some(tx);
                result
            }
            None => command.execute(self),
        }
    }

    /// Store a fact and propagate it from the root.
    pub(crate) fn apply_insert(&mut self, fact: Arc<Fact>) -> Result<(), ReteError> {
        self.check_fact(&fact)?;
        self.store.add(Arc::clone(&fact))?;
        self.metrics.facts_submitted += 1;

        let id = fact.internal_id();
        if let Err(e) = self.propagate(self.root, Activation::right(fact)) {
            if let Err(cleanup) = self.apply_retract(&id) {
                warn!(fact = %id, error = %cleanup, "cleanup after failed insert failed");
            }
            return Err(e);
        }
        debug!(fact = %id, "fact inserted");
        Ok(())
    }

    /// Remove a fact from the store and every memory.
    pub(crate) fn apply_retract(&mut self, id: &FactId) -> Result<Arc<Fact>, ReteError> {
        let fact = self.store.remove(id)?;
        self.cache.invalidate(id);
        self.metrics.facts_retracted += 1;
        self.propagate(self.root, Activation::Retract(id.clone()))?;
        debug!(fact = %id, "fact retracted");
        Ok(fact)
    }

    /// Add a Type node under the root. Returns the node and whether it is new.
    pub(crate) fn apply_add_type(&mut self, definition: TypeDefinition) -> Result<(NodeId, bool), ReteError> {
        if let Some(id) = self.types.get(&definition.name) {
            return Ok((*id, false));
        }
        let name = definition.name.clone();
        let node = self.arena.insert(NodeKind::Type(TypeNode { definition }));
        self.arena.connect(self.root, node);
        self.types.insert(name.clone(), node);

        if let Err(e) = self.replay_edges(&[(self.root, node)]) {
            self.arena.remove(node);
            self.types.remove(&name);
            return Err(e);
        }
        debug!(fact_type = %name, node = %node, "type added");
        Ok((node, true))
    }

    /// Remove a Type node nothing is attached to.
    pub(crate) fn apply_remove_type(&mut self, name: &str) -> Result<(), ReteError> {
        let id = self
            .types
            .get(name)
            .copied()
            .ok_or_else(|| ReteError::UnknownType(name.to_string()))?;
        if self.arena.get(id).is_some_and(|n| !n.children.is_empty()) {
            return Err(ReteError::InvalidState(format!(
                "type {name} still has rules attached"
            )));
        }
        self.arena.remove(id);
        self.types.remove(name);
        debug!(fact_type = %name, "type removed");
        Ok(())
    }

    /// Build a rule, then replay existing output into its new edges.
    ///
    /// On failure every node the rule acquired is released again.
    pub(crate) fn apply_add_rule(&mut self, definition: RuleDefinition) -> Result<BuildReport, ReteError> {
        let id = definition.rule_id.clone();
        if self.rules.contains_key(&id) {
            return Err(ReteError::invalid_rule(&id, "a rule with this id already exists"));
        }
        let report = match RuleBuilder::build(self, &definition) {
            Ok(report) => report,
            Err(e) => {
                self.release_rule_nodes(&id);
                return Err(e);
            }
        };
        if let Err(e) = self.replay_edges(&report.new_edges) {
            self.release_rule_nodes(&id);
            return Err(e);
        }

        self.rules.insert(
            id.clone(),
            RuleEntry {
                definition,
                report: report.clone(),
            },
        );
        self.metrics.rules_added += 1;
        info!(
            rule = %id,
            shape = ?report.shape,
            created = report.created.len(),
            shared = report.shared.len(),
            "rule added"
        );
        Ok(report)
    }

    pub(crate) fn apply_remove_rule(&mut self, id: &RuleId) -> Result<RuleDefinition, ReteError> {
        let entry = self
            .rules
            .remove(id)
            .ok_or_else(|| ReteError::RuleNotFound(id.clone()))?;
        self.release_rule_nodes(id);
        self.metrics.rules_removed += 1;
        info!(rule = %id, "rule removed");
        Ok(entry.definition)
    }

    /// Drop a rule's references, deleting nodes no rule owns anymore.
    ///
    /// Walks newest first so a node goes before the nodes feeding it.
    fn release_rule_nodes(&mut self, rule: &RuleId) {
        for node in self.lifecycle.nodes_of(rule).into_iter().rev() {
            for registry in [
                &mut self.alpha_registry,
                &mut self.beta_registry,
                &mut self.passthrough_registry,
            ] {
                if let Some(hash) = registry.hash_of(node).map(str::to_string) {
                    registry.release(&hash, rule);
                }
            }
            if self.lifecycle.remove_reference(node, rule) == 0 {
                self.arena.remove(node);
                for registry in [
                    &mut self.alpha_registry,
                    &mut self.beta_registry,
                    &mut self.passthrough_registry,
                ] {
                    registry.unregister_node(node);
                }
                self.lifecycle.forget(node);
                debug!(rule = %rule, node = %node, "node deleted");
            }
        }
    }

    // =========================================================================
    // PROPAGATION
    // =========================================================================

    /// Push `activation` into `start` and everything below it.
    fn propagate(&mut self, start: NodeId, activation: Activation) -> Result<(), ReteError> {
        let mut stack = vec![(start, activation)];
        while let Some((id, activation)) = stack.pop() {
            let Some(node) = self.arena.get_mut(id) else {
                continue;
            };
            self.metrics.activations += 1;
            let mut env = ActivationEnv {
                cache: &mut self.cache,
                executor: &mut self.executor,
                metrics: &mut self.metrics,
            };
            let outputs = node.activate(activation, &mut env)?;
            if outputs.is_empty() || node.children.is_empty() {
                continue;
            }
            for output in outputs.into_iter().rev() {
                for child in node.children.iter().rev() {
                    stack.push((*child, output.clone()));
                }
            }
        }
        Ok(())
    }

    /// Feed each parent's current output into the new child only.
    fn replay_edges(&mut self, edges: &[(NodeId, NodeId)]) -> Result<(), ReteError> {
        for (parent, child) in edges {
            let Some(node) = self.arena.get(*parent) else {
                continue;
            };
            let activations = node.replay(self.store.as_ref());
            debug!(parent = %parent, child = %child, count = activations.len(), "replaying into new edge");
            for activation in activations {
                self.propagate(*child, activation)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{BinaryOp, Expr};
    use crate::fact::FieldType;
    use crate::rule::ActionArg;

    fn person_type() -> TypeDefinition {
        TypeDefinition::new("Person")
            .with_field("age", FieldType::Number)
            .with_field("name", FieldType::String)
    }

    fn person(id: &str, age: f64) -> Fact {
        Fact::new("Person", id)
            .with_field("age", age)
            .with_field("name", id)
    }

    fn adults() -> RuleDefinition {
        RuleDefinition::new("adults")
            .with_pattern(&[("p", "Person")])
            .with_condition(Expr::binary(
                Expr::field("p", "age"),
                BinaryOp::Gt,
                Expr::number(18.0),
            ))
            .with_action("print", vec![ActionArg::field("p", "name")])
    }

    #[test]
    fn add_type_is_idempotent() {
        let mut network = Network::new();
        let first = network.add_type(person_type()).expect("type");
        let second = network.add_type(person_type()).expect("type");
        assert_eq!(first, second);
        assert_eq!(network.stats().count(NodeType::Type), 1);
    }

    #[test]
    fn facts_of_unknown_types_are_rejected() {
        let mut network = Network::new();
        let err = network.insert_fact(person("P1", 30.0)).expect_err("unknown type");
        assert!(matches!(err, ReteError::UnknownType(_)));
        assert_eq!(network.fact_count(), 0);
    }

    #[test]
    fn rule_added_late_sees_stored_facts() {
        let mut network = Network::new();
        network.add_type(person_type()).expect("type");
        network.insert_fact(person("P1", 30.0)).expect("insert");
        network.insert_fact(person("P2", 10.0)).expect("insert");

        network.add_rule(adults()).expect("rule");
        let matches = network.matches(&RuleId::new("adults")).expect("matches");
        assert_eq!(matches.len(), 1);
        assert_eq!(network.metrics().firings, 1);
    }

    #[test]
    fn insert_update_remove_paths() {
        let mut network = Network::new();
        network.add_type(person_type()).expect("type");
        network.add_rule(adults()).expect("rule");
        let rule = RuleId::new("adults");

        network.insert_fact(person("P1", 10.0)).expect("insert");
        assert!(matches!(
            network.insert_fact(person("P1", 10.0)),
            Err(ReteError::Duplicate(_))
        ));
        assert!(network.matches(&rule).expect("matches").is_empty());

        network.update_fact(person("P1", 40.0)).expect("update");
        assert_eq!(network.matches(&rule).expect("matches").len(), 1);

        let id = FactId::new("Person", "P1");
        assert!(network.remove_fact(&id).expect("remove"));
        assert!(!network.remove_fact(&id).expect("remove"));
        assert!(matches!(network.retract_fact(&id), Err(ReteError::NotFound(_))));
        assert!(network.matches(&rule).expect("matches").is_empty());
    }

    #[test]
    fn removing_a_rule_deletes_its_nodes() {
        let mut network = Network::new();
        network.add_type(person_type()).expect("type");
        let before = network.stats().total_nodes;
        network.add_rule(adults()).expect("rule");
        assert!(network.stats().total_nodes > before);

        network.remove_rule(&RuleId::new("adults")).expect("remove");
        assert_eq!(network.stats().total_nodes, before);
        assert!(network.alpha_registry().is_empty());
        assert_eq!(network.lifecycle().tracked(), 0);
        assert!(matches!(
            network.remove_rule(&RuleId::new("adults")),
            Err(ReteError::RuleNotFound(_))
        ));
    }

    #[test]
    fn clearing_is_progressively_destructive() {
        let mut network = Network::new();
        network.add_type(person_type()).expect("type");
        network.add_rule(adults()).expect("rule");
        network.insert_fact(person("P1", 30.0)).expect("insert");

        network.clear_memory().expect("clear");
        assert_eq!(network.stats().matches, 0);
        assert_eq!(network.stats().rules, 1);
        assert_eq!(network.fact_count(), 1);

        network.reset().expect("reset");
        assert_eq!(network.stats().total_nodes, 1);
        assert_eq!(network.stats().rules, 0);
        assert_eq!(network.fact_count(), 1);

        network.garbage_collect().expect("gc");
        assert_eq!(network.fact_count(), 0);
        assert_eq!(network.metrics().facts_submitted, 0);
    }

    #[test]
    fn clearing_is_refused_inside_a_transaction() {
        let mut network = Network::new();
        let tx = network.begin_transaction().expect("begin");
        assert!(matches!(network.reset(), Err(ReteError::InvalidState(_))));
        network.commit(tx).expect("commit");
        network.reset().expect("reset");
    }

    #[test]
    fn rollback_undoes_structure_and_facts() {
        let mut network = Network::new();
        let tx = network.begin_transaction().expect("begin");
        network.add_type(person_type()).expect("type");
        network.add_rule(adults()).expect("rule");
        network.insert_fact(person("P1", 30.0)).expect("insert");
        assert!(matches!(network.begin_transaction(), Err(ReteError::InvalidState(_))));

        network.rollback(tx).expect("rollback");
        assert_eq!(network.fact_count(), 0);
        assert!(!network.has_rule(&RuleId::new("adults")));
        assert!(!network.has_type("Person"));
        assert_eq!(network.stats().total_nodes, 1);
        assert_eq!(network.transaction_state(tx), Some(TransactionState::RolledBack));
        assert!(matches!(network.commit(tx), Err(ReteError::InvalidState(_))));
    }

    fn built() -> Network {
        let mut network = Network::new();
        network.add_type(person_type()).expect("type");
        network.add_rule(adults()).expect("rule");
        network.insert_fact(person("P1", 30.0)).expect("insert");
        network.validate().expect("fresh network is consistent");
        network
    }

    fn integrity_error(network: &Network) -> bool {
        matches!(network.validate(), Err(ReteError::Integrity(_)))
    }

    #[test]
    fn validate_detects_dangling_edge() {
        let mut network = built();
        let root = network.root();
        assert!(network.arena.connect(root, NodeId(999)));
        assert!(integrity_error(&network));
    }

    #[test]
    fn validate_detects_untracked_node() {
        let mut network = built();
        let terminal = network
            .build_report(&RuleId::new("adults"))
            .expect("report")
            .terminal;
        network.lifecycle.forget(terminal);
        assert!(integrity_error(&network));
    }

    #[test]
    fn validate_detects_refcount_drift() {
        let mut network = built();
        let hash = network
            .alpha_registry
            .entries()
            .next()
            .map(|(hash, _)| hash.clone())
            .expect("alpha entry");
        network
            .alpha_registry
            .add_ref(&hash, &RuleId::new("ghost"))
            .expect("add ref");
        assert!(integrity_error(&network));
    }

    #[test]
    fn validate_detects_orphan() {
        let mut network = built();
        let terminal = network
            .build_report(&RuleId::new("adults"))
            .expect("report")
            .terminal;
        for parent in network.arena.parents(terminal) {
            if let Some(node) = network.arena.get_mut(parent) {
                node.remove_child(terminal);
            }
        }
        assert!(integrity_error(&network));
        assert!(network.validate_rule(&RuleId::new("adults")).is_ok());
    }

    #[test]
    fn validate_detects_memory_without_fact() {
        let mut network = built();
        network
            .store
            .remove(&FactId::new("Person", "P1"))
            .expect("stored");
        assert!(integrity_error(&network));
    }
}
