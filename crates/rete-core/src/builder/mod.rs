//! # Rule Builders
//!
//! Translate a rule definition into a subnetwork.
//!
//! `RuleBuilder::build` analyzes the rule, picks a shape and delegates:
//!
//! | Shape | Trigger | Builder |
//! |-------|---------|---------|
//! | `Alpha` | one variable | alpha chain + terminal |
//! | `Join` | two or more variables | alpha chains + join cascade |
//! | `Exists` | an `existsConstraint` | left input + Exists node |
//! | `Accumulator` | aggregation, one equality join | single-source node |
//! | `MultiAccumulator` | any other aggregation | join cascade + multi-source node |
//!
//! Every node a build creates or reuses is recorded with the lifecycle
//! manager under the rule, so a failed build is undone by releasing the rule.
//! Edges from pre-existing nodes into new ones are reported so the network
//! can replay the parent's current output into them.

pub mod accumulator;
pub mod alpha;
pub mod exists;
pub mod join;

use crate::expr::Expr;
use crate::expr::canonical::{SplitConditions, canonical_string, condition_hash, normalize, split_conditions};
use crate::expr::decompose::decompose;
use crate::network::Network;
use crate::node::{
    AggregationSpec, AlphaCondition, AlphaNode, NodeKind, NodeType, PassthroughNode, RouterNode,
    Side, TerminalNode,
};
use crate::primitives::{ALPHA_HASH_PREFIX, PASSTHROUGH_HASH_PREFIX};
use crate::rule::RuleDefinition;
use crate::types::{NodeId, ReteError, RuleId};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

// =============================================================================
// ANALYSIS
// =============================================================================

/// Subnetwork shape of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleShape {
    Alpha,
    Join,
    Exists,
    Accumulator,
    MultiAccumulator,
}

/// The quantified part of an exists rule.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistsSpec {
    pub variable: String,
    pub fact_type: String,
    pub condition: Expr,
    pub negated: bool,
}

/// A rule broken into the pieces builders consume.
#[derive(Debug, Clone)]
pub struct RuleAnalysis {
    /// Regular variables as `(name, type)`, in declaration order.
    pub variables: Vec<(String, String)>,
    pub split: SplitConditions,
    pub exists: Option<ExistsSpec>,
    /// Aggregations from variable declarations and `aggregateConstraint`s.
    pub aggregations: Vec<AggregationSpec>,
    pub shape: RuleShape,
}

impl RuleAnalysis {
    /// Analyze a rule and pick its shape.
    pub fn of(rule: &RuleDefinition) -> Result<Self, ReteError> {
        let id = &rule.rule_id;
        let mut split = rule
            .constraints
            .as_ref()
            .map(split_conditions)
            .unwrap_or_default();

        let mut exists = Vec::new();
        let mut aggregate_constraints = Vec::new();
        for quantifier in std::mem::take(&mut split.quantifiers) {
            match quantifier.unwrapped() {
                Expr::Exists {
                    variable,
                    condition,
                } => exists.push(ExistsSpec {
                    variable: variable.name.clone(),
                    fact_type: variable.data_type.clone(),
                    condition: (**condition).clone(),
                    negated: false,
                }),
                Expr::Not { expression } => match expression.unwrapped() {
                    Expr::Exists {
                        variable,
                        condition,
                    } => exists.push(ExistsSpec {
                        variable: variable.name.clone(),
                        fact_type: variable.data_type.clone(),
                        condition: (**condition).clone(),
                        negated: true,
                    }),
                    other => {
                        return Err(ReteError::invalid_rule(id, format!("unsupported negation of {other}")));
                    }
                },
                aggregate @ Expr::Aggregate { .. } => aggregate_constraints.push(aggregate.clone()),
                other => return Err(ReteError::invalid_rule(id, format!("unsupported quantifier {other}"))),
            }
        }
        if exists.len() > 1 {
            return Err(ReteError::invalid_rule(id, "at most one existsConstraint is supported"));
        }
        let exists = exists.pop();

        let mut variables = rule.variables();
        if let Some(spec) = &exists {
            variables.retain(|(name, _)| *name != spec.variable);
        }
        if variables.is_empty() {
            return Err(ReteError::invalid_rule(id, "rule declares no variables"));
        }

        let aggregations =
            accumulator::collect_aggregations(rule, &aggregate_constraints, &mut split)?;
        if exists.is_some() && !aggregations.is_empty() {
            return Err(ReteError::invalid_rule(id, "exists and aggregation cannot be combined"));
        }

        let declared: BTreeSet<&str> = variables.iter().map(|(n, _)| n.as_str()).collect();
        if let Some(unknown) = split.alpha.keys().find(|v| !declared.contains(v.as_str())) {
            return Err(ReteError::invalid_rule(id, format!("condition references undeclared variable {unknown}")));
        }
        for conjunct in &split.beta {
            if let Some(unknown) = conjunct.variables().into_iter().find(|v| !declared.contains(v.as_str())) {
                return Err(ReteError::invalid_rule(id, format!("condition references undeclared variable {unknown}")));
            }
        }

        let shape = if exists.is_some() {
            RuleShape::Exists
        } else if !aggregations.is_empty() {
            if accumulator::single_source_pair(&variables, &aggregations, &split).is_some() {
                RuleShape::Accumulator
            } else {
                RuleShape::MultiAccumulator
            }
        } else if variables.len() == 1 {
            RuleShape::Alpha
        } else {
            RuleShape::Join
        };

        Ok(Self {
            variables,
            split,
            exists,
            aggregations,
            shape,
        })
    }

    /// Type of a regular variable.
    #[must_use]
    pub fn type_of(&self, variable: &str) -> Option<&str> {
        self.variables
            .iter()
            .find(|(n, _)| n == variable)
            .map(|(_, t)| t.as_str())
    }
}

// =============================================================================
// BUILD REPORT
// =============================================================================

/// What a build produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub rule: RuleId,
    pub shape: RuleShape,
    pub terminal: NodeId,
    /// Nodes created by this build.
    pub created: Vec<NodeId>,
    /// Pre-existing nodes this rule now also owns.
    pub shared: Vec<NodeId>,
    pub router: Option<NodeId>,
    /// New edges from pre-existing parents, in creation order.
    #[serde(skip)]
    pub new_edges: Vec<(NodeId, NodeId)>,
}

// =============================================================================
// BUILD CONTEXT
// =============================================================================

/// Mutable state of one build.
pub struct BuildContext<'a> {
    pub(crate) network: &'a mut Network,
    pub rule: RuleId,
    created: Vec<NodeId>,
    shared: Vec<NodeId>,
    new_edges: Vec<(NodeId, NodeId)>,
}

impl<'a> BuildContext<'a> {
    pub(crate) fn new(network: &'a mut Network, rule: RuleId) -> Self {
        Self {
            network,
            rule,
            created: Vec::new(),
            shared: Vec::new(),
            new_edges: Vec::new(),
        }
    }

    /// Allocate a rule-owned node outside any registry.
    pub fn add_node(&mut self, kind: NodeKind) -> NodeId {
        let node_type = kind.node_type();
        let id = self.network.arena.insert(kind);
        self.record_created(id, node_type);
        id
    }

    fn record_created(&mut self, id: NodeId, node_type: NodeType) {
        self.created.push(id);
        self.network.lifecycle.add_reference(id, node_type, &self.rule);
    }

    /// Take ownership of a pre-existing node.
    pub fn own(&mut self, id: NodeId) {
        let Some(node_type) = self.network.arena.get(id).map(|n| n.node_type()) else {
            return;
        };
        if !self.shared.contains(&id) && !self.created.contains(&id) {
            self.shared.push(id);
        }
        self.network.lifecycle.add_reference(id, node_type, &self.rule);
    }

    pub fn connect(&mut self, parent: NodeId, child: NodeId) {
        if self.network.arena.connect(parent, child) && !self.created.contains(&parent) {
            self.new_edges.push((parent, child));
        }
    }

    pub fn type_node(&self, fact_type: &str) -> Result<NodeId, ReteError> {
        self.network
            .types
            .get(fact_type)
            .copied()
            .ok_or_else(|| ReteError::UnknownType(fact_type.to_string()))
    }

    /// Alpha filter chain for one variable, from its Type node. Returns the tail.
    ///
    /// Conjuncts are ordered canonically so equal sets of conditions build
    /// the same chain. Arithmetic conjuncts contribute one node per step.
    pub fn alpha_chain(
        &mut self,
        variable: &str,
        fact_type: &str,
        conjuncts: &[Expr],
    ) -> Result<NodeId, ReteError> {
        let mut parent = self.type_node(fact_type)?;
        let mut parent_key = format!("type:{fact_type}");

        let mut ordered: Vec<(String, Expr)> = conjuncts
            .iter()
            .map(|c| {
                let n = normalize(c);
                (canonical_string(&n), n)
            })
            .collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0));
        ordered.dedup_by(|a, b| a.0 == b.0);

        let mut conditions = Vec::new();
        let mut seen = BTreeSet::new();
        for (_, conjunct) in ordered {
            if conjunct.has_arithmetic() {
                for step in decompose(&conjunct)? {
                    if seen.insert(step.result_name.clone()) {
                        conditions.push(AlphaCondition::step(step));
                    }
                }
            } else {
                conditions.push(AlphaCondition::Predicate(conjunct));
            }
        }
        if conditions.is_empty() {
            conditions.push(AlphaCondition::Always);
        }

        for condition in conditions {
            let key = format!("{}|{}|{}", condition.canonical(), variable, parent_key);
            let hash = condition_hash(ALPHA_HASH_PREFIX, &key);
            let node = AlphaNode::new(variable, condition);
            let network = &mut *self.network;
            let lookup = network.alpha_registry.get_or_create(&hash, &key, &self.rule, || {
                Ok(network.arena.insert(NodeKind::Alpha(node)))
            })?;
            if lookup.was_shared {
                self.network.metrics.shared_reuses += 1;
                self.own(lookup.node);
            } else {
                self.record_created(lookup.node, NodeType::Alpha);
                self.connect(parent, lookup.node);
            }
            parent = lookup.node;
            parent_key = hash;
        }
        Ok(parent)
    }

    /// Per-rule passthrough under `parent`.
    pub fn passthrough(
        &mut self,
        fact_type: &str,
        variable: &str,
        side: Side,
        parent: NodeId,
    ) -> Result<NodeId, ReteError> {
        let node = PassthroughNode {
            rule: self.rule.clone(),
            fact_type: fact_type.to_string(),
            variable: variable.to_string(),
            side,
        };
        let key = format!("{}|{}", node.key(), parent);
        let hash = condition_hash(PASSTHROUGH_HASH_PREFIX, &key);
        let network = &mut *self.network;
        let lookup = network
            .passthrough_registry
            .get_or_create(&hash, &key, &self.rule, || {
                Ok(network.arena.insert(NodeKind::Passthrough(node)))
            })?;
        if lookup.was_shared {
            self.own(lookup.node);
        } else {
            self.record_created(lookup.node, NodeType::Passthrough);
            self.connect(parent, lookup.node);
        }
        Ok(lookup.node)
    }

    /// Take ownership of a reused node's upstream passthroughs.
    pub fn own_upstream(&mut self, upstream: &[NodeId]) -> Result<(), ReteError> {
        for node in upstream {
            if let Some(hash) = self.network.passthrough_registry.hash_of(*node).map(str::to_string) {
                self.network.passthrough_registry.add_ref(&hash, &self.rule)?;
            }
            self.own(*node);
        }
        Ok(())
    }

    /// The rule's terminal under `parent`, through a router if `via_router`.
    pub fn terminal(
        &mut self,
        parent: NodeId,
        variable: Option<String>,
        action: Option<crate::rule::Action>,
        via_router: bool,
    ) -> (NodeId, Option<NodeId>) {
        let terminal = self.add_node(NodeKind::Terminal(TerminalNode::new(
            self.rule.clone(),
            action,
            variable,
        )));
        if !via_router {
            self.connect(parent, terminal);
            return (terminal, None);
        }
        let router = self.add_node(NodeKind::Router(RouterNode {
            rule: self.rule.clone(),
            upstream: parent,
            terminal,
        }));
        self.connect(router, terminal);
        self.connect(parent, router);
        debug!(rule = %self.rule, upstream = %parent, "router inserted");
        (terminal, Some(router))
    }

    fn finish(self, shape: RuleShape, terminal: NodeId, router: Option<NodeId>) -> BuildReport {
        BuildReport {
            rule: self.rule,
            shape,
            terminal,
            created: self.created,
            shared: self.shared,
            router,
            new_edges: self.new_edges,
        }
    }
}

/// Alpha conjuncts of one variable.
pub(crate) fn alpha_terms(split: &SplitConditions, variable: &str) -> Vec<Expr> {
    split.alpha.get(variable).cloned().unwrap_or_default()
}

// =============================================================================
// RULE BUILDER
// =============================================================================

/// Entry point: rule definition to subnetwork.
pub struct RuleBuilder;

impl RuleBuilder {
    /// Build `rule` into `network`.
    ///
    /// On error the partial subnetwork is still recorded under the rule; the
    /// caller releases it.
    pub fn build(network: &mut Network, rule: &RuleDefinition) -> Result<BuildReport, ReteError> {
        let analysis = RuleAnalysis::of(rule)?;
        let mut ctx = BuildContext::new(network, rule.rule_id.clone());
        let action = rule.action.clone();

        let (terminal, router) = match analysis.shape {
            RuleShape::Alpha => alpha::build(&mut ctx, &analysis, action)?,
            RuleShape::Join => join::build(&mut ctx, &analysis, action)?,
            RuleShape::Exists => exists::build(&mut ctx, &analysis, action)?,
            RuleShape::Accumulator => accumulator::build_single(&mut ctx, &analysis, action)?,
            RuleShape::MultiAccumulator => accumulator::build_multi(&mut ctx, &analysis, action)?,
        };

        let report = ctx.finish(analysis.shape, terminal, router);
        debug!(
            rule = %report.rule,
            shape = ?report.shape,
            created = report.created.len(),
            shared = report.shared.len(),
            "rule built"
        );
        Ok(report)
    }
}

/// Variable-to-type map restricted to `names`.
pub(crate) fn var_types(analysis: &RuleAnalysis, names: &[String]) -> BTreeMap<String, String> {
    names
        .iter()
        .filter_map(|n| analysis.type_of(n).map(|t| (n.clone(), t.to_string())))
        .collect()
}
