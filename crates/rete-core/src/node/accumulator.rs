//! # Accumulator Nodes
//!
//! Aggregation over the facts related to a main fact.
//!
//! - `AccumulatorNode`: one source pattern joined to the main fact by a
//!   single field equality. Groups are keyed by the join value and updated
//!   incrementally.
//! - `MultiAccumulatorNode`: sits below a join cascade whose tokens bind the
//!   main fact plus one fact per source pattern; aggregates are computed over
//!   the distinct source facts of each main fact.
//!
//! ## Incremental Rules
//!
//! | Function | Insert | Retract | Empty group |
//! |----------|--------|---------|-------------|
//! | SUM | sum += v | sum -= v | 0 |
//! | COUNT | n += 1 | n -= 1 | 0 |
//! | AVG | (sum, n) | symmetric | no match |
//! | MIN / MAX | sorted multiset | evict one | no match |
//!
//! Whenever the aggregate of a main fact changes, the previously emitted
//! token is withdrawn and a new one emitted if every threshold holds.

use super::Activation;
use crate::expr::eval::compare_threshold;
use crate::expr::{AggregateFunction, BinaryOp, Expr};
use crate::fact::{Fact, FactId};
use crate::memory::WorkingMemory;
use crate::token::{Token, TokenKey};
use crate::types::{NodeId, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// AGGREGATE STATE
// =============================================================================

/// `f64` ordered by `total_cmp`, for the MIN/MAX multiset.
#[derive(Debug, Clone, Copy)]
struct OrdF64(f64);

impl PartialEq for OrdF64 {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrdF64 {}

impl PartialOrd for OrdF64 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdF64 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Running aggregate over a multiset of values.
#[derive(Debug, Clone, Default)]
pub struct AggregateState {
    /// Every member, numeric or not.
    count: usize,
    /// Members with a numeric value.
    numeric: usize,
    sum: f64,
    values: BTreeMap<OrdF64, usize>,
}

impl AggregateState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member. `None` counts for COUNT only.
    pub fn insert(&mut self, value: Option<f64>) {
        self.count += 1;
        if let Some(v) = value {
            self.numeric += 1;
            self.sum += v;
            *self.values.entry(OrdF64(v)).or_insert(0) += 1;
        }
    }

    /// Remove a member previously inserted with the same value.
    pub fn remove(&mut self, value: Option<f64>) {
        self.count = self.count.saturating_sub(1);
        if let Some(v) = value {
            self.numeric = self.numeric.saturating_sub(1);
            self.sum -= v;
            if let Some(n) = self.values.get_mut(&OrdF64(v)) {
                *n -= 1;
                if *n == 0 {
                    self.values.remove(&OrdF64(v));
                }
            }
        }
        if self.numeric == 0 {
            self.sum = 0.0;
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Current value, `None` where the function is undefined.
    #[must_use]
    pub fn result(&self, function: AggregateFunction) -> Option<f64> {
        match function {
            AggregateFunction::Count => Some(self.count as f64),
            AggregateFunction::Sum => Some(self.sum),
            AggregateFunction::Avg => (self.numeric > 0).then(|| self.sum / self.numeric as f64),
            AggregateFunction::Min => self.values.keys().next().map(|v| v.0),
            AggregateFunction::Max => self.values.keys().next_back().map(|v| v.0),
        }
    }
}

// =============================================================================
// AGGREGATION SPEC
// =============================================================================

/// A comparison gate on an aggregate value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub operator: BinaryOp,
    pub value: f64,
}

impl Threshold {
    #[must_use]
    pub fn holds(&self, result: f64) -> bool {
        compare_threshold(
            self.operator,
            &Value::Number(result),
            &Value::Number(self.value),
        )
    }
}

/// One aggregation variable: `name = FUNCTION(source.field)`.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationSpec {
    pub name: String,
    pub function: AggregateFunction,
    pub source_var: String,
    pub field: String,
    pub thresholds: Vec<Threshold>,
}

impl AggregationSpec {
    #[must_use]
    pub fn passes(&self, result: f64) -> bool {
        self.thresholds.iter().all(|t| t.holds(result))
    }

    fn value_of(&self, fact: &Fact) -> Option<f64> {
        fact.field(&self.field).and_then(|v| v.as_f64())
    }
}

/// Replace the emitted token at `key` when its aggregates change.
fn reconcile(
    memory: &mut WorkingMemory,
    key: &TokenKey,
    desired: Option<Token>,
    out: &mut Vec<Activation>,
) {
    let current = memory.token(key).map(|t| t.aggregates.clone());
    let wanted = desired.as_ref().map(|t| t.aggregates.clone());
    if current == wanted {
        return;
    }
    if current.is_some() {
        memory.remove_token(key);
        out.push(Activation::RetractToken(key.clone()));
    }
    if let Some(token) = desired {
        memory.add_token(token.clone());
        out.push(Activation::Left(token));
    }
}

// =============================================================================
// SINGLE-SOURCE ACCUMULATOR
// =============================================================================

/// Aggregates one source pattern per main fact, joined on one field pair.
#[derive(Debug, Clone)]
pub struct AccumulatorNode {
    pub main_var: String,
    pub main_type: String,
    pub main_field: String,
    pub source_type: String,
    pub source_field: String,
    pub spec: AggregationSpec,
    mains: BTreeMap<TokenKey, (Token, String)>,
    sources: BTreeMap<FactId, (String, Option<f64>)>,
    groups: BTreeMap<String, AggregateState>,
}

impl AccumulatorNode {
    #[must_use]
    pub fn new(
        main_var: impl Into<String>,
        main_type: impl Into<String>,
        main_field: impl Into<String>,
        source_type: impl Into<String>,
        source_field: impl Into<String>,
        spec: AggregationSpec,
    ) -> Self {
        Self {
            main_var: main_var.into(),
            main_type: main_type.into(),
            main_field: main_field.into(),
            source_type: source_type.into(),
            source_field: source_field.into(),
            spec,
            mains: BTreeMap::new(),
            sources: BTreeMap::new(),
            groups: BTreeMap::new(),
        }
    }

    /// Aggregate state of one join value.
    #[must_use]
    pub fn group(&self, join_value: &Value) -> Option<&AggregateState> {
        self.groups.get(&join_value.index_key())
    }

    pub(crate) fn clear(&mut self) {
        self.mains.clear();
        self.sources.clear();
        self.groups.clear();
    }

    pub(crate) fn activate(
        &mut self,
        id: NodeId,
        memory: &mut WorkingMemory,
        activation: Activation,
    ) -> Vec<Activation> {
        let mut out = Vec::new();
        match activation {
            Activation::Left(token) => {
                let key = token.key();
                if self.mains.contains_key(&key) {
                    return out;
                }
                let Some(group) = token
                    .fact(&self.main_var)
                    .and_then(|f| f.field(&self.main_field))
                    .map(|v| v.index_key())
                else {
                    debug!(node = %id, field = %self.main_field, "main fact has no join value");
                    return out;
                };
                self.mains.insert(key.clone(), (token, group));
                self.refresh(id, memory, &key, &mut out);
            }
            Activation::Right { fact, .. } => {
                if fact.fact_type != self.source_type {
                    return out;
                }
                let fact_id = fact.internal_id();
                if self.sources.contains_key(&fact_id) {
                    return out;
                }
                let Some(group) = fact.field(&self.source_field).map(|v| v.index_key()) else {
                    debug!(node = %id, fact = %fact_id, "source fact has no join value");
                    return out;
                };
                let value = self.spec.value_of(&fact);
                self.groups.entry(group.clone()).or_default().insert(value);
                self.sources.insert(fact_id, (group.clone(), value));
                self.refresh_group(id, memory, &group, &mut out);
            }
            Activation::Retract(fact_id) => {
                if let Some((group, value)) = self.sources.remove(&fact_id) {
                    if let Some(state) = self.groups.get_mut(&group) {
                        state.remove(value);
                        if state.is_empty() {
                            self.groups.remove(&group);
                        }
                    }
                    self.refresh_group(id, memory, &group, &mut out);
                }
                let gone: Vec<TokenKey> = self
                    .mains
                    .keys()
                    .filter(|k| k.references(&fact_id))
                    .cloned()
                    .collect();
                for key in gone {
                    self.mains.remove(&key);
                    reconcile(memory, &key, None, &mut out);
                }
            }
            Activation::RetractToken(key) => {
                let gone: Vec<TokenKey> = self
                    .mains
                    .keys()
                    .filter(|k| k.covers(&key))
                    .cloned()
                    .collect();
                for key in gone {
                    self.mains.remove(&key);
                    reconcile(memory, &key, None, &mut out);
                }
            }
        }
        out
    }

    fn refresh_group(
        &self,
        id: NodeId,
        memory: &mut WorkingMemory,
        group: &str,
        out: &mut Vec<Activation>,
    ) {
        let keys: Vec<TokenKey> = self
            .mains
            .iter()
            .filter(|(_, (_, g))| g == group)
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            self.refresh(id, memory, &key, out);
        }
    }

    fn refresh(&self, id: NodeId, memory: &mut WorkingMemory, key: &TokenKey, out: &mut Vec<Activation>) {
        let Some((token, group)) = self.mains.get(key) else {
            return;
        };
        let empty = AggregateState::new();
        let state = self.groups.get(group).unwrap_or(&empty);
        let desired = state
            .result(self.spec.function)
            .filter(|r| self.spec.passes(*r))
            .map(|r| {
                let mut emitted = token.clone();
                emitted.node = id;
                emitted
                    .aggregates
                    .insert(self.spec.name.clone(), Value::Number(r));
                emitted
            });
        reconcile(memory, key, desired, out);
    }
}

// =============================================================================
// MULTI-SOURCE ACCUMULATOR
// =============================================================================

#[derive(Debug, Clone)]
struct Group {
    main: Arc<Fact>,
    tokens: BTreeMap<TokenKey, Token>,
}

/// Aggregates several source patterns per main fact.
///
/// Only main facts with at least one complete cascade token are known to the
/// node, so an empty source set never fires.
#[derive(Debug, Clone)]
pub struct MultiAccumulatorNode {
    pub main_var: String,
    pub main_type: String,
    pub source_vars: Vec<String>,
    pub aggregations: Vec<AggregationSpec>,
    pub join_conditions: Vec<Expr>,
    groups: BTreeMap<FactId, Group>,
}

impl MultiAccumulatorNode {
    #[must_use]
    pub fn new(
        main_var: impl Into<String>,
        main_type: impl Into<String>,
        source_vars: Vec<String>,
        aggregations: Vec<AggregationSpec>,
        join_conditions: Vec<Expr>,
    ) -> Self {
        Self {
            main_var: main_var.into(),
            main_type: main_type.into(),
            source_vars,
            aggregations,
            join_conditions,
            groups: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub(crate) fn clear(&mut self) {
        self.groups.clear();
    }

    pub(crate) fn activate(
        &mut self,
        id: NodeId,
        memory: &mut WorkingMemory,
        activation: Activation,
    ) -> Vec<Activation> {
        let mut out = Vec::new();
        let mut touched = BTreeSet::new();
        match activation {
            Activation::Left(token) => {
                let Some(main) = token.fact(&self.main_var).cloned() else {
                    return out;
                };
                let main_id = main.internal_id();
                let group = self.groups.entry(main_id.clone()).or_insert_with(|| Group {
                    main,
                    tokens: BTreeMap::new(),
                });
                if group.tokens.insert(token.key(), token).is_none() {
                    touched.insert(main_id);
                }
            }
            Activation::Retract(fact_id) => {
                for (main_id, group) in &mut self.groups {
                    let before = group.tokens.len();
                    group.tokens.retain(|k, _| !k.references(&fact_id));
                    if group.tokens.len() != before || *main_id == fact_id {
                        touched.insert(main_id.clone());
                    }
                }
                if let Some(group) = self.groups.get_mut(&fact_id) {
                    group.tokens.clear();
                }
            }
            Activation::RetractToken(key) => {
                for (main_id, group) in &mut self.groups {
                    let before = group.tokens.len();
                    group.tokens.retain(|k, _| !k.covers(&key));
                    if group.tokens.len() != before {
                        touched.insert(main_id.clone());
                    }
                }
            }
            Activation::Right { .. } => {}
        }
        for main_id in touched {
            self.refresh(id, memory, &main_id, &mut out);
        }
        out
    }

    fn refresh(&mut self, id: NodeId, memory: &mut WorkingMemory, main_id: &FactId, out: &mut Vec<Activation>) {
        let Some(group) = self.groups.get(main_id) else {
            return;
        };
        let base = Token::from_fact(&self.main_var, Arc::clone(&group.main), id);
        let key = base.key();

        if group.tokens.is_empty() {
            self.groups.remove(main_id);
            reconcile(memory, &key, None, out);
            return;
        }

        let mut emitted = base;
        let mut passes = true;
        for spec in &self.aggregations {
            let mut distinct: BTreeMap<FactId, Option<f64>> = BTreeMap::new();
            for token in group.tokens.values() {
                if let Some(source) = token.fact(&spec.source_var) {
                    distinct.insert(source.internal_id(), spec.value_of(source));
                }
            }
            let mut state = AggregateState::new();
            for value in distinct.into_values() {
                state.insert(value);
            }
            match state.result(spec.function) {
                Some(result) if spec.passes(result) => {
                    emitted
                        .aggregates
                        .insert(spec.name.clone(), Value::Number(result));
                }
                _ => {
                    passes = false;
                    break;
                }
            }
        }
        reconcile(memory, &key, passes.then_some(emitted), out);
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_tracks_every_function() {
        let mut state = AggregateState::new();
        assert_eq!(state.result(AggregateFunction::Sum), Some(0.0));
        assert_eq!(state.result(AggregateFunction::Count), Some(0.0));
        assert_eq!(state.result(AggregateFunction::Avg), None);
        assert_eq!(state.result(AggregateFunction::Min), None);

        state.insert(Some(3.0));
        state.insert(Some(1.0));
        state.insert(Some(3.0));
        state.insert(None);
        assert_eq!(state.result(AggregateFunction::Count), Some(4.0));
        assert_eq!(state.result(AggregateFunction::Sum), Some(7.0));
        assert_eq!(state.result(AggregateFunction::Min), Some(1.0));
        assert_eq!(state.result(AggregateFunction::Max), Some(3.0));

        state.remove(Some(1.0));
        assert_eq!(state.result(AggregateFunction::Min), Some(3.0));
        state.remove(Some(3.0));
        assert_eq!(state.result(AggregateFunction::Max), Some(3.0));
        assert_eq!(state.result(AggregateFunction::Avg), Some(3.0));
    }

    fn avg_score() -> AccumulatorNode {
        AccumulatorNode::new(
            "e",
            "Employee",
            "id",
            "Performance",
            "employee_id",
            AggregationSpec {
                name: "avg_score".to_string(),
                function: AggregateFunction::Avg,
                source_var: "p".to_string(),
                field: "score".to_string(),
                thresholds: vec![Threshold {
                    operator: BinaryOp::Ge,
                    value: 4.0,
                }],
            },
        )
    }

    fn performance(id: &str, score: f64) -> Activation {
        Activation::right(Arc::new(
            Fact::new("Performance", id)
                .with_field("employee_id", "E1")
                .with_field("score", score),
        ))
    }

    #[test]
    fn average_threshold_fires_and_withdraws() {
        let mut memory = WorkingMemory::new();
        let mut node = avg_score();
        let employee = Token::from_fact("e", Arc::new(Fact::new("Employee", "E1")), NodeId(1));
        let key = employee.key();

        assert!(node.activate(NodeId(5), &mut memory, Activation::Left(employee)).is_empty());
        assert!(node.activate(NodeId(5), &mut memory, performance("R1", 3.5)).is_empty());
        let out = node.activate(NodeId(5), &mut memory, performance("R2", 4.5));
        assert!(matches!(out.as_slice(), [Activation::Left(t)]
            if t.aggregates.get("avg_score") == Some(&Value::Number(4.0))));

        let out = node.activate(
            NodeId(5),
            &mut memory,
            Activation::Retract(FactId::new("Performance", "R2")),
        );
        assert!(matches!(out.as_slice(), [Activation::RetractToken(k)] if *k == key));
        assert_eq!(memory.token_count(), 0);
    }

    #[test]
    fn changed_value_reemits() {
        let mut memory = WorkingMemory::new();
        let mut node = avg_score();
        node.activate(
            NodeId(5),
            &mut memory,
            Activation::Left(Token::from_fact("e", Arc::new(Fact::new("Employee", "E1")), NodeId(1))),
        );
        node.activate(NodeId(5), &mut memory, performance("R1", 5.0));
        let out = node.activate(NodeId(5), &mut memory, performance("R2", 4.0));
        assert!(matches!(
            out.as_slice(),
            [Activation::RetractToken(_), Activation::Left(_)]
        ));
        assert_eq!(memory.token_count(), 1);
    }

    #[test]
    fn multi_source_aggregates_distinct_sources() {
        let mut memory = WorkingMemory::new();
        let mut node = MultiAccumulatorNode::new(
            "e",
            "Employee",
            vec!["p".to_string()],
            vec![AggregationSpec {
                name: "total".to_string(),
                function: AggregateFunction::Sum,
                source_var: "p".to_string(),
                field: "score".to_string(),
                thresholds: vec![Threshold {
                    operator: BinaryOp::Gt,
                    value: 5.0,
                }],
            }],
            Vec::new(),
        );
        let employee = Arc::new(Fact::new("Employee", "E1"));
        let base = Token::from_fact("e", Arc::clone(&employee), NodeId(1));
        let t1 = base
            .extend("p", Arc::new(Fact::new("Performance", "R1").with_field("score", 3.0)), NodeId(2))
            .expect("t1");
        let t2 = base
            .extend("p", Arc::new(Fact::new("Performance", "R2").with_field("score", 4.0)), NodeId(2))
            .expect("t2");

        assert!(node.activate(NodeId(6), &mut memory, Activation::Left(t1)).is_empty());
        let out = node.activate(NodeId(6), &mut memory, Activation::Left(t2));
        assert!(matches!(out.as_slice(), [Activation::Left(t)]
            if t.aggregates.get("total") == Some(&Value::Number(7.0))));

        let out = node.activate(
            NodeId(6),
            &mut memory,
            Activation::Retract(FactId::new("Employee", "E1")),
        );
        assert!(matches!(out.as_slice(), [Activation::RetractToken(_)]));
        assert_eq!(node.group_count(), 0);
    }
}
