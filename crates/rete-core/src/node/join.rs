//! # Join Nodes
//!
//! Two-input beta nodes.
//!
//! The left input carries tokens binding `left_vars`; the right input carries
//! facts for `right_var`. Every (token, fact) pair satisfying the beta
//! condition yields the token extended with `right_var -> fact`.
//!
//! When the condition contains `left.f == right.g`, the right memory is also
//! indexed by `g`, so a left activation only visits candidate facts. The full
//! condition is still evaluated on every candidate.

use super::{Activation, ActivationEnv};
use crate::expr::Expr;
use crate::expr::canonical::{conjuncts, equality_fields};
use crate::expr::eval::{self, Extended};
use crate::fact::{Fact, FactId};
use crate::memory::WorkingMemory;
use crate::token::{Token, TokenKey};
use crate::types::NodeId;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Right-memory index on an equality join key.
#[derive(Debug, Clone, Default)]
pub struct JoinIndex {
    pub left_var: String,
    pub left_field: String,
    pub right_field: String,
    buckets: BTreeMap<String, BTreeSet<FactId>>,
}

impl JoinIndex {
    /// Index for the first `left.f == right.g` conjunct of `condition`.
    #[must_use]
    pub fn for_condition(condition: &Expr, left_vars: &[String], right_var: &str) -> Option<Self> {
        conjuncts(condition).iter().find_map(|conjunct| {
            let ((a, af), (b, bf)) = equality_fields(conjunct)?;
            let (left_var, left_field, right_field) =
                if b == right_var && left_vars.iter().any(|v| v == a) {
                    (a, af, bf)
                } else if a == right_var && left_vars.iter().any(|v| v == b) {
                    (b, bf, af)
                } else {
                    return None;
                };
            Some(Self {
                left_var: left_var.to_string(),
                left_field: left_field.to_string(),
                right_field: right_field.to_string(),
                buckets: BTreeMap::new(),
            })
        })
    }

    fn insert(&mut self, fact: &Fact) {
        if let Some(value) = fact.field(&self.right_field) {
            self.buckets
                .entry(value.index_key())
                .or_default()
                .insert(fact.internal_id());
        }
    }

    fn remove(&mut self, fact: &Fact) {
        if let Some(value) = fact.field(&self.right_field) {
            let key = value.index_key();
            if let Some(bucket) = self.buckets.get_mut(&key) {
                bucket.remove(&fact.internal_id());
                if bucket.is_empty() {
                    self.buckets.remove(&key);
                }
            }
        }
    }

    /// Candidate right facts for `token`, `None` if the token has no key.
    fn candidates(&self, token: &Token) -> Option<Vec<FactId>> {
        let value = token.fact(&self.left_var)?.field(&self.left_field)?;
        Some(
            self.buckets
                .get(&value.index_key())
                .map(|b| b.iter().cloned().collect())
                .unwrap_or_default(),
        )
    }

    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// A join between accumulated left variables and one right variable.
#[derive(Debug, Clone)]
pub struct JoinNode {
    pub left_vars: Vec<String>,
    pub right_var: String,
    /// Variable to fact type, covering every variable of the condition.
    pub var_types: BTreeMap<String, String>,
    /// Beta condition; `None` joins unconditionally.
    pub condition: Option<Expr>,
    /// Composite identity used by the beta registry.
    pub fingerprint: String,
    pub index: Option<JoinIndex>,
    left: BTreeMap<TokenKey, Token>,
    right: BTreeMap<FactId, Arc<Fact>>,
}

impl JoinNode {
    #[must_use]
    pub fn new(
        left_vars: Vec<String>,
        right_var: impl Into<String>,
        var_types: BTreeMap<String, String>,
        condition: Option<Expr>,
        fingerprint: impl Into<String>,
    ) -> Self {
        let right_var = right_var.into();
        let index = condition
            .as_ref()
            .and_then(|c| JoinIndex::for_condition(c, &left_vars, &right_var));
        Self {
            left_vars,
            right_var,
            var_types,
            condition,
            fingerprint: fingerprint.into(),
            index,
            left: BTreeMap::new(),
            right: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn left_count(&self) -> usize {
        self.left.len()
    }

    #[must_use]
    pub fn right_count(&self) -> usize {
        self.right.len()
    }

    pub(crate) fn clear(&mut self) {
        self.left.clear();
        self.right.clear();
        if let Some(index) = &mut self.index {
            index.buckets.clear();
        }
    }

    pub(crate) fn activate(
        &mut self,
        id: NodeId,
        memory: &mut WorkingMemory,
        activation: Activation,
        env: &mut ActivationEnv<'_>,
    ) -> Vec<Activation> {
        match activation {
            Activation::Left(token) => self.left_activate(id, memory, token, env),
            Activation::Right { fact, .. } => self.right_activate(id, memory, fact, env),
            Activation::Retract(fact_id) => {
                self.left.retain(|key, _| !key.references(&fact_id));
                if let Some(fact) = self.right.remove(&fact_id)
                    && let Some(index) = &mut self.index
                {
                    index.remove(&fact);
                }
                if memory.remove_tokens_referencing(&fact_id).is_empty() {
                    Vec::new()
                } else {
                    vec![Activation::Retract(fact_id)]
                }
            }
            Activation::RetractToken(key) => {
                self.left.retain(|k, _| !k.covers(&key));
                if memory.remove_tokens_covering(&key).is_empty() {
                    Vec::new()
                } else {
                    vec![Activation::RetractToken(key)]
                }
            }
        }
    }

    fn left_activate(
        &mut self,
        id: NodeId,
        memory: &mut WorkingMemory,
        token: Token,
        env: &mut ActivationEnv<'_>,
    ) -> Vec<Activation> {
        let key = token.key();
        if self.left.contains_key(&key) {
            return Vec::new();
        }

        let candidates: Vec<Arc<Fact>> =
            match self.index.as_ref().and_then(|i| i.candidates(&token)) {
                Some(ids) => ids.iter().filter_map(|i| self.right.get(i)).cloned().collect(),
                None => self.right.values().cloned().collect(),
            };

        let mut out = Vec::new();
        for fact in candidates {
            if let Some(joined) = self.pair(id, &token, fact, env)
                && memory.add_token(joined.clone()).is_none()
            {
                out.push(Activation::Left(joined));
            }
        }
        self.left.insert(key, token);
        out
    }

    fn right_activate(
        &mut self,
        id: NodeId,
        memory: &mut WorkingMemory,
        fact: Arc<Fact>,
        env: &mut ActivationEnv<'_>,
    ) -> Vec<Activation> {
        let fact_id = fact.internal_id();
        if self.right.contains_key(&fact_id) {
            return Vec::new();
        }
        if let Some(index) = &mut self.index {
            index.insert(&fact);
        }
        self.right.insert(fact_id, Arc::clone(&fact));

        let mut out = Vec::new();
        for token in self.left.values() {
            if let Some(joined) = self.pair(id, token, Arc::clone(&fact), env)
                && memory.add_token(joined.clone()).is_none()
            {
                out.push(Activation::Left(joined));
            }
        }
        out
    }

    /// The joined token if the pair satisfies the condition.
    fn pair(
        &self,
        id: NodeId,
        token: &Token,
        fact: Arc<Fact>,
        env: &mut ActivationEnv<'_>,
    ) -> Option<Token> {
        if let Some(condition) = &self.condition {
            let bindings = Extended {
                base: token,
                variable: &self.right_var,
                fact: fact.as_ref(),
            };
            match eval::truthy(condition, &bindings) {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => {
                    debug!(node = %id, fact = %fact.internal_id(), error = %e, "join condition failed");
                    env.metrics.evaluation_errors += 1;
                    return None;
                }
            }
        }
        token.extend(&self.right_var, fact, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionExecutor;
    use crate::expr::BinaryOp;
    use crate::expr::eval::ArithmeticCache;
    use crate::metrics::NetworkMetrics;

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

    fn user_order_join() -> JoinNode {
        let condition = Expr::binary(
            Expr::field("u", "id"),
            BinaryOp::Eq,
            Expr::field("o", "user_id"),
        );
        JoinNode::new(
            vec!["u".to_string()],
            "o",
            BTreeMap::from([
                ("u".to_string(), "User".to_string()),
                ("o".to_string(), "Order".to_string()),
            ]),
            Some(condition),
            "fp",
        )
    }

    fn user(id: &str) -> Token {
        Token::from_fact("u", Arc::new(Fact::new("User", id)), NodeId(1))
    }

    fn order(id: &str, user: &str) -> Arc<Fact> {
        Arc::new(Fact::new("Order", id).with_field("user_id", user))
    }

    #[test]
    fn equality_condition_builds_index() {
        let join = user_order_join();
        let index = join.index.as_ref().expect("index");
        assert_eq!(index.left_var, "u");
        assert_eq!(index.left_field, "id");
        assert_eq!(index.right_field, "user_id");
    }

    #[test]
    fn joins_from_either_side() {
        let mut services = Services::new();
        let mut memory = WorkingMemory::new();
        let mut join = user_order_join();

        let out = join.activate(NodeId(9), &mut memory, Activation::Left(user("U1")), &mut services.env());
        assert!(out.is_empty());
        let out = join.activate(NodeId(9), &mut memory, Activation::right(order("O1", "U1")), &mut services.env());
        assert_eq!(out.len(), 1);
        let out = join.activate(NodeId(9), &mut memory, Activation::right(order("O2", "U2")), &mut services.env());
        assert!(out.is_empty());
        let out = join.activate(NodeId(9), &mut memory, Activation::Left(user("U2")), &mut services.env());
        assert_eq!(out.len(), 1);
        assert_eq!(memory.token_count(), 2);
    }

    #[test]
    fn retract_evicts_and_forwards_once() {
        let mut services = Services::new();
        let mut memory = WorkingMemory::new();
        let mut join = user_order_join();
        join.activate(NodeId(9), &mut memory, Activation::Left(user("U1")), &mut services.env());
        join.activate(NodeId(9), &mut memory, Activation::right(order("O1", "U1")), &mut services.env());

        let out = join.activate(
            NodeId(9),
            &mut memory,
            Activation::Retract(FactId::new("Order", "O1")),
            &mut services.env(),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(join.right_count(), 0);
        assert_eq!(memory.token_count(), 0);

        let out = join.activate(
            NodeId(9),
            &mut memory,
            Activation::Retract(FactId::new("User", "U1")),
            &mut services.env(),
        );
        assert!(out.is_empty());
        assert_eq!(join.left_count(), 0);
    }

    #[test]
    fn unconditional_join_is_a_cross_product() {
        let mut services = Services::new();
        let mut memory = WorkingMemory::new();
        let mut join = JoinNode::new(vec!["u".to_string()], "o", BTreeMap::new(), None, "fp");
        join.activate(NodeId(9), &mut memory, Activation::Left(user("U1")), &mut services.env());
        join.activate(NodeId(9), &mut memory, Activation::Left(user("U2")), &mut services.env());
        let out = join.activate(NodeId(9), &mut memory, Activation::right(order("O1", "U9")), &mut services.env());
        assert_eq!(out.len(), 2);
    }
}
