//! # Exists Nodes
//!
//! Existential quantification over one variable.
//!
//! Left tokens bind the rule's regular variables; right facts are candidates
//! for the quantified variable. For each left token the node tracks the set
//! of right facts satisfying the existence condition:
//!
//! | Transition | Positive mode | Negated mode |
//! |------------|---------------|--------------|
//! | 0 -> 1 | emit the token | withdraw the token |
//! | 1 -> 0 | withdraw the token | emit the token |
//!
//! The emitted token is the left token itself; the quantified variable is
//! not bound downstream.

use super::{Activation, ActivationEnv};
use crate::expr::Expr;
use crate::expr::eval::{self, Extended};
use crate::fact::{Fact, FactId};
use crate::memory::WorkingMemory;
use crate::token::{Token, TokenKey};
use crate::types::NodeId;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
struct Supported {
    token: Token,
    support: BTreeSet<FactId>,
}

/// `exists v: T with condition`, or its negation.
#[derive(Debug, Clone)]
pub struct ExistsNode {
    pub main_vars: Vec<String>,
    pub exists_var: String,
    pub exists_type: String,
    pub condition: Option<Expr>,
    pub negated: bool,
    left: BTreeMap<TokenKey, Supported>,
    right: BTreeMap<FactId, Arc<Fact>>,
}

impl ExistsNode {
    #[must_use]
    pub fn new(
        main_vars: Vec<String>,
        exists_var: impl Into<String>,
        exists_type: impl Into<String>,
        condition: Option<Expr>,
        negated: bool,
    ) -> Self {
        Self {
            main_vars,
            exists_var: exists_var.into(),
            exists_type: exists_type.into(),
            condition,
            negated,
            left: BTreeMap::new(),
            right: BTreeMap::new(),
        }
    }

    /// Number of supporting facts for a left token.
    #[must_use]
    pub fn support(&self, key: &TokenKey) -> usize {
        self.left.get(key).map_or(0, |s| s.support.len())
    }

    pub(crate) fn clear(&mut self) {
        self.left.clear();
        self.right.clear();
    }

    fn holds(&self, token: &Token, fact: &Fact, env: &mut ActivationEnv<'_>) -> bool {
        let Some(condition) = &self.condition else {
            return true;
        };
        let bindings = Extended {
            base: token,
            variable: &self.exists_var,
            fact,
        };
        match eval::truthy(condition, &bindings) {
            Ok(result) => result,
            Err(e) => {
                debug!(fact = %fact.internal_id(), error = %e, "existence condition failed");
                env.metrics.evaluation_errors += 1;
                false
            }
        }
    }

    /// Whether a token with `support` supporters is currently emitted.
    fn emitted(&self, support: usize) -> bool {
        (support > 0) != self.negated
    }

    fn emit(id: NodeId, memory: &mut WorkingMemory, token: &Token) -> Option<Activation> {
        let mut out = token.clone();
        out.node = id;
        memory
            .add_token(out.clone())
            .is_none()
            .then_some(Activation::Left(out))
    }

    fn withdraw(memory: &mut WorkingMemory, key: &TokenKey) -> Option<Activation> {
        memory
            .remove_token(key)
            .map(|_| Activation::RetractToken(key.clone()))
    }

    pub(crate) fn activate(
        &mut self,
        id: NodeId,
        memory: &mut WorkingMemory,
        activation: Activation,
        env: &mut ActivationEnv<'_>,
    ) -> Vec<Activation> {
        match activation {
            Activation::Left(token) => {
                let key = token.key();
                if self.left.contains_key(&key) {
                    return Vec::new();
                }
                let support: BTreeSet<FactId> = self
                    .right
                    .iter()
                    .filter(|(_, fact)| self.holds(&token, fact, env))
                    .map(|(fid, _)| fid.clone())
                    .collect();
                let out = if self.emitted(support.len()) {
                    Self::emit(id, memory, &token).into_iter().collect()
                } else {
                    Vec::new()
                };
                self.left.insert(key, Supported { token, support });
                out
            }
            Activation::Right { fact, .. } => {
                if fact.fact_type != self.exists_type {
                    return Vec::new();
                }
                let fact_id = fact.internal_id();
                if self.right.contains_key(&fact_id) {
                    return Vec::new();
                }
                self.right.insert(fact_id.clone(), Arc::clone(&fact));

                let mut newly_supported = Vec::new();
                for (key, entry) in &self.left {
                    if self.holds(&entry.token, &fact, env) {
                        newly_supported.push(key.clone());
                    }
                }
                let mut out = Vec::new();
                for key in newly_supported {
                    let Some(entry) = self.left.get_mut(&key) else {
                        continue;
                    };
                    entry.support.insert(fact_id.clone());
                    if entry.support.len() == 1 {
                        let token = entry.token.clone();
                        let change = if self.negated {
                            Self::withdraw(memory, &key)
                        } else {
                            Self::emit(id, memory, &token)
                        };
                        out.extend(change);
                    }
                }
                out
            }
            Activation::Retract(fact_id) => self.retract(id, memory, &fact_id),
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

    fn retract(&mut self, id: NodeId, memory: &mut WorkingMemory, fact_id: &FactId) -> Vec<Activation> {
        let mut out = Vec::new();

        // A left token's own facts.
        self.left.retain(|key, _| !key.references(fact_id));
        if !memory.remove_tokens_referencing(fact_id).is_empty() {
            out.push(Activation::Retract(fact_id.clone()));
        }

        // A supporter.
        if self.right.remove(fact_id).is_some() {
            let negated = self.negated;
            for (key, entry) in &mut self.left {
                if entry.support.remove(fact_id) && entry.support.is_empty() {
                    let change = if negated {
                        Self::emit(id, memory, &entry.token)
                    } else {
                        Self::withdraw(memory, key)
                    };
                    out.extend(change);
                }
            }
        }
        out
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

    fn node(negated: bool) -> ExistsNode {
        ExistsNode::new(
            vec!["c".to_string()],
            "o",
            "Order",
            Some(Expr::binary(
                Expr::field("o", "customer_id"),
                BinaryOp::Eq,
                Expr::field("c", "id"),
            )),
            negated,
        )
    }

    fn customer(id: &str) -> Token {
        Token::from_fact("c", Arc::new(Fact::new("Customer", id)), NodeId(1))
    }

    fn order(id: &str, customer: &str) -> Activation {
        Activation::right(Arc::new(
            Fact::new("Order", id).with_field("customer_id", customer),
        ))
    }

    #[test]
    fn emits_once_per_supporting_set() {
        let mut services = Services::new();
        let mut memory = WorkingMemory::new();
        let mut exists = node(false);
        let c1 = customer("C1");
        let key = c1.key();

        assert!(exists.activate(NodeId(7), &mut memory, Activation::Left(c1), &mut services.env()).is_empty());
        assert_eq!(exists.activate(NodeId(7), &mut memory, order("O1", "C1"), &mut services.env()).len(), 1);
        assert!(exists.activate(NodeId(7), &mut memory, order("O2", "C1"), &mut services.env()).is_empty());
        assert_eq!(exists.support(&key), 2);
        assert_eq!(memory.token_count(), 1);

        let out = exists.activate(
            NodeId(7),
            &mut memory,
            Activation::Retract(FactId::new("Order", "O1")),
            &mut services.env(),
        );
        assert!(out.is_empty());
        let out = exists.activate(
            NodeId(7),
            &mut memory,
            Activation::Retract(FactId::new("Order", "O2")),
            &mut services.env(),
        );
        assert!(matches!(out.as_slice(), [Activation::RetractToken(k)] if *k == key));
        assert_eq!(memory.token_count(), 0);
    }

    #[test]
    fn late_main_fact_sees_existing_support() {
        let mut services = Services::new();
        let mut memory = WorkingMemory::new();
        let mut exists = node(false);
        exists.activate(NodeId(7), &mut memory, order("O1", "C1"), &mut services.env());
        let out = exists.activate(NodeId(7), &mut memory, Activation::Left(customer("C1")), &mut services.env());
        assert_eq!(out.len(), 1);
        let out = exists.activate(NodeId(7), &mut memory, Activation::Left(customer("C2")), &mut services.env());
        assert!(out.is_empty());
    }

    #[test]
    fn negated_mode_fires_without_support() {
        let mut services = Services::new();
        let mut memory = WorkingMemory::new();
        let mut absent = node(true);
        let out = absent.activate(NodeId(7), &mut memory, Activation::Left(customer("C1")), &mut services.env());
        assert_eq!(out.len(), 1);
        let out = absent.activate(NodeId(7), &mut memory, order("O1", "C1"), &mut services.env());
        assert!(matches!(out.as_slice(), [Activation::RetractToken(_)]));
        let out = absent.activate(
            NodeId(7),
            &mut memory,
            Activation::Retract(FactId::new("Order", "O1")),
            &mut services.env(),
        );
        assert!(matches!(out.as_slice(), [Activation::Left(_)]));
    }

    #[test]
    fn retracting_the_main_fact_withdraws_the_token() {
        let mut services = Services::new();
        let mut memory = WorkingMemory::new();
        let mut exists = node(false);
        exists.activate(NodeId(7), &mut memory, Activation::Left(customer("C1")), &mut services.env());
        exists.activate(NodeId(7), &mut memory, order("O1", "C1"), &mut services.env());
        let out = exists.activate(
            NodeId(7),
            &mut memory,
            Activation::Retract(FactId::new("Customer", "C1")),
            &mut services.env(),
        );
        assert!(matches!(out.as_slice(), [Activation::Retract(_)]));
        assert_eq!(memory.token_count(), 0);
    }
}
