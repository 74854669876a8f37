//! # Alpha Nodes
//!
//! Single-fact filters below a Type node, and the per-rule passthroughs that
//! feed beta nodes.
//!
//! An alpha node admits a fact if its condition holds for `{variable -> fact}`.
//! A decomposed arithmetic condition becomes a chain of step nodes: compute
//! steps record a value in the evaluation context and never filter, and the
//! final predicate step filters.

use super::{Activation, ActivationEnv};
use crate::expr::Expr;
use crate::expr::canonical::canonical_string;
use crate::expr::decompose::{DecomposedStep, StepKind};
use crate::expr::eval::{self, EvaluationContext, Single};
use crate::fact::Fact;
use crate::memory::WorkingMemory;
use crate::token::Token;
use crate::types::{NodeId, ReteError, RuleId, Value};
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// ALPHA NODE
// =============================================================================

/// What an alpha node tests.
#[derive(Debug, Clone)]
pub enum AlphaCondition {
    /// Admits everything. Used by rules without conditions on a variable.
    Always,
    /// A non-arithmetic conjunct.
    Predicate(Expr),
    /// One step of a decomposed arithmetic conjunct.
    Step {
        step: DecomposedStep,
        /// Canonical source expression, the arithmetic cache key.
        cache_key: String,
    },
}

impl AlphaCondition {
    #[must_use]
    pub fn step(step: DecomposedStep) -> Self {
        let cache_key = canonical_string(&step.source);
        Self::Step { step, cache_key }
    }

    /// Canonical description, used in registry keys.
    #[must_use]
    pub fn canonical(&self) -> String {
        match self {
            Self::Always => "literal(true)".to_string(),
            Self::Predicate(expr) => canonical_string(expr),
            Self::Step { step, .. } => step.result_name.clone(),
        }
    }
}

/// A single-variable filter.
#[derive(Debug, Clone)]
pub struct AlphaNode {
    pub variable: String,
    pub condition: AlphaCondition,
}

impl AlphaNode {
    #[must_use]
    pub fn new(variable: impl Into<String>, condition: AlphaCondition) -> Self {
        Self {
            variable: variable.into(),
            condition,
        }
    }

    pub(crate) fn activate(
        &self,
        memory: &mut WorkingMemory,
        activation: Activation,
        env: &mut ActivationEnv<'_>,
    ) -> Vec<Activation> {
        match activation {
            Activation::Right { fact, context } => {
                let Some(context) = self.admit(&fact, context, env) else {
                    return Vec::new();
                };
                if memory.add_fact(Arc::clone(&fact)) {
                    vec![Activation::Right { fact, context }]
                } else {
                    Vec::new()
                }
            }
            Activation::Retract(id) => {
                if memory.remove_fact(&id).is_some() {
                    vec![Activation::Retract(id)]
                } else {
                    Vec::new()
                }
            }
            Activation::Left(_) | Activation::RetractToken(_) => Vec::new(),
        }
    }

    /// The context to pass on if the fact passes, `None` if it is filtered.
    fn admit(
        &self,
        fact: &Arc<Fact>,
        context: Option<EvaluationContext>,
        env: &mut ActivationEnv<'_>,
    ) -> Option<Option<EvaluationContext>> {
        match &self.condition {
            AlphaCondition::Always => Some(context),
            AlphaCondition::Predicate(expr) => {
                let bindings = Single {
                    variable: &self.variable,
                    fact: fact.as_ref(),
                };
                match eval::truthy(expr, &bindings) {
                    Ok(true) => Some(context),
                    Ok(false) => None,
                    Err(e) => {
                        debug!(fact = %fact.internal_id(), error = %e, "alpha condition failed");
                        env.metrics.evaluation_errors += 1;
                        None
                    }
                }
            }
            AlphaCondition::Step { step, cache_key } => {
                let mut context = context
                    .filter(|c| c.variable == self.variable && c.fact.internal_id() == fact.internal_id())
                    .unwrap_or_else(|| EvaluationContext::new(&self.variable, Arc::clone(fact)));
                match self.run_step(step, cache_key, &mut context, env) {
                    Ok(Value::Bool(false)) if step.kind == StepKind::Predicate => None,
                    Ok(value) => {
                        if step.kind == StepKind::Predicate && value != Value::Bool(true) {
                            debug!(step = %step.result_name, "predicate step is not boolean");
                            env.metrics.evaluation_errors += 1;
                            return None;
                        }
                        context.record(step.result_name.clone(), value);
                        Some(Some(context))
                    }
                    Err(e) => {
                        debug!(
                            fact = %fact.internal_id(),
                            step = %step.result_name,
                            error = %e,
                            "alpha step failed"
                        );
                        env.metrics.evaluation_errors += 1;
                        None
                    }
                }
            }
        }
    }

    fn run_step(
        &self,
        step: &DecomposedStep,
        cache_key: &str,
        context: &mut EvaluationContext,
        env: &mut ActivationEnv<'_>,
    ) -> Result<Value, ReteError> {
        let fact_id = context.fact.internal_id();
        if step.kind == StepKind::Compute {
            if let Some(value) = env.cache.get(&fact_id, cache_key) {
                env.metrics.cache_hits += 1;
                return Ok(value);
            }
            env.metrics.cache_misses += 1;
        }

        // Replayed facts arrive without the results of earlier steps.
        let value = if step.dependencies.iter().all(|d| context.has(d)) {
            eval::evaluate(&step.expr, &*context)?
        } else {
            eval::evaluate(&step.source, &*context)?
        };

        if step.kind == StepKind::Compute {
            env.cache
                .insert(fact_id, cache_key.to_string(), value.clone());
        }
        Ok(value)
    }
}

// =============================================================================
// PASSTHROUGH
// =============================================================================

/// Which input of a beta node a passthrough feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Side {
    /// Emits single-binding tokens.
    Left,
    /// Emits facts.
    Right,
}

impl Side {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
        }
    }
}

/// Unfiltered per-rule adapter between an alpha tail and a beta node.
#[derive(Debug, Clone)]
pub struct PassthroughNode {
    pub rule: RuleId,
    pub fact_type: String,
    pub variable: String,
    pub side: Side,
}

impl PassthroughNode {
    /// Registry key: (rule, type, variable, side).
    #[must_use]
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.rule,
            self.fact_type,
            self.variable,
            self.side.name()
        )
    }

    pub(crate) fn emit(&self, id: NodeId, fact: Arc<Fact>) -> Activation {
        match self.side {
            Side::Left => Activation::Left(Token::from_fact(&self.variable, fact, id)),
            Side::Right => Activation::right(fact),
        }
    }

    pub(crate) fn activate(
        &self,
        id: NodeId,
        memory: &mut WorkingMemory,
        activation: Activation,
    ) -> Vec<Activation> {
        match activation {
            Activation::Right { fact, .. } => {
                if memory.add_fact(Arc::clone(&fact)) {
                    vec![self.emit(id, fact)]
                } else {
                    Vec::new()
                }
            }
            Activation::Retract(id) => {
                if memory.remove_fact(&id).is_some() {
                    vec![Activation::Retract(id)]
                } else {
                    Vec::new()
                }
            }
            Activation::Left(_) | Activation::RetractToken(_) => Vec::new(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
