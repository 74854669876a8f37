//! # Terminal Nodes
//!
//! End of a rule's subnetwork. Stores complete matches and fires the rule's
//! action once per new match.

use super::{Activation, ActivationEnv};
use crate::memory::WorkingMemory;
use crate::rule::Action;
use crate::token::Token;
use crate::types::{NodeId, RuleId};
use tracing::{debug, warn};

/// Rule-unique sink.
#[derive(Debug, Clone)]
pub struct TerminalNode {
    pub rule: RuleId,
    pub action: Option<Action>,
    /// Set for single-variable rules, whose parent emits facts.
    pub variable: Option<String>,
}

impl TerminalNode {
    #[must_use]
    pub fn new(rule: RuleId, action: Option<Action>, variable: Option<String>) -> Self {
        Self {
            rule,
            action,
            variable,
        }
    }

    pub(crate) fn activate(
        &self,
        id: NodeId,
        memory: &mut WorkingMemory,
        activation: Activation,
        env: &mut ActivationEnv<'_>,
    ) {
        match activation {
            Activation::Left(token) => self.fire(id, memory, token, env),
            Activation::Right { fact, .. } => match &self.variable {
                Some(variable) => self.fire(id, memory, Token::from_fact(variable, fact, id), env),
                None => debug!(rule = %self.rule, "terminal ignored a bare fact"),
            },
            Activation::Retract(fact_id) => {
                let removed = memory.remove_tokens_referencing(&fact_id);
                if !removed.is_empty() {
                    debug!(rule = %self.rule, fact = %fact_id, count = removed.len(), "matches retracted");
                }
            }
            Activation::RetractToken(key) => {
                memory.remove_tokens_covering(&key);
            }
        }
    }

    fn fire(&self, id: NodeId, memory: &mut WorkingMemory, mut token: Token, env: &mut ActivationEnv<'_>) {
        token.node = id;
        if memory.token(&token.key()).is_some() {
            return;
        }
        memory.add_token(token.clone());
        env.metrics.firings += 1;
        debug!(rule = %self.rule, bindings = token.bindings.len(), "rule fired");

        if let Some(action) = &self.action
            && let Err(e) = env.executor.execute(&self.rule, action, &token)
        {
            warn!(rule = %self.rule, action = %action.name(), error = %e, "action failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionExecutor, FnHandler};
    use crate::expr::eval::ArithmeticCache;
    use crate::fact::{Fact, FactId};
    use crate::metrics::NetworkMetrics;
    use crate::rule::ActionArg;
    use crate::types::ReteError;
    use std::sync::Arc;

    #[test]
    fn fires_once_per_match_and_survives_action_errors() {
        let mut cache = ArithmeticCache::new();
        let mut executor = ActionExecutor::new();
        executor.register(Arc::new(FnHandler::new("fail", |_| {
            Err(ReteError::Action {
                action: "fail".to_string(),
                reason: "always".to_string(),
            })
        })));
        let mut metrics = NetworkMetrics::new();
        let mut env = ActivationEnv {
            cache: &mut cache,
            executor: &mut executor,
            metrics: &mut metrics,
        };

        let terminal = TerminalNode::new(
            RuleId::new("r"),
            Some(Action::single("fail", vec![ActionArg::variable("p")])),
            Some("p".to_string()),
        );
        let mut memory = WorkingMemory::new();
        let fact = Arc::new(Fact::new("Person", "P1"));
        terminal.activate(NodeId(3), &mut memory, Activation::right(Arc::clone(&fact)), &mut env);
        terminal.activate(NodeId(3), &mut memory, Activation::right(fact), &mut env);
        assert_eq!(memory.token_count(), 1);
        assert_eq!(env.metrics.firings, 1);

        terminal.activate(
            NodeId(3),
            &mut memory,
            Activation::Retract(FactId::new("Person", "P1")),
            &mut env,
        );
        assert_eq!(memory.token_count(), 0);
        assert_eq!(executor.failures(), 1);
    }
}
