//! Rules with an `existsConstraint`, positive or negated.
//!
//! The left input binds the rule's regular variables: a passthrough for a
//! single variable, a join cascade otherwise. The right input is an alpha
//! chain over the quantified type carrying the conjuncts that only read the
//! quantified variable; everything else is evaluated in the Exists node.

use super::{BuildContext, RuleAnalysis, alpha_terms, join};
use crate::expr::Expr;
use crate::expr::canonical::conjuncts;
use crate::node::{ExistsNode, NodeKind, Side};
use crate::rule::Action;
use crate::types::{NodeId, ReteError};

pub(crate) fn build(
    ctx: &mut BuildContext<'_>,
    analysis: &RuleAnalysis,
    action: Option<Action>,
) -> Result<(NodeId, Option<NodeId>), ReteError> {
    let Some(spec) = &analysis.exists else {
        return Err(ReteError::invalid_rule(&ctx.rule, "missing existsConstraint"));
    };
    let main_vars: Vec<String> = analysis.variables.iter().map(|(n, _)| n.clone()).collect();

    let left = match analysis.variables.as_slice() {
        [(var, fact_type)] => {
            let mut terms = alpha_terms(&analysis.split, var);
            terms.extend(analysis.split.constant.iter().cloned());
            let tail = ctx.alpha_chain(var, fact_type, &terms)?;
            ctx.passthrough(fact_type, var, Side::Left, tail)?
        }
        _ => {
            join::cascade(
                ctx,
                analysis,
                &main_vars,
                &analysis.split.beta,
                &analysis.split.constant,
            )?
            .tail
        }
    };

    let (local, cross): (Vec<Expr>, Vec<Expr>) = conjuncts(&spec.condition).into_iter().partition(|c| {
        let vars = c.variables();
        vars.len() == 1 && vars.contains(&spec.variable)
    });
    let right_tail = ctx.alpha_chain(&spec.variable, &spec.fact_type, &local)?;
    let right = ctx.passthrough(&spec.fact_type, &spec.variable, Side::Right, right_tail)?;

    let node = ctx.add_node(NodeKind::Exists(ExistsNode::new(
        main_vars,
        spec.variable.clone(),
        spec.fact_type.clone(),
        Expr::and(cross),
        spec.negated,
    )));
    ctx.connect(left, node);
    ctx.connect(right, node);
    Ok(ctx.terminal(node, None, action, false))
}
