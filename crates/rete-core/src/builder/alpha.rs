//! Single-variable rules: one alpha chain feeding the terminal directly.

use super::{BuildContext, RuleAnalysis, alpha_terms};
use crate::rule::Action;
use crate::types::{NodeId, ReteError};

/// Build `Type -> Alpha* -> Terminal`.
///
/// Constant conjuncts join the variable's chain; they hold for every fact
/// or for none.
pub(crate) fn build(
    ctx: &mut BuildContext<'_>,
    analysis: &RuleAnalysis,
    action: Option<Action>,
) -> Result<(NodeId, Option<NodeId>), ReteError> {
    let Some((variable, fact_type)) = analysis.variables.first() else {
        return Err(ReteError::invalid_rule(&ctx.rule, "rule declares no variables"));
    };
    let mut terms = alpha_terms(&analysis.split, variable);
    terms.extend(analysis.split.constant.iter().cloned());
    let tail = ctx.alpha_chain(variable, fact_type, &terms)?;
    Ok(ctx.terminal(tail, Some(variable.clone()), action, false))
}
