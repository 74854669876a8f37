//! # Join Cascades
//!
//! Multi-variable rules join their variables left to right. Level `k` joins
//! the tokens binding `vars[0..k]` with facts of `vars[k]`:
//!
//! ```text
//! alpha(v0) -> pt(L) --\
//!                       join1 --\
//! alpha(v1) -> pt(R) --/         join2 -> ... -> terminal
//!                 alpha(v2) -> pt(R) --/
//! ```
//!
//! A beta conjunct is attached to the level of its highest variable, so it
//! runs as soon as all of its variables are bound. Constants run at level 1.
//!
//! Joins are shared through the beta registry. The fingerprint covers the
//! conditions, the alpha filters of the variables bound so far, their types
//! and the parent join, so two rules reach the same join only when the
//! tokens it would produce are identical.

use super::{BuildContext, RuleAnalysis, alpha_terms, var_types};
use crate::expr::Expr;
use crate::expr::canonical::{canonical_json, canonical_string, condition_hash, normalize};
use crate::node::{JoinNode, NodeKind, NodeType, Side};
use crate::primitives::JOIN_HASH_PREFIX;
use crate::rule::Action;
use crate::types::{NodeId, ReteError};
use serde_json::json;
use std::collections::BTreeMap;

/// End of a join cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cascade {
    pub tail: NodeId,
    /// True if the last join existed before this build.
    pub shared: bool,
}

/// Build `Join*` over `vars` with the given cross-variable conditions.
pub(crate) fn cascade(
    ctx: &mut BuildContext<'_>,
    analysis: &RuleAnalysis,
    vars: &[String],
    beta: &[Expr],
    constants: &[Expr],
) -> Result<Cascade, ReteError> {
    if vars.len() < 2 {
        return Err(ReteError::invalid_rule(&ctx.rule, "a join needs at least two variables"));
    }

    let mut types = Vec::with_capacity(vars.len());
    let mut tails = Vec::with_capacity(vars.len());
    for var in vars {
        let fact_type = analysis
            .type_of(var)
            .ok_or_else(|| ReteError::invalid_rule(&ctx.rule, format!("undeclared variable {var}")))?
            .to_string();
        tails.push(ctx.alpha_chain(var, &fact_type, &alpha_terms(&analysis.split, var))?);
        types.push(fact_type);
    }

    let levels = assign_levels(ctx, vars, beta, constants)?;
    let fingerprints = analysis.split.alpha_fingerprints();

    let mut previous: Option<(NodeId, String)> = None;
    let mut cascade = Cascade {
        tail: NodeId(0),
        shared: false,
    };
    for k in 1..vars.len() {
        let left_vars = vars[..k].to_vec();
        let right_var = vars[k].clone();
        let conditions = levels.get(&k).cloned().unwrap_or_default();

        let mut beta_keys: Vec<String> = conditions.iter().map(|c| canonical_string(&normalize(c))).collect();
        beta_keys.sort();
        let alpha: BTreeMap<&String, &String> = fingerprints
            .iter()
            .filter(|(var, _)| vars[..=k].contains(*var))
            .collect();
        let types_so_far = var_types(analysis, &vars[..=k]);
        let parent = previous.as_ref().map_or("none", |(_, hash)| hash.as_str());
        let fingerprint = canonical_json(&json!({
            "beta": beta_keys,
            "alpha": alpha,
            "varTypes": types_so_far,
            "leftVars": left_vars,
            "rightVars": [right_var],
            "parent": parent,
        }));
        let hash = condition_hash(JOIN_HASH_PREFIX, &fingerprint);

        let node = JoinNode::new(
            left_vars,
            right_var.clone(),
            types_so_far,
            Expr::and(conditions),
            fingerprint.clone(),
        );
        let network = &mut *ctx.network;
        let lookup = network
            .beta_registry
            .get_or_create(&hash, &fingerprint, &ctx.rule, || {
                Ok(network.arena.insert(NodeKind::Join(node)))
            })?;

        if lookup.was_shared {
            ctx.network.metrics.shared_reuses += 1;
            let upstream = ctx
                .network
                .beta_registry
                .get(&hash)
                .map(|e| e.upstream.clone())
                .unwrap_or_default();
            ctx.own(lookup.node);
            ctx.own_upstream(&upstream)?;
        } else {
            ctx.record_created(lookup.node, NodeType::Join);
            let mut upstream = Vec::new();
            match &previous {
                None => {
                    let left = ctx.passthrough(&types[0], &vars[0], Side::Left, tails[0])?;
                    ctx.connect(left, lookup.node);
                    upstream.push(left);
                }
                Some((parent_join, _)) => ctx.connect(*parent_join, lookup.node),
            }
            let right = ctx.passthrough(&types[k], &right_var, Side::Right, tails[k])?;
            ctx.connect(right, lookup.node);
            upstream.push(right);
            ctx.network.beta_registry.set_upstream(&hash, upstream);
        }

        cascade = Cascade {
            tail: lookup.node,
            shared: lookup.was_shared,
        };
        previous = Some((lookup.node, hash));
    }
    Ok(cascade)
}

/// Conditions per join level, keyed by level (1-based).
fn assign_levels(
    ctx: &BuildContext<'_>,
    vars: &[String],
    beta: &[Expr],
    constants: &[Expr],
) -> Result<BTreeMap<usize, Vec<Expr>>, ReteError> {
    let mut levels: BTreeMap<usize, Vec<Expr>> = BTreeMap::new();
    for conjunct in beta {
        let mut level = 1;
        for var in conjunct.variables() {
            let index = vars.iter().position(|v| *v == var).ok_or_else(|| {
                ReteError::invalid_rule(&ctx.rule, format!("condition references unknown variable {var}"))
            })?;
            level = level.max(index);
        }
        levels.entry(level).or_default().push(conjunct.clone());
    }
    levels.entry(1).or_default().extend(constants.iter().cloned());
    Ok(levels)
}

/// Build a plain multi-variable rule.
pub(crate) fn build(
    ctx: &mut BuildContext<'_>,
    analysis: &RuleAnalysis,
    action: Option<Action>,
) -> Result<(NodeId, Option<NodeId>), ReteError> {
    let vars: Vec<String> = analysis.variables.iter().map(|(n, _)| n.clone()).collect();
    let tail = cascade(
        ctx,
        analysis,
        &vars,
        &analysis.split.beta,
        &analysis.split.constant,
    )?;
    Ok(ctx.terminal(tail.tail, None, action, tail.shared))
}
