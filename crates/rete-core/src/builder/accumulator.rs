//! # Aggregation Rules
//!
//! Aggregations come from two places:
//!
//! - aggregation variables: `total = SUM(o.amount)`, optionally gated by
//!   `operator`/`threshold` or by conditions on the variable name;
//! - `aggregateConstraint` conjuncts: `SUM(o.amount) > 100`, named
//!   `sum_o_amount`.
//!
//! A rule with one aggregation, one source pattern and a single field
//! equality between main and source gets an `AccumulatorNode`. Anything
//! else joins all patterns first and aggregates below the cascade.

use super::{BuildContext, RuleAnalysis, alpha_terms, join};
use crate::expr::canonical::{SplitConditions, equality_fields};
use crate::expr::{BinaryOp, Expr};
use crate::node::{AccumulatorNode, AggregationSpec, MultiAccumulatorNode, NodeKind, Side, Threshold};
use crate::rule::{Action, FieldRef, RuleDefinition};
use crate::types::{NodeId, ReteError, RuleId};

// =============================================================================
// COLLECTION
// =============================================================================

/// Gather every aggregation of a rule.
///
/// Alpha conjuncts on an aggregation variable's name become thresholds and
/// are removed from `split`.
pub(crate) fn collect_aggregations(
    rule: &RuleDefinition,
    constraints: &[Expr],
    split: &mut SplitConditions,
) -> Result<Vec<AggregationSpec>, ReteError> {
    let id = &rule.rule_id;
    let mut specs = Vec::new();

    for decl in rule.aggregation_variables() {
        let function = decl.function.ok_or_else(|| {
            ReteError::invalid_rule(id, format!("aggregation {} has no function", decl.name))
        })?;
        let source = decl.source().ok_or_else(|| {
            ReteError::invalid_rule(id, format!("aggregation {} has no source variable", decl.name))
        })?;
        let field = decl.field.as_ref().map_or("id", FieldRef::field);

        let mut thresholds = Vec::new();
        if let (Some(operator), Some(value)) = (decl.operator, decl.threshold) {
            thresholds.push(Threshold { operator, value });
        }
        for conjunct in split.alpha.remove(&decl.name).unwrap_or_default() {
            thresholds.push(threshold_of(id, &decl.name, &conjunct)?);
        }

        specs.push(AggregationSpec {
            name: decl.name.clone(),
            function,
            source_var: source.to_string(),
            field: field.to_string(),
            thresholds,
        });
    }

    for constraint in constraints {
        let Expr::Aggregate {
            function,
            expression,
            operator,
            value,
        } = constraint
        else {
            continue;
        };
        let (source, field) = match expression.unwrapped() {
            Expr::FieldAccess { object, field } => (object.clone(), field.clone()),
            Expr::Variable { name } => (name.clone(), "id".to_string()),
            other => {
                return Err(ReteError::invalid_rule(id, format!("cannot aggregate over {other}")));
            }
        };
        let Expr::Number { value } = value.unwrapped() else {
            return Err(ReteError::invalid_rule(id, "aggregate threshold must be a number"));
        };
        specs.push(AggregationSpec {
            name: format!("{}_{}_{}", function.name().to_lowercase(), source, field),
            function: *function,
            source_var: source,
            field,
            thresholds: vec![Threshold {
                operator: *operator,
                value: *value,
            }],
        });
    }
    Ok(specs)
}

/// `name op n` or `n op name`.
fn threshold_of(rule: &RuleId, name: &str, conjunct: &Expr) -> Result<Threshold, ReteError> {
    let is_name = |e: &Expr| match e {
        Expr::Variable { name: n } => n == name,
        Expr::FieldAccess { object, .. } => object == name,
        _ => false,
    };
    if let Expr::Binary {
        left,
        operator,
        right,
    } = conjunct.unwrapped()
        && operator.is_comparison()
    {
        match (left.as_ref(), right.as_ref()) {
            (l, Expr::Number { value }) if is_name(l) => {
                return Ok(Threshold {
                    operator: *operator,
                    value: *value,
                });
            }
            (Expr::Number { value }, r) if is_name(r) => {
                return Ok(Threshold {
                    operator: mirrored(*operator),
                    value: *value,
                });
            }
            _ => {}
        }
    }
    Err(ReteError::invalid_rule(
        rule,
        format!("unsupported condition on aggregate {name}: {conjunct}"),
    ))
}

/// `a op b` rewritten as `b op' a`.
fn mirrored(operator: BinaryOp) -> BinaryOp {
    match operator {
        BinaryOp::Lt => BinaryOp::Gt,
        BinaryOp::Le => BinaryOp::Ge,
        BinaryOp::Gt => BinaryOp::Lt,
        BinaryOp::Ge => BinaryOp::Le,
        other => other,
    }
}

// =============================================================================
// SHAPE SELECTION
// =============================================================================

/// Main and source of a single-source aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SourcePair {
    pub main: String,
    pub main_field: String,
    pub source: String,
    pub source_field: String,
}

/// The single-source layout, if the rule fits it.
pub(crate) fn single_source_pair(
    variables: &[(String, String)],
    aggregations: &[AggregationSpec],
    split: &SplitConditions,
) -> Option<SourcePair> {
    let [spec] = aggregations else {
        return None;
    };
    let [condition] = split.beta.as_slice() else {
        return None;
    };
    if variables.len() != 2 || !split.constant.is_empty() {
        return None;
    }
    let source = spec.source_var.as_str();
    let main = variables.iter().map(|(n, _)| n.as_str()).find(|n| *n != source)?;
    if !variables.iter().any(|(n, _)| n == source) {
        return None;
    }
    let ((lo, lf), (ro, rf)) = equality_fields(condition)?;
    let (main_field, source_field) = if lo == main && ro == source {
        (lf, rf)
    } else if lo == source && ro == main {
        (rf, lf)
    } else {
        return None;
    };
    Some(SourcePair {
        main: main.to_string(),
        main_field: main_field.to_string(),
        source: source.to_string(),
        source_field: source_field.to_string(),
    })
}

// =============================================================================
// BUILDERS
// =============================================================================

pub(crate) fn build_single(
    ctx: &mut BuildContext<'_>,
    analysis: &RuleAnalysis,
    action: Option<Action>,
) -> Result<(NodeId, Option<NodeId>), ReteError> {
    let (Some(pair), Some(spec)) = (
        single_source_pair(&analysis.variables, &analysis.aggregations, &analysis.split),
        analysis.aggregations.first(),
    ) else {
        return Err(ReteError::invalid_rule(&ctx.rule, "not a single-source aggregation"));
    };
    let main_type = type_of(ctx, analysis, &pair.main)?;
    let source_type = type_of(ctx, analysis, &pair.source)?;

    let main_tail = ctx.alpha_chain(&pair.main, &main_type, &alpha_terms(&analysis.split, &pair.main))?;
    let left = ctx.passthrough(&main_type, &pair.main, Side::Left, main_tail)?;
    let source_tail = ctx.alpha_chain(
        &pair.source,
        &source_type,
        &alpha_terms(&analysis.split, &pair.source),
    )?;
    let right = ctx.passthrough(&source_type, &pair.source, Side::Right, source_tail)?;

    let node = ctx.add_node(NodeKind::Accumulator(AccumulatorNode::new(
        pair.main,
        main_type,
        pair.main_field,
        source_type,
        pair.source_field,
        spec.clone(),
    )));
    ctx.connect(left, node);
    ctx.connect(right, node);
    Ok(ctx.terminal(node, None, action, false))
}

pub(crate) fn build_multi(
    ctx: &mut BuildContext<'_>,
    analysis: &RuleAnalysis,
    action: Option<Action>,
) -> Result<(NodeId, Option<NodeId>), ReteError> {
    for spec in &analysis.aggregations {
        if analysis.type_of(&spec.source_var).is_none() {
            return Err(ReteError::invalid_rule(
                &ctx.rule,
                format!("aggregation {} reads undeclared variable {}", spec.name, spec.source_var),
            ));
        }
    }
    let is_source = |name: &str| analysis.aggregations.iter().any(|s| s.source_var == name);
    let Some(main) = analysis
        .variables
        .iter()
        .map(|(n, _)| n.clone())
        .find(|n| !is_source(n))
    else {
        return Err(ReteError::invalid_rule(&ctx.rule, "every pattern is an aggregation source"));
    };
    let main_type = type_of(ctx, analysis, &main)?;

    let sources: Vec<String> = analysis
        .variables
        .iter()
        .map(|(n, _)| n.clone())
        .filter(|n| *n != main)
        .collect();
    let mut vars = vec![main.clone()];
    vars.extend(sources.iter().cloned());

    let tail = join::cascade(
        ctx,
        analysis,
        &vars,
        &analysis.split.beta,
        &analysis.split.constant,
    )?;
    let node = ctx.add_node(NodeKind::MultiAccumulator(MultiAccumulatorNode::new(
        main,
        main_type,
        sources,
        analysis.aggregations.clone(),
        analysis.split.beta.clone(),
    )));
    ctx.connect(tail.tail, node);
    Ok(ctx.terminal(node, None, action, false))
}

fn type_of(ctx: &BuildContext<'_>, analysis: &RuleAnalysis, var: &str) -> Result<String, ReteError> {
    analysis
        .type_of(var)
        .map(str::to_string)
        .ok_or_else(|| ReteError::invalid_rule(&ctx.rule, format!("undeclared variable {var}")))
}
