//! # Arithmetic Decomposition
//!
//! Rewrites an arithmetic-bearing alpha condition into atomic steps.
//!
//! `p.salary * 1.1 + p.bonus > 5000` becomes
//!
//! ```text
//! step_a = p.salary * 1.1            (compute)
//! step_b = step(step_a) + p.bonus    (compute, depends on step_a)
//! step_c = step(step_b) > 5000       (predicate, depends on step_b)
//! ```
//!
//! Step names are derived from the content hash of the sub-expression they
//! compute, so identical sub-expressions in different rules share a name and
//! therefore an alpha node. Every step also keeps its fully expanded source
//! expression: a node reached without its dependencies in the evaluation
//! context (during replay, for instance) evaluates the source directly.

use super::canonical::{canonical_string, condition_hash, normalize};
use super::Expr;
use crate::primitives::{MAX_DECOMPOSITION_DEPTH, STEP_RESULT_PREFIX};
use crate::types::ReteError;
use std::collections::{BTreeMap, BTreeSet};

/// What a step produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Stores a value in the evaluation context; never filters.
    Compute,
    /// Filters the fact.
    Predicate,
}

/// One atomic step of a decomposed condition.
#[derive(Debug, Clone, PartialEq)]
pub struct DecomposedStep {
    pub result_name: String,
    /// The step's own operation, with prior results as `StepRef`s.
    pub expr: Expr,
    pub dependencies: Vec<String>,
    /// The fully expanded expression this step computes.
    pub source: Expr,
    pub kind: StepKind,
    /// True if `expr` is a single operation over leaves.
    pub is_atomic: bool,
}

/// Decompose one alpha-scoped conjunct.
///
/// Conditions without arithmetic produce a single predicate step. The result
/// is validated and returned in dependency order.
pub fn decompose(condition: &Expr) -> Result<Vec<DecomposedStep>, ReteError> {
    let condition = normalize(condition);
    let mut steps = Vec::new();
    let lowered = lower(&condition, 0, &mut steps)?;

    let predicate = lowered;
    let dependencies = step_refs(&predicate);
    steps.push(DecomposedStep {
        // Distinct from a compute step over the same expression.
        result_name: condition_hash(
            STEP_RESULT_PREFIX,
            &format!("test:{}", canonical_string(&condition)),
        ),
        is_atomic: is_atomic(&predicate),
        expr: predicate,
        dependencies,
        source: condition,
        kind: StepKind::Predicate,
    });
    order_steps(steps)
}

/// Replace every arithmetic operation under `expr` by a compute step.
fn lower(
    expr: &Expr,
    depth: usize,
    steps: &mut Vec<DecomposedStep>,
) -> Result<Expr, ReteError> {
    if depth > MAX_DECOMPOSITION_DEPTH {
        return Err(ReteError::Evaluation(format!(
            "condition nests deeper than {MAX_DECOMPOSITION_DEPTH} levels"
        )));
    }
    let next = depth + 1;
    let lowered = match expr {
        Expr::Binary {
            left,
            operator,
            right,
        } => {
            let l = lower(left, next, steps)?;
            let r = lower(right, next, steps)?;
            let rebuilt = Expr::binary(l, *operator, r);
            if operator.is_arithmetic() {
                return Ok(compute_step(expr, rebuilt, steps));
            }
            rebuilt
        }
        Expr::Call { name, args } => {
            let args = args
                .iter()
                .map(|a| lower(a, next, steps))
                .collect::<Result<Vec<_>, _>>()?;
            let rebuilt = Expr::Call {
                name: name.clone(),
                args,
            };
            return Ok(compute_step(expr, rebuilt, steps));
        }
        Expr::Logical { left, operations } => Expr::Logical {
            left: Box::new(lower(left, next, steps)?),
            operations: operations
                .iter()
                .map(|o| {
                    Ok(super::LogicalOperation {
                        op: o.op,
                        right: lower(&o.right, next, steps)?,
                    })
                })
                .collect::<Result<Vec<_>, ReteError>>()?,
        },
        Expr::Not { expression } => Expr::not(lower(expression, next, steps)?),
        Expr::Wrapped { constraint } => lower(constraint, next, steps)?,
        leaf => leaf.clone(),
    };
    Ok(lowered)
}

fn compute_step(source: &Expr, rebuilt: Expr, steps: &mut Vec<DecomposedStep>) -> Expr {
    let name = step_name(source);
    if !steps.iter().any(|s| s.result_name == name) {
        steps.push(DecomposedStep {
            result_name: name.clone(),
            dependencies: step_refs(&rebuilt),
            is_atomic: is_atomic(&rebuilt),
            expr: rebuilt,
            source: source.clone(),
            kind: StepKind::Compute,
        });
    }
    Expr::StepRef { name }
}

fn step_name(source: &Expr) -> String {
    condition_hash(STEP_RESULT_PREFIX, &canonical_string(source))
}

fn step_refs(expr: &Expr) -> Vec<String> {
    let mut refs = BTreeSet::new();
    collect_step_refs(expr, &mut refs);
    refs.into_iter().collect()
}

fn collect_step_refs(expr: &Expr, refs: &mut BTreeSet<String>) {
    match expr {
        Expr::StepRef { name } => {
            refs.insert(name.clone());
        }
        Expr::Binary { left, right, .. } => {
            collect_step_refs(left, refs);
            collect_step_refs(right, refs);
        }
        Expr::Logical { left, operations } => {
            collect_step_refs(left, refs);
            for o in operations {
                collect_step_refs(&o.right, refs);
            }
        }
        Expr::Not { expression } => collect_step_refs(expression, refs),
        Expr::Wrapped { constraint } => collect_step_refs(constraint, refs),
        Expr::Call { args, .. } => {
            for a in args {
                collect_step_refs(a, refs);
            }
        }
        _ => {}
    }
}

fn is_leaf(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::FieldAccess { .. }
            | Expr::Variable { .. }
            | Expr::Number { .. }
            | Expr::String { .. }
            | Expr::Bool { .. }
            | Expr::StepRef { .. }
    )
}

fn is_atomic(expr: &Expr) -> bool {
    match expr {
        Expr::Binary { left, right, .. } => is_leaf(left) && is_leaf(right),
        Expr::Call { args, .. } => args.iter().all(is_leaf),
        Expr::Not { expression } => is_leaf(expression),
        other => is_leaf(other),
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Validate the dependency graph and return the steps in dependency order.
///
/// Tricolor DFS: reaching a gray step again is a cycle. A dependency no step
/// produces is rejected as well. Among independent steps the input order is
/// kept.
pub fn order_steps(steps: Vec<DecomposedStep>) -> Result<Vec<DecomposedStep>, ReteError> {
    let index: BTreeMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.result_name.as_str(), i))
        .collect();
    for step in &steps {
        for dep in &step.dependencies {
            if !index.contains_key(dep.as_str()) {
                return Err(ReteError::MissingDependency {
                    step: step.result_name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let mut colors = vec![Color::White; steps.len()];
    let mut order = Vec::with_capacity(steps.len());
    for start in 0..steps.len() {
        visit(start, &steps, &index, &mut colors, &mut order)?;
    }

    let mut slots: Vec<Option<DecomposedStep>> = steps.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .filter_map(|i| slots.get_mut(i).and_then(Option::take))
        .collect())
}

fn visit(
    node: usize,
    steps: &[DecomposedStep],
    index: &BTreeMap<&str, usize>,
    colors: &mut [Color],
    order: &mut Vec<usize>,
) -> Result<(), ReteError> {
    match colors.get(node).copied() {
        Some(Color::Black) | None => return Ok(()),
        Some(Color::Gray) => {
            let name = steps
                .get(node)
                .map(|s| s.result_name.clone())
                .unwrap_or_default();
            return Err(ReteError::Cycle(name));
        }
        Some(Color::White) => {}
    }
    colors[node] = Color::Gray;
    if let Some(step) = steps.get(node) {
        for dep in &step.dependencies {
            if let Some(&next) = index.get(dep.as_str()) {
                visit(next, steps, index, colors, order)?;
            }
        }
    }
    colors[node] = Color::Black;
    order.push(node);
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::BinaryOp;

    fn salary_rule() -> Expr {
        // p.salary * 1.1 + p.bonus > 5000
        Expr::binary(
            Expr::binary(
                Expr::binary(Expr::field("p", "salary"), BinaryOp::Mul, Expr::number(1.1)),
                BinaryOp::Add,
                Expr::field("p", "bonus"),
            ),
            BinaryOp::Gt,
            Expr::number(5000.0),
        )
    }

    #[test]
    fn plain_comparison_is_one_predicate() {
        let steps = decompose(&Expr::binary(
            Expr::field("p", "age"),
            BinaryOp::Gt,
            Expr::number(18.0),
        ))
        .expect("decompose");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].kind, StepKind::Predicate);
        assert!(steps[0].is_atomic);
        assert!(steps[0].dependencies.is_empty());
    }

    #[test]
    fn arithmetic_becomes_a_chain() {
        let steps = decompose(&salary_rule()).expect("decompose");
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].kind, StepKind::Compute);
        assert!(steps[0].dependencies.is_empty());
        assert_eq!(steps[1].dependencies, vec![steps[0].result_name.clone()]);
        assert_eq!(steps[2].kind, StepKind::Predicate);
        assert_eq!(steps[2].dependencies, vec![steps[1].result_name.clone()]);
        assert!(steps.iter().all(|s| s.is_atomic));
    }

    #[test]
    fn step_names_are_content_derived() {
        let a = decompose(&salary_rule()).expect("a");
        let b = decompose(&salary_rule()).expect("b");
        let names = |s: &[DecomposedStep]| -> Vec<String> {
            s.iter().map(|x| x.result_name.clone()).collect()
        };
        assert_eq!(names(&a), names(&b));
        assert!(a[0].result_name.starts_with(STEP_RESULT_PREFIX));
    }

    #[test]
    fn repeated_subexpression_is_computed_once() {
        let twice = Expr::binary(
            Expr::binary(Expr::field("p", "x"), BinaryOp::Mul, Expr::number(2.0)),
            BinaryOp::Eq,
            Expr::binary(Expr::field("p", "x"), BinaryOp::Mul, Expr::number(2.0)),
        );
        let steps = decompose(&twice).expect("decompose");
        assert_eq!(steps.len(), 2);
    }

    fn step(name: &str, deps: &[&str]) -> DecomposedStep {
        DecomposedStep {
            result_name: name.to_string(),
            expr: Expr::boolean(true),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            source: Expr::boolean(true),
            kind: StepKind::Compute,
            is_atomic: true,
        }
    }

    #[test]
    fn cycles_are_rejected() {
        let result = order_steps(vec![step("a", &["b"]), step("b", &["a"])]);
        assert!(matches!(result, Err(ReteError::Cycle(_))));
    }

    #[test]
    fn missing_dependencies_are_rejected() {
        let result = order_steps(vec![step("a", &["ghost"])]);
        assert!(matches!(result, Err(ReteError::MissingDependency { .. })));
    }

    #[test]
    fn ordering_puts_dependencies_first() {
        let ordered = order_steps(vec![step("c", &["b"]), step("b", &["a"]), step("a", &[])])
            .expect("order");
        let names: Vec<&str> = ordered.iter().map(|s| s.result_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
