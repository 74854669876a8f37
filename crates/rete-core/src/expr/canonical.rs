//! # Canonicalization
//!
//! Order-independent rendering of conditions, the content hashes derived from
//! it, the condition normalizer, and alpha/beta splitting.
//!
//! ## Canonical form
//!
//! - literals render as `literal(v)`, strings quoted
//! - field access renders as `fieldAccess(obj,field)`
//! - binary operations render as `binaryOp(left,op,right)`; operands of
//!   commutative operators are ordered
//! - AND/OR trees are flattened into an OR of ANDs whose terms are sorted and
//!   deduplicated (AND binds tighter than OR)
//! - `constraint` wrappers disappear
//!
//! Untyped JSON maps are accepted by [`canonical_json`]: anything that parses
//! as an [`Expr`] renders exactly like the typed node, so the two shapes hash
//! identically.

use super::{BinaryOp, Expr, LogicalOp};
use crate::primitives::{CONDITION_HASH_BYTES, MAX_DNF_TERMS};
use std::collections::BTreeMap;

// =============================================================================
// CANONICAL STRINGS
// =============================================================================

/// Canonical string of a typed condition.
#[must_use]
pub fn canonical_string(expr: &Expr) -> String {
    match expr {
        Expr::FieldAccess { object, field } => format!("fieldAccess({object},{field})"),
        Expr::Variable { name } => format!("variable({name})"),
        Expr::Number { value } => format!("literal({value})"),
        Expr::String { value } => format!("literal({value:?})"),
        Expr::Bool { value } => format!("literal({value})"),
        Expr::Binary {
            left,
            operator,
            right,
        } => {
            let mut l = canonical_string(left);
            let mut r = canonical_string(right);
            if operator.is_commutative() && r < l {
                std::mem::swap(&mut l, &mut r);
            }
            format!("binaryOp({l},{},{r})", operator.symbol())
        }
        Expr::Logical { .. } => render_groups(&finalize(disjuncts(expr))),
        Expr::Not { expression } => format!("not({})", canonical_string(expression)),
        Expr::Wrapped { constraint } => canonical_string(constraint),
        Expr::Exists {
            variable,
            condition,
        } => format!(
            "exists({}:{},{})",
            variable.name,
            variable.data_type,
            canonical_string(condition)
        ),
        Expr::Aggregate {
            function,
            expression,
            operator,
            value,
        } => format!(
            "aggregate({function},{},{},{})",
            canonical_string(expression),
            operator.symbol(),
            canonical_string(value)
        ),
        Expr::Call { name, args } => {
            let rendered: Vec<String> = args.iter().map(canonical_string).collect();
            if rendered.is_empty() {
                format!("call({})", name.to_uppercase())
            } else {
                format!("call({},{})", name.to_uppercase(), rendered.join(","))
            }
        }
        Expr::StepRef { name } => format!("step({name})"),
    }
}

/// Canonical string of an arbitrary JSON value.
///
/// Values that deserialize as a condition render through [`canonical_string`];
/// any other object renders with its keys sorted, recursively.
#[must_use]
pub fn canonical_json(value: &serde_json::Value) -> String {
    if value.is_object()
        && let Ok(expr) = serde_json::from_value::<Expr>(value.clone())
    {
        return canonical_string(&expr);
    }
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<&String, &serde_json::Value> = map.iter().collect();
            let entries: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{k}:{}", canonical_json(v)))
                .collect();
            format!("{{{}}}", entries.join(","))
        }
        serde_json::Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        serde_json::Value::String(s) => format!("{s:?}"),
        other => other.to_string(),
    }
}

// =============================================================================
// HASHING
// =============================================================================

/// `prefix_` followed by the first digest bytes of `canonical`, in hex.
#[must_use]
pub fn condition_hash(prefix: &str, canonical: &str) -> String {
    let digest = blake3::hash(canonical.as_bytes());
    let hex = digest.to_hex();
    format!("{prefix}_{}", &hex.as_str()[..CONDITION_HASH_BYTES * 2])
}

/// Hash of the normalized form of `expr`.
#[must_use]
pub fn expr_hash(prefix: &str, expr: &Expr) -> String {
    condition_hash(prefix, &canonical_string(&normalize(expr)))
}

// =============================================================================
// NORMALIZATION
// =============================================================================

/// Rewrite a condition into its normal form.
///
/// Wrappers are removed, double negation cancels, commutative operands are
/// ordered, and logical trees become a sorted OR of sorted ANDs. A conjunction
/// of disjunctions over a single variable is expanded to DNF when the result
/// has at most [`MAX_DNF_TERMS`] disjuncts.
///
/// `normalize(normalize(x)) == normalize(x)`.
#[must_use]
pub fn normalize(expr: &Expr) -> Expr {
    match expr {
        Expr::Wrapped { constraint } => normalize(constraint),
        Expr::Not { expression } => match normalize(expression) {
            Expr::Not { expression: inner } => *inner,
            other => Expr::not(other),
        },
        Expr::Binary {
            left,
            operator,
            right,
        } => {
            let mut l = normalize(left);
            let mut r = normalize(right);
            if operator.is_commutative() && canonical_string(&r) < canonical_string(&l) {
                std::mem::swap(&mut l, &mut r);
            }
            Expr::binary(l, *operator, r)
        }
        Expr::Logical { .. } => {
            let mut groups = disjuncts(expr);
            if expr.variables().len() == 1 {
                groups = groups.into_iter().flat_map(expand_group).collect();
            }
            assemble(finalize(groups)).unwrap_or_else(|| expr.clone())
        }
        Expr::Call { name, args } => Expr::Call {
            name: name.to_uppercase(),
            args: args.iter().map(normalize).collect(),
        },
        Expr::Exists {
            variable,
            condition,
        } => Expr::Exists {
            variable: variable.clone(),
            condition: Box::new(normalize(condition)),
        },
        Expr::Aggregate {
            function,
            expression,
            operator,
            value,
        } => Expr::Aggregate {
            function: *function,
            expression: Box::new(normalize(expression)),
            operator: *operator,
            value: Box::new(normalize(value)),
        },
        leaf => leaf.clone(),
    }
}

/// OR-of-AND view of a condition, with every term normalized.
///
/// A disjunction nested inside a conjunction with other terms stays a single
/// (normalized) term; it is only lifted by DNF expansion.
fn disjuncts(expr: &Expr) -> Vec<Vec<Expr>> {
    let Expr::Logical { left, operations } = expr.unwrapped() else {
        return vec![vec![normalize(expr)]];
    };

    let mut segments: Vec<Vec<&Expr>> = vec![vec![left.as_ref()]];
    for operation in operations {
        match operation.op {
            LogicalOp::And => {
                if let Some(current) = segments.last_mut() {
                    current.push(&operation.right);
                }
            }
            LogicalOp::Or => segments.push(vec![&operation.right]),
        }
    }

    let mut groups = Vec::new();
    for segment in segments {
        if let [single] = segment.as_slice() {
            groups.extend(disjuncts(single));
            continue;
        }
        let mut conjunction = Vec::new();
        for term in segment {
            let mut sub = disjuncts(term);
            if sub.len() == 1 {
                conjunction.append(&mut sub[0]);
            } else if let Some(atom) = assemble(finalize(sub)) {
                conjunction.push(atom);
            }
        }
        groups.push(conjunction);
    }
    groups
}

/// Cross product of the disjunctions inside one conjunction.
fn expand_group(group: Vec<Expr>) -> Vec<Vec<Expr>> {
    let mut product: Vec<Vec<Expr>> = vec![Vec::new()];
    for term in &group {
        let alternatives = match term {
            Expr::Logical { .. } => disjuncts(term),
            other => vec![vec![other.clone()]],
        };
        if product.len() * alternatives.len() > MAX_DNF_TERMS {
            return vec![group];
        }
        product = product
            .iter()
            .flat_map(|prefix| {
                alternatives.iter().map(move |alt| {
                    let mut terms = prefix.clone();
                    terms.extend(alt.iter().cloned());
                    terms
                })
            })
            .collect();
    }
    product
}

/// Sort and deduplicate terms and groups; lift groups that are a lone
/// disjunction.
fn finalize(groups: Vec<Vec<Expr>>) -> Vec<Vec<Expr>> {
    let mut flat: Vec<Vec<Expr>> = Vec::new();
    for group in groups {
        let group = sort_terms(group);
        if let [Expr::Logical { .. }] = group.as_slice() {
            flat.extend(disjuncts(&group[0]).into_iter().map(sort_terms));
        } else if !group.is_empty() {
            flat.push(group);
        }
    }
    let mut keyed: BTreeMap<String, Vec<Expr>> = BTreeMap::new();
    for group in flat {
        keyed.entry(render_group(&group)).or_insert(group);
    }
    keyed.into_values().collect()
}

fn sort_terms(group: Vec<Expr>) -> Vec<Expr> {
    let mut keyed: BTreeMap<String, Expr> = BTreeMap::new();
    for term in group {
        keyed.entry(canonical_string(&term)).or_insert(term);
    }
    keyed.into_values().collect()
}

fn assemble(groups: Vec<Vec<Expr>>) -> Option<Expr> {
    let conjunctions: Vec<Expr> = groups.into_iter().filter_map(Expr::and).collect();
    Expr::or(conjunctions)
}

fn render_group(group: &[Expr]) -> String {
    let terms: Vec<String> = group.iter().map(canonical_string).collect();
    match terms.as_slice() {
        [single] => single.clone(),
        _ => format!("and({})", terms.join(",")),
    }
}

fn render_groups(groups: &[Vec<Expr>]) -> String {
    let rendered: Vec<String> = groups.iter().map(|g| render_group(g)).collect();
    match rendered.as_slice() {
        [single] => single.clone(),
        _ => format!("or({})", rendered.join(",")),
    }
}

// =============================================================================
// SPLITTING
// =============================================================================

/// Top-level conjuncts of the normalized condition.
///
/// A condition whose top level is a disjunction is one conjunct: OR is never
/// split.
#[must_use]
pub fn conjuncts(expr: &Expr) -> Vec<Expr> {
    let normalized = normalize(expr);
    match &normalized {
        Expr::Logical { left, operations }
            if operations.iter().all(|o| o.op == LogicalOp::And) =>
        {
            let mut terms = vec![(**left).clone()];
            terms.extend(operations.iter().map(|o| o.right.clone()));
            terms
        }
        _ => vec![normalized],
    }
}

/// A condition partitioned by the variables each conjunct reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplitConditions {
    /// Single-variable conjuncts, by variable.
    pub alpha: BTreeMap<String, Vec<Expr>>,
    /// Conjuncts reading two or more variables.
    pub beta: Vec<Expr>,
    /// Conjuncts reading no variable at all.
    pub constant: Vec<Expr>,
    /// `existsConstraint` / `aggregateConstraint` conjuncts, left to builders.
    pub quantifiers: Vec<Expr>,
}

impl SplitConditions {
    /// The beta conjuncts and constants, re-joined with AND.
    #[must_use]
    pub fn beta_condition(&self) -> Option<Expr> {
        let mut terms = self.beta.clone();
        terms.extend(self.constant.iter().cloned());
        Expr::and(terms)
    }

    /// Canonical string of each variable's alpha filter.
    #[must_use]
    pub fn alpha_fingerprints(&self) -> BTreeMap<String, String> {
        self.alpha
            .iter()
            .filter_map(|(var, terms)| {
                Expr::and(terms.clone()).map(|e| (var.clone(), canonical_string(&e)))
            })
            .collect()
    }
}

/// Partition a condition into alpha, beta, constant and quantifier conjuncts.
#[must_use]
pub fn split_conditions(expr: &Expr) -> SplitConditions {
    let mut split = SplitConditions::default();
    for conjunct in conjuncts(expr) {
        if conjunct.is_quantifier() {
            split.quantifiers.push(conjunct);
            continue;
        }
        let vars = conjunct.variables();
        let mut iter = vars.iter();
        match (iter.next(), iter.next()) {
            (None, _) => split.constant.push(conjunct),
            (Some(var), None) => split.alpha.entry(var.clone()).or_default().push(conjunct),
            _ => split.beta.push(conjunct),
        }
    }
    split
}

/// `((left, f), (right, g))` when `expr` is `left.f == right.g` over two
/// distinct variables.
#[must_use]
pub fn equality_fields(expr: &Expr) -> Option<((&str, &str), (&str, &str))> {
    match expr {
        Expr::Binary {
            left,
            operator: BinaryOp::Eq,
            right,
        } => match (left.as_ref(), right.as_ref()) {
            (
                Expr::FieldAccess {
                    object: lo,
                    field: lf,
                },
                Expr::FieldAccess {
                    object: ro,
                    field: rf,
                },
            ) if lo != ro => Some(((lo.as_str(), lf.as_str()), (ro.as_str(), rf.as_str()))),
            _ => None,
        },
        _ => None,
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gt(var: &str, field: &str, n: f64) -> Expr {
        Expr::binary(Expr::field(var, field), BinaryOp::Gt, Expr::number(n))
    }

    #[test]
    fn leaf_rendering() {
        assert_eq!(canonical_string(&Expr::field("p", "age")), "fieldAccess(p,age)");
        assert_eq!(canonical_string(&Expr::number(18.0)), "literal(18)");
        assert_eq!(canonical_string(&Expr::string("x")), "literal(\"x\")");
        assert_eq!(
            canonical_string(&gt("p", "age", 18.0)),
            "binaryOp(fieldAccess(p,age),>,literal(18))"
        );
    }

    #[test]
    fn equality_operands_are_ordered() {
        let a = Expr::binary(Expr::field("u", "id"), BinaryOp::Eq, Expr::field("o", "user_id"));
        let b = Expr::binary(Expr::field("o", "user_id"), BinaryOp::Eq, Expr::field("u", "id"));
        assert_eq!(canonical_string(&a), canonical_string(&b));
    }

    #[test]
    fn and_order_does_not_matter() {
        let a = Expr::and(vec![gt("p", "age", 18.0), gt("p", "salary", 5.0)]).expect("a");
        let b = Expr::and(vec![gt("p", "salary", 5.0), gt("p", "age", 18.0)]).expect("b");
        assert_eq!(canonical_string(&a), canonical_string(&b));
        assert_eq!(expr_hash("alpha", &a), expr_hash("alpha", &b));
    }

    #[test]
    fn nested_or_flattens() {
        let a = Expr::or(vec![
            gt("p", "a", 1.0),
            Expr::or(vec![gt("p", "b", 2.0), gt("p", "c", 3.0)]).expect("inner"),
        ])
        .expect("a");
        let b = Expr::or(vec![gt("p", "c", 3.0), gt("p", "b", 2.0), gt("p", "a", 1.0)]).expect("b");
        assert_eq!(canonical_string(&a), canonical_string(&b));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        // a AND b OR c  ==  c OR (b AND a)
        let e: Expr = serde_json::from_value(json!({
            "type": "logicalExpr",
            "left": {"type": "comparison", "left": {"type": "fieldAccess", "object": "p", "field": "a"}, "operator": ">", "right": {"type": "number", "value": 1}},
            "operations": [
                {"op": "AND", "right": {"type": "comparison", "left": {"type": "fieldAccess", "object": "p", "field": "b"}, "operator": ">", "right": {"type": "number", "value": 2}}},
                {"op": "OR", "right": {"type": "comparison", "left": {"type": "fieldAccess", "object": "p", "field": "c"}, "operator": ">", "right": {"type": "number", "value": 3}}}
            ]
        }))
        .expect("parse");
        let expected = Expr::or(vec![
            gt("p", "c", 3.0),
            Expr::and(vec![gt("p", "b", 2.0), gt("p", "a", 1.0)]).expect("and"),
        ])
        .expect("or");
        assert_eq!(canonical_string(&e), canonical_string(&expected));
    }

    #[test]
    fn wrapper_and_alias_are_transparent() {
        let typed = gt("p", "age", 18.0);
        let wrapped = json!({
            "type": "constraint",
            "constraint": {
                "type": "comparison",
                "left": {"type": "fieldAccess", "object": "p", "field": "age"},
                "operator": ">",
                "right": {"type": "number", "value": 18}
            }
        });
        assert_eq!(canonical_json(&wrapped), canonical_string(&typed));
    }

    #[test]
    fn untyped_maps_sort_keys() {
        let a = json!({"beta": "x", "alpha": {"p": 1, "o": 2}});
        let b = json!({"alpha": {"o": 2, "p": 1}, "beta": "x"});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn hash_shape() {
        let h = condition_hash("alpha", "literal(true)");
        assert!(h.starts_with("alpha_"));
        assert_eq!(h.len(), "alpha_".len() + CONDITION_HASH_BYTES * 2);
    }

    #[test]
    fn normalize_is_idempotent_on_mixed_tree() {
        let e = Expr::and(vec![
            Expr::or(vec![gt("p", "a", 1.0), gt("p", "b", 2.0)]).expect("or"),
            Expr::not(Expr::not(gt("p", "c", 3.0))),
            gt("p", "c", 3.0),
        ])
        .expect("and");
        let once = normalize(&e);
        assert_eq!(normalize(&once), once);
    }

    #[test]
    fn single_variable_dnf_expansion() {
        // (a OR b) AND c  ->  (a AND c) OR (b AND c)
        let e = Expr::and(vec![
            Expr::or(vec![gt("p", "a", 1.0), gt("p", "b", 2.0)]).expect("or"),
            gt("p", "c", 3.0),
        ])
        .expect("and");
        let expected = Expr::or(vec![
            Expr::and(vec![gt("p", "a", 1.0), gt("p", "c", 3.0)]).expect("ac"),
            Expr::and(vec![gt("p", "b", 2.0), gt("p", "c", 3.0)]).expect("bc"),
        ])
        .expect("dnf");
        assert_eq!(canonical_string(&normalize(&e)), canonical_string(&expected));
    }

    #[test]
    fn multi_variable_or_is_not_expanded() {
        let e = Expr::and(vec![
            Expr::or(vec![gt("p", "a", 1.0), gt("q", "b", 2.0)]).expect("or"),
            gt("p", "c", 3.0),
        ])
        .expect("and");
        assert_eq!(conjuncts(&e).len(), 2);
    }

    #[test]
    fn split_by_variable_count() {
        let e = Expr::and(vec![
            Expr::binary(Expr::field("u", "id"), BinaryOp::Eq, Expr::field("o", "user_id")),
            gt("o", "amount", 100.0),
            Expr::boolean(true),
        ])
        .expect("and");
        let split = split_conditions(&e);
        assert_eq!(split.alpha.get("o").map(Vec::len), Some(1));
        assert_eq!(split.beta.len(), 1);
        assert_eq!(split.constant.len(), 1);
        assert!(split.alpha_fingerprints().contains_key("o"));
    }

    #[test]
    fn mixed_or_is_never_split() {
        let e = Expr::or(vec![gt("u", "a", 1.0), gt("o", "b", 2.0)]).expect("or");
        let split = split_conditions(&e);
        assert!(split.alpha.is_empty());
        assert_eq!(split.beta.len(), 1);
    }

    #[test]
    fn equality_field_detection() {
        let e = Expr::binary(Expr::field("u", "id"), BinaryOp::Eq, Expr::field("o", "user_id"));
        assert_eq!(equality_fields(&e), Some((("u", "id"), ("o", "user_id"))));
        assert_eq!(equality_fields(&gt("u", "id", 1.0)), None);
    }
}
