//! # Expression Evaluation
//!
//! Evaluates conditions against a set of variable bindings.
//!
//! - Equality and ordering hold only within one value variant; a cross-variant
//!   comparison is `false`, never an error.
//! - Missing fields, type mismatches and division by zero are errors. Nodes
//!   treat an error as a non-match.

use super::{BinaryOp, Expr, LogicalOp};
use crate::fact::{Fact, FactId};
use crate::token::Token;
use crate::types::{ReteError, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// BINDINGS
// =============================================================================

/// Read access to the facts and named values an expression may reference.
pub trait Bindings {
    /// Fact bound to `variable`.
    fn fact(&self, variable: &str) -> Option<&Fact>;

    /// Named value: a decomposition step result or an aggregate.
    fn value(&self, _name: &str) -> Option<&Value> {
        None
    }
}

/// One variable bound to one fact.
#[derive(Debug, Clone, Copy)]
pub struct Single<'a> {
    pub variable: &'a str,
    pub fact: &'a Fact,
}

impl Bindings for Single<'_> {
    fn fact(&self, variable: &str) -> Option<&Fact> {
        (variable == self.variable).then_some(self.fact)
    }
}

impl Bindings for Token {
    fn fact(&self, variable: &str) -> Option<&Fact> {
        self.bindings.get(variable).map(|f| &**f)
    }

    fn value(&self, name: &str) -> Option<&Value> {
        self.aggregates.get(name)
    }
}

/// A token plus one candidate binding, as seen by a join test.
pub struct Extended<'a> {
    pub base: &'a dyn Bindings,
    pub variable: &'a str,
    pub fact: &'a Fact,
}

impl Bindings for Extended<'_> {
    fn fact(&self, variable: &str) -> Option<&Fact> {
        if variable == self.variable {
            Some(self.fact)
        } else {
            self.base.fact(variable)
        }
    }

    fn value(&self, name: &str) -> Option<&Value> {
        self.base.value(name)
    }
}

// =============================================================================
// EVALUATION CONTEXT
// =============================================================================

/// State threaded down a decomposed alpha chain.
///
/// Built once at the chain entry for the arriving fact; each step adds its
/// result under its `result_name`.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    pub variable: String,
    pub fact: Arc<Fact>,
    pub results: BTreeMap<String, Value>,
}

impl EvaluationContext {
    #[must_use]
    pub fn new(variable: impl Into<String>, fact: Arc<Fact>) -> Self {
        Self {
            variable: variable.into(),
            fact,
            results: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, name: impl Into<String>, value: Value) {
        self.results.insert(name.into(), value);
    }

    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.results.contains_key(name)
    }
}

impl Bindings for EvaluationContext {
    fn fact(&self, variable: &str) -> Option<&Fact> {
        (variable == self.variable).then_some(self.fact.as_ref())
    }

    fn value(&self, name: &str) -> Option<&Value> {
        self.results.get(name)
    }
}

/// Arithmetic results keyed by (fact, canonical expression).
///
/// Owned by the network; entries of a fact are dropped when it is retracted.
#[derive(Debug, Clone, Default)]
pub struct ArithmeticCache {
    entries: BTreeMap<FactId, BTreeMap<String, Value>>,
    hits: u64,
    misses: u64,
}

impl ArithmeticCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, fact: &FactId, canonical: &str) -> Option<Value> {
        let found = self.entries.get(fact).and_then(|m| m.get(canonical)).cloned();
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }

    pub fn insert(&mut self, fact: FactId, canonical: String, value: Value) {
        self.entries.entry(fact).or_default().insert(canonical, value);
    }

    pub fn invalidate(&mut self, fact: &FactId) {
        self.entries.remove(fact);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses
    }
}

// =============================================================================
// EVALUATOR
// =============================================================================

/// Evaluate `expr` to a value.
pub fn evaluate(expr: &Expr, bindings: &dyn Bindings) -> Result<Value, ReteError> {
    match expr {
        Expr::Number { value } => Ok(Value::Number(*value)),
        Expr::String { value } => Ok(Value::String(value.clone())),
        Expr::Bool { value } => Ok(Value::Bool(*value)),
        Expr::FieldAccess { object, field } => {
            let fact = bindings
                .fact(object)
                .ok_or_else(|| ReteError::Evaluation(format!("unbound variable {object}")))?;
            fact.field(field).ok_or_else(|| {
                ReteError::Evaluation(format!("{} has no field {field}", fact.internal_id()))
            })
        }
        Expr::Variable { name } => bindings
            .value(name)
            .cloned()
            .ok_or_else(|| ReteError::Evaluation(format!("unbound value {name}"))),
        Expr::StepRef { name } => bindings
            .value(name)
            .cloned()
            .ok_or_else(|| ReteError::Evaluation(format!("step {name} has no result"))),
        Expr::Binary {
            left,
            operator,
            right,
        } => {
            let l = evaluate(left, bindings)?;
            let r = evaluate(right, bindings)?;
            apply_binary(*operator, &l, &r)
        }
        Expr::Logical { left, operations } => evaluate_logical(left, operations, bindings),
        Expr::Not { expression } => Ok(Value::Bool(!truthy(expression, bindings)?)),
        Expr::Wrapped { constraint } => evaluate(constraint, bindings),
        Expr::Call { name, args } => {
            let values = args
                .iter()
                .map(|a| evaluate(a, bindings))
                .collect::<Result<Vec<_>, _>>()?;
            call_function(name, &values)
        }
        Expr::Exists { .. } | Expr::Aggregate { .. } => Err(ReteError::Evaluation(
            "quantified constraints are compiled into nodes, not evaluated".to_string(),
        )),
    }
}

/// Evaluate `expr` as a predicate. Non-boolean results are errors.
pub fn truthy(expr: &Expr, bindings: &dyn Bindings) -> Result<bool, ReteError> {
    match evaluate(expr, bindings)? {
        Value::Bool(b) => Ok(b),
        other => Err(ReteError::Evaluation(format!(
            "condition produced {} ({other}), expected bool",
            other.type_name()
        ))),
    }
}

/// AND binds tighter than OR; both short-circuit.
fn evaluate_logical(
    left: &Expr,
    operations: &[super::LogicalOperation],
    bindings: &dyn Bindings,
) -> Result<Value, ReteError> {
    let mut segments: Vec<Vec<&Expr>> = vec![vec![left]];
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
    'segments: for segment in segments {
        for term in segment {
            if !truthy(term, bindings)? {
                continue 'segments;
            }
        }
        return Ok(Value::Bool(true));
    }
    Ok(Value::Bool(false))
}

/// Apply a binary operator to two evaluated operands.
pub fn apply_binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, ReteError> {
    let mismatch = || {
        ReteError::Evaluation(format!(
            "cannot apply {} to {} and {}",
            op.symbol(),
            l.type_name(),
            r.type_name()
        ))
    };
    match op {
        BinaryOp::Add => match (l, r) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            _ => Err(mismatch()),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
                return Err(mismatch());
            };
            match op {
                BinaryOp::Sub => Ok(Value::Number(a - b)),
                BinaryOp::Mul => Ok(Value::Number(a * b)),
                _ if b == 0.0 => Err(ReteError::Evaluation("division by zero".to_string())),
                BinaryOp::Div => Ok(Value::Number(a / b)),
                _ => Ok(Value::Number(a % b)),
            }
        }
        BinaryOp::Eq => Ok(Value::Bool(l == r)),
        BinaryOp::Ne => Ok(Value::Bool(l != r)),
        BinaryOp::Lt => Ok(Value::Bool(l.compare(r) == Some(Ordering::Less))),
        BinaryOp::Le => Ok(Value::Bool(matches!(
            l.compare(r),
            Some(Ordering::Less | Ordering::Equal)
        ))),
        BinaryOp::Gt => Ok(Value::Bool(l.compare(r) == Some(Ordering::Greater))),
        BinaryOp::Ge => Ok(Value::Bool(matches!(
            l.compare(r),
            Some(Ordering::Greater | Ordering::Equal)
        ))),
        BinaryOp::Contains => match (l, r) {
            (Value::String(a), Value::String(b)) => Ok(Value::Bool(a.contains(b.as_str()))),
            _ => Ok(Value::Bool(false)),
        },
    }
}

/// Compare a computed value against a threshold.
#[must_use]
pub fn compare_threshold(op: BinaryOp, value: &Value, threshold: &Value) -> bool {
    op.is_comparison()
        && matches!(apply_binary(op, value, threshold), Ok(Value::Bool(true)))
}

fn call_function(name: &str, args: &[Value]) -> Result<Value, ReteError> {
    let upper = name.to_uppercase();
    match upper.as_str() {
        "ABS" => Ok(Value::Number(number_arg(&upper, args, 0)?.abs())),
        "ROUND" => Ok(Value::Number(number_arg(&upper, args, 0)?.round())),
        "FLOOR" => Ok(Value::Number(number_arg(&upper, args, 0)?.floor())),
        "CEIL" => Ok(Value::Number(number_arg(&upper, args, 0)?.ceil())),
        "MIN" | "MAX" => {
            let mut best = number_arg(&upper, args, 0)?;
            for i in 1..args.len() {
                let n = number_arg(&upper, args, i)?;
                best = if upper == "MIN" { best.min(n) } else { best.max(n) };
            }
            Ok(Value::Number(best))
        }
        "LENGTH" => Ok(Value::Number(
            string_arg(&upper, args, 0)?.chars().count() as f64,
        )),
        "UPPER" => Ok(Value::String(string_arg(&upper, args, 0)?.to_uppercase())),
        "LOWER" => Ok(Value::String(string_arg(&upper, args, 0)?.to_lowercase())),
        _ => Err(ReteError::Evaluation(format!("unknown function {name}"))),
    }
}

fn number_arg(function: &str, args: &[Value], i: usize) -> Result<f64, ReteError> {
    args.get(i)
        .and_then(Value::as_f64)
        .ok_or_else(|| ReteError::Evaluation(format!("{function} expects a number at argument {i}")))
}

fn string_arg<'a>(function: &str, args: &'a [Value], i: usize) -> Result<&'a str, ReteError> {
    args.get(i)
        .and_then(Value::as_str)
        .ok_or_else(|| ReteError::Evaluation(format!("{function} expects a string at argument {i}")))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::LogicalOperation;
    use crate::types::NodeId;

    fn person() -> Fact {
        Fact::new("Person", "P1")
            .with_field("age", 25)
            .with_field("name", "Ada")
            .with_field("salary", 1000.0)
    }

    fn eval(expr: &Expr, fact: &Fact) -> Result<Value, ReteError> {
        evaluate(expr, &Single { variable: "p", fact })
    }

    #[test]
    fn comparisons() {
        let p = person();
        let e = Expr::binary(Expr::field("p", "age"), BinaryOp::Gt, Expr::number(18.0));
        assert_eq!(eval(&e, &p).expect("eval"), Value::Bool(true));
        let e = Expr::binary(Expr::field("p", "age"), BinaryOp::Le, Expr::number(25.0));
        assert_eq!(eval(&e, &p).expect("eval"), Value::Bool(true));
    }

    #[test]
    fn cross_variant_comparison_is_false_not_error() {
        let p = person();
        let e = Expr::binary(Expr::field("p", "age"), BinaryOp::Eq, Expr::string("25"));
        assert_eq!(eval(&e, &p).expect("eval"), Value::Bool(false));
        let e = Expr::binary(Expr::field("p", "age"), BinaryOp::Lt, Expr::string("z"));
        assert_eq!(eval(&e, &p).expect("eval"), Value::Bool(false));
        let e = Expr::binary(Expr::field("p", "age"), BinaryOp::Ne, Expr::string("25"));
        assert_eq!(eval(&e, &p).expect("eval"), Value::Bool(true));
    }

    #[test]
    fn arithmetic_and_concatenation() {
        let p = person();
        let e = Expr::binary(Expr::field("p", "salary"), BinaryOp::Mul, Expr::number(1.5));
        assert_eq!(eval(&e, &p).expect("eval"), Value::Number(1500.0));
        let e = Expr::binary(Expr::field("p", "name"), BinaryOp::Add, Expr::string("!"));
        assert_eq!(eval(&e, &p).expect("eval"), Value::from("Ada!"));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let p = person();
        let e = Expr::binary(Expr::field("p", "age"), BinaryOp::Div, Expr::number(0.0));
        assert!(matches!(eval(&e, &p), Err(ReteError::Evaluation(_))));
    }

    #[test]
    fn missing_field_is_an_error() {
        let p = person();
        let e = Expr::binary(Expr::field("p", "height"), BinaryOp::Gt, Expr::number(1.0));
        assert!(eval(&e, &p).is_err());
    }

    #[test]
    fn logical_precedence_and_short_circuit() {
        let p = person();
        // false AND <error> OR true  ->  true
        let e = Expr::Logical {
            left: Box::new(Expr::boolean(false)),
            operations: vec![
                LogicalOperation {
                    op: LogicalOp::And,
                    right: Expr::field("p", "missing"),
                },
                LogicalOperation {
                    op: LogicalOp::Or,
                    right: Expr::boolean(true),
                },
            ],
        };
        assert_eq!(eval(&e, &p).expect("eval"), Value::Bool(true));
        assert_eq!(
            eval(&Expr::not(Expr::boolean(true)), &p).expect("eval"),
            Value::Bool(false)
        );
    }

    #[test]
    fn functions() {
        let p = person();
        let call = |name: &str, args: Vec<Expr>| Expr::Call {
            name: name.to_string(),
            args,
        };
        assert_eq!(
            eval(&call("abs", vec![Expr::number(-2.0)]), &p).expect("abs"),
            Value::Number(2.0)
        );
        assert_eq!(
            eval(&call("MAX", vec![Expr::number(1.0), Expr::field("p", "age")]), &p).expect("max"),
            Value::Number(25.0)
        );
        assert_eq!(
            eval(&call("LENGTH", vec![Expr::field("p", "name")]), &p).expect("len"),
            Value::Number(3.0)
        );
        assert_eq!(
            eval(&call("UPPER", vec![Expr::field("p", "name")]), &p).expect("upper"),
            Value::from("ADA")
        );
        assert!(eval(&call("NOPE", vec![]), &p).is_err());
    }

    #[test]
    fn contains_on_strings_only() {
        let p = person();
        let e = Expr::binary(Expr::field("p", "name"), BinaryOp::Contains, Expr::string("d"));
        assert_eq!(eval(&e, &p).expect("eval"), Value::Bool(true));
        let e = Expr::binary(Expr::field("p", "age"), BinaryOp::Contains, Expr::string("2"));
        assert_eq!(eval(&e, &p).expect("eval"), Value::Bool(false));
    }

    #[test]
    fn token_and_extended_bindings() {
        let u = Arc::new(Fact::new("User", "U1"));
        let o = Fact::new("Order", "O1").with_field("user_id", "U1");
        let token = Token::from_fact("u", u, NodeId(1));
        let joined = Extended {
            base: &token,
            variable: "o",
            fact: &o,
        };
        let e = Expr::binary(Expr::field("u", "id"), BinaryOp::Eq, Expr::field("o", "user_id"));
        assert!(truthy(&e, &joined).expect("eval"));
    }

    #[test]
    fn context_resolves_step_results() {
        let mut ctx = EvaluationContext::new("p", Arc::new(person()));
        ctx.record("step_x", Value::Number(3.0));
        let e = Expr::binary(
            Expr::StepRef {
                name: "step_x".to_string(),
            },
            BinaryOp::Gt,
            Expr::number(2.0),
        );
        assert!(truthy(&e, &ctx).expect("eval"));
    }

    #[test]
    fn cache_counts_and_invalidates() {
        let mut cache = ArithmeticCache::new();
        let id = FactId::new("Person", "P1");
        assert!(cache.get(&id, "k").is_none());
        cache.insert(id.clone(), "k".to_string(), Value::Number(1.0));
        assert_eq!(cache.get(&id, "k"), Some(Value::Number(1.0)));
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
        cache.invalidate(&id);
        assert!(cache.is_empty());
    }

    #[test]
    fn thresholds() {
        assert!(compare_threshold(BinaryOp::Ge, &Value::Number(4.0), &Value::Number(4.0)));
        assert!(!compare_threshold(BinaryOp::Add, &Value::Number(4.0), &Value::Number(4.0)));
    }
}
