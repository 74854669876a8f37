//! # Condition Expressions
//!
//! One sum type for every condition shape the rule AST can carry, plus the
//! structural helpers the builders rely on.
//!
//! - `canonical`: canonical strings, hashes, normalization and splitting
//! - `eval`: the expression evaluator and evaluation contexts
//! - `decompose`: arithmetic decomposition into atomic steps
//!
//! The JSON shape follows the parser's output: every node carries a `type`
//! tag. Synonymous tags (`comparison`/`binaryOperation`, `number`/
//! `numberLiteral`, ...) deserialize to the same variant, so typed and map
//! representations of a condition are interchangeable.

pub mod canonical;
pub mod decompose;
pub mod eval;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// =============================================================================
// OPERATORS
// =============================================================================

/// Binary operators: arithmetic and comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Sub,
    #[serde(rename = "*")]
    Mul,
    #[serde(rename = "/")]
    Div,
    #[serde(rename = "%")]
    Mod,
    #[serde(rename = "==", alias = "=")]
    Eq,
    #[serde(rename = "!=", alias = "<>")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "contains", alias = "CONTAINS")]
    Contains,
}

impl BinaryOp {
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Contains => "contains",
        }
    }

    #[must_use]
    pub fn is_arithmetic(self) -> bool {
        matches!(self, Self::Add | Self::Sub | Self::Mul | Self::Div | Self::Mod)
    }

    #[must_use]
    pub fn is_comparison(self) -> bool {
        !self.is_arithmetic()
    }

    /// Operators whose operands may be swapped without changing the result.
    #[must_use]
    pub fn is_commutative(self) -> bool {
        matches!(self, Self::Eq | Self::Ne | Self::Mul)
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Logical connectives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogicalOp {
    #[serde(rename = "AND", alias = "and", alias = "&&")]
    And,
    #[serde(rename = "OR", alias = "or", alias = "||")]
    Or,
}

/// Aggregation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AggregateFunction {
    #[serde(rename = "AVG", alias = "avg")]
    Avg,
    #[serde(rename = "SUM", alias = "sum")]
    Sum,
    #[serde(rename = "COUNT", alias = "count")]
    Count,
    #[serde(rename = "MIN", alias = "min")]
    Min,
    #[serde(rename = "MAX", alias = "max")]
    Max,
}

impl AggregateFunction {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Avg => "AVG",
            Self::Sum => "SUM",
            Self::Count => "COUNT",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// EXPRESSION AST
// =============================================================================

/// `{op, right}` element of an n-ary logical expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalOperation {
    pub op: LogicalOp,
    pub right: Expr,
}

/// Variable declaration inside an `existsConstraint`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedVariable {
    pub name: String,
    #[serde(rename = "dataType", alias = "data_type")]
    pub data_type: String,
}

/// A condition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Expr {
    #[serde(rename = "fieldAccess")]
    FieldAccess { object: String, field: String },

    #[serde(rename = "variable")]
    Variable { name: String },

    #[serde(rename = "numberLiteral", alias = "number")]
    Number { value: f64 },

    #[serde(rename = "stringLiteral", alias = "string")]
    String { value: String },

    #[serde(rename = "booleanLiteral", alias = "bool", alias = "boolean")]
    Bool { value: bool },

    #[serde(rename = "binaryOperation", alias = "comparison", alias = "binaryOp")]
    Binary {
        left: Box<Expr>,
        operator: BinaryOp,
        right: Box<Expr>,
    },

    /// `left op1 r1 op2 r2 ...`; AND binds tighter than OR.
    #[serde(rename = "logicalExpr", alias = "logicalExpression")]
    Logical {
        left: Box<Expr>,
        #[serde(default)]
        operations: Vec<LogicalOperation>,
    },

    #[serde(rename = "notConstraint", alias = "not")]
    Not { expression: Box<Expr> },

    /// Redundant wrapper emitted by the parser around simple rules.
    #[serde(rename = "constraint")]
    Wrapped { constraint: Box<Expr> },

    #[serde(rename = "existsConstraint")]
    Exists {
        variable: TypedVariable,
        condition: Box<Expr>,
    },

    #[serde(rename = "aggregateConstraint", alias = "accumulateConstraint")]
    Aggregate {
        function: AggregateFunction,
        expression: Box<Expr>,
        operator: BinaryOp,
        value: Box<Expr>,
    },

    #[serde(rename = "functionCall")]
    Call {
        name: String,
        #[serde(default)]
        args: Vec<Expr>,
    },

    /// Result of a decomposition step, read from the evaluation context.
    #[serde(rename = "tempResult")]
    StepRef { name: String },
}

impl Expr {
    // -------------------------------------------------------------------------
    // Constructors
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn field(object: impl Into<String>, field: impl Into<String>) -> Self {
        Self::FieldAccess {
            object: object.into(),
            field: field.into(),
        }
    }

    #[must_use]
    pub fn number(value: f64) -> Self {
        Self::Number { value }
    }

    #[must_use]
    pub fn string(value: impl Into<String>) -> Self {
        Self::String {
            value: value.into(),
        }
    }

    #[must_use]
    pub fn boolean(value: bool) -> Self {
        Self::Bool { value }
    }

    #[must_use]
    pub fn binary(left: Expr, operator: BinaryOp, right: Expr) -> Self {
        Self::Binary {
            left: Box::new(left),
            operator,
            right: Box::new(right),
        }
    }

    /// `terms[0] op terms[1] op ...`; a single term is returned as is.
    #[must_use]
    pub fn chain(op: LogicalOp, terms: Vec<Expr>) -> Option<Self> {
        let mut iter = terms.into_iter();
        let first = iter.next()?;
        let operations: Vec<LogicalOperation> = iter
            .map(|right| LogicalOperation { op, right })
            .collect();
        if operations.is_empty() {
            return Some(first);
        }
        Some(Self::Logical {
            left: Box::new(first),
            operations,
        })
    }

    #[must_use]
    pub fn and(terms: Vec<Expr>) -> Option<Self> {
        Self::chain(LogicalOp::And, terms)
    }

    #[must_use]
    pub fn or(terms: Vec<Expr>) -> Option<Self> {
        Self::chain(LogicalOp::Or, terms)
    }

    #[must_use]
    pub fn not(expression: Expr) -> Self {
        Self::Not {
            expression: Box::new(expression),
        }
    }

    // -------------------------------------------------------------------------
    // Structure
    // -------------------------------------------------------------------------

    /// Variables the expression reads.
    ///
    /// The quantified variable of an `existsConstraint` is local to it and is
    /// not reported.
    #[must_use]
    pub fn variables(&self) -> BTreeSet<String> {
        let mut vars = BTreeSet::new();
        self.collect_variables(&mut vars);
        vars
    }

    fn collect_variables(&self, vars: &mut BTreeSet<String>) {
        match self {
            Self::FieldAccess { object, .. } => {
                vars.insert(object.clone());
            }
            Self::Variable { name } => {
                vars.insert(name.clone());
            }
            Self::Number { .. } | Self::String { .. } | Self::Bool { .. } | Self::StepRef { .. } => {
            }
            Self::Binary { left, right, .. } => {
                left.collect_variables(vars);
                right.collect_variables(vars);
            }
            Self::Logical { left, operations } => {
                left.collect_variables(vars);
                for op in operations {
                    op.right.collect_variables(vars);
                }
            }
            Self::Not { expression } => expression.collect_variables(vars),
            Self::Wrapped { constraint } => constraint.collect_variables(vars),
            Self::Exists {
                variable,
                condition,
            } => {
                let mut inner = BTreeSet::new();
                condition.collect_variables(&mut inner);
                inner.remove(&variable.name);
                vars.extend(inner);
            }
            Self::Aggregate {
                expression, value, ..
            } => {
                expression.collect_variables(vars);
                value.collect_variables(vars);
            }
            Self::Call { args, .. } => {
                for arg in args {
                    arg.collect_variables(vars);
                }
            }
        }
    }

    /// True if evaluating the expression performs arithmetic or calls a function.
    #[must_use]
    pub fn has_arithmetic(&self) -> bool {
        match self {
            Self::Binary {
                left,
                operator,
                right,
            } => operator.is_arithmetic() || left.has_arithmetic() || right.has_arithmetic(),
            Self::Call { .. } => true,
            Self::Logical { left, operations } => {
                left.has_arithmetic() || operations.iter().any(|o| o.right.has_arithmetic())
            }
            Self::Not { expression } => expression.has_arithmetic(),
            Self::Wrapped { constraint } => constraint.has_arithmetic(),
            _ => false,
        }
    }

    /// True for expressions that only builders can interpret.
    #[must_use]
    pub fn is_quantifier(&self) -> bool {
        match self {
            Self::Exists { .. } | Self::Aggregate { .. } => true,
            Self::Not { expression } => expression.is_quantifier(),
            Self::Wrapped { constraint } => constraint.is_quantifier(),
            _ => false,
        }
    }

    /// True if a quantifier appears anywhere in the tree.
    #[must_use]
    pub fn contains_quantifier(&self) -> bool {
        match self {
            Self::Exists { .. } | Self::Aggregate { .. } => true,
            Self::Binary { left, right, .. } => {
                left.contains_quantifier() || right.contains_quantifier()
            }
            Self::Logical { left, operations } => {
                left.contains_quantifier()
                    || operations.iter().any(|o| o.right.contains_quantifier())
            }
            Self::Not { expression } => expression.contains_quantifier(),
            Self::Wrapped { constraint } => constraint.contains_quantifier(),
            Self::Call { args, .. } => args.iter().any(Expr::contains_quantifier),
            _ => false,
        }
    }

    /// Remove redundant `constraint` wrappers at the top of the tree.
    #[must_use]
    pub fn unwrapped(&self) -> &Expr {
        match self {
            Self::Wrapped { constraint } => constraint.unwrapped(),
            other => other,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&canonical::canonical_string(self))
    }
}

// =============================================================================
// TESTS
// =============================================================================
