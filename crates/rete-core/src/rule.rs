//! # Rule AST
//!
//! The parsed program the engine consumes: type definitions, rules, initial
//! facts and rule removals. Field names follow the parser's JSON output.

use crate::expr::{AggregateFunction, BinaryOp, Expr};
use crate::fact::TypeDefinition;
use crate::types::RuleId;
use serde::{Deserialize, Deserializer, Serialize};

// =============================================================================
// PROGRAM
// =============================================================================

/// A parsed program.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub types: Vec<TypeDefinition>,
    #[serde(default, alias = "rules")]
    pub expressions: Vec<RuleDefinition>,
    /// Facts in external JSON form; see [`crate::fact::Fact::from_json`].
    #[serde(default)]
    pub facts: Vec<serde_json::Value>,
    #[serde(default, rename = "ruleRemovals")]
    pub rule_removals: Vec<RuleRemoval>,
}

impl Program {
    pub fn from_json_str(text: &str) -> Result<Self, crate::types::ReteError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Declared type by name.
    #[must_use]
    pub fn type_definition(&self, name: &str) -> Option<&TypeDefinition> {
        self.types.iter().find(|t| t.name == name)
    }
}

/// `remove rule <id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRemoval {
    #[serde(rename = "ruleID", alias = "ruleId")]
    pub rule_id: RuleId,
}

// =============================================================================
// RULES
// =============================================================================

/// One rule: variable patterns, a condition tree and an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    #[serde(rename = "ruleId", alias = "rule_id")]
    pub rule_id: RuleId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<Pattern>,
    /// Single-pattern form kept for older programs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<Pattern>,
    #[serde(default, deserialize_with = "optional_condition")]
    pub constraints: Option<Expr>,
    #[serde(default)]
    pub action: Option<Action>,
}

impl RuleDefinition {
    #[must_use]
    pub fn new(rule_id: impl Into<String>) -> Self {
        Self {
            rule_id: RuleId::new(rule_id),
            patterns: Vec::new(),
            set: None,
            constraints: None,
            action: None,
        }
    }

    /// Builder-style pattern with one variable per `(name, type)` pair.
    #[must_use]
    pub fn with_pattern(mut self, variables: &[(&str, &str)]) -> Self {
        self.patterns.push(Pattern {
            variables: variables
                .iter()
                .map(|(name, data_type)| VariableDecl::typed(*name, *data_type))
                .collect(),
        });
        self
    }

    /// Builder-style aggregation variable, appended to the first pattern.
    #[must_use]
    pub fn with_aggregation(mut self, aggregation: VariableDecl) -> Self {
        if self.patterns.is_empty() {
            self.patterns.push(Pattern::default());
        }
        if let Some(first) = self.patterns.first_mut() {
            first.variables.push(aggregation);
        }
        self
    }

    #[must_use]
    pub fn with_condition(mut self, condition: Expr) -> Self {
        self.constraints = Some(condition);
        self
    }

    #[must_use]
    pub fn with_action(mut self, name: impl Into<String>, args: Vec<ActionArg>) -> Self {
        self.action = Some(Action::single(name, args));
        self
    }

    /// Patterns in declaration order, falling back to `set`.
    #[must_use]
    pub fn all_patterns(&self) -> Vec<&Pattern> {
        if self.patterns.is_empty() {
            self.set.iter().collect()
        } else {
            self.patterns.iter().collect()
        }
    }

    /// Regular (non-aggregation) variables as `(name, type)`, in order.
    #[must_use]
    pub fn variables(&self) -> Vec<(String, String)> {
        self.all_patterns()
            .into_iter()
            .flat_map(|p| p.variables.iter())
            .filter(|v| !v.is_aggregation())
            .filter_map(|v| v.declared_type().map(|t| (v.name.clone(), t.to_string())))
            .collect()
    }

    /// Aggregation variable declarations, in order.
    #[must_use]
    pub fn aggregation_variables(&self) -> Vec<&VariableDecl> {
        self.all_patterns()
            .into_iter()
            .flat_map(|p| p.variables.iter())
            .filter(|v| v.is_aggregation())
            .collect()
    }
}

/// Treat `null` and `{}` as "no condition".
fn optional_condition<'de, D>(deserializer: D) -> Result<Option<Expr>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    match raw {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Object(map)) if map.is_empty() => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// One pattern block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    #[serde(default)]
    pub variables: Vec<VariableDecl>,
}

/// Field reference of an aggregation variable: `"score"` or `{object, field}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldRef {
    Name(String),
    Access { object: String, field: String },
}

impl FieldRef {
    #[must_use]
    pub fn field(&self) -> &str {
        match self {
            Self::Name(f) | Self::Access { field: f, .. } => f,
        }
    }

    #[must_use]
    pub fn object(&self) -> Option<&str> {
        match self {
            Self::Name(_) => None,
            Self::Access { object, .. } => Some(object),
        }
    }
}

/// A declared variable.
///
/// `type` is either the variable kind (`typedVariable`,
/// `aggregationVariable`) or, in the short form, the data type itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDecl {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(rename = "dataType", default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<AggregateFunction>,
    #[serde(rename = "sourceVar", default, skip_serializing_if = "Option::is_none")]
    pub source_var: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<FieldRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<BinaryOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

const VARIABLE_KINDS: [&str; 3] = ["typedVariable", "aggregationVariable", "variable"];

impl VariableDecl {
    #[must_use]
    pub fn typed(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: Some("typedVariable".to_string()),
            data_type: Some(data_type.into()),
            function: None,
            source_var: None,
            field: None,
            operator: None,
            threshold: None,
        }
    }

    /// `name = FUNCTION(source.field)`.
    #[must_use]
    pub fn aggregation(
        name: impl Into<String>,
        function: AggregateFunction,
        source: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: Some("aggregationVariable".to_string()),
            data_type: None,
            function: Some(function),
            source_var: Some(source.into()),
            field: Some(FieldRef::Name(field.into())),
            operator: None,
            threshold: None,
        }
    }

    /// Builder-style threshold gate.
    #[must_use]
    pub fn with_threshold(mut self, operator: BinaryOp, threshold: f64) -> Self {
        self.operator = Some(operator);
        self.threshold = Some(threshold);
        self
    }

    #[must_use]
    pub fn is_aggregation(&self) -> bool {
        self.kind.as_deref() == Some("aggregationVariable") || self.function.is_some()
    }

    /// The fact type a regular variable ranges over.
    #[must_use]
    pub fn declared_type(&self) -> Option<&str> {
        self.data_type.as_deref().or_else(|| {
            self.kind
                .as_deref()
                .filter(|k| !VARIABLE_KINDS.contains(k))
        })
    }

    /// Variable an aggregation reads from.
    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.source_var
            .as_deref()
            .or_else(|| self.field.as_ref().and_then(FieldRef::object))
    }
}

// =============================================================================
// ACTIONS
// =============================================================================

/// Argument of an action call: an expression over the bindings, or a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionArg {
    Expr(Expr),
    Literal(serde_json::Value),
}

impl ActionArg {
    /// Whole fact bound to `variable`.
    #[must_use]
    pub fn variable(name: impl Into<String>) -> Self {
        Self::Expr(Expr::Variable { name: name.into() })
    }

    #[must_use]
    pub fn field(object: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Expr(Expr::field(object, field))
    }
}

/// One named call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCall {
    pub name: String,
    #[serde(default)]
    pub args: Vec<ActionArg>,
}

/// The action of a rule: one or more calls, run in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawAction")]
pub struct Action {
    pub jobs: Vec<JobCall>,
}

impl Action {
    #[must_use]
    pub fn single(name: impl Into<String>, args: Vec<ActionArg>) -> Self {
        Self {
            jobs: vec![JobCall {
                name: name.into(),
                args,
            }],
        }
    }

    /// Name of the first call.
    #[must_use]
    pub fn name(&self) -> &str {
        self.jobs.first().map(|j| j.name.as_str()).unwrap_or_default()
    }
}

/// Every action shape the parser has produced: `{name, args}`,
/// `{job: {...}}` and `{jobs: [...]}`.
#[derive(Deserialize)]
struct RawAction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    args: Vec<ActionArg>,
    #[serde(default)]
    job: Option<JobCall>,
    #[serde(default)]
    jobs: Vec<JobCall>,
}

impl From<RawAction> for Action {
    fn from(raw: RawAction) -> Self {
        let mut jobs = raw.jobs;
        if jobs.is_empty() {
            if let Some(job) = raw.job {
                jobs.push(job);
            } else if let Some(name) = raw.name {
                jobs.push(JobCall {
                    name,
                    args: raw.args,
                });
            }
        }
        Self { jobs }
    }
}

// =============================================================================
// TESTS
// =============================================================================
