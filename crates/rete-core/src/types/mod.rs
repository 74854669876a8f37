//! # Core Type Definitions
//!
//! This module contains the shared vocabulary of the engine:
//! - Identifiers (`NodeId`, `RuleId`, `TransactionId`)
//! - Field values (`Value`)
//! - Error types (`ReteError`, `CommandPhase`)
//!
//! ## Determinism Guarantees
//!
//! Identifiers implement `Ord` so that every collection keyed by them can be a
//! `BTreeMap`/`BTreeSet`. Values compare only within their own variant.

use crate::fact::FactId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Identifier of a node inside one network.
///
/// Ids are allocated monotonically and never reused within a network's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Identifier of a rule, unique within a network.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub String);

impl RuleId {
    /// Create a rule id from any string-like value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the rule id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RuleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a transaction, unique within a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

// =============================================================================
// VALUE
// =============================================================================

/// A field value carried by facts, bindings and evaluation results.
///
/// Equality and ordering are defined only within the same variant.
/// Comparing a number with a string is not an error: it is simply false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    String(String),
}

impl Value {
    /// Name of the variant, matching the field types of type definitions.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Ordering between two values of the same variant.
    ///
    /// Returns `None` across variants, for booleans, and for NaN.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.partial_cmp(b),
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Stable string key used to index values (join keys, group keys).
    ///
    /// Distinct variants never share a key: `4` and `"4"` index apart.
    #[must_use]
    pub fn index_key(&self) -> String {
        match self {
            Self::Bool(b) => format!("b:{b}"),
            Self::Number(n) => format!("n:{n}"),
            Self::String(s) => format!("s:{s}"),
        }
    }

    /// Convert a JSON scalar into a value. Objects, arrays and null yield `None`.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(Self::Number),
            serde_json::Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::String(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Phase of a command that failed inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandPhase {
    Execute,
    Undo,
}

impl fmt::Display for CommandPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Execute => f.write_str("execute"),
            Self::Undo => f.write_str("undo"),
        }
    }
}

/// Errors that can occur in the Rete engine.
///
/// - No silent failures: every fallible operation returns `Result<T, ReteError>`
/// - Unknown actions are not errors; they are logged and counted
/// - The engine never panics; all errors are recoverable by the caller
#[derive(Debug, Error)]
pub enum ReteError {
    /// A fact is missing a declared field or carries a mistyped one.
    #[error("Validation failed for {fact}: {reason}")]
    Validation { fact: String, reason: String },

    /// A fact with the same internal id is already stored.
    #[error("Duplicate fact: {0}")]
    Duplicate(FactId),

    /// The requested fact is not stored.
    #[error("Fact not found: {0}")]
    NotFound(FactId),

    /// A fact or rule references a type that was never declared.
    #[error("Unknown type: {0}")]
    UnknownType(String),

    /// A rule could not be translated into a subnetwork.
    #[error("Invalid rule {rule}: {reason}")]
    InvalidRule { rule: RuleId, reason: String },

    /// No rule with this id is registered.
    #[error("Rule not found: {0}")]
    RuleNotFound(RuleId),

    /// A decomposition step depends on itself, directly or transitively.
    #[error("Dependency cycle through step {0}")]
    Cycle(String),

    /// A decomposition step consumes a result no step produces.
    #[error("Step {step} depends on unknown result {dependency}")]
    MissingDependency { step: String, dependency: String },

    /// A sharing registry holds a different condition under the same hash.
    #[error("Registry conflict on {hash}: {reason}")]
    RegistryConflict { hash: String, reason: String },

    /// The persistence barrier gave up waiting for a fact.
    #[error("Timed out after {elapsed_ms} ms waiting for fact {fact}")]
    SubmissionTimeout { fact: FactId, elapsed_ms: u64 },

    /// A transaction command failed.
    #[error("Command {command} failed during {phase} at position {position}: {source}")]
    Command {
        command: String,
        phase: CommandPhase,
        position: usize,
        #[source]
        source: Box<ReteError>,
    },

    /// A transaction operation is not allowed in the current state.
    #[error("Invalid transaction state: {0}")]
    InvalidState(String),

    /// The network's structure or bookkeeping is inconsistent.
    #[error("Network integrity violated: {0}")]
    Integrity(String),

    /// An expression could not be evaluated.
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// An action handler reported a failure.
    #[error("Action {action} failed: {reason}")]
    Action { action: String, reason: String },

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(String),
}

impl ReteError {
    /// The innermost error, looking through transaction command wrappers.
    #[must_use]
    pub fn root_cause(&self) -> &ReteError {
        match self {
            Self::Command { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub(crate) fn invalid_rule(rule: &RuleId, reason: impl Into<String>) -> Self {
        Self::InvalidRule {
            rule: rule.clone(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for ReteError {
    fn from(e: serde_json::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_variant_values_never_equal() {
        assert_ne!(Value::from(4.0), Value::from("4"));
        assert_ne!(Value::from(true), Value::from(1.0));
        assert_eq!(Value::from(4.0).compare(&Value::from("4")), None);
    }

    #[test]
    fn same_variant_ordering() {
        assert_eq!(
            Value::from(1.5).compare(&Value::from(2.0)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::from("b").compare(&Value::from("a")),
            Some(Ordering::Greater)
        );
        assert_eq!(Value::from(true).compare(&Value::from(true)), None);
    }

    #[test]
    fn index_keys_separate_variants() {
        assert_ne!(Value::from(4.0).index_key(), Value::from("4").index_key());
        assert_eq!(Value::from(4.0).index_key(), Value::from(4).index_key());
    }

    #[test]
    fn value_json_round_trip_shapes() {
        let v: Value = serde_json::from_str("25").expect("number");
        assert_eq!(v, Value::Number(25.0));
        let v: Value = serde_json::from_str("\"P1\"").expect("string");
        assert_eq!(v, Value::String("P1".to_string()));
        let v: Value = serde_json::from_str("true").expect("bool");
        assert_eq!(v, Value::Bool(true));
        assert!(Value::from_json(&serde_json::json!(null)).is_none());
    }

    #[test]
    fn root_cause_unwraps_commands() {
        let inner = ReteError::NotFound(FactId::new("Person", "P1"));
        let wrapped = ReteError::Command {
            command: "RemoveFact".to_string(),
            phase: CommandPhase::Execute,
            position: 0,
            source: Box::new(inner),
        };
        assert!(matches!(wrapped.root_cause(), ReteError::NotFound(_)));
    }

    #[test]
    fn display_formats() {
        assert_eq!(NodeId(7).to_string(), "n7");
        assert_eq!(TransactionId(3).to_string(), "tx3");
        assert_eq!(Value::from(18.0).to_string(), "18");
    }
}
