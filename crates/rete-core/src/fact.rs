//! # Facts and Type Definitions
//!
//! A fact is an immutable typed record. Its internal id is the pair
//! (type name, user id), so identical user ids never collide across types.
//! Updates are modeled as retract-then-insert by the network.

use crate::primitives::{DERIVED_ID_PREFIX, FACT_ID_SEPARATOR};
use crate::types::{ReteError, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

// =============================================================================
// FACT ID
// =============================================================================

/// Internal fact identifier: (type name, user id).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FactId {
    #[serde(rename = "type")]
    pub fact_type: String,
    pub id: String,
}

impl FactId {
    #[must_use]
    pub fn new(fact_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            fact_type: fact_type.into(),
            id: id.into(),
        }
    }

    /// Parse the rendered `Type~Id` form.
    #[must_use]
    pub fn parse(rendered: &str) -> Option<Self> {
        let (fact_type, id) = rendered.split_once(FACT_ID_SEPARATOR)?;
        if fact_type.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(fact_type, id))
    }
}

impl fmt::Display for FactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.fact_type, FACT_ID_SEPARATOR, self.id)
    }
}

// =============================================================================
// FACT
// =============================================================================

/// A typed fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// User-facing id, unique within its type.
    pub id: String,
    /// Type name.
    #[serde(rename = "type", alias = "reteType")]
    pub fact_type: String,
    /// Field values, ordered by name.
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    /// Creation time in milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: u64,
}

impl Fact {
    /// Create a fact with no fields, timestamped now.
    #[must_use]
    pub fn new(fact_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fact_type: fact_type.into(),
            fields: BTreeMap::new(),
            timestamp: now_millis(),
        }
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn internal_id(&self) -> FactId {
        FactId::new(self.fact_type.clone(), self.id.clone())
    }

    /// Look up a field. `id` falls back to the user id when no such field exists.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<Value> {
        match self.fields.get(name) {
            Some(v) => Some(v.clone()),
            None if name == "id" => Some(Value::String(self.id.clone())),
            None => None,
        }
    }

    /// Build a fact from its external JSON representation.
    ///
    /// Accepts the flat form `{id, type|reteType, field: value, ...}` and the
    /// parser form `{typeName, fields: [{name, value: {type, value}}]}`.
    /// When the id is absent it is derived from `definition`'s primary key
    /// fields, or from a digest of the field content.
    pub fn from_json(
        value: &serde_json::Value,
        definition: Option<&TypeDefinition>,
    ) -> Result<Self, ReteError> {
        let object = value.as_object().ok_or_else(|| ReteError::Validation {
            fact: value.to_string(),
            reason: "fact must be a JSON object".to_string(),
        })?;

        let fact_type = ["type", "reteType", "typeName"]
            .iter()
            .find_map(|key| object.get(*key).and_then(|v| v.as_str()))
            .ok_or_else(|| ReteError::Validation {
                fact: value.to_string(),
                reason: "missing type".to_string(),
            })?
            .to_string();

        let mut fields = BTreeMap::new();
        if let Some(serde_json::Value::Array(entries)) = object.get("fields") {
            for entry in entries {
                let name = entry.get("name").and_then(|n| n.as_str()).ok_or_else(|| {
                    ReteError::Validation {
                        fact: fact_type.clone(),
                        reason: "field entry without a name".to_string(),
                    }
                })?;
                let raw = entry.get("value").ok_or_else(|| ReteError::Validation {
                    fact: fact_type.clone(),
                    reason: format!("field {name} has no value"),
                })?;
                // Parser form wraps scalars as {type, value}.
                let scalar = raw.get("value").unwrap_or(raw);
                fields.insert(name.to_string(), scalar_field(&fact_type, name, scalar)?);
            }
        }
        for (key, raw) in object {
            if matches!(
                key.as_str(),
                "type" | "reteType" | "typeName" | "fields" | "timestamp"
            ) {
                continue;
            }
            fields.insert(key.clone(), scalar_field(&fact_type, key, raw)?);
        }

        let id = match fields.remove("id") {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => derive_id(&fields, definition),
        };

        let timestamp = object
            .get("timestamp")
            .and_then(|t| t.as_u64())
            .unwrap_or_else(now_millis);

        Ok(Self {
            id,
            fact_type,
            fields,
            timestamp,
        })
    }

    /// Flat JSON form, the inverse of [`Fact::from_json`].
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        object.insert("id".to_string(), serde_json::Value::String(self.id.clone()));
        object.insert(
            "type".to_string(),
            serde_json::Value::String(self.fact_type.clone()),
        );
        for (name, value) in &self.fields {
            object.insert(name.clone(), value.to_json());
        }
        serde_json::Value::Object(object)
    }
}

fn scalar_field(fact_type: &str, name: &str, raw: &serde_json::Value) -> Result<Value, ReteError> {
    Value::from_json(raw).ok_or_else(|| ReteError::Validation {
        fact: fact_type.to_string(),
        reason: format!("field {name} is not a string, number or bool"),
    })
}

/// Deterministic id for a fact submitted without one.
fn derive_id(fields: &BTreeMap<String, Value>, definition: Option<&TypeDefinition>) -> String {
    if let Some(def) = definition {
        let keys: Vec<String> = def
            .fields
            .iter()
            .filter(|f| f.primary_key)
            .filter_map(|f| fields.get(&f.name).map(ToString::to_string))
            .collect();
        if !keys.is_empty() && keys.len() == def.fields.iter().filter(|f| f.primary_key).count() {
            return keys.join("_");
        }
    }
    let mut hasher = blake3::Hasher::new();
    for (name, value) in fields {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.index_key().as_bytes());
        hasher.update(b";");
    }
    let digest = hasher.finalize();
    let hex = digest.to_hex();
    format!("{}{}", DERIVED_ID_PREFIX, &hex.as_str()[..16])
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// TYPE DEFINITIONS
// =============================================================================

/// Declared type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "number", alias = "int", alias = "integer", alias = "float")]
    Number,
    #[serde(rename = "bool", alias = "boolean")]
    Bool,
}

impl FieldType {
    #[must_use]
    pub fn admits(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Self::String, Value::String(_))
                | (Self::Number, Value::Number(_))
                | (Self::Bool, Value::Bool(_))
        )
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "bool",
        }
    }
}

/// One declared field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(rename = "isPrimaryKey", default)]
    pub primary_key: bool,
}

/// A fact template: name plus ordered fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDefinition {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

impl TypeDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Builder-style field declaration.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDefinition {
            name: name.into(),
            field_type,
            primary_key: false,
        });
        self
    }

    /// Check that every declared field is present and type-compatible.
    pub fn validate(&self, fact: &Fact) -> Result<(), ReteError> {
        if fact.fact_type != self.name {
            return Err(ReteError::Validation {
                fact: fact.internal_id().to_string(),
                reason: format!("expected type {}", self.name),
            });
        }
        for def in &self.fields {
            match fact.field(&def.name) {
                None => {
                    return Err(ReteError::Validation {
                        fact: fact.internal_id().to_string(),
                        reason: format!("missing field {}", def.name),
                    });
                }
                Some(value) if !def.field_type.admits(&value) => {
                    return Err(ReteError::Validation {
                        fact: fact.internal_id().to_string(),
                        reason: format!(
                            "field {} is {}, expected {}",
                            def.name,
                            value.type_name(),
                            def.field_type.name()
                        ),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn person() -> TypeDefinition {
        TypeDefinition::new("Person")
            .with_field("id", FieldType::String)
            .with_field("age", FieldType::Number)
    }

    #[test]
    fn internal_id_renders_with_tilde() {
        let fact = Fact::new("Person", "P1");
        assert_eq!(fact.internal_id().to_string(), "Person~P1");
        assert_eq!(FactId::parse("Person~P1"), Some(fact.internal_id()));
        assert_eq!(FactId::parse("Person"), None);
    }

    #[test]
    fn same_user_id_differs_across_types() {
        assert_ne!(
            Fact::new("User", "1").internal_id(),
            Fact::new("Order", "1").internal_id()
        );
    }

    #[test]
    fn id_field_falls_back_to_user_id() {
        let fact = Fact::new("Person", "P1");
        assert_eq!(fact.field("id"), Some(Value::from("P1")));
        assert_eq!(fact.field("age"), None);
    }

    #[test]
    fn flat_json_fact() {
        let fact = Fact::from_json(&json!({"id": "P1", "type": "Person", "age": 25}), None)
            .expect("parse");
        assert_eq!(fact.fact_type, "Person");
        assert_eq!(fact.id, "P1");
        assert_eq!(fact.fields.get("age"), Some(&Value::from(25.0)));
        assert!(!fact.fields.contains_key("id"));
    }

    #[test]
    fn rete_type_alias_and_parser_form() {
        let flat = Fact::from_json(&json!({"id": "O1", "reteType": "Order"}), None).expect("flat");
        assert_eq!(flat.fact_type, "Order");

        let typed = Fact::from_json(
            &json!({
                "typeName": "Order",
                "fields": [
                    {"name": "id", "value": {"type": "string", "value": "O2"}},
                    {"name": "amount", "value": {"type": "number", "value": 150}}
                ]
            }),
            None,
        )
        .expect("typed");
        assert_eq!(typed.id, "O2");
        assert_eq!(typed.fields.get("amount"), Some(&Value::from(150.0)));
    }

    #[test]
    fn nested_values_rejected() {
        let result = Fact::from_json(&json!({"id": "X", "type": "T", "tags": ["a"]}), None);
        assert!(matches!(result, Err(ReteError::Validation { .. })));
    }

    #[test]
    fn missing_id_uses_primary_key_then_digest() {
        let mut def = TypeDefinition::new("Account").with_field("number", FieldType::String);
        def.fields[0].primary_key = true;
        let keyed =
            Fact::from_json(&json!({"type": "Account", "number": "A-7"}), Some(&def)).expect("pk");
        assert_eq!(keyed.id, "A-7");

        let a = Fact::from_json(&json!({"type": "Log", "msg": "x"}), None).expect("digest");
        let b = Fact::from_json(&json!({"type": "Log", "msg": "x"}), None).expect("digest");
        assert_eq!(a.id, b.id);
        assert!(a.id.starts_with(DERIVED_ID_PREFIX));
    }

    #[test]
    fn validation_checks_presence_and_type() {
        let def = person();
        assert!(def.validate(&Fact::new("Person", "P1").with_field("age", 25)).is_ok());
        assert!(matches!(
            def.validate(&Fact::new("Person", "P1")),
            Err(ReteError::Validation { .. })
        ));
        assert!(matches!(
            def.validate(&Fact::new("Person", "P1").with_field("age", "old")),
            Err(ReteError::Validation { .. })
        ));
    }

    #[test]
    fn field_type_aliases() {
        let def: TypeDefinition = serde_json::from_value(json!({
            "name": "T",
            "fields": [{"name": "n", "type": "integer"}, {"name": "b", "type": "boolean"}]
        }))
        .expect("def");
        assert_eq!(def.fields[0].field_type, FieldType::Number);
        assert_eq!(def.fields[1].field_type, FieldType::Bool);
    }
}
