//! Request/response schema registry.
//!
//! Schemas are small JSON documents (`*.schema.json`) discovered under the
//! manifest roots:
//!
//! ```json
//! {
//!   "id": "notes.summarize.input",
//!   "required": ["text"],
//!   "properties": { "text": "string", "max_words": "integer" },
//!   "additional_properties": false
//! }
//! ```
//!
//! Validation never coerces: a value either matches or yields a
//! [`SchemaViolation`] naming the schema id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Permissive schema available without any file on disk.
pub const ANY_SCHEMA_ID: &str = "skillgate.any";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Null,
    Any,
}

impl FieldType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Null => value.is_null(),
            FieldType::Any => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Null => "null",
            FieldType::Any => "any",
        }
    }
}

/// Top-level object schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PayloadSchema {
    pub id: String,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, FieldType>,
    #[serde(default = "default_additional")]
    pub additional_properties: bool,
}

fn default_additional() -> bool {
    true
}

impl PayloadSchema {
    pub fn any() -> Self {
        Self {
            id: ANY_SCHEMA_ID.to_string(),
            required: Vec::new(),
            properties: BTreeMap::new(),
            additional_properties: true,
        }
    }

    /// Check `value` against this schema.
    pub fn validate(&self, value: &Value) -> Result<(), SchemaViolation> {
        let violation = |field: Option<&str>, reason: String| SchemaViolation {
            schema_id: self.id.clone(),
            field: field.map(str::to_string),
            reason,
        };

        let Some(object) = value.as_object() else {
            return Err(violation(None, "payload must be a JSON object".to_string()));
        };

        for name in &self.required {
            if !object.contains_key(name) {
                return Err(violation(Some(name), "required field is missing".to_string()));
            }
        }

        for (name, field_value) in object {
            match self.properties.get(name) {
                Some(ty) if !ty.matches(field_value) => {
                    return Err(violation(Some(name), format!("expected {}", ty.as_str())));
                }
                Some(_) => {}
                None if !self.additional_properties => {
                    return Err(violation(Some(name), "unexpected field".to_string()));
                }
                None => {}
            }
        }
        Ok(())
    }

    fn check_consistent(&self) -> Result<(), SchemaError> {
        if let Some(missing) = self
            .required
            .iter()
            .find(|r| !self.additional_properties && !self.properties.contains_key(*r))
        {
            return Err(SchemaError::Inconsistent {
                schema_id: self.id.clone(),
                reason: format!("required field '{missing}' is not a declared property"),
            });
        }
        Ok(())
    }
}

/// A payload did not match its declared schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("schema {schema_id}{}: {reason}", .field.as_ref().map(|f| format!(" field '{f}'")).unwrap_or_default())]
pub struct SchemaViolation {
    pub schema_id: String,
    pub field: Option<String>,
    pub reason: String,
}

/// Problems with a schema document itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("schema parse error: {0}")]
    Parse(String),

    #[error("schema '{schema_id}' is declared more than once")]
    Duplicate { schema_id: String },

    #[error("schema '{schema_id}' is inconsistent: {reason}")]
    Inconsistent { schema_id: String, reason: String },
}

/// Immutable set of schemas keyed by id.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, PayloadSchema>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        let mut schemas = BTreeMap::new();
        schemas.insert(ANY_SCHEMA_ID.to_string(), PayloadSchema::any());
        Self { schemas }
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and add one schema document.
    pub fn register_json(&mut self, text: &str) -> Result<&PayloadSchema, SchemaError> {
        let schema: PayloadSchema =
            serde_json::from_str(text).map_err(|e| SchemaError::Parse(e.to_string()))?;
        self.register(schema)
    }

    pub fn register(&mut self, schema: PayloadSchema) -> Result<&PayloadSchema, SchemaError> {
        schema.check_consistent()?;
        if self.schemas.contains_key(&schema.id) {
            return Err(SchemaError::Duplicate {
                schema_id: schema.id,
            });
        }
        let id = schema.id.clone();
        Ok(self.schemas.entry(id).or_insert(schema))
    }

    pub fn contains(&self, schema_id: &str) -> bool {
        self.schemas.contains_key(schema_id)
    }

    pub fn get(&self, schema_id: &str) -> Option<&PayloadSchema> {
        self.schemas.get(schema_id)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Validate `value` against the schema registered as `schema_id`.
    ///
    /// An unknown id is itself a violation; manifests referencing unknown ids
    /// never reach a snapshot, so this only triggers on direct use.
    pub fn validate(&self, schema_id: &str, value: &Value) -> Result<(), SchemaViolation> {
        match self.schemas.get(schema_id) {
            Some(schema) => schema.validate(value),
            None => Err(SchemaViolation {
                schema_id: schema_id.to_string(),
                field: None,
                reason: "schema is not registered".to_string(),
            }),
        }
    }
}
