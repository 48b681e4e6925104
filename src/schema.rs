// Schema validation for untrusted JSON

//! # Schema Validator
//!
//! Every value crossing a trust boundary passes through here: tool inputs,
//! tool outputs, inbound events and the text-understanding service's replies.
//! Validation is purely structural:
//! - required keys must be present (a nullable field still needs its key)
//! - primitive types must match exactly, with no coercion (`"1"` is not a number)
//! - enum members match case-sensitively
//! - arrays validate element-wise, and `nonempty` arrays reject `[]`
//! - nested objects recurse; unknown keys are ignored
//!
//! A failure is a typed [`ValidationError`] carrying the dot-notation path of
//! the offending value.

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::{PipelineError, Result};

/// Declared shape of a JSON value
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    String { min_len: usize },
    Number { min: Option<f64>, max: Option<f64> },
    Integer,
    Boolean,
    /// Closed set of string members
    Enum(Vec<String>),
    Array { items: Box<Schema>, nonempty: bool },
    Object(Vec<Field>),
    /// Object with arbitrary keys whose values share one schema
    Map(Box<Schema>),
    Nullable(Box<Schema>),
    /// Accepts any value, including null
    Any,
}

/// A named member of an object schema
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub schema: Schema,
    pub required: bool,
}

impl Field {
    pub fn required(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            schema,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            schema,
            required: false,
        }
    }
}

impl Schema {
    pub fn string() -> Self {
        Schema::String { min_len: 0 }
    }

    /// String with at least one character
    pub fn non_empty_string() -> Self {
        Schema::String { min_len: 1 }
    }

    pub fn number() -> Self {
        Schema::Number {
            min: None,
            max: None,
        }
    }

    pub fn number_in(min: f64, max: f64) -> Self {
        Schema::Number {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn integer() -> Self {
        Schema::Integer
    }

    pub fn boolean() -> Self {
        Schema::Boolean
    }

    pub fn enumeration<S: AsRef<str>>(members: &[S]) -> Self {
        Schema::Enum(members.iter().map(|m| m.as_ref().to_string()).collect())
    }

    pub fn array(items: Schema) -> Self {
        Schema::Array {
            items: Box::new(items),
            nonempty: false,
        }
    }

    pub fn nonempty_array(items: Schema) -> Self {
        Schema::Array {
            items: Box::new(items),
            nonempty: true,
        }
    }

    pub fn object(fields: Vec<Field>) -> Self {
        Schema::Object(fields)
    }

    pub fn map(values: Schema) -> Self {
        Schema::Map(Box::new(values))
    }

    pub fn any() -> Self {
        Schema::Any
    }

    /// Allow `null` in addition to this schema
    pub fn nullable(self) -> Self {
        match self {
            Schema::Nullable(_) | Schema::Any => self,
            other => Schema::Nullable(Box::new(other)),
        }
    }

    /// Strip a `Nullable` wrapper, if any
    pub fn non_null(&self) -> &Schema {
        match self {
            Schema::Nullable(inner) => inner,
            other => other,
        }
    }

    /// Look up a member of an object schema by name
    pub fn field(&self, name: &str) -> Option<&Field> {
        match self.non_null() {
            Schema::Object(fields) => fields.iter().find(|f| f.name == name),
            _ => None,
        }
    }

    /// Compact, TypeScript-like rendering used in prompts and error messages
    pub fn describe(&self) -> String {
        match self {
            Schema::String { .. } => "string".to_string(),
            Schema::Number { .. } => "number".to_string(),
            Schema::Integer => "integer".to_string(),
            Schema::Boolean => "boolean".to_string(),
            Schema::Enum(members) => members
                .iter()
                .map(|m| format!("\"{}\"", m))
                .collect::<Vec<_>>()
                .join(" | "),
            Schema::Array { items, .. } => format!("Array<{}>", items.describe()),
            Schema::Object(fields) => {
                let members = fields
                    .iter()
                    .map(|f| {
                        let marker = if f.required { "" } else { "?" };
                        format!("\"{}\"{}: {}", f.name, marker, f.schema.describe())
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{{ {} }}", members)
            }
            Schema::Map(values) => format!("Record<string, {}>", values.describe()),
            Schema::Nullable(inner) => format!("{} | null", inner.describe()),
            Schema::Any => "any".to_string(),
        }
    }
}

/// What went wrong at a given path
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationErrorKind {
    #[error("missing required field")]
    MissingField,

    #[error("expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("`{value}` is not one of [{}]", .allowed.join(", "))]
    NotInEnum { value: String, allowed: Vec<String> },

    #[error("array must not be empty")]
    EmptyArray,

    #[error("string shorter than {min} characters")]
    TooShort { min: usize },

    #[error("{value} is outside [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },

    #[error("malformed JSON: {0}")]
    Malformed(String),
}

/// A value failed validation
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} at `{}`", display_path(.path))]
pub struct ValidationError {
    /// Dot-notation path to the offending value, empty for the root
    pub path: String,
    pub kind: ValidationErrorKind,
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "$"
    } else {
        path
    }
}

impl ValidationError {
    pub fn new(path: impl Into<String>, kind: ValidationErrorKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    pub fn missing(path: impl Into<String>) -> Self {
        Self::new(path, ValidationErrorKind::MissingField)
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::new("", ValidationErrorKind::Malformed(reason.into()))
    }
}

/// Validate `value` against `schema`
pub fn validate(schema: &Schema, value: &Value) -> std::result::Result<(), ValidationError> {
    validate_at(schema, value, "")
}

/// Validate and then deserialize into a typed value
pub fn validate_into<T: DeserializeOwned>(schema: &Schema, value: Value) -> Result<T> {
    validate(schema, &value)?;
    serde_json::from_value(value).map_err(PipelineError::from)
}

/// Parse untrusted JSON text; unparseable text is a validation failure
pub fn parse_json(text: &str) -> std::result::Result<Value, ValidationError> {
    serde_json::from_str(text).map_err(|e| ValidationError::malformed(e.to_string()))
}

fn join(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_string()
    } else {
        format!("{}.{}", path, segment)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn mismatch(path: &str, expected: &str, found: &Value) -> ValidationError {
    ValidationError::new(
        path,
        ValidationErrorKind::TypeMismatch {
            expected: expected.to_string(),
            found: type_name(found).to_string(),
        },
    )
}

fn validate_at(
    schema: &Schema,
    value: &Value,
    path: &str,
) -> std::result::Result<(), ValidationError> {
    match schema {
        Schema::Any => Ok(()),
        Schema::Nullable(inner) => {
            if value.is_null() {
                Ok(())
            } else {
                validate_at(inner, value, path)
            }
        }
        Schema::String { min_len } => {
            let s = value.as_str().ok_or_else(|| mismatch(path, "string", value))?;
            if s.chars().count() < *min_len {
                return Err(ValidationError::new(
                    path,
                    ValidationErrorKind::TooShort { min: *min_len },
                ));
            }
            Ok(())
        }
        Schema::Number { min, max } => {
            let n = value.as_f64().ok_or_else(|| mismatch(path, "number", value))?;
            let lo = min.unwrap_or(f64::NEG_INFINITY);
            let hi = max.unwrap_or(f64::INFINITY);
            if n < lo || n > hi {
                return Err(ValidationError::new(
                    path,
                    ValidationErrorKind::OutOfRange {
                        value: n,
                        min: lo,
                        max: hi,
                    },
                ));
            }
            Ok(())
        }
        Schema::Integer => {
            if value.is_i64() || value.is_u64() {
                Ok(())
            } else {
                Err(mismatch(path, "integer", value))
            }
        }
        Schema::Boolean => {
            if value.is_boolean() {
                Ok(())
            } else {
                Err(mismatch(path, "boolean", value))
            }
        }
        Schema::Enum(allowed) => {
            let s = value.as_str().ok_or_else(|| mismatch(path, "string", value))?;
            if allowed.iter().any(|member| member == s) {
                Ok(())
            } else {
                Err(ValidationError::new(
                    path,
                    ValidationErrorKind::NotInEnum {
                        value: s.to_string(),
                        allowed: allowed.clone(),
                    },
                ))
            }
        }
        Schema::Array { items, nonempty } => {
            let elements = value
                .as_array()
                .ok_or_else(|| mismatch(path, "array", value))?;
            if *nonempty && elements.is_empty() {
                return Err(ValidationError::new(path, ValidationErrorKind::EmptyArray));
            }
            for (index, element) in elements.iter().enumerate() {
                validate_at(items, element, &join(path, &index.to_string()))?;
            }
            Ok(())
        }
        Schema::Object(fields) => {
            let map = value
                .as_object()
                .ok_or_else(|| mismatch(path, "object", value))?;
            for field in fields {
                let field_path = join(path, &field.name);
                match map.get(&field.name) {
                    Some(member) => validate_at(&field.schema, member, &field_path)?,
                    None if field.required => return Err(ValidationError::missing(field_path)),
                    None => {}
                }
            }
            Ok(())
        }
        Schema::Map(values) => {
            let map = value
                .as_object()
                .ok_or_else(|| mismatch(path, "object", value))?;
            for (key, member) in map {
                validate_at(values, member, &join(path, key))?;
            }
            Ok(())
        }
    }
}
