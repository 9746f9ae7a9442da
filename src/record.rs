//! Flat field mappings for training rows and prediction requests.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::{IftError, Result};
use crate::schema::{FieldKind, FieldSpec};

/// A typed base-field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Non-negative integer.
    Integer(i64),
    /// Non-negative finite float.
    Float(f64),
    /// Trimmed categorical label.
    Text(String),
}

impl FieldValue {
    /// Numeric view used by the regressor; categorical values have none.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            Self::Text(_) => None,
        }
    }

    /// Categorical view; numeric values have none.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    fn into_json(self) -> Value {
        match self {
            Self::Integer(value) => Value::from(value),
            Self::Float(value) => Number::from_f64(value).map_or(Value::Null, Value::Number),
            Self::Text(value) => Value::String(value),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

/// Result of lenient field coercion during corpus cleaning.
#[derive(Debug, Clone, PartialEq)]
pub enum Coerced<T> {
    /// A usable value.
    Value(T),
    /// The field is absent or `null`.
    Null,
    /// The field is present but cannot be coerced to the declared type.
    Invalid,
}

/// A flat mapping of field names to JSON values.
///
/// Training rows and prediction requests share this representation; the
/// difference lies in how fields are read. Serving uses the strict accessors
/// ([`Record::field`], [`Record::sequence`]) that reject wrong primitive types,
/// while cleaning uses the coercing ones that parse numeric strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: Map<String, Value>,
}

impl Record {
    /// Creates an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a JSON object; any other JSON value is a schema mismatch.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(IftError::schema_mismatch(
                "<body>",
                format!("expected a JSON object, found {}", json_type(&other)),
            )),
        }
    }

    /// Parses a JSON object from text.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_json(value)
    }

    /// Sets `name` to `value`, returning the record for chaining.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Sets `name` to `value`.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Raw JSON value of `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Returns `true` when `name` is absent or `null`.
    #[must_use]
    pub fn is_null(&self, name: &str) -> bool {
        self.get(name).map_or(true, Value::is_null)
    }

    /// Borrows the underlying JSON object.
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Strictly reads a base field as its declared type.
    ///
    /// Absent or `null` fields and wrong primitive types yield
    /// [`IftError::SchemaMismatch`]. Categorical fields accept strings (trimmed)
    /// and numbers (stringified); integer fields accept integral numbers; float
    /// fields accept any number. Numbers must be finite and non-negative.
    pub fn field(&self, spec: &FieldSpec) -> Result<FieldValue> {
        let value = match self.get(&spec.name) {
            None | Some(Value::Null) => {
                return Err(IftError::schema_mismatch(&spec.name, "field is required"))
            }
            Some(value) => value,
        };
        let mismatch = |expected: &str| {
            IftError::schema_mismatch(
                &spec.name,
                format!("expected {expected}, found {}", json_type(value)),
            )
        };
        match spec.kind {
            FieldKind::Categorical => match value {
                Value::String(text) => Ok(FieldValue::Text(text.trim().to_string())),
                Value::Number(number) => Ok(FieldValue::Text(number_label(number))),
                _ => Err(mismatch("a string")),
            },
            FieldKind::Integer => match value {
                Value::Number(number) => integer_from_number(number)
                    .map(FieldValue::Integer)
                    .ok_or_else(|| mismatch("a non-negative integer")),
                _ => Err(mismatch("a non-negative integer")),
            },
            FieldKind::Float => match value {
                Value::Number(number) => float_from_number(number)
                    .map(FieldValue::Float)
                    .ok_or_else(|| mismatch("a non-negative number")),
                _ => Err(mismatch("a non-negative number")),
            },
        }
    }

    /// Strictly reads the crop sequence stored under `name`.
    ///
    /// The field must be present; `null` is accepted and treated as an empty
    /// sequence by the tokenizer.
    pub fn sequence(&self, name: &str) -> Result<Option<&str>> {
        match self.get(name) {
            None => Err(IftError::schema_mismatch(name, "field is required")),
            Some(Value::Null) => Ok(None),
            Some(Value::String(text)) => Ok(Some(text.as_str())),
            Some(other) => Err(IftError::schema_mismatch(
                name,
                format!("expected a string, found {}", json_type(other)),
            )),
        }
    }

    /// Leniently reads a base field, parsing numeric strings.
    #[must_use]
    pub fn coerce_field(&self, spec: &FieldSpec) -> Coerced<FieldValue> {
        let value = match self.get(&spec.name) {
            None | Some(Value::Null) => return Coerced::Null,
            Some(value) => value,
        };
        let coerced = match (spec.kind, value) {
            (FieldKind::Categorical, Value::String(text)) => {
                Some(FieldValue::Text(text.trim().to_string()))
            }
            (FieldKind::Categorical, Value::Number(number)) => {
                Some(FieldValue::Text(number_label(number)))
            }
            (FieldKind::Integer, Value::Number(number)) => {
                integer_from_number(number).map(FieldValue::Integer)
            }
            (FieldKind::Integer, Value::String(text)) => {
                parse_non_negative(text).and_then(integral).map(FieldValue::Integer)
            }
            (FieldKind::Float, Value::Number(number)) => {
                float_from_number(number).map(FieldValue::Float)
            }
            (FieldKind::Float, Value::String(text)) => {
                parse_non_negative(text).map(FieldValue::Float)
            }
            _ => None,
        };
        coerced.map_or(Coerced::Invalid, Coerced::Value)
    }

    /// Leniently reads a non-negative finite float, as used for the target.
    #[must_use]
    pub fn coerce_target(&self, name: &str) -> Coerced<f64> {
        let parsed = match self.get(name) {
            None | Some(Value::Null) => return Coerced::Null,
            Some(Value::Number(number)) => float_from_number(number),
            Some(Value::String(text)) if text.trim().is_empty() => return Coerced::Null,
            Some(Value::String(text)) => parse_non_negative(text),
            Some(_) => None,
        };
        parsed.map_or(Coerced::Invalid, Coerced::Value)
    }

    /// Leniently reads a crop sequence: strings are trimmed, anything but a string is invalid.
    #[must_use]
    pub fn coerce_sequence(&self, name: &str) -> Coerced<String> {
        match self.get(name) {
            None | Some(Value::Null) => Coerced::Null,
            Some(Value::String(text)) => Coerced::Value(text.trim().to_string()),
            Some(_) => Coerced::Invalid,
        }
    }

    /// Stores a typed value back into the record.
    pub fn set_field(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value.into_json());
    }
}

impl From<Map<String, Value>> for Record {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn number_label(number: &Number) -> String {
    if let Some(value) = number.as_i64() {
        return value.to_string();
    }
    if let Some(value) = number.as_u64() {
        return value.to_string();
    }
    match number.as_f64() {
        Some(value) if value.fract() == 0.0 && value.abs() < 1e15 => format!("{}", value as i64),
        Some(value) => value.to_string(),
        None => number.to_string(),
    }
}

fn integer_from_number(number: &Number) -> Option<i64> {
    if let Some(value) = number.as_i64() {
        return (value >= 0).then_some(value);
    }
    if let Some(value) = number.as_u64() {
        return i64::try_from(value).ok();
    }
    number.as_f64().and_then(|value| {
        (value.is_finite() && value >= 0.0).then_some(value).and_then(integral)
    })
}

fn float_from_number(number: &Number) -> Option<f64> {
    number
        .as_f64()
        .filter(|value| value.is_finite() && *value >= 0.0)
}

fn parse_non_negative(text: &str) -> Option<f64> {
    text.trim()
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite() && *value >= 0.0)
}

fn integral(value: f64) -> Option<i64> {
    (value.fract() == 0.0 && value <= i64::MAX as f64).then(|| value as i64)
}
