use log::warn;
use serde::{Deserialize, Serialize};

use crate::attribute_value::AttributeValue;
use crate::error::EvaluationError;
use crate::util::{f64_to_i64_safe, format_number};

/// The declared type of a feature's values.
///
/// Values travel as strings on the wire regardless of type: booleans as `"true"`/`"false"`,
/// numbers as numeric strings and JSON values as encoded JSON. Every SDK relies on this
/// convention, so the encoding here must not drift.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[default]
    Boolean,
    String,
    Number,
    Json,
}

/// A delivered feature value, decoded according to its [ValueType].
#[derive(Clone, Debug, PartialEq)]
pub enum FeatureValue {
    Bool(bool),
    Str(String),
    Number(f64),
    Json(serde_json::Value),
}

impl From<bool> for FeatureValue {
    fn from(b: bool) -> FeatureValue {
        FeatureValue::Bool(b)
    }
}

impl From<String> for FeatureValue {
    fn from(s: String) -> FeatureValue {
        FeatureValue::Str(s)
    }
}

impl From<&str> for FeatureValue {
    fn from(s: &str) -> FeatureValue {
        FeatureValue::Str(s.to_string())
    }
}

impl From<f64> for FeatureValue {
    fn from(f: f64) -> FeatureValue {
        FeatureValue::Number(f)
    }
}

impl From<serde_json::Value> for FeatureValue {
    fn from(v: serde_json::Value) -> Self {
        FeatureValue::Json(v)
    }
}

impl ValueType {
    /// Decodes a wire string into a typed value, failing if it is not a valid encoding for
    /// this type.
    pub fn decode(&self, raw: &str) -> Result<FeatureValue, EvaluationError> {
        match self {
            ValueType::Boolean => match raw {
                "true" => Ok(FeatureValue::Bool(true)),
                "false" => Ok(FeatureValue::Bool(false)),
                _ => Err(EvaluationError::configuration(format!(
                    "'{}' is not a boolean value",
                    raw
                ))),
            },
            ValueType::String => Ok(FeatureValue::Str(raw.to_string())),
            ValueType::Number => raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(FeatureValue::Number)
                .ok_or_else(|| {
                    EvaluationError::configuration(format!("'{}' is not a numeric value", raw))
                }),
            ValueType::Json => serde_json::from_str(raw).map(FeatureValue::Json).map_err(|e| {
                EvaluationError::configuration(format!("'{}' is not valid JSON: {}", raw, e))
            }),
        }
    }

    /// Checks that a configured value is a valid wire encoding for this type.
    pub(crate) fn validate<'a>(&self, raw: &'a str) -> Result<&'a str, EvaluationError> {
        self.decode(raw).map(|_| raw)
    }

    /// Encodes a typed value into its wire representation.
    ///
    /// Returns None if the value does not belong to this type.
    pub fn encode(&self, value: &FeatureValue) -> Option<String> {
        match (self, value) {
            (ValueType::Boolean, FeatureValue::Bool(b)) => Some(b.to_string()),
            (ValueType::String, FeatureValue::Str(s)) => Some(s.clone()),
            (ValueType::Number, FeatureValue::Number(f)) if f.is_finite() => {
                Some(format_number(*f))
            }
            (ValueType::Json, value) => Some(value.as_json().to_string()),
            (value_type, value) => {
                warn!("cannot encode {:?} as {:?}", value, value_type);
                None
            }
        }
    }
}

impl FeatureValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FeatureValue::Bool(b) => Some(*b),
            _ => {
                warn!("feature value type is not bool but {:?}", self);
                None
            }
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FeatureValue::Str(s) => Some(s),
            _ => {
                warn!("feature value type is not str but {:?}", self);
                None
            }
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Number(f) => Some(*f),
            _ => {
                warn!("feature value type is not number but {:?}", self);
                None
            }
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FeatureValue::Number(f) => f64_to_i64_safe(*f),
            _ => None,
        }
    }

    pub fn as_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            FeatureValue::Bool(b) => Value::from(*b),
            FeatureValue::Str(s) => Value::from(s.as_str()),
            FeatureValue::Number(f) => Value::from(*f),
            FeatureValue::Json(v) => v.clone(),
        }
    }

    /// The value as seen by conditions that reference it, e.g. a prerequisite's `value` field.
    pub(crate) fn to_attribute(&self) -> AttributeValue {
        match self {
            FeatureValue::Bool(b) => AttributeValue::Bool(*b),
            FeatureValue::Str(s) => AttributeValue::String(s.clone()),
            FeatureValue::Number(f) => AttributeValue::Number(*f),
            FeatureValue::Json(v) => AttributeValue::from(v),
        }
    }
}
