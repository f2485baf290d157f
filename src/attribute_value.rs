use std::collections::HashMap;

use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::{f64_to_i64_safe, format_number};

lazy_static! {
    static ref VERSION_NUMERIC_COMPONENTS_REGEX: Regex =
        Regex::new(r"^v?(\d+)(\.\d+)?(\.\d+)?").unwrap();
}

/// The attribute set a caller supplies for one evaluation, keyed by attribute name.
pub type Attributes = HashMap<String, AttributeValue>;

/// A caller-supplied attribute, mirroring the JSON value kinds.
///
/// Integers and floats share one numeric representation, so `1` and `1.0` are the same value.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Array(Vec<AttributeValue>),
    Number(f64),
    Bool(bool),
    Object(HashMap<String, AttributeValue>),
    Null,
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> AttributeValue {
        AttributeValue::String(s.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> AttributeValue {
        AttributeValue::String(s)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> AttributeValue {
        AttributeValue::Bool(b)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Number(i as f64)
    }
}

impl From<f64> for AttributeValue {
    fn from(f: f64) -> Self {
        AttributeValue::Number(f)
    }
}

impl<S, T> From<HashMap<S, T>> for AttributeValue
where
    String: From<S>,
    AttributeValue: From<T>,
{
    fn from(hashmap: HashMap<S, T>) -> AttributeValue {
        hashmap.into_iter().collect()
    }
}

impl<S, T> FromIterator<(S, T)> for AttributeValue
where
    String: From<S>,
    AttributeValue: From<T>,
{
    fn from_iter<I: IntoIterator<Item = (S, T)>>(iter: I) -> Self {
        AttributeValue::Object(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<&Value> for AttributeValue {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => AttributeValue::Null,
            Value::Bool(b) => AttributeValue::Bool(*b),
            Value::Number(n) => match n.as_f64() {
                Some(float) => AttributeValue::Number(float),
                None => {
                    warn!("could not interpret '{:?}' as f64", n);
                    AttributeValue::String(n.to_string())
                }
            },
            Value::String(str) => AttributeValue::String(str.clone()),
            Value::Array(arr) => {
                AttributeValue::Array(arr.iter().map(AttributeValue::from).collect())
            }
            Value::Object(obj) => {
                AttributeValue::Object(obj.iter().map(|(k, v)| (k.into(), v.into())).collect())
            }
        }
    }
}

impl AttributeValue {
    /// The string value, without conversion from other kinds.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as a float, also accepting strings that parse as a finite number.
    pub(crate) fn coerce_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(f) => Some(*f),
            AttributeValue::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            _ => None,
        }
    }

    /// Null is treated the same as an absent attribute by every operator.
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    /// The name used by the `$type` operator.
    pub fn type_name(&self) -> &'static str {
        match self {
            AttributeValue::String(_) => "string",
            AttributeValue::Array(_) => "array",
            AttributeValue::Number(_) => "number",
            AttributeValue::Bool(_) => "boolean",
            AttributeValue::Object(_) => "object",
            AttributeValue::Null => "null",
        }
    }

    /// Attempt to parse a string attribute into a semver version.
    ///
    /// Missing minor or patch components are filled in with zeroes and a leading `v` is ignored.
    /// It will return None if it cannot parse it, or for non-string attributes.
    pub fn as_semver(&self) -> Option<semver::Version> {
        let version_str = self.as_str()?.trim();
        semver::Version::parse(version_str)
            .ok()
            .or_else(|| AttributeValue::parse_semver_loose(version_str))
            .map(|mut version| {
                version.build = semver::BuildMetadata::EMPTY;
                version
            })
    }

    fn parse_semver_loose(version_str: &str) -> Option<semver::Version> {
        let parts = VERSION_NUMERIC_COMPONENTS_REGEX.captures(version_str)?;

        let numeric_parts = parts.get(0)?;
        let mut transformed_version_str = parts.get(1)?.as_str().to_string();

        for i in 2..parts.len() {
            match parts.get(i) {
                Some(component) => transformed_version_str.push_str(component.as_str()),
                None => transformed_version_str.push_str(".0"),
            }
        }

        let rest = &version_str[numeric_parts.end()..];
        transformed_version_str.push_str(rest);

        semver::Version::parse(&transformed_version_str).ok()
    }

    /// The string a unit is hashed by. Only non-empty strings and integral numbers identify a
    /// unit; anything else is treated as absent.
    #[allow(clippy::float_cmp)]
    pub(crate) fn as_bucketable(&self) -> Option<String> {
        match self {
            AttributeValue::String(s) if !s.is_empty() => Some(s.clone()),
            AttributeValue::Number(f) => {
                // We only support integer values as bucketable
                f64_to_i64_safe(*f).and_then(|i| {
                    if i as f64 == *f {
                        Some(i.to_string())
                    } else {
                        None
                    }
                })
            }
            _ => None,
        }
    }

    /// The string form compared against the values of a list saved group.
    pub(crate) fn as_group_member(&self) -> Option<String> {
        match self {
            AttributeValue::String(s) => Some(s.clone()),
            AttributeValue::Number(f) => Some(format_number(*f)),
            AttributeValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// Looks up an attribute by name, descending into nested objects for dotted paths such as
/// `company.plan`.
///
/// A top-level attribute whose name literally contains a dot takes precedence over the nested
/// interpretation.
pub fn lookup<'a>(attributes: &'a Attributes, path: &str) -> Option<&'a AttributeValue> {
    if let Some(value) = attributes.get(path) {
        return Some(value);
    }

    let mut components = path.split('.');
    let mut current = attributes.get(components.next()?)?;
    for component in components {
        current = match current {
            AttributeValue::Object(map) => map.get(component)?,
            _ => return None,
        };
    }
    Some(current)
}
