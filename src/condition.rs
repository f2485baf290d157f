use std::cmp::Ordering;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::attribute_value::{lookup, AttributeValue, Attributes};
use crate::error::EvaluationError;
use crate::saved_group::SavedGroupKind;
use crate::store::Store;
use crate::util::format_number;

/// A targeting condition, parsed from its JSON representation.
///
/// The JSON form is a Mongo-style query document: keys are attribute paths (dotted for nested
/// objects) or one of the combinators `$and`, `$or`, `$nor` and `$not`; values are either
/// literals compared for equality or operator objects such as `{"$gte": 18}`.
///
/// Parsing never fails. A document that cannot be understood becomes [Condition::Invalid], which
/// never matches and reports a configuration error when evaluated.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Nor(Vec<Condition>),
    Not(Box<Condition>),
    Field { path: String, test: ValueTest },
    Invalid(String),
}

/// A test applied to the value found at an attribute path.
#[derive(Clone, Debug, PartialEq)]
pub enum ValueTest {
    /// Equality against a literal. Scalars compare with light coercion, arrays and objects
    /// compare structurally.
    Literal(AttributeValue),
    /// Every operator must pass.
    Operators(Vec<Operator>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Operator {
    Compare(Comparison, AttributeValue),
    Version(Comparison, semver::Version),
    In(Vec<AttributeValue>),
    NotIn(Vec<AttributeValue>),
    All(Vec<ValueTest>),
    ElemMatch(ElemMatch),
    Size(Box<ValueTest>),
    Exists(bool),
    Type(String),
    Regex(Pattern),
    InGroup(String),
    NotInGroup(String),
    Not(Box<ValueTest>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ElemMatch {
    /// Array elements are tested as plain values.
    Value(Box<ValueTest>),
    /// Array elements are objects tested as attribute maps.
    Condition(Box<Condition>),
}

/// A regular expression compiled when the condition is parsed.
#[derive(Clone, Debug)]
pub struct Pattern(Regex);

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

const VALUE_TYPES: &[&str] = &[
    "string",
    "number",
    "boolean",
    "array",
    "object",
    "null",
    "undefined",
];

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(Condition::parse(&value))
    }
}

impl From<Value> for Condition {
    fn from(value: Value) -> Self {
        Condition::parse(&value)
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Comparison::Eq => "eq",
            Comparison::Ne => "ne",
            Comparison::Lt => "lt",
            Comparison::Lte => "lte",
            Comparison::Gt => "gt",
            Comparison::Gte => "gte",
        };
        f.write_str(name)
    }
}

impl Comparison {
    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            Comparison::Eq => ordering == Ordering::Equal,
            Comparison::Ne => ordering != Ordering::Equal,
            Comparison::Lt => ordering == Ordering::Less,
            Comparison::Lte => ordering != Ordering::Greater,
            Comparison::Gt => ordering == Ordering::Greater,
            Comparison::Gte => ordering != Ordering::Less,
        }
    }
}

impl Condition {
    /// Parses a JSON condition document. Any malformed part makes the whole condition invalid.
    pub fn parse(value: &Value) -> Condition {
        parse_condition(value).unwrap_or_else(Condition::Invalid)
    }

    /// A condition that matches every attribute set.
    pub fn always() -> Condition {
        Condition::And(vec![])
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Condition::Invalid(_))
    }

    /// Evaluates the condition against an attribute map.
    ///
    /// Missing attributes never cause an error; they take each operator's defined "absent"
    /// result. Errors are reserved for malformed conditions and unresolvable saved groups.
    pub fn evaluate(
        &self,
        attributes: &Attributes,
        store: &dyn Store,
    ) -> Result<bool, EvaluationError> {
        match self {
            Condition::And(conditions) => {
                for condition in conditions {
                    if !condition.evaluate(attributes, store)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Or(conditions) => eval_or(conditions, attributes, store),
            Condition::Nor(conditions) => Ok(!eval_or(conditions, attributes, store)?),
            Condition::Not(condition) => Ok(!condition.evaluate(attributes, store)?),
            Condition::Field { path, test } => test.evaluate(lookup(attributes, path), store),
            Condition::Invalid(reason) => Err(EvaluationError::configuration(format!(
                "invalid condition: {}",
                reason
            ))),
        }
    }

    /// Determines the outcome without any attributes, if the condition does not depend on them.
    ///
    /// Returns None whenever an attribute is consulted. Invalid conditions never match, so they are
    /// statically false.
    pub fn static_result(&self) -> Option<bool> {
        match self {
            Condition::And(conditions) => {
                let mut all_true = true;
                for condition in conditions {
                    match condition.static_result() {
                        Some(false) => return Some(false),
                        Some(true) => {}
                        None => all_true = false,
                    }
                }
                all_true.then_some(true)
            }
            Condition::Or(conditions) => static_or(conditions),
            Condition::Nor(conditions) => static_or(conditions).map(|b| !b),
            Condition::Not(condition) => condition.static_result().map(|b| !b),
            Condition::Field { .. } => None,
            Condition::Invalid(_) => Some(false),
        }
    }
}

// An empty $or matches, mirroring how an empty condition document matches.
fn eval_or(
    conditions: &[Condition],
    attributes: &Attributes,
    store: &dyn Store,
) -> Result<bool, EvaluationError> {
    if conditions.is_empty() {
        return Ok(true);
    }
    for condition in conditions {
        if condition.evaluate(attributes, store)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn static_or(conditions: &[Condition]) -> Option<bool> {
    if conditions.is_empty() {
        return Some(true);
    }
    let mut all_false = true;
    for condition in conditions {
        match condition.static_result() {
            Some(true) => return Some(true),
            Some(false) => {}
            None => all_false = false,
        }
    }
    all_false.then_some(false)
}

impl ValueTest {
    fn evaluate(
        &self,
        actual: Option<&AttributeValue>,
        store: &dyn Store,
    ) -> Result<bool, EvaluationError> {
        match self {
            ValueTest::Literal(expected) => {
                Ok(literal_matches(expected, actual.filter(|v| !v.is_null())))
            }
            ValueTest::Operators(operators) => {
                for operator in operators {
                    if !operator.evaluate(actual, store)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }
}

impl Operator {
    fn evaluate(
        &self,
        actual: Option<&AttributeValue>,
        store: &dyn Store,
    ) -> Result<bool, EvaluationError> {
        // null and absent are indistinguishable to every operator except $type
        let raw = actual;
        let actual = actual.filter(|v| !v.is_null());
        let result = match self {
            Operator::Compare(Comparison::Eq, expected) => actual == Some(expected),
            Operator::Compare(Comparison::Ne, expected) => actual != Some(expected),
            Operator::Compare(comparison, expected) => actual
                .and_then(|actual| compare(actual, expected))
                .map(|ordering| comparison.holds(ordering))
                .unwrap_or(false),
            Operator::Version(comparison, expected) => {
                match actual.and_then(AttributeValue::as_semver) {
                    Some(version) => comparison.holds(version.cmp(expected)),
                    None => *comparison == Comparison::Ne,
                }
            }
            Operator::In(expected) => is_in(actual, expected),
            Operator::NotIn(expected) => !is_in(actual, expected),
            Operator::All(tests) => match actual {
                Some(AttributeValue::Array(elements)) => {
                    for test in tests {
                        if !any_element(elements, |el| test.evaluate(Some(el), store))? {
                            return Ok(false);
                        }
                    }
                    true
                }
                _ => false,
            },
            Operator::ElemMatch(elem_match) => match actual {
                Some(AttributeValue::Array(elements)) => {
                    any_element(elements, |el| elem_match.evaluate(el, store))?
                }
                _ => false,
            },
            Operator::Size(test) => match actual {
                Some(AttributeValue::Array(elements)) => {
                    let size = AttributeValue::Number(elements.len() as f64);
                    test.evaluate(Some(&size), store)?
                }
                _ => false,
            },
            Operator::Exists(expected) => actual.is_some() == *expected,
            Operator::Type(expected) => {
                raw.map(AttributeValue::type_name).unwrap_or("undefined") == expected
            }
            Operator::Regex(Pattern(regex)) => actual
                .and_then(AttributeValue::as_str)
                .map(|s| regex.is_match(s))
                .unwrap_or(false),
            Operator::InGroup(group_id) => in_list_group(group_id, actual, store)?,
            Operator::NotInGroup(group_id) => !in_list_group(group_id, actual, store)?,
            Operator::Not(test) => !test.evaluate(raw, store)?,
        };
        Ok(result)
    }
}

impl ElemMatch {
    fn evaluate(
        &self,
        element: &AttributeValue,
        store: &dyn Store,
    ) -> Result<bool, EvaluationError> {
        match self {
            ElemMatch::Value(test) => test.evaluate(Some(element), store),
            ElemMatch::Condition(condition) => match element {
                AttributeValue::Object(attributes) => condition.evaluate(attributes, store),
                _ => Ok(false),
            },
        }
    }
}

fn any_element<F>(elements: &[AttributeValue], mut f: F) -> Result<bool, EvaluationError>
where
    F: FnMut(&AttributeValue) -> Result<bool, EvaluationError>,
{
    for element in elements {
        if f(element)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn literal_matches(expected: &AttributeValue, actual: Option<&AttributeValue>) -> bool {
    let actual = match actual {
        Some(actual) => actual,
        None => return expected.is_null(),
    };
    match expected {
        AttributeValue::String(expected) => match actual {
            AttributeValue::String(s) => s == expected,
            AttributeValue::Number(f) => &format_number(*f) == expected,
            AttributeValue::Bool(b) => &b.to_string() == expected,
            _ => false,
        },
        #[allow(clippy::float_cmp)]
        AttributeValue::Number(expected) => actual.coerce_f64() == Some(*expected),
        AttributeValue::Bool(expected) => is_truthy(actual) == *expected,
        AttributeValue::Null => false,
        AttributeValue::Array(_) | AttributeValue::Object(_) => actual == expected,
    }
}

fn is_truthy(value: &AttributeValue) -> bool {
    match value {
        AttributeValue::Bool(b) => *b,
        AttributeValue::String(s) => !s.is_empty(),
        AttributeValue::Number(f) => *f != 0.0 && !f.is_nan(),
        AttributeValue::Array(_) | AttributeValue::Object(_) => true,
        AttributeValue::Null => false,
    }
}

fn compare(actual: &AttributeValue, expected: &AttributeValue) -> Option<Ordering> {
    match (actual, expected) {
        (AttributeValue::String(a), AttributeValue::String(b)) => Some(a.cmp(b)),
        (_, AttributeValue::Number(b)) => actual.coerce_f64()?.partial_cmp(b),
        (AttributeValue::Number(a), AttributeValue::String(_)) => {
            a.partial_cmp(&expected.coerce_f64()?)
        }
        (AttributeValue::Bool(a), AttributeValue::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

// An array attribute is "in" the expected list if any of its elements is.
fn is_in(actual: Option<&AttributeValue>, expected: &[AttributeValue]) -> bool {
    match actual {
        Some(AttributeValue::Array(elements)) => elements.iter().any(|el| expected.contains(el)),
        Some(actual) => expected.contains(actual),
        None => false,
    }
}

fn in_list_group(
    group_id: &str,
    actual: Option<&AttributeValue>,
    store: &dyn Store,
) -> Result<bool, EvaluationError> {
    let group = store.saved_group(group_id)?.ok_or_else(|| {
        EvaluationError::configuration(format!("unknown saved group '{}'", group_id))
    })?;
    match &group.kind {
        SavedGroupKind::List { values, .. } => Ok(match actual {
            Some(AttributeValue::Array(elements)) => elements
                .iter()
                .filter_map(AttributeValue::as_group_member)
                .any(|member| values.contains(&member)),
            Some(actual) => actual
                .as_group_member()
                .map(|member| values.contains(&member))
                .unwrap_or(false),
            None => false,
        }),
        SavedGroupKind::Condition { .. } => Err(EvaluationError::configuration(format!(
            "saved group '{}' is not a list group",
            group_id
        ))),
    }
}

fn parse_condition(value: &Value) -> Result<Condition, String> {
    let object = value
        .as_object()
        .ok_or_else(|| format!("expected an object, found {}", value))?;

    let mut conditions = Vec::with_capacity(object.len());
    for (key, value) in object {
        let condition = match key.as_str() {
            "$and" => Condition::And(parse_condition_list(key, value)?),
            "$or" => Condition::Or(parse_condition_list(key, value)?),
            "$nor" => Condition::Nor(parse_condition_list(key, value)?),
            "$not" => Condition::Not(Box::new(parse_condition(value)?)),
            op if op.starts_with('$') => return Err(format!("unknown operator '{}'", op)),
            path => Condition::Field {
                path: path.to_string(),
                test: parse_value_test(value)?,
            },
        };
        conditions.push(condition);
    }

    if conditions.len() == 1 {
        Ok(conditions.remove(0))
    } else {
        Ok(Condition::And(conditions))
    }
}

fn parse_condition_list(key: &str, value: &Value) -> Result<Vec<Condition>, String> {
    value
        .as_array()
        .ok_or_else(|| format!("'{}' expects an array", key))?
        .iter()
        .map(parse_condition)
        .collect()
}

fn is_operator_object(object: &Map<String, Value>) -> bool {
    !object.is_empty() && object.keys().all(|k| k.starts_with('$'))
}

fn parse_value_test(value: &Value) -> Result<ValueTest, String> {
    match value {
        Value::Object(object) if is_operator_object(object) => object
            .iter()
            .map(|(name, arg)| parse_operator(name, arg))
            .collect::<Result<Vec<_>, _>>()
            .map(ValueTest::Operators),
        other => Ok(ValueTest::Literal(AttributeValue::from(other))),
    }
}

fn parse_operator(name: &str, arg: &Value) -> Result<Operator, String> {
    let operator = match name {
        "$eq" => Operator::Compare(Comparison::Eq, arg.into()),
        "$ne" => Operator::Compare(Comparison::Ne, arg.into()),
        "$lt" => Operator::Compare(Comparison::Lt, arg.into()),
        "$lte" => Operator::Compare(Comparison::Lte, arg.into()),
        "$gt" => Operator::Compare(Comparison::Gt, arg.into()),
        "$gte" => Operator::Compare(Comparison::Gte, arg.into()),
        "$veq" => Operator::Version(Comparison::Eq, parse_version(name, arg)?),
        "$vne" => Operator::Version(Comparison::Ne, parse_version(name, arg)?),
        "$vlt" => Operator::Version(Comparison::Lt, parse_version(name, arg)?),
        "$vlte" => Operator::Version(Comparison::Lte, parse_version(name, arg)?),
        "$vgt" => Operator::Version(Comparison::Gt, parse_version(name, arg)?),
        "$vgte" => Operator::Version(Comparison::Gte, parse_version(name, arg)?),
        "$in" => Operator::In(parse_values(name, arg)?),
        "$nin" => Operator::NotIn(parse_values(name, arg)?),
        "$all" => Operator::All(
            expect_array(name, arg)?
                .iter()
                .map(parse_value_test)
                .collect::<Result<_, _>>()?,
        ),
        "$elemMatch" => match arg {
            Value::Object(object) if is_operator_object(object) => {
                Operator::ElemMatch(ElemMatch::Value(Box::new(parse_value_test(arg)?)))
            }
            Value::Object(_) => {
                Operator::ElemMatch(ElemMatch::Condition(Box::new(parse_condition(arg)?)))
            }
            _ => return Err(format!("'{}' expects an object", name)),
        },
        "$size" => Operator::Size(Box::new(parse_value_test(arg)?)),
        "$exists" => Operator::Exists(
            arg.as_bool()
                .ok_or_else(|| format!("'{}' expects a boolean", name))?,
        ),
        "$type" => match arg.as_str() {
            Some(t) if VALUE_TYPES.contains(&t) => Operator::Type(t.to_string()),
            _ => return Err(format!("'{}' expects a type name, found {}", name, arg)),
        },
        "$regex" => {
            let pattern = arg
                .as_str()
                .ok_or_else(|| format!("'{}' expects a string", name))?;
            let regex = Regex::new(pattern)
                .map_err(|e| format!("invalid regex '{}': {}", pattern, e))?;
            Operator::Regex(Pattern(regex))
        }
        "$inGroup" => Operator::InGroup(expect_str(name, arg)?.to_string()),
        "$notInGroup" => Operator::NotInGroup(expect_str(name, arg)?.to_string()),
        "$not" => Operator::Not(Box::new(parse_value_test(arg)?)),
        other => return Err(format!("unknown operator '{}'", other)),
    };
    Ok(operator)
}

fn expect_array<'a>(name: &str, arg: &'a Value) -> Result<&'a Vec<Value>, String> {
    arg.as_array()
        .ok_or_else(|| format!("'{}' expects an array", name))
}

fn expect_str<'a>(name: &str, arg: &'a Value) -> Result<&'a str, String> {
    arg.as_str()
        .ok_or_else(|| format!("'{}' expects a string", name))
}

fn parse_values(name: &str, arg: &Value) -> Result<Vec<AttributeValue>, String> {
    Ok(expect_array(name, arg)?
        .iter()
        .map(AttributeValue::from)
        .collect())
}

fn parse_version(name: &str, arg: &Value) -> Result<semver::Version, String> {
    let raw = expect_str(name, arg)?;
    AttributeValue::from(raw)
        .as_semver()
        .ok_or_else(|| format!("'{}' is not a version", raw))
}
