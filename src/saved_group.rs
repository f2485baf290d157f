use std::collections::HashSet;

use serde::Deserialize;

use crate::attribute_value::{lookup, AttributeValue, Attributes};
use crate::condition::Condition;
use crate::error::EvaluationError;
use crate::store::Store;

/// A named, reusable audience.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedGroup {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub kind: SavedGroupKind,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SavedGroupKind {
    /// Membership is the result of evaluating a condition.
    Condition { condition: Condition },
    /// Membership is inclusion of one attribute's value in an explicit set.
    List {
        #[serde(rename = "attributeKey")]
        attribute_key: String,
        #[serde(default)]
        values: HashSet<String>,
    },
}

impl SavedGroup {
    /// Returns true if the attribute set is a member of this group.
    pub fn contains(
        &self,
        attributes: &Attributes,
        store: &dyn Store,
    ) -> Result<bool, EvaluationError> {
        match &self.kind {
            SavedGroupKind::Condition { condition } => condition.evaluate(attributes, store),
            SavedGroupKind::List {
                attribute_key,
                values,
            } => Ok(match lookup(attributes, attribute_key) {
                Some(AttributeValue::Array(elements)) => elements
                    .iter()
                    .filter_map(AttributeValue::as_group_member)
                    .any(|member| values.contains(&member)),
                Some(value) => value
                    .as_group_member()
                    .map(|member| values.contains(&member))
                    .unwrap_or(false),
                None => false,
            }),
        }
    }
}

/// Resolves membership of the group `group_id`.
///
/// An unknown group is a configuration error rather than "not a member", so that `none` targeting
/// cannot silently admit everyone when a group goes missing.
pub fn resolve(
    group_id: &str,
    attributes: &Attributes,
    store: &dyn Store,
) -> Result<bool, EvaluationError> {
    match store.saved_group(group_id)? {
        Some(group) => group.contains(attributes, store),
        None => Err(EvaluationError::configuration(format!(
            "unknown saved group '{}'",
            group_id
        ))),
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    /// Member of every listed group.
    All,
    /// Member of at least one listed group.
    Any,
    /// Member of none of the listed groups.
    None,
}

/// One saved group targeting clause of a rule.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SavedGroupTargeting {
    pub match_type: MatchType,
    #[serde(default)]
    pub saved_groups: Vec<String>,
}

impl SavedGroupTargeting {
    pub fn matches(
        &self,
        attributes: &Attributes,
        store: &dyn Store,
    ) -> Result<bool, EvaluationError> {
        match self.match_type {
            MatchType::All => {
                for id in &self.saved_groups {
                    if !resolve(id, attributes, store)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            MatchType::Any => {
                for id in &self.saved_groups {
                    if resolve(id, attributes, store)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            MatchType::None => {
                for id in &self.saved_groups {
                    if resolve(id, attributes, store)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    /// The outcome when it does not depend on attributes, i.e. when no groups are listed.
    pub fn static_result(&self) -> Option<bool> {
        if !self.saved_groups.is_empty() {
            return None;
        }
        Some(self.match_type != MatchType::Any)
    }
}

/// Every targeting clause of a rule must match.
pub fn matches_all(
    targeting: &[SavedGroupTargeting],
    attributes: &Attributes,
    store: &dyn Store,
) -> Result<bool, EvaluationError> {
    for clause in targeting {
        if !clause.matches(attributes, store)? {
            return Ok(false);
        }
    }
    Ok(true)
}
