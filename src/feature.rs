use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::feature_value::ValueType;
use crate::prerequisite::Prerequisite;
use crate::rule::Rule;

/// A feature and its per-environment targeting, as published.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub id: String,
    #[serde(default)]
    pub value_type: ValueType,
    pub default_value: String,
    #[serde(default, alias = "environmentSettings")]
    pub environments: HashMap<String, FeatureEnvironment>,
    /// Prerequisites that gate the feature in every environment.
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(default)]
    pub never_stale: bool,
    #[serde(default)]
    pub date_updated: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureEnvironment {
    pub enabled: bool,
    /// Overrides the feature's default value in this environment.
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Unpublished changes. Never evaluated.
    #[serde(default)]
    pub draft: Option<Draft>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub date_updated: Option<DateTime<Utc>>,
}

impl Feature {
    pub fn environment(&self, environment_id: &str) -> Option<&FeatureEnvironment> {
        self.environments.get(environment_id)
    }

    /// The default value served in `environment`.
    pub fn default_value_in<'a>(&'a self, environment: &'a FeatureEnvironment) -> &'a str {
        environment
            .default_value
            .as_deref()
            .unwrap_or(&self.default_value)
    }

    /// Ids of every feature this one depends on, at feature level or in any environment's rules.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        let rule_prerequisites = self
            .environments
            .values()
            .flat_map(|environment| environment.rules.iter())
            .flat_map(|rule| rule.prerequisites.iter());
        self.prerequisites
            .iter()
            .chain(rule_prerequisites)
            .map(|prerequisite| prerequisite.feature_id.as_str())
    }
}
