use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::attribute_value::Attributes;
use crate::condition::Condition;
use crate::error::EvaluationError;
use crate::hash::{HashVersion, Namespace};
use crate::prerequisite::Prerequisite;
use crate::saved_group::{self, SavedGroupTargeting};
use crate::schedule::{self, ScheduleRule};
use crate::store::Store;
use crate::util::default_true;

pub(crate) fn default_hash_attribute() -> String {
    "id".to_string()
}

fn default_coverage() -> f64 {
    1.0
}

/// A rule of a feature environment. Rules are tried in order and the first one that resolves
/// decides the value.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default, alias = "savedGroupTargeting")]
    pub saved_groups: Vec<SavedGroupTargeting>,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(default)]
    pub schedule_rules: Vec<ScheduleRule>,
    #[serde(flatten)]
    pub kind: RuleKind,
}

/// How a rule that passes its gates produces a value.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RuleKind {
    Force(ForceRule),
    Rollout(RolloutRule),
    Experiment(ExperimentRule),
    ExperimentRef(ExperimentRefRule),
    SafeRollout(SafeRolloutRule),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ForceRule {
    pub value: String,
}

/// Serves `value` to a `coverage` fraction of units and lets the rest fall through.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutRule {
    pub value: String,
    pub coverage: f64,
    #[serde(default = "default_hash_attribute")]
    pub hash_attribute: String,
    /// Defaults to the feature id.
    #[serde(default)]
    pub seed: Option<String>,
    #[serde(default)]
    pub hash_version: Option<HashVersion>,
}

/// An experiment defined inline on the rule.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentRule {
    /// Defaults to the feature id.
    #[serde(default)]
    pub tracking_key: Option<String>,
    #[serde(default = "default_hash_attribute")]
    pub hash_attribute: String,
    #[serde(default)]
    pub fallback_attribute: Option<String>,
    #[serde(default)]
    pub hash_version: Option<HashVersion>,
    /// Defaults to the tracking key.
    #[serde(default)]
    pub seed: Option<String>,
    #[serde(default = "default_coverage")]
    pub coverage: f64,
    #[serde(alias = "value")]
    pub values: Vec<ExperimentValue>,
    #[serde(default)]
    pub namespace: Option<Namespace>,
    #[serde(default)]
    pub bucket_version: u32,
    #[serde(default)]
    pub min_bucket_version: u32,
    #[serde(default)]
    pub disable_sticky_bucketing: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentValue {
    pub value: String,
    pub weight: f64,
    #[serde(default)]
    pub name: String,
}

/// A rule that delegates assignment to a stored [crate::Experiment].
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentRefRule {
    pub experiment_id: String,
    /// The feature value served for each of the experiment's variations.
    pub variations: Vec<VariationValue>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VariationValue {
    pub variation_id: String,
    pub value: String,
}

/// A two-arm rollout of `variation_value` against `control_value`, monitored externally.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SafeRolloutRule {
    pub safe_rollout_id: String,
    /// Defaults to the safe rollout id.
    #[serde(default)]
    pub tracking_key: Option<String>,
    pub control_value: String,
    pub variation_value: String,
    pub status: SafeRolloutStatus,
    #[serde(default = "default_hash_attribute")]
    pub hash_attribute: String,
    /// Defaults to the safe rollout id.
    #[serde(default)]
    pub seed: Option<String>,
    #[serde(default)]
    pub hash_version: Option<HashVersion>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SafeRolloutStatus {
    Running,
    Released,
    RolledBack,
    Stopped,
}

impl SafeRolloutRule {
    pub fn tracking_key(&self) -> &str {
        self.tracking_key.as_deref().unwrap_or(&self.safe_rollout_id)
    }

    pub fn seed(&self) -> &str {
        self.seed.as_deref().unwrap_or(&self.safe_rollout_id)
    }
}

impl ExperimentRule {
    pub fn tracking_key<'a>(&'a self, feature_id: &'a str) -> &'a str {
        self.tracking_key.as_deref().unwrap_or(feature_id)
    }

    pub fn seed<'a>(&'a self, feature_id: &'a str) -> &'a str {
        self.seed
            .as_deref()
            .unwrap_or_else(|| self.tracking_key(feature_id))
    }
}

impl Rule {
    /// Checks the rule's condition and saved group targeting.
    pub fn matches_targeting(
        &self,
        attributes: &Attributes,
        store: &dyn Store,
    ) -> Result<bool, EvaluationError> {
        if let Some(condition) = &self.condition {
            if !condition.evaluate(attributes, store)? {
                return Ok(false);
            }
        }
        saved_group::matches_all(&self.saved_groups, attributes, store)
    }

    /// Whether the rule's gates pass for every attribute set from `now` on.
    ///
    /// Some(false) means the rule can never fire again, Some(true) that its gates always pass, and
    /// None that the outcome depends on attributes, other features or a pending schedule change.
    pub fn static_gate(&self, now: DateTime<Utc>) -> Option<bool> {
        if !self.enabled {
            return Some(false);
        }

        let mut gates = vec![schedule::settled_state(&self.schedule_rules, now)];
        gates.push(
            self.condition
                .as_ref()
                .map(Condition::static_result)
                .unwrap_or(Some(true)),
        );
        gates.extend(self.saved_groups.iter().map(SavedGroupTargeting::static_result));
        if !self.prerequisites.is_empty() {
            gates.push(None);
        }

        if gates.contains(&Some(false)) {
            Some(false)
        } else if gates.contains(&None) {
            None
        } else {
            Some(true)
        }
    }
}
