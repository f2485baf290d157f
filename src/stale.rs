use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use log::debug;
use serde::Serialize;

use crate::condition::Condition;
use crate::config::EngineConfig;
use crate::experiment::ExperimentStatus;
use crate::feature::{Draft, Feature, FeatureEnvironment};
use crate::feature_value::FeatureValue;
use crate::rule::{Rule, RuleKind, SafeRolloutStatus};
use crate::saved_group::SavedGroupTargeting;
use crate::store::Store;

/// Why a feature is, or is not, considered stale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StaleReason {
    NeverStale,
    RecentlyUpdated,
    ActiveDraft,
    HasDependents,
    NoRules,
    RulesOneSided,
    AbandonedDraft,
    ToggledOff,
}

impl StaleReason {
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            StaleReason::NoRules
                | StaleReason::RulesOneSided
                | StaleReason::AbandonedDraft
                | StaleReason::ToggledOff
        )
    }
}

#[serde_with::skip_serializing_none]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentStaleness {
    pub is_stale: bool,
    pub reason: Option<StaleReason>,
}

impl From<Option<StaleReason>> for EnvironmentStaleness {
    fn from(reason: Option<StaleReason>) -> Self {
        EnvironmentStaleness {
            is_stale: reason.map(|r| r.is_stale()).unwrap_or(false),
            reason,
        }
    }
}

/// The staleness of a feature in one environment, with a breakdown over all of its environments.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Staleness {
    pub is_stale: bool,
    pub reason: Option<StaleReason>,
    pub environments: BTreeMap<String, EnvironmentStaleness>,
}

/// Classifies a feature's configuration without looking at any attributes.
///
/// Feature-wide reasons (`never-stale`, `recently-updated`, `has-dependents`) apply to every
/// environment. Otherwise each environment is classified on its own.
pub fn analyze(
    store: &dyn Store,
    feature: &Feature,
    environment_id: &str,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Staleness {
    let feature_reason = feature_reason(store, feature, config, now);

    let environments: BTreeMap<String, EnvironmentStaleness> = feature
        .environments
        .iter()
        .map(|(id, environment)| {
            let reason = feature_reason
                .or_else(|| environment_reason(store, feature, environment, config, now));
            (id.clone(), reason.into())
        })
        .collect();

    let requested = environments
        .get(environment_id)
        .copied()
        .unwrap_or_else(|| feature_reason.into());

    Staleness {
        is_stale: requested.is_stale,
        reason: requested.reason,
        environments,
    }
}

fn feature_reason(
    store: &dyn Store,
    feature: &Feature,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Option<StaleReason> {
    if feature.never_stale {
        return Some(StaleReason::NeverStale);
    }

    let horizon = Duration::days(i64::from(config.stale_after_days));
    if feature
        .date_updated
        .map(|updated| now - updated < horizon)
        .unwrap_or(false)
    {
        return Some(StaleReason::RecentlyUpdated);
    }

    let has_dependents = store.features().any(|other| {
        other.id != feature.id && other.dependencies().any(|id| id == feature.id)
    });
    if has_dependents {
        return Some(StaleReason::HasDependents);
    }

    None
}

fn environment_reason(
    store: &dyn Store,
    feature: &Feature,
    environment: &FeatureEnvironment,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Option<StaleReason> {
    if !environment.enabled {
        return Some(StaleReason::ToggledOff);
    }

    let abandoned = |draft: &Draft| {
        let horizon = Duration::days(i64::from(config.abandoned_draft_after_days));
        draft
            .date_updated
            .map(|updated| now - updated >= horizon)
            .unwrap_or(false)
    };
    if let Some(draft) = &environment.draft {
        if !abandoned(draft) {
            return Some(StaleReason::ActiveDraft);
        }
    }

    if environment.rules.iter().all(|rule| !rule.enabled) {
        return Some(StaleReason::NoRules);
    }

    if rules_one_sided(store, feature, environment, now) {
        return Some(StaleReason::RulesOneSided);
    }

    if environment.draft.is_some() {
        return Some(StaleReason::AbandonedDraft);
    }

    None
}

/// The values a rule can serve, and whether it serves one of them to every unit that passes its
/// gates. None if the rule can never serve anything.
struct RuleOutcome<'a> {
    values: Vec<&'a str>,
    always_resolves: bool,
}

fn rule_outcome<'a>(store: &'a dyn Store, feature: &Feature, rule: &'a Rule) -> Option<RuleOutcome<'a>> {
    let (values, always_resolves) = match &rule.kind {
        RuleKind::Force(force) => (vec![force.value.as_str()], true),
        RuleKind::Rollout(rollout) => {
            if rollout.coverage <= 0.0 {
                return None;
            }
            (vec![rollout.value.as_str()], false)
        }
        RuleKind::Experiment(experiment) => {
            if experiment.coverage <= 0.0 {
                return None;
            }
            let values = experiment.values.iter().map(|v| v.value.as_str()).collect();
            (values, false)
        }
        RuleKind::ExperimentRef(reference) => {
            let experiment = store.experiment(&reference.experiment_id)?;
            let value_of = |id: &str| {
                reference
                    .variations
                    .iter()
                    .find(|v| v.variation_id == id)
                    .map(|v| v.value.as_str())
            };
            match experiment.status {
                _ if experiment.archived => return None,
                ExperimentStatus::Draft => return None,
                ExperimentStatus::Stopped => {
                    let released = experiment.released_variation_id.as_deref()?;
                    (vec![value_of(released)?], true)
                }
                ExperimentStatus::Running => {
                    let values = experiment
                        .variations
                        .iter()
                        .filter_map(|v| value_of(&v.id))
                        .collect();
                    (values, false)
                }
            }
        }
        RuleKind::SafeRollout(safe_rollout) => match safe_rollout.status {
            SafeRolloutStatus::Running => (
                vec![
                    safe_rollout.control_value.as_str(),
                    safe_rollout.variation_value.as_str(),
                ],
                false,
            ),
            SafeRolloutStatus::Released => (vec![safe_rollout.variation_value.as_str()], true),
            SafeRolloutStatus::RolledBack | SafeRolloutStatus::Stopped => {
                (vec![safe_rollout.control_value.as_str()], true)
            }
        },
    };

    // values of the wrong type are skipped during evaluation
    let values: Vec<&str> = values
        .into_iter()
        .filter(|value| feature.value_type.validate(value).is_ok())
        .collect();
    if values.is_empty() {
        return None;
    }
    Some(RuleOutcome {
        values,
        always_resolves,
    })
}

/// An environment is one-sided when every enabled rule's gates always pass, or when the rules can
/// only ever serve a single value.
fn rules_one_sided(
    store: &dyn Store,
    feature: &Feature,
    environment: &FeatureEnvironment,
    now: DateTime<Utc>,
) -> bool {
    let mut enabled = environment.rules.iter().filter(|rule| rule.enabled).peekable();
    let unconditional = enabled.peek().is_some()
        && enabled.all(|rule| rule_gate(store, rule, now) == Some(true));
    unconditional || single_value(store, feature, environment, now)
}

/// A rule's static gate, narrowed by the live phase of a running experiment it references.
fn rule_gate(store: &dyn Store, rule: &Rule, now: DateTime<Utc>) -> Option<bool> {
    let gate = rule.static_gate(now);
    let phase = match &rule.kind {
        RuleKind::ExperimentRef(reference) => store
            .experiment(&reference.experiment_id)
            .filter(|e| e.status == ExperimentStatus::Running && !e.archived)
            .and_then(|e| e.live_phase()),
        _ => None,
    };
    let phase = match (gate, phase) {
        (Some(true), Some(phase)) => phase,
        _ => return gate,
    };

    let mut gates = vec![phase
        .condition
        .as_ref()
        .map(Condition::static_result)
        .unwrap_or(Some(true))];
    gates.extend(phase.saved_groups.iter().map(SavedGroupTargeting::static_result));
    if gates.contains(&Some(false)) {
        Some(false)
    } else if gates.contains(&None) {
        None
    } else {
        Some(true)
    }
}

/// Walks the rules in order, collecting every value that can be served, and reports whether there
/// is only one.
fn single_value(
    store: &dyn Store,
    feature: &Feature,
    environment: &FeatureEnvironment,
    now: DateTime<Utc>,
) -> bool {
    let mut values: Vec<&str> = Vec::new();
    let mut exhaustive = false;

    for rule in &environment.rules {
        let gate = rule_gate(store, rule, now);
        if gate == Some(false) {
            debug!("rule {} of {} can never fire", rule.id, feature.id);
            continue;
        }
        let outcome = match rule_outcome(store, feature, rule) {
            Some(outcome) => outcome,
            None => continue,
        };
        values.extend(outcome.values);
        if gate == Some(true) && outcome.always_resolves {
            exhaustive = true;
            break;
        }
    }
    if !exhaustive {
        values.push(feature.default_value_in(environment));
    }

    values
        .iter()
        .map(|raw| {
            feature
                .value_type
                .decode(raw)
                .unwrap_or_else(|_| FeatureValue::Str(raw.to_string()))
        })
        .all_equal()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_common::{fixed_now, TestStore};
    use assert_json_diff::assert_json_eq;
    use serde_json::json;
    use spectral::prelude::*;
    use test_case::test_case;

    fn classify(feature_id: &str, environment_id: &str) -> Staleness {
        let store = TestStore::new();
        let feature = store.feature(feature_id).expect("fixture feature should exist");
        analyze(
            &store,
            feature,
            environment_id,
            &EngineConfig::default(),
            fixed_now(),
        )
    }

    #[test_case("stale-one-sided", "prod", Some(StaleReason::RulesOneSided), true)]
    #[test_case("stale-no-rules", "prod", Some(StaleReason::NoRules), true)]
    #[test_case("limit", "dev", Some(StaleReason::ToggledOff), true)]
    #[test_case("stale-draft", "prod", Some(StaleReason::ActiveDraft), false)]
    #[test_case("stale-draft", "staging", Some(StaleReason::AbandonedDraft), true)]
    #[test_case("fresh", "prod", Some(StaleReason::RecentlyUpdated), false)]
    #[test_case("forever", "prod", Some(StaleReason::NeverStale), false)]
    #[test_case("parent", "prod", Some(StaleReason::HasDependents), false)]
    #[test_case("precedence", "prod", None, false; "conditional rules are live")]
    #[test_case("rollout", "prod", Some(StaleReason::RulesOneSided), true; "unconditional rollout")]
    #[test_case("checkout-experiment", "prod", Some(StaleReason::RulesOneSided), true; "unconditional experiment")]
    #[test_case("safe", "prod", Some(StaleReason::RulesOneSided), true; "unconditional safe rollout")]
    #[test_case("beta", "prod", None, false; "saved group targeting is live")]
    #[test_case("dependent", "prod", None, false; "prerequisite is live")]
    #[test_case("experiment-ref", "prod", None, false; "experiment phase condition is live")]
    #[test_case("experiment-ref", "staging", Some(StaleReason::RulesOneSided), true; "released experiment")]
    #[test_case("guarded", "prod", Some(StaleReason::RulesOneSided), true; "malformed rule is dead")]
    #[test_case("scheduled", "prod", None, false; "pending schedule is live")]
    #[test_case("limit", "qa", None, false; "unknown environment")]
    fn classifies(feature_id: &str, environment_id: &str, reason: Option<StaleReason>, stale: bool) {
        let staleness = classify(feature_id, environment_id);
        assert_that!(staleness.reason).is_equal_to(reason);
        assert_that!(staleness.is_stale).is_equal_to(stale);
    }

    #[test]
    fn breakdown_covers_every_environment() {
        let staleness = classify("stale-draft", "prod");
        assert_that!(staleness.reason).contains_value(StaleReason::ActiveDraft);
        assert_json_eq!(
            serde_json::to_value(&staleness).unwrap(),
            json!({
                "isStale": false,
                "reason": "active-draft",
                "environments": {
                    "prod": {"isStale": false, "reason": "active-draft"},
                    "staging": {"isStale": true, "reason": "abandoned-draft"}
                }
            })
        );
    }

    #[test]
    fn every_environment_of_a_safe_rollout_is_classified() {
        let staleness = classify("safe", "staging");
        assert_eq!(staleness.environments.len(), 3);
        for environment in staleness.environments.values() {
            assert_that!(environment.reason).contains_value(StaleReason::RulesOneSided);
        }
    }

    #[test]
    fn same_value_from_every_rule_is_one_sided() {
        // every rule serves "true" and so does the default
        let staleness = classify("all-true", "prod");
        assert_that!(staleness.reason).is_equal_to(Some(StaleReason::RulesOneSided));
    }

    #[test]
    fn horizons_are_configurable() {
        let store = TestStore::new();
        let feature = store.feature("fresh").unwrap();
        let config = EngineConfig::default().with_stale_after_days(1);
        let staleness = analyze(&store, feature, "prod", &config, fixed_now());
        assert_that!(staleness.reason).is_equal_to(Some(StaleReason::RulesOneSided));
    }
}
