use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;

use crate::attribute_value::Attributes;
use crate::error::{Diagnostic, EvaluationError, StoreError};
use crate::experiment::{self, Assignment, Experiment, ExperimentParams, ExperimentStatus};
use crate::feature::{Feature, FeatureEnvironment};
use crate::feature_value::{FeatureValue, ValueType};
use crate::hash::HashVersion;
use crate::prerequisite::{self, PrerequisiteState};
use crate::rule::{ExperimentRefRule, ExperimentRule, Rule, RuleKind, SafeRolloutRule, SafeRolloutStatus};
use crate::saved_group;
use crate::schedule;
use crate::sticky::StickyBucketService;
use crate::store::Store;

const PREALLOCATED_PREREQUISITE_CHAIN_SIZE: usize = 20;

pub(crate) struct EvaluationStack {
    /// Features currently being evaluated, outermost first.
    pub(crate) prerequisite_chain: Vec<String>,
}

impl EvaluationStack {
    fn new() -> Self {
        Self {
            prerequisite_chain: Vec::with_capacity(PREALLOCATED_PREREQUISITE_CHAIN_SIZE),
        }
    }
}

impl Default for EvaluationStack {
    fn default() -> Self {
        Self::new()
    }
}

/// The inputs of one evaluation call.
///
/// Everything is borrowed: an evaluation reads a snapshot and never mutates it. The only side
/// effect is the write of fresh experiment assignments to `sticky`.
pub struct EvaluationContext<'a> {
    pub store: &'a dyn Store,
    pub attributes: &'a Attributes,
    pub environment_id: &'a str,
    /// The time schedules are evaluated at.
    pub now: DateTime<Utc>,
    /// None disables sticky bucketing.
    pub sticky: Option<&'a dyn StickyBucketService>,
}

/// What decided the value of an [Evaluation].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    /// No rule resolved; the environment default was served.
    DefaultValue,
    Force,
    Rollout,
    Experiment,
    SafeRollout,
    EnvironmentDisabled,
    UnknownEnvironment,
    UnknownFeature,
    /// A feature-level prerequisite was not satisfied.
    Prerequisite,
    /// A feature-level prerequisite depends on the feature itself.
    CyclicPrerequisite,
}

/// The result of evaluating a feature for one attribute set.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    /// The delivered value in its wire encoding, or None when the feature has no value for this
    /// attribute set.
    pub value: Option<String>,
    pub source: Source,
    pub rule_id: Option<String>,
    pub experiment_key: Option<String>,
    pub variation_id: Option<String>,
    pub assignment: Option<Assignment>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
    #[serde(skip)]
    value_type: ValueType,
}

impl Evaluation {
    pub(crate) fn new(feature: &Feature, value: Option<&str>, source: Source) -> Self {
        Evaluation {
            value: value.map(str::to_string),
            source,
            rule_id: None,
            experiment_key: None,
            variation_id: None,
            assignment: None,
            diagnostics: Vec::new(),
            value_type: feature.value_type,
        }
    }

    pub(crate) fn unknown_feature(feature_id: &str) -> Self {
        let error = EvaluationError::configuration(format!("unknown feature '{}'", feature_id));
        let mut diagnostics = Vec::new();
        report(&mut diagnostics, feature_id, None, &error);
        Evaluation {
            value: None,
            source: Source::UnknownFeature,
            rule_id: None,
            experiment_key: None,
            variation_id: None,
            assignment: None,
            diagnostics,
            value_type: ValueType::default(),
        }
    }

    fn with_rule(mut self, rule_id: &str) -> Self {
        self.rule_id = Some(rule_id.to_string());
        self
    }

    fn with_assignment(mut self, assignment: Assignment) -> Self {
        self.experiment_key = Some(assignment.key.clone());
        self.variation_id = Some(assignment.variation_id.clone());
        self.assignment = Some(assignment);
        self
    }

    /// Decodes the delivered value according to the feature's value type.
    pub fn typed_value(&self) -> Option<FeatureValue> {
        let raw = self.value.as_deref()?;
        match self.value_type.decode(raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("cannot decode delivered value: {}", e);
                None
            }
        }
    }

    /// True if a rule, rather than a default, decided the value.
    pub fn matched_rule(&self) -> bool {
        self.rule_id.is_some()
    }
}

/// Records a diagnostic and logs it.
pub(crate) fn report(
    diagnostics: &mut Vec<Diagnostic>,
    feature_id: &str,
    rule_id: Option<&str>,
    error: &EvaluationError,
) {
    match rule_id {
        Some(rule_id) => warn!("feature {} rule {}: {}", feature_id, rule_id, error),
        None => warn!("feature {}: {}", feature_id, error),
    }
    diagnostics.push(Diagnostic::new(feature_id, rule_id, error));
}

/// Evaluates a feature in the context's environment.
///
/// Evaluation never fails. Malformed rules are skipped, and every problem encountered along the
/// way, including inside prerequisite features, is returned in [Evaluation::diagnostics].
pub fn evaluate(context: &EvaluationContext, feature: &Feature) -> Evaluation {
    let mut stack = EvaluationStack::default();
    let mut diagnostics = Vec::new();
    let mut evaluation = evaluate_internal(context, feature, &mut stack, &mut diagnostics);
    evaluation.diagnostics = diagnostics;
    evaluation
}

pub(crate) fn evaluate_internal(
    context: &EvaluationContext,
    feature: &Feature,
    stack: &mut EvaluationStack,
    diagnostics: &mut Vec<Diagnostic>,
) -> Evaluation {
    let environment = match feature.environment(context.environment_id) {
        Some(environment) => environment,
        None => {
            debug!(
                "feature {} has no environment {}",
                feature.id, context.environment_id
            );
            return Evaluation::new(
                feature,
                Some(&feature.default_value),
                Source::UnknownEnvironment,
            );
        }
    };

    if !environment.enabled {
        return Evaluation::new(
            feature,
            Some(&feature.default_value),
            Source::EnvironmentDisabled,
        );
    }

    stack.prerequisite_chain.push(feature.id.clone());
    let evaluation = evaluate_environment(context, feature, environment, stack, diagnostics);
    stack.prerequisite_chain.pop();
    evaluation
}

fn evaluate_environment(
    context: &EvaluationContext,
    feature: &Feature,
    environment: &FeatureEnvironment,
    stack: &mut EvaluationStack,
    diagnostics: &mut Vec<Diagnostic>,
) -> Evaluation {
    for prerequisite in &feature.prerequisites {
        match prerequisite::satisfied(context, feature, None, prerequisite, stack, diagnostics) {
            PrerequisiteState::Satisfied => {}
            PrerequisiteState::Unsatisfied => {
                return Evaluation::new(feature, None, Source::Prerequisite)
            }
            PrerequisiteState::Cyclic => {
                return Evaluation::new(feature, None, Source::CyclicPrerequisite)
            }
        }
    }

    for rule in &environment.rules {
        match evaluate_rule(context, feature, rule, stack, diagnostics) {
            Ok(Some(evaluation)) => return evaluation,
            Ok(None) => {}
            Err(e) => report(diagnostics, &feature.id, Some(&rule.id), &e),
        }
    }

    Evaluation::new(
        feature,
        Some(feature.default_value_in(environment)),
        Source::DefaultValue,
    )
}

/// Runs a rule's gates and, if they all pass, its value resolution. Ok(None) means the rule did
/// not apply and evaluation continues with the next one.
fn evaluate_rule(
    context: &EvaluationContext,
    feature: &Feature,
    rule: &Rule,
    stack: &mut EvaluationStack,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<Option<Evaluation>, EvaluationError> {
    if !rule.enabled {
        debug!("skipping disabled rule {} of {}", rule.id, feature.id);
        return Ok(None);
    }

    if !schedule::is_active(&rule.schedule_rules, context.now)? {
        debug!("rule {} of {} is outside its schedule", rule.id, feature.id);
        return Ok(None);
    }

    for prerequisite in &rule.prerequisites {
        let state = prerequisite::satisfied(
            context,
            feature,
            Some(&rule.id),
            prerequisite,
            stack,
            diagnostics,
        );
        if state != PrerequisiteState::Satisfied {
            debug!(
                "skipping rule {} of {}: prerequisite {} is {:?}",
                rule.id, feature.id, prerequisite.feature_id, state
            );
            return Ok(None);
        }
    }

    if !rule.matches_targeting(context.attributes, context.store)? {
        return Ok(None);
    }

    let mut degraded = Vec::new();
    let resolved = resolve_rule(context, feature, rule, &mut degraded);
    for error in degraded {
        report(diagnostics, &feature.id, Some(&rule.id), &error.into());
    }

    let evaluation = match resolved? {
        Some(evaluation) => evaluation,
        None => return Ok(None),
    };
    if let Some(value) = &evaluation.value {
        feature.value_type.validate(value)?;
    }
    Ok(Some(evaluation.with_rule(&rule.id)))
}

fn resolve_rule(
    context: &EvaluationContext,
    feature: &Feature,
    rule: &Rule,
    degraded: &mut Vec<StoreError>,
) -> Result<Option<Evaluation>, EvaluationError> {
    match &rule.kind {
        RuleKind::Force(force) => Ok(Some(Evaluation::new(
            feature,
            Some(&force.value),
            Source::Force,
        ))),
        RuleKind::Rollout(rollout) => {
            let included = experiment::rollout_includes(rollout, &feature.id, context.attributes)?;
            Ok(included.then(|| Evaluation::new(feature, Some(&rollout.value), Source::Rollout)))
        }
        RuleKind::Experiment(inline) => resolve_inline_experiment(context, feature, inline, degraded),
        RuleKind::ExperimentRef(reference) => {
            resolve_experiment_ref(context, feature, reference, degraded)
        }
        RuleKind::SafeRollout(safe_rollout) => {
            resolve_safe_rollout(context, feature, safe_rollout, degraded)
        }
    }
}

fn resolve_inline_experiment(
    context: &EvaluationContext,
    feature: &Feature,
    inline: &ExperimentRule,
    degraded: &mut Vec<StoreError>,
) -> Result<Option<Evaluation>, EvaluationError> {
    let params = ExperimentParams {
        key: inline.tracking_key(&feature.id),
        seed: inline.seed(&feature.id),
        hash_attribute: &inline.hash_attribute,
        fallback_attribute: inline.fallback_attribute.as_deref(),
        hash_version: inline.hash_version.unwrap_or_default(),
        coverage: inline.coverage,
        weights: inline.values.iter().map(|v| v.weight).collect(),
        variation_ids: (0..inline.values.len()).map(|i| i.to_string()).collect(),
        namespace: inline.namespace.as_ref(),
        bucket_version: inline.bucket_version,
        min_bucket_version: inline.min_bucket_version,
        sticky_bucketing: !inline.disable_sticky_bucketing,
    };

    let assignment = match experiment::assign(&params, context.attributes, context.sticky, degraded)? {
        Some(assignment) => assignment,
        None => return Ok(None),
    };
    let value = &inline.values[assignment.variation_index].value;
    Ok(Some(
        Evaluation::new(feature, Some(value), Source::Experiment).with_assignment(assignment),
    ))
}

fn variation_value<'a>(
    reference: &'a ExperimentRefRule,
    experiment: &Experiment,
    variation_id: &str,
) -> Result<&'a str, EvaluationError> {
    reference
        .variations
        .iter()
        .find(|v| v.variation_id == variation_id)
        .map(|v| v.value.as_str())
        .ok_or_else(|| {
            EvaluationError::configuration(format!(
                "no value for variation '{}' of experiment '{}'",
                variation_id, experiment.id
            ))
        })
}

fn resolve_experiment_ref(
    context: &EvaluationContext,
    feature: &Feature,
    reference: &ExperimentRefRule,
    degraded: &mut Vec<StoreError>,
) -> Result<Option<Evaluation>, EvaluationError> {
    let experiment = context
        .store
        .experiment(&reference.experiment_id)
        .ok_or_else(|| {
            EvaluationError::configuration(format!(
                "unknown experiment '{}'",
                reference.experiment_id
            ))
        })?;

    if experiment.archived || experiment.status == ExperimentStatus::Draft {
        debug!("experiment {} is not live", experiment.id);
        return Ok(None);
    }

    if experiment.status == ExperimentStatus::Stopped {
        return match &experiment.released_variation_id {
            Some(variation_id) => {
                let value = variation_value(reference, experiment, variation_id)?;
                let mut evaluation = Evaluation::new(feature, Some(value), Source::Experiment);
                evaluation.experiment_key = Some(experiment.tracking_key.clone());
                evaluation.variation_id = Some(variation_id.clone());
                Ok(Some(evaluation))
            }
            None => Ok(None),
        };
    }

    let phase = experiment.live_phase().ok_or_else(|| {
        EvaluationError::configuration(format!("experiment '{}' has no phases", experiment.id))
    })?;
    if let Some(condition) = &phase.condition {
        if !condition.evaluate(context.attributes, context.store)? {
            return Ok(None);
        }
    }
    if !saved_group::matches_all(&phase.saved_groups, context.attributes, context.store)? {
        return Ok(None);
    }

    let params = experiment.params(phase);
    match experiment::assign(&params, context.attributes, context.sticky, degraded)? {
        Some(assignment) => {
            let value = variation_value(reference, experiment, &assignment.variation_id)?;
            Ok(Some(
                Evaluation::new(feature, Some(value), Source::Experiment)
                    .with_assignment(assignment),
            ))
        }
        None => Ok(None),
    }
}

fn resolve_safe_rollout(
    context: &EvaluationContext,
    feature: &Feature,
    safe_rollout: &SafeRolloutRule,
    degraded: &mut Vec<StoreError>,
) -> Result<Option<Evaluation>, EvaluationError> {
    let fixed = |value: &str| -> Result<Option<Evaluation>, EvaluationError> {
        Ok(Some(Evaluation::new(feature, Some(value), Source::SafeRollout)))
    };
    match safe_rollout.status {
        SafeRolloutStatus::Released => fixed(&safe_rollout.variation_value),
        SafeRolloutStatus::RolledBack | SafeRolloutStatus::Stopped => {
            fixed(&safe_rollout.control_value)
        }
        SafeRolloutStatus::Running => {
            let params = ExperimentParams {
                key: safe_rollout.tracking_key(),
                seed: safe_rollout.seed(),
                hash_attribute: &safe_rollout.hash_attribute,
                fallback_attribute: None,
                hash_version: safe_rollout.hash_version.unwrap_or(HashVersion::V1),
                coverage: 1.0,
                weights: vec![0.5, 0.5],
                variation_ids: vec!["0".to_string(), "1".to_string()],
                namespace: None,
                bucket_version: 0,
                min_bucket_version: 0,
                sticky_bucketing: true,
            };
            let assignment =
                match experiment::assign(&params, context.attributes, context.sticky, degraded)? {
                    Some(assignment) => assignment,
                    None => return Ok(None),
                };
            let value = if assignment.variation_index == 0 {
                &safe_rollout.control_value
            } else {
                &safe_rollout.variation_value
            };
            Ok(Some(
                Evaluation::new(feature, Some(value), Source::SafeRollout)
                    .with_assignment(assignment),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiagnosticKind;
    use crate::sticky::InMemoryStickyBucketService;
    use crate::test_common::{
        context, TestStore, UnavailableSavedGroupStore, UnavailableStickyBucketService,
    };
    use assert_json_diff::assert_json_eq;
    use maplit::hashmap;
    use serde_json::json;
    use spectral::prelude::*;
    use test_case::test_case;

    fn user(id: &str) -> Attributes {
        hashmap! {"id".to_string() => id.into()}
    }

    fn eval_in(store: &dyn Store, feature_id: &str, environment_id: &str, attributes: &Attributes) -> Evaluation {
        let mut context = context(store, attributes);
        context.environment_id = environment_id;
        let feature = store.feature(feature_id).expect("fixture feature should exist");
        evaluate(&context, feature)
    }

    fn eval(feature_id: &str, attributes: &Attributes) -> Evaluation {
        eval_in(&TestStore::new(), feature_id, "prod", attributes)
    }

    #[test]
    fn force_rule_on_number_feature() {
        let result = eval("limit", &user("u1"));
        assert_that!(result.value).contains_value("42".to_string());
        assert_that!(result.source).is_equal_to(Source::Force);
        assert_that!(result.rule_id).contains_value("limit-force".to_string());
        assert_that!(result.typed_value()).contains_value(FeatureValue::Number(42.0));
        assert_that!(result.diagnostics).has_length(0);
    }

    #[test]
    fn first_matching_rule_wins() {
        let result = eval("precedence", &hashmap! {"country".to_string() => "US".into()});
        assert_that!(result.value).contains_value("r2".to_string());
        assert_that!(result.rule_id).contains_value("r2".to_string());

        let result = eval("precedence", &hashmap! {"country".to_string() => "CA".into()});
        assert_that!(result.value).contains_value("r1".to_string());
    }

    #[test]
    fn rollout_outside_coverage_falls_through() {
        // hash("rollout-seed", "user-1462", 2) == 0.73 with coverage 0.5
        let result = eval("rollout", &user("user-1462"));
        assert_that!(result.value).contains_value("false".to_string());
        assert_that!(result.source).is_equal_to(Source::DefaultValue);
        assert_that!(result.matched_rule()).is_false();
    }

    #[test]
    fn rollout_inside_coverage() {
        // hash("rollout-seed", "u1", 2) == 0.4507
        let result = eval("rollout", &user("u1"));
        assert_that!(result.value).contains_value("true".to_string());
        assert_that!(result.source).is_equal_to(Source::Rollout);
    }

    #[test]
    fn rollout_without_unit_falls_through() {
        let result = eval("rollout", &hashmap! {});
        assert_that!(result.source).is_equal_to(Source::DefaultValue);
    }

    #[test]
    fn experiment_assigns_first_variation() {
        // hash("exp-seed", "user-10895", 2) == 0.2
        let result = eval("checkout-experiment", &user("user-10895"));
        assert_that!(result.value).contains_value("blue".to_string());
        assert_that!(result.source).is_equal_to(Source::Experiment);
        assert_that!(result.experiment_key).contains_value("checkout".to_string());
        assert_that!(result.variation_id).contains_value("0".to_string());
        let assignment = result.assignment.expect("should be assigned");
        assert_that!(assignment.variation_index).is_equal_to(0);
        assert_that!(assignment.hash_attribute).is_equal_to("id".to_string());
    }

    #[test]
    fn disabled_environment_serves_feature_default() {
        let store = TestStore::new();
        let result = eval_in(&store, "limit", "dev", &user("u1"));
        assert_that!(result.value).contains_value("10".to_string());
        assert_that!(result.source).is_equal_to(Source::EnvironmentDisabled);
    }

    #[test]
    fn unknown_environment_serves_feature_default() {
        let store = TestStore::new();
        let result = eval_in(&store, "limit", "qa", &user("u1"));
        assert_that!(result.value).contains_value("10".to_string());
        assert_that!(result.source).is_equal_to(Source::UnknownEnvironment);
    }

    #[test]
    fn malformed_condition_skips_rule_and_reports() {
        let result = eval("guarded", &user("u1"));
        assert_that!(result.value).contains_value("fallback".to_string());
        assert_that!(result.rule_id).contains_value("r-good".to_string());
        assert_that!(result.diagnostics).has_length(1);
        assert_that!(result.diagnostics[0].kind).is_equal_to(DiagnosticKind::ConfigurationError);
        assert_that!(result.diagnostics[0].rule_id).contains_value("r-bad".to_string());
    }

    #[test]
    fn value_of_wrong_type_skips_rule() {
        let result = eval("typed-mismatch", &user("u1"));
        assert_that!(result.value).contains_value("7".to_string());
        assert_that!(result.diagnostics).has_length(1);
    }

    #[test_case("u1", "false"; "member of excluded group")]
    #[test_case("u3", "true"; "not a member")]
    fn saved_group_none_targeting(id: &str, expected: &str) {
        let result = eval("beta", &user(id));
        assert_that!(result.value).contains_value(expected.to_string());
    }

    #[test_case(json!({"id": "u1"}), "listed", "listed")]
    #[test_case(json!({"id": "u3", "country": "US"}), "members", "members")]
    #[test_case(json!({"id": "u3", "country": "CA"}), "everyone", "everyone")]
    fn saved_group_rules(attributes: serde_json::Value, rule_id: &str, expected: &str) {
        let attributes: Attributes = serde_json::from_value(attributes).unwrap();
        let result = eval("group-targeted", &attributes);
        assert_that!(result.value).contains_value(expected.to_string());
        assert_that!(result.rule_id).contains_value(rule_id.to_string());
        assert_that!(result.diagnostics).has_length(0);
    }

    #[test]
    fn unavailable_saved_groups_skip_rules() {
        let store = UnavailableSavedGroupStore(TestStore::new());
        let attributes = hashmap! {
            "id".to_string() => "u1".into(),
            "country".to_string() => "US".into(),
        };
        let result = eval_in(&store, "group-targeted", "prod", &attributes);
        assert_that!(result.value).contains_value("everyone".to_string());
        assert_that!(result.rule_id).contains_value("everyone".to_string());
        assert_that!(result.diagnostics).has_length(2);
        for (diagnostic, rule_id) in result.diagnostics.iter().zip(["listed", "members"]) {
            assert_that!(diagnostic.kind).is_equal_to(DiagnosticKind::StoreUnavailable);
            assert_that!(diagnostic.rule_id).contains_value(rule_id.to_string());
        }
    }

    #[test]
    fn unavailable_saved_groups_fail_closed_under_none() {
        // a member of the excluded group must not be let through by an outage
        let store = UnavailableSavedGroupStore(TestStore::new());
        let result = eval_in(&store, "beta", "prod", &user("u1"));
        assert_that!(result.value).contains_value("false".to_string());
        assert_that!(result.source).is_equal_to(Source::DefaultValue);
        assert_that!(result.diagnostics).has_length(1);
        assert_that!(result.diagnostics[0].kind).is_equal_to(DiagnosticKind::StoreUnavailable);
        assert_that!(result.diagnostics[0].rule_id).contains_value("not-beta".to_string());
    }

    #[test]
    fn schedules_gate_rules() {
        // the clock is fixed at 2024-06-01, the first rule's window has closed
        let result = eval("scheduled", &user("u1"));
        assert_that!(result.value).contains_value("scheduled".to_string());
        assert_that!(result.rule_id).contains_value("in-window".to_string());
    }

    #[test]
    fn rule_prerequisites() {
        let result = eval("dependent", &user("u1"));
        assert_that!(result.value).contains_value("true".to_string());
        assert_that!(result.source).is_equal_to(Source::Force);
        assert_that!(result.rule_id).contains_value("when-parent".to_string());

        // the first rule requires a feature that does not exist
        assert_that!(result.diagnostics).has_length(1);
        assert_that!(result.diagnostics[0].kind).is_equal_to(DiagnosticKind::ConfigurationError);
        assert_that!(result.diagnostics[0].rule_id).contains_value("when-missing".to_string());
    }

    #[test]
    fn feature_prerequisite_cycle_is_reported() {
        let result = eval("cycle-a", &user("u1"));
        assert_that!(result.value).is_none();
        assert_that!(result.source).is_equal_to(Source::CyclicPrerequisite);
        assert_that!(result.diagnostics).has_length(1);
        assert_that!(result.diagnostics[0].kind).is_equal_to(DiagnosticKind::CycleError);
    }

    #[test]
    fn unsatisfied_feature_prerequisite() {
        let result = eval("gated", &user("u1"));
        assert_that!(result.value).is_none();
        assert_that!(result.source).is_equal_to(Source::Prerequisite);
    }

    #[test]
    fn experiment_ref_running() {
        let result = eval("experiment-ref", &user("user-10895"));
        assert_that!(result.value).contains_value("a".to_string());
        assert_that!(result.experiment_key).contains_value("exp-ref".to_string());
        assert_that!(result.variation_id).contains_value("v0".to_string());
    }

    #[test]
    fn experiment_ref_phase_condition_gates() {
        let attributes = hashmap! {
            "id".to_string() => "user-10895".into(),
            "country".to_string() => "CA".into(),
        };
        let result = eval("experiment-ref", &attributes);
        assert_that!(result.source).is_equal_to(Source::DefaultValue);
    }

    #[test]
    fn experiment_ref_released_variation() {
        let store = TestStore::new();
        let result = eval_in(&store, "experiment-ref", "staging", &user("user-10895"));
        assert_that!(result.value).contains_value("b".to_string());
        assert_that!(result.variation_id).contains_value("v1".to_string());
        assert_that!(result.assignment).is_none();
    }

    #[test]
    fn experiment_ref_draft_is_skipped() {
        let store = TestStore::new();
        let result = eval_in(&store, "experiment-ref", "dev", &user("user-10895"));
        assert_that!(result.source).is_equal_to(Source::DefaultValue);
        assert_that!(result.value).contains_value("off".to_string());
    }

    #[test_case("prod", "false", true; "running splits traffic")]
    #[test_case("staging", "true", false; "released serves the variation")]
    #[test_case("dev", "false", false; "rolled back serves control")]
    fn safe_rollouts(environment_id: &str, expected: &str, assigned: bool) {
        let store = TestStore::new();
        let result = eval_in(&store, "safe", environment_id, &user("user-10895"));
        assert_that!(result.value).contains_value(expected.to_string());
        assert_that!(result.source).is_equal_to(Source::SafeRollout);
        assert_eq!(result.assignment.is_some(), assigned);
    }

    #[test]
    fn sticky_assignments_are_persisted() {
        let store = TestStore::new();
        let sticky = InMemoryStickyBucketService::new();
        let attributes = user("user-10895");
        let mut context = context(&store, &attributes);
        context.sticky = Some(&sticky);

        let feature = store.feature("checkout-experiment").unwrap();
        let first = evaluate(&context, feature);
        assert_that!(first.value).contains_value("blue".to_string());
        assert_that!(sticky.get("checkout", 0, "user-10895"))
            .is_equal_to(Ok(Some("0".to_string())));

        sticky.set("checkout", 0, "user-10895", "1").unwrap();
        let second = evaluate(&context, feature);
        assert_that!(second.value).contains_value("green".to_string());
        assert!(second.assignment.unwrap().sticky_bucket_used);
    }

    #[test]
    fn unavailable_sticky_store_is_reported() {
        let store = TestStore::new();
        let attributes = user("user-10895");
        let mut context = context(&store, &attributes);
        context.sticky = Some(&UnavailableStickyBucketService);

        let result = evaluate(&context, store.feature("checkout-experiment").unwrap());
        assert_that!(result.value).contains_value("blue".to_string());
        assert_that!(result.diagnostics).has_length(1);
        assert_that!(result.diagnostics[0].kind).is_equal_to(DiagnosticKind::StoreUnavailable);
    }

    #[test]
    fn unknown_feature() {
        let result = Evaluation::unknown_feature("nope");
        assert_that!(result.value).is_none();
        assert_that!(result.source).is_equal_to(Source::UnknownFeature);
        assert_that!(result.diagnostics).has_length(1);
    }

    #[test]
    fn serializes_experiment_evaluation() {
        let result = eval("checkout-experiment", &user("user-10895"));
        assert_json_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({
                "value": "blue",
                "source": "experiment",
                "ruleId": "checkout-rule",
                "experimentKey": "checkout",
                "variationId": "0",
                "assignment": {
                    "key": "checkout",
                    "variationId": "0",
                    "variationIndex": 0,
                    "bucketVersion": 0,
                    "hashAttribute": "id",
                    "hashValue": "user-10895"
                }
            })
        );
    }

    #[test]
    fn serializes_default_evaluation_with_diagnostics() {
        let result = eval("typed-mismatch", &hashmap! {});
        assert_json_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({
                "value": "7",
                "source": "force",
                "ruleId": "valid",
                "diagnostics": [{
                    "kind": "configuration-error",
                    "featureId": "typed-mismatch",
                    "ruleId": "invalid",
                    "message": "configuration error: 'forty-two' is not a numeric value"
                }]
            })
        );
    }
}
