use log::debug;
use serde::Deserialize;
use serde_json::json;

use crate::attribute_value::{AttributeValue, Attributes};
use crate::condition::Condition;
use crate::error::{Diagnostic, EvaluationError};
use crate::eval::{evaluate_internal, report, EvaluationContext, EvaluationStack, Source};
use crate::feature::Feature;

/// A dependency on another feature's value.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prerequisite {
    #[serde(alias = "id")]
    pub feature_id: String,
    /// Evaluated against `{"value": <prerequisite value>}`. By default the prerequisite only needs
    /// to produce a value.
    #[serde(default = "default_condition")]
    pub condition: Condition,
}

fn default_condition() -> Condition {
    Condition::parse(&json!({"value": {"$exists": true}}))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrerequisiteState {
    Satisfied,
    Unsatisfied,
    /// The prerequisite depends, directly or not, on the feature being evaluated.
    Cyclic,
}

/// Evaluates the prerequisite feature and checks its value against the prerequisite's condition.
/// Problems are reported against `dependent`, and against `rule_id` for a rule's prerequisites.
///
/// The prerequisite chain in `stack` is the visiting set: a feature that is already being
/// evaluated is never entered again, which bounds the recursion by the number of features.
pub(crate) fn satisfied(
    context: &EvaluationContext,
    dependent: &Feature,
    rule_id: Option<&str>,
    prerequisite: &Prerequisite,
    stack: &mut EvaluationStack,
    diagnostics: &mut Vec<Diagnostic>,
) -> PrerequisiteState {
    let feature_id = prerequisite.feature_id.as_str();

    if stack.prerequisite_chain.iter().any(|id| id == feature_id) {
        let mut chain = stack.prerequisite_chain.clone();
        chain.push(feature_id.to_string());
        report(
            diagnostics,
            &dependent.id,
            rule_id,
            &EvaluationError::Cycle { chain },
        );
        return PrerequisiteState::Cyclic;
    }

    let feature = match context.store.feature(feature_id) {
        Some(feature) => feature,
        None => {
            report(
                diagnostics,
                &dependent.id,
                rule_id,
                &EvaluationError::configuration(format!(
                    "unknown prerequisite feature '{}'",
                    feature_id
                )),
            );
            return PrerequisiteState::Unsatisfied;
        }
    };

    let result = evaluate_internal(context, feature, stack, diagnostics);
    let value = match result.source {
        Source::CyclicPrerequisite => return PrerequisiteState::Cyclic,
        // a feature that is switched off has no value for its dependents
        Source::EnvironmentDisabled | Source::UnknownEnvironment => AttributeValue::Null,
        _ => result
            .value
            .as_deref()
            .and_then(|raw| feature.value_type.decode(raw).ok())
            .map(|value| value.to_attribute())
            .unwrap_or(AttributeValue::Null),
    };

    let attributes = Attributes::from([("value".to_string(), value)]);
    match prerequisite.condition.evaluate(&attributes, context.store) {
        Ok(true) => PrerequisiteState::Satisfied,
        Ok(false) => {
            debug!(
                "prerequisite {} of {} is not satisfied",
                feature_id, dependent.id
            );
            PrerequisiteState::Unsatisfied
        }
        Err(e) => {
            report(diagnostics, &dependent.id, rule_id, &e);
            PrerequisiteState::Unsatisfied
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::test_common::{context, TestStore};
    use maplit::hashmap;
    use spectral::prelude::*;
    use test_case::test_case;

    fn prerequisite(feature_id: &str, condition: serde_json::Value) -> Prerequisite {
        Prerequisite {
            feature_id: feature_id.to_string(),
            condition: Condition::parse(&condition),
        }
    }

    fn check(prerequisite: &Prerequisite) -> (PrerequisiteState, Vec<Diagnostic>) {
        check_in_rule(None, prerequisite)
    }

    fn check_in_rule(
        rule_id: Option<&str>,
        prerequisite: &Prerequisite,
    ) -> (PrerequisiteState, Vec<Diagnostic>) {
        let store = TestStore::new();
        let attributes = hashmap! {"id".to_string() => AttributeValue::from("u1")};
        let context = context(&store, &attributes);
        let dependent = store.feature("dependent").unwrap();
        let mut stack = EvaluationStack::default();
        stack.prerequisite_chain.push(dependent.id.clone());
        let mut diagnostics = vec![];
        let state = satisfied(
            &context,
            dependent,
            rule_id,
            prerequisite,
            &mut stack,
            &mut diagnostics,
        );
        (state, diagnostics)
    }

    #[test_case(json!({"value": true}), PrerequisiteState::Satisfied)]
    #[test_case(json!({"value": false}), PrerequisiteState::Unsatisfied)]
    #[test_case(json!({}), PrerequisiteState::Satisfied)]
    fn checks_prerequisite_value(condition: serde_json::Value, expected: PrerequisiteState) {
        // "parent" is a boolean feature that evaluates to true in prod
        let (state, diagnostics) = check(&prerequisite("parent", condition));
        assert_that!(state).is_equal_to(expected);
        assert_that!(diagnostics).has_length(0);
    }

    #[test]
    fn default_condition_requires_a_value() {
        let parsed: Prerequisite =
            serde_json::from_str(r#"{"featureId": "parent"}"#).expect("should parse");
        assert_that!(check(&parsed).0).is_equal_to(PrerequisiteState::Satisfied);

        // "disabled-parent" is switched off in prod
        let parsed: Prerequisite =
            serde_json::from_str(r#"{"id": "disabled-parent"}"#).expect("should parse");
        assert_that!(check(&parsed).0).is_equal_to(PrerequisiteState::Unsatisfied);
    }

    #[test]
    fn compares_typed_values() {
        // "limit" is a number feature with value 42 in prod
        let (state, _) = check(&prerequisite("limit", json!({"value": {"$gt": 40}})));
        assert_that!(state).is_equal_to(PrerequisiteState::Satisfied);
    }

    #[test]
    fn missing_feature_is_unsatisfied() {
        let (state, diagnostics) = check(&prerequisite("missing", json!({})));
        assert_that!(state).is_equal_to(PrerequisiteState::Unsatisfied);
        assert_that!(diagnostics).has_length(1);
    }

    #[test_case(None; "feature prerequisite")]
    #[test_case(Some("when-parent"); "rule prerequisite")]
    fn diagnostics_name_the_rule(rule_id: Option<&str>) {
        let (_, diagnostics) = check_in_rule(rule_id, &prerequisite("missing", json!({})));
        assert_that!(diagnostics).has_length(1);
        assert_that!(diagnostics[0].feature_id.as_str()).is_equal_to("dependent");
        assert_that!(diagnostics[0].rule_id.as_deref()).is_equal_to(rule_id);
    }

    #[test]
    fn self_reference_is_cyclic() {
        let (state, diagnostics) = check(&prerequisite("dependent", json!({})));
        assert_that!(state).is_equal_to(PrerequisiteState::Cyclic);
        assert_that!(diagnostics).has_length(1);
        assert_that!(diagnostics[0].message.as_str())
            .is_equal_to("prerequisite cycle detected: dependent -> dependent");
    }

    #[test]
    fn two_feature_cycle_is_detected() {
        // "cycle-a" requires "cycle-b", which requires "cycle-a"
        let (state, diagnostics) = check(&prerequisite("cycle-a", json!({})));
        assert_that!(state).is_equal_to(PrerequisiteState::Cyclic);
        assert_that!(diagnostics).has_length(1);
        assert_that!(diagnostics[0].message.as_str())
            .is_equal_to("prerequisite cycle detected: dependent -> cycle-a -> cycle-b -> cycle-a");
    }
}
