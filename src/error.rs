use serde::Serialize;

/// Error returned by an external store (saved groups, sticky bucketing) when it cannot serve a
/// request.
#[derive(thiserror::Error, Clone, Debug, PartialEq)]
#[error("{store} store unavailable: {message}")]
pub struct StoreError {
    /// Which collaborator failed, e.g. "sticky-bucket" or "saved-group".
    pub store: &'static str,
    pub message: String,
}

impl StoreError {
    pub fn new(store: &'static str, message: impl Into<String>) -> Self {
        StoreError {
            store,
            message: message.into(),
        }
    }
}

/// Failures that can occur while evaluating a single rule.
///
/// None of these ever escape [crate::Engine::evaluate]; each is recorded as a [Diagnostic] and the
/// affected rule degrades to its fallback (usually "skip").
///
/// There is intentionally no variant for missing attributes: an absent attribute is an ordinary
/// input with defined semantics for every operator.
#[derive(thiserror::Error, Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum EvaluationError {
    /// The rule, condition or referenced entity is malformed or missing.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A prerequisite chain loops back onto a feature that is already being evaluated.
    #[error("prerequisite cycle detected: {}", chain.join(" -> "))]
    Cycle { chain: Vec<String> },

    /// An external store could not be reached; evaluation continued in a degraded mode.
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
}

impl EvaluationError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        EvaluationError::Configuration(message.into())
    }

    pub fn kind(&self) -> DiagnosticKind {
        match self {
            EvaluationError::Configuration(_) => DiagnosticKind::ConfigurationError,
            EvaluationError::Cycle { .. } => DiagnosticKind::CycleError,
            EvaluationError::StoreUnavailable(_) => DiagnosticKind::StoreUnavailable,
        }
    }
}

/// Category of a [Diagnostic].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiagnosticKind {
    ConfigurationError,
    CycleError,
    StoreUnavailable,
}

/// A non-fatal problem encountered during evaluation.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub feature_id: String,
    pub rule_id: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub(crate) fn new(feature_id: &str, rule_id: Option<&str>, error: &EvaluationError) -> Self {
        Diagnostic {
            kind: error.kind(),
            feature_id: feature_id.to_string(),
            rule_id: rule_id.map(str::to_string),
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;

    #[test]
    fn cycle_error_describes_chain() {
        let error = EvaluationError::Cycle {
            chain: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_that!(error.to_string())
            .is_equal_to("prerequisite cycle detected: a -> b -> a".to_string());
        assert_that!(error.kind()).is_equal_to(DiagnosticKind::CycleError);
    }

    #[test]
    fn store_errors_are_reported_as_unavailable() {
        let error: EvaluationError = StoreError::new("sticky-bucket", "timeout").into();
        assert_that!(error.kind()).is_equal_to(DiagnosticKind::StoreUnavailable);
        assert_that!(error.to_string())
            .is_equal_to("sticky-bucket store unavailable: timeout".to_string());
    }

    #[test]
    fn diagnostic_serializes_without_missing_rule() {
        let diagnostic = Diagnostic::new(
            "feature",
            None,
            &EvaluationError::configuration("bad value"),
        );
        let json = serde_json::to_value(&diagnostic).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "kind": "configuration-error",
                "featureId": "feature",
                "message": "configuration error: bad value"
            })
        );
    }
}
