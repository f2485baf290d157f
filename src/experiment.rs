use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::attribute_value::{lookup, Attributes};
use crate::condition::Condition;
use crate::error::{EvaluationError, StoreError};
use crate::hash::{hash, in_range, HashVersion, Namespace};
use crate::rule::{default_hash_attribute, RolloutRule};
use crate::saved_group::SavedGroupTargeting;
use crate::sticky::StickyBucketService;
use crate::util::is_false;

// Tolerance for weight vectors that sum to slightly more than one through rounding.
const WEIGHT_SUM_EPSILON: f64 = 1e-6;

/// An experiment stored alongside the features, referenced by `experiment-ref` rules.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: String,
    pub tracking_key: String,
    pub status: ExperimentStatus,
    #[serde(default)]
    pub archived: bool,
    /// Once a stopped experiment has a winner, every unit gets this variation.
    #[serde(default)]
    pub released_variation_id: Option<String>,
    #[serde(default = "default_hash_attribute")]
    pub hash_attribute: String,
    #[serde(default)]
    pub fallback_attribute: Option<String>,
    #[serde(default)]
    pub hash_version: HashVersion,
    #[serde(default)]
    pub bucket_version: u32,
    #[serde(default)]
    pub min_bucket_version: u32,
    #[serde(default)]
    pub disable_sticky_bucketing: bool,
    pub variations: Vec<ExperimentVariation>,
    #[serde(default)]
    pub phases: Vec<ExperimentPhase>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Stopped,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentVariation {
    pub id: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub name: String,
}

/// A period of an experiment's life with its own traffic allocation. Only the latest phase is
/// live.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentPhase {
    #[serde(default = "default_coverage")]
    pub coverage: f64,
    #[serde(default)]
    pub variation_weights: Vec<f64>,
    #[serde(default)]
    pub namespace: Option<Namespace>,
    /// Defaults to the experiment's tracking key.
    #[serde(default)]
    pub seed: Option<String>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub saved_groups: Vec<SavedGroupTargeting>,
}

fn default_coverage() -> f64 {
    1.0
}

impl Experiment {
    pub fn live_phase(&self) -> Option<&ExperimentPhase> {
        self.phases.last()
    }

    pub fn variation_index(&self, variation_id: &str) -> Option<usize> {
        self.variations.iter().position(|v| v.id == variation_id)
    }

    pub(crate) fn params<'a>(&'a self, phase: &'a ExperimentPhase) -> ExperimentParams<'a> {
        ExperimentParams {
            key: &self.tracking_key,
            seed: phase.seed.as_deref().unwrap_or(&self.tracking_key),
            hash_attribute: &self.hash_attribute,
            fallback_attribute: self.fallback_attribute.as_deref(),
            hash_version: self.hash_version,
            coverage: phase.coverage,
            weights: phase.variation_weights.clone(),
            variation_ids: self.variations.iter().map(|v| v.id.clone()).collect(),
            namespace: phase.namespace.as_ref(),
            bucket_version: self.bucket_version,
            min_bucket_version: self.min_bucket_version,
            sticky_bucketing: !self.disable_sticky_bucketing,
        }
    }
}

/// Everything needed to assign a unit to a variation, independent of where the experiment is
/// defined.
#[derive(Clone, Debug)]
pub(crate) struct ExperimentParams<'a> {
    pub key: &'a str,
    pub seed: &'a str,
    pub hash_attribute: &'a str,
    pub fallback_attribute: Option<&'a str>,
    pub hash_version: HashVersion,
    pub coverage: f64,
    pub weights: Vec<f64>,
    pub variation_ids: Vec<String>,
    pub namespace: Option<&'a Namespace>,
    pub bucket_version: u32,
    pub min_bucket_version: u32,
    pub sticky_bucketing: bool,
}

/// The outcome of bucketing a unit into an experiment, suitable for exposure logging.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    /// The experiment's tracking key.
    pub key: String,
    pub variation_id: String,
    pub variation_index: usize,
    pub bucket_version: u32,
    pub hash_attribute: String,
    pub hash_value: String,
    #[serde(skip_serializing_if = "is_false")]
    pub sticky_bucket_used: bool,
}

/// Resolves the unit identifier from `hash_attribute`, falling back to `fallback_attribute`.
///
/// Returns the attribute that was used together with its value.
pub(crate) fn unit_value<'a>(
    attributes: &Attributes,
    hash_attribute: &'a str,
    fallback_attribute: Option<&'a str>,
) -> Option<(&'a str, String)> {
    std::iter::once(hash_attribute)
        .chain(fallback_attribute)
        .find_map(|attribute| {
            lookup(attributes, attribute)
                .and_then(|value| value.as_bucketable())
                .map(|value| (attribute, value))
        })
}

fn validate_coverage(coverage: f64) -> Result<f64, EvaluationError> {
    if (0.0..=1.0).contains(&coverage) {
        Ok(coverage)
    } else {
        Err(EvaluationError::configuration(format!(
            "coverage {} is outside [0, 1]",
            coverage
        )))
    }
}

/// Checks a weight vector against the number of variations.
///
/// Missing or mismatched weights, and weights that sum to zero, fall back to an even split.
/// Negative weights or a total above one are configuration errors.
pub fn normalize_weights(weights: &[f64], variations: usize) -> Result<Vec<f64>, EvaluationError> {
    if variations == 0 {
        return Err(EvaluationError::configuration(
            "experiment has no variations",
        ));
    }
    if let Some(w) = weights.iter().find(|w| w.is_nan() || **w < 0.0) {
        return Err(EvaluationError::configuration(format!(
            "invalid variation weight {}",
            w
        )));
    }

    let total: f64 = weights.iter().sum();
    if total > 1.0 + WEIGHT_SUM_EPSILON {
        return Err(EvaluationError::configuration(format!(
            "variation weights sum to {}",
            total
        )));
    }
    if weights.len() != variations || total <= 0.0 {
        if !weights.is_empty() {
            warn!(
                "ignoring {} variation weights for {} variations; splitting evenly",
                weights.len(),
                variations
            );
        }
        return Ok(vec![1.0 / variations as f64; variations]);
    }
    Ok(weights.to_vec())
}

/// Partitions `[0, coverage)` into contiguous half-open bands, one per variation, proportional to
/// the weights.
///
/// The bands are scaled by the weight total, so they always cover the whole range even when the
/// weights sum to less than one. The last band ends exactly at `coverage`.
pub fn bucket_ranges(coverage: f64, weights: &[f64]) -> Vec<(f64, f64)> {
    let total: f64 = weights.iter().sum();
    let mut cumulative = 0.0;
    let mut start = 0.0;
    let mut ranges = Vec::with_capacity(weights.len());
    for (i, weight) in weights.iter().enumerate() {
        cumulative += weight;
        let end = if i + 1 == weights.len() {
            coverage
        } else {
            coverage * cumulative / total
        };
        ranges.push((start, end));
        start = end;
    }
    ranges
}

/// Returns the index of the band containing `h`, or None when the unit is outside `coverage`.
pub fn choose_variation(h: f64, coverage: f64, weights: &[f64]) -> Option<usize> {
    if h >= coverage || weights.is_empty() {
        return None;
    }
    let ranges = bucket_ranges(coverage, weights);
    ranges
        .iter()
        .position(|range| in_range(h, *range))
        .or(Some(ranges.len() - 1))
}

/// Decides whether a rollout rule includes the unit.
pub(crate) fn rollout_includes(
    rollout: &RolloutRule,
    feature_id: &str,
    attributes: &Attributes,
) -> Result<bool, EvaluationError> {
    let coverage = validate_coverage(rollout.coverage)?;
    let (_, unit) = match unit_value(attributes, &rollout.hash_attribute, None) {
        Some(unit) => unit,
        None => return Ok(false),
    };
    let seed = rollout.seed.as_deref().unwrap_or(feature_id);
    let h = hash(seed, &unit, rollout.hash_version.unwrap_or_default());
    Ok(h < coverage)
}

/// Assigns the unit described by `attributes` to one of the experiment's variations.
///
/// Returns None when the unit is not part of the experiment. Sticky bucket store failures do not
/// fail the assignment: they are pushed onto `degraded` and bucketing continues without the store.
pub(crate) fn assign(
    params: &ExperimentParams,
    attributes: &Attributes,
    sticky: Option<&dyn StickyBucketService>,
    degraded: &mut Vec<StoreError>,
) -> Result<Option<Assignment>, EvaluationError> {
    let weights = normalize_weights(&params.weights, params.variation_ids.len())?;
    let coverage = validate_coverage(params.coverage)?;

    let (hash_attribute, unit) =
        match unit_value(attributes, params.hash_attribute, params.fallback_attribute) {
            Some(unit) => unit,
            None => {
                debug!("no bucketing unit for experiment {}", params.key);
                return Ok(None);
            }
        };

    if let Some(namespace) = params.namespace {
        if !namespace.contains(&unit) {
            debug!(
                "unit is outside namespace {} for experiment {}",
                namespace.name, params.key
            );
            return Ok(None);
        }
    }

    let sticky = sticky.filter(|_| params.sticky_bucketing);
    let assignment = |variation_index: usize, bucket_version: u32, sticky_bucket_used: bool| {
        Assignment {
            key: params.key.to_string(),
            variation_id: params.variation_ids[variation_index].clone(),
            variation_index,
            bucket_version,
            hash_attribute: hash_attribute.to_string(),
            hash_value: unit.clone(),
            sticky_bucket_used,
        }
    };

    if let Some(service) = sticky {
        match find_sticky_variation(service, params, &unit) {
            Ok(Some((index, version))) => return Ok(Some(assignment(index, version, true))),
            Ok(None) => {}
            Err(e) => {
                degraded.push(e);
                return Ok(bucket(params, &unit, coverage, &weights)
                    .map(|index| assignment(index, params.bucket_version, false)));
            }
        }
    }

    let index = match bucket(params, &unit, coverage, &weights) {
        Some(index) => index,
        None => return Ok(None),
    };
    let result = assignment(index, params.bucket_version, false);

    if let Some(service) = sticky {
        if let Err(e) = service.set(
            params.key,
            params.bucket_version,
            &unit,
            &result.variation_id,
        ) {
            degraded.push(e);
        }
    }
    Ok(Some(result))
}

fn bucket(params: &ExperimentParams, unit: &str, coverage: f64, weights: &[f64]) -> Option<usize> {
    let h = hash(params.seed, unit, params.hash_version);
    choose_variation(h, coverage, weights)
}

// Newest bucket version first; anything below min_bucket_version is ignored.
fn find_sticky_variation(
    service: &dyn StickyBucketService,
    params: &ExperimentParams,
    unit: &str,
) -> Result<Option<(usize, u32)>, StoreError> {
    for version in (params.min_bucket_version..=params.bucket_version).rev() {
        if let Some(variation_id) = service.get(params.key, version, unit)? {
            match params.variation_ids.iter().position(|id| *id == variation_id) {
                Some(index) => return Ok(Some((index, version))),
                None => warn!(
                    "ignoring sticky assignment to unknown variation {} of experiment {}",
                    variation_id, params.key
                ),
            }
        }
    }
    Ok(None)
}
