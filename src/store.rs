use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Deserialize;

use crate::error::StoreError;
use crate::experiment::Experiment;
use crate::feature::Feature;
use crate::saved_group::SavedGroup;

/// Store is an interface for the published data an evaluation reads.
///
/// Ordinarily the only implementation is [Snapshot], which holds an immutable copy of everything.
/// Saved groups are fallible so that implementations backed by a separate saved-group service can
/// report outages; evaluation then skips the affected rules instead of guessing membership.
pub trait Store {
    /// Retrieve the feature with id `feature_id`.
    fn feature(&self, feature_id: &str) -> Option<&Feature>;

    /// Retrieve the experiment with id `experiment_id`.
    fn experiment(&self, experiment_id: &str) -> Option<&Experiment>;

    /// Retrieve the saved group with id `group_id`.
    fn saved_group(&self, group_id: &str) -> Result<Option<&SavedGroup>, StoreError>;

    /// Iterate over every feature.
    fn features(&self) -> Box<dyn Iterator<Item = &Feature> + '_>;
}

/// An immutable, published set of features, experiments and saved groups.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(from = "SnapshotData")]
pub struct Snapshot {
    features: HashMap<String, Feature>,
    experiments: HashMap<String, Experiment>,
    saved_groups: HashMap<String, SavedGroup>,
}

// The wire form lists entities; the snapshot indexes them by id.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotData {
    #[serde(default)]
    features: Vec<Feature>,
    #[serde(default)]
    experiments: Vec<Experiment>,
    #[serde(default)]
    saved_groups: Vec<SavedGroup>,
}

impl From<SnapshotData> for Snapshot {
    fn from(data: SnapshotData) -> Self {
        Snapshot::new(data.features, data.experiments, data.saved_groups)
    }
}

impl Snapshot {
    pub fn new(
        features: impl IntoIterator<Item = Feature>,
        experiments: impl IntoIterator<Item = Experiment>,
        saved_groups: impl IntoIterator<Item = SavedGroup>,
    ) -> Self {
        Snapshot {
            features: features.into_iter().map(|f| (f.id.clone(), f)).collect(),
            experiments: experiments.into_iter().map(|e| (e.id.clone(), e)).collect(),
            saved_groups: saved_groups
                .into_iter()
                .map(|g| (g.id.clone(), g))
                .collect(),
        }
    }
}

impl Store for Snapshot {
    fn feature(&self, feature_id: &str) -> Option<&Feature> {
        self.features.get(feature_id)
    }

    fn experiment(&self, experiment_id: &str) -> Option<&Experiment> {
        self.experiments.get(experiment_id)
    }

    fn saved_group(&self, group_id: &str) -> Result<Option<&SavedGroup>, StoreError> {
        Ok(self.saved_groups.get(group_id))
    }

    fn features(&self) -> Box<dyn Iterator<Item = &Feature> + '_> {
        Box::new(self.features.values())
    }
}

/// `SnapshotStore` holds the current [Snapshot] and lets a new one be published while
/// evaluations are running.
///
/// Readers take a reference-counted handle to the snapshot once per evaluation, so an in-flight
/// evaluation keeps the snapshot it started with.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl SnapshotStore {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn current(&self) -> Arc<Snapshot> {
        // The lock only guards a pointer swap, so a poisoned lock still holds a complete snapshot.
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Publish a new snapshot, returning the previous one.
    pub fn replace(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        // Constructing new value before requesting the lock to minimize lock span.
        let new_value = Arc::new(snapshot);

        let mut slot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut slot, new_value)
    }
}
