use std::sync::Arc;

use log::debug;

use crate::attribute_value::Attributes;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::eval::{self, Evaluation, EvaluationContext};
use crate::stale::{self, Staleness};
use crate::sticky::StickyBucketService;
use crate::store::{Snapshot, SnapshotStore, Store};

/// Engine evaluates features against the currently published [Snapshot].
///
/// An engine is shared between threads. Publishing a new snapshot with
/// [Engine::replace_snapshot] does not affect evaluations already running.
pub struct Engine {
    snapshots: SnapshotStore,
    clock: Box<dyn Clock>,
    sticky: Option<Arc<dyn StickyBucketService>>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(snapshot: Snapshot) -> Self {
        Engine {
            snapshots: SnapshotStore::new(snapshot),
            clock: Box::new(SystemClock),
            sticky: None,
            config: EngineConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_sticky_bucket_service(mut self, service: Arc<dyn StickyBucketService>) -> Self {
        self.sticky = Some(service);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The snapshot new evaluations will read.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshots.current()
    }

    /// Publish a new snapshot, returning the previous one.
    pub fn replace_snapshot(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        self.snapshots.replace(snapshot)
    }

    /// Evaluates `feature_id` in `environment_id` for one attribute set. Never fails; problems are
    /// reported in the returned [Evaluation]'s diagnostics.
    pub fn evaluate(
        &self,
        feature_id: &str,
        environment_id: &str,
        attributes: &Attributes,
    ) -> Evaluation {
        let snapshot = self.snapshots.current();
        let feature = match snapshot.feature(feature_id) {
            Some(feature) => feature,
            None => return Evaluation::unknown_feature(feature_id),
        };

        let sticky = if self.config.sticky_bucketing {
            self.sticky.as_deref()
        } else {
            None
        };
        let context = EvaluationContext {
            store: snapshot.as_ref(),
            attributes,
            environment_id,
            now: self.clock.now(),
            sticky,
        };
        eval::evaluate(&context, feature)
    }

    /// Classifies `feature_id` in `environment_id`, or None if the feature does not exist.
    pub fn is_stale(&self, feature_id: &str, environment_id: &str) -> Option<Staleness> {
        let snapshot = self.snapshots.current();
        let feature = match snapshot.feature(feature_id) {
            Some(feature) => feature,
            None => {
                debug!("cannot classify unknown feature {}", feature_id);
                return None;
            }
        };
        Some(stale::analyze(
            snapshot.as_ref(),
            feature,
            environment_id,
            &self.config,
            self.clock.now(),
        ))
    }
}
