use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::StoreError;

const STORE_NAME: &str = "sticky-bucket";

/// Persists experiment assignments so that a unit keeps its variation when an experiment's
/// configuration changes.
///
/// Assignments are keyed by `(experiment_key, bucket_version, unit_value)` and hold the assigned
/// variation id. `set` must behave as an idempotent upsert: concurrent first assignments of the
/// same unit compute the same variation, so last-write-wins is acceptable.
pub trait StickyBucketService: Send + Sync {
    fn get(
        &self,
        experiment_key: &str,
        bucket_version: u32,
        unit_value: &str,
    ) -> Result<Option<String>, StoreError>;

    fn set(
        &self,
        experiment_key: &str,
        bucket_version: u32,
        unit_value: &str,
        variation_id: &str,
    ) -> Result<(), StoreError>;
}

type StickyKey = (String, u32, String);

/// A process-local [StickyBucketService].
#[derive(Debug, Default)]
pub struct InMemoryStickyBucketService {
    assignments: RwLock<HashMap<StickyKey, String>>,
}

impl InMemoryStickyBucketService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.assignments.read().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn key(experiment_key: &str, bucket_version: u32, unit_value: &str) -> StickyKey {
    (
        experiment_key.to_string(),
        bucket_version,
        unit_value.to_string(),
    )
}

impl StickyBucketService for InMemoryStickyBucketService {
    fn get(
        &self,
        experiment_key: &str,
        bucket_version: u32,
        unit_value: &str,
    ) -> Result<Option<String>, StoreError> {
        let assignments = self
            .assignments
            .read()
            .map_err(|e| StoreError::new(STORE_NAME, e.to_string()))?;
        Ok(assignments
            .get(&key(experiment_key, bucket_version, unit_value))
            .cloned())
    }

    fn set(
        &self,
        experiment_key: &str,
        bucket_version: u32,
        unit_value: &str,
        variation_id: &str,
    ) -> Result<(), StoreError> {
        let mut assignments = self
            .assignments
            .write()
            .map_err(|e| StoreError::new(STORE_NAME, e.to_string()))?;
        assignments.insert(
            key(experiment_key, bucket_version, unit_value),
            variation_id.to_string(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;
    use std::sync::Arc;

    #[test]
    fn stores_assignments_per_bucket_version() {
        let service = InMemoryStickyBucketService::new();
        assert!(service.is_empty());

        service.set("exp", 1, "u1", "control").unwrap();
        service.set("exp", 2, "u1", "treatment").unwrap();

        assert_that!(service.get("exp", 1, "u1")).is_equal_to(Ok(Some("control".to_string())));
        assert_that!(service.get("exp", 2, "u1")).is_equal_to(Ok(Some("treatment".to_string())));
        assert_that!(service.get("exp", 3, "u1")).is_equal_to(Ok(None));
        assert_that!(service.get("other", 1, "u1")).is_equal_to(Ok(None));
        assert_eq!(service.len(), 2);
    }

    #[test]
    fn set_is_an_upsert() {
        let service = InMemoryStickyBucketService::new();
        service.set("exp", 0, "u1", "a").unwrap();
        service.set("exp", 0, "u1", "b").unwrap();
        assert_that!(service.get("exp", 0, "u1")).is_equal_to(Ok(Some("b".to_string())));
        assert_eq!(service.len(), 1);
    }

    #[test]
    fn can_be_shared_between_threads() {
        let service = Arc::new(InMemoryStickyBucketService::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let service = service.clone();
                std::thread::spawn(move || {
                    service
                        .set("exp", 0, &format!("u{}", i), "control")
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(service.len(), 4);
    }
}
