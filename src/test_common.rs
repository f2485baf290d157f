#![cfg(test)]

use chrono::{DateTime, TimeZone, Utc};

use crate::attribute_value::Attributes;
use crate::error::StoreError;
use crate::eval::EvaluationContext;
use crate::experiment::Experiment;
use crate::feature::Feature;
use crate::saved_group::SavedGroup;
use crate::sticky::StickyBucketService;
use crate::store::{Snapshot, Store};

pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

/// Evaluation context in the "prod" environment at [fixed_now], without sticky bucketing.
pub fn context<'a>(store: &'a dyn Store, attributes: &'a Attributes) -> EvaluationContext<'a> {
    EvaluationContext {
        store,
        attributes,
        environment_id: "prod",
        now: fixed_now(),
        sticky: None,
    }
}

pub struct UnavailableStickyBucketService;

impl StickyBucketService for UnavailableStickyBucketService {
    fn get(&self, _: &str, _: u32, _: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::new("sticky-bucket", "connection refused"))
    }

    fn set(&self, _: &str, _: u32, _: &str, _: &str) -> Result<(), StoreError> {
        Err(StoreError::new("sticky-bucket", "connection refused"))
    }
}

pub struct TestStore {
    snapshot: Snapshot,
}

impl TestStore {
    pub fn new() -> Self {
        Self {
            snapshot: serde_json::from_str(SNAPSHOT).unwrap(),
        }
    }

    pub fn into_snapshot(self) -> Snapshot {
        self.snapshot
    }
}

impl Store for TestStore {
    fn feature(&self, feature_id: &str) -> Option<&Feature> {
        self.snapshot.feature(feature_id)
    }

    fn experiment(&self, experiment_id: &str) -> Option<&Experiment> {
        self.snapshot.experiment(experiment_id)
    }

    fn saved_group(&self, group_id: &str) -> Result<Option<&SavedGroup>, StoreError> {
        self.snapshot.saved_group(group_id)
    }

    fn features(&self) -> Box<dyn Iterator<Item = &Feature> + '_> {
        self.snapshot.features()
    }
}

/// Serves the fixture snapshot, but every saved group lookup fails.
pub struct UnavailableSavedGroupStore(pub TestStore);

impl Store for UnavailableSavedGroupStore {
    fn feature(&self, feature_id: &str) -> Option<&Feature> {
        self.0.feature(feature_id)
    }

    fn experiment(&self, experiment_id: &str) -> Option<&Experiment> {
        self.0.experiment(experiment_id)
    }

    fn saved_group(&self, _: &str) -> Result<Option<&SavedGroup>, StoreError> {
        Err(StoreError::new("saved-group", "connection refused"))
    }

    fn features(&self) -> Box<dyn Iterator<Item = &Feature> + '_> {
        self.0.features()
    }
}

const SNAPSHOT: &str = r#"{
    "savedGroups": [
        {"id": "beta-testers", "name": "Beta testers", "type": "list",
         "attributeKey": "id", "values": ["u1", "u2"]},
        {"id": "big-accounts", "type": "list", "attributeKey": "accountId", "values": ["1001"]},
        {"id": "us-users", "type": "condition", "condition": {"country": "US"}}
    ],
    "experiments": [
        {
            "id": "exp-running",
            "trackingKey": "exp-ref",
            "status": "running",
            "hashVersion": 2,
            "variations": [{"id": "v0", "key": "0"}, {"id": "v1", "key": "1"}],
            "phases": [
                {"coverage": 0.1, "seed": "old-seed"},
                {"coverage": 1, "variationWeights": [0.5, 0.5], "seed": "exp-seed",
                 "condition": {"country": {"$ne": "CA"}}}
            ]
        },
        {
            "id": "exp-released",
            "trackingKey": "exp-released",
            "status": "stopped",
            "releasedVariationId": "v1",
            "variations": [{"id": "v0"}, {"id": "v1"}],
            "phases": [{"coverage": 1}]
        },
        {
            "id": "exp-draft",
            "trackingKey": "exp-draft",
            "status": "draft",
            "variations": [{"id": "v0"}, {"id": "v1"}],
            "phases": [{"coverage": 1}]
        }
    ],
    "features": [
        {
            "id": "limit",
            "valueType": "number",
            "defaultValue": "10",
            "environments": {
                "prod": {"enabled": true, "rules": [
                    {"id": "limit-force", "type": "force", "value": "42"}
                ]},
                "dev": {"enabled": false}
            }
        },
        {
            "id": "precedence",
            "valueType": "string",
            "defaultValue": "default",
            "environments": {"prod": {"enabled": true, "rules": [
                {"id": "r1", "type": "force", "value": "r1", "condition": {"country": "CA"}},
                {"id": "r2", "type": "force", "value": "r2", "condition": {}}
            ]}}
        },
        {
            "id": "rollout",
            "defaultValue": "false",
            "environments": {"prod": {"enabled": true, "rules": [
                {"id": "half", "type": "rollout", "value": "true", "coverage": 0.5,
                 "seed": "rollout-seed", "hashVersion": 2}
            ]}}
        },
        {
            "id": "checkout-experiment",
            "valueType": "string",
            "defaultValue": "control",
            "environments": {"prod": {"enabled": true, "rules": [
                {"id": "checkout-rule", "type": "experiment", "trackingKey": "checkout",
                 "seed": "exp-seed", "hashVersion": 2,
                 "values": [
                     {"value": "blue", "weight": 0.5, "name": "Blue"},
                     {"value": "green", "weight": 0.5, "name": "Green"}
                 ]}
            ]}}
        },
        {
            "id": "guarded",
            "valueType": "string",
            "defaultValue": "fallback",
            "environments": {"prod": {"enabled": true, "rules": [
                {"id": "r-bad", "type": "force", "value": "x", "condition": {"a": {"$bogus": 1}}},
                {"id": "r-good", "type": "force", "value": "fallback"}
            ]}}
        },
        {
            "id": "typed-mismatch",
            "valueType": "number",
            "defaultValue": "0",
            "environments": {"prod": {"enabled": true, "rules": [
                {"id": "invalid", "type": "force", "value": "forty-two"},
                {"id": "valid", "type": "force", "value": "7"}
            ]}}
        },
        {
            "id": "beta",
            "defaultValue": "false",
            "environments": {"prod": {"enabled": true, "rules": [
                {"id": "not-beta", "type": "force", "value": "true",
                 "savedGroupTargeting": [{"matchType": "none", "savedGroups": ["beta-testers"]}]}
            ]}}
        },
        {
            "id": "group-targeted",
            "valueType": "string",
            "defaultValue": "default",
            "environments": {"prod": {"enabled": true, "rules": [
                {"id": "listed", "type": "force", "value": "listed",
                 "condition": {"id": {"$inGroup": "beta-testers"}}},
                {"id": "members", "type": "force", "value": "members",
                 "savedGroupTargeting": [{"matchType": "any", "savedGroups": ["us-users"]}]},
                {"id": "everyone", "type": "force", "value": "everyone"}
            ]}}
        },
        {
            "id": "scheduled",
            "valueType": "string",
            "defaultValue": "off",
            "environments": {"prod": {"enabled": true, "rules": [
                {"id": "expired", "type": "force", "value": "expired", "scheduleRules": [
                    {"enabled": true, "timestamp": "2024-01-01T00:00:00Z"},
                    {"enabled": false, "timestamp": "2024-02-01T00:00:00Z"}
                ]},
                {"id": "in-window", "type": "force", "value": "scheduled", "scheduleRules": [
                    {"enabled": true, "timestamp": "2024-05-01T00:00:00Z"},
                    {"enabled": false, "timestamp": "2024-07-01T00:00:00Z"}
                ]}
            ]}}
        },
        {
            "id": "parent",
            "defaultValue": "false",
            "environments": {"prod": {"enabled": true, "rules": [
                {"id": "on", "type": "force", "value": "true"}
            ]}}
        },
        {
            "id": "disabled-parent",
            "defaultValue": "true",
            "environments": {"prod": {"enabled": false}}
        },
        {
            "id": "dependent",
            "defaultValue": "false",
            "environments": {"prod": {"enabled": true, "rules": [
                {"id": "when-missing", "type": "force", "value": "false",
                 "prerequisites": [{"id": "missing"}]},
                {"id": "when-parent", "type": "force", "value": "true",
                 "prerequisites": [{"id": "parent", "condition": {"value": true}}]}
            ]}}
        },
        {
            "id": "gated",
            "defaultValue": "false",
            "prerequisites": [{"id": "disabled-parent"}],
            "environments": {"prod": {"enabled": true, "rules": [
                {"id": "on", "type": "force", "value": "true"}
            ]}}
        },
        {
            "id": "cycle-a",
            "defaultValue": "false",
            "prerequisites": [{"id": "cycle-b"}],
            "environments": {"prod": {"enabled": true}}
        },
        {
            "id": "cycle-b",
            "defaultValue": "false",
            "prerequisites": [{"id": "cycle-a"}],
            "environments": {"prod": {"enabled": true}}
        },
        {
            "id": "experiment-ref",
            "valueType": "string",
            "defaultValue": "off",
            "environments": {
                "prod": {"enabled": true, "rules": [
                    {"id": "ref-running", "type": "experiment-ref", "experimentId": "exp-running",
                     "variations": [{"variationId": "v0", "value": "a"},
                                    {"variationId": "v1", "value": "b"}]}
                ]},
                "staging": {"enabled": true, "rules": [
                    {"id": "ref-released", "type": "experiment-ref", "experimentId": "exp-released",
                     "variations": [{"variationId": "v0", "value": "a"},
                                    {"variationId": "v1", "value": "b"}]}
                ]},
                "dev": {"enabled": true, "rules": [
                    {"id": "ref-draft", "type": "experiment-ref", "experimentId": "exp-draft",
                     "variations": [{"variationId": "v0", "value": "a"},
                                    {"variationId": "v1", "value": "b"}]}
                ]}
            }
        },
        {
            "id": "safe",
            "defaultValue": "false",
            "environments": {
                "prod": {"enabled": true, "rules": [
                    {"id": "safe-running", "type": "safe-rollout", "safeRolloutId": "sr-1",
                     "seed": "exp-seed", "hashVersion": 2, "status": "running",
                     "controlValue": "false", "variationValue": "true"}
                ]},
                "staging": {"enabled": true, "rules": [
                    {"id": "safe-released", "type": "safe-rollout", "safeRolloutId": "sr-1",
                     "status": "released", "controlValue": "false", "variationValue": "true"}
                ]},
                "dev": {"enabled": true, "rules": [
                    {"id": "safe-rolled-back", "type": "safe-rollout", "safeRolloutId": "sr-1",
                     "status": "rolled-back", "controlValue": "false", "variationValue": "true"}
                ]}
            }
        },
        {
            "id": "stale-one-sided",
            "defaultValue": "false",
            "dateUpdated": "2024-01-01T00:00:00Z",
            "environments": {"prod": {"enabled": true, "rules": [
                {"id": "everyone", "type": "force", "value": "true", "condition": {},
                 "savedGroupTargeting": []}
            ]}}
        },
        {
            "id": "stale-no-rules",
            "defaultValue": "false",
            "environments": {"prod": {"enabled": true, "rules": [
                {"id": "off", "type": "force", "value": "true", "enabled": false}
            ]}}
        },
        {
            "id": "stale-draft",
            "defaultValue": "false",
            "environments": {
                "prod": {"enabled": true, "draft": {"dateUpdated": "2024-05-25T00:00:00Z"}},
                "staging": {"enabled": true,
                    "rules": [{"id": "us", "type": "force", "value": "true",
                               "condition": {"country": "US"}}],
                    "draft": {"dateUpdated": "2024-01-01T00:00:00Z"}}
            }
        },
        {
            "id": "fresh",
            "defaultValue": "false",
            "dateUpdated": "2024-05-30T00:00:00Z",
            "environments": {"prod": {"enabled": true, "rules": [
                {"id": "everyone", "type": "force", "value": "true"}
            ]}}
        },
        {
            "id": "forever",
            "defaultValue": "false",
            "neverStale": true,
            "environments": {"prod": {"enabled": false}}
        },
        {
            "id": "all-true",
            "defaultValue": "true",
            "environments": {"prod": {"enabled": true, "rules": [
                {"id": "some", "type": "rollout", "value": "true", "coverage": 0.5},
                {"id": "us", "type": "force", "value": "true", "condition": {"country": "US"}}
            ]}}
        }
    ]
}"#;
