use serde::Deserialize;

use crate::util::default_true;

const DEFAULT_STALE_AFTER_DAYS: u32 = 14;
const DEFAULT_ABANDONED_DRAFT_AFTER_DAYS: u32 = 30;

/// Engine-wide settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Global switch for sticky bucketing. Individual experiments can still opt out.
    #[serde(default = "default_true")]
    pub sticky_bucketing: bool,
    /// A feature updated within this many days is never reported as stale.
    #[serde(default = "default_stale_after_days")]
    pub stale_after_days: u32,
    /// A draft untouched for this many days is considered abandoned.
    #[serde(default = "default_abandoned_draft_after_days")]
    pub abandoned_draft_after_days: u32,
}

fn default_stale_after_days() -> u32 {
    DEFAULT_STALE_AFTER_DAYS
}

fn default_abandoned_draft_after_days() -> u32 {
    DEFAULT_ABANDONED_DRAFT_AFTER_DAYS
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            sticky_bucketing: true,
            stale_after_days: DEFAULT_STALE_AFTER_DAYS,
            abandoned_draft_after_days: DEFAULT_ABANDONED_DRAFT_AFTER_DAYS,
        }
    }
}

impl EngineConfig {
    pub fn with_sticky_bucketing(mut self, enabled: bool) -> Self {
        self.sticky_bucketing = enabled;
        self
    }

    pub fn with_stale_after_days(mut self, days: u32) -> Self {
        self.stale_after_days = days;
        self
    }

    pub fn with_abandoned_draft_after_days(mut self, days: u32) -> Self {
        self.abandoned_draft_after_days = days;
        self
    }
}
