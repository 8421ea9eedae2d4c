//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do with cron boundaries missed while no scheduler was running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    /// Fire once, for the latest missed boundary.
    #[default]
    Coalesce,
    /// Fire once per missed boundary.
    FireAll,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often due schedule entries are scanned.
    pub poll_interval: Duration,
    pub misfire: MisfirePolicy,
    /// How often expired leases and the retention window are checked.
    pub reap_interval: Duration,
    /// Exhausted failures older than this are deleted. `None` keeps them.
    pub failed_retention: Option<Duration>,
    /// Entries or jobs handled per storage query.
    pub batch_size: usize,
    /// Upper bound on boundaries fired for one entry under `FireAll`.
    pub max_catch_up: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            misfire: MisfirePolicy::default(),
            reap_interval: Duration::from_secs(30),
            failed_retention: None,
            batch_size: 100,
            max_catch_up: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_misfire(mut self, misfire: MisfirePolicy) -> Self {
        self.misfire = misfire;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn with_failed_retention(mut self, retention: Option<Duration>) -> Self {
        self.failed_retention = retention;
        self
    }
}
