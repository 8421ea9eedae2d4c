//! Worker pool configuration.

use std::time::Duration;

use jobmill_protocols::DEFAULT_QUEUE;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Prefix of worker ids, `{server_name}:{slot}`.
    pub server_name: String,
    /// Number of concurrent execution slots.
    pub count: usize,
    /// Queues polled by every slot, highest priority first.
    pub queues: Vec<String>,
    /// Pause between polls when every queue is empty.
    pub poll_interval: Duration,
    /// Invisibility window of a leased job.
    pub lease: Duration,
    /// How often a running job's lease is renewed.
    pub heartbeat_interval: Duration,
    /// How long shutdown waits for running jobs.
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let lease = Duration::from_secs(300);
        Self {
            server_name: format!("jobmill-{}", std::process::id()),
            count: 4,
            queues: vec![DEFAULT_QUEUE.to_string()],
            poll_interval: Duration::from_secs(1),
            lease,
            heartbeat_interval: lease / 3,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the lease; the heartbeat follows at a third of it.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self.heartbeat_interval = lease / 3;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn worker_id(&self, slot: usize) -> String {
        format!("{}:{}", self.server_name, slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_heartbeat_is_a_third_of_the_lease() {
        let config = WorkerConfig::default();
        assert_eq!(config.lease, Duration::from_secs(300));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(100));
        assert_eq!(config.queues, vec!["default".to_string()]);
    }

    #[test]
    fn test_worker_id() {
        let config = WorkerConfig::default().with_server_name("host-a");
        assert_eq!(config.worker_id(3), "host-a:3");
    }

    #[test]
    fn test_with_lease_moves_heartbeat() {
        let config = WorkerConfig::default().with_lease(Duration::from_secs(9));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(3));
    }
}
