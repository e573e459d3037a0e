use std::time::Duration;

use serde::Deserialize;

const fn default_poll_interval() -> u64 {
    1000
}

const fn default_batch_size() -> usize {
    100
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_shutdown_grace() -> u64 {
    2000
}

fn default_notification_topic() -> String {
    "email:received".to_string()
}

/// Settings for the job queue worker
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkerConfig {
    /// How often to poll for pending jobs (in milliseconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Most jobs fetched per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// A job that has failed this many times is marked failed and never retried
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// How long an in-flight batch may keep running after shutdown (in milliseconds)
    ///
    /// Jobs not finished by then stay pending and are picked up on restart.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Topic the received-mail notification is published on
    #[serde(default = "default_notification_topic")]
    pub notification_topic: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            shutdown_grace_ms: default_shutdown_grace(),
            notification_topic: default_notification_topic(),
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
