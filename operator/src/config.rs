//! Runtime configuration of the operator.
use std::time::Duration;

use crate::testrun::job::JobImageConfig;

/// Settings shared by every reconcile pass.
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Maximum number of test runs reconciled at the same time.
    pub concurrency: u16,
    /// Deadline of a single reconcile pass.
    pub reconcile_timeout: Duration,
    /// Delay before looking at a running job again when no event arrives.
    pub resync_interval: Duration,
    /// First delay after a failed reconcile.
    pub backoff_base: Duration,
    /// Upper bound of the delay after repeated failures.
    pub backoff_max: Duration,
    /// Attempts of a status write before a conflict is reported.
    pub status_max_attempts: usize,
    /// Timeout of a notification request.
    pub notification_timeout: Duration,
    /// Default images of the jobs.
    pub images: JobImageConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            reconcile_timeout: Duration::from_secs(60),
            resync_interval: Duration::from_secs(30),
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            status_max_attempts: 3,
            notification_timeout: Duration::from_secs(10),
            images: JobImageConfig::default(),
        }
    }
}
