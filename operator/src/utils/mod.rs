//! Utils is shared functions and constants for the controller

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, PoisonError},
    time::Duration,
};

use k8s_openapi::{
    api::core::v1::EnvVar,
    chrono::{DateTime, Utc},
};
use kube::client::Client;

use crate::{
    config::OperatorConfig,
    error::Result,
    testrun::{
        job::{JobFactory, TemplateJobFactory},
        notification::{Notifier, WebhookNotifier},
        status::{KubeStatusUpdater, StatusUpdater},
        storage::{CloudStorageResolver, ProviderResolver},
        workloads::{KubeWorkloads, Workloads},
    },
};

/// Operator Context
///
/// Holds every collaborator the reconciler drives, so each can be replaced in tests.
pub struct Context<W, F, S, N, U> {
    /// Access to owned jobs
    pub workloads: W,
    /// Builds job specs
    pub job_factory: F,
    /// Resolves report storage locations
    pub storage: S,
    /// Delivers notifications
    pub notifier: N,
    /// Persists status
    pub status: U,
    /// Deadline of a single reconcile pass
    pub reconcile_timeout: Duration,
    /// Delay before looking at a running job again
    pub resync_interval: Duration,
    /// Per object error backoff
    pub backoff: Backoff,
}

impl Context<KubeWorkloads, TemplateJobFactory, ProviderResolver, WebhookNotifier, KubeStatusUpdater<UtcClock>> {
    /// Create new context
    pub fn new(k_client: Client, config: &OperatorConfig) -> Result<Self> {
        Ok(Self::from_parts(
            KubeWorkloads::new(k_client.clone()),
            TemplateJobFactory::new(config.images.clone()),
            ProviderResolver,
            WebhookNotifier::new(k_client.clone(), config.notification_timeout)?,
            KubeStatusUpdater::new(k_client, UtcClock, config.status_max_attempts),
            config,
        ))
    }
}

impl<W, F, S, N, U> Context<W, F, S, N, U>
where
    W: Workloads,
    F: JobFactory,
    S: CloudStorageResolver,
    N: Notifier,
    U: StatusUpdater,
{
    /// Assemble a context from explicit collaborators
    pub fn from_parts(
        workloads: W,
        job_factory: F,
        storage: S,
        notifier: N,
        status: U,
        config: &OperatorConfig,
    ) -> Self {
        Self {
            workloads,
            job_factory,
            storage,
            notifier,
            status,
            reconcile_timeout: config.reconcile_timeout,
            resync_interval: config.resync_interval,
            backoff: Backoff::new(config.backoff_base, config.backoff_max),
        }
    }
}

/// Provides the current time.
pub trait Clock: Send + Sync {
    /// Report the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Provides the current time using real time.
pub struct UtcClock;
impl Clock for UtcClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Exponential backoff tracked per object key.
///
/// The delay doubles with each consecutive failure up to `max` and starts over after `reset`.
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl Backoff {
    /// Create a backoff starting at `base` and capped at `max`
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for `key` and report how long to wait before retrying.
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(key.to_owned()).or_default();
        let delay = self
            .base
            .saturating_mul(1u32 << (*count).min(16))
            .min(self.max);
        *count = count.saturating_add(1);
        delay
    }

    /// Forget previous failures of `key`.
    pub fn reset(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

/// Apply override env vars to an existing env var list
pub fn override_env_vars(env: &mut Vec<EnvVar>, overrides: &Option<BTreeMap<String, String>>) {
    if let Some(override_env) = &overrides {
        override_env.iter().for_each(|(key, value)| {
            if let Some((pos, _)) = env.iter().enumerate().find(|(_, var)| &var.name == key) {
                env.swap_remove(pos);
            }
            env.push(EnvVar {
                name: key.to_string(),
                value: Some(value.to_string()),
                ..Default::default()
            })
        });
        // Sort env vars so we can have stable tests
        env.sort_unstable_by(|a, b| a.name.cmp(&b.name));
    }
}
