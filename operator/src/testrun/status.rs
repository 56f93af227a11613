//! Persists the status of a test run.
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{api::PostParams, Api, Client, ResourceExt};
use testrun_common::outcome::Outcome;
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    testrun::{Phase, TestRun, TestRunStatus},
    utils::Clock,
};

/// Set of status fields to write. Unset fields keep their persisted value.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StatusPatch {
    /// Next phase, must follow the state graph.
    pub phase: Option<Phase>,
    /// Condition reason
    pub reason: Option<String>,
    /// Condition message
    pub message: Option<String>,
    /// Result of the run
    pub outcome: Option<Outcome>,
    /// Name of the runner job
    pub runner_job_ref: Option<String>,
    /// Name of the report job
    pub report_job_ref: Option<String>,
    /// Bucket reference of the results
    pub report_storage_path: Option<String>,
    /// Public URL of the report
    pub report_url: Option<String>,
    /// Only ever moves from false to true.
    pub notification_sent: Option<bool>,
    /// Phase the writer based its decision on. The patch is dropped when the
    /// persisted phase differs.
    pub observed: Option<Phase>,
}

impl StatusPatch {
    /// Move to `phase` with the given condition.
    pub fn transition(phase: Phase, reason: &str, message: impl Into<String>) -> Self {
        Self {
            phase: Some(phase),
            reason: Some(reason.to_owned()),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Record a condition without changing phase.
    pub fn condition(reason: &str, message: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.to_owned()),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Set the outcome.
    pub fn with_outcome(self, outcome: Outcome) -> Self {
        Self {
            outcome: Some(outcome),
            ..self
        }
    }

    /// Record the runner job name.
    pub fn with_runner_job(self, name: String) -> Self {
        Self {
            runner_job_ref: Some(name),
            ..self
        }
    }

    /// Record the report job name.
    pub fn with_report_job(self, name: String) -> Self {
        Self {
            report_job_ref: Some(name),
            ..self
        }
    }

    /// Record where results and report live.
    pub fn with_storage(self, path: String, url: String) -> Self {
        Self {
            report_storage_path: Some(path),
            report_url: Some(url),
            ..self
        }
    }

    /// Mark the notification delivered.
    pub fn with_notification_sent(self) -> Self {
        Self {
            notification_sent: Some(true),
            ..self
        }
    }

    /// Only apply the patch while the persisted phase is still `phase`.
    pub fn observed_in(self, phase: Phase) -> Self {
        Self {
            observed: Some(phase),
            ..self
        }
    }

    /// Apply the patch onto `status` and report whether anything was applied.
    ///
    /// Leaves `status` untouched when the persisted phase moved past the observed one.
    /// Fails without modifying `status` when the phase would leave the state graph.
    pub fn apply(self, status: &mut TestRunStatus, now: Time) -> Result<bool> {
        if let Some(observed) = self.observed {
            if observed != status.phase {
                return Ok(false);
            }
        }
        if let Some(phase) = self.phase {
            if phase != status.phase {
                if !status.phase.can_advance_to(phase) {
                    return Err(Error::PhaseRegression {
                        from: status.phase,
                        to: phase,
                    });
                }
                status.phase = phase;
                status.last_transition_time = Some(now);
            }
        }
        if let Some(reason) = self.reason {
            status.reason = Some(reason);
        }
        if let Some(message) = self.message {
            status.message = Some(message);
        }
        if let Some(outcome) = self.outcome {
            status.outcome = Some(outcome);
        }
        if let Some(name) = self.runner_job_ref {
            status.runner_job_ref = Some(name);
        }
        if let Some(name) = self.report_job_ref {
            status.report_job_ref = Some(name);
        }
        if let Some(path) = self.report_storage_path {
            status.report_storage_path = Some(path);
        }
        if let Some(url) = self.report_url {
            status.report_url = Some(url);
        }
        if let Some(sent) = self.notification_sent {
            status.notification_sent = status.notification_sent || sent;
        }
        Ok(true)
    }
}

/// Reads and writes the persisted status of a test run.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusUpdater: Send + Sync {
    /// Latest persisted status.
    async fn current(&self, run: &TestRun) -> Result<TestRunStatus>;
    /// Apply `patch` onto the latest persisted status and return the written status.
    /// `None` when the persisted phase is no longer the one the patch observed.
    async fn update(&self, run: &TestRun, patch: StatusPatch) -> Result<Option<TestRunStatus>>;
}

/// Writes the status sub-resource, retrying on version conflicts.
pub struct KubeStatusUpdater<C> {
    k_client: Client,
    clock: C,
    max_attempts: usize,
}

impl<C: Clock> KubeStatusUpdater<C> {
    /// Create an updater giving up after `max_attempts` conflicting writes.
    pub fn new(k_client: Client, clock: C, max_attempts: usize) -> Self {
        Self {
            k_client,
            clock,
            max_attempts: max_attempts.max(1),
        }
    }

    fn api(&self, run: &TestRun) -> Result<Api<TestRun>> {
        let namespace = run.namespace().ok_or(Error::MissingNamespace)?;
        Ok(Api::namespaced(self.k_client.clone(), &namespace))
    }
}

#[async_trait]
impl<C: Clock> StatusUpdater for KubeStatusUpdater<C> {
    async fn current(&self, run: &TestRun) -> Result<TestRunStatus> {
        let latest = self.api(run)?.get_status(&run.name_any()).await?;
        Ok(latest.status.unwrap_or_default())
    }

    async fn update(&self, run: &TestRun, patch: StatusPatch) -> Result<Option<TestRunStatus>> {
        let api = self.api(run)?;
        let name = run.name_any();
        for attempt in 1..=self.max_attempts {
            let mut latest = api.get_status(&name).await?;
            let mut status = latest.status.take().unwrap_or_default();
            if !patch.clone().apply(&mut status, Time(self.clock.now()))? {
                debug!(%name, phase = %status.phase, "status moved on, skipping write");
                return Ok(None);
            }
            latest.status = Some(status);

            let data = serde_json::to_vec(&latest)?;
            match api.replace_status(&name, &PostParams::default(), data).await {
                Ok(written) => {
                    debug!(%name, attempt, "status written");
                    return Ok(Some(written.status.unwrap_or_default()));
                }
                Err(kube::Error::Api(err)) if err.code == 409 => {
                    warn!(%name, attempt, "status write conflicted, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(Error::Conflict {
            attempts: self.max_attempts,
        })
    }
}
