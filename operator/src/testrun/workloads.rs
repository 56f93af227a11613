//! Create, observe and delete the jobs owned by a test run.
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::{
    api::{DeleteParams, PostParams, PropagationPolicy},
    Api, Client, ResourceExt,
};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Observed state of an owned job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadState {
    /// Pods are still running or pending.
    Active,
    /// Every completion succeeded.
    Succeeded,
    /// The job will not complete.
    Failed {
        /// Reason reported by the job, if any.
        reason: Option<String>,
    },
}

impl WorkloadState {
    /// Derive the state from a job object.
    pub fn from_job(job: &Job) -> Self {
        let Some(status) = &job.status else {
            return WorkloadState::Active;
        };
        for condition in status.conditions.iter().flatten() {
            if condition.status != "True" {
                continue;
            }
            match condition.type_.as_str() {
                "Failed" => {
                    return WorkloadState::Failed {
                        reason: condition.reason.clone(),
                    }
                }
                "Complete" => return WorkloadState::Succeeded,
                _ => {}
            }
        }
        let spec = job.spec.as_ref();
        let completions = spec.and_then(|spec| spec.completions).unwrap_or(1);
        let backoff_limit = spec.and_then(|spec| spec.backoff_limit).unwrap_or(6);
        if status.succeeded.unwrap_or_default() >= completions {
            WorkloadState::Succeeded
        } else if status.failed.unwrap_or_default() > backoff_limit {
            WorkloadState::Failed {
                reason: Some("BackoffLimitExceeded".to_owned()),
            }
        } else {
            WorkloadState::Active
        }
    }
}

/// Access to the jobs of a test run.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Workloads: Send + Sync {
    /// Create the job. A job of the same name that already exists is success.
    async fn create(&self, job: Job) -> Result<()>;
    /// Observe a job, `None` when it does not exist.
    async fn state(&self, namespace: &str, name: &str) -> Result<Option<WorkloadState>>;
    /// Delete a job and its pods. A missing job is success.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Jobs stored in the cluster.
pub struct KubeWorkloads {
    k_client: Client,
}

impl KubeWorkloads {
    /// Create workloads backed by the given client.
    pub fn new(k_client: Client) -> Self {
        Self { k_client }
    }
}

#[async_trait]
impl Workloads for KubeWorkloads {
    async fn create(&self, job: Job) -> Result<()> {
        let namespace = job.namespace().ok_or(Error::MissingNamespace)?;
        let jobs: Api<Job> = Api::namespaced(self.k_client.clone(), &namespace);
        match jobs.create(&PostParams::default(), &job).await {
            Ok(job) => {
                info!(job = %job.name_any(), %namespace, "created job");
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 409 => {
                debug!(job = %job.name_any(), %namespace, "job already exists");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn state(&self, namespace: &str, name: &str) -> Result<Option<WorkloadState>> {
        let jobs: Api<Job> = Api::namespaced(self.k_client.clone(), namespace);
        Ok(jobs.get_opt(name).await?.as_ref().map(WorkloadState::from_job))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let jobs: Api<Job> = Api::namespaced(self.k_client.clone(), namespace);
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match jobs.delete(name, &params).await {
            Ok(_) => {
                info!(job = name, namespace, "deleted job");
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
