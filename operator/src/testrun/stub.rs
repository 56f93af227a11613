//! Helper methods only available for tests
use std::{
    collections::BTreeMap,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use k8s_openapi::{
    api::batch::v1::Job,
    apimachinery::pkg::apis::meta::v1::Time,
    chrono::{TimeZone, Utc},
};
use kube::ResourceExt;

use crate::{
    error::{Error, Result},
    testrun::{
        status::{StatusPatch, StatusUpdater},
        workloads::{WorkloadState, Workloads},
        TestRun, TestRunSpec, TestRunStatus, TestScenarioSpec,
    },
};

/// Creation time of the test run built by `TestRun::test`.
pub const CREATED_AT_SECS: i64 = 1_700_000_000;

// Add tests specific implementation to the TestRun
impl TestRun {
    /// A normal test run named `test` in namespace `test`
    pub fn test() -> Self {
        let mut run = TestRun::new(
            "test",
            TestRunSpec {
                test_scenario: TestScenarioSpec {
                    simulation_class: "MyBasicSimulation".to_owned(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        run.metadata.namespace = Some("test".to_owned());
        run.metadata.uid = Some("3b5ad2c0-7f4e-4a46-9a3e-6c1d0c3f2e11".to_owned());
        run.metadata.creation_timestamp = Some(Time(
            Utc.timestamp_opt(CREATED_AT_SECS, 0)
                .single()
                .expect("valid timestamp"),
        ));
        run
    }
    /// Modify a test run to have an expected status
    pub fn with_status(self, status: TestRunStatus) -> Self {
        Self {
            status: Some(status),
            ..self
        }
    }
}

/// In memory jobs. Created jobs stay `Active` until told otherwise.
#[derive(Default)]
pub struct FakeWorkloads {
    jobs: Mutex<BTreeMap<String, (Job, WorkloadState)>>,
    creates: Mutex<usize>,
    deleted: Mutex<Vec<String>>,
}

impl FakeWorkloads {
    /// Set the observed state of an existing job.
    pub fn set_state(&self, name: &str, state: WorkloadState) {
        if let Some(entry) = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(name)
        {
            entry.1 = state;
        }
    }
    /// Remove a job without going through `delete`.
    pub fn vanish(&self, name: &str) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }
    /// The job stored under `name`.
    pub fn job(&self, name: &str) -> Option<Job> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|(job, _)| job.clone())
    }
    /// Names of the stored jobs.
    pub fn job_names(&self) -> Vec<String> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
    /// Number of create calls, including ones for existing jobs.
    pub fn creates(&self) -> usize {
        *self.creates.lock().unwrap_or_else(PoisonError::into_inner)
    }
    /// Names passed to delete, in order.
    pub fn deleted(&self) -> Vec<String> {
        self.deleted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Workloads for FakeWorkloads {
    async fn create(&self, job: Job) -> Result<()> {
        *self.creates.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(job.name_any())
            .or_insert((job, WorkloadState::Active));
        Ok(())
    }

    async fn state(&self, _namespace: &str, name: &str) -> Result<Option<WorkloadState>> {
        Ok(self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|(_, state)| state.clone()))
    }

    async fn delete(&self, _namespace: &str, name: &str) -> Result<()> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        self.deleted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name.to_owned());
        Ok(())
    }
}

/// In memory status sub-resource of a single test run.
pub struct FakeStatus {
    object: Mutex<TestRun>,
}

impl FakeStatus {
    /// Persist `run` as the stored object.
    pub fn new(run: TestRun) -> Self {
        Self {
            object: Mutex::new(run),
        }
    }
    /// The stored object, as the controller would receive it.
    pub fn object(&self) -> TestRun {
        self.object
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
    /// The stored status.
    pub fn status(&self) -> TestRunStatus {
        self.object().status.unwrap_or_default()
    }
}

#[async_trait]
impl StatusUpdater for FakeStatus {
    async fn current(&self, _run: &TestRun) -> Result<TestRunStatus> {
        Ok(self.status())
    }

    async fn update(&self, run: &TestRun, patch: StatusPatch) -> Result<Option<TestRunStatus>> {
        let mut object = self.object.lock().unwrap_or_else(PoisonError::into_inner);
        if object.name_any() != run.name_any() {
            return Err(Error::Config(format!("unknown test run {}", run.name_any())));
        }
        let mut status = object.status.clone().unwrap_or_default();
        let applied = patch.apply(
            &mut status,
            Time(
                Utc.timestamp_opt(CREATED_AT_SECS + 60, 0)
                    .single()
                    .expect("valid timestamp"),
            ),
        )?;
        if !applied {
            return Ok(None);
        }
        object.status = Some(status.clone());
        Ok(Some(status))
    }
}
