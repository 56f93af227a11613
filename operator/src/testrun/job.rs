//! Builds the runner and report jobs of a test run.
use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        batch::v1::{Job, JobSpec},
        core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements},
    },
    apimachinery::pkg::api::resource::Quantity,
};
use kube::{api::ObjectMeta, Resource, ResourceExt};
use testrun_common::workload;

use crate::{
    error::{Error, Result},
    labels::job_labels,
    testrun::{storage::StorageInfo, ResourceLimitsSpec, TestRun},
    utils::override_env_vars,
};

/// `app` label of runner jobs and their pods.
pub const RUNNER_APP: &str = "testrun-runner";
/// `app` label of report jobs and their pods.
pub const REPORTER_APP: &str = "testrun-reporter";

/// Name of the runner job of a test run.
pub fn runner_job_name(test_run: &str) -> String {
    format!("{test_run}-runner")
}

/// Name of the report job of a test run.
pub fn reporter_job_name(test_run: &str) -> String {
    format!("{test_run}-reporter")
}

/// Number of runner replicas for a declared parallelism.
pub fn normalized_parallelism(parallelism: i32) -> Result<i32> {
    if parallelism < 0 {
        return Err(Error::Config(format!(
            "testScenario.parallelism must not be negative, got {parallelism}"
        )));
    }
    Ok(parallelism.max(1))
}

/// Configuration for job images.
#[derive(Clone, Debug)]
pub struct JobImageConfig {
    /// Image of the runner job.
    pub runner_image: String,
    /// Image of the report job.
    pub reporter_image: String,
    /// Pull policy for both images.
    pub image_pull_policy: String,
}

impl Default for JobImageConfig {
    fn default() -> Self {
        Self {
            runner_image: "ghcr.io/loadtest/runner:latest".to_owned(),
            reporter_image: "ghcr.io/loadtest/reporter:latest".to_owned(),
            image_pull_policy: "IfNotPresent".to_owned(),
        }
    }
}

impl JobImageConfig {
    /// Apply the image overrides of a test run.
    pub fn for_run(&self, run: &TestRun) -> Self {
        let spec = &run.spec;
        Self {
            runner_image: spec
                .image
                .to_owned()
                .unwrap_or_else(|| self.runner_image.clone()),
            reporter_image: spec
                .reporter_image
                .to_owned()
                .unwrap_or_else(|| self.reporter_image.clone()),
            image_pull_policy: spec
                .image_pull_policy
                .to_owned()
                .unwrap_or_else(|| self.image_pull_policy.clone()),
        }
    }
}

/// Builds the jobs of a test run. Implementations must not perform I/O.
pub trait JobFactory: Send + Sync {
    /// Job executing the simulation on every replica.
    fn runner_job(&self, run: &TestRun, storage: &StorageInfo) -> Result<Job>;
    /// Job rendering the report from the runner results.
    fn report_job(&self, run: &TestRun, storage: &StorageInfo) -> Result<Job>;
}

/// Builds jobs from a fixed pod template.
pub struct TemplateJobFactory {
    images: JobImageConfig,
}

impl TemplateJobFactory {
    /// Create a factory with default images.
    pub fn new(images: JobImageConfig) -> Self {
        Self { images }
    }
}

impl JobFactory for TemplateJobFactory {
    fn runner_job(&self, run: &TestRun, storage: &StorageInfo) -> Result<Job> {
        let scenario = &run.spec.test_scenario;
        let parallelism = normalized_parallelism(scenario.parallelism)?;
        let images = self.images.for_run(run);

        let mut env = vec![
            env_var(workload::TEST_RUN_NAME, run.name_any()),
            env_var(workload::SIMULATION_CLASS, &scenario.simulation_class),
            env_var(
                workload::SIMULATION_DATA,
                serde_json::to_string(&scenario.simulation_data)?,
            ),
        ];
        if run.spec.generate_report && !storage.is_disabled() {
            env.push(env_var(workload::RESULTS_STORAGE_PATH, &storage.bucket));
            override_env_vars(&mut env, &run.spec.cloud_storage.env);
        }
        override_env_vars(&mut env, &scenario.env);

        let container = Container {
            name: "runner".to_owned(),
            image: Some(images.runner_image),
            image_pull_policy: Some(images.image_pull_policy),
            env: Some(env),
            resources: scenario.resources.as_ref().and_then(resource_requirements),
            ..Default::default()
        };
        Ok(job(
            run,
            runner_job_name(&run.name_any()),
            RUNNER_APP,
            parallelism,
            container,
        ))
    }

    fn report_job(&self, run: &TestRun, storage: &StorageInfo) -> Result<Job> {
        if storage.is_disabled() {
            return Err(Error::Config(
                "generateReport requires cloudStorage.provider to be set".to_owned(),
            ));
        }
        let images = self.images.for_run(run);
        let mut env = vec![
            env_var(workload::TEST_RUN_NAME, run.name_any()),
            env_var(workload::RESULTS_STORAGE_PATH, &storage.bucket),
            env_var(workload::REPORT_URL, &storage.report_url),
        ];
        override_env_vars(&mut env, &run.spec.cloud_storage.env);

        let container = Container {
            name: "reporter".to_owned(),
            image: Some(images.reporter_image),
            image_pull_policy: Some(images.image_pull_policy),
            env: Some(env),
            ..Default::default()
        };
        Ok(job(
            run,
            reporter_job_name(&run.name_any()),
            REPORTER_APP,
            1,
            container,
        ))
    }
}

fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_owned(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn resource_requirements(spec: &ResourceLimitsSpec) -> Option<ResourceRequirements> {
    let mut quantities: BTreeMap<String, Quantity> = BTreeMap::new();
    if let Some(cpu) = &spec.cpu {
        quantities.insert("cpu".to_owned(), cpu.clone());
    }
    if let Some(memory) = &spec.memory {
        quantities.insert("memory".to_owned(), memory.clone());
    }
    if quantities.is_empty() {
        return None;
    }
    Some(ResourceRequirements {
        limits: Some(quantities.clone()),
        requests: Some(quantities),
        ..Default::default()
    })
}

// Replicas never restart and the job never retries: a single failed replica fails the run.
fn job(run: &TestRun, name: String, app: &str, parallelism: i32, container: Container) -> Job {
    let labels = job_labels(&run.name_any(), app);
    Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: run.namespace(),
            owner_references: run.controller_owner_ref(&()).map(|oref| vec![oref]),
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(JobSpec {
            parallelism: Some(parallelism),
            completions: Some(parallelism),
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    restart_policy: Some("Never".to_owned()),
                    service_account_name: run.spec.service_account_name.clone(),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::{api::batch::v1::Job, apimachinery::pkg::api::resource::Quantity};

    use super::{JobFactory, JobImageConfig, TemplateJobFactory, RUNNER_APP};
    use crate::testrun::{storage::StorageInfo, ResourceLimitsSpec, TestRun};

    fn factory() -> TemplateJobFactory {
        TemplateJobFactory::new(JobImageConfig::default())
    }

    fn storage() -> StorageInfo {
        StorageInfo {
            bucket: "s3:results/test/1700000000".to_owned(),
            report_url: "https://results.s3.amazonaws.com/test/1700000000/index.html".to_owned(),
        }
    }

    fn env(job: &Job) -> BTreeMap<String, String> {
        job.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
            .env
            .as_ref()
            .unwrap()
            .iter()
            .map(|var| (var.name.clone(), var.value.clone().unwrap_or_default()))
            .collect()
    }

    #[test]
    fn parallelism_and_completions_match() {
        for (declared, expected) in [(0, 1), (1, 1), (2, 2), (5, 5)] {
            let mut run = TestRun::test();
            run.spec.test_scenario.parallelism = declared;
            let job = factory()
                .runner_job(&run, &StorageInfo::disabled())
                .unwrap();
            let spec = job.spec.unwrap();
            assert_eq!(spec.parallelism, Some(expected), "parallelism {declared}");
            assert_eq!(spec.completions, Some(expected), "completions {declared}");
        }
    }

    #[test]
    fn negative_parallelism_is_config_error() {
        let mut run = TestRun::test();
        run.spec.test_scenario.parallelism = -1;
        let err = factory()
            .runner_job(&run, &StorageInfo::disabled())
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn runner_never_restarts() {
        let job = factory()
            .runner_job(&TestRun::test(), &StorageInfo::disabled())
            .unwrap();
        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(
            spec.template.spec.unwrap().restart_policy.as_deref(),
            Some("Never")
        );
    }

    #[test]
    fn runner_is_owned_and_labelled() {
        let job = factory()
            .runner_job(&TestRun::test(), &StorageInfo::disabled())
            .unwrap();
        assert_eq!(job.metadata.name.as_deref(), Some("test-runner"));
        assert_eq!(job.metadata.namespace.as_deref(), Some("test"));
        let orefs = job.metadata.owner_references.unwrap();
        assert_eq!(orefs.len(), 1);
        assert_eq!(orefs[0].kind, "TestRun");
        assert_eq!(orefs[0].name, "test");
        assert_eq!(orefs[0].controller, Some(true));
        let labels = job.metadata.labels.unwrap();
        assert_eq!(labels["managed-by"], "testrun-operator");
        assert_eq!(labels["loadtest.dev/test-run"], "test");
        assert_eq!(labels["app"], RUNNER_APP);
        let pod_labels = job.spec.unwrap().template.metadata.unwrap().labels.unwrap();
        assert_eq!(pod_labels["app"], RUNNER_APP);
    }

    #[test]
    fn runner_env_carries_simulation() {
        let mut run = TestRun::test();
        run.spec.test_scenario.simulation_data =
            BTreeMap::from_iter([("testData".to_owned(), "test".to_owned())]);
        let job = factory()
            .runner_job(&run, &StorageInfo::disabled())
            .unwrap();
        let env = env(&job);
        assert_eq!(env["SIMULATION_CLASS"], "MyBasicSimulation");
        assert_eq!(env["SIMULATION_DATA"], r#"{"testData":"test"}"#);
        assert_eq!(env["TEST_RUN_NAME"], "test");
        assert!(!env.contains_key("RESULTS_STORAGE_PATH"));
    }

    #[test]
    fn runner_uploads_results_when_reporting() {
        let mut run = TestRun::test();
        run.spec.generate_report = true;
        run.spec.cloud_storage.env = Some(BTreeMap::from_iter([(
            "AWS_REGION".to_owned(),
            "ap-northeast-1".to_owned(),
        )]));
        run.spec.test_scenario.env = Some(BTreeMap::from_iter([(
            "SIMULATION_CLASS".to_owned(),
            "Overridden".to_owned(),
        )]));
        let job = factory().runner_job(&run, &storage()).unwrap();
        let env = env(&job);
        assert_eq!(env["RESULTS_STORAGE_PATH"], "s3:results/test/1700000000");
        assert_eq!(env["AWS_REGION"], "ap-northeast-1");
        assert_eq!(env["SIMULATION_CLASS"], "Overridden");
    }

    #[test]
    fn runner_resources_and_image_overrides() {
        let mut run = TestRun::test();
        run.spec.image = Some("custom/runner:1".to_owned());
        run.spec.test_scenario.resources = Some(ResourceLimitsSpec {
            cpu: Some(Quantity("500m".to_owned())),
            memory: None,
        });
        let job = factory()
            .runner_job(&run, &StorageInfo::disabled())
            .unwrap();
        let container = &job.spec.unwrap().template.spec.unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("custom/runner:1"));
        let resources = container.resources.clone().unwrap();
        assert_eq!(resources.limits.unwrap()["cpu"], Quantity("500m".to_owned()));
        assert_eq!(resources.requests.unwrap().len(), 1);
    }

    #[test]
    fn report_job() {
        let job = factory().report_job(&TestRun::test(), &storage()).unwrap();
        assert_eq!(job.metadata.name.as_deref(), Some("test-reporter"));
        let spec = job.spec.clone().unwrap();
        assert_eq!(spec.parallelism, Some(1));
        assert_eq!(spec.completions, Some(1));
        let env = env(&job);
        assert_eq!(env["RESULTS_STORAGE_PATH"], "s3:results/test/1700000000");
        assert_eq!(
            env["REPORT_URL"],
            "https://results.s3.amazonaws.com/test/1700000000/index.html"
        );
    }

    #[test]
    fn report_job_requires_storage() {
        let err = factory()
            .report_job(&TestRun::test(), &StorageInfo::disabled())
            .unwrap_err();
        assert!(err.is_config());
    }
}
