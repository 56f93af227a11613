//! Place all spec types into a single module so they can be used as a lightweight dependency
use std::{collections::BTreeMap, fmt};

use k8s_openapi::apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use testrun_common::outcome::Outcome;

/// Primary CRD for declaring and observing a distributed load test run.
#[derive(CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "loadtest.dev",
    version = "v1alpha1",
    kind = "TestRun",
    plural = "testruns",
    shortname = "tr",
    status = "TestRunStatus",
    derive = "PartialEq",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Report","type":"string","jsonPath":".status.reportUrl"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TestRunSpec {
    /// Describes the simulation every runner replica executes.
    pub test_scenario: TestScenarioSpec,
    /// Where runner results and the rendered report are stored.
    #[serde(default)]
    pub cloud_storage: CloudStorageSpec,
    /// Where a completion message is sent.
    pub notification: Option<NotificationSpec>,
    /// Render a report from the runner results once the runners complete.
    #[serde(default)]
    pub generate_report: bool,
    /// Send a notification once the run reaches its outcome.
    #[serde(default)]
    pub notify_report: bool,
    /// Delete the runner and report jobs once the run is finished.
    #[serde(default)]
    pub cleanup_after_job_done: bool,
    /// Image for the runner job.
    pub image: Option<String>,
    /// Image for the report job.
    pub reporter_image: Option<String>,
    /// Pull policy for both images.
    pub image_pull_policy: Option<String>,
    /// Service account the job pods run as.
    pub service_account_name: Option<String>,
}

/// Describes the simulation of a test run.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TestScenarioSpec {
    /// Identity of the simulation to execute.
    pub simulation_class: String,
    /// Number of runner replicas. Each replica runs the whole simulation.
    /// Zero is treated as one.
    #[serde(default)]
    pub parallelism: i32,
    /// Parameters passed to the simulation.
    #[serde(default)]
    pub simulation_data: BTreeMap<String, String>,
    /// Resource hints for each runner replica.
    pub resources: Option<ResourceLimitsSpec>,
    /// Extra environment for the runner, overrides generated variables of the same name.
    pub env: Option<BTreeMap<String, String>>,
}

/// Resource hints, applied as both requests and limits.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimitsSpec {
    /// Cpu resource limit
    pub cpu: Option<Quantity>,
    /// Memory resource limit
    pub memory: Option<Quantity>,
}

/// Cloud storage settings. An empty provider disables cloud storage.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudStorageSpec {
    /// One of `aws`, `gcp`, `azure` or empty.
    #[serde(default)]
    pub provider: String,
    /// Bucket (or azure container) name.
    pub bucket: Option<String>,
    /// Region of the bucket, used in the report URL where the provider needs it.
    pub region: Option<String>,
    /// Path prefix inside the bucket.
    pub prefix: Option<String>,
    /// Environment passed to every workload, typically credentials for the provider.
    pub env: Option<BTreeMap<String, String>>,
}

/// Notification settings.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSpec {
    /// One of `slack` or `webhook`.
    pub provider: String,
    /// Secret in the test run namespace holding the endpoint URL.
    pub secret_name: String,
    /// Key of the endpoint URL in the secret, defaults to `webhook-url`.
    pub secret_key: Option<String>,
}

/// Observed status of a test run.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TestRunStatus {
    /// Current step of the run.
    #[serde(default)]
    pub phase: Phase,
    /// Machine readable cause of the last transition or error.
    pub reason: Option<String>,
    /// Human readable detail of the last transition or error.
    pub message: Option<String>,
    /// Result of the run once known.
    pub outcome: Option<Outcome>,
    /// Name of the runner job.
    pub runner_job_ref: Option<String>,
    /// Name of the report job.
    pub report_job_ref: Option<String>,
    /// Bucket reference the workloads read and write results at.
    pub report_storage_path: Option<String>,
    /// Public URL of the rendered report.
    pub report_url: Option<String>,
    /// Set once the notification was delivered.
    #[serde(default)]
    pub notification_sent: bool,
    /// Time of the last phase change.
    pub last_transition_time: Option<Time>,
}

/// Steps of the test run state machine.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, Copy, JsonSchema)]
pub enum Phase {
    /// Nothing created yet.
    #[default]
    Pending,
    /// Runner job created, waiting for it to finish.
    RunnerRunning,
    /// Runner job succeeded.
    RunnerCompleted,
    /// Runner job failed.
    RunnerFailed,
    /// Report job created, waiting for it to finish.
    ReportRunning,
    /// Report job succeeded.
    ReportCompleted,
    /// Sending the notification.
    Notifying,
    /// Notification delivered.
    Notified,
    /// Deleting owned jobs.
    CleaningUp,
    /// Run finished successfully.
    Done,
    /// Run finished with a failure or could not be executed.
    Failed,
}

impl Phase {
    /// Report whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }

    /// Report whether moving from `self` to `next` follows the state graph.
    /// Any non terminal phase may move to `Failed`.
    pub fn can_advance_to(&self, next: Phase) -> bool {
        use Phase::*;
        if next == Failed {
            return !self.is_terminal();
        }
        match self {
            Pending => matches!(next, RunnerRunning),
            RunnerRunning => matches!(next, RunnerCompleted | RunnerFailed),
            RunnerCompleted => matches!(next, ReportRunning | Notifying | CleaningUp | Done),
            RunnerFailed => matches!(next, Notifying | CleaningUp),
            ReportRunning => matches!(next, ReportCompleted | Notifying | CleaningUp),
            ReportCompleted => matches!(next, Notifying | CleaningUp | Done),
            Notifying => matches!(next, Notified),
            Notified => matches!(next, CleaningUp | Done),
            CleaningUp => matches!(next, Done),
            Done | Failed => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::{Phase, TestRunSpec};

    const ALL: [Phase; 11] = [
        Phase::Pending,
        Phase::RunnerRunning,
        Phase::RunnerCompleted,
        Phase::RunnerFailed,
        Phase::ReportRunning,
        Phase::ReportCompleted,
        Phase::Notifying,
        Phase::Notified,
        Phase::CleaningUp,
        Phase::Done,
        Phase::Failed,
    ];

    #[test]
    fn terminal_phases_accept_nothing() {
        for next in ALL {
            assert!(!Phase::Done.can_advance_to(next), "Done -> {next}");
            assert!(!Phase::Failed.can_advance_to(next), "Failed -> {next}");
        }
    }

    #[test]
    fn every_live_phase_may_fail() {
        for phase in ALL.iter().filter(|p| !p.is_terminal()) {
            assert!(phase.can_advance_to(Phase::Failed), "{phase} -> Failed");
        }
    }

    #[test]
    fn no_phase_moves_back_to_pending() {
        for phase in ALL {
            assert!(!phase.can_advance_to(Phase::Pending), "{phase} -> Pending");
        }
        assert!(!Phase::Notified.can_advance_to(Phase::Notifying));
        assert!(!Phase::ReportCompleted.can_advance_to(Phase::ReportRunning));
    }

    #[test]
    fn spec_defaults_from_minimal_json() {
        let spec: TestRunSpec = serde_json::from_value(serde_json::json!({
            "testScenario": { "simulationClass": "MyBasicSimulation" }
        }))
        .unwrap();
        assert_eq!(spec.test_scenario.parallelism, 0);
        assert_eq!(spec.cloud_storage.provider, "");
        assert!(!spec.generate_report);
        assert!(!spec.notify_report);
        assert!(!spec.cleanup_after_job_done);
        assert!(spec.notification.is_none());
    }
}
