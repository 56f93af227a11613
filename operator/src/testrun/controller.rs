use std::{sync::Arc, time::Duration};

use futures::stream::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::{
    client::Client,
    runtime::{
        controller::{self, Action},
        watcher::{self, Config},
        Controller,
    },
    Api, ResourceExt,
};
use opentelemetry::{global, KeyValue};
use testrun_common::outcome::Outcome;
use tracing::{debug, error, info, warn};

use crate::{
    config::OperatorConfig,
    error::{Error, NotificationStep, Result},
    labels::MANAGED_BY_LABEL_SELECTOR,
    testrun::{
        job::{reporter_job_name, runner_job_name, JobFactory},
        notification::Notifier,
        status::{StatusPatch, StatusUpdater},
        storage::CloudStorageResolver,
        workloads::{WorkloadState, Workloads},
        Phase, TestRun, TestRunStatus,
    },
    utils::Context,
};

/// Handle errors during reconciliation.
fn on_error(
    run: Arc<TestRun>,
    error: &Error,
    cx: Arc<
        Context<
            impl Workloads,
            impl JobFactory,
            impl CloudStorageResolver,
            impl Notifier,
            impl StatusUpdater,
        >,
    >,
) -> Action {
    let delay = cx.backoff.next_delay(&object_key(&run));
    warn!(name = %run.name_any(), %error, ?delay, "reconcile failed, backing off");
    Action::requeue(delay)
}

/// Start a controller for the TestRun CRD.
pub async fn run(config: OperatorConfig) -> anyhow::Result<()> {
    let k_client = Client::try_default().await?;
    let context = Arc::new(Context::new(k_client.clone(), &config)?);

    let test_runs: Api<TestRun> = Api::all(k_client.clone());
    let jobs = Api::<Job>::all(k_client.clone());

    Controller::new(test_runs, Config::default())
        .owns(
            jobs,
            watcher::Config::default().labels(MANAGED_BY_LABEL_SELECTOR),
        )
        .with_config(controller::Config::default().concurrency(config.concurrency))
        .shutdown_on_signal()
        .run(reconcile, on_error, context)
        .for_each(|rec_res| async move {
            match rec_res {
                Ok((test_run, _)) => {
                    debug!(test_run.name, "reconcile success");
                }
                Err(err) => {
                    error!(?err, "reconcile error")
                }
            }
        })
        .await;
    Ok(())
}

/// Perform a reconcile pass for the TestRun CRD
async fn reconcile(
    run: Arc<TestRun>,
    cx: Arc<
        Context<
            impl Workloads,
            impl JobFactory,
            impl CloudStorageResolver,
            impl Notifier,
            impl StatusUpdater,
        >,
    >,
) -> Result<Action> {
    let meter = global::meter("testrun-operator");
    let runs = meter
        .u64_counter("testrun_reconcile_count")
        .with_description("Number of test run reconciles")
        .init();

    let result = match tokio::time::timeout(cx.reconcile_timeout, reconcile_(&run, &*cx)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(cx.reconcile_timeout)),
    };
    let result = match result {
        Err(err) if err.is_config() => fail_run(&run, &*cx, &err).await,
        Err(err) => {
            record_error(&run, &*cx, &err).await;
            Err(err)
        }
        ok => ok,
    };

    match &result {
        Ok(_) => {
            cx.backoff.reset(&object_key(&run));
            runs.add(1, &[KeyValue::new("result", "ok")]);
        }
        Err(_) => {
            runs.add(1, &[KeyValue::new("result", "err")]);
        }
    }
    result
}

/// Advance the run by at most one step.
async fn reconcile_(
    run: &TestRun,
    cx: &Context<
        impl Workloads,
        impl JobFactory,
        impl CloudStorageResolver,
        impl Notifier,
        impl StatusUpdater,
    >,
) -> Result<Action> {
    let status = run.status.clone().unwrap_or_default();
    debug!(name = %run.name_any(), phase = %status.phase, "reconcile");

    match status.phase {
        Phase::Pending => start_runner(cx, run).await,
        Phase::RunnerRunning => observe_runner(cx, run).await,
        Phase::RunnerCompleted => after_runner(cx, run).await,
        Phase::RunnerFailed => after_failure(cx, run).await,
        Phase::ReportRunning => observe_report(cx, run).await,
        Phase::ReportCompleted => after_report(cx, run).await,
        Phase::Notifying => notify(cx, run).await,
        Phase::Notified => finish(cx, run, status.outcome.unwrap_or(Outcome::Failed)).await,
        Phase::CleaningUp => cleanup(cx, run, &status).await,
        Phase::Done | Phase::Failed => Ok(Action::await_change()),
    }
}

async fn start_runner(
    cx: &Context<
        impl Workloads,
        impl JobFactory,
        impl CloudStorageResolver,
        impl Notifier,
        impl StatusUpdater,
    >,
    run: &TestRun,
) -> Result<Action> {
    let storage = cx.storage.resolve(run).await?;
    if run.spec.generate_report && storage.is_disabled() {
        return Err(Error::Config(
            "generateReport requires cloudStorage.provider to be set".to_owned(),
        ));
    }
    if run.spec.notify_report && run.spec.notification.is_none() {
        return Err(Error::Config(
            "notifyReport requires a notification block".to_owned(),
        ));
    }
    let job = cx.job_factory.runner_job(run, &storage)?;
    let name = job.name_any();
    cx.workloads.create(job).await?;

    let mut patch = StatusPatch::transition(
        Phase::RunnerRunning,
        "RunnerCreated",
        format!("runner job {name} created"),
    )
    .with_runner_job(name);
    if run.spec.generate_report {
        patch = patch.with_storage(storage.bucket, storage.report_url);
    }
    transition(cx, run, patch).await
}

async fn observe_runner(
    cx: &Context<
        impl Workloads,
        impl JobFactory,
        impl CloudStorageResolver,
        impl Notifier,
        impl StatusUpdater,
    >,
    run: &TestRun,
) -> Result<Action> {
    let ns = namespace(run)?;
    let name = runner_job_name(&run.name_any());
    let patch = match cx.workloads.state(&ns, &name).await? {
        Some(WorkloadState::Active) => return Ok(Action::requeue(cx.resync_interval)),
        Some(WorkloadState::Succeeded) => StatusPatch::transition(
            Phase::RunnerCompleted,
            "RunnerSucceeded",
            format!("runner job {name} succeeded"),
        ),
        Some(WorkloadState::Failed { reason }) => StatusPatch::transition(
            Phase::RunnerFailed,
            "RunnerFailed",
            format!(
                "runner job {name} failed: {}",
                reason.as_deref().unwrap_or("unknown")
            ),
        )
        .with_outcome(Outcome::Failed),
        None => StatusPatch::transition(
            Phase::RunnerFailed,
            "RunnerMissing",
            format!("runner job {name} no longer exists"),
        )
        .with_outcome(Outcome::Failed),
    };
    transition(cx, run, patch).await
}

async fn after_runner(
    cx: &Context<
        impl Workloads,
        impl JobFactory,
        impl CloudStorageResolver,
        impl Notifier,
        impl StatusUpdater,
    >,
    run: &TestRun,
) -> Result<Action> {
    if run.spec.generate_report {
        start_report(cx, run).await
    } else if run.spec.notify_report {
        transition(
            cx,
            run,
            StatusPatch::transition(Phase::Notifying, "Notifying", "sending notification")
                .with_outcome(Outcome::Succeeded),
        )
        .await
    } else {
        finish(cx, run, Outcome::Succeeded).await
    }
}

async fn after_failure(
    cx: &Context<
        impl Workloads,
        impl JobFactory,
        impl CloudStorageResolver,
        impl Notifier,
        impl StatusUpdater,
    >,
    run: &TestRun,
) -> Result<Action> {
    if run.spec.notify_report {
        transition(
            cx,
            run,
            StatusPatch::transition(Phase::Notifying, "Notifying", "sending failure notification")
                .with_outcome(Outcome::Failed),
        )
        .await
    } else {
        finish(cx, run, Outcome::Failed).await
    }
}

async fn start_report(
    cx: &Context<
        impl Workloads,
        impl JobFactory,
        impl CloudStorageResolver,
        impl Notifier,
        impl StatusUpdater,
    >,
    run: &TestRun,
) -> Result<Action> {
    let storage = cx.storage.resolve(run).await?;
    let job = cx.job_factory.report_job(run, &storage)?;
    let name = job.name_any();
    cx.workloads.create(job).await?;

    transition(
        cx,
        run,
        StatusPatch::transition(
            Phase::ReportRunning,
            "ReportCreated",
            format!("report job {name} created"),
        )
        .with_report_job(name)
        .with_storage(storage.bucket, storage.report_url),
    )
    .await
}

async fn observe_report(
    cx: &Context<
        impl Workloads,
        impl JobFactory,
        impl CloudStorageResolver,
        impl Notifier,
        impl StatusUpdater,
    >,
    run: &TestRun,
) -> Result<Action> {
    let ns = namespace(run)?;
    let name = reporter_job_name(&run.name_any());
    let detail = match cx.workloads.state(&ns, &name).await? {
        Some(WorkloadState::Active) => return Ok(Action::requeue(cx.resync_interval)),
        Some(WorkloadState::Succeeded) => {
            return transition(
                cx,
                run,
                StatusPatch::transition(
                    Phase::ReportCompleted,
                    "ReportSucceeded",
                    format!("report job {name} succeeded"),
                )
                .with_outcome(Outcome::Succeeded),
            )
            .await
        }
        Some(WorkloadState::Failed { reason }) => format!(
            "report job {name} failed: {}",
            reason.as_deref().unwrap_or("unknown")
        ),
        None => format!("report job {name} no longer exists"),
    };

    if run.spec.notify_report {
        transition(
            cx,
            run,
            StatusPatch::transition(Phase::Notifying, "ReportFailed", detail)
                .with_outcome(Outcome::Failed),
        )
        .await
    } else {
        finish_with(cx, run, Outcome::Failed, "ReportFailed", detail).await
    }
}

async fn after_report(
    cx: &Context<
        impl Workloads,
        impl JobFactory,
        impl CloudStorageResolver,
        impl Notifier,
        impl StatusUpdater,
    >,
    run: &TestRun,
) -> Result<Action> {
    if run.spec.notify_report {
        transition(
            cx,
            run,
            StatusPatch::transition(Phase::Notifying, "Notifying", "sending notification"),
        )
        .await
    } else {
        finish(cx, run, Outcome::Succeeded).await
    }
}

async fn notify(
    cx: &Context<
        impl Workloads,
        impl JobFactory,
        impl CloudStorageResolver,
        impl Notifier,
        impl StatusUpdater,
    >,
    run: &TestRun,
) -> Result<Action> {
    // The cached object may predate the write recording the delivery.
    let status = cx.status.current(run).await?;
    if status.phase != Phase::Notifying {
        debug!(name = %run.name_any(), phase = %status.phase, "run left Notifying, skipping");
        return Ok(requeue_now());
    }
    if status.notification_sent {
        return transition(
            cx,
            run,
            StatusPatch::transition(Phase::Notified, "Notified", "notification sent"),
        )
        .await;
    }

    let (requeue, result) = reconcile_notification(cx, run, &status).await;
    result?;
    Ok(if requeue {
        requeue_now()
    } else {
        Action::requeue(cx.resync_interval)
    })
}

/// Resolve the report location, send the notification and record the delivery.
///
/// Always asks to be requeued. Each step short circuits the following ones and
/// its error names the step. Nothing is retried here.
async fn reconcile_notification(
    cx: &Context<
        impl Workloads,
        impl JobFactory,
        impl CloudStorageResolver,
        impl Notifier,
        impl StatusUpdater,
    >,
    run: &TestRun,
    status: &TestRunStatus,
) -> (bool, Result<()>) {
    let outcome = status.outcome.unwrap_or(Outcome::Failed);
    let result = async {
        let storage = cx
            .storage
            .resolve(run)
            .await
            .map_err(|err| err.at_step(NotificationStep::ResolveStorage))?;
        let report_url = (run.spec.generate_report
            && outcome.is_success()
            && !storage.is_disabled())
        .then_some(storage.report_url);

        cx.notifier
            .send(run, report_url, outcome)
            .await
            .map_err(|err| err.at_step(NotificationStep::Send))?;

        cx.status
            .update(
                run,
                StatusPatch::condition("NotificationSent", format!("notified {outcome}"))
                    .with_notification_sent()
                    .observed_in(Phase::Notifying),
            )
            .await
            .map_err(|err| err.at_step(NotificationStep::RecordStatus))?;
        Ok::<(), Error>(())
    }
    .await;
    (true, result)
}

async fn finish(
    cx: &Context<
        impl Workloads,
        impl JobFactory,
        impl CloudStorageResolver,
        impl Notifier,
        impl StatusUpdater,
    >,
    run: &TestRun,
    outcome: Outcome,
) -> Result<Action> {
    let (reason, message) = match outcome {
        Outcome::Succeeded => ("Succeeded", "test run succeeded"),
        Outcome::Failed => ("Failed", "test run failed"),
    };
    finish_with(cx, run, outcome, reason, message).await
}

// Moves to the terminal phase of `outcome`, through CleaningUp when jobs must be deleted.
async fn finish_with(
    cx: &Context<
        impl Workloads,
        impl JobFactory,
        impl CloudStorageResolver,
        impl Notifier,
        impl StatusUpdater,
    >,
    run: &TestRun,
    outcome: Outcome,
    reason: &str,
    message: impl Into<String>,
) -> Result<Action> {
    let phase = if run.spec.cleanup_after_job_done {
        Phase::CleaningUp
    } else {
        terminal_phase(outcome)
    };
    transition(
        cx,
        run,
        StatusPatch::transition(phase, reason, message).with_outcome(outcome),
    )
    .await
}

async fn cleanup(
    cx: &Context<
        impl Workloads,
        impl JobFactory,
        impl CloudStorageResolver,
        impl Notifier,
        impl StatusUpdater,
    >,
    run: &TestRun,
    status: &TestRunStatus,
) -> Result<Action> {
    let ns = namespace(run)?;
    let run_name = run.name_any();
    cx.workloads.delete(&ns, &runner_job_name(&run_name)).await?;
    if run.spec.generate_report || status.report_job_ref.is_some() {
        cx.workloads
            .delete(&ns, &reporter_job_name(&run_name))
            .await?;
    }

    let outcome = status.outcome.unwrap_or(Outcome::Failed);
    transition(
        cx,
        run,
        StatusPatch::transition(terminal_phase(outcome), "CleanedUp", "jobs deleted"),
    )
    .await
}

/// Write `patch` and decide how to continue from the persisted status.
///
/// The write only happens while the persisted phase is the one this pass
/// observed. A pass working from an outdated object is requeued instead.
async fn transition(
    cx: &Context<
        impl Workloads,
        impl JobFactory,
        impl CloudStorageResolver,
        impl Notifier,
        impl StatusUpdater,
    >,
    run: &TestRun,
    patch: StatusPatch,
) -> Result<Action> {
    let next = patch.phase;
    let observed = observed_phase(run);
    let Some(status) = cx.status.update(run, patch.observed_in(observed)).await? else {
        debug!(name = %run.name_any(), %observed, "stale pass, status not written");
        return Ok(requeue_now());
    };
    if let Some(phase) = next {
        info!(name = %run.name_any(), %phase, "phase transition");
        global::meter("testrun-operator")
            .u64_counter("testrun_phase_transitions")
            .with_description("Number of test run phase transitions")
            .init()
            .add(1, &[KeyValue::new("phase", phase.to_string())]);
    }
    Ok(if status.phase.is_terminal() {
        Action::await_change()
    } else {
        requeue_now()
    })
}

/// Move the run to Failed for a configuration error. Configuration errors are not retried.
async fn fail_run(
    run: &TestRun,
    cx: &Context<
        impl Workloads,
        impl JobFactory,
        impl CloudStorageResolver,
        impl Notifier,
        impl StatusUpdater,
    >,
    err: &Error,
) -> Result<Action> {
    warn!(name = %run.name_any(), %err, "invalid test run");
    transition(
        cx,
        run,
        StatusPatch::transition(Phase::Failed, "InvalidConfiguration", err.to_string())
            .with_outcome(Outcome::Failed),
    )
    .await
}

// Best effort, the reconcile error is what gets retried. Finished runs keep their condition.
async fn record_error(
    run: &TestRun,
    cx: &Context<
        impl Workloads,
        impl JobFactory,
        impl CloudStorageResolver,
        impl Notifier,
        impl StatusUpdater,
    >,
    err: &Error,
) {
    let observed = observed_phase(run);
    if observed.is_terminal() {
        return;
    }
    let patch = StatusPatch::condition("ReconcileError", err.to_string()).observed_in(observed);
    if let Err(update_err) = cx.status.update(run, patch).await {
        warn!(name = %run.name_any(), %update_err, "failed to record reconcile error");
    }
}

fn terminal_phase(outcome: Outcome) -> Phase {
    if outcome.is_success() {
        Phase::Done
    } else {
        Phase::Failed
    }
}

fn observed_phase(run: &TestRun) -> Phase {
    run.status.as_ref().map(|status| status.phase).unwrap_or_default()
}

fn requeue_now() -> Action {
    Action::requeue(Duration::ZERO)
}

fn namespace(run: &TestRun) -> Result<String> {
    run.namespace().ok_or(Error::MissingNamespace)
}

fn object_key(run: &TestRun) -> String {
    format!("{}/{}", run.namespace().unwrap_or_default(), run.name_any())
}
