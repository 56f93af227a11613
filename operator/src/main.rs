//! Operator is a long lived process that drives TestRun objects to completion.
#![deny(missing_docs)]

use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use clap::{Parser, ValueEnum};
use testrun_common::telemetry::{self, LogFormat};
use testrun_operator::{config::OperatorConfig, testrun::job::JobImageConfig};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// OTLP collector receiving spans. Spans are not exported when unset.
    #[arg(long, env = "OPERATOR_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    /// Format of the log lines.
    #[arg(long, env = "OPERATOR_LOG_FORMAT", value_enum, default_value_t = LogFormatArg::Compact)]
    log_format: LogFormatArg,

    /// Address serving Prometheus metrics on /metrics.
    #[arg(long, env = "OPERATOR_METRICS_ADDR", default_value = "0.0.0.0:9464")]
    metrics_addr: SocketAddr,

    /// Maximum number of test runs reconciled at once.
    #[arg(long, env = "OPERATOR_CONCURRENCY", default_value_t = 4)]
    concurrency: u16,

    /// Deadline of a single reconcile pass.
    #[arg(long, env = "OPERATOR_RECONCILE_TIMEOUT_SECS", default_value_t = 60)]
    reconcile_timeout_secs: u64,

    /// Delay between checks of a running job.
    #[arg(long, env = "OPERATOR_RESYNC_INTERVAL_SECS", default_value_t = 30)]
    resync_interval_secs: u64,

    /// First retry delay after a failed reconcile.
    #[arg(long, env = "OPERATOR_BACKOFF_BASE_SECS", default_value_t = 5)]
    backoff_base_secs: u64,

    /// Upper bound of the retry delay.
    #[arg(long, env = "OPERATOR_BACKOFF_MAX_SECS", default_value_t = 300)]
    backoff_max_secs: u64,

    /// Status writes attempted before a conflict is reported.
    #[arg(long, env = "OPERATOR_STATUS_MAX_ATTEMPTS", default_value_t = 3)]
    status_max_attempts: usize,

    /// Timeout of notification requests.
    #[arg(long, env = "OPERATOR_NOTIFICATION_TIMEOUT_SECS", default_value_t = 10)]
    notification_timeout_secs: u64,

    /// Default image of runner jobs.
    #[arg(long, env = "OPERATOR_RUNNER_IMAGE")]
    runner_image: Option<String>,

    /// Default image of report jobs.
    #[arg(long, env = "OPERATOR_REPORTER_IMAGE")]
    reporter_image: Option<String>,

    /// Default pull policy of job images.
    #[arg(long, env = "OPERATOR_IMAGE_PULL_POLICY")]
    image_pull_policy: Option<String>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormatArg {
    Compact,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Compact => LogFormat::Compact,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

impl From<&Cli> for OperatorConfig {
    fn from(args: &Cli) -> Self {
        let images = JobImageConfig::default();
        Self {
            concurrency: args.concurrency,
            reconcile_timeout: Duration::from_secs(args.reconcile_timeout_secs),
            resync_interval: Duration::from_secs(args.resync_interval_secs),
            backoff_base: Duration::from_secs(args.backoff_base_secs),
            backoff_max: Duration::from_secs(args.backoff_max_secs),
            status_max_attempts: args.status_max_attempts,
            notification_timeout: Duration::from_secs(args.notification_timeout_secs),
            images: JobImageConfig {
                runner_image: args.runner_image.clone().unwrap_or(images.runner_image),
                reporter_image: args.reporter_image.clone().unwrap_or(images.reporter_image),
                image_pull_policy: args
                    .image_pull_policy
                    .clone()
                    .unwrap_or(images.image_pull_policy),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    telemetry::init_tracing(
        "testrun-operator",
        args.otlp_endpoint.clone(),
        args.log_format.into(),
    )?;
    let (metrics_provider, registry) = telemetry::init_metrics("testrun-operator")?;

    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(err) = telemetry::serve_metrics(metrics_addr, registry).await {
            error!(%err, "metrics server failed");
        }
    });

    let config = OperatorConfig::from(&args);
    info!(?config, "starting operator");
    let result = testrun_operator::testrun::run(config).await;

    // Flush traces and metrics before shutdown
    telemetry::shutdown(metrics_provider);
    result
}
