//! Errors produced while reconciling a test run.
use std::{fmt, time::Duration};

use crate::testrun::Phase;

/// Step of the notification pass that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationStep {
    /// Resolving the cloud storage location of the report.
    ResolveStorage,
    /// Delivering the message.
    Send,
    /// Recording the delivery in the status.
    RecordStatus,
}

impl fmt::Display for NotificationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationStep::ResolveStorage => write!(f, "resolve-storage"),
            NotificationStep::Send => write!(f, "send"),
            NotificationStep::RecordStatus => write!(f, "record-status"),
        }
    }
}

/// Errors produced by the reconcile function and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The test run cannot be executed as declared. Not retried.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Failure of an internal helper.
    #[error("App error: {source}")]
    App {
        #[from]
        source: anyhow::Error,
    },
    /// Failure talking to the Kubernetes API.
    #[error("Kube error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },
    /// Failure talking to a notification endpoint.
    #[error("HTTP error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },
    /// Failure encoding a request body.
    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
    /// The status kept changing underneath the updater.
    #[error("status update conflicted {attempts} times")]
    Conflict { attempts: usize },
    /// The persisted phase is already past the requested one.
    #[error("refusing to move phase from {from} back to {to}")]
    PhaseRegression { from: Phase, to: Phase },
    /// A step of the notification pass failed.
    #[error("notification {step} failed: {source}")]
    Notification {
        step: NotificationStep,
        #[source]
        source: Box<Error>,
    },
    /// The reconcile deadline expired.
    #[error("reconcile did not finish within {0:?}")]
    Timeout(Duration),
    /// The test run object carries no namespace.
    #[error("test run has no namespace")]
    MissingNamespace,
}

impl Error {
    /// Report whether the error needs a spec change to resolve.
    pub fn is_config(&self) -> bool {
        match self {
            Error::Config(_) => true,
            Error::Notification { source, .. } => source.is_config(),
            _ => false,
        }
    }

    /// Wrap the error as the failure of a notification step.
    pub fn at_step(self, step: NotificationStep) -> Self {
        Error::Notification {
            step,
            source: Box::new(self),
        }
    }
}

/// Result type of the reconciler and its collaborators.
pub type Result<T, E = Error> = std::result::Result<T, E>;
