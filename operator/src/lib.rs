//! Provides API for the operator and related tooling.
#![warn(missing_docs)]

/// Runtime configuration of the operator.
#[cfg(feature = "controller")]
pub mod config;
/// Errors of the reconciler and its collaborators.
#[cfg(feature = "controller")]
pub mod error;
/// Labels module for managing resource labels.
#[cfg(feature = "controller")]
pub(crate) mod labels;
/// TestRun module for running distributed load tests.
pub mod testrun;
/// Utils module for shared utility functions.
#[cfg(feature = "controller")]
pub mod utils;

/// A list of constants used in various K8s resources
#[cfg(feature = "controller")]
const CONTROLLER_NAME: &str = "testrun-operator";
