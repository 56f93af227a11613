//! Place all test run related code here.
mod spec;

pub use spec::*;

/// Controller reconciling TestRun objects.
#[cfg(feature = "controller")]
pub mod controller;
/// Runner and report job builders.
#[cfg(feature = "controller")]
pub mod job;
/// Completion notifications.
#[cfg(feature = "controller")]
pub mod notification;
/// Status persistence.
#[cfg(feature = "controller")]
pub mod status;
/// Report storage locations.
#[cfg(feature = "controller")]
pub mod storage;
/// Access to owned jobs.
#[cfg(feature = "controller")]
pub mod workloads;

#[cfg(test)]
pub mod stub;

#[cfg(feature = "controller")]
pub use controller::run;
