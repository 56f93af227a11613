//! Provides types and functions that are common to the operator and the workloads it launches.
#![deny(missing_docs)]
pub mod outcome;
#[cfg(feature = "telemetry")]
pub mod telemetry;
pub mod workload;
