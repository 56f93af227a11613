//! Environment contract between the operator and the runner/reporter containers.
//!
//! The operator only sets these variables, the containers decide what to do with them.

/// Name of the owning test run.
pub const TEST_RUN_NAME: &str = "TEST_RUN_NAME";
/// Simulation the runner executes.
pub const SIMULATION_CLASS: &str = "SIMULATION_CLASS";
/// JSON object with the run parameters of the simulation.
pub const SIMULATION_DATA: &str = "SIMULATION_DATA";
/// Bucket reference where runners upload raw results and the reporter publishes the report.
pub const RESULTS_STORAGE_PATH: &str = "RESULTS_STORAGE_PATH";
/// Public URL the rendered report will be reachable at.
pub const REPORT_URL: &str = "REPORT_URL";
