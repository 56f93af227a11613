use std::collections::BTreeMap;

use crate::CONTROLLER_NAME;

/// Manage by label
pub const MANAGED_BY_LABEL_SELECTOR: &str = "managed-by=testrun-operator";

/// Label carrying the name of the owning test run.
pub const TEST_RUN_LABEL: &str = "loadtest.dev/test-run";

/// Labels that indicate the resource is managed by the operator.
pub fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from_iter(vec![("managed-by".to_owned(), CONTROLLER_NAME.to_owned())])
}

/// Labels for a job owned by a test run, usable as a unique selector.
pub fn job_labels(test_run: &str, app: &str) -> BTreeMap<String, String> {
    let mut labels = managed_labels();
    labels.insert("app".to_owned(), app.to_owned());
    labels.insert(TEST_RUN_LABEL.to_owned(), test_run.to_owned());
    labels
}
