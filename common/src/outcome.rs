//! Defines the result of a test run as reported to users and notification endpoints.
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Final result of a test run.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, JsonSchema)]
pub enum Outcome {
    /// Every workload of the run completed successfully.
    Succeeded,
    /// A workload of the run failed.
    Failed,
}

impl Outcome {
    /// Report whether the run succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Succeeded => write!(f, "succeeded"),
            Outcome::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Outcome;

    #[test]
    fn serializes_as_variant_name() {
        assert_eq!(
            serde_json::to_string(&Outcome::Failed).unwrap(),
            "\"Failed\""
        );
        assert_eq!(Outcome::Succeeded.to_string(), "succeeded");
        assert!(!Outcome::Failed.is_success());
    }
}
