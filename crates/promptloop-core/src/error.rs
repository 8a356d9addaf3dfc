use promptloop_agent::GeneratorError;
use promptloop_db::IterationStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::EvaluationRun;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("No personas to evaluate")]
    NoPersonas,

    #[error("No persona conversation could be scored ({failed} failed)")]
    NoSuccessfulPersonas {
        failed: usize,
        runs: Vec<EvaluationRun>,
    },

    #[error("Call {call_id} could not be scored against any persona ({failed} failed)")]
    CallNotScored { call_id: String, failed: usize },
}

#[derive(Error, Debug)]
pub enum ImproverError {
    #[error("Improver generation failed: {0}")]
    Generation(#[from] GeneratorError),

    #[error("Improver returned an empty prompt")]
    EmptyCandidate,
}

#[derive(Error, Debug)]
pub enum IterationError {
    #[error("Iteration {0} not found")]
    NotFound(i64),

    #[error("Iteration {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: IterationStatus,
        to: IterationStatus,
    },

    #[error("Active iteration invariant violated: {0}")]
    InvariantViolation(String),

    #[error("No active iteration; seed a baseline prompt first")]
    NoActiveIteration,

    #[error("Iterations already exist; refusing to seed again")]
    AlreadySeeded,

    #[error("Active iteration {0} has no aggregate score")]
    Unscored(i64),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Call not found: {0}")]
    CallNotFound(String),

    #[error("Only {succeeded} personas were scored; at least {required} are required")]
    InsufficientPersonas { succeeded: usize, required: usize },

    #[error("Evaluation error: {0}")]
    Harness(#[from] HarnessError),

    #[error("Improver error: {0}")]
    Improver(#[from] ImproverError),

    #[error("Iteration error: {0}")]
    Iteration(#[from] IterationError),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Pipeline was cancelled")]
    Cancelled,
}

/// Failure classes reported in a pipeline outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A collaborator was slow or unavailable; nothing was promoted and a
    /// later run may succeed
    TransientExternalFailure,
    /// A collaborator failed in a way retrying will not fix
    Configuration,
    InvariantViolation,
    NotFound,
    Storage,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransientExternalFailure => "transient_external_failure",
            FailureKind::Configuration => "configuration",
            FailureKind::InvariantViolation => "invariant_violation",
            FailureKind::NotFound => "not_found",
            FailureKind::Storage => "storage",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::CallNotFound(_) => FailureKind::NotFound,
            PipelineError::InsufficientPersonas { .. } | PipelineError::Cancelled => {
                FailureKind::TransientExternalFailure
            }
            PipelineError::Harness(HarnessError::NoPersonas) => FailureKind::Configuration,
            PipelineError::Harness(
                HarnessError::NoSuccessfulPersonas { .. } | HarnessError::CallNotScored { .. },
            ) => FailureKind::TransientExternalFailure,
            PipelineError::Improver(ImproverError::Generation(e)) if !e.is_transient() => {
                FailureKind::Configuration
            }
            PipelineError::Improver(_) => FailureKind::TransientExternalFailure,
            PipelineError::Iteration(e) => match e {
                IterationError::InvariantViolation(_) => FailureKind::InvariantViolation,
                IterationError::NotFound(_)
                | IterationError::NoActiveIteration
                | IterationError::Unscored(_) => FailureKind::NotFound,
                IterationError::InvalidTransition { .. } | IterationError::AlreadySeeded => {
                    FailureKind::InvariantViolation
                }
                IterationError::Storage(_) | IterationError::Serialization(_) => {
                    FailureKind::Storage
                }
            },
            PipelineError::Storage(_) | PipelineError::Serialization(_) => FailureKind::Storage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_failure_kinds() {
        let timeout = PipelineError::Improver(ImproverError::Generation(GeneratorError::Timeout(
            Duration::from_secs(120),
        )));
        assert_eq!(timeout.kind(), FailureKind::TransientExternalFailure);

        let missing = PipelineError::Improver(ImproverError::Generation(
            GeneratorError::NotFound("claude".to_string()),
        ));
        assert_eq!(missing.kind(), FailureKind::Configuration);

        let partial = PipelineError::InsufficientPersonas {
            succeeded: 3,
            required: 5,
        };
        assert_eq!(partial.kind(), FailureKind::TransientExternalFailure);

        let invariant =
            PipelineError::Iteration(IterationError::InvariantViolation("2 active".into()));
        assert_eq!(invariant.kind(), FailureKind::InvariantViolation);

        assert_eq!(
            PipelineError::CallNotFound("room-1".into()).kind(),
            FailureKind::NotFound
        );
    }
}
