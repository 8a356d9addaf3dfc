use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::FailureKind;

/// Why a candidate was rejected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RollbackReason {
    /// Failed one or more validator checks; never evaluated
    Validation { violated: Vec<String> },
    /// Evaluated below the Active score minus the tolerance
    Regression {
        candidate_score: f64,
        active_score: f64,
        delta: f64,
    },
}

/// The state a pipeline run reached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Promoted {
        candidate_id: i64,
        superseded_id: i64,
        candidate_score: f64,
        previous_score: f64,
        delta: f64,
    },
    RolledBack {
        candidate_id: i64,
        reason: RollbackReason,
    },
    Failed {
        kind: FailureKind,
        error: String,
        candidate_id: Option<i64>,
    },
    /// Operator abort before the promotion decision
    Cancelled { candidate_id: Option<i64> },
}

impl PipelineOutcome {
    pub fn is_promoted(&self) -> bool {
        matches!(self, Self::Promoted { .. })
    }

    /// The iteration created by this run, if it got that far
    pub fn new_iteration_id(&self) -> Option<i64> {
        match self {
            Self::Promoted { candidate_id, .. } | Self::RolledBack { candidate_id, .. } => {
                Some(*candidate_id)
            }
            Self::Failed { candidate_id, .. } | Self::Cancelled { candidate_id } => *candidate_id,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Promoted { .. } => "promoted",
            Self::RolledBack { .. } => "rolled_back",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Promoted { .. } => 0,
            Self::RolledBack { .. } => 1,
            Self::Cancelled { .. } => 130,
            Self::Failed { .. } => 2,
        }
    }
}

/// Result of `PipelineRunner::run` for one call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: String,
    pub call_id: String,
    #[serde(flatten)]
    pub outcome: PipelineOutcome,
    /// Candidate score per scored persona
    pub scores: BTreeMap<String, f64>,
    pub aggregate: Option<f64>,
    pub total_duration_secs: f64,
}

impl PipelineResult {
    pub fn new(
        run_id: String,
        call_id: String,
        outcome: PipelineOutcome,
        scores: BTreeMap<String, f64>,
        aggregate: Option<f64>,
        duration: Duration,
    ) -> Self {
        Self {
            run_id,
            call_id,
            outcome,
            scores,
            aggregate,
            total_duration_secs: duration.as_secs_f64(),
        }
    }

    pub fn promoted(&self) -> bool {
        self.outcome.is_promoted()
    }

    pub fn new_iteration_id(&self) -> Option<i64> {
        self.outcome.new_iteration_id()
    }
}
