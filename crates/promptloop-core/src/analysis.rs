//! Judge feedback on the recorded call that triggered a pipeline run.
//!
//! The live transcript is scored against every persona's expected
//! behaviour and success criteria. What the judge says about the real call
//! goes to the improver ahead of what it said about the simulated baseline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::reporting::rank_by_frequency;
use crate::{DimensionSummary, PerformanceReport};

const MAX_SUGGESTIONS: usize = 5;
const MAX_FAILURE_REASONS: usize = 5;

/// The recorded call, scored once per persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallAnalysis {
    pub call_id: String,
    pub report: PerformanceReport,
}

impl CallAnalysis {
    /// Mean over the personas the call could be scored against
    pub fn average_score(&self) -> f64 {
        self.report.aggregate
    }
}

/// Improver input merged from the recorded call and the baseline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Findings {
    /// Weakest first; a dimension low in both keeps its lower mean
    pub low_dimensions: Vec<DimensionSummary>,
    pub suggestions: Vec<String>,
    pub failure_reasons: Vec<String>,
}

impl Findings {
    pub fn combine(call: &CallAnalysis, baseline: &PerformanceReport, threshold: f64) -> Self {
        let mut low: BTreeMap<String, DimensionSummary> = BTreeMap::new();
        for dim in call
            .report
            .low_dimensions(threshold)
            .into_iter()
            .chain(baseline.low_dimensions(threshold))
        {
            let weaker_known = low
                .get(&dim.name)
                .is_some_and(|existing| existing.mean <= dim.mean);
            if !weaker_known {
                low.insert(dim.name.clone(), dim);
            }
        }
        let mut low_dimensions: Vec<DimensionSummary> = low.into_values().collect();
        low_dimensions.sort_by(|a, b| a.mean.total_cmp(&b.mean));

        Self {
            low_dimensions,
            suggestions: call_first(
                &call.report.suggestions,
                &baseline.suggestions,
                MAX_SUGGESTIONS,
            ),
            failure_reasons: call_first(
                &call.report.common_issues,
                &baseline.common_issues,
                MAX_FAILURE_REASONS,
            ),
        }
    }
}

/// Call feedback in its ranked order, then baseline feedback not already
/// present.
fn call_first(call: &[String], baseline: &[String], limit: usize) -> Vec<String> {
    let mut merged = rank_by_frequency(call, limit);
    for item in baseline {
        if merged.len() >= limit {
            break;
        }
        if !merged.contains(item) {
            merged.push(item.clone());
        }
    }
    merged
}
