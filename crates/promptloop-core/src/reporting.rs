//! Performance reports, snapshots and improvement trends.

use chrono::{DateTime, Utc};
use promptloop_db::{IterationStatus, SnapshotRecord};
use promptloop_judge::{Rubric, Scorecard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::{BotIteration, EvaluationRun, PromotionDecision};

const TOP_SUGGESTIONS: usize = 5;
const TOP_ISSUES: usize = 5;

/// Mean, min and max of one rubric dimension across scored personas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionSummary {
    pub name: String,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

/// What an evaluation batch says about a prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    /// Mean over the scored personas only
    pub aggregate: f64,
    pub persona_scores: BTreeMap<String, f64>,
    pub failed_personas: Vec<String>,
    pub dimensions: Vec<DimensionSummary>,
    /// Judge suggestions, most frequent first
    pub suggestions: Vec<String>,
    /// Judge failure reasons, most frequent first
    pub common_issues: Vec<String>,
}

impl PerformanceReport {
    pub fn from_runs(runs: &[EvaluationRun], rubric: &Rubric) -> Self {
        Self::from_scorecards(
            runs.iter()
                .map(|run| (run.persona_id.as_str(), run.scorecard().zip(run.aggregate()))),
            rubric,
        )
    }

    /// Build a report from per-persona scorecards; `None` marks a persona
    /// that could not be scored.
    pub fn from_scorecards<'a>(
        entries: impl IntoIterator<Item = (&'a str, Option<(&'a Scorecard, f64)>)>,
        rubric: &Rubric,
    ) -> Self {
        let mut persona_scores = BTreeMap::new();
        let mut failed_personas = Vec::new();
        let mut suggestions = Vec::new();
        let mut issues = Vec::new();
        let mut per_dimension: BTreeMap<&str, Vec<f64>> = BTreeMap::new();

        for (persona_id, scored) in entries {
            let Some((card, aggregate)) = scored else {
                failed_personas.push(persona_id.to_string());
                continue;
            };

            persona_scores.insert(persona_id.to_string(), aggregate);
            suggestions.extend(card.improvement_suggestions.iter().cloned());
            issues.extend(card.failure_reasons.iter().cloned());
            for name in rubric.dimension_names() {
                if let Some(score) = card.scores.get(name) {
                    per_dimension.entry(name).or_default().push(*score);
                }
            }
        }

        let aggregate = if persona_scores.is_empty() {
            0.0
        } else {
            persona_scores.values().sum::<f64>() / persona_scores.len() as f64
        };

        // Rubric order, not alphabetical
        let dimensions = rubric
            .dimension_names()
            .filter_map(|name| {
                let scores = per_dimension.get(name)?;
                Some(DimensionSummary {
                    name: name.to_string(),
                    mean: scores.iter().sum::<f64>() / scores.len() as f64,
                    min: scores.iter().copied().fold(f64::INFINITY, f64::min),
                    max: scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                })
            })
            .collect();

        Self {
            aggregate,
            persona_scores,
            failed_personas,
            dimensions,
            suggestions: rank_by_frequency(&suggestions, TOP_SUGGESTIONS),
            common_issues: rank_by_frequency(&issues, TOP_ISSUES),
        }
    }

    pub fn scored(&self) -> usize {
        self.persona_scores.len()
    }

    /// Dimensions whose mean falls below `threshold`, weakest first.
    pub fn low_dimensions(&self, threshold: f64) -> Vec<DimensionSummary> {
        let mut low: Vec<DimensionSummary> = self
            .dimensions
            .iter()
            .filter(|d| d.mean < threshold)
            .cloned()
            .collect();
        low.sort_by(|a, b| a.mean.total_cmp(&b.mean));
        low
    }
}

/// Distinct items ordered by how often they occur; ties keep first-seen
/// order.
pub fn rank_by_frequency(items: &[String], limit: usize) -> Vec<String> {
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (position, item) in items.iter().enumerate() {
        let entry = counts.entry(item.as_str()).or_insert((0, position));
        entry.0 += 1;
    }

    let mut ranked: Vec<(&str, (usize, usize))> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
    ranked
        .into_iter()
        .take(limit)
        .map(|(item, _)| item.to_string())
        .collect()
}

/// Derived record of one evaluated iteration, compared to the Active one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub iteration_id: i64,
    pub baseline_id: Option<i64>,
    pub aggregate: f64,
    pub baseline_score: Option<f64>,
    /// Kept for rolled back candidates too, for audit
    pub delta: Option<f64>,
    pub report: PerformanceReport,
    pub created_at: DateTime<Utc>,
}

impl PerformanceSnapshot {
    pub fn baseline(iteration_id: i64, report: PerformanceReport) -> Self {
        Self {
            iteration_id,
            baseline_id: None,
            aggregate: report.aggregate,
            baseline_score: None,
            delta: None,
            report,
            created_at: Utc::now(),
        }
    }

    pub fn compared(decision: &PromotionDecision, report: PerformanceReport) -> Self {
        Self {
            iteration_id: decision.candidate_id,
            baseline_id: Some(decision.active_id),
            aggregate: decision.candidate_score,
            baseline_score: Some(decision.active_score),
            delta: Some(decision.delta),
            report,
            created_at: Utc::now(),
        }
    }

    pub fn to_record(&self) -> Result<SnapshotRecord, serde_json::Error> {
        Ok(SnapshotRecord {
            iteration_id: self.iteration_id,
            baseline_id: self.baseline_id,
            aggregate_score: self.aggregate,
            baseline_score: self.baseline_score,
            delta: self.delta,
            report: serde_json::to_string(&self.report)?,
            created_at: self.created_at,
        })
    }

    pub fn from_record(record: &SnapshotRecord) -> Result<Self, serde_json::Error> {
        Ok(Self {
            iteration_id: record.iteration_id,
            baseline_id: record.baseline_id,
            aggregate: record.aggregate_score,
            baseline_score: record.baseline_score,
            delta: record.delta,
            report: serde_json::from_str(&record.report)?,
            created_at: record.created_at,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
    InsufficientData,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Trend::Improving => "improving",
            Trend::Declining => "declining",
            Trend::Stable => "stable",
            Trend::InsufficientData => "insufficient_data",
        };
        f.write_str(s)
    }
}

/// How the Active score has moved across promotions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendReport {
    pub trend: Trend,
    pub total_iterations: usize,
    pub promotions: usize,
    pub rollbacks: usize,
    /// Scores of every iteration that has been Active, oldest first
    pub scores: Vec<f64>,
    pub current_score: Option<f64>,
    pub best_score: Option<f64>,
    pub worst_score: Option<f64>,
    /// Mean change between consecutive Active scores
    pub average_improvement: Option<f64>,
    /// Population standard deviation of the Active scores
    pub volatility: Option<f64>,
}

impl TrendReport {
    pub fn from_history(history: &[BotIteration]) -> Self {
        let scores: Vec<f64> = history
            .iter()
            .filter(|i| {
                matches!(
                    i.status,
                    IterationStatus::Active | IterationStatus::Superseded
                )
            })
            .filter_map(|i| i.aggregate_score)
            .collect();

        let rollbacks = history
            .iter()
            .filter(|i| i.status == IterationStatus::RolledBack)
            .count();
        let promotions = history
            .iter()
            .filter(|i| {
                i.parent_id.is_some()
                    && matches!(
                        i.status,
                        IterationStatus::Active | IterationStatus::Superseded
                    )
            })
            .count();

        let deltas: Vec<f64> = scores.windows(2).map(|w| w[1] - w[0]).collect();

        let trend = match deltas.last() {
            None => Trend::InsufficientData,
            Some(d) if *d > 0.0 => Trend::Improving,
            Some(d) if *d < 0.0 => Trend::Declining,
            Some(_) => Trend::Stable,
        };

        let mean = |values: &[f64]| values.iter().sum::<f64>() / values.len() as f64;

        let volatility = (!scores.is_empty()).then(|| {
            let m = mean(&scores);
            (scores.iter().map(|s| (s - m).powi(2)).sum::<f64>() / scores.len() as f64).sqrt()
        });

        Self {
            trend,
            total_iterations: history.len(),
            promotions,
            rollbacks,
            current_score: history
                .iter()
                .find(|i| i.status == IterationStatus::Active)
                .and_then(|i| i.aggregate_score),
            best_score: scores.iter().copied().reduce(f64::max),
            worst_score: scores.iter().copied().reduce(f64::min),
            average_improvement: (!deltas.is_empty()).then(|| mean(&deltas)),
            volatility,
            scores,
        }
    }
}
