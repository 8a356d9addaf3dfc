use chrono::{DateTime, Utc};
use promptloop_db::{CallFilter, Database};
use promptloop_judge::Rubric;
use promptloop_logging::{LogEvent, Logger};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::outcome::{PipelineOutcome, PipelineResult, RollbackReason};
use crate::reporting::{PerformanceReport, PerformanceSnapshot};
use crate::{
    BotIteration, Call, CallSummary, EvaluationHarness, EvaluationRun, Findings, HarnessError,
    ImprovementRequest, IterationError, IterationManager, PersonaSuite, PipelineError,
    PromptImprover, PromptValidator, ValidatorConfig,
};

const INTERRUPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Scored personas needed for a usable evaluation
    pub min_personas: usize,
    /// Dimension means below this are passed to the improver
    pub low_score_threshold: f64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            min_personas: 5,
            low_score_threshold: 7.0,
        }
    }
}

/// Snapshot of the Active iteration and pending work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub active_iteration_id: i64,
    pub active_score: Option<f64>,
    pub prompt_hash: String,
    pub active_since: DateTime<Utc>,
    pub total_iterations: usize,
    pub pending_calls: usize,
}

/// Per-run state that survives a failure, for the final result
#[derive(Default)]
struct Progress {
    candidate_id: Option<i64>,
    scores: BTreeMap<String, f64>,
    aggregate: Option<f64>,
}

/// Runs the improvement pipeline for one call at a time
pub struct PipelineRunner {
    db: Arc<Database>,
    manager: Arc<IterationManager>,
    harness: Arc<EvaluationHarness>,
    improver: Arc<PromptImprover>,
    validator: PromptValidator,
    suite: PersonaSuite,
    rubric: Rubric,
    settings: PipelineSettings,
    logger: Arc<Logger>,
    interrupted: Arc<AtomicBool>,
    /// Held while an unscored Active iteration is being evaluated
    baseline_lock: tokio::sync::Mutex<()>,
}

impl PipelineRunner {
    pub fn new(
        db: Arc<Database>,
        manager: Arc<IterationManager>,
        harness: Arc<EvaluationHarness>,
        improver: Arc<PromptImprover>,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            db,
            manager,
            harness,
            improver,
            validator: PromptValidator::new(ValidatorConfig::default()),
            suite: PersonaSuite::default_catalogue(),
            rubric: Rubric::default(),
            settings: PipelineSettings::default(),
            logger,
            interrupted: Arc::new(AtomicBool::new(false)),
            baseline_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_validator(mut self, validator: PromptValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_suite(mut self, suite: PersonaSuite) -> Self {
        self.suite = suite;
        self
    }

    /// Rubric used for reports; should match the judge's
    pub fn with_rubric(mut self, rubric: Rubric) -> Self {
        self.rubric = rubric;
        self
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Get a handle to signal interruption
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    /// Run the pipeline for a call.
    ///
    /// Never returns an error: failures are reported in the outcome.
    pub async fn run(&self, call_id: &str) -> PipelineResult {
        let start = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();

        if let Err(e) = self.db.pipeline_runs().start(&run_id, call_id, Utc::now()) {
            warn!(call_id, error = %e, "Failed to record pipeline start");
        }

        let mut progress = Progress::default();
        let outcome = match self.execute(&run_id, call_id, &mut progress).await {
            Ok(outcome) => outcome,
            Err(PipelineError::Cancelled) => {
                info!(call_id, "Pipeline interrupted by user");
                self.logger.log(&LogEvent::PipelineCancelled {
                    call_id: call_id.to_string(),
                });
                PipelineOutcome::Cancelled {
                    candidate_id: progress.candidate_id,
                }
            }
            Err(e) => self.failed(call_id, e, progress.candidate_id),
        };

        match serde_json::to_string(&outcome) {
            Ok(json) => {
                if let Err(e) = self.db.pipeline_runs().finish(
                    &run_id,
                    outcome.new_iteration_id(),
                    &json,
                    Utc::now(),
                ) {
                    warn!(call_id, error = %e, "Failed to record pipeline outcome");
                }
            }
            Err(e) => warn!(call_id, error = %e, "Failed to serialize pipeline outcome"),
        }

        PipelineResult::new(
            run_id,
            call_id.to_string(),
            outcome,
            progress.scores,
            progress.aggregate,
            start.elapsed(),
        )
    }

    fn failed(&self, call_id: &str, e: PipelineError, candidate_id: Option<i64>) -> PipelineOutcome {
        let kind = e.kind();

        if let PipelineError::Iteration(IterationError::InvariantViolation(detail)) = &e {
            let active_count = self.db.iterations().active().map(|a| a.len()).unwrap_or(0);
            self.logger.log(&LogEvent::InvariantViolated {
                active_count,
                detail: detail.clone(),
            });
        }

        error!(call_id, kind = %kind, error = %e, "Pipeline failed");
        self.logger.log(&LogEvent::PipelineFailed {
            call_id: call_id.to_string(),
            kind: kind.to_string(),
            error: e.to_string(),
        });

        PipelineOutcome::Failed {
            kind,
            error: e.to_string(),
            candidate_id,
        }
    }

    async fn execute(
        &self,
        run_id: &str,
        call_id: &str,
        progress: &mut Progress,
    ) -> Result<PipelineOutcome, PipelineError> {
        let record = self
            .db
            .calls()
            .get(call_id)?
            .ok_or_else(|| PipelineError::CallNotFound(call_id.to_string()))?;
        let call = Call::from_record(&record)?;
        let active = self.manager.active()?;

        self.logger.log(&LogEvent::PipelineStarted {
            run_id: run_id.to_string(),
            call_id: call_id.to_string(),
            active_iteration_id: active.id,
            risk_tags: call.risk_tags.clone(),
        });
        self.check_interrupt()?;

        let (active_score, baseline) = self.baseline(&active).await?;
        self.check_interrupt()?;

        // Analyze the recorded call
        let analysis = tokio::select! {
            result = self.harness.analyze_call(&call, self.suite.personas()) => result?,
            _ = wait_for_interrupt(&self.interrupted) => return Err(PipelineError::Cancelled),
        };
        self.logger.log(&LogEvent::CallAnalyzed {
            call_id: call.id.clone(),
            average_score: analysis.average_score(),
            personas_scored: analysis.report.scored(),
            personas_failed: analysis.report.failed_personas.len(),
        });
        self.check_interrupt()?;

        // Propose
        let findings = Findings::combine(&analysis, &baseline, self.settings.low_score_threshold);
        let low = &findings.low_dimensions;
        let request = ImprovementRequest {
            current_prompt: &active.prompt_text,
            low_dimensions: low,
            risk_signals: &call.risk_tags,
            suggestions: &findings.suggestions,
            failure_reasons: &findings.failure_reasons,
            average_score: Some(active_score),
            call_score: Some(analysis.average_score()),
        };
        let proposal = tokio::select! {
            result = self.improver.propose(&request) => result?,
            _ = wait_for_interrupt(&self.interrupted) => return Err(PipelineError::Cancelled),
        };

        let candidate = self.manager.create_candidate(&proposal, active.id)?;
        progress.candidate_id = Some(candidate.id);
        self.logger.log(&LogEvent::CandidateProposed {
            iteration_id: candidate.id,
            parent_id: active.id,
            prompt_chars: candidate.prompt_text.chars().count(),
            low_dimensions: low.iter().map(|d| d.name.clone()).collect(),
        });

        // Validate
        let validation = self
            .validator
            .validate(&candidate.prompt_text, &active.prompt_text);
        self.manager
            .record_validation(candidate.id, &validation)
            .await?;

        let violated: Vec<String> = validation
            .violated_checks()
            .into_iter()
            .map(str::to_string)
            .collect();
        self.logger.log(&LogEvent::ValidationCompleted {
            iteration_id: candidate.id,
            passed: validation.passed,
            violated: violated.clone(),
            warnings: validation.warnings.len(),
        });
        if !validation.passed {
            return Ok(PipelineOutcome::RolledBack {
                candidate_id: candidate.id,
                reason: RollbackReason::Validation { violated },
            });
        }
        self.check_interrupt()?;

        // Evaluate
        let runs = self.evaluate(candidate.id, &candidate.prompt_text).await?;
        let report = PerformanceReport::from_runs(&runs, &self.rubric);
        progress.scores = report.persona_scores.clone();
        progress.aggregate = Some(report.aggregate);
        self.require_min_personas(&report)?;

        // Last point at which an abort leaves no trace on the Active iteration
        self.check_interrupt()?;

        let decision = self
            .manager
            .decide_promotion(candidate.id, report.aggregate)
            .await?;
        self.logger.log(&LogEvent::PromotionDecided {
            iteration_id: candidate.id,
            promoted: decision.promoted,
            candidate_score: decision.candidate_score,
            active_score: decision.active_score,
            delta: decision.delta,
        });

        // The decision is final; a failed snapshot write must not mask it
        if let Err(e) = self.save_snapshot(&PerformanceSnapshot::compared(&decision, report)) {
            warn!(iteration_id = candidate.id, error = %e, "Failed to save performance snapshot");
        }

        Ok(if decision.promoted {
            PipelineOutcome::Promoted {
                candidate_id: candidate.id,
                superseded_id: decision.active_id,
                candidate_score: decision.candidate_score,
                previous_score: decision.active_score,
                delta: decision.delta,
            }
        } else {
            PipelineOutcome::RolledBack {
                candidate_id: candidate.id,
                reason: RollbackReason::Regression {
                    candidate_score: decision.candidate_score,
                    active_score: decision.active_score,
                    delta: decision.delta,
                },
            }
        })
    }

    /// Score of the Active iteration and the report it came from,
    /// evaluating it first if it has never been scored.
    ///
    /// Runs sharing this runner evaluate an unscored iteration once. Across
    /// processes the first stored score wins and the report is always built
    /// from the stored runs, so score and runs agree.
    async fn baseline(
        &self,
        active: &BotIteration,
    ) -> Result<(f64, PerformanceReport), PipelineError> {
        let _guard = self.baseline_lock.lock().await;

        let active = self.manager.get(active.id)?;
        if let Some(score) = active.aggregate_score {
            let report = self.stored_report(active.id)?;
            debug!(iteration_id = active.id, runs = report.scored(), "Reusing baseline evaluation");
            return Ok((score, report));
        }

        info!(iteration_id = active.id, "Evaluating unscored Active iteration");
        self.evaluate(active.id, &active.prompt_text).await?;
        let report = self.stored_report(active.id)?;
        self.require_min_personas(&report)?;

        if let Some(stored) = self.manager.set_score(active.id, report.aggregate).await? {
            debug!(
                iteration_id = active.id,
                score = stored,
                "Baseline was scored by another run; using the stored score"
            );
            return Ok((stored, report));
        }

        self.save_snapshot(&PerformanceSnapshot::baseline(active.id, report.clone()))?;
        self.logger.log(&LogEvent::BaselineEvaluated {
            iteration_id: active.id,
            aggregate_score: report.aggregate,
            personas_scored: report.scored(),
        });

        Ok((report.aggregate, report))
    }

    fn stored_report(&self, iteration_id: i64) -> Result<PerformanceReport, PipelineError> {
        let records = self.db.runs().list_for_iteration(iteration_id)?;
        let runs = records
            .iter()
            .map(EvaluationRun::from_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PerformanceReport::from_runs(&runs, &self.rubric))
    }

    /// Run the persona suite and store every run, failed ones included.
    async fn evaluate(
        &self,
        iteration_id: i64,
        prompt: &str,
    ) -> Result<Vec<EvaluationRun>, PipelineError> {
        let result = tokio::select! {
            result = self.harness.evaluate(iteration_id, prompt, self.suite.personas()) => result,
            _ = wait_for_interrupt(&self.interrupted) => return Err(PipelineError::Cancelled),
        };

        let runs = match result {
            Ok(runs) => runs,
            Err(HarnessError::NoSuccessfulPersonas { failed, runs }) => {
                self.store_runs(&runs)?;
                return Err(HarnessError::NoSuccessfulPersonas { failed, runs }.into());
            }
            Err(e) => return Err(e.into()),
        };

        self.store_runs(&runs)?;

        let scored: Vec<f64> = runs.iter().filter_map(|r| r.aggregate()).collect();
        self.logger.log(&LogEvent::EvaluationCompleted {
            iteration_id,
            scored: scored.len(),
            failed: runs.len() - scored.len(),
            aggregate_score: scored.iter().sum::<f64>() / scored.len().max(1) as f64,
        });

        Ok(runs)
    }

    fn store_runs(&self, runs: &[EvaluationRun]) -> Result<(), PipelineError> {
        for run in runs {
            if !self.db.runs().insert(&run.to_record()?)? {
                debug!(
                    iteration_id = run.iteration_id,
                    persona = %run.persona_id,
                    "Persona already scored; keeping the stored run"
                );
            }

            match run.aggregate() {
                Some(aggregate_score) => self.logger.log(&LogEvent::PersonaSimulated {
                    iteration_id: run.iteration_id,
                    persona_id: run.persona_id.clone(),
                    turns: run.agent_turns(),
                    completion: run
                        .completion
                        .as_ref()
                        .map(|c| c.as_str().to_string())
                        .unwrap_or_default(),
                    aggregate_score,
                }),
                None => self.logger.log(&LogEvent::PersonaFailed {
                    iteration_id: run.iteration_id,
                    persona_id: run.persona_id.clone(),
                    error: match &run.outcome {
                        crate::RunOutcome::Failed { reason } => reason.clone(),
                        crate::RunOutcome::Scored { .. } => String::new(),
                    },
                }),
            }
        }
        Ok(())
    }

    fn save_snapshot(&self, snapshot: &PerformanceSnapshot) -> Result<(), PipelineError> {
        self.db.snapshots().save(&snapshot.to_record()?)?;
        Ok(())
    }

    fn require_min_personas(&self, report: &PerformanceReport) -> Result<(), PipelineError> {
        let required = self.settings.min_personas.min(self.suite.len());
        if report.scored() < required {
            return Err(PipelineError::InsufficientPersonas {
                succeeded: report.scored(),
                required,
            });
        }
        if !report.failed_personas.is_empty() {
            warn!(
                failed = ?report.failed_personas,
                scored = report.scored(),
                "Proceeding with partial evaluation"
            );
        }
        Ok(())
    }

    fn check_interrupt(&self) -> Result<(), PipelineError> {
        if self.interrupted.load(Ordering::SeqCst) {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    pub fn get_status(&self) -> Result<StatusReport, PipelineError> {
        let active = self.manager.active()?;
        let total_iterations = self.db.iterations().count()?;
        let pending_calls = self.pending_call_ids()?.len();

        Ok(StatusReport {
            active_iteration_id: active.id,
            active_score: active.aggregate_score,
            prompt_hash: active.prompt_hash,
            active_since: active.created_at,
            total_iterations,
            pending_calls,
        })
    }

    /// Calls that can be evaluated, newest first
    pub fn list_evaluable_calls(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<CallSummary>, PipelineError> {
        let records = self.db.calls().list(&CallFilter {
            unprocessed: false,
            limit,
        })?;

        let mut summaries = Vec::new();
        for record in records {
            let call = Call::from_record(&record)?;
            if !call.is_evaluable() {
                continue;
            }
            let latest = self.db.pipeline_runs().latest_for_call(&call.id)?;
            summaries.push(CallSummary::new(&call, latest.as_ref()));
        }
        Ok(summaries)
    }

    /// Evaluable calls with no finished pipeline run, oldest first
    pub fn pending_call_ids(&self) -> Result<Vec<String>, PipelineError> {
        let records = self.db.calls().list(&CallFilter {
            unprocessed: true,
            limit: None,
        })?;

        let mut ids = Vec::new();
        for record in records.iter().rev() {
            if Call::from_record(record)?.is_evaluable() {
                ids.push(record.id.clone());
            }
        }
        Ok(ids)
    }
}

async fn wait_for_interrupt(flag: &AtomicBool) {
    while !flag.load(Ordering::SeqCst) {
        tokio::time::sleep(INTERRUPT_POLL).await;
    }
}
