use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use promptloop_agent::{GenerationConfig, Generator, GeneratorError, GeneratorOutput};
use promptloop_core::{
    Call, EvaluationHarness, FailureKind, HarnessConfig, IterationManager, IterationStatus,
    PerformanceSnapshot, PersonaSuite, PipelineOutcome, PipelineQueue, PipelineRunner,
    PromptImprover, RollbackReason, TranscriptSegment, DEFAULT_BASELINE_PROMPT,
};
use promptloop_db::Database;
use promptloop_judge::Judge;
use promptloop_logging::{LogFormat, Logger};

const CANDIDATE_EDIT: &str =
    "- Show empathy and understanding; acknowledge feelings before discussing payment";
const CANDIDATE_LINE: &str = "I hear you, and I want to help you find a plan that works.";
const BASELINE_LINE: &str = "Can you confirm your date of birth?";
const CALL_LINE: &str = "Customer: My hours were cut at the warehouse.";
const CALL_SUGGESTION: &str = "Offer a hardship plan as soon as reduced income comes up";
const CALL_ISSUE: &str = "Asked for the full balance after hearing about reduced hours";

fn improved_prompt() -> String {
    DEFAULT_BASELINE_PROMPT.replacen("- Show empathy and understanding", CANDIDATE_EDIT, 1)
}

// ============================================================
// Fake collaborators
// ============================================================

/// Voice agent: speaks differently once the prompt carries the edit.
struct Agent {
    calls: AtomicUsize,
}

#[async_trait]
impl Generator for Agent {
    fn name(&self) -> &str {
        "agent"
    }

    async fn generate(
        &self,
        prompt: &str,
        _config: &GenerationConfig,
    ) -> Result<GeneratorOutput, GeneratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if prompt.contains("acknowledge feelings before discussing payment") {
            Ok(GeneratorOutput::from_text(CANDIDATE_LINE))
        } else {
            Ok(GeneratorOutput::from_text(BASELINE_LINE))
        }
    }
}

fn scores(v: f64, suggestion: &str, issues: &[&str]) -> GeneratorOutput {
    let issues = issues
        .iter()
        .map(|i| format!("\"{}\"", i))
        .collect::<Vec<_>>()
        .join(", ");
    GeneratorOutput::from_text(format!(
        r#"<scores>{{"scores": {{"professionalism": {v}, "empathy": {v}, "compliance": {v}, "resolution": {v}, "escalation_handling": {v}}}, "feedback": "fine", "improvement_suggestions": ["{suggestion}"], "failure_reasons": [{issues}]}}</scores>"#
    ))
}

/// Judge: uniform scores per prompt version, optionally failing candidate
/// conversations for the named personas. The recorded call gets its own
/// feedback.
struct ScoringJudge {
    baseline: f64,
    candidate: f64,
    fail_for: Vec<String>,
}

#[async_trait]
impl Generator for ScoringJudge {
    fn name(&self) -> &str {
        "judge"
    }

    async fn generate(
        &self,
        prompt: &str,
        _config: &GenerationConfig,
    ) -> Result<GeneratorOutput, GeneratorError> {
        let is_candidate = prompt.contains(CANDIDATE_LINE);
        let failing = self
            .fail_for
            .iter()
            .any(|name| prompt.contains(&format!("## Customer Persona\n{}:", name)));
        if is_candidate && failing {
            return Err(GeneratorError::ExecutionFailed("judge unavailable".into()));
        }

        if prompt.contains(CALL_LINE) {
            return Ok(scores(5.0, CALL_SUGGESTION, &[CALL_ISSUE]));
        }
        let v = if is_candidate {
            self.candidate
        } else {
            self.baseline
        };
        Ok(scores(v, "Acknowledge hardship earlier", &[]))
    }
}

/// Judge whose baseline scores change after the first full suite.
struct DriftingJudge {
    baseline_calls: AtomicUsize,
}

#[async_trait]
impl Generator for DriftingJudge {
    fn name(&self) -> &str {
        "drifting-judge"
    }

    async fn generate(
        &self,
        prompt: &str,
        _config: &GenerationConfig,
    ) -> Result<GeneratorOutput, GeneratorError> {
        if prompt.contains(CANDIDATE_LINE) {
            return Ok(scores(8.0, "Keep it up", &[]));
        }
        if prompt.contains(BASELINE_LINE) {
            let n = self.baseline_calls.fetch_add(1, Ordering::SeqCst);
            let v = if n < 8 { 7.0 } else { 9.0 };
            return Ok(scores(v, "Acknowledge hardship earlier", &[]));
        }
        Ok(scores(7.0, CALL_SUGGESTION, &[]))
    }
}

/// Improver: answers with a fixed prompt, or never answers. Keeps every
/// request it was sent.
struct Improver {
    reply: Option<String>,
    requests: Mutex<Vec<String>>,
}

#[async_trait]
impl Generator for Improver {
    fn name(&self) -> &str {
        "improver"
    }

    async fn generate(
        &self,
        prompt: &str,
        _config: &GenerationConfig,
    ) -> Result<GeneratorOutput, GeneratorError> {
        self.requests.lock().unwrap().push(prompt.to_string());
        match &self.reply {
            Some(reply) => Ok(GeneratorOutput::from_text(reply.clone())),
            None => std::future::pending().await,
        }
    }
}

// ============================================================
// Helpers
// ============================================================

struct Fixture {
    db: Arc<Database>,
    manager: Arc<IterationManager>,
    agent: Arc<Agent>,
    improver: Arc<Improver>,
    runner: Arc<PipelineRunner>,
}

async fn fixture(judge: ScoringJudge, improver_reply: Option<String>) -> Fixture {
    fixture_with(Arc::new(judge), improver_reply).await
}

async fn fixture_with(judge: Arc<dyn Generator>, improver_reply: Option<String>) -> Fixture {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let manager = Arc::new(IterationManager::new(db.clone(), 0.0));
    manager.seed(DEFAULT_BASELINE_PROMPT).await.unwrap();

    let agent = Arc::new(Agent {
        calls: AtomicUsize::new(0),
    });
    let judge = Arc::new(Judge::new(judge, GenerationConfig::default()));
    let harness = Arc::new(EvaluationHarness::new(
        agent.clone(),
        judge,
        HarnessConfig {
            turn_cap: 3,
            ..HarnessConfig::default()
        },
    ));
    let improver = Arc::new(Improver {
        reply: improver_reply,
        requests: Mutex::new(Vec::new()),
    });
    let prompt_improver = Arc::new(PromptImprover::new(
        improver.clone(),
        GenerationConfig::default(),
    ));

    let runner = Arc::new(PipelineRunner::new(
        db.clone(),
        manager.clone(),
        harness,
        prompt_improver,
        Arc::new(Logger::new(LogFormat::Compact)),
    ));

    Fixture {
        db,
        manager,
        agent,
        improver,
        runner,
    }
}

fn judge(baseline: f64, candidate: f64) -> ScoringJudge {
    ScoringJudge {
        baseline,
        candidate,
        fail_for: Vec::new(),
    }
}

fn store_call(db: &Database, id: &str, risk_tags: &[&str]) {
    let call = Call {
        id: id.to_string(),
        transcript: vec![
            TranscriptSegment {
                speaker: "agent".into(),
                text: "Hi, this is Tira calling from Riverline Bank.".into(),
            },
            TranscriptSegment {
                speaker: "customer".into(),
                text: "My hours were cut at the warehouse.".into(),
            },
        ],
        risk_tags: risk_tags.iter().map(|s| s.to_string()).collect(),
        timestamp: chrono::Utc::now(),
        active_iteration_id: Some(1),
    };
    assert!(db.calls().insert(&call.to_record().unwrap()).unwrap());
}

fn persona_names(count: usize) -> Vec<String> {
    PersonaSuite::default_catalogue()
        .iter()
        .take(count)
        .map(|p| p.name.clone())
        .collect()
}

// ============================================================
// Promotion and rollback
// ============================================================

#[tokio::test]
async fn test_improved_candidate_is_promoted() {
    let f = fixture(judge(7.2, 7.5), Some(improved_prompt())).await;
    store_call(&f.db, "call-1", &["financial_hardship"]);

    let result = f.runner.run("call-1").await;

    match &result.outcome {
        PipelineOutcome::Promoted {
            candidate_id,
            superseded_id,
            candidate_score,
            previous_score,
            delta,
        } => {
            assert_eq!(*superseded_id, 1);
            assert!((candidate_score - 7.5).abs() < 1e-9);
            assert!((previous_score - 7.2).abs() < 1e-9);
            assert!((delta - 0.3).abs() < 1e-9);

            let active = f.manager.active().unwrap();
            assert_eq!(active.id, *candidate_id);
            assert_eq!(active.parent_id, Some(1));
            assert_eq!(f.manager.get(1).unwrap().status, IterationStatus::Superseded);
        }
        other => panic!("expected promotion, got {:?}", other),
    }
    assert_eq!(result.scores.len(), 8);
    assert_eq!(result.outcome.exit_code(), 0);

    // Baseline evaluated once and kept
    let baseline = f.manager.get(1).unwrap();
    assert!((baseline.aggregate_score.unwrap() - 7.2).abs() < 1e-9);
    assert_eq!(f.db.runs().list_for_iteration(1).unwrap().len(), 8);
    assert!(f.db.snapshots().get(1).unwrap().is_some());
}

#[tokio::test]
async fn test_recorded_call_feedback_reaches_improver() {
    let f = fixture(judge(7.2, 7.5), Some(improved_prompt())).await;
    store_call(&f.db, "call-1", &["financial_hardship"]);

    let result = f.runner.run("call-1").await;
    assert!(result.promoted(), "got {:?}", result.outcome);

    let requests = f.improver.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert!(request.contains(&format!("- {}", CALL_SUGGESTION)));
    assert!(request.contains(&format!("- {}", CALL_ISSUE)));
    assert!(request.contains("- Acknowledge hardship earlier"));
    assert!(request.contains("Most recent real call, judged against each persona: 5.00/10"));
    // Every dimension of the call scored 5.0, below the 7.0 threshold
    assert!(request.contains("- empathy: mean 5.0"));

    // Call feedback is ranked ahead of simulated feedback
    let call_at = request.find(CALL_SUGGESTION).unwrap();
    let baseline_at = request.find("- Acknowledge hardship earlier").unwrap();
    assert!(call_at < baseline_at);

    // Analysis never touches the stored baseline
    assert!((f.manager.get(1).unwrap().aggregate_score.unwrap() - 7.2).abs() < 1e-9);
}

#[tokio::test]
async fn test_regression_is_rolled_back() {
    let f = fixture(judge(7.2, 6.0), Some(improved_prompt())).await;
    store_call(&f.db, "call-1", &[]);

    let result = f.runner.run("call-1").await;

    match &result.outcome {
        PipelineOutcome::RolledBack {
            candidate_id,
            reason: RollbackReason::Regression { delta, .. },
        } => {
            assert!((delta + 1.2).abs() < 1e-9);
            let candidate = f.manager.get(*candidate_id).unwrap();
            assert_eq!(candidate.status, IterationStatus::RolledBack);
            assert!(candidate.status_reason.unwrap().starts_with("regression"));

            // The attempted delta is kept for audit
            let record = f.db.snapshots().get(*candidate_id).unwrap().unwrap();
            let snapshot = PerformanceSnapshot::from_record(&record).unwrap();
            assert_eq!(snapshot.baseline_id, Some(1));
            assert!((snapshot.delta.unwrap() + 1.2).abs() < 1e-9);
        }
        other => panic!("expected regression rollback, got {:?}", other),
    }

    assert_eq!(f.manager.active().unwrap().id, 1);
    assert_eq!(result.outcome.exit_code(), 1);
}

#[tokio::test]
async fn test_invalid_candidate_is_never_evaluated() {
    let f = fixture(
        judge(7.2, 9.0),
        Some("You are Tira. Be nice to {customer_name}.".to_string()),
    )
    .await;
    store_call(&f.db, "call-1", &[]);

    let result = f.runner.run("call-1").await;

    let PipelineOutcome::RolledBack {
        candidate_id,
        reason: RollbackReason::Validation { violated },
    } = &result.outcome
    else {
        panic!("expected validation rollback, got {:?}", result.outcome);
    };
    assert!(violated.contains(&"structure".to_string()));
    assert!(violated.contains(&"length".to_string()));
    assert!(violated.contains(&"placeholders".to_string()));

    assert!(f.db.runs().list_for_iteration(*candidate_id).unwrap().is_empty());
    let candidate = f.manager.get(*candidate_id).unwrap();
    assert_eq!(candidate.status, IterationStatus::RolledBack);
    assert!(candidate.validation.is_some_and(|v| !v.passed));
    assert_eq!(f.manager.active().unwrap().id, 1);
}

#[tokio::test]
async fn test_unchanged_candidate_is_rejected() {
    let f = fixture(judge(7.2, 7.2), Some(DEFAULT_BASELINE_PROMPT.to_string())).await;
    store_call(&f.db, "call-1", &[]);

    let result = f.runner.run("call-1").await;

    match result.outcome {
        PipelineOutcome::RolledBack {
            reason: RollbackReason::Validation { violated },
            ..
        } => assert_eq!(violated, vec!["unchanged".to_string()]),
        other => panic!("expected validation rollback, got {:?}", other),
    }
}

// ============================================================
// Partial evaluation
// ============================================================

#[tokio::test]
async fn test_partial_evaluation_above_minimum_proceeds() {
    let mut j = judge(7.2, 7.5);
    j.fail_for = persona_names(2);
    let f = fixture(j, Some(improved_prompt())).await;
    store_call(&f.db, "call-1", &[]);

    let result = f.runner.run("call-1").await;

    assert!(result.promoted(), "got {:?}", result.outcome);
    assert_eq!(result.scores.len(), 6);

    let candidate_id = result.new_iteration_id().unwrap();
    let runs = f.db.runs().list_for_iteration(candidate_id).unwrap();
    assert_eq!(runs.len(), 8);
}

#[tokio::test]
async fn test_partial_evaluation_below_minimum_fails() {
    let mut j = judge(7.2, 9.0);
    j.fail_for = persona_names(4);
    let f = fixture(j, Some(improved_prompt())).await;
    store_call(&f.db, "call-1", &[]);

    let result = f.runner.run("call-1").await;

    match &result.outcome {
        PipelineOutcome::Failed {
            kind, candidate_id, ..
        } => {
            assert_eq!(*kind, FailureKind::TransientExternalFailure);
            let candidate = f.manager.get(candidate_id.unwrap()).unwrap();
            assert_eq!(candidate.status, IterationStatus::Validated);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(f.manager.active().unwrap().id, 1);
    assert_eq!(result.outcome.exit_code(), 2);
}

// ============================================================
// Failures and cancellation
// ============================================================

#[tokio::test]
async fn test_unknown_call_fails_with_not_found() {
    let f = fixture(judge(7.2, 7.5), Some(improved_prompt())).await;

    let result = f.runner.run("missing").await;

    match result.outcome {
        PipelineOutcome::Failed {
            kind, candidate_id, ..
        } => {
            assert_eq!(kind, FailureKind::NotFound);
            assert_eq!(candidate_id, None);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(f.agent.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_interrupt_before_start_cancels() {
    let f = fixture(judge(7.2, 7.5), Some(improved_prompt())).await;
    store_call(&f.db, "call-1", &[]);

    f.runner.interrupt_handle().store(true, Ordering::SeqCst);
    let result = f.runner.run("call-1").await;

    assert_eq!(result.outcome, PipelineOutcome::Cancelled { candidate_id: None });
    assert_eq!(result.outcome.exit_code(), 130);
    assert_eq!(f.agent.calls.load(Ordering::SeqCst), 0);
    assert_eq!(f.db.iterations().count().unwrap(), 1);
}

#[tokio::test]
async fn test_interrupt_while_improving_cancels() {
    let f = fixture(judge(7.2, 7.5), None).await;
    store_call(&f.db, "call-1", &[]);

    let handle = f.runner.interrupt_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.store(true, Ordering::SeqCst);
    });

    let result = f.runner.run("call-1").await;

    assert_eq!(result.outcome, PipelineOutcome::Cancelled { candidate_id: None });
    assert_eq!(f.manager.active().unwrap().id, 1);
    assert_eq!(f.db.iterations().count().unwrap(), 1);

    // The run is recorded as finished
    let latest = f.db.pipeline_runs().latest_for_call("call-1").unwrap().unwrap();
    assert!(latest.outcome.unwrap().contains("cancelled"));
}

// ============================================================
// Concurrency and bookkeeping
// ============================================================

#[tokio::test]
async fn test_concurrent_runs_keep_one_active() {
    let f = fixture(judge(7.2, 7.5), Some(improved_prompt())).await;
    store_call(&f.db, "call-1", &[]);
    store_call(&f.db, "call-2", &["abusive_language"]);

    let (a, b) = tokio::join!(f.runner.run("call-1"), f.runner.run("call-2"));

    for result in [&a, &b] {
        assert!(
            !matches!(result.outcome, PipelineOutcome::Failed { .. }),
            "got {:?}",
            result.outcome
        );
    }
    assert!(a.promoted() || b.promoted());
    assert_eq!(f.db.iterations().active().unwrap().len(), 1);
    f.manager.check_invariant().unwrap();

    // Versions only grow
    let ids: Vec<i64> = f.manager.history().unwrap().iter().map(|i| i.id).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_concurrent_runs_share_one_baseline() {
    let drifting = Arc::new(DriftingJudge {
        baseline_calls: AtomicUsize::new(0),
    });
    let f = fixture_with(drifting.clone(), Some(improved_prompt())).await;
    store_call(&f.db, "call-1", &[]);
    store_call(&f.db, "call-2", &[]);

    let (a, b) = tokio::join!(f.runner.run("call-1"), f.runner.run("call-2"));
    for result in [&a, &b] {
        assert!(
            !matches!(result.outcome, PipelineOutcome::Failed { .. }),
            "got {:?}",
            result.outcome
        );
    }

    // The baseline suite ran once, and its score matches its stored runs
    assert_eq!(drifting.baseline_calls.load(Ordering::SeqCst), 8);
    let stored = f.manager.get(1).unwrap().aggregate_score.unwrap();
    let runs = f.db.runs().list_for_iteration(1).unwrap();
    let mean = runs.iter().filter_map(|r| r.aggregate_score).sum::<f64>() / runs.len() as f64;
    assert_eq!(runs.len(), 8);
    assert!((stored - mean).abs() < 1e-9);
    assert!((stored - 7.0).abs() < 1e-9);

    // The run that replaced the seed compared against that score
    let replaced_seed = [&a, &b].into_iter().find_map(|r| match &r.outcome {
        PipelineOutcome::Promoted {
            superseded_id: 1,
            previous_score,
            ..
        } => Some(*previous_score),
        _ => None,
    });
    assert!((replaced_seed.unwrap() - 7.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_status_and_call_listing() {
    let f = fixture(judge(7.2, 7.5), Some(improved_prompt())).await;
    store_call(&f.db, "call-1", &[]);
    store_call(&f.db, "call-2", &[]);

    let status = f.runner.get_status().unwrap();
    assert_eq!(status.active_iteration_id, 1);
    assert_eq!(status.active_score, None);
    assert_eq!(status.pending_calls, 2);

    let result = f.runner.run("call-1").await;
    assert!(result.promoted());

    let status = f.runner.get_status().unwrap();
    assert_eq!(status.active_iteration_id, result.new_iteration_id().unwrap());
    assert_eq!(status.total_iterations, 2);
    assert_eq!(status.pending_calls, 1);
    assert_eq!(f.runner.pending_call_ids().unwrap(), vec!["call-2".to_string()]);

    let calls = f.runner.list_evaluable_calls(None).unwrap();
    assert_eq!(calls.len(), 2);
    let processed = calls.iter().find(|c| c.id == "call-1").unwrap();
    assert_eq!(processed.last_outcome.as_deref(), Some("promoted"));
}

#[tokio::test]
async fn test_queue_processes_each_call_once() {
    let f = fixture(judge(7.2, 6.0), Some(improved_prompt())).await;
    store_call(&f.db, "call-1", &[]);
    store_call(&f.db, "call-2", &[]);

    let queue = PipelineQueue::start(f.runner.clone(), 2, 8);
    queue.submit("call-1").await.unwrap();
    queue.submit("call-2").await.unwrap();
    queue.submit("call-1").await.unwrap();

    let results = queue.shutdown().await;

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| !r.promoted()));
    assert_eq!(f.manager.active().unwrap().id, 1);
}

#[tokio::test]
async fn test_queue_accepts_call_again_after_it_finished() {
    let f = fixture(judge(7.2, 6.0), Some(improved_prompt())).await;
    store_call(&f.db, "call-1", &[]);

    let queue = PipelineQueue::start(f.runner.clone(), 1, 8);
    queue.submit("call-1").await.unwrap();
    while f
        .db
        .pipeline_runs()
        .latest_for_call("call-1")
        .unwrap()
        .and_then(|run| run.outcome)
        .is_none()
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Reprocessing a finished call is allowed
    queue.submit("call-1").await.unwrap();
    let results = queue.shutdown().await;

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.call_id == "call-1"));
    assert_eq!(f.manager.active().unwrap().id, 1);
}

#[tokio::test]
async fn test_history_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("promptloop.db");

    {
        let db = Arc::new(Database::open_at(&path).unwrap());
        let manager = IterationManager::new(db, 0.0);
        manager.seed(DEFAULT_BASELINE_PROMPT).await.unwrap();
    }

    let db = Arc::new(Database::open_at(&path).unwrap());
    let manager = IterationManager::new(db, 0.0);
    let active = manager.active().unwrap();
    assert_eq!(active.id, 1);
    assert_eq!(active.prompt_hash, promptloop_core::prompt_hash(DEFAULT_BASELINE_PROMPT));
    assert!(manager.seed("another").await.is_err());
}
