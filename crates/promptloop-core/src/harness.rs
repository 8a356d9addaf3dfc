//! Persona simulations and judge scoring for one prompt.
//!
//! Every persona runs in its own task. A persona whose simulation or
//! scoring fails becomes a Failed run and is left out of aggregation; the
//! batch only fails when no persona could be scored. The recorded call is
//! judged the same way, once per persona.

use chrono::{DateTime, Utc};
use promptloop_agent::{GenerationConfig, Generator, GeneratorError};
use promptloop_db::EvaluationRunRecord;
use promptloop_judge::{Judge, JudgeError, JudgeInput, Judgement, Scorecard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::personas::ReplyEffect;
use crate::prompts::render_transcript;
use crate::{Call, CallAnalysis, HarnessError, PerformanceReport, Persona, SimulationPrompts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Agent,
    Customer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
}

impl Turn {
    pub fn agent(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Agent,
            text: text.into(),
        }
    }

    pub fn customer(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Customer,
            text: text.into(),
        }
    }
}

/// How a simulated conversation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    GoalReached,
    Terminated,
    /// Stopped at the turn cap
    Incomplete,
}

impl Completion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Completion::GoalReached => "goal_reached",
            Completion::Terminated => "terminated",
            Completion::Incomplete => "incomplete",
        }
    }
}

impl std::str::FromStr for Completion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "goal_reached" => Ok(Completion::GoalReached),
            "terminated" => Ok(Completion::Terminated),
            "incomplete" => Ok(Completion::Incomplete),
            _ => Err(format!("Unknown completion: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Scored { scorecard: Scorecard, aggregate: f64 },
    Failed { reason: String },
}

/// One persona's simulated conversation and its score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRun {
    pub id: String,
    pub iteration_id: i64,
    pub persona_id: String,
    pub transcript: Vec<Turn>,
    /// None when the simulation itself failed
    pub completion: Option<Completion>,
    pub outcome: RunOutcome,
    pub timestamp: DateTime<Utc>,
}

impl EvaluationRun {
    pub fn is_scored(&self) -> bool {
        matches!(self.outcome, RunOutcome::Scored { .. })
    }

    pub fn aggregate(&self) -> Option<f64> {
        match &self.outcome {
            RunOutcome::Scored { aggregate, .. } => Some(*aggregate),
            RunOutcome::Failed { .. } => None,
        }
    }

    pub fn scorecard(&self) -> Option<&Scorecard> {
        match &self.outcome {
            RunOutcome::Scored { scorecard, .. } => Some(scorecard),
            RunOutcome::Failed { .. } => None,
        }
    }

    pub fn agent_turns(&self) -> usize {
        self.transcript
            .iter()
            .filter(|t| t.speaker == Speaker::Agent)
            .count()
    }

    pub fn to_record(&self) -> Result<EvaluationRunRecord, serde_json::Error> {
        let (status, scorecard, aggregate, error) = match &self.outcome {
            RunOutcome::Scored {
                scorecard,
                aggregate,
            } => (
                "scored",
                Some(serde_json::to_string(scorecard)?),
                Some(*aggregate),
                None,
            ),
            RunOutcome::Failed { reason } => ("failed", None, None, Some(reason.clone())),
        };

        Ok(EvaluationRunRecord {
            id: self.id.clone(),
            iteration_id: self.iteration_id,
            persona_id: self.persona_id.clone(),
            transcript: serde_json::to_string(&self.transcript)?,
            completion: self
                .completion
                .map(|c| c.as_str().to_string())
                .unwrap_or_default(),
            status: status.to_string(),
            scorecard,
            aggregate_score: aggregate,
            error,
            created_at: self.timestamp,
        })
    }

    pub fn from_record(record: &EvaluationRunRecord) -> Result<Self, serde_json::Error> {
        let outcome = match (&record.scorecard, record.aggregate_score) {
            (Some(card), Some(aggregate)) if record.status == "scored" => RunOutcome::Scored {
                scorecard: serde_json::from_str(card)?,
                aggregate,
            },
            _ => RunOutcome::Failed {
                reason: record.error.clone().unwrap_or_default(),
            },
        };

        Ok(Self {
            id: record.id.clone(),
            iteration_id: record.iteration_id,
            persona_id: record.persona_id.clone(),
            transcript: serde_json::from_str(&record.transcript)?,
            completion: record.completion.parse().ok(),
            outcome,
            timestamp: record.created_at,
        })
    }
}

/// Fill `{name}` placeholders from `values`; unknown tokens are left as-is.
pub fn render_placeholders(template: &str, values: &BTreeMap<String, String>) -> String {
    values.iter().fold(template.to_string(), |text, (key, value)| {
        text.replace(&format!("{{{}}}", key), value)
    })
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Maximum agent turns per conversation
    pub turn_cap: usize,
    /// Applied to every agent generation request
    pub generation: GenerationConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            turn_cap: 12,
            generation: GenerationConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum SimulationError {
    #[error("simulation failed after {turns} agent turns: {source}")]
    Agent {
        turns: usize,
        transcript: Vec<Turn>,
        source: GeneratorError,
    },

    #[error("judge failed: {source}")]
    Judge {
        transcript: Vec<Turn>,
        completion: Completion,
        source: JudgeError,
    },
}

/// Runs a prompt against a persona suite.
pub struct EvaluationHarness {
    agent: Arc<dyn Generator>,
    judge: Arc<Judge>,
    config: HarnessConfig,
}

impl EvaluationHarness {
    pub fn new(agent: Arc<dyn Generator>, judge: Arc<Judge>, config: HarnessConfig) -> Self {
        Self {
            agent,
            judge,
            config: HarnessConfig {
                turn_cap: config.turn_cap.max(1),
                ..config
            },
        }
    }

    pub fn turn_cap(&self) -> usize {
        self.config.turn_cap
    }

    /// Simulate and score `prompt` against every persona.
    ///
    /// Runs come back in persona order. Dropping the returned future aborts
    /// the in-flight persona tasks.
    pub async fn evaluate(
        &self,
        iteration_id: i64,
        prompt: &str,
        personas: &[Persona],
    ) -> Result<Vec<EvaluationRun>, HarnessError> {
        if personas.is_empty() {
            return Err(HarnessError::NoPersonas);
        }

        let prompt: Arc<str> = Arc::from(prompt);
        let mut tasks = JoinSet::new();

        for (index, persona) in personas.iter().enumerate() {
            let agent = self.agent.clone();
            let judge = self.judge.clone();
            let config = self.config.clone();
            let persona = persona.clone();
            let prompt = prompt.clone();

            tasks.spawn(async move {
                let run = run_persona(iteration_id, &prompt, &persona, agent, judge, &config).await;
                (index, run)
            });
        }

        let mut slots: Vec<Option<EvaluationRun>> = vec![None; personas.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, run)) => slots[index] = Some(run),
                Err(e) => warn!(error = %e, "Persona task did not complete"),
            }
        }

        let runs: Vec<EvaluationRun> = slots
            .into_iter()
            .zip(personas)
            .map(|(slot, persona)| {
                slot.unwrap_or_else(|| {
                    failed_run(iteration_id, persona, Vec::new(), None, "simulation task panicked")
                })
            })
            .collect();

        let scored = runs.iter().filter(|r| r.is_scored()).count();
        if scored == 0 {
            return Err(HarnessError::NoSuccessfulPersonas {
                failed: runs.len(),
                runs,
            });
        }

        debug!(iteration_id, scored, total = runs.len(), "Evaluation batch finished");
        Ok(runs)
    }

    /// Score the recorded call against every persona's expectations.
    ///
    /// A persona the judge cannot score is left out; the analysis fails
    /// only when no persona could be scored.
    pub async fn analyze_call(
        &self,
        call: &Call,
        personas: &[Persona],
    ) -> Result<CallAnalysis, HarnessError> {
        if personas.is_empty() {
            return Err(HarnessError::NoPersonas);
        }

        let transcript: Arc<str> = Arc::from(call.render_transcript());
        let mut tasks = JoinSet::new();

        for (index, persona) in personas.iter().enumerate() {
            let judge = self.judge.clone();
            let persona = persona.clone();
            let transcript = transcript.clone();

            tasks.spawn(async move {
                let input = JudgeInput {
                    persona_name: &persona.name,
                    persona_description: &persona.description,
                    expected_behavior: &persona.expected_behavior,
                    success_criteria: &persona.success_criteria,
                    transcript: &transcript,
                };
                (index, judge.score(input).await)
            });
        }

        let mut judgements: Vec<Option<Judgement>> = vec![None; personas.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(judgement))) => judgements[index] = Some(judgement),
                Ok((index, Err(e))) => warn!(
                    call_id = %call.id,
                    persona = %personas[index].id,
                    error = %e,
                    "Could not score recorded call"
                ),
                Err(e) => warn!(error = %e, "Call scoring task did not complete"),
            }
        }

        let report = PerformanceReport::from_scorecards(
            personas.iter().zip(&judgements).map(|(persona, judgement)| {
                (
                    persona.id.as_str(),
                    judgement.as_ref().map(|j| (&j.scorecard, j.aggregate)),
                )
            }),
            self.judge.rubric(),
        );

        if report.scored() == 0 {
            return Err(HarnessError::CallNotScored {
                call_id: call.id.clone(),
                failed: personas.len(),
            });
        }

        debug!(
            call_id = %call.id,
            scored = report.scored(),
            average = format!("{:.2}", report.aggregate),
            "Recorded call scored"
        );
        Ok(CallAnalysis {
            call_id: call.id.clone(),
            report,
        })
    }
}

async fn run_persona(
    iteration_id: i64,
    prompt: &str,
    persona: &Persona,
    agent: Arc<dyn Generator>,
    judge: Arc<Judge>,
    config: &HarnessConfig,
) -> EvaluationRun {
    match simulate_and_score(prompt, persona, agent.as_ref(), &judge, config).await {
        Ok((transcript, completion, judgement)) => EvaluationRun {
            id: uuid::Uuid::new_v4().to_string(),
            iteration_id,
            persona_id: persona.id.clone(),
            transcript,
            completion: Some(completion),
            outcome: RunOutcome::Scored {
                aggregate: judgement.aggregate,
                scorecard: judgement.scorecard,
            },
            timestamp: Utc::now(),
        },
        Err(e) => {
            warn!(iteration_id, persona = %persona.id, error = %e, "Persona run failed");
            let reason = e.to_string();
            match e {
                SimulationError::Agent { transcript, .. } => {
                    failed_run(iteration_id, persona, transcript, None, &reason)
                }
                SimulationError::Judge {
                    transcript,
                    completion,
                    ..
                } => failed_run(iteration_id, persona, transcript, Some(completion), &reason),
            }
        }
    }
}

fn failed_run(
    iteration_id: i64,
    persona: &Persona,
    transcript: Vec<Turn>,
    completion: Option<Completion>,
    reason: &str,
) -> EvaluationRun {
    EvaluationRun {
        id: uuid::Uuid::new_v4().to_string(),
        iteration_id,
        persona_id: persona.id.clone(),
        transcript,
        completion,
        outcome: RunOutcome::Failed {
            reason: reason.to_string(),
        },
        timestamp: Utc::now(),
    }
}

async fn simulate_and_score(
    prompt: &str,
    persona: &Persona,
    agent: &dyn Generator,
    judge: &Judge,
    config: &HarnessConfig,
) -> Result<(Vec<Turn>, Completion, Judgement), SimulationError> {
    let (transcript, completion) = simulate(prompt, persona, agent, config).await?;

    let rendered = render_transcript(&transcript);
    let input = JudgeInput {
        persona_name: &persona.name,
        persona_description: &persona.description,
        expected_behavior: &persona.expected_behavior,
        success_criteria: &persona.success_criteria,
        transcript: &rendered,
    };

    match judge.score(input).await {
        Ok(judgement) => Ok((transcript, completion, judgement)),
        Err(source) => Err(SimulationError::Judge {
            transcript,
            completion,
            source,
        }),
    }
}

async fn simulate(
    prompt: &str,
    persona: &Persona,
    agent: &dyn Generator,
    config: &HarnessConfig,
) -> Result<(Vec<Turn>, Completion), SimulationError> {
    let system_prompt = render_placeholders(prompt, &persona.profile);
    let mut transcript = vec![Turn::customer(persona.policy.opening_line.clone())];

    for turn in 0..config.turn_cap {
        let request = SimulationPrompts::agent_turn(&system_prompt, &transcript);
        let line = match agent.generate_text(&request, &config.generation).await {
            Ok(text) => clean_agent_line(&text),
            Err(source) => {
                return Err(SimulationError::Agent {
                    turns: turn,
                    transcript,
                    source,
                })
            }
        };

        let reply = persona.respond(turn, &line);
        transcript.push(Turn::agent(line));
        transcript.push(Turn::customer(reply.text));

        match reply.effect {
            ReplyEffect::Continue => {}
            ReplyEffect::GoalReached => return Ok((transcript, Completion::GoalReached)),
            ReplyEffect::Terminated => return Ok((transcript, Completion::Terminated)),
        }
    }

    Ok((transcript, Completion::Incomplete))
}

/// Strip a speaker label the model may have echoed back.
fn clean_agent_line(text: &str) -> String {
    let trimmed = text.trim();
    for label in ["Agent:", "Tira:", "AGENT:"] {
        if let Some(rest) = trimmed.strip_prefix(label) {
            return rest.trim().to_string();
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Archetype, PersonaSuite};
    use async_trait::async_trait;
    use promptloop_agent::GeneratorOutput;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SCORES: &str = r#"<scores>{"scores": {"professionalism": 8, "empathy": 8, "compliance": 8, "resolution": 8, "escalation_handling": 8}, "feedback": "ok", "improvement_suggestions": ["Acknowledge hardship sooner"], "failure_reasons": []}</scores>"#;

    /// Agent that always says the same thing
    struct Fixed(&'static str);

    #[async_trait]
    impl Generator for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn generate(
            &self,
            _prompt: &str,
            _config: &GenerationConfig,
        ) -> Result<GeneratorOutput, GeneratorError> {
            Ok(GeneratorOutput::from_text(self.0))
        }
    }

    /// Fails every request whose prompt mentions the given name
    struct FailsFor {
        name: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Generator for FailsFor {
        fn name(&self) -> &str {
            "fails-for"
        }

        async fn generate(
            &self,
            prompt: &str,
            _config: &GenerationConfig,
        ) -> Result<GeneratorOutput, GeneratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if prompt.contains(self.name) {
                Err(GeneratorError::Timeout(std::time::Duration::from_secs(1)))
            } else {
                Ok(GeneratorOutput::from_text("Agent: Let me explain step by step."))
            }
        }
    }

    /// Judge that cannot score conversations for the named persona, and
    /// records every transcript it was shown
    struct JudgeExcept {
        persona: &'static str,
        seen: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Generator for JudgeExcept {
        fn name(&self) -> &str {
            "judge-except"
        }

        async fn generate(
            &self,
            prompt: &str,
            _config: &GenerationConfig,
        ) -> Result<GeneratorOutput, GeneratorError> {
            self.seen.lock().unwrap().push(prompt.to_string());
            if prompt.contains(&format!("## Customer Persona\n{}:", self.persona)) {
                return Err(GeneratorError::ExecutionFailed("judge unavailable".into()));
            }
            Ok(GeneratorOutput::from_text(SCORES))
        }
    }

    fn recorded_call() -> Call {
        serde_json::from_str(
            r#"{
                "id": "room-5",
                "transcript": [
                    {"speaker": "agent", "text": "This is Tira from Riverline Bank."},
                    {"speaker": "customer", "text": "I was laid off and cannot pay this month."}
                ],
                "risk_tags": ["financial_hardship"]
            }"#,
        )
        .unwrap()
    }

    fn judge() -> Arc<Judge> {
        Arc::new(Judge::new(
            Arc::new(Fixed(SCORES)),
            GenerationConfig::default(),
        ))
    }

    fn harness(agent: Arc<dyn Generator>, turn_cap: usize) -> EvaluationHarness {
        EvaluationHarness::new(
            agent,
            judge(),
            HarnessConfig {
                turn_cap,
                ..HarnessConfig::default()
            },
        )
    }

    #[test]
    fn test_render_placeholders() {
        let persona = Persona::for_archetype(Archetype::Cooperative);
        let text = render_placeholders("Hi {customer_name}, ${balance_amount} {unknown}", &persona.profile);
        assert_eq!(text, "Hi John Doe, $1,500.00 {unknown}");
    }

    #[test]
    fn test_clean_agent_line() {
        assert_eq!(clean_agent_line("  Agent: Hello there. "), "Hello there.");
        assert_eq!(clean_agent_line("Hello."), "Hello.");
    }

    #[tokio::test]
    async fn test_turn_cap_marks_incomplete() {
        let harness = harness(Arc::new(Fixed("Please hold.")), 3);
        let personas = vec![Persona::for_archetype(Archetype::FinancialHardship)];

        let runs = harness.evaluate(1, "You are Tira.", &personas).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].completion, Some(Completion::Incomplete));
        assert_eq!(runs[0].agent_turns(), 3);
        assert!(runs[0].is_scored());
    }

    #[tokio::test]
    async fn test_goal_reached_ends_conversation() {
        let harness = harness(Arc::new(Fixed("We can set up a payment plan for you.")), 10);
        let personas = vec![Persona::for_archetype(Archetype::FinancialHardship)];

        let runs = harness.evaluate(1, "You are Tira.", &personas).await.unwrap();
        assert_eq!(runs[0].completion, Some(Completion::GoalReached));
        assert_eq!(runs[0].agent_turns(), 1);
        assert!((runs[0].aggregate().unwrap() - 8.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failed_persona_does_not_abort_batch() {
        // The Disputing profile renders Mike Johnson into the prompt
        let agent = Arc::new(FailsFor {
            name: "Mike Johnson",
            calls: AtomicUsize::new(0),
        });
        let harness = harness(agent, 4);
        let suite = PersonaSuite::default_catalogue();

        let runs = harness
            .evaluate(7, "You are Tira. Customer: {customer_name}.", suite.personas())
            .await
            .unwrap();

        assert_eq!(runs.len(), 8);
        let failed: Vec<&str> = runs
            .iter()
            .filter(|r| !r.is_scored())
            .map(|r| r.persona_id.as_str())
            .collect();
        assert_eq!(failed, vec!["disputing"]);
        assert!(runs.iter().all(|r| r.iteration_id == 7));
        assert_eq!(runs[0].persona_id, "cooperative");
    }

    #[tokio::test]
    async fn test_zero_successes_is_an_error() {
        let agent = Arc::new(FailsFor {
            name: "You are Tira",
            calls: AtomicUsize::new(0),
        });
        let harness = harness(agent, 4);
        let suite = PersonaSuite::default_catalogue();

        let err = harness
            .evaluate(1, "You are Tira.", suite.personas())
            .await
            .unwrap_err();
        match err {
            HarnessError::NoSuccessfulPersonas { failed, runs } => {
                assert_eq!(failed, 8);
                assert_eq!(runs.len(), 8);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_recorded_call_scored_per_persona() {
        let judge_gen = Arc::new(JudgeExcept {
            persona: "Disputing Customer",
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let judge = Arc::new(Judge::new(judge_gen.clone(), GenerationConfig::default()));
        let agent = Arc::new(FailsFor {
            name: "anything",
            calls: AtomicUsize::new(0),
        });
        let harness = EvaluationHarness::new(agent.clone(), judge, HarnessConfig::default());
        let suite = PersonaSuite::default_catalogue();

        let analysis = harness
            .analyze_call(&recorded_call(), suite.personas())
            .await
            .unwrap();

        assert_eq!(analysis.call_id, "room-5");
        assert_eq!(analysis.report.scored(), 7);
        assert_eq!(analysis.report.failed_personas, vec!["disputing"]);
        assert!((analysis.average_score() - 8.0).abs() < 1e-9);
        assert_eq!(analysis.report.suggestions, vec!["Acknowledge hardship sooner"]);

        // The judge read the real call; nothing was simulated
        let seen = judge_gen.seen.lock().unwrap();
        assert_eq!(seen.len(), 8);
        assert!(seen
            .iter()
            .all(|p| p.contains("Customer: I was laid off and cannot pay this month.")));
        assert_eq!(agent.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unscorable_call_is_an_error() {
        let judge_gen = Arc::new(JudgeExcept {
            persona: "Elderly Customer",
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let harness = EvaluationHarness::new(
            Arc::new(Fixed("unused")),
            Arc::new(Judge::new(judge_gen, GenerationConfig::default())),
            HarnessConfig::default(),
        );
        let personas = vec![Persona::for_archetype(Archetype::Elderly)];

        let err = harness
            .analyze_call(&recorded_call(), &personas)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::CallNotScored { ref call_id, failed: 1 } if call_id == "room-5"
        ));
        assert!(matches!(
            harness.analyze_call(&recorded_call(), &[]).await,
            Err(HarnessError::NoPersonas)
        ));
    }

    #[tokio::test]
    async fn test_record_round_trip_keeps_outcome() {
        let harness = harness(Arc::new(Fixed("Goodbye.")), 2);
        let personas = vec![Persona::for_archetype(Archetype::Cooperative)];
        let runs = harness.evaluate(3, "You are Tira.", &personas).await.unwrap();

        let record = runs[0].to_record().unwrap();
        assert_eq!(record.status, "scored");
        assert_eq!(record.completion, "terminated");

        let restored = EvaluationRun::from_record(&record).unwrap();
        assert_eq!(restored.outcome, runs[0].outcome);
        assert_eq!(restored.transcript, runs[0].transcript);
    }
}
