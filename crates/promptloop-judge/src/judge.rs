use promptloop_agent::{GenerationConfig, Generator, GeneratorError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::{JudgePrompts, Rubric, Scorecard, ScorecardParseError};

/// What the judge needs to know about one simulated conversation.
#[derive(Clone, Copy)]
pub struct JudgeInput<'a> {
    pub persona_name: &'a str,
    pub persona_description: &'a str,
    pub expected_behavior: &'a [String],
    pub success_criteria: &'a [String],
    /// Rendered transcript, one `Speaker: text` line per turn
    pub transcript: &'a str,
}

/// Scores for one conversation, averaged over all judge samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgement {
    pub scorecard: Scorecard,
    /// Weighted mean of `scorecard.scores` under the rubric
    pub aggregate: f64,
    /// Number of judge samples averaged
    pub samples: usize,
}

/// Runs the judge model against the rubric
pub struct Judge {
    generator: Arc<dyn Generator>,
    config: GenerationConfig,
    rubric: Rubric,
    samples: usize,
}

impl Judge {
    pub fn new(generator: Arc<dyn Generator>, config: GenerationConfig) -> Self {
        Self {
            generator,
            config,
            rubric: Rubric::default(),
            samples: 1,
        }
    }

    pub fn with_rubric(mut self, rubric: Rubric) -> Self {
        self.rubric = rubric;
        self
    }

    /// Number of independent judge calls averaged per conversation (min 1)
    pub fn with_samples(mut self, samples: usize) -> Self {
        self.samples = samples.max(1);
        self
    }

    pub fn rubric(&self) -> &Rubric {
        &self.rubric
    }

    /// Score one conversation.
    ///
    /// Every sample must produce a complete, in-range scorecard; the first
    /// failure is returned as-is and no default score is substituted.
    pub async fn score(&self, input: JudgeInput<'_>) -> Result<Judgement, JudgeError> {
        let prompt = JudgePrompts::build_scoring_prompt(&input, &self.rubric);

        debug!(
            persona = input.persona_name,
            prompt_len = prompt.len(),
            samples = self.samples,
            "Running judge"
        );

        let mut cards = Vec::with_capacity(self.samples);
        for sample in 0..self.samples {
            let text = self.generator.generate_text(&prompt, &self.config).await?;
            let card = Scorecard::parse_for(&text, &self.rubric)?;
            debug!(
                persona = input.persona_name,
                sample = sample + 1,
                result = %card.short_description(&self.rubric),
                "Judge sample scored"
            );
            cards.push(card);
        }

        let scorecard = average(cards);
        let aggregate = self.rubric.aggregate(&scorecard.scores);

        info!(
            persona = input.persona_name,
            aggregate = format!("{:.2}", aggregate),
            "Judge completed"
        );

        Ok(Judgement {
            scorecard,
            aggregate,
            samples: self.samples,
        })
    }
}

/// Per-dimension mean; narrative fields are merged without duplicates.
fn average(mut cards: Vec<Scorecard>) -> Scorecard {
    if cards.len() == 1 {
        return cards.remove(0);
    }

    let n = cards.len() as f64;
    let mut sums: BTreeMap<String, f64> = BTreeMap::new();
    let mut feedback: Vec<String> = Vec::new();
    let mut suggestions: Vec<String> = Vec::new();
    let mut reasons: Vec<String> = Vec::new();

    for card in cards {
        for (dim, score) in card.scores {
            *sums.entry(dim).or_insert(0.0) += score;
        }
        if !card.feedback.is_empty() && !feedback.contains(&card.feedback) {
            feedback.push(card.feedback);
        }
        for s in card.improvement_suggestions {
            if !suggestions.contains(&s) {
                suggestions.push(s);
            }
        }
        for r in card.failure_reasons {
            if !reasons.contains(&r) {
                reasons.push(r);
            }
        }
    }

    Scorecard {
        scores: sums.into_iter().map(|(k, v)| (k, v / n)).collect(),
        feedback: feedback.join("\n"),
        improvement_suggestions: suggestions,
        failure_reasons: reasons,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("Judge generation failed: {0}")]
    Generation(#[from] GeneratorError),

    #[error("Failed to parse judge scores: {0}")]
    Parse(#[from] ScorecardParseError),

    #[error("Score for {dimension} out of range: {value}")]
    InvalidScore { dimension: String, value: f64 },

    #[error("Rubric dimension missing from scores: {0}")]
    MissingDimension(String),
}

impl JudgeError {
    /// Whether the failure came from the generation collaborator and may
    /// succeed on another attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, JudgeError::Generation(e) if e.is_transient())
    }
}
