use promptloop_agent::{GenerationConfig, Generator};
use std::sync::Arc;
use tracing::{debug, info};

use crate::{DimensionSummary, ImproverError, ImproverPrompts};

/// Everything the improver is told about the current prompt.
#[derive(Debug, Clone, Copy)]
pub struct ImprovementRequest<'a> {
    pub current_prompt: &'a str,
    pub low_dimensions: &'a [DimensionSummary],
    /// Risk tags from the call that triggered this run
    pub risk_signals: &'a [String],
    /// Judge suggestions, recorded call first
    pub suggestions: &'a [String],
    pub failure_reasons: &'a [String],
    /// Baseline score of the current prompt over simulated personas
    pub average_score: Option<f64>,
    /// How the recorded call itself scored across personas
    pub call_score: Option<f64>,
}

/// Proposes a complete replacement prompt. Stores nothing.
pub struct PromptImprover {
    generator: Arc<dyn Generator>,
    config: GenerationConfig,
}

impl PromptImprover {
    pub fn new(generator: Arc<dyn Generator>, config: GenerationConfig) -> Self {
        Self { generator, config }
    }

    pub async fn propose(&self, request: &ImprovementRequest<'_>) -> Result<String, ImproverError> {
        let prompt = ImproverPrompts::build_improvement_prompt(request);
        debug!(
            prompt_len = prompt.len(),
            low_dimensions = request.low_dimensions.len(),
            risk_signals = request.risk_signals.len(),
            "Requesting candidate prompt"
        );

        let text = self.generator.generate_text(&prompt, &self.config).await?;
        let candidate = strip_code_fence(&text);
        if candidate.is_empty() {
            return Err(ImproverError::EmptyCandidate);
        }

        info!(chars = candidate.chars().count(), "Candidate prompt proposed");
        Ok(candidate)
    }
}

/// Unwrap a response that arrived inside a single fenced code block.
fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };

    // Drop an info string such as ```text
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use promptloop_agent::{GeneratorError, GeneratorOutput};
    use std::sync::Mutex;

    /// Records the prompt it was given and answers with a fixed reply
    struct Recording {
        reply: &'static str,
        seen: Mutex<Option<String>>,
    }

    #[async_trait]
    impl Generator for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn generate(
            &self,
            prompt: &str,
            _config: &GenerationConfig,
        ) -> Result<GeneratorOutput, GeneratorError> {
            *self.seen.lock().unwrap() = Some(prompt.to_string());
            Ok(GeneratorOutput::from_text(self.reply))
        }
    }

    fn request<'a>(risks: &'a [String]) -> ImprovementRequest<'a> {
        ImprovementRequest {
            current_prompt: "You are Tira. Hello {customer_name}.",
            low_dimensions: &[],
            risk_signals: risks,
            suggestions: &[],
            failure_reasons: &[],
            average_score: None,
            call_score: None,
        }
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```text\nYou are Tira.\n```"), "You are Tira.");
        assert_eq!(strip_code_fence("```\nYou are Tira.\n```\n"), "You are Tira.");
        assert_eq!(strip_code_fence("  You are Tira.  "), "You are Tira.");
    }

    #[tokio::test]
    async fn test_propose_passes_risk_signals() {
        let generator = Arc::new(Recording {
            reply: "```\nYou are Tira, now kinder. Hello {customer_name}.\n```",
            seen: Mutex::new(None),
        });
        let improver = PromptImprover::new(generator.clone(), GenerationConfig::default());

        let risks = vec!["abusive_language".to_string()];
        let candidate = improver.propose(&request(&risks)).await.unwrap();

        assert_eq!(candidate, "You are Tira, now kinder. Hello {customer_name}.");
        let seen = generator.seen.lock().unwrap().clone().unwrap();
        assert!(seen.contains("- abusive_language"));
    }

    #[tokio::test]
    async fn test_empty_reply_is_an_error() {
        let generator = Arc::new(Recording {
            reply: "```\n```",
            seen: Mutex::new(None),
        });
        let improver = PromptImprover::new(generator, GenerationConfig::default());

        let err = improver.propose(&request(&[])).await.unwrap_err();
        assert!(matches!(err, ImproverError::EmptyCandidate));
    }
}
