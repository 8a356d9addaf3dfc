use crate::{placeholders, ImprovementRequest, Speaker, Turn};

/// Prompt templates for the simulated agent
pub struct SimulationPrompts;

impl SimulationPrompts {
    /// Build the request for the agent's next line in a simulated call
    pub fn agent_turn(system_prompt: &str, transcript: &[Turn]) -> String {
        format!(
            r#"{system_prompt}

---

## Live Call

You are on a phone call with the customer. The conversation so far:

```
{conversation}
```

Reply with your next line as the agent only. Keep it to one short spoken turn: no speaker label, no stage directions, no notes about tools."#,
            system_prompt = system_prompt,
            conversation = render_transcript(transcript),
        )
    }
}

/// Render a transcript as `Speaker: text` lines
pub fn render_transcript(transcript: &[Turn]) -> String {
    transcript
        .iter()
        .map(|turn| {
            let speaker = match turn.speaker {
                Speaker::Agent => "Agent",
                Speaker::Customer => "Customer",
            };
            format!("{}: {}", speaker, turn.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Prompt templates for the improver
pub struct ImproverPrompts;

impl ImproverPrompts {
    /// Build the prompt asking for a complete replacement prompt
    pub fn build_improvement_prompt(request: &ImprovementRequest<'_>) -> String {
        let tokens = placeholders(request.current_prompt)
            .into_iter()
            .map(|p| format!("{{{}}}", p))
            .collect::<Vec<_>>()
            .join(", ");

        let weak = if request.low_dimensions.is_empty() {
            "- (no dimension scored below threshold)".to_string()
        } else {
            request
                .low_dimensions
                .iter()
                .map(|d| {
                    format!(
                        "- {}: mean {:.1} (min {:.1}, max {:.1})",
                        d.name, d.mean, d.min, d.max
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        let score = request
            .average_score
            .map(|s| format!("{:.2}/10", s))
            .unwrap_or_else(|| "not yet scored".to_string());
        let call_score = request
            .call_score
            .map(|s| format!("{:.2}/10", s))
            .unwrap_or_else(|| "not scored".to_string());

        format!(
            r#"You are an expert prompt engineer improving the instructions of a debt collection voice agent.

## CRITICAL REQUIREMENTS
1. Keep the same overall structure and every section heading of the current prompt
2. Keep ALL placeholders exactly as written: {tokens}
3. Do not add new placeholders or change brace syntax
4. Return a COMPLETE prompt that ends with a full sentence; never truncate or summarise
5. Make targeted changes that address the weaknesses below

## Current Prompt
```
{current}
```

## Current Performance
Average score across simulated personas: {score}
Most recent real call, judged against each persona: {call_score}

## Low-Scoring Dimensions
{weak}

## Risk Signals From Recent Calls
{risks}

## Judge Suggestions (recorded call first, then simulations)
{suggestions}

## Common Failure Reasons
{failures}

## Guidelines
- Strengthen empathy and compliance language where it was weak
- Give clearer instructions for the scenarios behind the risk signals
- Keep responses concise; this is a voice agent
- Preserve what already works

Respond with the COMPLETE improved prompt only, with no commentary before or after it."#,
            tokens = tokens,
            current = request.current_prompt,
            score = score,
            call_score = call_score,
            weak = weak,
            risks = bullets(request.risk_signals),
            suggestions = bullets(request.suggestions),
            failures = bullets(request.failure_reasons),
        )
    }
}

fn bullets(items: &[String]) -> String {
    if items.is_empty() {
        return "- (none)".to_string();
    }
    items
        .iter()
        .map(|s| format!("- {}", s))
        .collect::<Vec<_>>()
        .join("\n")
}
