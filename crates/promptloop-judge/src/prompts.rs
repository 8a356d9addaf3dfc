use crate::{JudgeInput, Rubric, SCORE_MAX, SCORE_MIN};

/// Prompt templates for the judge
pub struct JudgePrompts;

impl JudgePrompts {
    /// Build the scoring prompt for one simulated conversation
    pub fn build_scoring_prompt(input: &JudgeInput<'_>, rubric: &Rubric) -> String {
        let criteria = rubric
            .dimensions
            .iter()
            .enumerate()
            .map(|(i, d)| format!("{}. **{}**: {}", i + 1, d.name, d.description))
            .collect::<Vec<_>>()
            .join("\n");

        let example = rubric
            .dimension_names()
            .map(|n| format!("\"{}\": 7", n))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            r#"You are an expert evaluator of voice agents in debt collection calls. Score the agent's performance in the conversation below.

## Customer Persona
{name}: {description}

## Expected Agent Behavior
{expected}

## Success Criteria
{criteria_list}

## Conversation Transcript
```
{transcript}
```

---

## Scoring Rubric

Score every dimension from {min} (failed completely) to {max} (flawless). Judge only what the agent said; the customer is simulated.

{criteria}

Focus on:
- How well the agent handled this specific persona
- Whether the success criteria were met
- Compliance and risk handling, which outweigh call outcome
- Specific, actionable improvements to the agent's instructions

---

## Required Response Format

Briefly explain your assessment, then end your response with a scores block containing every dimension:

<scores>
{{"scores": {{{example}}}, "feedback": "One paragraph summary", "improvement_suggestions": ["suggestion1", "suggestion2"], "failure_reasons": ["reason1"]}}
</scores>"#,
            name = input.persona_name,
            description = input.persona_description,
            expected = bullet_list(input.expected_behavior),
            criteria_list = bullet_list(input.success_criteria),
            transcript = truncate_output(input.transcript, 20000),
            min = SCORE_MIN,
            max = SCORE_MAX,
            criteria = criteria,
            example = example,
        )
    }
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "- (none specified)".to_string();
    }
    items
        .iter()
        .map(|i| format!("- {}", i))
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate_output(output: &str, max_len: usize) -> &str {
    if output.len() <= max_len {
        return output;
    }
    let mut cut = max_len;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    // Prefer a line boundary
    match output[..cut].rfind('\n') {
        Some(pos) => &output[..pos],
        None => &output[..cut],
    }
}
