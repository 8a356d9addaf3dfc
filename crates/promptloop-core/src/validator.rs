//! Structural gate for candidate prompts.
//!
//! [`PromptValidator::validate`] is a pure function of its inputs: it makes
//! no external calls and reports every failed check, not only the first.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;

use crate::iterations::prompt_hash;

/// One required prompt section, found by its literal marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SectionSpec {
    pub name: String,
    pub marker: String,
    /// Overrides [`ValidatorConfig::min_section_chars`] for this section
    #[serde(default)]
    pub min_chars: Option<usize>,
}

impl SectionSpec {
    pub fn new(name: &str, marker: &str) -> Self {
        Self {
            name: name.to_string(),
            marker: marker.to_string(),
            min_chars: None,
        }
    }

    pub fn with_min_chars(mut self, min_chars: usize) -> Self {
        self.min_chars = Some(min_chars);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatorConfig {
    pub min_length: usize,
    pub max_length: usize,
    pub min_section_chars: usize,
    pub sections: Vec<SectionSpec>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_length: 1000,
            max_length: 10000,
            min_section_chars: 40,
            sections: default_sections(),
        }
    }
}

/// Required sections of the collections prompt, in document order.
pub fn default_sections() -> Vec<SectionSpec> {
    vec![
        SectionSpec::new("identity", "You are Tira"),
        SectionSpec::new("customer_context", "CUSTOMER CONTEXT:"),
        SectionSpec::new("call_flow", "CALL FLOW:"),
        SectionSpec::new("conversation_rules", "CONVERSATION RULES:"),
        // A heading whose scenarios follow as their own sections
        SectionSpec::new("scenarios", "COMMON SCENARIOS & RESPONSES:").with_min_chars(0),
        SectionSpec::new("payment_agreement", "Payment Agreement:"),
        SectionSpec::new("financial_hardship", "Financial Hardship:"),
        SectionSpec::new("payment_dispute", "Payment Dispute:"),
        SectionSpec::new("payment_plan", "Requesting Payment Plan:"),
        SectionSpec::new("already_paid", "Already Paid:"),
    ]
}

/// Validator check categories, in reporting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Structure,
    Content,
    Length,
    Placeholders,
    Unchanged,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Structure => "structure",
            CheckKind::Content => "content",
            CheckKind::Length => "length",
            CheckKind::Placeholders => "placeholders",
            CheckKind::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub check: CheckKind,
    pub detail: String,
}

/// A paragraph that differs between reference and candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParagraphChange {
    pub index: usize,
    pub reference: String,
    pub candidate: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub violations: Vec<Violation>,
    /// Non-blocking observations (length close to a bound)
    pub warnings: Vec<String>,
    pub changes: Vec<ParagraphChange>,
}

impl ValidationResult {
    /// Names of the failed checks, each once, in reporting order.
    pub fn violated_checks(&self) -> Vec<&'static str> {
        self.violations
            .iter()
            .map(|v| v.check)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|c| c.as_str())
            .collect()
    }
}

const PREVIEW_CHARS: usize = 100;

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{[a-z_][a-z0-9_]*\}").expect("placeholder pattern is valid"))
}

/// Set of placeholder names (without braces) in `text`.
pub fn placeholders(text: &str) -> BTreeSet<String> {
    placeholder_regex()
        .find_iter(text)
        .map(|m| m.as_str()[1..m.as_str().len() - 1].to_string())
        .collect()
}

pub struct PromptValidator {
    config: ValidatorConfig,
}

impl PromptValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn validate(&self, candidate: &str, reference: &str) -> ValidationResult {
        let mut violations = Vec::new();
        let mut warnings = Vec::new();

        self.check_structure(candidate, &mut violations);
        self.check_content(candidate, &mut violations);
        self.check_length(candidate, &mut violations, &mut warnings);
        check_placeholders(candidate, reference, &mut violations);

        if prompt_hash(candidate.trim()) == prompt_hash(reference.trim()) {
            violations.push(Violation {
                check: CheckKind::Unchanged,
                detail: "Candidate is identical to the reference prompt".to_string(),
            });
        }

        ValidationResult {
            passed: violations.is_empty(),
            violations,
            warnings,
            changes: detect_changes(reference, candidate),
        }
    }

    fn check_structure(&self, candidate: &str, violations: &mut Vec<Violation>) {
        for section in &self.config.sections {
            if !candidate.contains(&section.marker) {
                violations.push(Violation {
                    check: CheckKind::Structure,
                    detail: format!(
                        "Missing required section '{}' (marker \"{}\")",
                        section.name, section.marker
                    ),
                });
            }
        }
    }

    fn check_content(&self, candidate: &str, violations: &mut Vec<Violation>) {
        let trimmed = candidate.trim_end();
        if !trimmed.is_empty() && !ends_sentence(trimmed) {
            violations.push(Violation {
                check: CheckKind::Content,
                detail: format!(
                    "Prompt ends mid-sentence: \"...{}\"",
                    tail(trimmed, 40)
                ),
            });
        }

        for (section, body) in section_bodies(candidate, &self.config.sections) {
            let min = section.min_chars.unwrap_or(self.config.min_section_chars);
            let body = body.trim();
            let chars = body.chars().count();

            if chars < min {
                violations.push(Violation {
                    check: CheckKind::Content,
                    detail: format!(
                        "Section '{}' is too short ({} < {} chars)",
                        section.name, chars, min
                    ),
                });
            }

            if let Some(last) = body.lines().map(str::trim).filter(|l| !l.is_empty()).last() {
                if !is_list_item(last) && !ends_sentence(last) {
                    violations.push(Violation {
                        check: CheckKind::Content,
                        detail: format!(
                            "Section '{}' ends with an incomplete sentence: \"...{}\"",
                            section.name,
                            tail(last, 40)
                        ),
                    });
                }
            }
        }
    }

    fn check_length(
        &self,
        candidate: &str,
        violations: &mut Vec<Violation>,
        warnings: &mut Vec<String>,
    ) {
        let chars = candidate.chars().count();
        let (min, max) = (self.config.min_length, self.config.max_length);

        if chars < min {
            violations.push(Violation {
                check: CheckKind::Length,
                detail: format!("Prompt too short: {} chars (minimum {})", chars, min),
            });
        } else if chars > max {
            violations.push(Violation {
                check: CheckKind::Length,
                detail: format!("Prompt too long: {} chars (maximum {})", chars, max),
            });
        } else if chars < min + min / 10 {
            warnings.push(format!("Prompt is close to the minimum length ({} chars)", chars));
        } else if chars > max - max / 10 {
            warnings.push(format!("Prompt is close to the maximum length ({} chars)", chars));
        }
    }
}

fn check_placeholders(candidate: &str, reference: &str, violations: &mut Vec<Violation>) {
    let expected = placeholders(reference);
    let found = placeholders(candidate);

    for missing in expected.difference(&found) {
        violations.push(Violation {
            check: CheckKind::Placeholders,
            detail: format!("Missing placeholder {{{}}}", missing),
        });
    }
    for added in found.difference(&expected) {
        violations.push(Violation {
            check: CheckKind::Placeholders,
            detail: format!("Unknown placeholder {{{}}}", added),
        });
    }

    // Strip well-formed tokens; any brace left over is malformed
    let mut rest = String::with_capacity(candidate.len());
    let mut last = 0;
    let mut previous: Option<(usize, &str)> = None;

    for m in placeholder_regex().find_iter(candidate) {
        let doubled =
            candidate[..m.start()].ends_with('{') && candidate[m.end()..].starts_with('}');
        if doubled {
            violations.push(Violation {
                check: CheckKind::Placeholders,
                detail: format!("Placeholder {} is wrapped in doubled braces", m.as_str()),
            });
            rest.push_str(&candidate[last..m.start() - 1]);
            last = m.end() + 1;
        } else {
            rest.push_str(&candidate[last..m.start()]);
            last = m.end();
        }

        if let Some((end, token)) = previous {
            if token == m.as_str() && candidate[end..m.start()].trim().is_empty() {
                violations.push(Violation {
                    check: CheckKind::Placeholders,
                    detail: format!("Placeholder {} is repeated back-to-back", token),
                });
            }
        }
        previous = Some((m.end(), m.as_str()));
    }
    rest.push_str(&candidate[last.min(candidate.len())..]);

    if let Some(pos) = rest.find(|c: char| c == '{' || c == '}') {
        let start = floor_boundary(&rest, pos.saturating_sub(15));
        let end = floor_boundary(&rest, (pos + 15).min(rest.len()));
        violations.push(Violation {
            check: CheckKind::Placeholders,
            detail: format!("Malformed placeholder near \"{}\"", &rest[start..end]),
        });
    }
}

/// Body text of each present section: from the end of its marker to the
/// next present marker.
fn section_bodies<'a, 's>(
    text: &'a str,
    sections: &'s [SectionSpec],
) -> Vec<(&'s SectionSpec, &'a str)> {
    let mut found: Vec<(usize, &SectionSpec)> = sections
        .iter()
        .filter_map(|s| text.find(&s.marker).map(|pos| (pos, s)))
        .collect();
    found.sort_by_key(|(pos, _)| *pos);

    found
        .iter()
        .enumerate()
        .map(|(i, (pos, section))| {
            let start = pos + section.marker.len();
            let end = found
                .get(i + 1)
                .map(|(next, _)| (*next).max(start))
                .unwrap_or(text.len());
            (*section, &text[start..end])
        })
        .collect()
}

fn ends_sentence(line: &str) -> bool {
    line.ends_with(|c: char| matches!(c, '.' | '!' | '?' | '"' | '\'' | ')'))
}

fn is_list_item(line: &str) -> bool {
    if line.starts_with("- ") || line.starts_with("* ") {
        return true;
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    digits > 0 && line[digits..].starts_with(". ")
}

fn tail(text: &str, chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(chars)).collect()
}

fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

fn floor_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Paragraph-level differences, paragraphs being separated by blank lines.
fn detect_changes(reference: &str, candidate: &str) -> Vec<ParagraphChange> {
    let old: Vec<&str> = reference.split("\n\n").collect();
    let new: Vec<&str> = candidate.split("\n\n").collect();

    (0..old.len().max(new.len()))
        .filter_map(|index| {
            let before = old.get(index).copied().unwrap_or("");
            let after = new.get(index).copied().unwrap_or("");
            (before != after).then(|| ParagraphChange {
                index,
                reference: preview(before),
                candidate: preview(after),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_BASELINE_PROMPT;

    fn validator() -> PromptValidator {
        PromptValidator::new(ValidatorConfig::default())
    }

    fn edited_baseline() -> String {
        DEFAULT_BASELINE_PROMPT.replace(
            "- Ask one question at a time",
            "- Ask one question at a time\n- Confirm the customer's identity before discussing the account",
        )
    }

    #[test]
    fn test_edited_baseline_passes() {
        let result = validator().validate(&edited_baseline(), DEFAULT_BASELINE_PROMPT);
        assert!(result.passed, "{:?}", result.violations);
        assert_eq!(result.changes.len(), 1);
    }

    #[test]
    fn test_identical_candidate_rejected() {
        let result = validator().validate(DEFAULT_BASELINE_PROMPT, DEFAULT_BASELINE_PROMPT);
        assert!(!result.passed);
        assert_eq!(result.violated_checks(), vec!["unchanged"]);
        assert!(result.changes.is_empty());
    }

    #[test]
    fn test_missing_section_reported() {
        let candidate = edited_baseline().replace("Already Paid:", "Paid Already");
        let result = validator().validate(&candidate, DEFAULT_BASELINE_PROMPT);
        assert_eq!(result.violated_checks(), vec!["structure"]);
        assert!(result.violations[0].detail.contains("already_paid"));
    }

    #[test]
    fn test_truncated_prompt_reports_every_check() {
        let cut = DEFAULT_BASELINE_PROMPT.find("CUSTOMER CONTEXT:").unwrap();
        let candidate = &DEFAULT_BASELINE_PROMPT[..cut + 40];
        let result = validator().validate(candidate, DEFAULT_BASELINE_PROMPT);

        assert!(!result.passed);
        assert_eq!(
            result.violated_checks(),
            vec!["structure", "content", "length", "placeholders"]
        );
    }

    #[test]
    fn test_placeholder_integrity() {
        let candidate = edited_baseline()
            .replacen("{account_last4}", "{{account_last4}}", 1)
            .replacen("{phone_number}", "{phone_number}{phone_number}", 1)
            .replace("{customer_address}", "{customer_adress}")
            .replacen("Days Past Due: {days_past_due}", "Days Past Due: {days_past_due", 1);

        let result = validator().validate(&candidate, DEFAULT_BASELINE_PROMPT);
        assert_eq!(result.violated_checks(), vec!["placeholders"]);

        let details: Vec<&str> = result.violations.iter().map(|v| v.detail.as_str()).collect();
        assert!(details.iter().any(|d| d.contains("Missing placeholder {customer_address}")));
        assert!(details.iter().any(|d| d.contains("Unknown placeholder {customer_adress}")));
        assert!(details.iter().any(|d| d.contains("doubled braces")));
        assert!(details.iter().any(|d| d.contains("back-to-back")));
        assert!(details.iter().any(|d| d.contains("Malformed placeholder")));
    }

    #[test]
    fn test_length_bounds_and_warnings() {
        let config = ValidatorConfig {
            min_length: 10,
            max_length: 100,
            min_section_chars: 0,
            sections: vec![],
        };
        let validator = PromptValidator::new(config);

        let short = validator.validate("Hi.", "");
        assert_eq!(short.violated_checks(), vec!["length"]);

        let near_max = format!("{}.", "a".repeat(94));
        let warned = validator.validate(&near_max, "");
        assert!(warned.passed);
        assert_eq!(warned.warnings.len(), 1);
    }

    #[test]
    fn test_short_section_and_incomplete_sentence() {
        let config = ValidatorConfig {
            min_length: 0,
            max_length: 10_000,
            min_section_chars: 20,
            sections: vec![SectionSpec::new("intro", "INTRO:"), SectionSpec::new("rules", "RULES:")],
        };
        let validator = PromptValidator::new(config);

        let result = validator.validate("INTRO:\nHello.\n\nRULES:\nAlways be polite to the customer and\n\nDone.", "");
        let details: Vec<&str> = result.violations.iter().map(|v| v.detail.as_str()).collect();
        assert_eq!(result.violated_checks(), vec!["content"]);
        assert!(details.iter().any(|d| d.contains("'intro' is too short")));
        assert!(!details.iter().any(|d| d.contains("'rules' is too short")));

        let cut = validator.validate("INTRO:\nHello there, this is fine.\n\nRULES:\nAlways be polite to the customer and", "");
        assert!(cut
            .violations
            .iter()
            .any(|v| v.detail.contains("'rules' ends with an incomplete sentence")));
    }

    #[test]
    fn test_validate_is_idempotent() {
        let candidate = edited_baseline().replace("Already Paid:", "");
        let a = validator().validate(&candidate, DEFAULT_BASELINE_PROMPT);
        let b = validator().validate(&candidate, DEFAULT_BASELINE_PROMPT);
        assert_eq!(a, b);
    }
}
