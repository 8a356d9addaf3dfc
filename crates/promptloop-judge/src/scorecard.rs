use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

use crate::judge::JudgeError;
use crate::rubric::{Rubric, SCORE_MAX, SCORE_MIN};

/// The judge's verdict on one simulated conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scorecard {
    /// Score per rubric dimension
    pub scores: BTreeMap<String, f64>,
    /// Overall narrative feedback
    #[serde(default)]
    pub feedback: String,
    /// Concrete changes the agent should make
    #[serde(default)]
    pub improvement_suggestions: Vec<String>,
    /// Specific ways the agent failed this persona
    #[serde(default)]
    pub failure_reasons: Vec<String>,
}

#[derive(Error, Debug)]
pub enum ScorecardParseError {
    #[error("No scores block found in judge output")]
    NoScoresFound,

    #[error("Failed to parse scores JSON: {0}")]
    JsonParseError(#[from] serde_json::Error),

    #[error("Invalid scores format: {0}")]
    InvalidFormat(String),
}

impl Scorecard {
    /// Parse a scorecard from the judge's output text
    ///
    /// Expected format in judge output:
    /// ```text
    /// <scores>
    /// {"scores": {"empathy": 7, ...}, "feedback": "...", "improvement_suggestions": [...]}
    /// </scores>
    /// ```
    /// A fenced ```json block, or a bare JSON object, is accepted as a fallback.
    pub fn parse(judge_output: &str) -> Result<Self, ScorecardParseError> {
        debug!(output_len = judge_output.len(), "Parsing judge scorecard");

        if let Some(card) = Self::parse_scores_block(judge_output)? {
            return Ok(card);
        }

        if let Some(json) = Self::fenced_json(judge_output) {
            debug!("Found fenced JSON block");
            return Ok(serde_json::from_str(json)?);
        }

        let trimmed = judge_output.trim();
        if trimmed.starts_with('{') && trimmed.ends_with('}') {
            return Ok(serde_json::from_str(trimmed)?);
        }

        Err(ScorecardParseError::NoScoresFound)
    }

    /// Parse and check the scorecard against a rubric in one step
    pub fn parse_for(judge_output: &str, rubric: &Rubric) -> Result<Self, JudgeError> {
        let mut card = Self::parse(judge_output)?;
        card.validate(rubric)?;
        card.scores.retain(|name, _| rubric.get(name).is_some());
        Ok(card)
    }

    fn parse_scores_block(output: &str) -> Result<Option<Self>, ScorecardParseError> {
        let start = output.find("<scores>");
        let end = output.find("</scores>");

        match (start, end) {
            (Some(start), Some(end)) if start < end => {
                let json_str = output[start + "<scores>".len()..end].trim();
                debug!(json = json_str, "Found scores block");
                Ok(Some(serde_json::from_str(json_str)?))
            }
            (Some(_), Some(_)) => Err(ScorecardParseError::InvalidFormat(
                "Malformed scores block".to_string(),
            )),
            _ => Ok(None),
        }
    }

    fn fenced_json(output: &str) -> Option<&str> {
        let start = output.find("```json")? + "```json".len();
        let end = output[start..].find("```")? + start;
        Some(output[start..end].trim())
    }

    /// Every rubric dimension must be present and inside the score scale.
    /// Missing scores are never filled in.
    pub fn validate(&self, rubric: &Rubric) -> Result<(), JudgeError> {
        for name in rubric.dimension_names() {
            let value = *self
                .scores
                .get(name)
                .ok_or_else(|| JudgeError::MissingDimension(name.to_string()))?;
            if !value.is_finite() || !(SCORE_MIN..=SCORE_MAX).contains(&value) {
                return Err(JudgeError::InvalidScore {
                    dimension: name.to_string(),
                    value,
                });
            }
        }
        Ok(())
    }

    /// Dimensions scoring strictly below `threshold`, lowest first
    pub fn low_dimensions(&self, threshold: f64) -> Vec<(&str, f64)> {
        let mut low: Vec<(&str, f64)> = self
            .scores
            .iter()
            .filter(|(_, v)| **v < threshold)
            .map(|(k, v)| (k.as_str(), *v))
            .collect();
        low.sort_by(|a, b| a.1.total_cmp(&b.1));
        low
    }

    /// Short description for logging
    pub fn short_description(&self, rubric: &Rubric) -> String {
        format!(
            "{:.2} over {} dimensions",
            rubric.aggregate(&self.scores),
            self.scores.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
The agent stayed calm and offered a plan.

<scores>
{"scores": {"professionalism": 8, "empathy": 7.5, "compliance": 9, "resolution": 6, "escalation_handling": 7},
 "feedback": "Solid call", "improvement_suggestions": ["Offer a plan earlier"], "failure_reasons": []}
</scores>
"#;

    #[test]
    fn test_parse_scores_block() {
        let card = Scorecard::parse(FULL).unwrap();
        assert_eq!(card.scores.len(), 5);
        assert_eq!(card.scores["empathy"], 7.5);
        assert_eq!(card.feedback, "Solid call");
        assert_eq!(card.improvement_suggestions, vec!["Offer a plan earlier"]);
    }

    #[test]
    fn test_parse_fenced_json() {
        let output = "```json\n{\"scores\": {\"empathy\": 4}}\n```";
        let card = Scorecard::parse(output).unwrap();
        assert_eq!(card.scores["empathy"], 4.0);
        assert!(card.feedback.is_empty());
    }

    #[test]
    fn test_parse_bare_json() {
        let card = Scorecard::parse("  {\"scores\": {\"resolution\": 3}} ").unwrap();
        assert_eq!(card.scores["resolution"], 3.0);
    }

    #[test]
    fn test_parse_no_scores() {
        let result = Scorecard::parse("I think the agent did fine.");
        assert!(matches!(result, Err(ScorecardParseError::NoScoresFound)));
    }

    #[test]
    fn test_parse_malformed_block() {
        let result = Scorecard::parse("</scores> oops <scores>");
        assert!(matches!(result, Err(ScorecardParseError::InvalidFormat(_))));
    }

    #[test]
    fn test_missing_dimension_is_rejected() {
        let output = r#"<scores>{"scores": {"professionalism": 8, "empathy": 7}}</scores>"#;
        let result = Scorecard::parse_for(output, &Rubric::default());
        assert!(matches!(
            result,
            Err(JudgeError::MissingDimension(d)) if d == "compliance"
        ));
    }

    #[test]
    fn test_out_of_range_is_rejected() {
        let output = r#"<scores>{"scores": {"professionalism": 11, "empathy": 7, "compliance": 9, "resolution": 6, "escalation_handling": 7}}</scores>"#;
        let result = Scorecard::parse_for(output, &Rubric::default());
        assert!(matches!(
            result,
            Err(JudgeError::InvalidScore { dimension, .. }) if dimension == "professionalism"
        ));
    }

    #[test]
    fn test_unknown_dimensions_are_dropped() {
        let output = r#"<scores>{"scores": {"professionalism": 8, "empathy": 7, "compliance": 9, "resolution": 6, "escalation_handling": 7, "humour": 2}}</scores>"#;
        let card = Scorecard::parse_for(output, &Rubric::default()).unwrap();
        assert!(!card.scores.contains_key("humour"));
    }

    #[test]
    fn test_low_dimensions_sorted() {
        let card = Scorecard::parse(FULL).unwrap();
        let low = card.low_dimensions(7.5);
        assert_eq!(low, vec![("resolution", 6.0), ("escalation_handling", 7.0)]);
    }
}
