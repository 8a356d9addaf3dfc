use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lowest score a dimension may receive
pub const SCORE_MIN: f64 = 0.0;
/// Highest score a dimension may receive
pub const SCORE_MAX: f64 = 10.0;

/// A single named scoring dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    /// Relative weight in the aggregate (need not sum to 1)
    pub weight: f64,
    pub description: String,
}

impl Dimension {
    pub fn new(name: impl Into<String>, weight: f64, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight,
            description: description.into(),
        }
    }
}

/// The fixed set of dimensions a conversation is scored against.
///
/// The aggregate is the weighted mean of the dimension scores. Default
/// weights:
///
/// | dimension             | weight |
/// |-----------------------|--------|
/// | `professionalism`     | 0.20   |
/// | `empathy`             | 0.20   |
/// | `compliance`          | 0.25   |
/// | `resolution`          | 0.20   |
/// | `escalation_handling` | 0.15   |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    pub dimensions: Vec<Dimension>,
}

impl Default for Rubric {
    fn default() -> Self {
        Self {
            dimensions: vec![
                Dimension::new(
                    "professionalism",
                    0.20,
                    "Courteous, clear and respectful tone; identifies itself and stays on topic",
                ),
                Dimension::new(
                    "empathy",
                    0.20,
                    "Acknowledges the customer's situation and adapts to their emotional state",
                ),
                Dimension::new(
                    "compliance",
                    0.25,
                    "Verifies identity before discussing the account, no threats or pressure, honours requests to stop",
                ),
                Dimension::new(
                    "resolution",
                    0.20,
                    "Moves the call toward a concrete outcome such as a payment, plan or documented dispute",
                ),
                Dimension::new(
                    "escalation_handling",
                    0.15,
                    "Handles hostility, disputes and hardship by de-escalating or routing to a specialist",
                ),
            ],
        }
    }
}

impl Rubric {
    pub fn new(dimensions: Vec<Dimension>) -> Self {
        Self { dimensions }
    }

    pub fn dimension_names(&self) -> impl Iterator<Item = &str> {
        self.dimensions.iter().map(|d| d.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    /// Weighted mean of the dimension scores.
    ///
    /// Dimensions absent from `scores` contribute nothing; callers validate
    /// completeness before aggregating. Returns 0.0 when no weight applies.
    pub fn aggregate(&self, scores: &BTreeMap<String, f64>) -> f64 {
        let mut total = 0.0;
        let mut weight = 0.0;
        for dim in &self.dimensions {
            if let Some(score) = scores.get(&dim.name) {
                total += dim.weight * score;
                weight += dim.weight;
            }
        }
        if weight > 0.0 {
            total / weight
        } else {
            0.0
        }
    }
}
