pub mod judge;
mod prompts;
mod rubric;
mod scorecard;

pub use judge::{Judge, JudgeError, JudgeInput, Judgement};
pub use prompts::JudgePrompts;
pub use rubric::{Dimension, Rubric, SCORE_MAX, SCORE_MIN};
pub use scorecard::{Scorecard, ScorecardParseError};
