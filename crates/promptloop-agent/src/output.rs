use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::GeneratorError;

/// Output captured from a generation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorOutput {
    /// Combined stdout output
    pub stdout: String,
    /// Combined stderr output
    pub stderr: String,
    /// Exit code from the process
    pub exit_code: i32,
    /// Duration of execution
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

impl GeneratorOutput {
    pub fn new(stdout: String, stderr: String, exit_code: i32, duration: Duration) -> Self {
        Self {
            stdout,
            stderr,
            exit_code,
            duration,
        }
    }

    /// Successful output carrying only text (used by in-process generators)
    pub fn from_text(text: impl Into<String>) -> Self {
        Self::new(text.into(), String::new(), 0, Duration::ZERO)
    }

    /// Check if the generator exited successfully
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Convert into the generated text, classifying a failed exit.
    pub fn into_text(self) -> Result<String, GeneratorError> {
        if self.success() {
            return Ok(self.stdout.trim().to_string());
        }

        let detail = self
            .stderr
            .lines()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no stderr output")
            .trim()
            .to_string();
        let lowered = self.stderr.to_lowercase();
        if lowered.contains("rate limit") || lowered.contains("429") {
            Err(GeneratorError::RateLimited(detail))
        } else {
            Err(GeneratorError::ExecutionFailed(format!(
                "exited with code {}: {}",
                self.exit_code, detail
            )))
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
