use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::GeneratorOutput;

/// Errors that can occur while generating text
#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error("Failed to spawn generator process: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Generator not found at path: {0}")]
    NotFound(String),

    #[error("Generator configuration error: {0}")]
    ConfigError(String),

    #[error("Generation failed: {0}")]
    ExecutionFailed(String),

    #[error("Generator was rate limited: {0}")]
    RateLimited(String),
}

impl GeneratorError {
    /// Whether retrying the same request may succeed.
    ///
    /// Missing binaries and bad configuration are permanent; everything that
    /// depends on the remote model being responsive is not.
    pub fn is_transient(&self) -> bool {
        match self {
            GeneratorError::SpawnFailed(e) => e.kind() != std::io::ErrorKind::NotFound,
            GeneratorError::Timeout(_)
            | GeneratorError::ExecutionFailed(_)
            | GeneratorError::RateLimited(_) => true,
            GeneratorError::NotFound(_) | GeneratorError::ConfigError(_) => false,
        }
    }
}

/// Configuration for a single generation request
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Working directory for the generator process
    pub working_dir: PathBuf,
    /// Upper bound on a single request (None = no limit)
    pub timeout: Option<Duration>,
    /// Model to use (if the backend supports it)
    pub model: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            timeout: None,
            model: None,
        }
    }
}

impl GenerationConfig {
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            working_dir,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_model(mut self, model: String) -> Self {
        self.model = Some(model);
        self
    }
}

/// Supported generator backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeneratorType {
    ClaudeCode,
    OpenCode,
}

impl std::fmt::Display for GeneratorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GeneratorType::ClaudeCode => write!(f, "claude-code"),
            GeneratorType::OpenCode => write!(f, "opencode"),
        }
    }
}

impl std::str::FromStr for GeneratorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "claude" | "claude-code" | "claudecode" => Ok(GeneratorType::ClaudeCode),
            "opencode" | "open-code" => Ok(GeneratorType::OpenCode),
            _ => Err(format!("Unknown generator type: {}", s)),
        }
    }
}

/// The generation collaborator: prompt in, text out.
///
/// Everything model-driven in the pipeline (the simulated agent, the judge
/// and the prompt improver) goes through this trait so the deterministic
/// parts can be exercised with scripted implementations.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Human-readable name of the backend
    fn name(&self) -> &str;

    /// Run one generation request
    async fn generate(
        &self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<GeneratorOutput, GeneratorError>;

    /// Run one generation request and return the trimmed text, treating a
    /// non-zero exit as a failure
    async fn generate_text(
        &self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<String, GeneratorError> {
        self.generate(prompt, config).await?.into_text()
    }

    /// Check whether the backend can be reached
    async fn is_available(&self) -> bool {
        true
    }
}
