//! Project configuration file support for promptloop.
//!
//! Loads configuration from `promptloop.toml` in the working directory, or
//! from the path given with `--config`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use promptloop_agent::{GenerationConfig, GeneratorType, RetryPolicy};
use promptloop_core::{PipelineSettings, SectionSpec, ValidatorConfig};

/// The config file name
pub const CONFIG_FILE_NAME: &str = "promptloop.toml";

const MAX_TURN_CAP: usize = 50;

/// Project-level configuration loaded from `promptloop.toml`
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Global default backend (applies to every role)
    pub backend: Option<String>,
    /// Global default model (applies to every role)
    pub model: Option<String>,
    /// Database file
    pub database: Option<PathBuf>,
    /// The simulated voice agent
    #[serde(default)]
    pub agent: RoleConfig,
    #[serde(default)]
    pub judge: RoleConfig,
    #[serde(default)]
    pub improver: RoleConfig,
    #[serde(default)]
    pub generation: GenerationSettings,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub validator: ValidatorSettings,
}

/// Configuration for a specific role (agent, judge or improver)
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RoleConfig {
    pub backend: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Agent,
    Judge,
    Improver,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Agent => write!(f, "agent"),
            Role::Judge => write!(f, "judge"),
            Role::Improver => write!(f, "improver"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GenerationSettings {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PipelineConfig {
    pub turn_cap: usize,
    pub min_personas: usize,
    pub tolerance: f64,
    pub judge_samples: usize,
    pub low_score_threshold: f64,
    pub max_concurrent_runs: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            turn_cap: 12,
            min_personas: 5,
            tolerance: 0.0,
            judge_samples: 1,
            low_score_threshold: 7.0,
            max_concurrent_runs: 2,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ValidatorSettings {
    pub min_length: usize,
    pub max_length: usize,
    pub min_section_chars: usize,
    /// Replaces the built-in section catalogue when present
    pub sections: Option<Vec<SectionSpec>>,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        let defaults = ValidatorConfig::default();
        Self {
            min_length: defaults.min_length,
            max_length: defaults.max_length,
            min_section_chars: defaults.min_section_chars,
            sections: None,
        }
    }
}

impl ProjectConfig {
    /// Load configuration from the working directory.
    ///
    /// Returns:
    /// - `Ok(Some(config))` if file exists and parses successfully
    /// - `Ok(None)` if file does not exist
    /// - `Err(...)` if file exists but fails to parse (hard error)
    pub fn load(working_dir: &Path) -> Result<Option<Self>> {
        let config_path = working_dir.join(CONFIG_FILE_NAME);

        if !config_path.exists() {
            return Ok(None);
        }

        Self::load_from(&config_path).map(Some)
    }

    /// Load an explicitly named file; a missing file is an error.
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let config: ProjectConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        for role in [Role::Agent, Role::Judge, Role::Improver] {
            self.generator_type(role)?;
        }
        if self.validator.min_length > self.validator.max_length {
            anyhow::bail!(
                "validator.min_length ({}) exceeds validator.max_length ({})",
                self.validator.min_length,
                self.validator.max_length
            );
        }
        if self.pipeline.judge_samples == 0 {
            anyhow::bail!("pipeline.judge_samples must be at least 1");
        }
        Ok(())
    }

    fn role(&self, role: Role) -> &RoleConfig {
        match role {
            Role::Agent => &self.agent,
            Role::Judge => &self.judge,
            Role::Improver => &self.improver,
        }
    }

    /// Get the effective backend for a role.
    /// Priority: [role].backend > global backend > None
    pub fn backend(&self, role: Role) -> Option<&str> {
        self.role(role)
            .backend
            .as_deref()
            .or(self.backend.as_deref())
    }

    /// Get the effective model for a role.
    /// Priority: [role].model > global model > None
    pub fn model(&self, role: Role) -> Option<&str> {
        self.role(role).model.as_deref().or(self.model.as_deref())
    }

    /// Backend for a role, defaulting to Claude Code
    pub fn generator_type(&self, role: Role) -> Result<GeneratorType> {
        match self.backend(role) {
            Some(name) => name
                .parse()
                .map_err(|e: String| anyhow::anyhow!("[{}] {}", role, e)),
            None => Ok(GeneratorType::ClaudeCode),
        }
    }

    pub fn generation_config(&self, role: Role) -> GenerationConfig {
        let config = GenerationConfig::default().with_timeout(self.generation.timeout);
        match self.model(role) {
            Some(model) => config.with_model(model.to_string()),
            None => config,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.generation.max_retries,
            initial_backoff: self.generation.initial_backoff,
            max_backoff: self.generation.max_backoff,
        }
    }

    pub fn turn_cap(&self) -> usize {
        self.pipeline.turn_cap.clamp(1, MAX_TURN_CAP)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            min_personas: self.pipeline.min_personas,
            low_score_threshold: self.pipeline.low_score_threshold,
        }
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        let defaults = ValidatorConfig::default();
        ValidatorConfig {
            min_length: self.validator.min_length,
            max_length: self.validator.max_length,
            min_section_chars: self.validator.min_section_chars,
            sections: self
                .validator
                .sections
                .clone()
                .unwrap_or(defaults.sections),
        }
    }
}
