use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use crate::{GenerationConfig, Generator, GeneratorError, GeneratorOutput, ProcessSpawner};

/// Claude Code CLI used as a plain text generator
pub struct ClaudeCodeGenerator {
    binary_path: PathBuf,
}

impl ClaudeCodeGenerator {
    pub fn new() -> Self {
        Self {
            binary_path: PathBuf::from("claude"),
        }
    }

    pub fn with_binary_path(path: PathBuf) -> Self {
        Self { binary_path: path }
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }
}

impl Default for ClaudeCodeGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Generator for ClaudeCodeGenerator {
    fn name(&self) -> &str {
        "Claude Code"
    }

    async fn is_available(&self) -> bool {
        Command::new(&self.binary_path)
            .arg("--version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn generate(
        &self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<GeneratorOutput, GeneratorError> {
        debug!(
            generator = self.name(),
            prompt_len = prompt.len(),
            "Generating"
        );

        // Non-interactive mode, output only
        let mut args = vec!["--print"];

        let model_arg;
        if let Some(ref model) = config.model {
            args.push("--model");
            model_arg = model.clone();
            args.push(&model_arg);
        }

        // Prompts starting with '-' must not be read as options
        args.push("--");
        args.push(prompt);

        ProcessSpawner::spawn(&self.binary_path, &args, config).await
    }
}
