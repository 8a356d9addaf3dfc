use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use crate::{GenerationConfig, Generator, GeneratorError, GeneratorOutput, ProcessSpawner};

/// OpenCode CLI used as a plain text generator
pub struct OpenCodeGenerator {
    binary_path: PathBuf,
}

impl OpenCodeGenerator {
    pub fn new() -> Self {
        Self {
            binary_path: PathBuf::from("opencode"),
        }
    }

    pub fn with_binary_path(path: PathBuf) -> Self {
        Self { binary_path: path }
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }
}

impl Default for OpenCodeGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Generator for OpenCodeGenerator {
    fn name(&self) -> &str {
        "OpenCode"
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

        // OpenCode uses the "run" subcommand for non-interactive execution
        let mut args = vec!["run"];

        let model_arg;
        if let Some(ref model) = config.model {
            args.push("--model");
            model_arg = model.clone();
            args.push(&model_arg);
        }

        args.push("--prompt");
        args.push(prompt);

        ProcessSpawner::spawn(&self.binary_path, &args, config).await
    }
}
