use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::{GenerationConfig, GeneratorError, GeneratorOutput};

/// Utility for spawning generator processes
pub struct ProcessSpawner;

impl ProcessSpawner {
    /// Spawn a process, capture its output and enforce the configured timeout.
    ///
    /// The child is killed when the timeout elapses.
    pub async fn spawn(
        binary: &Path,
        args: &[&str],
        config: &GenerationConfig,
    ) -> Result<GeneratorOutput, GeneratorError> {
        let start = Instant::now();

        debug!(
            binary = %binary.display(),
            arg_count = args.len(),
            working_dir = %config.working_dir.display(),
            timeout = ?config.timeout,
            "Spawning generator process"
        );

        let mut cmd = Command::new(binary);
        cmd.args(args)
            .current_dir(&config.working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null()) // Non-interactive
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GeneratorError::NotFound(binary.display().to_string())
            } else {
                GeneratorError::SpawnFailed(e)
            }
        })?;

        let output = match config.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| GeneratorError::Timeout(limit))??,
            None => child.wait_with_output().await?,
        };

        let duration = start.elapsed();
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        for line in stderr.lines() {
            trace!(line = %line, "stderr");
        }

        debug!(
            exit_code = output.status.code().unwrap_or(-1),
            duration_ms = duration.as_millis(),
            stdout_bytes = stdout.len(),
            "Generator process completed"
        );

        Ok(GeneratorOutput::new(
            stdout,
            stderr,
            output.status.code().unwrap_or(-1),
            duration,
        ))
    }
}
