use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{GenerationConfig, Generator, GeneratorError, GeneratorOutput};

/// Bounded exponential backoff for transient generation failures
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Cap on any single delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (0-indexed)
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Wraps another generator with a hard per-attempt timeout and retries.
///
/// Only errors classified as transient are retried. The timeout comes from
/// `GenerationConfig::timeout` and is applied around the inner call, so it
/// holds even for backends that ignore the config.
pub struct RetryingGenerator {
    inner: Arc<dyn Generator>,
    policy: RetryPolicy,
}

impl RetryingGenerator {
    pub fn new(inner: Arc<dyn Generator>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn attempt(
        &self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<GeneratorOutput, GeneratorError> {
        let call = self.inner.generate(prompt, config);
        let output = match config.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| GeneratorError::Timeout(limit))??,
            None => call.await?,
        };

        if output.success() {
            Ok(output)
        } else {
            // Surface the classified failure so it can be retried
            output.into_text().map(GeneratorOutput::from_text)
        }
    }
}

#[async_trait]
impl Generator for RetryingGenerator {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn is_available(&self) -> bool {
        self.inner.is_available().await
    }

    async fn generate(
        &self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<GeneratorOutput, GeneratorError> {
        let mut retry = 0;
        loop {
            match self.attempt(prompt, config).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is_transient() && retry < self.policy.max_retries => {
                    let delay = self.policy.backoff(retry);
                    warn!(
                        generator = self.inner.name(),
                        error = %e,
                        retry = retry + 1,
                        delay_ms = delay.as_millis(),
                        "Transient generation failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => {
                    debug!(
                        generator = self.inner.name(),
                        error = %e,
                        retries = retry,
                        "Generation failed"
                    );
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails with the given error until `failures` attempts have been made.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
        permanent: bool,
    }

    #[async_trait]
    impl Generator for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn generate(
            &self,
            _prompt: &str,
            _config: &GenerationConfig,
        ) -> Result<GeneratorOutput, GeneratorError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                if self.permanent {
                    Err(GeneratorError::ConfigError("bad model".into()))
                } else {
                    Err(GeneratorError::RateLimited("slow down".into()))
                }
            } else {
                Ok(GeneratorOutput::from_text("ok"))
            }
        }
    }

    struct Hangs;

    #[async_trait]
    impl Generator for Hangs {
        fn name(&self) -> &str {
            "hangs"
        }

        async fn generate(
            &self,
            _prompt: &str,
            _config: &GenerationConfig,
        ) -> Result<GeneratorOutput, GeneratorError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(GeneratorOutput::from_text("too late"))
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(10), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let flaky = Arc::new(Flaky {
            failures: 2,
            calls: AtomicUsize::new(0),
            permanent: false,
        });
        let generator = RetryingGenerator::new(flaky.clone(), fast_policy(2));

        let text = generator
            .generate_text("hi", &GenerationConfig::default())
            .await
            .unwrap();
        assert_eq!(text, "ok");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let flaky = Arc::new(Flaky {
            failures: 5,
            calls: AtomicUsize::new(0),
            permanent: false,
        });
        let generator = RetryingGenerator::new(flaky.clone(), fast_policy(1));

        let err = generator
            .generate("hi", &GenerationConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GeneratorError::RateLimited(_)));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_failures_are_not_retried() {
        let flaky = Arc::new(Flaky {
            failures: 1,
            calls: AtomicUsize::new(0),
            permanent: true,
        });
        let generator = RetryingGenerator::new(flaky.clone(), fast_policy(3));

        let err = generator
            .generate("hi", &GenerationConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GeneratorError::ConfigError(_)));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_applies_to_in_process_generators() {
        let generator = RetryingGenerator::new(Arc::new(Hangs), RetryPolicy::none());
        let config = GenerationConfig::default().with_timeout(Duration::from_secs(5));

        let err = generator.generate("hi", &config).await.unwrap_err();
        assert!(matches!(err, GeneratorError::Timeout(d) if d == Duration::from_secs(5)));
    }
}
