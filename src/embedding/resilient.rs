// Retry wrapper for embedding providers.
//
// Wraps any provider with exponential backoff plus jitter and a
// per-attempt timeout. Only transient failures are retried: network
// errors, timeouts, and provider messages carrying 429/502/503/504.
// Everything else surfaces immediately.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{EmbeddingError, EmbeddingProvider};

/// Retry behavior knobs.
#[derive(Debug, Clone)]
pub struct RetryConfig {
  pub max_retries: u32,
  pub initial_backoff: Duration,
  pub max_backoff: Duration,
  pub backoff_multiplier: f64,
  pub add_jitter: bool,
  /// Per-attempt timeout; the provider's own transport timeout still
  /// applies underneath.
  pub request_timeout: Duration,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      initial_backoff: Duration::from_secs(1),
      max_backoff: Duration::from_secs(30),
      backoff_multiplier: 2.0,
      add_jitter: true,
      request_timeout: Duration::from_secs(120),
    }
  }
}

impl RetryConfig {
  /// Backoff before retry number `attempt` (0-based).
  pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
    let base = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
    let mut backoff = Duration::from_secs_f64(base.min(self.max_backoff.as_secs_f64()));

    if self.add_jitter {
      // Up to 25% jitter.
      let jitter_factor = 1.0 + (rand_f64() * 0.25);
      backoff = Duration::from_secs_f64(backoff.as_secs_f64() * jitter_factor);
    }

    backoff.min(self.max_backoff)
  }
}

/// Pseudo-random fraction for jitter without pulling in a rand crate.
fn rand_f64() -> f64 {
  use std::time::{SystemTime, UNIX_EPOCH};

  let nanos = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .subsec_nanos();

  (nanos as f64 / u32::MAX as f64).fract()
}

/// Is this failure worth retrying?
pub fn is_retryable_error(error: &EmbeddingError) -> bool {
  match error {
    EmbeddingError::Network(_) | EmbeddingError::Timeout => true,
    EmbeddingError::Provider(msg) => {
      msg.contains("429") || msg.contains("502") || msg.contains("503") || msg.contains("504")
    }
    _ => false,
  }
}

/// Provider wrapper that retries transient failures.
pub struct ResilientProvider<P: EmbeddingProvider> {
  inner: P,
  config: RetryConfig,
}

impl<P: EmbeddingProvider> ResilientProvider<P> {
  pub fn new(provider: P) -> Self {
    Self {
      inner: provider,
      config: RetryConfig::default(),
    }
  }

  pub fn with_config(provider: P, config: RetryConfig) -> Self {
    Self {
      inner: provider,
      config,
    }
  }

  async fn run_with_retry<'a, T, F, Fut>(&'a self, what: &str, op: F) -> Result<T, EmbeddingError>
  where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, EmbeddingError>> + 'a,
  {
    let max_retries = self.config.max_retries;
    let mut last_error = None;

    for attempt in 0..=max_retries {
      if attempt > 0 {
        let backoff = self.config.backoff_for_attempt(attempt - 1);
        debug!(
          attempt,
          max_retries,
          backoff_ms = backoff.as_millis(),
          what,
          "Retrying embed after backoff"
        );
        sleep(backoff).await;
      }

      match tokio::time::timeout(self.config.request_timeout, op()).await {
        Ok(Ok(result)) => {
          if attempt > 0 {
            info!(attempt, what, "Embed succeeded after retry");
          }
          return Ok(result);
        }
        Ok(Err(e)) if is_retryable_error(&e) && attempt < max_retries => {
          warn!(attempt = attempt + 1, max_retries, err = %e, what, "Retryable embed error");
          last_error = Some(e);
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => {
          warn!(
            attempt = attempt + 1,
            max_retries,
            timeout_ms = self.config.request_timeout.as_millis(),
            what,
            "Embed attempt timed out"
          );
          last_error = Some(EmbeddingError::Timeout);
        }
      }
    }

    Err(last_error.unwrap_or_else(|| EmbeddingError::Provider("max retries exceeded".to_string())))
  }
}

#[async_trait]
impl<P: EmbeddingProvider + Send + Sync> EmbeddingProvider for ResilientProvider<P> {
  fn name(&self) -> &str {
    self.inner.name()
  }

  fn model_id(&self) -> &str {
    self.inner.model_id()
  }

  fn dimensions(&self) -> usize {
    self.inner.dimensions()
  }

  async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
    self.run_with_retry("single", || self.inner.embed(text)).await
  }

  async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if texts.is_empty() {
      return Ok(Vec::new());
    }
    self.run_with_retry("batch", || self.inner.embed_batch(texts)).await
  }
}
