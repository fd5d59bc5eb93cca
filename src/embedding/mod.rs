//! Embedding provider interface.
//!
//! A provider turns text into fixed-dimension vectors; the engine only
//! depends on the [`EmbeddingProvider`] trait. Concrete transports live
//! behind it: an HTTP implementation in [`http`], a deterministic mock for
//! tests, and combinators ([`with_fallback`], [`resilient::ResilientProvider`])
//! that compose providers without the engine knowing.
//!
//! Provider selection is a closed sum over the built-ins plus a `Named`
//! escape hatch resolved through an explicit [`ProviderRegistry`] value, so
//! hosts can plug in their own transports and tests can swap the registry
//! wholesale. Retries and rate-limit handling are the concern of concrete
//! implementations, not of the engine.

pub mod http;
pub mod resilient;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::{EmbeddingConfig, ProviderSelection};

// ============================================================================
// Trait and Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
  #[error("request failed: {0}")]
  Request(#[from] reqwest::Error),

  #[error("provider error: {0}")]
  Provider(String),

  #[error("network error: {0}")]
  Network(String),

  #[error("request timed out")]
  Timeout,

  #[error("provider produced {got}-dimension vector, expected {expected}")]
  Dimensions { expected: usize, got: usize },

  #[error("unknown embedding provider: {0}")]
  UnknownProvider(String),
}

/// Generates embeddings for documents and queries.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
  fn name(&self) -> &str;
  fn model_id(&self) -> &str;
  /// Length of every vector this provider produces.
  fn dimensions(&self) -> usize;

  async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
  async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

// ============================================================================
// Mock Provider
// ============================================================================

/// Deterministic provider for tests: vectors are derived from a sha256 of
/// the text, so the same input always embeds identically and different
/// inputs land in different directions. No network, never fails.
pub struct MockProvider {
  dimensions: usize,
}

impl MockProvider {
  pub fn new(dimensions: usize) -> Self {
    Self { dimensions }
  }

  fn vector_for(&self, text: &str) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    let mut v: Vec<f32> = (0..self.dimensions)
      .map(|i| {
        let byte = digest[i % digest.len()];
        // Rotate by index so dimensions beyond the digest differ.
        let mixed = byte.wrapping_add((i / digest.len()) as u8 * 31);
        (mixed as f32 / 127.5) - 1.0
      })
      .collect();
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
      for x in &mut v {
        *x /= norm;
      }
    }
    v
  }
}

#[async_trait]
impl EmbeddingProvider for MockProvider {
  fn name(&self) -> &str {
    "mock"
  }

  fn model_id(&self) -> &str {
    "mock-sha256"
  }

  fn dimensions(&self) -> usize {
    self.dimensions
  }

  async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
    Ok(self.vector_for(text))
  }

  async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    Ok(texts.iter().map(|t| self.vector_for(t)).collect())
  }
}

// ============================================================================
// Fallback Combinator
// ============================================================================

/// Provider that tries `primary` and, on any failure, returns the
/// `secondary`'s result for the same input.
pub struct FallbackProvider {
  primary: Arc<dyn EmbeddingProvider>,
  secondary: Arc<dyn EmbeddingProvider>,
}

/// Compose two providers into a fallback chain.
pub fn with_fallback(
  primary: Arc<dyn EmbeddingProvider>,
  secondary: Arc<dyn EmbeddingProvider>,
) -> FallbackProvider {
  if primary.dimensions() != secondary.dimensions() {
    warn!(
      primary = primary.dimensions(),
      secondary = secondary.dimensions(),
      "Fallback providers disagree on dimensions; secondary results will be rejected downstream"
    );
  }
  FallbackProvider { primary, secondary }
}

#[async_trait]
impl EmbeddingProvider for FallbackProvider {
  fn name(&self) -> &str {
    self.primary.name()
  }

  fn model_id(&self) -> &str {
    self.primary.model_id()
  }

  fn dimensions(&self) -> usize {
    self.primary.dimensions()
  }

  async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
    match self.primary.embed(text).await {
      Ok(vector) => Ok(vector),
      Err(e) => {
        warn!(provider = self.primary.name(), error = %e, "Primary embed failed, using fallback");
        self.secondary.embed(text).await
      }
    }
  }

  async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    match self.primary.embed_batch(texts).await {
      Ok(vectors) => Ok(vectors),
      Err(e) => {
        warn!(provider = self.primary.name(), error = %e, "Primary batch embed failed, using fallback");
        self.secondary.embed_batch(texts).await
      }
    }
  }
}

// ============================================================================
// Registry
// ============================================================================

/// Factory for externally registered providers.
pub type ProviderFactory =
  Arc<dyn Fn(&EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> + Send + Sync>;

/// Explicit name → factory mapping for providers beyond the built-ins.
///
/// Passed through engine construction rather than living in a global, so
/// tests can substitute their own instance.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
  factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, name: impl Into<String>, factory: ProviderFactory) {
    self.factories.insert(name.into(), factory);
  }

  /// Resolve a selection into a concrete provider.
  ///
  /// Unknown `Named` selections fail with
  /// [`EmbeddingError::UnknownProvider`], which the engine surfaces as a
  /// configuration error.
  pub fn resolve(
    &self,
    selection: &ProviderSelection,
    config: &EmbeddingConfig,
  ) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    match selection {
      ProviderSelection::Mock => Ok(Arc::new(MockProvider::new(config.dimensions))),
      ProviderSelection::Http => {
        let provider = http::HttpProvider::new(config)?;
        Ok(Arc::new(resilient::ResilientProvider::new(provider)))
      }
      ProviderSelection::Named(name) => {
        let factory = self
          .factories
          .get(name)
          .ok_or_else(|| EmbeddingError::UnknownProvider(name.clone()))?;
        factory(config)
      }
    }
  }
}
