//! Test helpers for engine integration tests.
//!
//! Provides [`EngineTestContext`], which manages a temporary codebase root
//! and builds engines against it, plus scripted embedding providers for
//! exercising the semantic and failure paths deterministically.

use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::{
  config::{EngineConfig, ProviderSelection},
  embedding::{EmbeddingError, EmbeddingProvider, ProviderRegistry},
  engine::SearchEngine,
};

/// Dimensions used by all test providers.
pub const TEST_DIMS: usize = 8;

/// Temporary codebase root plus the config pointing at it.
pub struct EngineTestContext {
  pub root: TempDir,
  pub config: EngineConfig,
}

impl EngineTestContext {
  /// Context with no embedding provider (lexical only).
  pub fn new() -> Self {
    let root = TempDir::new().expect("create temp root");
    let config = EngineConfig::new(root.path());
    Self { root, config }
  }

  /// Context with the deterministic mock provider enabled.
  pub fn with_mock_provider() -> Self {
    let mut ctx = Self::new();
    ctx.config.embedding.provider = Some(ProviderSelection::Mock);
    ctx.config.embedding.dimensions = TEST_DIMS;
    ctx
  }

  /// Write (or overwrite) a file under the root.
  pub fn write(&self, relative: &str, content: &str) {
    let path = self.root.path().join(relative);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).expect("create parent dirs");
    }
    std::fs::write(path, content).expect("write test file");
  }

  pub fn remove(&self, relative: &str) {
    std::fs::remove_file(self.root.path().join(relative)).expect("remove test file");
  }

  pub fn engine(&self) -> SearchEngine {
    SearchEngine::open(self.config.clone()).expect("open engine")
  }

  pub fn engine_with_registry(&self, registry: &ProviderRegistry) -> SearchEngine {
    SearchEngine::open_with_registry(self.config.clone(), registry).expect("open engine")
  }
}

// ============================================================================
// Scripted Providers
// ============================================================================

/// Provider backed by a plain function, for scripting exact geometry.
pub struct ScriptedProvider {
  dimensions: usize,
  script: Box<dyn Fn(&str) -> Vec<f32> + Send + Sync>,
}

impl ScriptedProvider {
  pub fn new(dimensions: usize, script: impl Fn(&str) -> Vec<f32> + Send + Sync + 'static) -> Self {
    Self {
      dimensions,
      script: Box::new(script),
    }
  }
}

#[async_trait]
impl EmbeddingProvider for ScriptedProvider {
  fn name(&self) -> &str {
    "scripted"
  }
  fn model_id(&self) -> &str {
    "scripted"
  }
  fn dimensions(&self) -> usize {
    self.dimensions
  }

  async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
    Ok((self.script)(text))
  }

  async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    Ok(texts.iter().map(|t| (self.script)(t)).collect())
  }
}

/// Provider whose every call fails, for exercising degradation.
pub struct BrokenProvider {
  dimensions: usize,
}

impl BrokenProvider {
  pub fn new(dimensions: usize) -> Self {
    Self { dimensions }
  }
}

#[async_trait]
impl EmbeddingProvider for BrokenProvider {
  fn name(&self) -> &str {
    "broken"
  }
  fn model_id(&self) -> &str {
    "broken"
  }
  fn dimensions(&self) -> usize {
    self.dimensions
  }

  async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
    Err(EmbeddingError::Provider("always fails".to_string()))
  }

  async fn embed_batch(&self, _texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    Err(EmbeddingError::Provider("always fails".to_string()))
  }
}

/// Registry with a named factory wrapping an existing provider instance.
pub fn registry_with(name: &str, provider: Arc<dyn EmbeddingProvider>) -> ProviderRegistry {
  let mut registry = ProviderRegistry::new();
  registry.register(
    name,
    Arc::new(move |_config: &crate::config::EmbeddingConfig| Ok(provider.clone())),
  );
  registry
}

/// A unit vector along `axis`, padded to [`TEST_DIMS`].
pub fn axis_vector(axis: usize) -> Vec<f32> {
  let mut v = vec![0.0; TEST_DIMS];
  v[axis % TEST_DIMS] = 1.0;
  v
}

/// A vector near `axis 0` but tilted slightly toward `axis 1`.
pub fn near_axis_vector() -> Vec<f32> {
  let mut v = vec![0.0; TEST_DIMS];
  v[0] = 0.95;
  v[1] = 0.05;
  v
}
