//! Engine configuration.
//!
//! The host application constructs an [`EngineConfig`] and hands it to
//! [`crate::engine::SearchEngine::open`]. There is no config-file loading
//! here; the embedding surface (CLI, MCP, editor plugin) owns that.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Default maximum file size admitted by the scanner (1 MiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024;

/// Default watcher debounce in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// Default fraction of changed documents above which the incremental
/// engine defers to a full rebuild.
pub const DEFAULT_REBUILD_THRESHOLD: f64 = 0.20;

// ============================================================================
// HNSW Parameters
// ============================================================================

/// Tuning parameters for the HNSW graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswParams {
  /// Max connections per node (`M`).
  pub m: usize,
  /// Candidate list size during construction.
  pub ef_construction: usize,
  /// Candidate list size during search.
  pub ef_search: usize,
  /// Graph capacity; grown by rebuild when approached.
  pub max_elements: usize,
}

impl Default for HnswParams {
  fn default() -> Self {
    Self {
      m: 16,
      ef_construction: 200,
      ef_search: 50,
      max_elements: 10_000,
    }
  }
}

// ============================================================================
// Cache Configuration
// ============================================================================

/// Result cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Maximum number of cached query results.
  pub capacity: u64,
  /// Per-entry time to live, in seconds.
  pub ttl_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      capacity: 256,
      ttl_secs: 300,
    }
  }
}

// ============================================================================
// Embedding Configuration
// ============================================================================

/// Which embedding provider to construct.
///
/// Built-ins are enumerated; anything else goes through the named registry
/// (see [`crate::embedding::ProviderRegistry`]), and unknown names fail with
/// a configuration error at engine construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderSelection {
  /// Deterministic hash-based vectors; no network. Intended for tests.
  Mock,
  /// HTTP provider speaking an ollama-style batch embed endpoint.
  Http,
  /// Resolved through the provider registry by name.
  Named(String),
}

/// Connection and model settings shared by embedding providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
  /// Provider to use. `None` disables the vector index entirely.
  pub provider: Option<ProviderSelection>,
  /// Model identifier sent to the provider.
  pub model: String,
  /// Expected vector length. Every produced vector must match.
  pub dimensions: usize,
  /// Base URL for the HTTP provider.
  pub base_url: String,
  /// Per-request timeout in seconds.
  pub timeout_secs: u64,
  /// Maximum texts per embed call.
  pub max_batch_size: usize,
}

impl Default for EmbeddingConfig {
  fn default() -> Self {
    Self {
      provider: None,
      model: "nomic-embed-text".to_string(),
      dimensions: 768,
      base_url: "http://localhost:11434".to_string(),
      timeout_secs: 60,
      max_batch_size: 32,
    }
  }
}

// ============================================================================
// Engine Configuration
// ============================================================================

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
  /// Root directory of the codebase to index. Must exist.
  pub codebase_root: PathBuf,
  /// Files larger than this are excluded from indexing.
  #[serde(default = "default_max_file_size")]
  pub max_file_size: u64,
  /// Extra ignore globs applied on top of `.gitignore` chains and the
  /// built-in rules.
  #[serde(default)]
  pub ignore_extra: Vec<String>,
  #[serde(default)]
  pub embedding: EmbeddingConfig,
  #[serde(default)]
  pub hnsw: HnswParams,
  #[serde(default)]
  pub cache: CacheConfig,
  /// Watcher debounce window in milliseconds.
  #[serde(default = "default_debounce_ms")]
  pub debounce_ms: u64,
  /// Changed-fraction threshold above which incremental updates defer to a
  /// full rebuild.
  #[serde(default = "default_rebuild_threshold")]
  pub rebuild_threshold: f64,
}

fn default_max_file_size() -> u64 {
  DEFAULT_MAX_FILE_SIZE
}

fn default_debounce_ms() -> u64 {
  DEFAULT_DEBOUNCE_MS
}

fn default_rebuild_threshold() -> f64 {
  DEFAULT_REBUILD_THRESHOLD
}

impl EngineConfig {
  /// Configuration with defaults for everything but the root.
  pub fn new(codebase_root: impl Into<PathBuf>) -> Self {
    Self {
      codebase_root: codebase_root.into(),
      max_file_size: DEFAULT_MAX_FILE_SIZE,
      ignore_extra: Vec::new(),
      embedding: EmbeddingConfig::default(),
      hnsw: HnswParams::default(),
      cache: CacheConfig::default(),
      debounce_ms: DEFAULT_DEBOUNCE_MS,
      rebuild_threshold: DEFAULT_REBUILD_THRESHOLD,
    }
  }

  /// Directory where the engine keeps its persistent artifacts.
  pub fn index_dir(&self) -> PathBuf {
    self.codebase_root.join(".codebase-search")
  }

  pub fn db_path(&self) -> PathBuf {
    self.index_dir().join("index.db")
  }

  pub fn snapshot_path(&self) -> PathBuf {
    self.index_dir().join("vectors.hnsw")
  }

  /// Validate construction-time invariants.
  pub fn validate(&self) -> Result<(), EngineError> {
    if !self.codebase_root.is_dir() {
      return Err(EngineError::Config(format!(
        "codebase root is not a directory: {}",
        self.codebase_root.display()
      )));
    }
    if !(0.0..=1.0).contains(&self.rebuild_threshold) {
      return Err(EngineError::Config(format!(
        "rebuild threshold must be within [0, 1], got {}",
        self.rebuild_threshold
      )));
    }
    if self.embedding.provider.is_some() && self.embedding.dimensions == 0 {
      return Err(EngineError::Config(
        "embedding dimensions must be non-zero when a provider is configured".to_string(),
      ));
    }
    if self.hnsw.max_elements == 0 {
      return Err(EngineError::Config("hnsw max_elements must be non-zero".to_string()));
    }
    Ok(())
  }
}
