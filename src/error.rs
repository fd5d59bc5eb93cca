//! Boundary error taxonomy.
//!
//! Module-level operations return their own `thiserror` enums; everything
//! that crosses the engine boundary is folded into [`EngineError`]. Per-file
//! problems during scanning or embedding are contained where they occur and
//! never surface here.

use std::path::PathBuf;

use crate::{embedding::EmbeddingError, store::StoreError, vector::VectorError};

/// Errors surfaced by the engine's public operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("vector length {got} does not match configured dimensions {expected}")]
  DimensionMismatch { expected: usize, got: usize },

  #[error("document already indexed: {0}")]
  DuplicateId(String),

  #[error("index artifact failed validation: {0}")]
  IndexCorruption(String),

  #[error("embedding provider failed: {0}")]
  Provider(#[from] EmbeddingError),

  #[error("operation cancelled")]
  Cancelled,

  #[error("indexing failed: {0}")]
  Indexing(String),

  #[error("invalid configuration: {0}")]
  Config(String),

  #[error("watcher error: {0}")]
  Watch(#[from] notify::Error),

  #[error("invalid path: {0}")]
  InvalidPath(PathBuf),
}

impl From<StoreError> for EngineError {
  fn from(err: StoreError) -> Self {
    match err {
      StoreError::Corrupt(msg) => EngineError::IndexCorruption(msg),
      StoreError::Sqlite(e) => EngineError::IndexCorruption(e.to_string()),
      StoreError::Io(e) => EngineError::Io(e),
    }
  }
}

impl From<VectorError> for EngineError {
  fn from(err: VectorError) -> Self {
    match err {
      VectorError::DimensionMismatch { expected, got } => EngineError::DimensionMismatch { expected, got },
      VectorError::DuplicateId(id) => EngineError::DuplicateId(id),
      VectorError::Corrupt(msg) => EngineError::IndexCorruption(msg),
      VectorError::Io(e) => EngineError::Io(e),
    }
  }
}
