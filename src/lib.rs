//! Embedded codebase search.
//!
//! Builds and maintains a persistent index over a directory of source
//! files and answers free-text queries in three modes: lexical (TF-IDF
//! over code-aware tokens), semantic (k-NN over dense embeddings), and a
//! weighted hybrid of the two. The index stays live through a debounced
//! file watcher and is updated incrementally — one modified file never
//! forces a full rebuild.
//!
//! Entry point: [`SearchEngine`].

pub mod cache;
pub mod config;
pub mod domain;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod hybrid;
pub mod scanner;
pub mod store;
pub mod tfidf;
pub mod tokenizer;
pub mod vector;

pub use config::{CacheConfig, EmbeddingConfig, EngineConfig, HnswParams, ProviderSelection};
pub use domain::{
  IndexProgress, IndexStage, IndexingStatus, Language, Provenance, SearchMode, SearchOptions, SearchResult,
};
pub use engine::{IndexOptions, IndexSummary, SearchEngine};
pub use error::EngineError;
