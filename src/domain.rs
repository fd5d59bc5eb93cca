//! Shared domain types for the search engine.
//!
//! Everything here is plain data: file records produced by the scanner,
//! the search result envelope, and the status/progress types published by
//! the indexing pipeline. Identity for a document is its path relative to
//! the codebase root.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of characters kept as a content preview on records and
/// vector metadata.
pub const MAX_PREVIEW_CHARS: usize = 500;

// ============================================================================
// Language
// ============================================================================

/// Source language tag, detected from the file extension.
///
/// The tag drives stopword selection in the tokenizer and is carried on
/// records and results so callers can filter by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
  TypeScript,
  JavaScript,
  Rust,
  Python,
  Go,
  Java,
  Kotlin,
  CSharp,
  Cpp,
  C,
  Swift,
  Ruby,
  Php,
  Lua,
  Elixir,
  Haskell,
  Zig,
  Json,
  Yaml,
  Toml,
  Markdown,
  Shell,
  Sql,
  Proto,
}

impl Language {
  pub fn from_extension(ext: &str) -> Option<Self> {
    match ext.to_lowercase().as_str() {
      "ts" | "mts" | "tsx" => Some(Language::TypeScript),
      "js" | "mjs" | "cjs" | "jsx" => Some(Language::JavaScript),
      "rs" => Some(Language::Rust),
      "py" | "pyi" | "pyw" => Some(Language::Python),
      "go" => Some(Language::Go),
      "java" => Some(Language::Java),
      "kt" | "kts" => Some(Language::Kotlin),
      "cs" => Some(Language::CSharp),
      "cpp" | "cc" | "cxx" | "hpp" | "hxx" | "h" => Some(Language::Cpp),
      "c" => Some(Language::C),
      "swift" => Some(Language::Swift),
      "rb" | "rake" => Some(Language::Ruby),
      "php" => Some(Language::Php),
      "lua" => Some(Language::Lua),
      "ex" | "exs" => Some(Language::Elixir),
      "hs" => Some(Language::Haskell),
      "zig" => Some(Language::Zig),
      "json" | "jsonc" => Some(Language::Json),
      "yaml" | "yml" => Some(Language::Yaml),
      "toml" => Some(Language::Toml),
      "md" | "markdown" => Some(Language::Markdown),
      "sh" | "bash" | "zsh" | "fish" => Some(Language::Shell),
      "sql" => Some(Language::Sql),
      "proto" => Some(Language::Proto),
      _ => None,
    }
  }

  /// Lowercase name as stored in the database and surfaced on results.
  pub fn as_str(&self) -> &'static str {
    match self {
      Language::TypeScript => "typescript",
      Language::JavaScript => "javascript",
      Language::Rust => "rust",
      Language::Python => "python",
      Language::Go => "go",
      Language::Java => "java",
      Language::Kotlin => "kotlin",
      Language::CSharp => "csharp",
      Language::Cpp => "cpp",
      Language::C => "c",
      Language::Swift => "swift",
      Language::Ruby => "ruby",
      Language::Php => "php",
      Language::Lua => "lua",
      Language::Elixir => "elixir",
      Language::Haskell => "haskell",
      Language::Zig => "zig",
      Language::Json => "json",
      Language::Yaml => "yaml",
      Language::Toml => "toml",
      Language::Markdown => "markdown",
      Language::Shell => "shell",
      Language::Sql => "sql",
      Language::Proto => "proto",
    }
  }

  pub fn from_str_tag(tag: &str) -> Option<Self> {
    match tag {
      "typescript" => Some(Language::TypeScript),
      "javascript" => Some(Language::JavaScript),
      "rust" => Some(Language::Rust),
      "python" => Some(Language::Python),
      "go" => Some(Language::Go),
      "java" => Some(Language::Java),
      "kotlin" => Some(Language::Kotlin),
      "csharp" => Some(Language::CSharp),
      "cpp" => Some(Language::Cpp),
      "c" => Some(Language::C),
      "swift" => Some(Language::Swift),
      "ruby" => Some(Language::Ruby),
      "php" => Some(Language::Php),
      "lua" => Some(Language::Lua),
      "elixir" => Some(Language::Elixir),
      "haskell" => Some(Language::Haskell),
      "zig" => Some(Language::Zig),
      "json" => Some(Language::Json),
      "yaml" => Some(Language::Yaml),
      "toml" => Some(Language::Toml),
      "markdown" => Some(Language::Markdown),
      "shell" => Some(Language::Shell),
      "sql" => Some(Language::Sql),
      "proto" => Some(Language::Proto),
      _ => None,
    }
  }
}

// ============================================================================
// File Records
// ============================================================================

/// One tracked file as known to the persistent store.
///
/// Created on first observation, mutated when the content hash changes,
/// destroyed when the file disappears from a scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
  /// Path relative to the codebase root; the document identity.
  pub path: String,
  /// Absolute path on disk.
  pub abs_path: PathBuf,
  /// Size in bytes at index time.
  pub size: u64,
  /// Hex sha256 of the raw bytes.
  pub hash: String,
  /// Detected language, if the extension is recognized.
  pub language: Option<Language>,
  /// When this record was last (re)indexed.
  pub indexed_at: DateTime<Utc>,
}

/// The kind of change the scanner or watcher observed for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
  Added,
  Updated,
  Deleted,
}

/// A single file mutation flowing into the indexing pipeline.
#[derive(Debug, Clone)]
pub struct FileChange {
  pub kind: ChangeKind,
  /// Path relative to the codebase root.
  pub path: String,
}

// ============================================================================
// Search
// ============================================================================

/// Which subsystem answers a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
  Lexical,
  Semantic,
  Hybrid,
}

impl SearchMode {
  pub fn as_str(&self) -> &'static str {
    match self {
      SearchMode::Lexical => "lexical",
      SearchMode::Semantic => "semantic",
      SearchMode::Hybrid => "hybrid",
    }
  }
}

/// Which subsystem(s) produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
  Lexical,
  Vector,
  Hybrid,
}

/// A ranked search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
  /// Path relative to the codebase root.
  pub path: String,
  /// Fused or raw score, non-negative.
  pub score: f32,
  pub provenance: Provenance,
  /// Query terms that matched in the lexical index, if any.
  #[serde(skip_serializing_if = "Vec::is_empty", default)]
  pub matched_terms: Vec<String>,
  /// Raw cosine similarity from the vector store, if it contributed.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub similarity: Option<f32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub content_preview: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub language: Option<String>,
}

/// Options accepted by [`crate::engine::SearchEngine::search`].
#[derive(Debug, Clone)]
pub struct SearchOptions {
  /// Maximum number of results.
  pub limit: usize,
  pub mode: SearchMode,
  /// Hybrid weight for the vector stream, in `[0, 1]`.
  pub vector_weight: f32,
  /// Results scoring below this are dropped.
  pub min_score: f32,
  /// Attach content previews to results.
  pub include_content: bool,
  /// Restrict results to a single language tag.
  pub language: Option<Language>,
}

impl Default for SearchOptions {
  fn default() -> Self {
    Self {
      limit: 10,
      mode: SearchMode::Hybrid,
      vector_weight: 0.7,
      min_score: 0.01,
      include_content: false,
      language: None,
    }
  }
}

// ============================================================================
// Indexing Status and Progress
// ============================================================================

/// Stage of the indexing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexStage {
  Idle,
  Scanning,
  Tfidf,
  Vectors,
  Complete,
  Error,
}

/// Snapshot of pipeline state, readable at any time via
/// [`crate::engine::SearchEngine::status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexingStatus {
  pub is_indexing: bool,
  pub stage: IndexStage,
  /// 0–100, monotonic within a stage.
  pub progress: u8,
  pub total_files: usize,
  pub indexed_files: usize,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub current_file: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl Default for IndexingStatus {
  fn default() -> Self {
    Self {
      is_indexing: false,
      stage: IndexStage::Idle,
      progress: 0,
      total_files: 0,
      indexed_files: 0,
      current_file: None,
      error: None,
    }
  }
}

/// Progress update delivered to the `on_progress` callback channel.
#[derive(Debug, Clone)]
pub struct IndexProgress {
  pub stage: IndexStage,
  pub current: usize,
  pub total: usize,
  pub file_name: Option<String>,
}

impl IndexProgress {
  pub fn new(stage: IndexStage, current: usize, total: usize) -> Self {
    Self {
      stage,
      current,
      total,
      file_name: None,
    }
  }

  pub fn with_file(mut self, file: impl Into<String>) -> Self {
    self.file_name = Some(file.into());
    self
  }

  /// Completion percentage within the stage.
  pub fn percent(&self) -> u8 {
    if self.total == 0 {
      100
    } else {
      ((self.current as f64 / self.total as f64) * 100.0).min(100.0) as u8
    }
  }
}

/// Build a content preview capped at [`MAX_PREVIEW_CHARS`], cutting on a
/// char boundary.
pub fn content_preview(content: &str) -> String {
  content.chars().take(MAX_PREVIEW_CHARS).collect()
}
