//! Query result cache.
//!
//! An LRU cache with per-entry TTL over fully decorated result lists,
//! keyed by the normalized query plus every option that can change the
//! answer. Reads refresh recency. Invalidation is deliberately coarse:
//! any index mutation flushes the whole cache, because the ranker keeps
//! no reverse dependency map from documents to cached queries.

use std::{
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  time::Duration,
};

use moka::sync::Cache;

use crate::{
  config::CacheConfig,
  domain::{SearchMode, SearchResult},
};

// ============================================================================
// Key
// ============================================================================

/// Cache key: normalized query string plus the options that shape the
/// result set. Float options are keyed by bit pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  query: String,
  mode: SearchMode,
  limit: usize,
  weight_bits: u32,
  min_score_bits: u32,
  language: Option<String>,
  include_content: bool,
}

impl CacheKey {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    query: &str,
    mode: SearchMode,
    limit: usize,
    vector_weight: f32,
    min_score: f32,
    language: Option<&str>,
    include_content: bool,
  ) -> Self {
    Self {
      query: normalize_query(query),
      mode,
      limit,
      weight_bits: vector_weight.to_bits(),
      min_score_bits: min_score.to_bits(),
      language: language.map(str::to_string),
      include_content,
    }
  }
}

/// Lowercase and collapse whitespace so trivially different spellings of
/// the same query share an entry.
pub fn normalize_query(query: &str) -> String {
  query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

// ============================================================================
// Cache
// ============================================================================

/// Hit/miss counters, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
  pub entries: u64,
}

/// LRU + TTL cache over ranked result lists.
pub struct ResultCache {
  cache: Cache<CacheKey, Arc<Vec<SearchResult>>>,
  hits: AtomicU64,
  misses: AtomicU64,
}

impl ResultCache {
  pub fn new(config: &CacheConfig) -> Self {
    Self {
      cache: Cache::builder()
        .max_capacity(config.capacity)
        .time_to_live(Duration::from_secs(config.ttl_secs))
        .build(),
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
    }
  }

  pub fn get(&self, key: &CacheKey) -> Option<Arc<Vec<SearchResult>>> {
    match self.cache.get(key) {
      Some(results) => {
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(results)
      }
      None => {
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
      }
    }
  }

  pub fn put(&self, key: CacheKey, results: Vec<SearchResult>) {
    self.cache.insert(key, Arc::new(results));
  }

  /// Flush everything. Called on every index mutation.
  pub fn clear(&self) {
    self.cache.invalidate_all();
  }

  pub fn stats(&self) -> CacheStats {
    // entry_count is eventually consistent; sync pending maintenance first.
    self.cache.run_pending_tasks();
    CacheStats {
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      entries: self.cache.entry_count(),
    }
  }
}
