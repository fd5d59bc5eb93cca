//! The search engine orchestrator.
//!
//! [`SearchEngine`] owns every subsystem: the scanner, the persistent
//! store, the in-memory TF-IDF index, the HNSW vector store, the result
//! cache, and (in watch mode) the debounced file watcher. Instead of
//! shared-state concurrency between components, the watcher communicates
//! with the engine over an mpsc channel of change batches.
//!
//! # Concurrency
//!
//! Searches take a read lock over the index state and may run
//! concurrently; the pipeline is the only writer and takes the write lock
//! per stage. At most one pipeline runs at a time: a second `index()` call
//! while one is in flight subscribes to the running pipeline's outcome
//! instead of starting another (single-flight).

mod pipeline;
mod watcher;

#[cfg(test)]
mod __tests__;

pub use pipeline::IndexSummary;

use std::{
  collections::HashMap,
  sync::{Arc, Mutex as StdMutex, atomic::AtomicU64},
  time::Duration,
};

use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
  cache::{CacheKey, CacheStats, ResultCache, normalize_query},
  config::EngineConfig,
  domain::{
    FileChange, IndexProgress, IndexStage, IndexingStatus, Language, Provenance, SearchMode, SearchOptions,
    SearchResult,
  },
  embedding::{EmbeddingError, EmbeddingProvider, ProviderRegistry},
  error::EngineError,
  scanner::Scanner,
  store::{FileMeta, IndexStore, StoreError},
  tfidf::{ScoredDoc, TfIdfIndex},
  tokenizer::tokenize,
  vector::{VectorMetadata, VectorStore},
};

use self::pipeline::PipelineInput;
use self::watcher::WatcherTask;

// ============================================================================
// Options
// ============================================================================

/// Options for [`SearchEngine::index`].
#[derive(Default)]
pub struct IndexOptions {
  /// Keep a file watcher running after this pipeline completes.
  pub watch: bool,
  /// Channel receiving stage transitions and per-file progress.
  pub progress: Option<mpsc::Sender<IndexProgress>>,
  /// Cooperative cancellation; checked between files and stages.
  pub cancel: Option<CancellationToken>,
}

// ============================================================================
// Shared State
// ============================================================================

/// Everything searches read and the pipeline writes.
pub(crate) struct IndexState {
  pub(crate) tfidf: TfIdfIndex,
  pub(crate) vectors: Option<VectorStore>,
  /// Per-document language and preview for result decoration.
  pub(crate) meta: HashMap<String, FileMeta>,
}

type Outcome = Result<IndexSummary, String>;
type InFlight = Option<watch::Receiver<Option<Outcome>>>;

pub(crate) struct EngineInner {
  pub(crate) config: EngineConfig,
  pub(crate) scanner: Scanner,
  pub(crate) provider: Option<Arc<dyn EmbeddingProvider>>,
  pub(crate) cache: ResultCache,
  pub(crate) state: RwLock<IndexState>,
  pub(crate) store: Mutex<IndexStore>,
  status_tx: watch::Sender<IndexingStatus>,
  in_flight: StdMutex<InFlight>,
  watch_cancel: StdMutex<Option<CancellationToken>>,
  pub(crate) pipeline_runs: AtomicU64,
}

impl EngineInner {
  pub(crate) fn update_status(&self, f: impl FnOnce(&mut IndexingStatus)) {
    self.status_tx.send_modify(f);
  }
}

enum Begin {
  Leader(watch::Sender<Option<Outcome>>),
  Joiner(watch::Receiver<Option<Outcome>>),
}

impl EngineInner {
  /// Claim leadership of the indexing pipeline or subscribe to the run
  /// already in flight.
  fn begin(&self) -> Begin {
    let mut guard = self.in_flight.lock().unwrap();
    if let Some(rx) = guard.as_ref() {
      Begin::Joiner(rx.clone())
    } else {
      let (tx, rx) = watch::channel(None);
      *guard = Some(rx);
      Begin::Leader(tx)
    }
  }
}

/// Run the pipeline as leader, or await the in-flight run's outcome.
///
/// Returns whether this caller led the run — a joiner's batch has NOT
/// been processed and must be resubmitted if it carried one.
async fn run_or_join(
  inner: &Arc<EngineInner>,
  input: PipelineInput,
  progress: Option<mpsc::Sender<IndexProgress>>,
  cancel: CancellationToken,
) -> (bool, Result<IndexSummary, EngineError>) {
  match inner.begin() {
    Begin::Leader(tx) => {
      let result = pipeline::run(inner, input, progress, cancel).await;
      // Clear before publishing so late subscribers start a fresh run
      // instead of adopting a finished one.
      *inner.in_flight.lock().unwrap() = None;
      if let Err(e) = &result {
        inner.update_status(|s| {
          s.is_indexing = false;
          s.stage = IndexStage::Error;
          s.error = Some(e.to_string());
        });
      }
      let outcome = match &result {
        Ok(summary) => Ok(summary.clone()),
        Err(e) => Err(e.to_string()),
      };
      let _ = tx.send(Some(outcome));
      (true, result)
    }
    Begin::Joiner(mut rx) => loop {
      if let Some(outcome) = rx.borrow_and_update().clone() {
        return (false, outcome.map_err(EngineError::Indexing));
      }
      if rx.changed().await.is_err() {
        return (false, Err(EngineError::Indexing("indexing task ended unexpectedly".to_string())));
      }
    },
  }
}

// ============================================================================
// SearchEngine
// ============================================================================

/// Embedded codebase search engine.
#[derive(Clone)]
pub struct SearchEngine {
  inner: Arc<EngineInner>,
}

impl SearchEngine {
  /// Open an engine with the default provider registry.
  pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
    Self::open_with_registry(config, &ProviderRegistry::default())
  }

  /// Open an engine, resolving named providers through `registry`.
  ///
  /// Loads persisted state from `.codebase-search/` under the root.
  /// Corrupted artifacts are discarded with a warning — the next
  /// `index()` rebuilds them from source.
  pub fn open_with_registry(config: EngineConfig, registry: &ProviderRegistry) -> Result<Self, EngineError> {
    config.validate()?;

    let provider = match &config.embedding.provider {
      None => None,
      Some(selection) => {
        let provider = registry.resolve(selection, &config.embedding).map_err(|e| match e {
          EmbeddingError::UnknownProvider(name) => {
            EngineError::Config(format!("unknown embedding provider: {name}"))
          }
          other => EngineError::Provider(other),
        })?;
        if provider.dimensions() != config.embedding.dimensions {
          return Err(EngineError::Config(format!(
            "provider {} produces {}-dimension vectors but {} are configured",
            provider.name(),
            provider.dimensions(),
            config.embedding.dimensions
          )));
        }
        Some(provider)
      }
    };

    let db_path = config.db_path();
    let store = match IndexStore::open(&db_path) {
      Ok(store) => store,
      Err(StoreError::Corrupt(msg)) => {
        warn!(path = %db_path.display(), error = %msg, "Index store corrupted, rebuilding from source");
        let _ = std::fs::remove_file(&db_path);
        IndexStore::open(&db_path)?
      }
      Err(e) => return Err(e.into()),
    };

    let tfidf = TfIdfIndex::from_stored(store.load_documents()?, store.load_postings()?);
    let meta = store.file_meta()?;
    if !meta.is_empty() {
      info!(documents = tfidf.document_count(), "Loaded persisted lexical index");
    }

    let vectors = match &provider {
      None => None,
      Some(_) => {
        let snapshot = config.snapshot_path();
        if snapshot.exists() {
          match VectorStore::load(&snapshot, config.embedding.dimensions, config.hnsw.clone()) {
            Ok(store) => Some(store),
            Err(e) => {
              warn!(error = %e, "Vector snapshot failed validation, discarding");
              let _ = std::fs::remove_file(&snapshot);
              let _ = std::fs::remove_file(crate::vector::sidecar_path(&snapshot));
              Some(VectorStore::new(config.embedding.dimensions, config.hnsw.clone()))
            }
          }
        } else {
          Some(VectorStore::new(config.embedding.dimensions, config.hnsw.clone()))
        }
      }
    };

    let scanner = Scanner::new(&config);
    let cache = ResultCache::new(&config.cache);
    let (status_tx, _) = watch::channel(IndexingStatus::default());

    Ok(Self {
      inner: Arc::new(EngineInner {
        config,
        scanner,
        provider,
        cache,
        state: RwLock::new(IndexState {
          tfidf,
          vectors,
          meta,
        }),
        store: Mutex::new(store),
        status_tx,
        in_flight: StdMutex::new(None),
        watch_cancel: StdMutex::new(None),
        pipeline_runs: AtomicU64::new(0),
      }),
    })
  }

  // ==========================================================================
  // Indexing
  // ==========================================================================

  /// Run the indexing pipeline.
  ///
  /// Joins the in-flight pipeline if one is already running. With
  /// `watch: true`, a debounced file watcher keeps the index live after
  /// this call returns.
  pub async fn index(&self, options: IndexOptions) -> Result<IndexSummary, EngineError> {
    let cancel = options.cancel.unwrap_or_default();
    let (_, result) = run_or_join(&self.inner, PipelineInput::FullScan, options.progress, cancel).await;
    if options.watch && result.is_ok() {
      self.ensure_watcher()?;
    }
    result
  }

  /// Spawn the pipeline without blocking the caller; failures surface
  /// through [`SearchEngine::status`].
  pub fn start_background_indexing(&self, options: IndexOptions) {
    let engine = self.clone();
    tokio::spawn(async move {
      if let Err(e) = engine.index(options).await {
        warn!(error = %e, "Background indexing failed");
      }
    });
  }

  /// Current pipeline status snapshot.
  pub fn status(&self) -> IndexingStatus {
    self.inner.status_tx.borrow().clone()
  }

  /// Start the watcher once; subsequent calls are no-ops.
  fn ensure_watcher(&self) -> Result<(), EngineError> {
    let mut guard = self.inner.watch_cancel.lock().unwrap();
    if guard.is_some() {
      return Ok(());
    }

    let cancel = CancellationToken::new();
    let (batch_tx, mut batch_rx) = mpsc::channel::<Vec<FileChange>>(64);
    WatcherTask::spawn(
      self.inner.config.codebase_root.clone(),
      Duration::from_millis(self.inner.config.debounce_ms),
      self.inner.scanner.matcher(),
      batch_tx,
      cancel.clone(),
    )?;
    *guard = Some(cancel.clone());
    drop(guard);

    let inner = Arc::clone(&self.inner);
    tokio::spawn(async move {
      loop {
        tokio::select! {
          biased;
          _ = cancel.cancelled() => break,
          batch = batch_rx.recv() => {
            let Some(batch) = batch else { break };
            if batch.is_empty() {
              continue;
            }
            debug!(changes = batch.len(), "Watch batch received");
            // If another pipeline is mid-flight we join it, then resubmit:
            // a joined run never saw this batch.
            loop {
              let (led, result) =
                run_or_join(&inner, PipelineInput::Changes(batch.clone()), None, cancel.child_token()).await;
              match result {
                Err(e) => {
                  warn!(error = %e, "Watch-triggered indexing failed");
                  break;
                }
                Ok(_) if led => break,
                Ok(_) => continue,
              }
            }
          }
        }
      }
      debug!("Watch drain task stopped");
    });

    Ok(())
  }

  // ==========================================================================
  // Search
  // ==========================================================================

  /// Free-text search over the index.
  ///
  /// Never fails on data issues: provider or index problems degrade (to
  /// lexical, or to empty) and log instead of surfacing errors.
  pub async fn search(&self, query: &str, options: SearchOptions) -> Vec<SearchResult> {
    let SearchOptions {
      limit,
      mode,
      vector_weight,
      min_score,
      include_content,
      language,
    } = options;
    if limit == 0 {
      return Vec::new();
    }

    let normalized = normalize_query(query);
    let terms: Vec<String> = tokenize(&normalized, None).collect();

    let key = CacheKey::new(
      query,
      mode,
      limit,
      vector_weight,
      min_score,
      language.map(|l| l.as_str()),
      include_content,
    );
    if let Some(hit) = self.inner.cache.get(&key) {
      return (*hit).clone();
    }

    let weight = vector_weight.clamp(0.0, 1.0);
    let results = match mode {
      SearchMode::Lexical => {
        self.lexical_stream(&terms, limit, min_score, language, include_content).await
      }
      SearchMode::Semantic => {
        match self.vector_stream(&normalized, limit, Some(min_score), language, include_content).await {
          Some(results) => results,
          None => {
            self.lexical_stream(&terms, limit, min_score, language, include_content).await
          }
        }
      }
      SearchMode::Hybrid => {
        if weight <= 0.0 {
          self.lexical_stream(&terms, limit, min_score, language, include_content).await
        } else if weight >= 1.0 {
          match self.vector_stream(&normalized, limit, Some(min_score), language, include_content).await {
            Some(results) => results,
            None => self.lexical_stream(&terms, limit, min_score, language, include_content).await,
          }
        } else {
          let lexical = self
            .lexical_stream(&terms, 2 * limit, 0.0, language, include_content)
            .await;
          match self.vector_stream(&normalized, 2 * limit, None, language, include_content).await {
            Some(vector) => crate::hybrid::fuse(lexical, vector, weight, min_score, limit),
            // Provider unavailable: plain lexical, unweighted.
            None => self.lexical_stream(&terms, limit, min_score, language, include_content).await,
          }
        }
      }
    };

    self.inner.cache.put(key, results.clone());
    results
  }

  /// Lexical result stream with envelope decoration.
  async fn lexical_stream(
    &self,
    terms: &[String],
    limit: usize,
    min_score: f32,
    language: Option<Language>,
    include_content: bool,
  ) -> Vec<SearchResult> {
    let state = self.inner.state.read().await;
    let meta = &state.meta;
    let filter: Option<Box<dyn Fn(&str) -> bool + '_>> = language.map(|lang| {
      Box::new(move |id: &str| meta.get(id).and_then(|m| m.language) == Some(lang))
        as Box<dyn Fn(&str) -> bool + '_>
    });
    let scored = state.tfidf.search(terms, limit, min_score, filter.as_deref());
    decorate_lexical(scored, meta, include_content)
  }

  /// Vector result stream; `None` means the caller should degrade to
  /// lexical (no provider, no store, or the query embedding failed).
  async fn vector_stream(
    &self,
    query: &str,
    k: usize,
    min_score: Option<f32>,
    language: Option<Language>,
    include_content: bool,
  ) -> Option<Vec<SearchResult>> {
    let provider = self.inner.provider.as_ref()?;
    let query_vec = match provider.embed(query).await {
      Ok(vector) => vector,
      Err(e) => {
        warn!(error = %e, "Query embedding failed, degrading to lexical");
        return None;
      }
    };

    let state = self.inner.state.read().await;
    let vectors = state.vectors.as_ref()?;
    let lang_tag = language.map(|l| l.as_str());
    let filter: Option<Box<dyn Fn(&VectorMetadata) -> bool>> = lang_tag.map(|tag| {
      Box::new(move |m: &VectorMetadata| m.language.as_deref() == Some(tag))
        as Box<dyn Fn(&VectorMetadata) -> bool>
    });

    let hits = match vectors.search(&query_vec, k, min_score, filter.as_deref()) {
      Ok(hits) => hits,
      Err(e) => {
        warn!(error = %e, "Vector search failed, degrading to lexical");
        return None;
      }
    };

    Some(
      hits
        .into_iter()
        .map(|hit| {
          let m = state.meta.get(&hit.doc_id);
          SearchResult {
            score: hit.similarity,
            provenance: Provenance::Vector,
            matched_terms: Vec::new(),
            similarity: Some(hit.similarity),
            content_preview: if include_content {
              m.map(|m| m.preview.clone())
            } else {
              None
            },
            language: m.and_then(|m| m.language).map(|l| l.as_str().to_string()),
            path: hit.doc_id,
          }
        })
        .collect(),
    )
  }

  // ==========================================================================
  // Introspection and Shutdown
  // ==========================================================================

  pub fn cache_stats(&self) -> CacheStats {
    self.inner.cache.stats()
  }

  /// Number of documents in the lexical index.
  pub async fn document_count(&self) -> usize {
    self.inner.state.read().await.tfidf.document_count()
  }

  /// Number of distinct terms in the lexical index.
  pub async fn term_count(&self) -> usize {
    self.inner.state.read().await.tfidf.term_count()
  }

  /// Number of live vectors, if the vector index is enabled.
  pub async fn vector_count(&self) -> Option<usize> {
    self.inner.state.read().await.vectors.as_ref().map(|v| v.live_count())
  }

  /// Stop the watcher, wait out any in-flight pipeline, and flush
  /// persistent artifacts. Idempotent.
  pub async fn close(&self) -> Result<(), EngineError> {
    if let Some(cancel) = self.inner.watch_cancel.lock().unwrap().take() {
      cancel.cancel();
    }

    let in_flight = self.inner.in_flight.lock().unwrap().clone();
    if let Some(mut rx) = in_flight {
      loop {
        if rx.borrow_and_update().clone().is_some() {
          break;
        }
        if rx.changed().await.is_err() {
          break;
        }
      }
    }

    let state = self.inner.state.read().await;
    if let Some(vectors) = state.vectors.as_ref() {
      vectors.save(&self.inner.config.snapshot_path())?;
    }
    drop(state);

    self.inner.update_status(|s| {
      s.is_indexing = false;
      s.stage = IndexStage::Idle;
    });
    info!("Search engine closed");
    Ok(())
  }
}

fn decorate_lexical(
  scored: Vec<ScoredDoc>,
  meta: &HashMap<String, FileMeta>,
  include_content: bool,
) -> Vec<SearchResult> {
  scored
    .into_iter()
    .map(|doc| {
      let m = meta.get(&doc.id);
      SearchResult {
        score: doc.score,
        provenance: Provenance::Lexical,
        matched_terms: doc.matched_terms,
        similarity: None,
        content_preview: if include_content {
          m.map(|m| m.preview.clone())
        } else {
          None
        },
        language: m.and_then(|m| m.language).map(|l| l.as_str().to_string()),
        path: doc.id,
      }
    })
    .collect()
}
