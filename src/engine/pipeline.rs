//! The staged indexing pipeline.
//!
//! One run moves through four stages: `scanning` (diff the tree against
//! the record table), `tfidf` (tokenize and apply lexical deltas, or fall
//! back to a full rebuild past the change threshold), `vectors` (batch
//! embed and upsert, if a provider is configured), and completion
//! (persist, snapshot, flush the result cache).
//!
//! Persistence happens at stage boundaries: the lexical state commits in
//! one transaction at the end of the tfidf stage, the vector snapshot
//! after the vector stage. Cooperative cancellation is checked between
//! files and between stages, so a cancelled run always leaves the store
//! at the previous checkpoint.
//!
//! A provider failure does not fail the run: the vector stage is skipped,
//! the error lands in `status().error`, and the lexical index completes
//! (searches then degrade to lexical).

use std::{
  collections::HashMap,
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  time::Instant,
};

use chrono::Utc;
use rayon::prelude::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::EngineInner;
use crate::{
  domain::{ChangeKind, FileChange, FileRecord, IndexProgress, IndexStage, content_preview},
  error::EngineError,
  scanner::{ScanDiff, ScannedFile, Scanner},
  store::{DocumentWrite, FileMeta},
  tfidf::{DocDelta, TfIdfIndex},
  tokenizer::term_frequencies,
  vector::VectorMetadata,
};

/// Embedding input is capped to keep one document within a provider's
/// context window.
const EMBED_MAX_CHARS: usize = 8192;

/// What a pipeline run should process.
pub(crate) enum PipelineInput {
  /// Walk the whole root and diff against the record table.
  FullScan,
  /// A debounced batch from the watcher.
  Changes(Vec<FileChange>),
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct IndexSummary {
  /// Documents in the index after the run.
  pub total_files: usize,
  pub added: usize,
  pub updated: usize,
  pub removed: usize,
  pub unchanged: usize,
  /// Whether the lexical index went through a full rebuild.
  pub rebuilt: bool,
  pub cancelled: bool,
  /// Non-fatal degradation (provider failure), mirrored in status.
  pub error: Option<String>,
  pub elapsed_ms: u64,
}

/// A tokenized upsert, carried from the tfidf stage into the vector stage.
struct TokenizedDoc {
  record: FileRecord,
  preview: String,
  content: String,
  tf: HashMap<String, u32>,
}

fn tokenize_file(file: ScannedFile) -> TokenizedDoc {
  let tf = term_frequencies(&file.content, file.language);
  TokenizedDoc {
    record: FileRecord {
      path: file.path,
      abs_path: file.abs_path,
      size: file.size,
      hash: file.hash,
      language: file.language,
      indexed_at: Utc::now(),
    },
    preview: content_preview(&file.content),
    content: file.content,
    tf,
  }
}

// ============================================================================
// Entry Point
// ============================================================================

pub(crate) async fn run(
  inner: &Arc<EngineInner>,
  input: PipelineInput,
  progress: Option<mpsc::Sender<IndexProgress>>,
  cancel: CancellationToken,
) -> Result<IndexSummary, EngineError> {
  let started = Instant::now();
  inner.pipeline_runs.fetch_add(1, Ordering::Relaxed);
  let mut summary = IndexSummary::default();

  // ==========================================================================
  // Stage: scanning
  // ==========================================================================

  inner.update_status(|s| {
    s.is_indexing = true;
    s.stage = IndexStage::Scanning;
    s.progress = 0;
    s.indexed_files = 0;
    s.current_file = None;
    s.error = None;
  });
  send_progress(&progress, IndexProgress::new(IndexStage::Scanning, 0, 0));

  let known = { inner.store.lock().await.file_hashes()? };
  let diff = compute_diff(inner, input, known, &cancel).await?;

  if cancel.is_cancelled() {
    return Ok(finish_cancelled(inner, summary));
  }

  summary.added = diff.added.len();
  summary.updated = diff.changed.len();
  summary.removed = diff.removed.len();
  summary.unchanged = diff.unchanged;

  if diff.is_empty() {
    summary.total_files = inner.state.read().await.tfidf.document_count();
    finish_complete(inner, &progress, &mut summary, false);
    summary.elapsed_ms = started.elapsed().as_millis() as u64;
    return Ok(summary);
  }

  info!(
    added = summary.added,
    updated = summary.updated,
    removed = summary.removed,
    unchanged = summary.unchanged,
    "Scan diff computed"
  );

  // ==========================================================================
  // Stage: tfidf
  // ==========================================================================

  let change_count = diff.change_count();
  inner.update_status(|s| {
    s.stage = IndexStage::Tfidf;
    s.progress = 0;
    s.total_files = change_count;
    s.indexed_files = 0;
  });
  send_progress(&progress, IndexProgress::new(IndexStage::Tfidf, 0, change_count));

  let rebuild = inner
    .state
    .read()
    .await
    .tfidf
    .needs_rebuild(change_count, inner.config.rebuild_threshold);
  summary.rebuilt = rebuild;

  let ScanDiff {
    added, changed, removed, ..
  } = diff;
  let mut upsert_files = added;
  upsert_files.extend(changed);

  let upserts = if rebuild {
    apply_rebuild(inner, &upsert_files, &progress, &cancel).await?
  } else {
    apply_incremental(inner, upsert_files, &removed, &progress, &cancel).await?
  };

  let Some(upserts) = upserts else {
    // Cancelled before the stage committed; store is at the prior checkpoint.
    return Ok(finish_cancelled(inner, summary));
  };

  // ==========================================================================
  // Stage: vectors
  // ==========================================================================

  if inner.provider.is_some() {
    let outcome = apply_vector_stage(inner, &upserts, &removed, &progress, &cancel).await?;
    match outcome {
      VectorOutcome::Done => {}
      VectorOutcome::Cancelled => return Ok(finish_cancelled(inner, summary)),
      VectorOutcome::Degraded(message) => summary.error = Some(message),
    }
  }

  // ==========================================================================
  // Completion
  // ==========================================================================

  summary.total_files = inner.state.read().await.tfidf.document_count();
  finish_complete(inner, &progress, &mut summary, true);
  summary.elapsed_ms = started.elapsed().as_millis() as u64;
  info!(
    total = summary.total_files,
    rebuilt = summary.rebuilt,
    elapsed_ms = summary.elapsed_ms,
    "Indexing complete"
  );
  Ok(summary)
}

// ============================================================================
// Stage: scanning
// ============================================================================

async fn compute_diff(
  inner: &Arc<EngineInner>,
  input: PipelineInput,
  known: HashMap<String, String>,
  cancel: &CancellationToken,
) -> Result<ScanDiff, EngineError> {
  let scanner = inner.scanner.clone();
  let cancel = cancel.clone();
  tokio::task::spawn_blocking(move || match input {
    PipelineInput::FullScan => scanner.diff(&known),
    PipelineInput::Changes(changes) => diff_from_changes(&scanner, &known, changes, &cancel),
  })
  .await
  .map_err(|e| EngineError::Indexing(format!("scan task failed: {e}")))
}

/// Resolve a watcher batch into the same three streams a full scan yields,
/// re-checking reality per path (the event may be stale by flush time).
fn diff_from_changes(
  scanner: &Scanner,
  known: &HashMap<String, String>,
  changes: Vec<FileChange>,
  cancel: &CancellationToken,
) -> ScanDiff {
  let mut diff = ScanDiff::default();
  for change in changes {
    if cancel.is_cancelled() {
      break;
    }
    match change.kind {
      ChangeKind::Deleted => {
        if known.contains_key(&change.path) {
          diff.removed.push(change.path);
        }
      }
      ChangeKind::Added | ChangeKind::Updated => match scanner.scan_one(&change.path) {
        Ok(Some(file)) => match known.get(&file.path) {
          None => diff.added.push(file),
          Some(hash) if *hash != file.hash => diff.changed.push(file),
          Some(_) => diff.unchanged += 1,
        },
        // The path stopped being eligible (vanished, ignored, oversized).
        Ok(None) => {
          if known.contains_key(&change.path) {
            diff.removed.push(change.path);
          }
        }
        Err(e) => warn!(path = %change.path, error = %e, "Skipping unreadable changed file"),
      },
    }
  }
  diff.removed.sort();
  diff
}

// ============================================================================
// Stage: tfidf
// ============================================================================

/// Tokenize files on the rayon pool, reporting per-file progress.
async fn tokenize_batch(
  files: Vec<ScannedFile>,
  stage_total: usize,
  progress: Option<mpsc::Sender<IndexProgress>>,
  cancel: CancellationToken,
) -> Result<Vec<TokenizedDoc>, EngineError> {
  let counter = Arc::new(AtomicUsize::new(0));
  tokio::task::spawn_blocking(move || {
    files
      .into_par_iter()
      .filter_map(|file| {
        if cancel.is_cancelled() {
          return None;
        }
        let name = file.path.clone();
        let doc = tokenize_file(file);
        let done = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(tx) = &progress {
          let _ = tx.try_send(IndexProgress::new(IndexStage::Tfidf, done, stage_total).with_file(name));
        }
        Some(doc)
      })
      .collect()
  })
  .await
  .map_err(|e| EngineError::Indexing(format!("tokenize task failed: {e}")))
}

/// Owned row handed to the store after the in-memory index has applied a
/// document, so disk always mirrors memory exactly.
struct PersistRow {
  record: FileRecord,
  preview: String,
  tf: Vec<(String, u32)>,
  length: u32,
  norm: f64,
}

fn persist_rows(index: &TfIdfIndex, docs: &[TokenizedDoc]) -> Vec<PersistRow> {
  docs
    .iter()
    .filter_map(|doc| {
      let entry = index.doc_entry(&doc.record.path)?;
      Some(PersistRow {
        record: doc.record.clone(),
        preview: doc.preview.clone(),
        tf: entry.sorted_tf(),
        length: entry.length,
        norm: entry.norm,
      })
    })
    .collect()
}

async fn persist_lexical(
  inner: &Arc<EngineInner>,
  rows: &[PersistRow],
  removed: &[String],
  clear_first: bool,
) -> Result<(), EngineError> {
  let mut store = inner.store.lock().await;
  if clear_first {
    store.clear_documents()?;
  }
  for path in removed {
    store.remove_document(path)?;
  }
  let writes: Vec<DocumentWrite<'_>> = rows
    .iter()
    .map(|row| DocumentWrite {
      record: &row.record,
      preview: &row.preview,
      tf: &row.tf,
      length: row.length,
      norm: row.norm,
    })
    .collect();
  store.bulk_insert(&writes)?;

  let state = inner.state.read().await;
  store.replace_terms(state.tfidf.term_rows())?;
  store.meta_set("document_count", &state.tfidf.document_count().to_string())?;
  Ok(())
}

/// Full rebuild: rescan everything, build a fresh index, swap it in.
///
/// Returns the tokenized upserts for the vector stage (only the files
/// that actually changed — unchanged documents keep their vectors), or
/// `None` on cancellation.
async fn apply_rebuild(
  inner: &Arc<EngineInner>,
  upsert_files: &[ScannedFile],
  progress: &Option<mpsc::Sender<IndexProgress>>,
  cancel: &CancellationToken,
) -> Result<Option<Vec<TokenizedDoc>>, EngineError> {
  debug!("Change fraction over threshold, rebuilding lexical index");

  let scanner = inner.scanner.clone();
  let all_files = tokio::task::spawn_blocking(move || scanner.scan())
    .await
    .map_err(|e| EngineError::Indexing(format!("rescan task failed: {e}")))?;

  if cancel.is_cancelled() {
    return Ok(None);
  }

  let total = all_files.len();
  let all_docs = tokenize_batch(all_files, total, progress.clone(), cancel.clone()).await?;
  if cancel.is_cancelled() {
    return Ok(None);
  }

  let changed: std::collections::HashSet<&str> = upsert_files.iter().map(|f| f.path.as_str()).collect();

  let mut fresh = TfIdfIndex::new();
  let mut meta = HashMap::new();
  for doc in &all_docs {
    if fresh.add_document(doc.record.path.clone(), doc.tf.clone()).is_err() {
      warn!(path = %doc.record.path, "Duplicate path in rebuild scan, skipping");
      continue;
    }
    meta.insert(
      doc.record.path.clone(),
      FileMeta {
        language: doc.record.language,
        preview: doc.preview.clone(),
      },
    );
  }

  let rows = persist_rows(&fresh, &all_docs);
  {
    let mut state = inner.state.write().await;
    state.tfidf = fresh;
    state.meta = meta;
  }
  persist_lexical(inner, &rows, &[], true).await?;

  // Only changed documents continue to the vector stage.
  Ok(Some(
    all_docs.into_iter().filter(|d| changed.contains(d.record.path.as_str())).collect(),
  ))
}

/// Incremental path: apply per-document deltas to the live index.
async fn apply_incremental(
  inner: &Arc<EngineInner>,
  upsert_files: Vec<ScannedFile>,
  removed: &[String],
  progress: &Option<mpsc::Sender<IndexProgress>>,
  cancel: &CancellationToken,
) -> Result<Option<Vec<TokenizedDoc>>, EngineError> {
  let stage_total = upsert_files.len() + removed.len();
  let docs = tokenize_batch(upsert_files, stage_total, progress.clone(), cancel.clone()).await?;
  if cancel.is_cancelled() {
    return Ok(None);
  }

  let mut deltas: Vec<DocDelta> = removed.iter().map(|path| DocDelta::Remove { id: path.clone() }).collect();
  deltas.extend(docs.iter().map(|doc| DocDelta::Upsert {
    id: doc.record.path.clone(),
    tf: doc.tf.clone(),
  }));

  let rows = {
    let mut state = inner.state.write().await;
    state.tfidf.apply_changes(deltas);
    for path in removed {
      state.meta.remove(path);
    }
    for doc in &docs {
      state.meta.insert(
        doc.record.path.clone(),
        FileMeta {
          language: doc.record.language,
          preview: doc.preview.clone(),
        },
      );
    }
    persist_rows(&state.tfidf, &docs)
  };

  persist_lexical(inner, &rows, removed, false).await?;
  Ok(Some(docs))
}

// ============================================================================
// Stage: vectors
// ============================================================================

enum VectorOutcome {
  Done,
  Cancelled,
  /// Provider failed; lexical index still completed.
  Degraded(String),
}

async fn apply_vector_stage(
  inner: &Arc<EngineInner>,
  upserts: &[TokenizedDoc],
  removed: &[String],
  progress: &Option<mpsc::Sender<IndexProgress>>,
  cancel: &CancellationToken,
) -> Result<VectorOutcome, EngineError> {
  let Some(provider) = inner.provider.as_ref() else {
    return Ok(VectorOutcome::Done);
  };

  let total = upserts.len();
  inner.update_status(|s| {
    s.stage = IndexStage::Vectors;
    s.progress = 0;
    s.total_files = total;
    s.indexed_files = 0;
  });
  send_progress(progress, IndexProgress::new(IndexStage::Vectors, 0, total));

  // Batch-embed the changed documents.
  let texts: Vec<String> = upserts.iter().map(|d| embedding_text(&d.content)).collect();
  let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(total);
  let mut degraded: Option<String> = None;

  let batch_size = inner.config.embedding.max_batch_size.max(1);
  for chunk in texts.chunks(batch_size) {
    if cancel.is_cancelled() {
      return Ok(VectorOutcome::Cancelled);
    }
    let refs: Vec<&str> = chunk.iter().map(|s| s.as_str()).collect();
    match provider.embed_batch(&refs).await {
      Ok(batch) => {
        vectors.extend(batch);
        send_progress(
          progress,
          IndexProgress::new(IndexStage::Vectors, vectors.len(), total),
        );
        inner.update_status(|s| {
          s.indexed_files = vectors.len();
          s.progress = IndexProgress::new(IndexStage::Vectors, vectors.len(), total).percent();
        });
      }
      Err(e) => {
        warn!(error = %e, "Embedding batch failed, skipping vector stage");
        degraded = Some(format!("ProviderError: {e}"));
        break;
      }
    }
  }

  // Deletes apply even when the provider is down, so removed documents
  // vanish from semantic results regardless.
  let deleted_slots: Vec<usize> = {
    let mut state = inner.state.write().await;
    let dims = inner.config.embedding.dimensions;
    let params = inner.config.hnsw.clone();
    let store = state
      .vectors
      .get_or_insert_with(|| crate::vector::VectorStore::new(dims, params));

    for path in removed {
      store.delete(path);
    }
    for (doc, vector) in upserts.iter().zip(vectors.into_iter()) {
      let metadata = VectorMetadata {
        language: doc.record.language.map(|l| l.as_str().to_string()),
        preview: doc.preview.clone(),
      };
      let result = if store.contains(&doc.record.path) {
        store.update(&doc.record.path, vector, metadata)
      } else {
        store.add(&doc.record.path, vector, metadata)
      };
      if let Err(e) = result {
        warn!(path = %doc.record.path, error = %e, "Vector upsert failed, skipping vector stage");
        degraded.get_or_insert_with(|| e.to_string());
        break;
      }
    }

    if store.needs_compaction() {
      store.compact();
    }
    store.deleted_slots().collect()
  };

  // Snapshot under the read lock; single-flight keeps other writers out.
  {
    let state = inner.state.read().await;
    if let Some(store) = state.vectors.as_ref() {
      store.save(&inner.config.snapshot_path())?;
    }
  }
  {
    let mut store = inner.store.lock().await;
    store.replace_deleted_slots(deleted_slots.into_iter())?;
    store.meta_set("dimensions", &inner.config.embedding.dimensions.to_string())?;
  }

  Ok(match degraded {
    Some(message) => VectorOutcome::Degraded(message),
    None => VectorOutcome::Done,
  })
}

/// Cap content fed to the embedding provider.
fn embedding_text(content: &str) -> String {
  if content.len() <= EMBED_MAX_CHARS {
    content.to_string()
  } else {
    content.chars().take(EMBED_MAX_CHARS).collect()
  }
}

// ============================================================================
// Completion
// ============================================================================

fn finish_complete(
  inner: &Arc<EngineInner>,
  progress: &Option<mpsc::Sender<IndexProgress>>,
  summary: &mut IndexSummary,
  mutated: bool,
) {
  if mutated {
    // Coarse invalidation: any write flushes every cached result.
    inner.cache.clear();
  }

  let total = summary.total_files;
  let error = summary.error.clone();
  inner.update_status(|s| {
    s.is_indexing = false;
    s.stage = IndexStage::Complete;
    s.progress = 100;
    s.total_files = total;
    s.indexed_files = total;
    s.current_file = None;
    s.error = error;
  });
  send_progress(progress, IndexProgress::new(IndexStage::Complete, total, total));
}

fn finish_cancelled(inner: &Arc<EngineInner>, mut summary: IndexSummary) -> IndexSummary {
  debug!("Indexing cancelled");
  summary.cancelled = true;
  inner.update_status(|s| {
    s.is_indexing = false;
    s.stage = IndexStage::Idle;
    s.progress = 0;
    s.current_file = None;
  });
  summary
}

fn send_progress(progress: &Option<mpsc::Sender<IndexProgress>>, update: IndexProgress) {
  if let Some(tx) = progress {
    let _ = tx.try_send(update);
  }
}
