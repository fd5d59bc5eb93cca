//! Incremental TF-IDF index.
//!
//! Maintains document-term postings, document lengths, and per-term IDF
//! under arbitrary add / update / delete streams. The guiding property is
//! that after any mutation sequence, search output is identical to a full
//! rebuild over the same final document set.
//!
//! # Scoring
//!
//! idf is smoothed: `ln((N + 1) / (df + 1)) + 1`, natural log. A document
//! scores `Σ over matched terms of (tf / len) · idf`, divided by the
//! document's norm factor `sqrt(Σ tf²)`. Query terms absent from the IDF
//! table contribute zero. Scores are non-negative; ties break on document
//! id ascending.
//!
//! # IDF maintenance
//!
//! The table stores `(df, idf)` per term. Because idf depends on the
//! document count, the idf column is refreshed after every public mutation
//! rather than only for touched terms — an O(vocabulary) pass that keeps
//! incremental state exactly equal to a rebuild.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

pub type DocId = String;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TfIdfError {
  #[error("document already indexed: {0}")]
  DuplicateId(String),
}

// ============================================================================
// Entries
// ============================================================================

/// The tokenized view of one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocEntry {
  /// term → count.
  pub tf: HashMap<String, u32>,
  /// Sum of counts.
  pub length: u32,
  /// `sqrt(Σ tf²)` — content-derived, independent of the rest of the corpus.
  pub norm: f64,
}

impl DocEntry {
  fn from_tf(tf: HashMap<String, u32>) -> Self {
    let length = tf.values().sum();
    let norm = norm_factor(&tf);
    Self { tf, length, norm }
  }

  /// `(term, tf)` pairs sorted by term, for deterministic persistence.
  pub fn sorted_tf(&self) -> Vec<(String, u32)> {
    let mut pairs: Vec<(String, u32)> = self.tf.iter().map(|(t, c)| (t.clone(), *c)).collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    pairs
  }
}

fn norm_factor(tf: &HashMap<String, u32>) -> f64 {
  tf.values().map(|&c| (c as f64) * (c as f64)).sum::<f64>().sqrt()
}

/// Document frequency and the derived smoothed idf for one term.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TermStats {
  pub df: u64,
  pub idf: f64,
}

/// A lexical hit before envelope decoration.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredDoc {
  pub id: DocId,
  pub score: f32,
  /// Query terms found in the document, in query order, deduplicated.
  pub matched_terms: Vec<String>,
}

/// One pending mutation for [`TfIdfIndex::apply_changes`].
#[derive(Debug, Clone)]
pub enum DocDelta {
  /// Add or replace a document with the given term frequencies.
  Upsert { id: DocId, tf: HashMap<String, u32> },
  Remove { id: DocId },
}

// ============================================================================
// TfIdfIndex
// ============================================================================

/// In-memory inverted index with incremental maintenance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TfIdfIndex {
  /// term → insertion-ordered `(doc, tf)` postings.
  postings: HashMap<String, Vec<(DocId, u32)>>,
  docs: HashMap<DocId, DocEntry>,
  terms: HashMap<String, TermStats>,
}

impl TfIdfIndex {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn document_count(&self) -> usize {
    self.docs.len()
  }

  pub fn term_count(&self) -> usize {
    self.terms.len()
  }

  pub fn contains(&self, id: &str) -> bool {
    self.docs.contains_key(id)
  }

  pub fn doc_entry(&self, id: &str) -> Option<&DocEntry> {
    self.docs.get(id)
  }

  pub fn term_stats(&self, term: &str) -> Option<TermStats> {
    self.terms.get(term).copied()
  }

  /// Iterate `(term, df, idf)` rows for persistence.
  pub fn term_rows(&self) -> impl Iterator<Item = (&str, u64, f64)> {
    self.terms.iter().map(|(term, stats)| (term.as_str(), stats.df, stats.idf))
  }

  pub fn doc_ids(&self) -> impl Iterator<Item = &DocId> {
    self.docs.keys()
  }

  // ==========================================================================
  // Mutations
  // ==========================================================================

  /// Append a new document: postings extended, df incremented, idf
  /// recomputed. Rejects ids that are already present.
  pub fn add_document(&mut self, id: DocId, tf: HashMap<String, u32>) -> Result<(), TfIdfError> {
    if self.docs.contains_key(&id) {
      return Err(TfIdfError::DuplicateId(id));
    }
    for (term, &count) in &tf {
      self.postings.entry(term.clone()).or_default().push((id.clone(), count));
      self.terms.entry(term.clone()).or_insert(TermStats { df: 0, idf: 0.0 }).df += 1;
    }
    self.docs.insert(id, DocEntry::from_tf(tf));
    self.refresh_idf();
    Ok(())
  }

  /// Remove a document: postings pruned, df decremented, terms with zero
  /// df purged. Returns whether the id was present.
  pub fn remove_document(&mut self, id: &str) -> bool {
    let Some(entry) = self.docs.remove(id) else {
      return false;
    };
    for term in entry.tf.keys() {
      self.detach_term(term, id);
    }
    self.refresh_idf();
    true
  }

  /// Replace a document's term frequencies.
  ///
  /// Computed as a set-symmetric difference over terms so idf bookkeeping
  /// only touches terms that actually entered or left the document.
  /// Upserts when the id is not yet present.
  pub fn update_document(&mut self, id: &str, new_tf: HashMap<String, u32>) {
    let Some(old) = self.docs.remove(id) else {
      // Unknown id: plain add.
      for (term, &count) in &new_tf {
        self.postings.entry(term.clone()).or_default().push((id.to_string(), count));
        self.terms.entry(term.clone()).or_insert(TermStats { df: 0, idf: 0.0 }).df += 1;
      }
      self.docs.insert(id.to_string(), DocEntry::from_tf(new_tf));
      self.refresh_idf();
      return;
    };

    // Terms the document lost.
    for term in old.tf.keys() {
      if !new_tf.contains_key(term) {
        self.detach_term(term, id);
      }
    }

    for (term, &count) in &new_tf {
      match old.tf.get(term) {
        // Gained term: append to the posting list.
        None => {
          self.postings.entry(term.clone()).or_default().push((id.to_string(), count));
          self.terms.entry(term.clone()).or_insert(TermStats { df: 0, idf: 0.0 }).df += 1;
        }
        // Kept term: update the count in place, position retained.
        Some(&old_count) if old_count != count => {
          if let Some(list) = self.postings.get_mut(term)
            && let Some(slot) = list.iter_mut().find(|(doc, _)| doc == id)
          {
            slot.1 = count;
          }
        }
        Some(_) => {}
      }
    }

    self.docs.insert(id.to_string(), DocEntry::from_tf(new_tf));
    self.refresh_idf();
  }

  fn detach_term(&mut self, term: &str, id: &str) {
    if let Some(list) = self.postings.get_mut(term) {
      list.retain(|(doc, _)| doc != id);
      if list.is_empty() {
        self.postings.remove(term);
      }
    }
    if let Some(stats) = self.terms.get_mut(term) {
      stats.df = stats.df.saturating_sub(1);
      if stats.df == 0 {
        self.terms.remove(term);
      }
    }
  }

  /// Recompute the idf column for the current document count.
  fn refresh_idf(&mut self) {
    let n = self.docs.len() as f64;
    for stats in self.terms.values_mut() {
      stats.idf = ((n + 1.0) / (stats.df as f64 + 1.0)).ln() + 1.0;
    }
  }

  // ==========================================================================
  // Incremental Batches
  // ==========================================================================

  /// Should a batch of this size go through a full rebuild instead of
  /// per-document deltas? True when the index is empty or the changed
  /// fraction exceeds the threshold.
  pub fn needs_rebuild(&self, change_count: usize, threshold: f64) -> bool {
    let n = self.docs.len();
    if n == 0 {
      return change_count > 0;
    }
    (change_count as f64) / (n as f64) > threshold
  }

  /// Apply a batch of deltas one by one.
  ///
  /// Intermediate states are never observable because the caller holds
  /// the writer lock for the whole batch.
  pub fn apply_changes(&mut self, deltas: Vec<DocDelta>) {
    let count = deltas.len();
    for delta in deltas {
      match delta {
        DocDelta::Upsert { id, tf } => self.update_document(&id, tf),
        DocDelta::Remove { id } => {
          self.remove_document(&id);
        }
      }
    }
    debug!(deltas = count, documents = self.docs.len(), "Applied incremental deltas");
  }

  // ==========================================================================
  // Search
  // ==========================================================================

  /// Score every candidate document against the query terms.
  ///
  /// Results are sorted by score descending, ties broken by id ascending,
  /// and truncated to `limit`. An empty query yields an empty result.
  pub fn search(
    &self,
    query_terms: &[String],
    limit: usize,
    min_score: f32,
    filter: Option<&dyn Fn(&str) -> bool>,
  ) -> Vec<ScoredDoc> {
    if query_terms.is_empty() || limit == 0 {
      return Vec::new();
    }

    // Deduplicate while preserving query order.
    let mut seen = HashSet::new();
    let unique: Vec<&String> = query_terms.iter().filter(|t| seen.insert(t.as_str())).collect();

    let mut scores: HashMap<&str, f64> = HashMap::new();
    let mut matched: HashMap<&str, Vec<String>> = HashMap::new();

    for term in unique {
      let Some(stats) = self.terms.get(term.as_str()) else {
        continue;
      };
      let Some(list) = self.postings.get(term.as_str()) else {
        continue;
      };
      for (doc, tf) in list {
        let Some(entry) = self.docs.get(doc.as_str()) else {
          continue;
        };
        if entry.length == 0 {
          continue;
        }
        let weight = (*tf as f64 / entry.length as f64) * stats.idf;
        *scores.entry(doc.as_str()).or_insert(0.0) += weight;
        matched.entry(doc.as_str()).or_default().push(term.clone());
      }
    }

    let mut results: Vec<ScoredDoc> = scores
      .into_iter()
      .filter(|&(id, _)| filter.is_none_or(|f| f(id)))
      .filter_map(|(id, raw)| {
        let norm = self.docs.get(id)?.norm;
        if norm <= 0.0 {
          return None;
        }
        let score = (raw / norm) as f32;
        (score >= min_score).then(|| ScoredDoc {
          id: id.to_string(),
          score,
          matched_terms: matched.remove(id).unwrap_or_default(),
        })
      })
      .collect();

    results.sort_by(|a, b| {
      b.score
        .partial_cmp(&a.score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| a.id.cmp(&b.id))
    });
    results.truncate(limit);
    results
  }

  // ==========================================================================
  // Reconstruction
  // ==========================================================================

  /// Rebuild in-memory state from stored rows.
  ///
  /// `postings` must be in original insertion order; df and idf are
  /// recomputed from the posting lists rather than trusted from disk.
  pub fn from_stored(
    docs: Vec<crate::store::StoredDocument>,
    postings: Vec<(String, String, u32)>,
  ) -> Self {
    let mut index = Self::new();
    let mut tf_by_doc: HashMap<String, HashMap<String, u32>> = HashMap::new();

    for (term, path, tf) in postings {
      tf_by_doc.entry(path.clone()).or_default().insert(term.clone(), tf);
      index.postings.entry(term).or_default().push((path, tf));
    }
    for stored in docs {
      let tf = tf_by_doc.remove(&stored.path).unwrap_or_default();
      index.docs.insert(
        stored.path,
        DocEntry {
          norm: norm_factor(&tf),
          length: tf.values().sum(),
          tf,
        },
      );
    }

    // Drop postings for documents that have no row in a partially written
    // store.
    let live: HashSet<String> = index.docs.keys().cloned().collect();
    for list in index.postings.values_mut() {
      list.retain(|(doc, _)| live.contains(doc));
    }
    index.postings.retain(|_, list| !list.is_empty());

    for (term, list) in &index.postings {
      index.terms.insert(
        term.clone(),
        TermStats {
          df: list.len() as u64,
          idf: 0.0,
        },
      );
    }
    index.refresh_idf();
    index
  }
}
