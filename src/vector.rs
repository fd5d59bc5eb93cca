//! HNSW vector store with logical deletes.
//!
//! Wraps an `hnsw_rs` graph over cosine distance. The graph has no
//! physical deletion, so removal is a logical-delete overlay: deleted
//! slots stay in the graph but are filtered out of every search, and a
//! compaction rebuild drops them for real once they exceed 30% of
//! capacity (or when capacity runs out, which also doubles it).
//!
//! # Persistence
//!
//! `save` writes two artifacts, both replaced atomically via
//! write-to-temp + rename:
//! - the snapshot binary (`vectors.hnsw`): a bincode table of every slot
//!   still present in the graph, including logically deleted ones, so the
//!   reloaded graph is equivalent to the saved one;
//! - a JSON sidecar (`vectors.hnsw.metadata.json`) carrying the document
//!   map, both id↔slot maps, the delete set, the next-slot counter, and
//!   the dimensions, which `load` validates against the configured
//!   provider.

use std::{
  collections::{HashMap, HashSet},
  path::Path,
};

use hnsw_rs::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::HnswParams;

/// Layer count handed to the graph; hnsw_rs caps layers internally.
const NB_LAYER: usize = 16;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum VectorError {
  #[error("vector length {got} does not match dimensions {expected}")]
  DimensionMismatch { expected: usize, got: usize },

  #[error("document already has a vector: {0}")]
  DuplicateId(String),

  #[error("vector snapshot failed validation: {0}")]
  Corrupt(String),

  #[error("snapshot I/O error: {0}")]
  Io(#[from] std::io::Error),
}

// ============================================================================
// Records
// ============================================================================

/// Metadata snippet kept with each vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorMetadata {
  pub language: Option<String>,
  /// Content preview, capped at 500 chars by the caller.
  pub preview: String,
}

/// A live vector entry: which document a slot belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
  pub id: String,
  pub metadata: VectorMetadata,
}

/// One nearest-neighbour hit.
#[derive(Debug, Clone)]
pub struct VectorHit {
  pub doc_id: String,
  /// Cosine similarity, `1 − distance`.
  pub similarity: f32,
}

// ============================================================================
// Snapshot Shapes
// ============================================================================

/// Binary snapshot: the raw vector table backing the graph.
#[derive(Serialize, Deserialize)]
struct SnapshotVectors {
  dimensions: usize,
  /// Every slot in the graph, live or logically deleted.
  vectors: Vec<(usize, Vec<f32>)>,
}

/// JSON sidecar with the document and slot maps.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sidecar {
  documents: Vec<(usize, VectorRecord)>,
  id_to_index: Vec<(String, usize)>,
  index_to_id: Vec<(usize, String)>,
  deleted: Vec<usize>,
  next_id: usize,
  dimensions: usize,
}

pub(crate) fn sidecar_path(path: &Path) -> std::path::PathBuf {
  let mut name = path.as_os_str().to_os_string();
  name.push(".metadata.json");
  std::path::PathBuf::from(name)
}

// ============================================================================
// VectorStore
// ============================================================================

/// In-memory approximate k-NN index over document embeddings.
pub struct VectorStore {
  hnsw: Hnsw<'static, f32, DistCosine>,
  /// slot → raw vector, for every slot in the graph (incl. deleted).
  vectors: HashMap<usize, Vec<f32>>,
  /// slot → live record. Logically deleted slots have no entry.
  documents: HashMap<usize, VectorRecord>,
  id_to_slot: HashMap<String, usize>,
  slot_to_id: HashMap<usize, String>,
  deleted: HashSet<usize>,
  next_slot: usize,
  dimensions: usize,
  params: HnswParams,
  capacity: usize,
}

impl VectorStore {
  pub fn new(dimensions: usize, params: HnswParams) -> Self {
    let capacity = params.max_elements;
    Self {
      hnsw: build_graph(&params, capacity),
      vectors: HashMap::new(),
      documents: HashMap::new(),
      id_to_slot: HashMap::new(),
      slot_to_id: HashMap::new(),
      deleted: HashSet::new(),
      next_slot: 0,
      dimensions,
      params,
      capacity,
    }
  }

  pub fn dimensions(&self) -> usize {
    self.dimensions
  }

  /// Number of documents currently retrievable.
  pub fn live_count(&self) -> usize {
    self.id_to_slot.len()
  }

  pub fn deleted_count(&self) -> usize {
    self.deleted.len()
  }

  pub fn contains(&self, doc_id: &str) -> bool {
    self.id_to_slot.contains_key(doc_id)
  }

  /// The persisted delete set, for the store's bitmap mirror.
  pub fn deleted_slots(&self) -> impl Iterator<Item = usize> + '_ {
    self.deleted.iter().copied()
  }

  fn check_dimensions(&self, vector: &[f32]) -> Result<(), VectorError> {
    if vector.len() != self.dimensions {
      return Err(VectorError::DimensionMismatch {
        expected: self.dimensions,
        got: vector.len(),
      });
    }
    Ok(())
  }

  // ==========================================================================
  // Mutations
  // ==========================================================================

  /// Insert a vector for a new document id.
  pub fn add(&mut self, doc_id: &str, vector: Vec<f32>, metadata: VectorMetadata) -> Result<(), VectorError> {
    self.check_dimensions(&vector)?;
    if self.id_to_slot.contains_key(doc_id) {
      return Err(VectorError::DuplicateId(doc_id.to_string()));
    }
    if self.next_slot >= self.capacity {
      // Capacity exhausted: compact (drops deleted slots) and grow.
      self.compact();
    }

    let slot = self.next_slot;
    self.next_slot += 1;
    self.hnsw.insert_slice((&vector, slot));
    self.vectors.insert(slot, vector);
    self.documents.insert(
      slot,
      VectorRecord {
        id: doc_id.to_string(),
        metadata,
      },
    );
    self.id_to_slot.insert(doc_id.to_string(), slot);
    self.slot_to_id.insert(slot, doc_id.to_string());
    Ok(())
  }

  /// Replace a document's vector: the prior slot is logically deleted and
  /// a fresh slot inserted. The old vector stays in the graph but never
  /// reaches results.
  pub fn update(&mut self, doc_id: &str, vector: Vec<f32>, metadata: VectorMetadata) -> Result<(), VectorError> {
    self.check_dimensions(&vector)?;
    self.delete(doc_id);
    self.add(doc_id, vector, metadata)
  }

  /// Logical delete. Returns whether the id had a live slot.
  pub fn delete(&mut self, doc_id: &str) -> bool {
    let Some(slot) = self.id_to_slot.remove(doc_id) else {
      return false;
    };
    self.slot_to_id.remove(&slot);
    self.documents.remove(&slot);
    self.deleted.insert(slot);
    true
  }

  // ==========================================================================
  // Search
  // ==========================================================================

  /// k-NN search over live slots.
  ///
  /// Requests `2k` neighbours from the graph, drops logically deleted
  /// slots and hits below `min_score`, applies the metadata filter, and
  /// returns up to `k` in similarity order.
  pub fn search(
    &self,
    query: &[f32],
    k: usize,
    min_score: Option<f32>,
    filter: Option<&dyn Fn(&VectorMetadata) -> bool>,
  ) -> Result<Vec<VectorHit>, VectorError> {
    self.check_dimensions(query)?;
    if k == 0 || self.live_count() == 0 {
      return Ok(Vec::new());
    }

    let fetch = 2 * k;
    let ef = self.params.ef_search.max(fetch);
    let neighbours = self.hnsw.search(query, fetch, ef);

    let mut hits = Vec::with_capacity(k);
    for neighbour in neighbours {
      let slot = neighbour.d_id;
      if self.deleted.contains(&slot) {
        continue;
      }
      let Some(record) = self.documents.get(&slot) else {
        continue;
      };
      let similarity = 1.0 - neighbour.distance;
      if min_score.is_some_and(|min| similarity < min) {
        continue;
      }
      if filter.is_some_and(|f| !f(&record.metadata)) {
        continue;
      }
      hits.push(VectorHit {
        doc_id: record.id.clone(),
        similarity,
      });
      if hits.len() == k {
        break;
      }
    }
    Ok(hits)
  }

  // ==========================================================================
  // Compaction
  // ==========================================================================

  /// True when the logical-delete overlay has grown past 30% of capacity
  /// or the slot counter has reached it.
  pub fn needs_compaction(&self) -> bool {
    self.deleted.len() * 10 > self.capacity * 3 || self.next_slot >= self.capacity
  }

  /// Rebuild a fresh graph over only the live vectors.
  ///
  /// Slots are renumbered compactly; capacity doubles if the live set has
  /// outgrown the configured maximum.
  pub fn compact(&mut self) {
    let live: Vec<(usize, VectorRecord, Vec<f32>)> = {
      let mut live: Vec<_> = self
        .documents
        .drain()
        .filter_map(|(slot, record)| self.vectors.remove(&slot).map(|v| (slot, record, v)))
        .collect();
      live.sort_by_key(|(slot, _, _)| *slot);
      live
    };

    let new_capacity = if live.len() * 2 > self.capacity {
      self.capacity * 2
    } else {
      self.capacity
    };

    info!(
      live = live.len(),
      dropped = self.deleted.len(),
      capacity = new_capacity,
      "Compacting vector store"
    );

    self.hnsw = build_graph(&self.params, new_capacity);
    self.capacity = new_capacity;
    self.vectors.clear();
    self.id_to_slot.clear();
    self.slot_to_id.clear();
    self.deleted.clear();
    self.next_slot = 0;

    for (_, record, vector) in live {
      let slot = self.next_slot;
      self.next_slot += 1;
      self.hnsw.insert_slice((&vector, slot));
      self.id_to_slot.insert(record.id.clone(), slot);
      self.slot_to_id.insert(slot, record.id.clone());
      self.vectors.insert(slot, vector);
      self.documents.insert(slot, record);
    }
  }

  // ==========================================================================
  // Persistence
  // ==========================================================================

  /// Write the snapshot binary and JSON sidecar, replacing both atomically.
  pub fn save(&self, path: &Path) -> Result<(), VectorError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let mut vectors: Vec<(usize, Vec<f32>)> = self.vectors.iter().map(|(s, v)| (*s, v.clone())).collect();
    vectors.sort_by_key(|(slot, _)| *slot);
    let snapshot = SnapshotVectors {
      dimensions: self.dimensions,
      vectors,
    };
    let binary = bincode::serialize(&snapshot).map_err(|e| VectorError::Corrupt(e.to_string()))?;

    let mut documents: Vec<(usize, VectorRecord)> =
      self.documents.iter().map(|(s, r)| (*s, r.clone())).collect();
    documents.sort_by_key(|(slot, _)| *slot);
    let mut id_to_index: Vec<(String, usize)> =
      self.id_to_slot.iter().map(|(id, s)| (id.clone(), *s)).collect();
    id_to_index.sort();
    let mut index_to_id: Vec<(usize, String)> =
      self.slot_to_id.iter().map(|(s, id)| (*s, id.clone())).collect();
    index_to_id.sort();
    let mut deleted: Vec<usize> = self.deleted.iter().copied().collect();
    deleted.sort_unstable();

    let sidecar = Sidecar {
      documents,
      id_to_index,
      index_to_id,
      deleted,
      next_id: self.next_slot,
      dimensions: self.dimensions,
    };
    let json = serde_json::to_vec_pretty(&sidecar).map_err(|e| VectorError::Corrupt(e.to_string()))?;

    write_atomic(path, &binary)?;
    write_atomic(&sidecar_path(path), &json)?;

    debug!(
      path = %path.display(),
      slots = self.vectors.len(),
      live = self.live_count(),
      "Vector snapshot saved"
    );
    Ok(())
  }

  /// Load a snapshot, validating dimensions against the configured
  /// provider and rebuilding the graph from the saved vector table.
  pub fn load(path: &Path, expected_dimensions: usize, params: HnswParams) -> Result<Self, VectorError> {
    let json = std::fs::read(sidecar_path(path))?;
    let sidecar: Sidecar =
      serde_json::from_slice(&json).map_err(|e| VectorError::Corrupt(format!("sidecar: {e}")))?;
    if sidecar.dimensions != expected_dimensions {
      return Err(VectorError::DimensionMismatch {
        expected: expected_dimensions,
        got: sidecar.dimensions,
      });
    }

    let binary = std::fs::read(path)?;
    let snapshot: SnapshotVectors =
      bincode::deserialize(&binary).map_err(|e| VectorError::Corrupt(format!("snapshot: {e}")))?;
    if snapshot.dimensions != expected_dimensions {
      return Err(VectorError::DimensionMismatch {
        expected: expected_dimensions,
        got: snapshot.dimensions,
      });
    }

    let capacity = params.max_elements.max(sidecar.next_id);
    let mut store = Self {
      hnsw: build_graph(&params, capacity),
      vectors: HashMap::new(),
      documents: sidecar.documents.into_iter().collect(),
      id_to_slot: sidecar.id_to_index.into_iter().collect(),
      slot_to_id: sidecar.index_to_id.into_iter().collect(),
      deleted: sidecar.deleted.into_iter().collect(),
      next_slot: sidecar.next_id,
      dimensions: expected_dimensions,
      params,
      capacity,
    };

    for (slot, vector) in snapshot.vectors {
      if vector.len() != expected_dimensions {
        warn!(slot, got = vector.len(), "Dropping malformed vector from snapshot");
        continue;
      }
      store.hnsw.insert_slice((&vector, slot));
      store.vectors.insert(slot, vector);
    }

    info!(
      path = %path.display(),
      live = store.live_count(),
      deleted = store.deleted.len(),
      "Vector snapshot loaded"
    );
    Ok(store)
  }
}

fn build_graph(params: &HnswParams, capacity: usize) -> Hnsw<'static, f32, DistCosine> {
  Hnsw::new(params.m, capacity, NB_LAYER, params.ef_construction, DistCosine {})
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), VectorError> {
  let mut tmp = path.as_os_str().to_os_string();
  tmp.push(".tmp");
  let tmp = std::path::PathBuf::from(tmp);
  std::fs::write(&tmp, bytes)?;
  std::fs::rename(&tmp, path)?;
  Ok(())
}
