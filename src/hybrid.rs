//! Hybrid score fusion.
//!
//! Merges a lexical result stream and a vector result stream into one
//! ranked list. Each stream is normalized to `[0, 1]` by its own maximum
//! score (guarded against zero with ε), then weighted: a path present only
//! in the lexical stream contributes `(1 − w) · norm`, only in the vector
//! stream `w · norm`, and a path present in both gets the sum with its
//! provenance promoted to `hybrid`.
//!
//! The function is pure; the engine owns stream production and the
//! `w = 0` / `w = 1` degenerate paths.

use std::collections::HashMap;

use crate::domain::{Provenance, SearchResult};

/// Guard against division by zero when a stream's best score is zero.
const EPSILON: f32 = 1e-9;

/// Fuse two result streams under vector weight `w ∈ [0, 1]`.
///
/// Both streams arrive already ranked; `min_score` and `limit` apply to
/// the fused list. An empty stream leaves the other stream's provenance
/// untouched.
pub fn fuse(
  lexical: Vec<SearchResult>,
  vector: Vec<SearchResult>,
  weight: f32,
  min_score: f32,
  limit: usize,
) -> Vec<SearchResult> {
  let weight = weight.clamp(0.0, 1.0);

  let lexical_max = max_score(&lexical);
  let vector_max = max_score(&vector);

  let mut merged: HashMap<String, SearchResult> = HashMap::new();

  for mut result in lexical {
    result.score = (1.0 - weight) * (result.score / lexical_max);
    result.provenance = Provenance::Lexical;
    merged.insert(result.path.clone(), result);
  }

  for mut result in vector {
    let contribution = weight * (result.score / vector_max);
    match merged.get_mut(&result.path) {
      Some(existing) => {
        existing.score += contribution;
        existing.provenance = Provenance::Hybrid;
        existing.similarity = result.similarity;
      }
      None => {
        result.score = contribution;
        result.provenance = Provenance::Vector;
        merged.insert(result.path.clone(), result);
      }
    }
  }

  let mut fused: Vec<SearchResult> = merged.into_values().filter(|r| r.score >= min_score).collect();
  fused.sort_by(|a, b| {
    b.score
      .partial_cmp(&a.score)
      .unwrap_or(std::cmp::Ordering::Equal)
      .then_with(|| a.path.cmp(&b.path))
  });
  fused.truncate(limit);
  fused
}

fn max_score(results: &[SearchResult]) -> f32 {
  results.iter().map(|r| r.score).fold(0.0f32, f32::max).max(EPSILON)
}
