//! Pipeline behavior: initial indexing, incremental updates, rebuild
//! threshold, persistence, cancellation, single-flight, and provider
//! degradation.

use std::sync::{Arc, atomic::Ordering};

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use super::helpers::*;
use crate::{
  config::ProviderSelection,
  domain::{IndexStage, SearchMode, SearchOptions},
  engine::IndexOptions,
};

fn lexical_options() -> SearchOptions {
  SearchOptions {
    mode: SearchMode::Lexical,
    min_score: 0.0,
    ..Default::default()
  }
}

#[tokio::test]
async fn test_initial_index_builds_everything() {
  let ctx = EngineTestContext::new();
  ctx.write("src/auth.ts", "export function authenticateUser(u) { return login(u.credentials); }");
  ctx.write("src/db.ts", "export function connectDatabase() {}");
  ctx.write("README.md", "authentication service readme");

  let engine = ctx.engine();
  let summary = engine.index(IndexOptions::default()).await.unwrap();

  assert_eq!(summary.added, 3);
  assert_eq!(summary.total_files, 3);
  assert!(summary.rebuilt, "empty index must rebuild");
  assert!(!summary.cancelled);
  assert!(summary.error.is_none());

  let status = engine.status();
  assert!(!status.is_indexing);
  assert_eq!(status.stage, IndexStage::Complete);
  assert_eq!(status.progress, 100);
  assert_eq!(status.total_files, 3);

  assert_eq!(engine.document_count().await, 3);
}

#[tokio::test]
async fn test_reindex_without_changes_is_noop() {
  let ctx = EngineTestContext::new();
  ctx.write("a.rs", "fn alpha() {}");

  let engine = ctx.engine();
  engine.index(IndexOptions::default()).await.unwrap();

  let summary = engine.index(IndexOptions::default()).await.unwrap();
  assert_eq!(summary.added, 0);
  assert_eq!(summary.updated, 0);
  assert_eq!(summary.removed, 0);
  assert_eq!(summary.unchanged, 1);
  assert_eq!(summary.total_files, 1);
}

/// Incremental pipeline output equals a full rebuild over the final set.
#[tokio::test]
async fn test_incremental_matches_full_rebuild() {
  let ctx = EngineTestContext::new();
  for i in 0..20 {
    ctx.write(&format!("src/mod_{i:02}.rs"), &format!("fn handler_{i}() {{ dispatch_{i}(); }}"));
  }
  let engine = ctx.engine();
  engine.index(IndexOptions::default()).await.unwrap();

  // Mutate a small slice: 2 edits, 1 delete — under the 20% threshold.
  ctx.write("src/mod_03.rs", "fn handler_3() { authenticate(); }");
  ctx.write("src/mod_07.rs", "fn handler_7() { authenticate(); dispatch_7(); }");
  ctx.remove("src/mod_11.rs");

  let summary = engine.index(IndexOptions::default()).await.unwrap();
  assert!(!summary.rebuilt, "3/20 changes must stay incremental");
  assert_eq!(summary.updated, 2);
  assert_eq!(summary.removed, 1);
  assert_eq!(summary.total_files, 19);

  // A second engine over an identical tree, built in one shot.
  let fresh = EngineTestContext::new();
  for i in 0..20 {
    if i == 11 {
      continue;
    }
    let content = match i {
      3 => "fn handler_3() { authenticate(); }".to_string(),
      7 => "fn handler_7() { authenticate(); dispatch_7(); }".to_string(),
      _ => format!("fn handler_{i}() {{ dispatch_{i}(); }}"),
    };
    fresh.write(&format!("src/mod_{i:02}.rs"), &content);
  }
  let rebuilt = fresh.engine();
  rebuilt.index(IndexOptions::default()).await.unwrap();

  for query in ["authenticate", "dispatch", "handler", "dispatch_7 authenticate"] {
    let incremental = engine.search(query, lexical_options()).await;
    let from_scratch = rebuilt.search(query, lexical_options()).await;
    let a: Vec<(&str, f32)> = incremental.iter().map(|r| (r.path.as_str(), r.score)).collect();
    let b: Vec<(&str, f32)> = from_scratch.iter().map(|r| (r.path.as_str(), r.score)).collect();
    assert_eq!(a.len(), b.len(), "query {query}");
    for ((path_a, score_a), (path_b, score_b)) in a.iter().zip(b.iter()) {
      assert_eq!(path_a, path_b, "query {query}");
      assert!((score_a - score_b).abs() < 1e-5, "query {query}");
    }
  }
}

#[tokio::test]
async fn test_change_fraction_over_threshold_rebuilds() {
  let ctx = EngineTestContext::new();
  for i in 0..10 {
    ctx.write(&format!("f{i}.rs"), &format!("fn f{i}() {{}}"));
  }
  let engine = ctx.engine();
  engine.index(IndexOptions::default()).await.unwrap();

  // 3 of 10 changed: 0.3 > 0.2 threshold.
  for i in 0..3 {
    ctx.write(&format!("f{i}.rs"), &format!("fn f{i}() {{ rewritten(); }}"));
  }
  let summary = engine.index(IndexOptions::default()).await.unwrap();
  assert!(summary.rebuilt);
  assert_eq!(summary.total_files, 10);
}

#[tokio::test]
async fn test_deleted_file_leaves_all_result_sets() {
  let ctx = EngineTestContext::with_mock_provider();
  ctx.write("keep.rs", "fn quicksort() {}");
  ctx.write("gone.rs", "fn quicksort_gone() { quicksort(); }");

  let engine = ctx.engine();
  engine.index(IndexOptions::default()).await.unwrap();
  assert!(
    !engine.search("quicksort", lexical_options()).await.is_empty(),
    "precondition: gone.rs is indexed"
  );

  ctx.remove("gone.rs");
  engine.index(IndexOptions::default()).await.unwrap();

  for mode in [SearchMode::Lexical, SearchMode::Semantic, SearchMode::Hybrid] {
    let results = engine
      .search(
        "quicksort",
        SearchOptions {
          mode,
          min_score: 0.0,
          ..Default::default()
        },
      )
      .await;
    assert!(
      results.iter().all(|r| r.path != "gone.rs"),
      "gone.rs still visible in {mode:?}"
    );
  }
}

#[tokio::test]
async fn test_persistence_across_reopen() {
  let ctx = EngineTestContext::with_mock_provider();
  ctx.write("src/auth.rs", "fn authenticate_user() {}");
  ctx.write("src/db.rs", "fn connect_database() {}");

  let before;
  {
    let engine = ctx.engine();
    engine.index(IndexOptions::default()).await.unwrap();
    before = engine.search("authenticate", lexical_options()).await;
    engine.close().await.unwrap();
  }

  // A fresh engine sees the persisted index without reindexing.
  let engine = ctx.engine();
  assert_eq!(engine.document_count().await, 2);
  assert_eq!(engine.vector_count().await, Some(2));

  let after = engine.search("authenticate", lexical_options()).await;
  assert_eq!(before.len(), after.len());
  for (a, b) in before.iter().zip(after.iter()) {
    assert_eq!(a.path, b.path);
    assert!((a.score - b.score).abs() < 1e-6);
  }
}

#[tokio::test]
async fn test_corrupted_store_is_discarded_and_rebuilt() {
  let ctx = EngineTestContext::new();
  ctx.write("a.rs", "fn alpha() {}");

  {
    let engine = ctx.engine();
    engine.index(IndexOptions::default()).await.unwrap();
  }
  std::fs::write(ctx.config.db_path(), b"no longer a database").unwrap();

  let engine = ctx.engine();
  assert_eq!(engine.document_count().await, 0);
  engine.index(IndexOptions::default()).await.unwrap();
  assert_eq!(engine.document_count().await, 1);
}

#[tokio::test]
async fn test_cancellation_leaves_store_untouched() {
  let ctx = EngineTestContext::new();
  ctx.write("a.rs", "fn alpha() {}");

  let engine = ctx.engine();
  let cancel = CancellationToken::new();
  cancel.cancel();

  let summary = engine
    .index(IndexOptions {
      cancel: Some(cancel),
      ..Default::default()
    })
    .await
    .unwrap();

  assert!(summary.cancelled);
  assert_eq!(engine.document_count().await, 0);
  let status = engine.status();
  assert!(!status.is_indexing);
  assert_eq!(status.stage, IndexStage::Idle);
  assert!(status.error.is_none());
}

#[tokio::test]
async fn test_concurrent_index_calls_share_one_pipeline() {
  let ctx = EngineTestContext::new();
  for i in 0..30 {
    ctx.write(&format!("file_{i}.rs"), &format!("fn body_{i}() {{}}"));
  }

  let engine = ctx.engine();
  let (a, b) = tokio::join!(
    engine.index(IndexOptions::default()),
    engine.index(IndexOptions::default())
  );
  let a = a.unwrap();
  let b = b.unwrap();

  assert_eq!(engine.inner.pipeline_runs.load(Ordering::Relaxed), 1);
  assert_eq!(a.total_files, 30);
  assert_eq!(b.total_files, 30);
}

#[tokio::test]
async fn test_background_indexing_surfaces_through_status() {
  let ctx = EngineTestContext::new();
  ctx.write("a.rs", "fn alpha() {}");

  let engine = ctx.engine();
  engine.start_background_indexing(IndexOptions::default());

  let mut waited = 0;
  while engine.status().stage != IndexStage::Complete {
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    waited += 1;
    assert!(waited < 250, "background indexing never completed");
  }
  assert_eq!(engine.document_count().await, 1);
}

/// Scenario: provider always fails — the run still completes, the error
/// is recorded, lexical search works, hybrid degrades to lexical.
#[tokio::test]
async fn test_provider_failure_degrades_to_lexical() {
  let registry = registry_with("broken", Arc::new(BrokenProvider::new(TEST_DIMS)));

  let mut ctx = EngineTestContext::new();
  ctx.config.embedding.provider = Some(ProviderSelection::Named("broken".to_string()));
  ctx.config.embedding.dimensions = TEST_DIMS;
  ctx.write("auth.ts", "export function authenticateUser() {}");

  let engine = ctx.engine_with_registry(&registry);
  let summary = engine.index(IndexOptions::default()).await.unwrap();

  assert!(summary.error.as_deref().unwrap_or("").contains("ProviderError"));
  let status = engine.status();
  assert_eq!(status.stage, IndexStage::Complete);
  assert!(status.error.is_some());

  // Lexical path is intact.
  let lexical = engine.search("authenticate", lexical_options()).await;
  assert_eq!(lexical.len(), 1);

  // Hybrid and semantic degrade to lexical results.
  for mode in [SearchMode::Hybrid, SearchMode::Semantic] {
    let results = engine
      .search(
        "authenticate",
        SearchOptions {
          mode,
          min_score: 0.0,
          ..Default::default()
        },
      )
      .await;
    assert_eq!(results.len(), 1, "mode {mode:?}");
    assert_eq!(results[0].path, "auth.ts");
  }
}

#[tokio::test]
async fn test_unknown_named_provider_is_config_error() {
  let mut ctx = EngineTestContext::new();
  ctx.config.embedding.provider = Some(ProviderSelection::Named("does-not-exist".to_string()));
  ctx.config.embedding.dimensions = TEST_DIMS;

  let result = crate::engine::SearchEngine::open(ctx.config.clone());
  assert!(matches!(result, Err(crate::error::EngineError::Config(_))));
}

#[tokio::test]
async fn test_cache_flushed_on_mutation() {
  let ctx = EngineTestContext::new();
  ctx.write("a.rs", "fn alpha() {}");

  let engine = ctx.engine();
  engine.index(IndexOptions::default()).await.unwrap();

  // Prime the cache, then hit it.
  let first = engine.search("alpha", lexical_options()).await;
  assert_eq!(first.len(), 1);
  engine.search("alpha", lexical_options()).await;
  assert_eq!(engine.cache_stats().hits, 1);

  // Mutating the index must flush the cache: the stale entry would
  // otherwise keep serving the deleted document.
  ctx.remove("a.rs");
  engine.index(IndexOptions::default()).await.unwrap();

  let after = engine.search("alpha", lexical_options()).await;
  assert!(after.is_empty(), "cache served a stale result after mutation");
}
