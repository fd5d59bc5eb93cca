//! Watch mode: debounced flushes, live updates, and the logical-delete /
//! compaction lifecycle of the vector store.

use std::{
  sync::atomic::Ordering,
  time::{Duration, Instant},
};

use pretty_assertions::assert_eq;

use super::helpers::*;
use crate::{
  domain::{SearchMode, SearchOptions},
  engine::{IndexOptions, SearchEngine},
};

fn lexical_options() -> SearchOptions {
  SearchOptions {
    mode: SearchMode::Lexical,
    min_score: 0.0,
    ..Default::default()
  }
}

/// Poll until the engine reports `expected` documents or the deadline
/// passes.
async fn wait_for_documents(engine: &SearchEngine, expected: usize, deadline: Duration) {
  let start = Instant::now();
  while engine.document_count().await != expected {
    assert!(
      start.elapsed() < deadline,
      "expected {expected} documents, still at {} after {:?}",
      engine.document_count().await,
      deadline
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
  }
}

/// Scenario: a burst of file creations within the debounce window becomes
/// exactly one additional pipeline run covering all of them.
#[tokio::test(flavor = "multi_thread")]
async fn test_debounced_burst_is_one_pipeline_run() {
  let mut ctx = EngineTestContext::new();
  ctx.config.debounce_ms = 400;
  ctx.write("seed.rs", "fn seed() {}");

  let engine = ctx.engine();
  engine
    .index(IndexOptions {
      watch: true,
      ..Default::default()
    })
    .await
    .unwrap();
  let runs_after_initial = engine.inner.pipeline_runs.load(Ordering::Relaxed);

  // Five files land well inside one debounce window.
  for i in 0..5 {
    ctx.write(&format!("burst_{i}.rs"), &format!("fn burst_{i}() {{}}"));
    tokio::time::sleep(Duration::from_millis(30)).await;
  }

  wait_for_documents(&engine, 6, Duration::from_secs(10)).await;
  // Give any misbehaving extra flush a chance to fire before counting.
  tokio::time::sleep(Duration::from_millis(600)).await;

  let runs = engine.inner.pipeline_runs.load(Ordering::Relaxed);
  assert_eq!(runs, runs_after_initial + 1, "burst should flush as a single run");

  for i in 0..5 {
    let results = engine.search(&format!("burst_{i}"), lexical_options()).await;
    assert_eq!(results.len(), 1, "burst_{i}.rs missing from the index");
  }

  engine.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_watch_picks_up_modify_and_delete() {
  let mut ctx = EngineTestContext::new();
  ctx.config.debounce_ms = 200;
  ctx.write("live.rs", "fn original_name() {}");

  let engine = ctx.engine();
  engine
    .index(IndexOptions {
      watch: true,
      ..Default::default()
    })
    .await
    .unwrap();

  ctx.write("live.rs", "fn renamed_function() {}");
  let start = Instant::now();
  loop {
    let hits = engine.search("renamed_function", lexical_options()).await;
    if hits.len() == 1 {
      break;
    }
    assert!(start.elapsed() < Duration::from_secs(10), "modification never indexed");
    tokio::time::sleep(Duration::from_millis(50)).await;
  }
  assert!(engine.search("original_name", lexical_options()).await.is_empty());

  ctx.remove("live.rs");
  wait_for_documents(&engine, 0, Duration::from_secs(10)).await;
  assert!(engine.search("renamed_function", lexical_options()).await.is_empty());

  engine.close().await.unwrap();
}

/// Scenario: a deleted document stays out of vector results even though
/// its vector is still physically in the graph, and enough deletions
/// trigger a compaction that shrinks the snapshot.
#[tokio::test]
async fn test_logical_delete_and_compaction() {
  let mut ctx = EngineTestContext::with_mock_provider();
  ctx.config.hnsw.max_elements = 16;

  for i in 0..12 {
    ctx.write(&format!("doc_{i}.ts"), &format!("export function feature_{i}() {{}}"));
  }
  let engine = ctx.engine();
  engine.index(IndexOptions::default()).await.unwrap();
  assert_eq!(engine.vector_count().await, Some(12));

  // One delete: logically removed, physically still in the graph.
  ctx.remove("doc_0.ts");
  engine.index(IndexOptions::default()).await.unwrap();

  let results = engine
    .search(
      "feature_0",
      SearchOptions {
        mode: SearchMode::Semantic,
        min_score: 0.0,
        limit: 20,
        ..Default::default()
      },
    )
    .await;
  assert!(results.iter().all(|r| r.path != "doc_0.ts"));
  {
    let state = engine.inner.state.read().await;
    let vectors = state.vectors.as_ref().unwrap();
    assert_eq!(vectors.live_count(), 11);
    assert!(vectors.deleted_count() >= 1, "delete must be logical, not physical");
  }
  let snapshot_before = std::fs::metadata(ctx.config.snapshot_path()).unwrap().len();

  // Enough deletions to cross 30% of capacity force a compaction.
  for i in 1..7 {
    ctx.remove(&format!("doc_{i}.ts"));
  }
  engine.index(IndexOptions::default()).await.unwrap();

  {
    let state = engine.inner.state.read().await;
    let vectors = state.vectors.as_ref().unwrap();
    assert_eq!(vectors.live_count(), 5);
    assert_eq!(vectors.deleted_count(), 0, "compaction should drop deleted slots");
  }
  let snapshot_after = std::fs::metadata(ctx.config.snapshot_path()).unwrap().len();
  assert!(
    snapshot_after < snapshot_before,
    "snapshot should shrink after compaction: {snapshot_after} >= {snapshot_before}"
  );

  // The survivors still answer; a permissive floor keeps hash-derived
  // mock vectors with negative cosine from dropping out.
  let results = engine
    .search(
      "feature_9",
      SearchOptions {
        mode: SearchMode::Semantic,
        min_score: -1.0,
        ..Default::default()
      },
    )
    .await;
  assert!(results.iter().any(|r| r.path == "doc_9.ts"));
}
