//! Search behavior: lexical recall, hybrid fusion and its boundary laws,
//! filters, previews, and empty-index edges.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use super::helpers::*;
use crate::{
  config::ProviderSelection,
  domain::{Language, Provenance, SearchMode, SearchOptions},
  engine::IndexOptions,
};

fn options(mode: SearchMode) -> SearchOptions {
  SearchOptions {
    mode,
    min_score: 0.0,
    ..Default::default()
  }
}

/// Scenario: two files, a query matching one of them strongly.
#[tokio::test]
async fn test_lexical_recall() {
  let ctx = EngineTestContext::new();
  ctx.write(
    "auth.ts",
    "export function authenticateUser(u) { return login(u.credentials); }",
  );
  ctx.write("db.ts", "export function connectDatabase() {}");

  let engine = ctx.engine();
  engine.index(IndexOptions::default()).await.unwrap();

  let results = engine
    .search(
      "authenticate user",
      SearchOptions {
        mode: SearchMode::Lexical,
        limit: 5,
        min_score: 0.0,
        ..Default::default()
      },
    )
    .await;

  assert_eq!(results[0].path, "auth.ts");
  assert!(results[0].matched_terms.contains(&"authenticate".to_string()));
  assert!(results[0].matched_terms.contains(&"user".to_string()));
  assert_eq!(results[0].provenance, Provenance::Lexical);

  if let Some(db) = results.iter().find(|r| r.path == "db.ts") {
    assert!(results[0].score > db.score);
  }
}

#[tokio::test]
async fn test_empty_index_returns_empty() {
  let ctx = EngineTestContext::new();
  let engine = ctx.engine();
  engine.index(IndexOptions::default()).await.unwrap();

  for mode in [SearchMode::Lexical, SearchMode::Semantic, SearchMode::Hybrid] {
    assert!(engine.search("anything", options(mode)).await.is_empty());
  }
}

#[tokio::test]
async fn test_unknown_terms_return_empty() {
  let ctx = EngineTestContext::new();
  ctx.write("a.rs", "fn alpha() {}");
  let engine = ctx.engine();
  engine.index(IndexOptions::default()).await.unwrap();

  assert!(engine.search("zeppelin chromatography", options(SearchMode::Lexical)).await.is_empty());
  assert!(engine.search("", options(SearchMode::Lexical)).await.is_empty());
}

#[tokio::test]
async fn test_language_filter() {
  let ctx = EngineTestContext::new();
  ctx.write("handler.rs", "fn process_request() {}");
  ctx.write("handler.ts", "function processRequest() {}");

  let engine = ctx.engine();
  engine.index(IndexOptions::default()).await.unwrap();

  let all = engine.search("process request", options(SearchMode::Lexical)).await;
  assert_eq!(all.len(), 2);

  let rust_only = engine
    .search(
      "process request",
      SearchOptions {
        mode: SearchMode::Lexical,
        min_score: 0.0,
        language: Some(Language::Rust),
        ..Default::default()
      },
    )
    .await;
  assert_eq!(rust_only.len(), 1);
  assert_eq!(rust_only[0].path, "handler.rs");
  assert_eq!(rust_only[0].language.as_deref(), Some("rust"));
}

#[tokio::test]
async fn test_include_content_attaches_preview() {
  let ctx = EngineTestContext::new();
  let body = format!("fn alpha() {{}}\n{}", "// filler\n".repeat(200));
  ctx.write("a.rs", &body);

  let engine = ctx.engine();
  engine.index(IndexOptions::default()).await.unwrap();

  let plain = engine.search("alpha", options(SearchMode::Lexical)).await;
  assert!(plain[0].content_preview.is_none());

  let with_content = engine
    .search(
      "alpha",
      SearchOptions {
        mode: SearchMode::Lexical,
        min_score: 0.0,
        include_content: true,
        ..Default::default()
      },
    )
    .await;
  let preview = with_content[0].content_preview.as_ref().unwrap();
  assert!(preview.chars().count() <= 500);
  assert!(preview.starts_with("fn alpha"));
}

/// Scripted geometry for the hybrid tests: the query and `login.ts` sit on
/// axis 0, `auth_util.ts` far away on axis 1.
fn hybrid_fixture() -> (EngineTestContext, crate::embedding::ProviderRegistry) {
  let provider = ScriptedProvider::new(TEST_DIMS, |text| {
    if text.contains("user authentication") {
      // The query itself.
      axis_vector(0)
    } else if text.contains("startSession") {
      // Semantically close to the query, lexically unrelated.
      near_axis_vector()
    } else if text.contains("checkUserAuthentication") {
      // Lexically matching, semantically distant.
      axis_vector(1)
    } else {
      axis_vector(2)
    }
  });
  let registry = registry_with("scripted", Arc::new(provider));

  let mut ctx = EngineTestContext::new();
  ctx.config.embedding.provider = Some(ProviderSelection::Named("scripted".to_string()));
  ctx.config.embedding.dimensions = TEST_DIMS;

  ctx.write(
    "login.ts",
    "export function startSession(s) { return createSession(s.token); }",
  );
  ctx.write(
    "auth_util.ts",
    "export function checkUserAuthentication(user) { return user.authentication.valid; }",
  );
  ctx.write("db.ts", "export function connectDatabase() {}");

  (ctx, registry)
}

/// Scenario: hybrid fusion surfaces both the semantic match and the
/// lexical match, with correct provenance.
#[tokio::test]
async fn test_hybrid_fusion_merges_both_signals() {
  let (ctx, registry) = hybrid_fixture();
  let engine = ctx.engine_with_registry(&registry);
  engine.index(IndexOptions::default()).await.unwrap();

  let results = engine
    .search(
      "user authentication",
      SearchOptions {
        mode: SearchMode::Hybrid,
        vector_weight: 0.7,
        limit: 3,
        min_score: 0.0,
        ..Default::default()
      },
    )
    .await;

  let top3: Vec<&str> = results.iter().take(3).map(|r| r.path.as_str()).collect();
  assert!(top3.contains(&"login.ts"), "semantic hit missing from {top3:?}");
  assert!(top3.contains(&"auth_util.ts"), "lexical hit missing from {top3:?}");

  let login = results.iter().find(|r| r.path == "login.ts").unwrap();
  assert_eq!(login.provenance, Provenance::Vector);
  assert!(login.similarity.unwrap() > 0.9);

  let auth = results.iter().find(|r| r.path == "auth_util.ts").unwrap();
  assert!(matches!(auth.provenance, Provenance::Lexical | Provenance::Hybrid));
  assert!(!auth.matched_terms.is_empty());
}

/// Hybrid boundary law: w = 0 equals lexical-only output.
#[tokio::test]
async fn test_weight_zero_equals_lexical() {
  let (ctx, registry) = hybrid_fixture();
  let engine = ctx.engine_with_registry(&registry);
  engine.index(IndexOptions::default()).await.unwrap();

  let hybrid = engine
    .search(
      "user authentication",
      SearchOptions {
        mode: SearchMode::Hybrid,
        vector_weight: 0.0,
        min_score: 0.0,
        ..Default::default()
      },
    )
    .await;
  let lexical = engine.search("user authentication", options(SearchMode::Lexical)).await;

  let h: Vec<(&str, f32)> = hybrid.iter().map(|r| (r.path.as_str(), r.score)).collect();
  let l: Vec<(&str, f32)> = lexical.iter().map(|r| (r.path.as_str(), r.score)).collect();
  assert_eq!(h, l);
}

/// Hybrid boundary law: w = 1 equals semantic-only output.
#[tokio::test]
async fn test_weight_one_equals_semantic() {
  let (ctx, registry) = hybrid_fixture();
  let engine = ctx.engine_with_registry(&registry);
  engine.index(IndexOptions::default()).await.unwrap();

  let hybrid = engine
    .search(
      "user authentication",
      SearchOptions {
        mode: SearchMode::Hybrid,
        vector_weight: 1.0,
        min_score: 0.0,
        ..Default::default()
      },
    )
    .await;
  let semantic = engine.search("user authentication", options(SearchMode::Semantic)).await;

  let h: Vec<&str> = hybrid.iter().map(|r| r.path.as_str()).collect();
  let s: Vec<&str> = semantic.iter().map(|r| r.path.as_str()).collect();
  assert_eq!(h, s);
  assert!(hybrid.iter().all(|r| r.provenance == Provenance::Vector));
}

#[tokio::test]
async fn test_semantic_min_score_drops_distant_hits() {
  let (ctx, registry) = hybrid_fixture();
  let engine = ctx.engine_with_registry(&registry);
  engine.index(IndexOptions::default()).await.unwrap();

  let results = engine
    .search(
      "user authentication",
      SearchOptions {
        mode: SearchMode::Semantic,
        min_score: 0.5,
        ..Default::default()
      },
    )
    .await;

  // Only login.ts sits within 0.5 similarity of the query axis.
  assert_eq!(results.len(), 1);
  assert_eq!(results[0].path, "login.ts");
}

#[tokio::test]
async fn test_scores_non_increasing_and_non_negative() {
  let (ctx, registry) = hybrid_fixture();
  let engine = ctx.engine_with_registry(&registry);
  engine.index(IndexOptions::default()).await.unwrap();

  for mode in [SearchMode::Lexical, SearchMode::Semantic, SearchMode::Hybrid] {
    let results = engine.search("user authentication session", options(mode)).await;
    for pair in results.windows(2) {
      assert!(pair[0].score >= pair[1].score, "mode {mode:?}");
    }
    assert!(results.iter().all(|r| r.score >= 0.0), "mode {mode:?}");
  }
}

#[tokio::test]
async fn test_cache_hits_repeat_queries() {
  let ctx = EngineTestContext::new();
  ctx.write("a.rs", "fn alpha() {}");
  let engine = ctx.engine();
  engine.index(IndexOptions::default()).await.unwrap();

  let first = engine.search("alpha", options(SearchMode::Lexical)).await;
  let second = engine.search("Alpha", options(SearchMode::Lexical)).await;
  assert_eq!(first.len(), second.len());

  let stats = engine.cache_stats();
  // Query normalization folds "Alpha" onto the cached "alpha" entry.
  assert_eq!(stats.hits, 1);
  assert_eq!(stats.misses, 1);
}
