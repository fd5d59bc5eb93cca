//! HTTP embedding provider.
//!
//! Speaks an ollama-style batch endpoint: `POST {base_url}/api/embed` with
//! `{model, input: [texts]}`, answered by `{embeddings: [[f32]]}`. Larger
//! inputs are split into sub-batches of `max_batch_size`. Every returned
//! vector is validated against the configured dimensions; a mismatch is an
//! error, not a warning, because downstream stores reject such vectors
//! anyway.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::{EmbeddingError, EmbeddingProvider};
use crate::config::EmbeddingConfig;

#[derive(Debug, Clone)]
pub struct HttpProvider {
  client: reqwest::Client,
  base_url: String,
  model: String,
  dimensions: usize,
  max_batch_size: usize,
}

impl HttpProvider {
  pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()?;
    Ok(Self {
      client,
      base_url: config.base_url.trim_end_matches('/').to_string(),
      model: config.model.clone(),
      dimensions: config.dimensions,
      max_batch_size: config.max_batch_size.max(1),
    })
  }

  fn embed_url(&self) -> String {
    format!("{}/api/embed", self.base_url)
  }

  /// One request against the batch endpoint.
  async fn embed_sub_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let request = BatchEmbeddingRequest {
      model: &self.model,
      input: texts.to_vec(),
    };

    trace!(batch_size = texts.len(), model = %self.model, "Sending embedding request");
    let start = Instant::now();

    let response = self
      .client
      .post(self.embed_url())
      .json(&request)
      .send()
      .await
      .map_err(classify_reqwest)?;

    if !response.status().is_success() {
      let status = response.status();
      let body = response.text().await.unwrap_or_default();
      warn!(status = %status, batch_size = texts.len(), "Embedding endpoint returned error");
      return Err(EmbeddingError::Provider(format!("server returned {status}: {body}")));
    }

    let result: BatchEmbeddingResponse = response.json().await.map_err(classify_reqwest)?;
    trace!(
      embeddings = result.embeddings.len(),
      elapsed_ms = start.elapsed().as_millis(),
      "Embedding response parsed"
    );

    if result.embeddings.len() != texts.len() {
      return Err(EmbeddingError::Provider(format!(
        "got {} embeddings for {} inputs",
        result.embeddings.len(),
        texts.len()
      )));
    }
    for embedding in &result.embeddings {
      if embedding.len() != self.dimensions {
        return Err(EmbeddingError::Dimensions {
          expected: self.dimensions,
          got: embedding.len(),
        });
      }
    }

    Ok(result.embeddings)
  }
}

/// Fold reqwest's error surface into our taxonomy so retry classification
/// has stable variants to look at.
fn classify_reqwest(e: reqwest::Error) -> EmbeddingError {
  if e.is_timeout() {
    EmbeddingError::Timeout
  } else if e.is_connect() || e.is_request() {
    EmbeddingError::Network(e.to_string())
  } else {
    EmbeddingError::Request(e)
  }
}

#[derive(Debug, Serialize)]
struct BatchEmbeddingRequest<'a> {
  model: &'a str,
  input: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct BatchEmbeddingResponse {
  embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingProvider for HttpProvider {
  fn name(&self) -> &str {
    "http"
  }

  fn model_id(&self) -> &str {
    &self.model
  }

  fn dimensions(&self) -> usize {
    self.dimensions
  }

  async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
    let mut vectors = self.embed_sub_batch(&[text]).await?;
    Ok(vectors.remove(0))
  }

  async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if texts.is_empty() {
      return Ok(Vec::new());
    }

    debug!(batch_size = texts.len(), model = %self.model, "Embedding batch");
    let mut all = Vec::with_capacity(texts.len());
    for chunk in texts.chunks(self.max_batch_size) {
      all.extend(self.embed_sub_batch(chunk).await?);
    }
    Ok(all)
  }
}
