//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and two implementations:
//! - **[`OpenAiEmbedder`]** — calls the OpenAI embeddings API with retry
//!   and exponential backoff (429/5xx/network retried; other 4xx fail
//!   immediately).
//! - **[`OfflineEmbedder`]** — deterministic hash-derived vectors with no
//!   network dependency. Not semantic; used by tests and offline smoke
//!   runs.
//!
//! [`embed_in_batches`] is the pipeline's entry point: it partitions chunk
//! texts into fixed-size batches (20 by default), calls the provider once
//! per batch in order, and concatenates the results so the embedding at
//! position `i` always corresponds to text `i`. Any batch failure aborts
//! the whole operation; the job layer re-runs the entire job.

use async_trait::async_trait;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// Known embedding models and their dimensionality. An unknown model id is
/// a validation error, never silently defaulted.
pub fn model_dims(model: &str) -> Result<usize> {
    match model {
        "text-embedding-3-small" => Ok(1536),
        "text-embedding-3-large" => Ok(3072),
        "text-embedding-ada-002" => Ok(1536),
        other => Err(Error::validation(format!(
            "unknown embedding model: {}",
            other
        ))),
    }
}

/// An embedding backend. `embed` is batch and order-preserving: one output
/// vector per input text, in input order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model(&self) -> &str;
    fn dims(&self) -> usize;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed texts in fixed-size batches, one provider call per batch,
/// preserving input order in the concatenated result. `on_batch` runs
/// after each successful batch with `(completed, total)` batch counts, so
/// callers can surface progress during long embedding runs.
pub async fn embed_in_batches<F, Fut>(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    batch_size: usize,
    mut on_batch: F,
) -> Result<Vec<Vec<f32>>>
where
    F: FnMut(usize, usize) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let batch_size = batch_size.max(1);
    let total = texts.len().div_ceil(batch_size);
    let mut out = Vec::with_capacity(texts.len());
    for (i, batch) in texts.chunks(batch_size).enumerate() {
        let vectors = provider.embed(batch).await?;
        if vectors.len() != batch.len() {
            return Err(Error::transient(format!(
                "embedding provider returned {} vectors for {} texts",
                vectors.len(),
                batch.len()
            )));
        }
        out.extend(vectors);
        on_batch(i + 1, total).await?;
    }
    Ok(out)
}

/// Embed a single query text.
pub async fn embed_query(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    let results = provider.embed(&[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| Error::transient("empty embedding response"))
}

// ============ OpenAI provider ============

/// Embedding provider backed by the OpenAI embeddings API.
///
/// Requires `OPENAI_API_KEY` in the environment. Retry strategy matches
/// the completion side: HTTP 429 and 5xx retry with exponential backoff
/// (1s, 2s, 4s, ... capped at 32s); other 4xx fail immediately.
pub struct OpenAiEmbedder {
    model: String,
    dims: usize,
    base_url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig, model: &str) -> Result<Self> {
        let dims = model_dims(model)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::transient(format!("http client: {}", e)))?;
        Ok(Self {
            model: model.to_string(),
            dims,
            base_url: config.base_url.clone(),
            max_retries: config.max_retries,
            client,
        })
    }

    fn api_key() -> Result<String> {
        std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::fatal("OPENAI_API_KEY environment variable not set"))
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = Self::api_key()?;
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/embeddings", self.base_url))
                .header("Authorization", format!("Bearer {}", api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| Error::transient(format!("embedding response: {}", e)))?;
                        return parse_embedding_response(&json, texts.len());
                    }

                    // Rate limited or server error: retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let text = response.text().await.unwrap_or_default();
                        last_err = Some(Error::transient(format!(
                            "embedding API error {}: {}",
                            status, text
                        )));
                        continue;
                    }

                    // Client error (not 429): don't retry
                    let text = response.text().await.unwrap_or_default();
                    return Err(Error::fatal(format!(
                        "embedding API error {}: {}",
                        status, text
                    )));
                }
                Err(e) => {
                    last_err = Some(Error::transient(format!("embedding request: {}", e)));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::transient("embedding failed after retries")))
    }
}

/// Parse the embeddings API response, restoring input order from the
/// per-item `index` field.
fn parse_embedding_response(json: &serde_json::Value, expected: usize) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::transient("invalid embedding response: missing data array"))?;

    let mut embeddings: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let vector: Vec<f32> = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| Error::transient("invalid embedding response: missing embedding"))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push((index, vector));
    }

    if embeddings.len() != expected {
        return Err(Error::transient(format!(
            "embedding response had {} items, expected {}",
            embeddings.len(),
            expected
        )));
    }

    embeddings.sort_by_key(|(i, _)| *i);
    Ok(embeddings.into_iter().map(|(_, v)| v).collect())
}

// ============ Provider factory ============

/// Builds an [`EmbeddingProvider`] for a model id. The worker resolves the
/// model per profile at job time, so indexing two documents under
/// different profiles can use different providers in one process.
pub trait ProviderFactory: Send + Sync {
    fn for_model(&self, model: &str) -> Result<std::sync::Arc<dyn EmbeddingProvider>>;
}

/// Factory producing OpenAI-backed providers.
pub struct OpenAiProviderFactory {
    config: EmbeddingConfig,
}

impl OpenAiProviderFactory {
    pub fn new(config: EmbeddingConfig) -> Self {
        Self { config }
    }
}

impl ProviderFactory for OpenAiProviderFactory {
    fn for_model(&self, model: &str) -> Result<std::sync::Arc<dyn EmbeddingProvider>> {
        Ok(std::sync::Arc::new(OpenAiEmbedder::new(&self.config, model)?))
    }
}

/// Factory producing [`OfflineEmbedder`]s; dims still follow the model
/// registry so collection naming behaves exactly as in production.
pub struct OfflineProviderFactory;

impl ProviderFactory for OfflineProviderFactory {
    fn for_model(&self, model: &str) -> Result<std::sync::Arc<dyn EmbeddingProvider>> {
        let dims = model_dims(model)?;
        Ok(std::sync::Arc::new(OfflineEmbedder::new(model, dims)))
    }
}

// ============ Offline provider ============

/// Deterministic embedder with no network dependency. Vectors are derived
/// from character codes, so equal texts embed equally and different texts
/// almost always differ. Useful for tests and air-gapped smoke runs.
pub struct OfflineEmbedder {
    model: String,
    dims: usize,
}

impl OfflineEmbedder {
    pub fn new(model: &str, dims: usize) -> Self {
        Self {
            model: model.to_string(),
            dims,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OfflineEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0f32; self.dims];
                for (i, c) in t.chars().enumerate() {
                    v[i % self.dims] += (c as u32 % 97) as f32 / 97.0;
                }
                // Unit-normalize so cosine scores are comparable.
                let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm > f32::EPSILON {
                    for x in v.iter_mut() {
                        *x /= norm;
                    }
                }
                v
            })
            .collect())
    }
}
