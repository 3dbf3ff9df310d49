//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`HashProvider`]**: token-hashing bag of words; no network, always available.
//! - **[`NamedModel`]**: an OpenAI-compatible `/embeddings` endpoint (with
//!   retry and backoff) or an on-device fastembed model (feature
//!   `local-embeddings-fastembed`).
//!
//! The [`Embedder`] wraps the configured provider and never fails: when a
//! remote call errors it logs a warning and falls back to the hash embedding,
//! returning the model name alongside the vector so callers can record which
//! model produced it.
//!
//! Also provides vector utilities:
//! - [`cosine_similarity`]: similarity between two embedding vectors
//! - [`vec_to_blob`]: encode a `Vec<f32>` as little-endian bytes for SQLite BLOB storage
//! - [`blob_to_vec`]: decode a SQLite BLOB back into a `Vec<f32>`
//!
//! # Retry Strategy
//!
//! The OpenAI provider uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry

use anyhow::{bail, Result};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::warn;

use crate::config::EmbeddingConfig;

/// Trait for embedding providers.
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality, when known up front.
    fn dims(&self) -> usize;
}

// ============ Hash Provider ============

/// Feature-hashing embedding: each lowercase alphanumeric token lands in one
/// of `dims` buckets, and the bucket counts are L2-normalised.
pub struct HashProvider {
    dims: usize,
    model: String,
}

impl HashProvider {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            model: format!("hash-{}", dims),
        }
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        hash_embedding(text, self.dims)
    }
}

impl EmbeddingProvider for HashProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

/// Split text into lowercase alphanumeric tokens (Unicode-aware).
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn hash_embedding(text: &str, dims: usize) -> Vec<f32> {
    let mut vec = vec![0.0f32; dims];
    if dims == 0 {
        return vec;
    }

    for token in tokenize(text) {
        let digest = Sha256::digest(token.as_bytes());
        let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize % dims;
        vec[bucket] += 1.0;
    }

    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
    vec
}

// ============ Remote / on-device models ============

/// A provider identified by its configured model; vectors come from
/// [`embed_texts`].
pub struct NamedModel {
    model: String,
    dims: usize,
}

impl NamedModel {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            model: config.model.clone(),
            dims: config.dims,
        }
    }
}

impl EmbeddingProvider for NamedModel {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

/// Call the embeddings API with retry/backoff and return one vector per input.
async fn embed_openai(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let api_key =
        std::env::var("OPENAI_API_KEY").map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let inputs: Vec<String> = texts
        .iter()
        .map(|t| t.chars().take(config.max_input_chars).collect())
        .collect();

    let body = serde_json::json!({
        "model": config.model,
        "input": inputs,
    });

    let url = format!("{}/embeddings", config.url.trim_end_matches('/'));
    let mut last_err = anyhow::anyhow!("embedding request was never sent");

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            // 1s, 2s, 4s, ... capped at 32s
            tokio::time::sleep(Duration::from_secs(1 << (attempt - 1).min(5))).await;
        }

        let response = match client.post(&url).bearer_auth(&api_key).json(&body).send().await {
            Ok(response) => response,
            Err(e) => {
                last_err = e.into();
                continue;
            }
        };

        let status = response.status();
        if status.is_success() {
            let json: serde_json::Value = response.json().await?;
            return parse_openai_response(&json);
        }

        let detail = response.text().await.unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            last_err = anyhow::anyhow!("Embedding API error {}: {}", status, detail);
            continue;
        }
        bail!("Embedding API error {}: {}", status, detail);
    }

    Err(last_err)
}

/// Extract the `data[].embedding` arrays, ordered by `index` when present.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid embedding response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());

    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid embedding response: missing embedding"))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Local Provider (fastembed) ============

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, \
             multilingual-e5-small, multilingual-e5-base",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
async fn embed_local_fastembed(
    config: &EmbeddingConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let fastembed_model = config_to_fastembed_model(&config.model)?;
    let texts = texts.to_vec();

    tokio::task::spawn_blocking(move || {
        let mut model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed_model).with_show_download_progress(false),
        )
        .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;

        model
            .embed(texts, None)
            .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))
    })
    .await?
}

/// Embed a batch of texts with the configured remote or local provider.
///
/// The `hash` provider is handled by [`Embedder`] directly and never
/// reaches this function.
pub async fn embed_texts(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    match config.provider.as_str() {
        "openai" => embed_openai(config, texts).await,
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => embed_local_fastembed(config, texts).await,
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Create the [`EmbeddingProvider`] named by the configuration.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hash" => Ok(Box::new(HashProvider::new(config.dims))),
        "openai" => Ok(Box::new(NamedModel::new(config))),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Box::new(NamedModel::new(config))),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Embedder ============

/// Configured embedding entry point with a guaranteed hash fallback.
pub struct Embedder {
    config: EmbeddingConfig,
    provider: Box<dyn EmbeddingProvider>,
    fallback: HashProvider,
}

impl Embedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
            provider: create_provider(config)?,
            fallback: HashProvider::new(config.dims),
        })
    }

    /// Model name of the configured provider.
    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// Embed one text, returning the vector and the model that produced it.
    pub async fn embed(&self, text: &str) -> (Vec<f32>, String) {
        if self.config.provider == "hash" {
            return (
                self.fallback.embed(text),
                self.fallback.model_name().to_string(),
            );
        }

        match embed_texts(&self.config, &[text.to_string()]).await {
            Ok(mut vectors) if !vectors.is_empty() => {
                (vectors.swap_remove(0), self.provider.model_name().to_string())
            }
            Ok(_) => {
                warn!(
                    provider = %self.config.provider,
                    "empty embedding response, using hash fallback"
                );
                (
                    self.fallback.embed(text),
                    self.fallback.model_name().to_string(),
                )
            }
            Err(e) => {
                warn!(
                    provider = %self.config.provider,
                    error = %e,
                    "embedding provider failed, using hash fallback"
                );
                (
                    self.fallback.embed(text),
                    self.fallback.model_name().to_string(),
                )
            }
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use pokeshop::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Only the common prefix of the two vectors is compared. Returns `0.0`
/// when either side has zero norm over that prefix, so the result always
/// lies in `[-1.0, 1.0]`.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    (dot / denom).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        let restored = blob_to_vec(&blob);
        assert_eq!(vec, restored);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_empty_and_zero() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_cosine_uses_common_prefix() {
        let a = vec![1.0, 0.0, 5.0];
        let b = vec![1.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_tokenize_unicode() {
        assert_eq!(
            tokenize("Pokémon TCG: Charizard-ex, 151!"),
            vec!["pokémon", "tcg", "charizard", "ex", "151"]
        );
    }

    #[test]
    fn test_hash_embedding_normalised_and_deterministic() {
        let a = hash_embedding("Pikachu electric mouse", 64);
        let b = hash_embedding("pikachu ELECTRIC mouse", 64);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hash_embedding_empty_text_is_zero() {
        let v = hash_embedding("  ... ", 16);
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_hash_embedding_similarity_tracks_overlap() {
        let q = hash_embedding("charizard fire", 256);
        let close = hash_embedding("charizard fire dragon card", 256);
        let far = hash_embedding("squirtle water turtle plush", 256);
        assert!(cosine_similarity(&q, &close) > cosine_similarity(&q, &far));
    }

    #[test]
    fn test_parse_openai_response_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vecs = parse_openai_response(&json).unwrap();
        assert_eq!(vecs, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_embedder_hash_provider() {
        let embedder = Embedder::new(&EmbeddingConfig::default()).unwrap();
        let (vec, model) = embedder.embed("Pikachu").await;
        assert_eq!(model, "hash-256");
        assert_eq!(vec.len(), 256);
    }

    #[tokio::test]
    async fn test_embedder_falls_back_when_remote_fails() {
        let config = EmbeddingConfig {
            provider: "openai".to_string(),
            url: "http://127.0.0.1:9".to_string(),
            max_retries: 0,
            timeout_secs: 1,
            ..EmbeddingConfig::default()
        };
        let embedder = Embedder::new(&config).unwrap();
        let (vec, model) = embedder.embed("Pikachu").await;
        assert_eq!(model, "hash-256");
        assert_eq!(vec, hash_embedding("Pikachu", 256));
    }
}
