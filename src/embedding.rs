//! # Embedding
//!
//! Maps text to fixed-length dense vectors.
//!
//! Everything downstream only sees the [`Embedder`] trait, so the concrete model is picked once,
//! from [`EmbeddingConfig`], by [`build_embedder`]:
//!
//! - [`SentenceEmbedder`]: all-MiniLM-L6-v2 (or another BERT sentence-transformer) run
//!   in-process with Candle. Weights are fetched from the Hugging Face Hub on first use and
//!   cached.
//! - [`OpenAiEmbedder`]: any OpenAI-compatible `/embeddings` endpoint, including Ollama's.
//! - [`HashingEmbedder`]: signed feature hashing of words. Needs no model and no network, which
//!   makes it handy for tests and air-gapped smoke runs; its notion of similarity is lexical.
//!
//! All three are deterministic: the same text always maps to the same vector.

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::embeddings::{CreateEmbeddingRequestArgs, CreateEmbeddingResponse},
};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config, DTYPE};
use futures::{StreamExt, TryStreamExt, stream};
use hf_hub::{Repo, RepoType, api::sync::Api};
use rayon::prelude::*;
use std::{fmt::Display, sync::Arc, time::Duration};
use tokenizers::Tokenizer;
use tracing::*;

use crate::config::{EmbeddingBackend, EmbeddingConfig};
use crate::error::{RagError, Result};

/// Build an async-openai client whose requests are attempted exactly once.
///
/// The library's default backoff retries 429 and 5xx responses for up to 15 minutes, which
/// would let a single call outlive `request_timeout` many times over.
pub(crate) fn openai_client(
    api_key: &str,
    api_base: &str,
    request_timeout: Duration,
) -> Result<Client<OpenAIConfig>> {
    let openai_config = OpenAIConfig::new()
        .with_api_key(api_key)
        .with_api_base(api_base);
    let http_client = reqwest::Client::builder()
        .timeout(request_timeout)
        .build()
        .map_err(|e| RagError::Configuration(format!("HTTP client: {e}")))?;
    let no_retry = ExponentialBackoffBuilder::new()
        .with_max_elapsed_time(Some(Duration::ZERO))
        .build();
    Ok(Client::with_config(openai_config)
        .with_http_client(http_client)
        .with_backoff(no_retry))
}

/// Capability: map text to a vector of a fixed dimension.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed many texts. The output has the same length and order as `texts`.
    ///
    /// The default implementation calls [`embed`](Embedder::embed) once per text.
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }

    /// Length of every vector this embedder produces.
    fn dimension(&self) -> usize;

    /// Human-readable model identifier, for logs and `doctor`.
    fn model_name(&self) -> &str;
}

fn service_err(e: impl Display) -> RagError {
    RagError::EmbeddingService(e.to_string())
}

/// Rejects a vector whose length differs from `expected`.
fn check_dimension(vector: &[f32], expected: usize) -> Result<()> {
    if vector.len() != expected {
        return Err(RagError::EmbeddingService(format!(
            "malformed embedding: expected {expected} values, got {}",
            vector.len()
        )));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(RagError::EmbeddingService(
            "malformed embedding: non-finite value".into(),
        ));
    }
    Ok(())
}

/// Build the embedder selected by `config.backend`.
///
/// Loading the local model may download weights, so it runs on the blocking pool.
pub async fn build_embedder(
    config: &EmbeddingConfig,
    request_timeout: Duration,
) -> Result<Arc<dyn Embedder>> {
    info!(backend = ?config.backend, model = %config.model, "Building embedder");
    let embedder: Arc<dyn Embedder> = match config.backend {
        EmbeddingBackend::Local => {
            let model = config.model.clone();
            let dimension = config.dimension;
            let embedder =
                tokio::task::spawn_blocking(move || SentenceEmbedder::load(&model, dimension))
                    .await
                    .map_err(service_err)??;
            Arc::new(embedder)
        }
        EmbeddingBackend::OpenAi => Arc::new(OpenAiEmbedder::new(config, request_timeout)?),
        EmbeddingBackend::Hashing => Arc::new(HashingEmbedder::new(config.dimension)),
    };
    Ok(embedder)
}

/// BERT weights plus tokenizer, run on the CPU.
struct SentenceEmbeddingsModel {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
}

impl SentenceEmbeddingsModel {
    fn load(model_id: &str) -> Result<(Self, usize)> {
        let device = Device::Cpu;

        let repo = Repo::with_revision(model_id.to_string(), RepoType::Model, "main".to_string());
        let api = Api::new().map_err(service_err)?;
        let api_repo = api.repo(repo);

        let config_filename = api_repo.get("config.json").map_err(service_err)?;
        let tokenizer_filename = api_repo.get("tokenizer.json").map_err(service_err)?;
        let weights_filename = api_repo.get("model.safetensors").map_err(service_err)?;

        let config = std::fs::read_to_string(config_filename)?;
        let config: Config = serde_json::from_str(&config)
            .map_err(|e| RagError::Configuration(format!("{model_id} config.json: {e}")))?;

        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(|e| service_err(format!("failed to load tokenizer: {e}")))?;

        // SAFETY: the safetensors file is owned by the hf-hub cache and not modified while mapped.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_filename], DTYPE, &device)
                .map_err(service_err)?
        };
        let model = BertModel::load(vb, &config).map_err(service_err)?;

        Ok((
            Self {
                model,
                tokenizer,
                device,
            },
            config.hidden_size,
        ))
    }

    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| service_err(format!("tokenization error: {e}")))?;

        let token_ids = Tensor::new(tokens.get_ids(), &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(service_err)?;
        let token_type_ids = Tensor::new(tokens.get_type_ids(), &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(service_err)?;

        let output = self
            .model
            .forward(&token_ids, &token_type_ids, None)
            .map_err(service_err)?;

        let embedding = self
            .mean_pooling(&output, tokens.get_attention_mask())
            .and_then(|t| Self::normalize(&t))
            .map_err(service_err)?;

        embedding.to_vec1::<f32>().map_err(service_err)
    }

    /// Mean of the token embeddings, ignoring padding. `[1, seq, hidden]` -> `[hidden]`.
    fn mean_pooling(
        &self,
        embeddings: &Tensor,
        attention_mask: &[u32],
    ) -> candle_core::Result<Tensor> {
        let mask = Tensor::new(attention_mask, &self.device)?
            .to_dtype(DType::F32)?
            .unsqueeze(0)?
            .unsqueeze(2)?;

        let sum = embeddings.broadcast_mul(&mask)?.sum(1)?;
        let count = mask.sum(1)?.clamp(1f32, f32::INFINITY)?;
        sum.broadcast_div(&count)?.squeeze(0)
    }

    fn normalize(tensor: &Tensor) -> candle_core::Result<Tensor> {
        let norm = tensor.sqr()?.sum_all()?.sqrt()?;
        tensor.broadcast_div(&norm)
    }
}

/// Local sentence-transformer embeddings.
///
/// Inference is CPU-bound, so it runs on tokio's blocking pool; a batch is spread across
/// rayon's thread pool.
pub struct SentenceEmbedder {
    model: Arc<SentenceEmbeddingsModel>,
    model_id: String,
    dimension: usize,
}

impl SentenceEmbedder {
    /// Fetch (or reuse cached) weights for `model_id` and load them.
    ///
    /// # Errors
    /// - [`RagError::EmbeddingService`] if the hub is unreachable or the files do not load.
    /// - [`RagError::Configuration`] if the model's hidden size is not `dimension`.
    pub fn load(model_id: &str, dimension: usize) -> Result<Self> {
        info!("Loading sentence embeddings model {model_id}");
        let (model, hidden_size) = SentenceEmbeddingsModel::load(model_id)?;
        if hidden_size != dimension {
            return Err(RagError::Configuration(format!(
                "{model_id} produces {hidden_size}-dimensional embeddings but embedding.dimension is {dimension}"
            )));
        }
        Ok(Self {
            model: Arc::new(model),
            model_id: model_id.to_string(),
            dimension,
        })
    }
}

#[async_trait]
impl Embedder for SentenceEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let model = Arc::clone(&self.model);
        let text = text.to_string();
        let vector = tokio::task::spawn_blocking(move || model.encode(&text))
            .await
            .map_err(service_err)??;
        check_dimension(&vector, self.dimension)?;
        Ok(vector)
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = Arc::clone(&self.model);
        let texts = texts.to_vec();
        debug!("Embedding {} texts locally", texts.len());
        let vectors = tokio::task::spawn_blocking(move || {
            texts
                .par_iter()
                .map(|text| model.encode(text))
                .collect::<Result<Vec<_>>>()
        })
        .await
        .map_err(service_err)??;

        for vector in &vectors {
            check_dimension(vector, self.dimension)?;
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

/// Embeddings from an OpenAI-compatible HTTP service.
///
/// `embed_many` splits its input into `batch_size` requests and keeps up to
/// `max_concurrent_requests` of them in flight; results are reassembled in input order.
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
    dimension: usize,
    batch_size: usize,
    max_concurrent_requests: usize,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig, request_timeout: Duration) -> Result<Self> {
        let client = openai_client(&config.api_key, &config.api_base, request_timeout)?;
        debug!("Embedding client created for {}", config.api_base);

        Ok(Self {
            client,
            model: config.model.clone(),
            dimension: config.dimension,
            batch_size: config.batch_size.max(1),
            max_concurrent_requests: config.max_concurrent_requests.max(1),
        })
    }

    async fn embed_batch(&self, batch: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let expected = batch.len();
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(batch)
            .build()
            .map_err(service_err)?;

        let response: CreateEmbeddingResponse = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(service_err)?;

        let mut data = response.data;
        if data.len() != expected {
            return Err(RagError::EmbeddingService(format!(
                "malformed response: sent {expected} texts, got {} embeddings",
                data.len()
            )));
        }
        data.sort_by_key(|e| e.index);

        data.into_iter()
            .map(|e| {
                check_dimension(&e.embedding, self.dimension)?;
                Ok(e.embedding)
            })
            .collect()
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(vec![text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| RagError::EmbeddingService("empty response".into()))
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(
            "Embedding {} texts in batches of {} ({} in flight)",
            texts.len(),
            self.batch_size,
            self.max_concurrent_requests
        );

        let batches: Vec<Vec<String>> = texts.chunks(self.batch_size).map(<[String]>::to_vec).collect();
        let results: Vec<Vec<Vec<f32>>> = stream::iter(batches)
            .map(|batch| self.embed_batch(batch))
            .buffered(self.max_concurrent_requests)
            .try_collect()
            .await?;

        Ok(results.into_iter().flatten().collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Offline embedder: each lower-cased word is hashed with BLAKE3 into one of `dimension`
/// buckets with a ±1 sign, and the result is L2-normalised.
///
/// Text without any word characters maps to the zero vector.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    pub fn encode(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimension];
        if self.dimension == 0 {
            return vector;
        }

        let words = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase);

        for word in words {
            let hash = blake3::hash(word.as_bytes());
            let bytes = hash.as_bytes();
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&bytes[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.encode(text))
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.par_iter().map(|t| self.encode(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "feature-hashing"
    }
}
