//! This module provides functionality for loading and validating the application's configuration.
//!
//! It defines the [`AwfulRagConfig`] struct, which holds one section per pipeline stage, and a
//! [`load_config`] function to load it from a YAML file. Each component receives its own section
//! at construction time; nothing reads configuration from process-wide state.
//!
//! # Examples
//!
//! Loading the configuration from a file:
//!
//! ```no_run
//! use awful_rag::config::{AwfulRagConfig, load_config};
//!
//! let config: AwfulRagConfig = load_config("/path/to/config.yaml").unwrap();
//! println!("{:?}", config.retrieval.top_k);
//! ```
//!
//! A minimal file only needs the values that differ from the defaults:
//!
//! ```yaml
//! generation:
//!   model: "mistral"
//! retrieval:
//!   top_k: 3
//! ```

use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, time::Duration};

use tracing::*;

use crate::chunker::ChunkingConfig;
use crate::error::{RagError, Result};
use crate::index::Similarity;
use crate::prompt::PromptTemplate;

/// Which implementation backs the embedding capability.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// BERT sentence-embedding model run in-process with Candle.
    #[default]
    Local,
    /// OpenAI-compatible `/embeddings` endpoint (Ollama serves one under `/v1`).
    OpenAi,
    /// Deterministic feature hashing; no model, no network.
    Hashing,
}

/// Which implementation backs the generation capability.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum GenerationBackend {
    /// Ollama's native `/api/chat`.
    #[default]
    Ollama,
    /// OpenAI-compatible chat completions.
    OpenAi,
}

/// Embedding model selection and HTTP batching knobs.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackend,

    /// Model identifier: a Hugging Face repo for `local`, a served model name for `openai`.
    pub model: String,

    /// Fixed vector dimension D. Responses of any other length are rejected.
    pub dimension: usize,

    /// Base URL of the OpenAI-compatible API.
    pub api_base: String,

    pub api_key: String,

    /// Texts per embedding request.
    pub batch_size: usize,

    /// Embedding requests allowed in flight during ingestion.
    pub max_concurrent_requests: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Local,
            model: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            dimension: 384,
            api_base: "http://localhost:11434/v1".to_string(),
            api_key: "ollama".to_string(),
            batch_size: 32,
            max_concurrent_requests: 4,
        }
    }
}

/// Nearest-neighbour search and context-budget settings.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Number of chunks retrieved per question.
    pub top_k: usize,

    pub similarity: Similarity,

    /// Retrieved chunks scoring below this are discarded.
    pub min_similarity: Option<f32>,

    /// Token budget (cl100k) for the retrieved passages placed in a prompt.
    pub context_token_budget: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            similarity: Similarity::Cosine,
            min_similarity: None,
            context_token_budget: 2048,
        }
    }
}

/// Language-model selection and sampling options.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct GenerationConfig {
    pub backend: GenerationBackend,

    /// The name of the model to be used for generating answers.
    pub model: String,

    /// Sampling randomness, 0.0 and up.
    pub temperature: f32,

    /// Hard cap on generated tokens.
    pub max_tokens: u32,

    /// Ollama root URL for `ollama`, API base (ending in `/v1`) for `openai`.
    pub api_base: String,

    pub api_key: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            backend: GenerationBackend::Ollama,
            model: "llama3".to_string(),
            temperature: 0.7,
            max_tokens: 2000,
            api_base: "http://localhost:11434".to_string(),
            api_key: "ollama".to_string(),
        }
    }
}

/// Represents the application's configuration.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct AwfulRagConfig {
    pub chunking: ChunkingConfig,

    pub embedding: EmbeddingConfig,

    pub retrieval: RetrievalConfig,

    pub generation: GenerationConfig,

    /// Bound applied to every embedding and generation request.
    pub request_timeout_secs: u64,

    /// Directory holding the persisted vector index. Defaults to `<config_dir>/index`.
    pub index_path: Option<PathBuf>,

    /// Number of question/answer exchanges kept in memory.
    pub max_history: usize,

    /// Optional YAML prompt template overriding the built-in wording.
    pub template_path: Option<PathBuf>,
}

impl Default for AwfulRagConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            generation: GenerationConfig::default(),
            request_timeout_secs: 120,
            index_path: None,
            max_history: 10,
            template_path: None,
        }
    }
}

impl AwfulRagConfig {
    /// Reject configurations the pipeline cannot run with.
    ///
    /// Called by [`load_config`] and again by
    /// [`RagPipeline::new`](crate::pipeline::RagPipeline::new), so a bad config fails before any
    /// document is ingested.
    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;

        if self.embedding.model.trim().is_empty() {
            return Err(RagError::Configuration(
                "embedding.model must not be empty".into(),
            ));
        }
        if self.embedding.dimension == 0 {
            return Err(RagError::Configuration(
                "embedding.dimension must be greater than zero".into(),
            ));
        }
        if self.embedding.batch_size == 0 {
            return Err(RagError::Configuration(
                "embedding.batch_size must be greater than zero".into(),
            ));
        }
        if self.embedding.max_concurrent_requests == 0 {
            return Err(RagError::Configuration(
                "embedding.max_concurrent_requests must be greater than zero".into(),
            ));
        }
        if self.retrieval.top_k == 0 {
            return Err(RagError::Configuration(
                "retrieval.top_k must be greater than zero".into(),
            ));
        }
        if self.generation.model.trim().is_empty() {
            return Err(RagError::Configuration(
                "generation.model must not be empty".into(),
            ));
        }
        if !self.generation.temperature.is_finite() || self.generation.temperature < 0.0 {
            return Err(RagError::Configuration(format!(
                "generation.temperature must be a non-negative number, got {}",
                self.generation.temperature
            )));
        }
        if self.generation.max_tokens == 0 {
            return Err(RagError::Configuration(
                "generation.max_tokens must be greater than zero".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(RagError::Configuration(
                "request_timeout_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The configured index directory, or `<config_dir>/index`.
    pub fn resolved_index_path(&self) -> Result<PathBuf> {
        match &self.index_path {
            Some(path) => Ok(path.clone()),
            None => Ok(crate::config_dir()?.join("index")),
        }
    }
}

/// Loads the application's configuration from a YAML file and validates it.
///
/// # Errors
///
/// - [`RagError::Io`] if the file cannot be read.
/// - [`RagError::Configuration`] if the YAML does not parse or a value is out of range.
///
/// # Examples
///
/// ```no_run
/// use awful_rag::config::load_config;
///
/// match load_config("/path/to/config.yaml") {
///     Ok(config) => println!("{:?}", config),
///     Err(err) => eprintln!("Error loading config: {}", err),
/// }
/// ```
pub fn load_config(file: impl AsRef<Path>) -> Result<AwfulRagConfig> {
    let file = file.as_ref();
    debug!("Loading config from: {}", file.display());
    let content = fs::read_to_string(file)?;
    let config: AwfulRagConfig = serde_yaml::from_str(&content)
        .map_err(|e| RagError::Configuration(format!("{}: {e}", file.display())))?;
    config.validate()?;
    Ok(config)
}

/// Write a default `config.yaml` and `templates/default.yaml` into `dir`.
///
/// Files that already exist are left alone. Returns the paths that were written.
pub fn init(dir: &Path) -> Result<Vec<PathBuf>> {
    let templates_dir = dir.join("templates");
    info!("Creating template config directory: {}", templates_dir.display());
    fs::create_dir_all(&templates_dir)?;

    let template_path = templates_dir.join("default.yaml");
    let config = AwfulRagConfig {
        index_path: Some(dir.join("index")),
        template_path: Some(template_path.clone()),
        ..Default::default()
    };

    let to_yaml_err = |e: serde_yaml::Error| RagError::Configuration(e.to_string());
    let files = [
        (
            dir.join("config.yaml"),
            serde_yaml::to_string(&config).map_err(to_yaml_err)?,
        ),
        (
            template_path,
            serde_yaml::to_string(&PromptTemplate::default()).map_err(to_yaml_err)?,
        ),
    ];

    let mut written = Vec::new();
    for (path, yaml) in files {
        if path.exists() {
            info!("Keeping existing file: {}", path.display());
            continue;
        }
        info!("Creating file: {}", path.display());
        fs::write(&path, yaml)?;
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config_valid_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
chunking:
  chunk_size: 500
  chunk_overlap: 50
embedding:
  backend: hashing
  dimension: 64
retrieval:
  top_k: 3
  similarity: euclidean
generation:
  backend: openai
  model: "example_model"
  api_base: "http://example.com/v1"
request_timeout_secs: 30
"#
        )
        .unwrap();

        let config = load_config(temp_file.path());

        assert!(config.is_ok(), "{config:?}");
        let config = config.unwrap();
        assert_eq!(config.chunking.chunk_size, 500);
        assert_eq!(config.chunking.chunk_overlap, 50);
        assert_eq!(config.embedding.backend, EmbeddingBackend::Hashing);
        assert_eq!(config.embedding.dimension, 64);
        assert_eq!(config.retrieval.top_k, 3);
        assert_eq!(config.retrieval.similarity, Similarity::Euclidean);
        assert_eq!(config.generation.backend, GenerationBackend::OpenAi);
        assert_eq!(config.generation.model, "example_model");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        // untouched sections keep their defaults
        assert_eq!(config.generation.max_tokens, 2000);
        assert_eq!(config.max_history, 10);
    }

    #[test]
    fn test_empty_file_yields_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "{{}}").unwrap();
        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(config, AwfulRagConfig::default());
    }

    #[test]
    fn test_load_config_invalid_file() {
        let config = load_config("non/existent/path");
        assert!(matches!(config, Err(RagError::Io(_))));
    }

    #[test]
    fn test_load_config_invalid_format() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, r#"invalid: config: format"#).unwrap();

        let config = load_config(temp_file.path());
        assert!(matches!(config, Err(RagError::Configuration(_))));
    }

    #[test]
    fn test_overlap_not_smaller_than_chunk_size_is_rejected() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            "chunking:\n  chunk_size: 200\n  chunk_overlap: 200\n"
        )
        .unwrap();
        let config = load_config(temp_file.path());
        assert!(matches!(config, Err(RagError::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AwfulRagConfig::default();
        config.retrieval.top_k = 0;
        assert!(config.validate().is_err());

        let mut config = AwfulRagConfig::default();
        config.generation.temperature = -0.1;
        assert!(config.validate().is_err());

        let mut config = AwfulRagConfig::default();
        config.embedding.dimension = 0;
        assert!(config.validate().is_err());

        let mut config = AwfulRagConfig::default();
        config.generation.model = "  ".into();
        assert!(config.validate().is_err());

        let mut config = AwfulRagConfig::default();
        config.request_timeout_secs = 0;
        assert!(config.validate().is_err());

        assert!(AwfulRagConfig::default().validate().is_ok());
    }

    #[test]
    fn test_init_writes_loadable_files_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let written = init(dir.path()).unwrap();
        assert_eq!(written.len(), 2);

        let config = load_config(dir.path().join("config.yaml")).unwrap();
        assert_eq!(config.index_path, Some(dir.path().join("index")));
        let template = crate::prompt::load_template(config.template_path.unwrap()).unwrap();
        assert_eq!(template, PromptTemplate::default());

        assert!(init(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_config_round_trips_through_yaml() {
        let config = AwfulRagConfig {
            index_path: Some(PathBuf::from("/tmp/arag-index")),
            ..Default::default()
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: AwfulRagConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }
}
