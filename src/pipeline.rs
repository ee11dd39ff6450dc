//! # Pipeline
//!
//! [`RagPipeline`] wires the stages together and is the only type the CLI talks to.
//!
//! ```text
//! ingest: bytes -> Document -> Chunks -> embed_many -> VectorIndex::add_many -> persist
//! ask:    question -> Retriever -> PromptAssembler -> AnswerGenerator -> Answer
//! ```
//!
//! Every stage gets its own configuration section at construction; nothing reads globals.

use std::{
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::*;

use crate::chunker::Chunker;
use crate::config::AwfulRagConfig;
use crate::document::{Document, TextExtractor, content_id, extractor_for};
use crate::embedding::{Embedder, build_embedder};
use crate::error::{RagError, Result};
use crate::generator::{Answer, AnswerGenerator, LanguageModel, build_language_model};
use crate::history::ConversationHistory;
use crate::index::{IndexStats, VectorIndex};
use crate::prompt::{PromptAssembler, PromptTemplate, load_template};
use crate::retriever::Retriever;

/// What one ingestion did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub document_id: String,
    pub pages: usize,
    pub chunks: usize,
    /// Chunks that overwrote an entry already in the index.
    pub replaced: usize,
}

pub struct RagPipeline {
    config: AwfulRagConfig,
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    retriever: Retriever,
    assembler: PromptAssembler,
    generator: AnswerGenerator,
    history: Mutex<ConversationHistory>,
}

impl RagPipeline {
    /// Build every stage from `config`, including the embedding and language model backends.
    pub async fn from_config(config: AwfulRagConfig) -> Result<Self> {
        config.validate()?;
        let embedder = build_embedder(&config.embedding, config.request_timeout()).await?;
        let model = build_language_model(&config.generation, config.request_timeout())?;
        Self::new(config, embedder, model)
    }

    /// Build the pipeline around the given embedder and language model.
    ///
    /// The index is loaded from `config.index_path` (default `<config_dir>/index`).
    ///
    /// # Errors
    /// - [`RagError::Configuration`] for an invalid config or prompt template.
    /// - [`RagError::DimensionMismatch`] if the embedder, config, and stored index disagree on
    ///   the vector dimension.
    /// - [`RagError::IndexCorrupted`] if the stored index cannot be trusted.
    pub fn new(
        config: AwfulRagConfig,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn LanguageModel>,
    ) -> Result<Self> {
        config.validate()?;
        let chunker = Chunker::new(config.chunking)?;

        let index_path = config.resolved_index_path()?;
        let index = Arc::new(VectorIndex::load(
            &index_path,
            config.embedding.dimension,
            config.retrieval.similarity,
        )?);

        let retriever = Retriever::new(
            Arc::clone(&embedder),
            Arc::clone(&index),
            config.retrieval.clone(),
        )?;

        let template = match &config.template_path {
            Some(path) => load_template(path)?,
            None => PromptTemplate::default(),
        };
        let assembler = PromptAssembler::new(template, config.retrieval.context_token_budget)?;

        info!(
            "Pipeline ready: {} entries in {}, embedder {}, generator {}",
            index.len(),
            index_path.display(),
            embedder.model_name(),
            config.generation.model
        );

        Ok(Self {
            history: Mutex::new(ConversationHistory::new(config.max_history)),
            generator: AnswerGenerator::new(model),
            config,
            chunker,
            embedder,
            index,
            retriever,
            assembler,
        })
    }

    pub fn config(&self) -> &AwfulRagConfig {
        &self.config
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    /// Read `path` and ingest it under its file name.
    pub async fn ingest_file(&self, path: impl AsRef<Path>) -> Result<IngestReport> {
        self.ingest_file_with_progress(path, None, |_, _| {}).await
    }

    /// Read `path` and ingest it under `name`, or under its file name when `name` is `None`.
    ///
    /// PDFs are recognised by their magic bytes; anything else is read as form-feed separated
    /// text. See [`ingest_document_with_progress`](Self::ingest_document_with_progress) for
    /// `on_progress`.
    pub async fn ingest_file_with_progress<F>(
        &self,
        path: impl AsRef<Path>,
        name: Option<&str>,
        on_progress: F,
    ) -> Result<IngestReport>
    where
        F: Fn(usize, usize) + Send + Sync,
    {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        let document = Self::extract(&bytes, name.or(file_name.as_deref()))?;
        self.ingest_document_with_progress(&document, on_progress)
            .await
    }

    /// Extract and ingest raw bytes. Without a `name` the document id is a hash of the bytes.
    pub async fn ingest_bytes(&self, bytes: &[u8], name: Option<&str>) -> Result<IngestReport> {
        let document = Self::extract(bytes, name)?;
        self.ingest_document(&document).await
    }

    fn extract(bytes: &[u8], name: Option<&str>) -> Result<Document> {
        let document_id = match name {
            Some(name) => name.to_string(),
            None => content_id(bytes),
        };
        extractor_for(bytes).extract(bytes, &document_id)
    }

    pub async fn ingest_document(&self, document: &Document) -> Result<IngestReport> {
        self.ingest_document_with_progress(document, |_, _| {}).await
    }

    /// Chunk, embed and index `document`, then persist the index.
    ///
    /// Every chunk is embedded before the first one is added, so a failing embedding service
    /// leaves the index untouched. `on_progress(embedded, total)` is called after each group
    /// of chunks is embedded.
    pub async fn ingest_document_with_progress<F>(
        &self,
        document: &Document,
        on_progress: F,
    ) -> Result<IngestReport>
    where
        F: Fn(usize, usize) + Send + Sync,
    {
        let chunks = self.chunker.chunk(document);
        if chunks.is_empty() {
            return Err(RagError::EmptyDocument(document.id().to_string()));
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let group = self.config.embedding.batch_size * self.config.embedding.max_concurrent_requests;
        let mut vectors = Vec::with_capacity(texts.len());
        for slice in texts.chunks(group.max(1)) {
            vectors.extend(self.embedder.embed_many(slice).await?);
            on_progress(vectors.len(), texts.len());
        }

        if vectors.len() != chunks.len() {
            return Err(RagError::EmbeddingService(format!(
                "expected {} embeddings, got {}",
                chunks.len(),
                vectors.len()
            )));
        }

        let chunk_count = chunks.len();
        let replaced = self.index.add_many(chunks.into_iter().zip(vectors).collect())?;
        self.index.persist()?;

        let report = IngestReport {
            document_id: document.id().to_string(),
            pages: document.pages().len(),
            chunks: chunk_count,
            replaced,
        };
        info!("Ingested {report:?}");
        Ok(report)
    }

    /// Answer `question` from the indexed documents.
    ///
    /// With nothing relevant indexed the answer is the template's cannot-answer text and
    /// carries no citations; that is not an error.
    pub async fn ask(&self, question: &str) -> Result<Answer> {
        let question = question.trim();
        if question.is_empty() {
            return Err(RagError::EmptyQuestion);
        }

        let retrieved = self.retriever.retrieve(question).await?;
        let prompt = self.assembler.assemble(question, &retrieved);
        let answer = self
            .generator
            .generate(&prompt, &self.config.generation)
            .await?;

        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(question, answer.text.clone());
        Ok(answer)
    }

    /// Remove every indexed chunk, on disk too, and forget the conversation.
    pub fn clear(&self) -> Result<()> {
        self.index.clear();
        self.index.persist()?;
        self.clear_history();
        Ok(())
    }

    pub fn clear_history(&self) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn history(&self) -> ConversationHistory {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn stats(&self) -> IndexStats {
        self.index.stats()
    }

    pub fn persist(&self) -> Result<()> {
        self.index.persist()
    }
}
