//! Query-side retrieval: embed the question, ask the index for its nearest chunks.

use std::sync::Arc;
use tracing::*;

use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::error::{RagError, Result};
use crate::index::VectorIndex;

pub use crate::index::ScoredChunk;

/// Chunks retrieved for one query, most similar first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalResult {
    pub query: String,
    pub chunks: Vec<ScoredChunk>,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScoredChunk> {
        self.chunks.iter()
    }
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    config: RetrievalConfig,
}

impl Retriever {
    /// Pairs an embedder with an index. Their dimensions have to agree.
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<VectorIndex>,
        config: RetrievalConfig,
    ) -> Result<Self> {
        if embedder.dimension() != index.dimension() {
            return Err(RagError::DimensionMismatch {
                expected: index.dimension(),
                actual: embedder.dimension(),
            });
        }
        Ok(Self {
            embedder,
            index,
            config,
        })
    }

    pub fn top_k(&self) -> usize {
        self.config.top_k
    }

    /// Retrieve the configured `top_k` chunks for `query_text`.
    pub async fn retrieve(&self, query_text: &str) -> Result<RetrievalResult> {
        self.retrieve_k(query_text, self.config.top_k).await
    }

    /// Retrieve up to `k` chunks for `query_text`, dropping any that score below
    /// `min_similarity` when one is configured.
    ///
    /// An empty index gives an empty result, not an error.
    pub async fn retrieve_k(&self, query_text: &str, k: usize) -> Result<RetrievalResult> {
        if self.index.is_empty() {
            debug!("Index is empty, nothing to retrieve");
            return Ok(RetrievalResult {
                query: query_text.to_string(),
                chunks: Vec::new(),
            });
        }

        let query_vector = self.embedder.embed(query_text).await?;
        let mut chunks = self.index.query(&query_vector, k)?;

        if let Some(threshold) = self.config.min_similarity {
            let before = chunks.len();
            chunks.retain(|c| c.score >= threshold);
            if chunks.len() < before {
                debug!(
                    "Dropped {} chunks below similarity {threshold}",
                    before - chunks.len()
                );
            }
        }

        for scored in &chunks {
            debug!(
                chunk = %scored.chunk.chunk_id,
                page = scored.chunk.page_number,
                score = scored.score,
                "Retrieved"
            );
        }
        info!("Retrieved {} chunks", chunks.len());

        Ok(RetrievalResult {
            query: query_text.to_string(),
            chunks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{Chunker, ChunkingConfig};
    use crate::document::Document;
    use crate::embedding::HashingEmbedder;
    use crate::index::Similarity;

    async fn filled_index(embedder: &HashingEmbedder) -> Arc<VectorIndex> {
        let index = Arc::new(VectorIndex::new(embedder.dimension(), Similarity::Cosine));
        let doc = Document::from_pages(
            "animals",
            [
                (1, "Cats purr and sleep all day."),
                (2, "Dogs bark at the mail carrier."),
                (3, "Parrots can mimic human speech."),
            ],
        );
        let chunker = Chunker::new(ChunkingConfig {
            chunk_size: 200,
            chunk_overlap: 20,
        })
        .unwrap();
        for chunk in chunker.chunk(&doc) {
            let vector = embedder.embed(&chunk.text).await.unwrap();
            index.add(chunk, vector).unwrap();
        }
        index
    }

    #[tokio::test]
    async fn test_retrieves_the_matching_page_first() {
        let embedder = HashingEmbedder::new(256);
        let index = filled_index(&embedder).await;
        let retriever =
            Retriever::new(Arc::new(embedder), index, RetrievalConfig::default()).unwrap();

        let result = retriever.retrieve("why do dogs bark").await.unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result.chunks[0].chunk.page_number, 2);
        assert_eq!(result.query, "why do dogs bark");
    }

    #[tokio::test]
    async fn test_k_limits_results() {
        let embedder = HashingEmbedder::new(256);
        let index = filled_index(&embedder).await;
        let retriever =
            Retriever::new(Arc::new(embedder), index, RetrievalConfig::default()).unwrap();
        assert_eq!(retriever.retrieve_k("cats", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_index_gives_empty_result() {
        let embedder = Arc::new(HashingEmbedder::new(16));
        let index = Arc::new(VectorIndex::new(16, Similarity::Cosine));
        let retriever = Retriever::new(embedder, index, RetrievalConfig::default()).unwrap();
        let result = retriever.retrieve("anything").await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_min_similarity_filters() {
        let embedder = HashingEmbedder::new(256);
        let index = filled_index(&embedder).await;
        let config = RetrievalConfig {
            min_similarity: Some(0.99),
            ..Default::default()
        };
        let retriever = Retriever::new(Arc::new(embedder), index, config).unwrap();

        let exact = retriever
            .retrieve("Parrots can mimic human speech.")
            .await
            .unwrap();
        assert_eq!(exact.len(), 1);
        assert_eq!(exact.chunks[0].chunk.page_number, 3);

        let unrelated = retriever.retrieve("quantum chromodynamics").await.unwrap();
        assert!(unrelated.is_empty());
    }

    #[test]
    fn test_dimension_disagreement_is_rejected() {
        let result = Retriever::new(
            Arc::new(HashingEmbedder::new(8)),
            Arc::new(VectorIndex::new(16, Similarity::Cosine)),
            RetrievalConfig::default(),
        );
        assert!(matches!(result, Err(RagError::DimensionMismatch { .. })));
    }
}
