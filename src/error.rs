//! # Error taxonomy
//!
//! Every fallible operation in the crate returns [`Result<T>`], whose error side is
//! [`RagError`]. The variants mirror the failure classes of the pipeline:
//!
//! | Variant | Raised by | Recovery |
//! |---|---|---|
//! | [`RagError::Configuration`] | config validation, chunker/assembler construction | fix the config; nothing was ingested |
//! | [`RagError::EmbeddingService`] | [`Embedder`](crate::embedding::Embedder) implementations | per request; the index is untouched |
//! | [`RagError::GenerationService`] | [`LanguageModel`](crate::generator::LanguageModel) implementations | per request |
//! | [`RagError::DimensionMismatch`] | [`VectorIndex::add`](crate::index::VectorIndex::add), index loading | the offending entry is rejected |
//! | [`RagError::IndexCorrupted`] | [`VectorIndex::load`](crate::index::VectorIndex::load) | `clear` and re-ingest the source documents |
//!
//! Nothing here is retried automatically.

use thiserror::Error;

/// Errors produced by the retrieval-augmented generation pipeline.
#[derive(Debug, Error)]
pub enum RagError {
    /// Invalid or missing configuration (chunk sizing, model names, budgets).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The embedding backend was unreachable, timed out, or returned malformed output.
    #[error("embedding service error: {0}")]
    EmbeddingService(String),

    /// The language-model backend was unreachable, timed out, or returned an empty/error response.
    #[error("generation service error: {0}")]
    GenerationService(String),

    /// A vector's length does not match the dimension fixed for the index.
    #[error("dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Persisted index state could not be trusted.
    #[error("index corrupted: {0}")]
    IndexCorrupted(String),

    /// A document produced no chunkable text.
    #[error("no text could be extracted from document '{0}'")]
    EmptyDocument(String),

    /// Document bytes were not in a supported text format.
    #[error("unsupported document: {0}")]
    UnsupportedDocument(String),

    /// The question was empty after trimming.
    #[error("question is empty")]
    EmptyQuestion,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, RagError>;

impl RagError {
    /// `true` for failures of an external service (embedding or generation backend).
    pub fn is_service_error(&self) -> bool {
        matches!(
            self,
            RagError::EmbeddingService(_) | RagError::GenerationService(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_dimensions() {
        let err = RagError::DimensionMismatch {
            expected: 384,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "dimension mismatch: index expects 384, got 3"
        );
    }

    #[test]
    fn test_service_errors_are_classified() {
        assert!(RagError::EmbeddingService("down".into()).is_service_error());
        assert!(RagError::GenerationService("down".into()).is_service_error());
        assert!(!RagError::IndexCorrupted("bad".into()).is_service_error());
        assert!(!RagError::EmptyQuestion.is_service_error());
    }

    #[test]
    fn test_io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: RagError = io.into();
        assert!(matches!(err, RagError::Io(_)));
    }
}
