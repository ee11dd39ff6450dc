//! # Awful RAG (library root)
//!
//! Ask questions about a document and get answers grounded in its text, with citations back to
//! the pages they came from. Everything runs against local services: embeddings are computed
//! in-process with Candle (or by an OpenAI-compatible server), answers come from Ollama.
//!
//! The crate is laid out one stage per module, leaves first:
//!
//! - [`document`]: extracted text as pages of spans, and the plain-text extractor.
//! - [`chunker`]: overlapping fixed-size windows with page provenance.
//! - [`embedding`]: the [`Embedder`](embedding::Embedder) capability and its backends.
//! - [`index`]: the persisted, exact nearest-neighbour [`VectorIndex`](index::VectorIndex).
//! - [`retriever`] and [`prompt`]: question to retrieved chunks to a cited prompt.
//! - [`generator`]: the [`LanguageModel`](generator::LanguageModel) capability and
//!   [`Answer`](generator::Answer)s.
//! - [`pipeline`]: [`RagPipeline`](pipeline::RagPipeline), which runs the stages in order.
//!
//! Supporting modules: [`config`] (YAML configuration), [`error`], [`history`], and the CLI
//! pieces [`commands`] (argument parsing) and [`pretty`] (terminal rendering).
//!
//! ## Quick start
//!
//! ```no_run
//! use awful_rag::{config::AwfulRagConfig, pipeline::RagPipeline};
//!
//! # async fn run() -> awful_rag::error::Result<()> {
//! let pipeline = RagPipeline::from_config(AwfulRagConfig::default()).await?;
//! pipeline.ingest_file("manual.txt").await?;
//! let answer = pipeline.ask("How often should the filter be replaced?").await?;
//! println!("{}", answer.text);
//! for citation in &answer.citations {
//!     println!("[{}] {} p.{}", citation.marker, citation.document_id, citation.page_number);
//! }
//! # Ok(()) }
//! ```

use directories::ProjectDirs;
use std::path::PathBuf;

pub mod chunker;
pub mod commands;
pub mod config;
pub mod document;
pub mod embedding;
pub mod error;
pub mod generator;
pub mod history;
pub mod index;
pub mod pipeline;
pub mod pretty;
pub mod prompt;
pub mod retriever;

use error::{RagError, Result};

/// Return the per-platform configuration directory used by `arag`.
///
/// This uses [`directories::ProjectDirs`] with the application triple
/// `("com", "awful-sec", "arag")`, e.g. `~/.config/arag` on Linux and
/// `~/Library/Application Support/com.awful-sec.arag` on macOS.
///
/// The directory is **not** created by this function.
///
/// # Examples
/// ```no_run
/// let cfg = awful_rag::config_dir().expect("has a config dir");
/// println!("config at {}", cfg.display());
/// ```
pub fn config_dir() -> Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("com", "awful-sec", "arag").ok_or_else(|| {
        RagError::Configuration("Unable to determine config directory".to_string())
    })?;
    Ok(proj_dirs.config_dir().to_path_buf())
}
