//! Fixed-size, overlapping text windows with page provenance.
//!
//! Each page is chunked on its own, so a chunk never spans two pages. Offsets and sizes are
//! counted in characters (Unicode scalar values), never bytes, so multi-byte text is never split
//! inside a character.

use serde::{Deserialize, Serialize};
use tracing::*;

use crate::document::Document;
use crate::error::{RagError, Result};

/// Window sizing, in characters.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RagError::Configuration(
                "chunking.chunk_size must be greater than zero".into(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(RagError::Configuration(format!(
                "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }

    /// Characters the window advances per step.
    pub fn step(&self) -> usize {
        self.chunk_size - self.chunk_overlap
    }
}

/// A slice of one page of one document.
///
/// `start_offset..end_offset` is the character range within the page's text.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub chunk_id: String,
    pub text: String,
    pub document_id: String,
    pub page_number: u32,
    pub start_offset: usize,
    pub end_offset: usize,
    /// Position among all chunks of the same document, starting at 0.
    pub sequence_index: usize,
}

impl Chunk {
    /// `{document_id}_chunk_{sequence_index}`; unique as long as document ids are.
    pub fn make_id(document_id: &str, sequence_index: usize) -> String {
        format!("{document_id}_chunk_{sequence_index}")
    }

    pub fn char_len(&self) -> usize {
        self.end_offset - self.start_offset
    }
}

/// Splits documents into [`Chunk`]s. Construction validates the sizing, so a `Chunker` that
/// exists can always chunk.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Chunk every page of `document`, in page order.
    ///
    /// Blank pages (empty or whitespace only) contribute no chunks.
    pub fn chunk(&self, document: &Document) -> Vec<Chunk> {
        let mut chunks = Vec::new();

        for page in document.pages() {
            if page.is_blank() {
                debug!(
                    document = document.id(),
                    page = page.number,
                    "Skipping blank page"
                );
                continue;
            }

            let chars: Vec<char> = page.text().chars().collect();
            for (start, end) in self.windows(chars.len()) {
                let sequence_index = chunks.len();
                chunks.push(Chunk {
                    chunk_id: Chunk::make_id(document.id(), sequence_index),
                    text: chars[start..end].iter().collect(),
                    document_id: document.id().to_string(),
                    page_number: page.number,
                    start_offset: start,
                    end_offset: end,
                    sequence_index,
                });
            }
        }

        info!(
            document = document.id(),
            pages = document.pages().len(),
            chunks = chunks.len(),
            "Chunked document"
        );
        chunks
    }

    /// Character ranges for a text of `len` characters.
    fn windows(&self, len: usize) -> Vec<(usize, usize)> {
        let size = self.config.chunk_size;
        let step = self.config.step();
        let mut ranges = Vec::new();
        let mut start = 0;

        while start < len {
            if len - start <= size {
                ranges.push((start, len));
                break;
            }
            ranges.push((start, start + size));
            start += step;
        }
        ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Page;
    use proptest::prelude::*;

    fn chunker(size: usize, overlap: usize) -> Chunker {
        Chunker::new(ChunkingConfig {
            chunk_size: size,
            chunk_overlap: overlap,
        })
        .unwrap()
    }

    #[test]
    fn test_2500_chars_gives_three_chunks() {
        let text: String = (0..2500).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let doc = Document::from_pages("doc", [(1, text)]);

        let chunks = chunker(1000, 200).chunk(&doc);

        let ranges: Vec<_> = chunks
            .iter()
            .map(|c| (c.start_offset, c.end_offset))
            .collect();
        assert_eq!(ranges, vec![(0, 1000), (800, 1800), (1600, 2500)]);
        assert_eq!(chunks[2].text.chars().count(), 900);
        assert_eq!(chunks[1].chunk_id, "doc_chunk_1");
    }

    #[test]
    fn test_short_page_is_one_chunk() {
        let doc = Document::from_pages("doc", [(1, "tiny page")]);
        let chunks = chunker(1000, 200).chunk(&doc);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "tiny page");
        assert_eq!(chunks[0].page_number, 1);
    }

    #[test]
    fn test_empty_and_blank_pages_yield_nothing() {
        let doc = Document::from_pages("doc", [(1, ""), (2, "  \n\t"), (3, "content")]);
        let chunks = chunker(10, 2).chunk(&doc);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].page_number, 3);
        assert_eq!(chunks[0].sequence_index, 0);
    }

    #[test]
    fn test_chunks_never_cross_pages() {
        let doc = Document::from_pages("doc", [(1, "abcdefghij"), (2, "klmno")]);
        let chunks = chunker(8, 3).chunk(&doc);
        let texts: Vec<_> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["abcdefgh", "fghij", "klmno"]);
        let sequence: Vec<_> = chunks.iter().map(|c| c.sequence_index).collect();
        assert_eq!(sequence, vec![0, 1, 2]);
        assert_eq!(chunks[2].page_number, 2);
        assert_eq!(chunks[2].start_offset, 0);
    }

    #[test]
    fn test_exact_fit_emits_single_chunk() {
        let doc = Document::from_pages("doc", [(1, "x".repeat(10))]);
        assert_eq!(chunker(10, 4).chunk(&doc).len(), 1);
    }

    #[test]
    fn test_spans_are_concatenated() {
        let doc = Document::new("doc", vec![Page::new(1, vec!["hello ".into(), "world".into()])]);
        let chunks = chunker(100, 10).chunk(&doc);
        assert_eq!(chunks[0].text, "hello world");
    }

    #[test]
    fn test_multibyte_text_is_counted_in_chars() {
        let doc = Document::from_pages("doc", [(1, "ééééé")]);
        let chunks = chunker(3, 1).chunk(&doc);
        assert_eq!(chunks[0].text, "ééé");
        assert_eq!(chunks[1].text, "ééé");
        assert_eq!(chunks[1].start_offset, 2);
    }

    #[test]
    fn test_invalid_sizing_fails_fast() {
        let err = Chunker::new(ChunkingConfig {
            chunk_size: 100,
            chunk_overlap: 100,
        })
        .unwrap_err();
        assert!(matches!(err, RagError::Configuration(_)));

        assert!(
            Chunker::new(ChunkingConfig {
                chunk_size: 0,
                chunk_overlap: 0,
            })
            .is_err()
        );
    }

    proptest! {
        #[test]
        fn prop_chunks_reconstruct_each_page(
            pages in prop::collection::vec("[a-zé ]{0,300}[a-z]", 1..4),
            size in 1usize..80,
            overlap_seed in 0usize..80,
        ) {
            let overlap = overlap_seed % size;
            let doc = Document::from_pages(
                "prop",
                pages.iter().cloned().zip(1u32..).map(|(t, n)| (n, t)),
            );
            let chunks = chunker(size, overlap).chunk(&doc);

            for (page, number) in pages.iter().zip(1u32..) {
                let on_page: Vec<&Chunk> =
                    chunks.iter().filter(|c| c.page_number == number).collect();
                prop_assert!(!on_page.is_empty());

                let mut rebuilt = String::new();
                for (i, chunk) in on_page.iter().enumerate() {
                    let len = chunk.text.chars().count();
                    prop_assert!(len <= size);
                    prop_assert!(len > 0);
                    prop_assert_eq!(len, chunk.char_len());

                    if i == 0 {
                        rebuilt.push_str(&chunk.text);
                    } else {
                        let prev = on_page[i - 1];
                        prop_assert_eq!(prev.end_offset - chunk.start_offset, overlap);
                        rebuilt.extend(chunk.text.chars().skip(overlap));
                    }
                    if i + 1 < on_page.len() {
                        prop_assert_eq!(len, size);
                    }
                }
                prop_assert_eq!(&rebuilt, page);
            }
        }
    }
}
