//! Documents as the chunker sees them: an identifier plus ordered pages of text spans.
//!
//! Byte-level extraction sits behind the [`TextExtractor`] trait. Two extractors ship:
//!
//! - [`PdfExtractor`]: the text layer of a PDF, one page per PDF page, via `pdf-extract`.
//! - [`PlainTextExtractor`]: UTF-8 text in which pages are separated by form feeds, which is
//!   what `pdftotext` writes.
//!
//! [`extractor_for`] picks between them from the leading bytes.

use serde::{Deserialize, Serialize};
use tracing::*;

use crate::error::{RagError, Result};

/// Page separator emitted by `pdftotext`.
pub const PAGE_SEPARATOR: char = '\x0C';

/// One page of extracted text. `number` starts at 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub number: u32,
    pub spans: Vec<String>,
}

impl Page {
    pub fn new(number: u32, spans: Vec<String>) -> Self {
        Self { number, spans }
    }

    /// The page's spans concatenated in order, with no separator.
    pub fn text(&self) -> String {
        self.spans.concat()
    }

    /// `true` when the page holds nothing but whitespace.
    pub fn is_blank(&self) -> bool {
        self.spans.iter().all(|span| span.trim().is_empty())
    }
}

/// An extracted document. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    id: String,
    pages: Vec<Page>,
}

impl Document {
    pub fn new(id: impl Into<String>, pages: Vec<Page>) -> Self {
        Self {
            id: id.into(),
            pages,
        }
    }

    /// Builds a document from `(page_number, text)` pairs, one span per page.
    pub fn from_pages<I, S>(id: impl Into<String>, pages: I) -> Self
    where
        I: IntoIterator<Item = (u32, S)>,
        S: Into<String>,
    {
        let pages = pages
            .into_iter()
            .map(|(number, text)| Page::new(number, vec![text.into()]))
            .collect();
        Self::new(id, pages)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    /// Total characters across every page.
    pub fn char_count(&self) -> usize {
        self.pages
            .iter()
            .flat_map(|p| p.spans.iter())
            .map(|s| s.chars().count())
            .sum()
    }
}

/// Stable identifier derived from document bytes: the first 16 hex chars of their SHA-256.
pub fn content_id(bytes: &[u8]) -> String {
    let digest = sha256::digest(bytes);
    digest[..16].to_string()
}

/// Turns raw document bytes into pages of text.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8], document_id: &str) -> Result<Document>;
}

/// Extractor for UTF-8 text with form-feed page breaks.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, bytes: &[u8], document_id: &str) -> Result<Document> {
        let text = std::str::from_utf8(bytes).map_err(|e| {
            RagError::UnsupportedDocument(format!("{document_id} is not valid UTF-8 text: {e}"))
        })?;

        // A trailing form feed closes the last page rather than opening an empty one.
        let text = text.strip_suffix(PAGE_SEPARATOR).unwrap_or(text);

        let pages = text
            .split(PAGE_SEPARATOR)
            .zip(1u32..)
            .map(|(page, number)| (number, page));

        Ok(Document::from_pages(document_id, pages))
    }
}

/// Extractor for PDF files with a text layer. Scanned pages come back blank.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfExtractor;

impl TextExtractor for PdfExtractor {
    fn extract(&self, bytes: &[u8], document_id: &str) -> Result<Document> {
        // pdf-extract panics on some malformed font programs instead of returning an error.
        let pages = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem_by_pages(bytes))
            .map_err(|_| {
                RagError::UnsupportedDocument(format!("{document_id}: PDF text extraction failed"))
            })?
            .map_err(|e| RagError::UnsupportedDocument(format!("{document_id}: {e}")))?;

        debug!("Extracted {} PDF pages from {document_id}", pages.len());
        Ok(Document::from_pages(document_id, (1u32..).zip(pages)))
    }
}

/// Magic number every PDF file starts with.
pub const PDF_MAGIC: &[u8] = b"%PDF-";

/// The extractor able to read `bytes`: [`PdfExtractor`] for PDFs, [`PlainTextExtractor`]
/// otherwise.
pub fn extractor_for(bytes: &[u8]) -> &'static dyn TextExtractor {
    if bytes.starts_with(PDF_MAGIC) {
        &PdfExtractor
    } else {
        &PlainTextExtractor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_feeds_split_pages() {
        let doc = PlainTextExtractor
            .extract(b"first page\x0Csecond page\x0C", "report.txt")
            .unwrap();
        assert_eq!(doc.id(), "report.txt");
        assert_eq!(doc.pages().len(), 2);
        assert_eq!(doc.pages()[0].number, 1);
        assert_eq!(doc.pages()[0].text(), "first page");
        assert_eq!(doc.pages()[1].number, 2);
        assert_eq!(doc.pages()[1].text(), "second page");
    }

    #[test]
    fn test_text_without_separator_is_one_page() {
        let doc = PlainTextExtractor.extract(b"just text", "a").unwrap();
        assert_eq!(doc.pages().len(), 1);
        assert_eq!(doc.char_count(), 9);
    }

    #[test]
    fn test_empty_pages_are_kept_in_numbering() {
        let doc = PlainTextExtractor.extract(b"one\x0C\x0Cthree", "a").unwrap();
        assert_eq!(doc.pages().len(), 3);
        assert!(doc.pages()[1].is_blank());
        assert_eq!(doc.pages()[2].number, 3);
    }

    #[test]
    fn test_invalid_utf8_is_unsupported() {
        let err = PlainTextExtractor
            .extract(&[0xff, 0xfe, 0x00], "blob.bin")
            .unwrap_err();
        assert!(matches!(err, RagError::UnsupportedDocument(_)));
    }

    #[test]
    fn test_content_id_is_stable() {
        let a = content_id(b"same bytes");
        let b = content_id(b"same bytes");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, content_id(b"other bytes"));
    }

    #[test]
    fn test_page_text_concatenates_spans() {
        let page = Page::new(4, vec!["ab".into(), "cd".into()]);
        assert_eq!(page.text(), "abcd");
        assert!(!page.is_blank());
        assert!(Page::new(1, vec![" \n".into()]).is_blank());
    }

    /// A minimal PDF with one Helvetica text line per page.
    fn pdf_with_pages(pages: &[&str]) -> Vec<u8> {
        let mut objects = vec![
            "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
            format!(
                "<< /Type /Pages /Kids [{}] /Count {} >>",
                (0..pages.len())
                    .map(|i| format!("{} 0 R", 4 + 2 * i))
                    .collect::<Vec<_>>()
                    .join(" "),
                pages.len()
            ),
            "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string(),
        ];
        for (i, text) in pages.iter().enumerate() {
            objects.push(format!(
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] \
                 /Resources << /Font << /F1 3 0 R >> >> /Contents {} 0 R >>",
                5 + 2 * i
            ));
            let content = format!("BT /F1 12 Tf 72 720 Td ({text}) Tj ET");
            objects.push(format!(
                "<< /Length {} >>\nstream\n{content}\nendstream",
                content.len()
            ));
        }

        let mut out = b"%PDF-1.4\n".to_vec();
        let mut offsets = Vec::new();
        for (i, object) in objects.iter().enumerate() {
            offsets.push(out.len());
            out.extend(format!("{} 0 obj\n{object}\nendobj\n", i + 1).into_bytes());
        }
        let xref = out.len();
        out.extend(format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1).into_bytes());
        for offset in offsets {
            out.extend(format!("{offset:010} 00000 n \n").into_bytes());
        }
        out.extend(
            format!(
                "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref}\n%%EOF\n",
                objects.len() + 1
            )
            .into_bytes(),
        );
        out
    }

    #[test]
    fn test_pdf_pages_are_extracted_in_order() {
        let bytes = pdf_with_pages(&["Replace the filter yearly", "Bleed the radiators"]);
        let doc = PdfExtractor.extract(&bytes, "manual.pdf").unwrap();
        assert_eq!(doc.id(), "manual.pdf");
        assert_eq!(doc.pages().len(), 2);
        assert_eq!(doc.pages()[0].number, 1);
        assert!(doc.pages()[0].text().contains("filter"));
        assert_eq!(doc.pages()[1].number, 2);
        assert!(doc.pages()[1].text().contains("radiators"));
    }

    #[test]
    fn test_truncated_pdf_is_unsupported() {
        let bytes = pdf_with_pages(&["cut short"]);
        let err = PdfExtractor.extract(&bytes[..40], "broken.pdf").unwrap_err();
        assert!(matches!(err, RagError::UnsupportedDocument(_)));
    }

    #[test]
    fn test_extractor_is_chosen_by_magic_bytes() {
        let pdf = pdf_with_pages(&["Some words on a page"]);
        let doc = extractor_for(&pdf).extract(&pdf, "a.pdf").unwrap();
        assert!(doc.pages()[0].text().contains("words"));

        let doc = extractor_for(b"plain\x0Ctext").extract(b"plain\x0Ctext", "a.txt").unwrap();
        assert_eq!(doc.pages().len(), 2);
    }
}
