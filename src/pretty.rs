//! # Pretty printing
//!
//! Terminal rendering for answers, ingestion reports and index statistics.
//!
//! Every function writes to any [`Write`] with crossterm's `queue!`, so the CLI passes
//! `stdout()` and tests pass a `Vec<u8>`.
//!
//! Grounded answers print their text with `[n]` markers highlighted, followed by the sources
//! the text actually cites. An answer produced without context is printed in yellow so it is
//! not mistaken for a failure or a grounded answer.

use crossterm::{
    queue,
    style::{Attribute, Color, Print, ResetColor, SetAttribute, SetForegroundColor},
};
use std::io::Write;

use crate::generator::{Answer, MARKER};
use crate::index::IndexStats;
use crate::pipeline::IngestReport;

fn write_highlighted<W: Write>(out: &mut W, text: &str) -> std::io::Result<()> {
    let mut last = 0;
    for m in MARKER.find_iter(text) {
        queue!(
            out,
            Print(&text[last..m.start()]),
            SetForegroundColor(Color::Cyan),
            Print(m.as_str()),
            ResetColor
        )?;
        last = m.end();
    }
    queue!(out, Print(&text[last..]))
}

pub fn render_answer<W: Write>(out: &mut W, answer: &Answer) -> std::io::Result<()> {
    if !answer.grounded {
        queue!(
            out,
            SetForegroundColor(Color::Yellow),
            Print(&answer.text),
            Print("\n"),
            ResetColor
        )?;
        return out.flush();
    }

    write_highlighted(out, &answer.text)?;
    queue!(out, Print("\n"))?;

    let cited = answer.cited();
    if !cited.is_empty() {
        queue!(
            out,
            Print("\n"),
            SetAttribute(Attribute::Bold),
            Print("Sources\n"),
            SetAttribute(Attribute::Reset)
        )?;
        for citation in cited {
            queue!(
                out,
                SetForegroundColor(Color::Cyan),
                Print(format!("[{}] ", citation.marker)),
                ResetColor,
                Print(format!(
                    "{}, page {} ({:.2})\n",
                    citation.document_id, citation.page_number, citation.score
                )),
                SetForegroundColor(Color::DarkGrey),
                Print(format!("    {}\n", citation.snippet.replace('\n', " "))),
                ResetColor
            )?;
        }
    }

    let unknown = answer.unknown_markers();
    if !unknown.is_empty() {
        queue!(
            out,
            SetForegroundColor(Color::Yellow),
            Print(format!(
                "Note: the answer refers to {unknown:?}, which match no retrieved passage.\n"
            )),
            ResetColor
        )?;
    }
    out.flush()
}

pub fn render_report<W: Write>(out: &mut W, report: &IngestReport) -> std::io::Result<()> {
    queue!(
        out,
        SetForegroundColor(Color::Green),
        Print(format!("Ingested {}", report.document_id)),
        ResetColor,
        Print(format!(
            ": {} pages, {} chunks",
            report.pages, report.chunks
        ))
    )?;
    if report.replaced > 0 {
        queue!(out, Print(format!(" ({} replaced)", report.replaced)))?;
    }
    queue!(out, Print("\n"))?;
    out.flush()
}

pub fn render_stats<W: Write>(out: &mut W, stats: &IndexStats) -> std::io::Result<()> {
    queue!(
        out,
        SetAttribute(Attribute::Bold),
        Print("Index\n"),
        SetAttribute(Attribute::Reset),
        Print(format!("  entries:    {}\n", stats.entries)),
        Print(format!("  dimension:  {}\n", stats.dimension)),
        Print(format!("  similarity: {}\n", stats.similarity)),
        Print(format!("  documents:  {}\n", stats.documents.len()))
    )?;
    for document in &stats.documents {
        queue!(out, Print(format!("    - {document}\n")))?;
    }
    out.flush()
}

pub fn render_error<W: Write>(out: &mut W, message: &str) -> std::io::Result<()> {
    queue!(
        out,
        SetForegroundColor(Color::Red),
        Print(message),
        Print("\n"),
        ResetColor
    )?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Similarity;
    use crate::prompt::Citation;

    fn citation(marker: usize, page: u32) -> Citation {
        Citation {
            marker,
            document_id: "manual.txt".into(),
            page_number: page,
            chunk_id: format!("manual.txt_chunk_{marker}"),
            snippet: "Bleed the radiator\nevery spring.".into(),
            score: 0.83,
        }
    }

    fn rendered(f: impl FnOnce(&mut Vec<u8>) -> std::io::Result<()>) -> String {
        let mut buf = Vec::new();
        f(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_grounded_answer_lists_cited_sources_only() {
        let answer = Answer {
            text: "Bleed it yearly [2].".into(),
            citations: vec![citation(1, 3), citation(2, 7)],
            grounded: true,
        };
        let out = rendered(|w| render_answer(w, &answer));
        assert!(out.contains("Bleed it yearly "));
        assert!(out.contains("[2]"));
        assert!(out.contains("Sources"));
        assert!(out.contains("manual.txt, page 7 (0.83)"));
        assert!(!out.contains("page 3"));
        assert!(out.contains("Bleed the radiator every spring."));
    }

    #[test]
    fn test_unknown_markers_are_flagged() {
        let answer = Answer {
            text: "Made up [9].".into(),
            citations: vec![citation(1, 1)],
            grounded: true,
        };
        let out = rendered(|w| render_answer(w, &answer));
        assert!(out.contains("[9]"));
        assert!(out.contains("match no retrieved passage"));
    }

    #[test]
    fn test_ungrounded_answer_has_no_sources() {
        let answer = Answer {
            text: "I cannot answer this from the document.".into(),
            citations: Vec::new(),
            grounded: false,
        };
        let out = rendered(|w| render_answer(w, &answer));
        assert!(out.contains("I cannot answer this from the document."));
        assert!(!out.contains("Sources"));
    }

    #[test]
    fn test_report_and_stats() {
        let report = IngestReport {
            document_id: "manual.txt".into(),
            pages: 4,
            chunks: 9,
            replaced: 2,
        };
        let out = rendered(|w| render_report(w, &report));
        assert!(out.contains("Ingested manual.txt"));
        assert!(out.contains("4 pages, 9 chunks (2 replaced)"));

        let stats = IndexStats {
            entries: 9,
            documents: vec!["manual.txt".into()],
            dimension: 384,
            similarity: Similarity::Cosine,
        };
        let out = rendered(|w| render_stats(w, &stats));
        assert!(out.contains("entries:    9"));
        assert!(out.contains("similarity: cosine"));
        assert!(out.contains("- manual.txt"));
    }
}
