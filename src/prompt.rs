//! # Prompt assembly
//!
//! Turns a question and its [`RetrievalResult`] into the two messages sent to the language
//! model, plus the [`Citation`] list that maps every `[n]` marker in the prompt back to the
//! chunk it labels.
//!
//! Passages are added in retrieval order, numbered from 1, until the cl100k token budget for
//! context would be exceeded. The first passage is always kept. Only passages that made it into
//! the prompt get a citation, and citations are listed in marker order.
//!
//! ## Template YAML
//!
//! Wording comes from a [`PromptTemplate`], which can be overridden with a YAML file:
//!
//! ```yaml
//! system_prompt: "Answer from the context only. Cite passages as [1], [2]."
//! question_template: |
//!   Context:
//!   {context}
//!
//!   Question: {question}
//! no_context: "No context available."
//! cannot_answer: "The document does not say."
//! ```

use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use tiktoken_rs::{CoreBPE, cl100k_base};
use tracing::*;

use crate::error::{RagError, Result};
use crate::retriever::RetrievalResult;

/// Characters of chunk text kept in a citation snippet.
pub const SNIPPET_CHARS: usize = 200;

const PASSAGE_SEPARATOR: &str = "\n---\n";

/// Wording used to build prompts.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PromptTemplate {
    /// Sent as the system message.
    pub system_prompt: String,

    /// User message. `{context}` and `{question}` are substituted.
    pub question_template: String,

    /// Stands in for `{context}` when nothing was retrieved.
    pub no_context: String,

    /// Returned as the answer, without calling the model, when nothing was retrieved.
    pub cannot_answer: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful assistant that answers questions based on the provided context.\n\
                Answer only from the context. Every passage is labelled with a number in square brackets; \
                cite the passages that support each claim with those markers, for example [1] or [2].\n\
                If the context doesn't contain enough information to answer the question, say so clearly."
                .to_string(),
            question_template: "Context information is below:\n\
                ---------------------\n\
                {context}\n\
                ---------------------\n\n\
                Given the context information above, please answer the following question:\n\
                {question}\n\n\
                If the context contains relevant information, cite the passages that support your answer by their [n] markers.\n\
                If the context doesn't contain the answer, please state that clearly.\n\n\
                Answer:"
                .to_string(),
            no_context: "No context available. The document has no passages relevant to this question."
                .to_string(),
            cannot_answer: "I cannot answer this from the document: no relevant passages were found."
                .to_string(),
        }
    }
}

impl PromptTemplate {
    pub fn validate(&self) -> Result<()> {
        for placeholder in ["{context}", "{question}"] {
            if !self.question_template.contains(placeholder) {
                return Err(RagError::Configuration(format!(
                    "question_template must contain {placeholder}"
                )));
            }
        }
        Ok(())
    }

    fn render(&self, context: &str, question: &str) -> String {
        substitute(
            &self.question_template,
            &[("{context}", context), ("{question}", question)],
        )
    }
}

/// Replace placeholders in one left-to-right pass, so substituted text is never rescanned.
fn substitute(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    'outer: while let Some(pos) = rest.find('{') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        for (name, value) in vars {
            if let Some(after) = rest.strip_prefix(name) {
                out.push_str(value);
                rest = after;
                continue 'outer;
            }
        }
        out.push('{');
        rest = &rest[1..];
    }
    out.push_str(rest);
    out
}

/// Load a prompt template from a YAML file. Missing fields keep their default wording.
pub fn load_template(path: impl AsRef<Path>) -> Result<PromptTemplate> {
    let path = path.as_ref();
    info!("Loading template: {}", path.display());
    let content = fs::read_to_string(path)?;
    let template: PromptTemplate = serde_yaml::from_str(&content)
        .map_err(|e| RagError::Configuration(format!("{}: {e}", path.display())))?;
    template.validate()?;
    Ok(template)
}

/// Source attribution for one passage placed in a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// The `n` of the `[n]` marker labelling the passage.
    pub marker: usize,
    pub document_id: String,
    pub page_number: u32,
    pub chunk_id: String,
    pub snippet: String,
    pub score: f32,
}

/// A prompt ready for the language model.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledPrompt {
    pub system: String,
    pub user: String,
    /// In marker order: `citations[i].marker == i + 1`.
    pub citations: Vec<Citation>,
    /// cl100k tokens spent on passages.
    pub context_tokens: usize,
    /// Returned verbatim when there is no context.
    pub cannot_answer: String,
}

impl AssembledPrompt {
    pub fn has_context(&self) -> bool {
        !self.citations.is_empty()
    }
}

fn snippet(text: &str) -> String {
    let trimmed = text.trim();
    let mut snippet: String = trimmed.chars().take(SNIPPET_CHARS).collect();
    if trimmed.chars().count() > SNIPPET_CHARS {
        snippet.push_str("...");
    }
    snippet
}

pub struct PromptAssembler {
    template: PromptTemplate,
    context_token_budget: usize,
    bpe: CoreBPE,
}

impl PromptAssembler {
    pub fn new(template: PromptTemplate, context_token_budget: usize) -> Result<Self> {
        template.validate()?;
        let bpe = cl100k_base()
            .map_err(|e| RagError::Configuration(format!("loading cl100k tokenizer: {e}")))?;
        Ok(Self {
            template,
            context_token_budget,
            bpe,
        })
    }

    pub fn template(&self) -> &PromptTemplate {
        &self.template
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    /// Build the prompt for `question` from `retrieved`.
    pub fn assemble(&self, question: &str, retrieved: &RetrievalResult) -> AssembledPrompt {
        let mut passages: Vec<String> = Vec::new();
        let mut citations: Vec<Citation> = Vec::new();
        let mut context_tokens = 0;

        for scored in retrieved.iter() {
            let chunk = &scored.chunk;
            let marker = citations.len() + 1;
            let passage = format!(
                "[{marker}] (document: {}, page {})\n{}",
                chunk.document_id,
                chunk.page_number,
                chunk.text.trim()
            );
            let tokens = self.count_tokens(&passage);

            if !citations.is_empty() && context_tokens + tokens > self.context_token_budget {
                debug!(
                    "Context budget of {} tokens reached, dropping {} passages",
                    self.context_token_budget,
                    retrieved.len() - citations.len()
                );
                break;
            }

            context_tokens += tokens;
            passages.push(passage);
            citations.push(Citation {
                marker,
                document_id: chunk.document_id.clone(),
                page_number: chunk.page_number,
                chunk_id: chunk.chunk_id.clone(),
                snippet: snippet(&chunk.text),
                score: scored.score,
            });
        }

        let context = if passages.is_empty() {
            self.template.no_context.clone()
        } else {
            passages.join(PASSAGE_SEPARATOR)
        };

        debug!(
            "Assembled prompt with {} passages ({context_tokens} context tokens)",
            citations.len()
        );

        AssembledPrompt {
            system: self.template.system_prompt.clone(),
            user: self.template.render(&context, question),
            citations,
            context_tokens,
            cannot_answer: self.template.cannot_answer.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::Chunk;
    use crate::retriever::ScoredChunk;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn scored(id: &str, page: u32, text: &str, score: f32) -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                chunk_id: id.to_string(),
                text: text.to_string(),
                document_id: "manual.pdf".to_string(),
                page_number: page,
                start_offset: 0,
                end_offset: text.chars().count(),
                sequence_index: 0,
            },
            score,
        }
    }

    fn result(chunks: Vec<ScoredChunk>) -> RetrievalResult {
        RetrievalResult {
            query: "q".into(),
            chunks,
        }
    }

    #[test]
    fn test_passages_are_numbered_in_retrieval_order() {
        let assembler = PromptAssembler::new(PromptTemplate::default(), 2048).unwrap();
        let retrieved = result(vec![
            scored("c7", 3, "The pump must be primed.", 0.9),
            scored("c2", 1, "Close the valve first.", 0.8),
        ]);

        let prompt = assembler.assemble("How do I start the pump?", &retrieved);

        let first = prompt.user.find("[1] (document: manual.pdf, page 3)").unwrap();
        let second = prompt.user.find("[2] (document: manual.pdf, page 1)").unwrap();
        assert!(first < second);
        assert!(prompt.user.contains("How do I start the pump?"));
        assert!(prompt.user.find("How do I start").unwrap() > second);

        let ids: Vec<_> = prompt.citations.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c7", "c2"]);
        let markers: Vec<_> = prompt.citations.iter().map(|c| c.marker).collect();
        assert_eq!(markers, vec![1, 2]);
        assert!(prompt.has_context());
        assert!(prompt.system.contains("only from the context"));
    }

    #[test]
    fn test_empty_retrieval_signals_no_context() {
        let assembler = PromptAssembler::new(PromptTemplate::default(), 2048).unwrap();
        let prompt = assembler.assemble("anything?", &RetrievalResult::default());
        assert!(!prompt.has_context());
        assert!(prompt.citations.is_empty());
        assert!(prompt.user.contains("No context available"));
        assert_eq!(prompt.context_tokens, 0);
    }

    #[test]
    fn test_budget_drops_trailing_passages() {
        let long = "word ".repeat(600);
        let assembler = PromptAssembler::new(PromptTemplate::default(), 500).unwrap();
        let retrieved = result(vec![
            scored("a", 1, &long, 0.9),
            scored("b", 2, "short", 0.8),
            scored("c", 3, "also short", 0.7),
        ]);
        let prompt = assembler.assemble("q", &retrieved);
        assert_eq!(prompt.citations.len(), 1);
        assert_eq!(prompt.citations[0].chunk_id, "a");
        assert!(!prompt.user.contains("[2]"));
    }

    #[test]
    fn test_first_passage_survives_tiny_budget() {
        let assembler = PromptAssembler::new(PromptTemplate::default(), 1).unwrap();
        let prompt = assembler.assemble("q", &result(vec![scored("a", 1, "some text", 0.5)]));
        assert_eq!(prompt.citations.len(), 1);
        assert!(prompt.context_tokens > 1);
    }

    #[test]
    fn test_snippet_is_truncated() {
        let text = "x".repeat(SNIPPET_CHARS + 50);
        let assembler = PromptAssembler::new(PromptTemplate::default(), 4096).unwrap();
        let prompt = assembler.assemble("q", &result(vec![scored("a", 1, &text, 0.5)]));
        let snippet = &prompt.citations[0].snippet;
        assert_eq!(snippet.chars().count(), SNIPPET_CHARS + 3);
        assert!(snippet.ends_with("..."));
    }

    #[test]
    fn test_substitution_does_not_rescan_values() {
        let out = substitute(
            "{context}|{question}|{other}",
            &[("{context}", "has {question} inside"), ("{question}", "Q")],
        );
        assert_eq!(out, "has {question} inside|Q|{other}");
    }

    #[test]
    fn test_template_requires_placeholders() {
        let template = PromptTemplate {
            question_template: "just {question}".into(),
            ..Default::default()
        };
        assert!(matches!(
            PromptAssembler::new(template, 100),
            Err(RagError::Configuration(_))
        ));
    }

    #[test]
    fn test_load_template_overrides_fields() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
system_prompt: "Be terse."
question_template: "C: {{context}} Q: {{question}}"
"#
        )
        .unwrap();
        let template = load_template(file.path()).unwrap();
        assert_eq!(template.system_prompt, "Be terse.");
        assert_eq!(template.question_template, "C: {context} Q: {question}");
        assert_eq!(template.cannot_answer, PromptTemplate::default().cannot_answer);
    }

    #[test]
    fn test_load_template_missing_file() {
        assert!(matches!(
            load_template("does/not/exist.yaml"),
            Err(RagError::Io(_))
        ));
    }
}
