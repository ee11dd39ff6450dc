//! # Answer generation
//!
//! Sends an [`AssembledPrompt`] to a language model and pairs the reply with the prompt's
//! citations.
//!
//! The model is a capability, [`LanguageModel`], with two HTTP implementations:
//!
//! - [`OllamaChatModel`]: Ollama's native `POST /api/chat`, non-streaming, with
//!   `options.temperature` and `options.num_predict`.
//! - [`OpenAiChatModel`]: any OpenAI-compatible chat-completions endpoint via `async-openai`.
//!
//! Citations are never re-derived from the model's output. The generator returns exactly the
//! list the assembler produced; [`Answer::unknown_markers`] reports any `[n]` the model made up.

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, sync::Arc, time::Duration};
use tracing::*;

pub use crate::config::GenerationConfig;
use crate::config::GenerationBackend;
use crate::embedding::openai_client;
use crate::error::{RagError, Result};
use crate::prompt::{AssembledPrompt, Citation};

pub(crate) static MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(\d+)\]").unwrap());

fn generation_err(e: impl Display) -> RagError {
    RagError::GenerationService(e.to_string())
}

/// One request to a language model.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Capability: prompt in, text out.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Run one completion. Implementations fail with [`RagError::GenerationService`] when the
    /// service is unreachable, times out, or answers with an error.
    async fn complete(&self, request: &ChatRequest) -> Result<String>;

    /// Backend name, for logs.
    fn backend(&self) -> &'static str;
}

/// Build the language model selected by `config.backend`.
pub fn build_language_model(
    config: &GenerationConfig,
    request_timeout: Duration,
) -> Result<Arc<dyn LanguageModel>> {
    info!(backend = ?config.backend, model = %config.model, "Building language model");
    let model: Arc<dyn LanguageModel> = match config.backend {
        GenerationBackend::Ollama => {
            Arc::new(OllamaChatModel::new(&config.api_base, request_timeout)?)
        }
        GenerationBackend::OpenAi => Arc::new(OpenAiChatModel::new(config, request_timeout)?),
    };
    Ok(model)
}

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| RagError::Configuration(format!("HTTP client: {e}")))
}

#[derive(Serialize)]
struct OllamaMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaResponseMessage,
}

#[derive(Deserialize)]
struct OllamaResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct OllamaTags {
    models: Vec<OllamaModel>,
}

#[derive(Deserialize)]
struct OllamaModel {
    name: String,
}

/// Ollama's native chat API.
pub struct OllamaChatModel {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaChatModel {
    /// `base_url` is the server root, e.g. `http://localhost:11434`.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(request_timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Names of the models the server has pulled.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        debug!("GET {url}");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(generation_err)?;
        let status = response.status();
        if !status.is_success() {
            return Err(RagError::GenerationService(format!(
                "{url} returned {status}"
            )));
        }
        let tags: OllamaTags = response.json().await.map_err(generation_err)?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Whether any pulled model's name contains `model`, so `llama3` matches `llama3:latest`.
    pub async fn is_model_available(&self, model: &str) -> Result<bool> {
        Ok(self
            .list_models()
            .await?
            .iter()
            .any(|name| name.contains(model)))
    }
}

#[async_trait]
impl LanguageModel for OllamaChatModel {
    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);
        let body = OllamaChatRequest {
            model: &request.model,
            messages: vec![
                OllamaMessage {
                    role: "system",
                    content: &request.system,
                },
                OllamaMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            stream: false,
            options: OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(generation_err)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(RagError::GenerationService(format!(
                "{url} returned {status}: {detail}"
            )));
        }

        let reply: OllamaChatResponse = response.json().await.map_err(generation_err)?;
        Ok(reply.message.content)
    }

    fn backend(&self) -> &'static str {
        "ollama"
    }
}

/// OpenAI-compatible chat completions.
pub struct OpenAiChatModel {
    client: Client<OpenAIConfig>,
}

impl OpenAiChatModel {
    pub fn new(config: &GenerationConfig, request_timeout: Duration) -> Result<Self> {
        let client = openai_client(&config.api_key, &config.api_base, request_timeout)?;
        debug!("Chat client created for {}", config.api_base);
        Ok(Self { client })
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    #[allow(deprecated)]
    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(request.system.as_str())
                .build()
                .map_err(generation_err)?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(request.user.as_str())
                .build()
                .map_err(generation_err)?
                .into(),
        ];

        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(request.model.as_str())
            .temperature(request.temperature)
            .max_tokens(request.max_tokens)
            .messages(messages)
            .build()
            .map_err(generation_err)?;

        let response = self
            .client
            .chat()
            .create(chat_request)
            .await
            .map_err(generation_err)?;

        let mut response_string = String::new();
        for choice in response.choices {
            if let Some(text) = choice.message.content {
                response_string.push_str(&text);
            }
        }
        Ok(response_string)
    }

    fn backend(&self) -> &'static str {
        "openai"
    }
}

/// Generated text and the citations of the prompt that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<Citation>,
    /// `false` when nothing was retrieved and the model was not consulted.
    pub grounded: bool,
}

impl Answer {
    /// Distinct `[n]` markers in the text, in order of first appearance.
    pub fn referenced_markers(&self) -> Vec<usize> {
        let mut markers: Vec<usize> = Vec::new();
        for capture in MARKER.captures_iter(&self.text) {
            if let Ok(n) = capture[1].parse::<usize>()
                && !markers.contains(&n)
            {
                markers.push(n);
            }
        }
        markers
    }

    /// Referenced markers with no matching citation.
    pub fn unknown_markers(&self) -> Vec<usize> {
        self.referenced_markers()
            .into_iter()
            .filter(|n| !self.citations.iter().any(|c| c.marker == *n))
            .collect()
    }

    /// Citations whose marker appears in the text, in citation order.
    pub fn cited(&self) -> Vec<&Citation> {
        let referenced = self.referenced_markers();
        self.citations
            .iter()
            .filter(|c| referenced.contains(&c.marker))
            .collect()
    }
}

pub struct AnswerGenerator {
    model: Arc<dyn LanguageModel>,
}

impl AnswerGenerator {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    pub fn language_model(&self) -> &Arc<dyn LanguageModel> {
        &self.model
    }

    /// Answer `prompt` with the model and sampling options in `config`.
    ///
    /// A prompt without context is answered with its fixed cannot-answer text and never reaches
    /// the model. An empty reply is an error.
    pub async fn generate(
        &self,
        prompt: &AssembledPrompt,
        config: &GenerationConfig,
    ) -> Result<Answer> {
        if !prompt.has_context() {
            info!("No context retrieved, answering without the model");
            return Ok(Answer {
                text: prompt.cannot_answer.clone(),
                citations: Vec::new(),
                grounded: false,
            });
        }

        let request = ChatRequest {
            model: config.model.clone(),
            system: prompt.system.clone(),
            user: prompt.user.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        };
        debug!(
            backend = self.model.backend(),
            model = %request.model,
            temperature = request.temperature,
            max_tokens = request.max_tokens,
            "Sending generation request"
        );

        let text = self.model.complete(&request).await?;
        if text.trim().is_empty() {
            return Err(RagError::GenerationService(
                "model returned an empty response".into(),
            ));
        }

        let answer = Answer {
            text: text.trim().to_string(),
            citations: prompt.citations.clone(),
            grounded: true,
        };

        let unknown = answer.unknown_markers();
        if !unknown.is_empty() {
            warn!("Answer cites markers with no matching passage: {unknown:?}");
        }
        Ok(answer)
    }
}
