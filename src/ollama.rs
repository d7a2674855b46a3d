use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::providers::{ChatModel, Embedder, PromptMessage};

/// Word counts tried, longest first, when an input overflows the context window.
const TRUNCATION_BUDGETS: [usize; 4] = [400, 300, 200, 120];

#[derive(Clone, Copy, Debug)]
enum EmbedRoute {
    Embed,
    Embeddings,
}

impl EmbedRoute {
    fn path(self) -> &'static str {
        match self {
            EmbedRoute::Embed => "/api/embed",
            EmbedRoute::Embeddings => "/api/embeddings",
        }
    }
}

#[derive(Deserialize)]
struct ModernEmbedResp {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Deserialize)]
struct LegacyEmbedResp {
    embedding: Vec<f32>,
}

#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Embeds one text. Inputs over the model's context window are retried
    /// with progressively fewer words.
    pub async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let input = text.trim();
        if input.is_empty() {
            anyhow::bail!("cannot embed empty text input");
        }

        let first_err = match self.embed_any_route(model, input).await {
            Ok(vector) => return Ok(vector),
            Err(err) if is_context_length_error(&err) => err,
            Err(err) => return Err(err),
        };

        let word_count = input.split_whitespace().count();
        let mut last_err = first_err;
        for budget in TRUNCATION_BUDGETS.iter().copied().filter(|b| *b < word_count) {
            let shortened = truncate_to_word_limit(input, budget);
            match self.embed_any_route(model, &shortened).await {
                Ok(vector) => {
                    tracing::debug!("embedded input truncated from {word_count} to {budget} words");
                    return Ok(vector);
                }
                Err(err) if is_context_length_error(&err) => last_err = err,
                Err(err) => return Err(err),
            }
        }

        Err(last_err.context(format!(
            "ollama embedding still exceeds the context length after truncating {word_count} words"
        )))
    }

    /// One request embedding every input via `/api/embed`.
    pub async fn embed_many(&self, model: &str, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        #[derive(Serialize)]
        struct BatchReq<'a> {
            model: &'a str,
            input: &'a [String],
        }

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .json(&BatchReq {
                model,
                input: inputs,
            })
            .send()
            .await
            .context("failed to call ollama embed endpoint")?;

        let embeddings = ensure_ok(response, "/api/embed")
            .await?
            .json::<ModernEmbedResp>()
            .await
            .context("failed to decode ollama /api/embed response")?
            .embeddings;

        if embeddings.len() != inputs.len() {
            anyhow::bail!(
                "ollama /api/embed returned {} vectors for {} inputs",
                embeddings.len(),
                inputs.len()
            );
        }
        Ok(embeddings)
    }

    async fn embed_any_route(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let modern_err = match self.embed_via(EmbedRoute::Embed, model, text).await {
            Ok(vector) => return Ok(vector),
            Err(err) => err,
        };

        // Releases before /api/embed only serve /api/embeddings.
        self.embed_via(EmbedRoute::Embeddings, model, text)
            .await
            .map_err(|legacy_err| {
                anyhow::anyhow!(
                    "ollama embedding failed on both routes ({modern_err}; {legacy_err}); \
                     is the model pulled? try `ollama pull {model}`"
                )
            })
    }

    async fn embed_via(&self, route: EmbedRoute, model: &str, text: &str) -> Result<Vec<f32>> {
        let body = match route {
            EmbedRoute::Embed => json!({ "model": model, "input": text }),
            EmbedRoute::Embeddings => json!({ "model": model, "prompt": text }),
        };

        let response = self
            .client
            .post(format!("{}{}", self.base_url, route.path()))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to call ollama {}", route.path()))?;
        let response = ensure_ok(response, route.path()).await?;

        match route {
            EmbedRoute::Embed => response
                .json::<ModernEmbedResp>()
                .await
                .context("failed to decode ollama /api/embed response")?
                .embeddings
                .into_iter()
                .next()
                .ok_or_else(|| anyhow::anyhow!("ollama /api/embed returned no embeddings")),
            EmbedRoute::Embeddings => Ok(response
                .json::<LegacyEmbedResp>()
                .await
                .context("failed to decode ollama /api/embeddings response")?
                .embedding),
        }
    }

    pub async fn chat(
        &self,
        model: &str,
        messages: &[PromptMessage],
        temperature: f32,
    ) -> Result<String> {
        #[derive(Serialize)]
        struct ChatReq<'a> {
            model: &'a str,
            messages: &'a [PromptMessage],
            stream: bool,
            options: ChatOptions,
        }

        #[derive(Serialize)]
        struct ChatOptions {
            temperature: f32,
        }

        #[derive(Deserialize)]
        struct ChatResp {
            message: ChatRespMessage,
        }

        #[derive(Deserialize)]
        struct ChatRespMessage {
            content: String,
        }

        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&ChatReq {
                model,
                messages,
                stream: false,
                options: ChatOptions { temperature },
            })
            .send()
            .await
            .context("failed to call ollama chat endpoint")?;

        let response = ensure_ok(response, "/api/chat")
            .await?
            .json::<ChatResp>()
            .await
            .context("failed to decode ollama chat response")?;

        Ok(response.message.content.trim().to_string())
    }
}

/// Ollama embedding model bound to a client.
#[derive(Clone)]
pub struct OllamaEmbedder {
    client: OllamaClient,
    model: String,
}

impl OllamaEmbedder {
    pub fn new(client: OllamaClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.client.embed(&self.model, text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        match self.client.embed_many(&self.model, texts).await {
            Ok(vectors) => Ok(vectors),
            Err(err) => {
                tracing::warn!("batched embedding failed, embedding one by one: {err:#}");
                let mut vectors = Vec::with_capacity(texts.len());
                for text in texts {
                    vectors.push(self.client.embed(&self.model, text).await?);
                }
                Ok(vectors)
            }
        }
    }
}

/// Ollama chat model bound to a client.
#[derive(Clone)]
pub struct OllamaChat {
    client: OllamaClient,
    model: String,
    temperature: f32,
}

impl OllamaChat {
    pub fn new(client: OllamaClient, model: impl Into<String>, temperature: f32) -> Self {
        Self {
            client,
            model: model.into(),
            temperature,
        }
    }
}

#[async_trait]
impl ChatModel for OllamaChat {
    async fn complete(&self, messages: &[PromptMessage]) -> Result<String> {
        self.client
            .chat(&self.model, messages, self.temperature)
            .await
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Passes 2xx responses through and turns anything else into an error carrying the body.
pub(crate) async fn ensure_ok(response: Response, route: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    anyhow::bail!("{route} returned {status}: {}", normalize_err_body(&body))
}

pub(crate) fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(err) = json.get("error").and_then(|v| v.as_str()) {
            return err.to_string();
        }
        if let Some(err) = json
            .get("error")
            .and_then(|v| v.get("message"))
            .and_then(|v| v.as_str())
        {
            return err.to_string();
        }
    }

    trimmed.to_string()
}

fn is_context_length_error(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("input length exceeds the context length")
        || (msg.contains("context length") && msg.contains("input length"))
}

fn truncate_to_word_limit(text: &str, max_words: usize) -> String {
    text.split_whitespace()
        .take(max_words)
        .collect::<Vec<_>>()
        .join(" ")
}
