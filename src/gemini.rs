//! Google Generative Language API client used as an alternative answer model.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::ollama::ensure_ok;
use crate::providers::{ChatModel, PromptMessage, PromptRole};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, temperature: f32) -> Self {
        Self {
            client: Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// The key travels in a header so it never appears in a logged URL.
    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

#[derive(Serialize)]
struct GenerateRequest {
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct Part {
    text: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: ResponseContent,
}

#[derive(Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: String,
}

fn build_request(messages: &[PromptMessage], temperature: f32) -> GenerateRequest {
    let system_text = messages
        .iter()
        .filter(|m| m.role == PromptRole::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let contents = messages
        .iter()
        .filter(|m| m.role == PromptRole::User)
        .map(|m| Content {
            role: Some("user".to_string()),
            parts: vec![Part {
                text: m.content.clone(),
            }],
        })
        .collect();

    GenerateRequest {
        system_instruction: (!system_text.is_empty()).then(|| Content {
            role: None,
            parts: vec![Part { text: system_text }],
        }),
        contents,
        generation_config: GenerationConfig { temperature },
    }
}

#[async_trait]
impl ChatModel for GeminiClient {
    async fn complete(&self, messages: &[PromptMessage]) -> Result<String> {
        let request = build_request(messages, self.temperature);

        let response = self
            .client
            .post(self.endpoint())
            .header(API_KEY_HEADER, &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .context("failed to call gemini generateContent")?;

        let response = ensure_ok(response, "gemini generateContent")
            .await?
            .json::<GenerateResponse>()
            .await
            .map_err(reqwest::Error::without_url)
            .context("failed to decode gemini response")?;

        let text = response
            .candidates
            .into_iter()
            .next()
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .into_iter()
                    .map(|part| part.text)
                    .collect::<String>()
            })
            .ok_or_else(|| anyhow::anyhow!("gemini returned no candidates"))?;

        Ok(text.trim().to_string())
    }

    fn name(&self) -> &str {
        &self.model
    }
}
