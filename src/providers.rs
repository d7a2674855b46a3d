//! Seams for the external services a chat turn depends on.
//!
//! Handlers never reach for a global client: `Providers` is built once in
//! `main` and handed to every service, so tests can swap in doubles.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::config::{AppConfig, LlmProvider};
use crate::gemini::GeminiClient;
use crate::models::{Passage, PassageMetadata};
use crate::ollama::{OllamaChat, OllamaClient, OllamaEmbedder};
use crate::qdrant_store::QdrantStore;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Equality match on one payload key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadFilter {
    pub key: String,
    pub value: String,
}

impl PayloadFilter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, metadata: &PassageMetadata) -> bool {
        let field = match self.key.as_str() {
            "source" => metadata.source.clone(),
            "page" => metadata.page.map(|p| p.to_string()),
            "user_id" => metadata.user_id.clone(),
            "document_id" => metadata.document_id.clone(),
            "chunk_id" => metadata.chunk_id.clone(),
            _ => None,
        };
        field.as_deref() == Some(self.value.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub vector: Vec<f32>,
    pub text: String,
    pub metadata: PassageMetadata,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()>;

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<Passage>>;

    async fn delete_where(&self, filter: &PayloadFilter) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::User,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: &[PromptMessage]) -> Result<String>;

    fn name(&self) -> &str;
}

#[derive(Clone)]
pub struct Providers {
    pub embedder: Arc<dyn Embedder>,
    pub vectors: Arc<dyn VectorStore>,
    pub llm: Arc<dyn ChatModel>,
}

impl Providers {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
        llm: Arc<dyn ChatModel>,
    ) -> Self {
        Self {
            embedder,
            vectors,
            llm,
        }
    }

    /// Ollama embeddings and Qdrant storage, with the configured chat backend.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let ollama = OllamaClient::new(config.ollama_base_url.clone());
        let embedder = OllamaEmbedder::new(ollama.clone(), config.models.embedding_model.clone());
        let vectors = QdrantStore::new(
            config.qdrant_base_url.clone(),
            config.qdrant_collection.clone(),
        );

        let llm: Arc<dyn ChatModel> = match config.models.provider {
            LlmProvider::Ollama => Arc::new(OllamaChat::new(
                ollama,
                config.models.answer_model.clone(),
                config.models.temperature,
            )),
            LlmProvider::Gemini => {
                let Some(api_key) = config.models.google_api_key.clone() else {
                    bail!("LLM_PROVIDER is gemini but GOOGLE_API_KEY is not set");
                };
                Arc::new(GeminiClient::new(
                    api_key,
                    config.models.gemini_model.clone(),
                    config.models.temperature,
                ))
            }
        };
        tracing::info!("using chat model {}", llm.name());

        Ok(Self::new(Arc::new(embedder), Arc::new(vectors), llm))
    }
}
