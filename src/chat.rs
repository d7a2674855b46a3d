use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Semaphore};

use crate::config::AppConfig;
use crate::db::{self, Database};
use crate::models::{truncate_chars, CitationView, NewCitation, Passage, Role, StreamEvent};
use crate::providers::{PromptMessage, Providers};
use crate::rag;
use crate::retrieval::{PassageRetriever, Retriever, ScopedRetriever};

const NO_DOCUMENTS_CONTEXT: &str = "No relevant documents found in the uploaded files.";
const CITATION_SNIPPET_CHARS: usize = 200;
const CITATION_PREVIEW_CHARS: usize = 150;
const EVENT_BUFFER: usize = 64;

/// A validated turn: the user message is already stored in `conversation_id`.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub user_id: i64,
    pub conversation_id: i64,
    pub message: String,
    pub use_advanced_rag: bool,
}

#[derive(Clone)]
pub struct ChatService {
    db: Database,
    providers: Providers,
    retriever: Retriever,
    max_hops: usize,
    generation_limit: Arc<Semaphore>,
}

impl ChatService {
    pub fn new(
        config: &AppConfig,
        db: Database,
        providers: Providers,
        generation_limit: Arc<Semaphore>,
    ) -> Self {
        Self {
            retriever: Retriever::new(providers.clone(), &config.retrieval),
            db,
            providers,
            max_hops: config.retrieval.max_hops,
            generation_limit,
        }
    }

    /// Runs the turn on its own task. The receiver yields a heartbeat first and
    /// ends after `done` or a single `error`.
    pub fn stream_turn(&self, turn: ChatTurn) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let service = self.clone();

        tokio::spawn(async move {
            let _ = tx.send(StreamEvent::Heartbeat).await;

            if let Err(err) = service.run_turn(&turn, &tx).await {
                tracing::error!(
                    "chat turn failed for conversation {}: {err:#}",
                    turn.conversation_id
                );
                let _ = tx
                    .send(StreamEvent::Error {
                        message: err.to_string(),
                    })
                    .await;
            }
        });

        rx
    }

    async fn run_turn(&self, turn: &ChatTurn, tx: &mpsc::Sender<StreamEvent>) -> Result<()> {
        let has_documents = self.db.has_indexed_documents(turn.user_id).await?;
        let retriever = self.retriever.scoped(turn.user_id, has_documents);

        let (answer, passages) = {
            let _permit = self.generation_limit.acquire().await?;
            if turn.use_advanced_rag {
                let outcome = rag::multi_hop_reasoning(
                    self.providers.llm.as_ref(),
                    &retriever,
                    &turn.message,
                    self.max_hops,
                )
                .await?;
                tracing::info!(
                    "multi-hop answer for conversation {} explored {} queries",
                    turn.conversation_id,
                    outcome.reasoning_chain.len()
                );
                (outcome.answer, outcome.context_used)
            } else {
                self.simple_answer(&retriever, &turn.message).await?
            }
        };

        let mut full_answer = String::new();
        for word in answer.split_whitespace() {
            let token = format!("{word} ");
            full_answer.push_str(&token);
            let _ = tx.send(StreamEvent::Token { content: token }).await;
        }

        let message_id = self
            .persist_answer(turn.conversation_id, full_answer.trim(), &passages)
            .await?;

        let _ = tx
            .send(StreamEvent::Citations {
                citations: citation_views(&passages),
                conversation_id: turn.conversation_id,
            })
            .await;
        let _ = tx.send(StreamEvent::Done { message_id }).await;
        Ok(())
    }

    async fn simple_answer(
        &self,
        retriever: &ScopedRetriever,
        message: &str,
    ) -> Result<(String, Vec<Passage>)> {
        let llm = self.providers.llm.as_ref();
        let rewritten = rag::rewrite_query(llm, message).await?;
        let passages = retriever.retrieve(&rewritten).await?;

        if passages.is_empty() {
            tracing::warn!("no passages retrieved for rewritten query {:?}", rewritten);
        }

        let messages = [
            PromptMessage::system(build_system_prompt(&format_context(&passages))),
            PromptMessage::user(message),
        ];
        let answer = llm
            .complete(&messages)
            .await
            .with_context(|| format!("answer generation failed with {}", llm.name()))?;

        Ok((answer, passages))
    }

    async fn persist_answer(
        &self,
        conversation_id: i64,
        content: &str,
        passages: &[Passage],
    ) -> Result<i64> {
        let mut tx = self.db.begin().await?;
        let message = db::insert_message_tx(&mut tx, conversation_id, Role::Assistant, content).await?;

        for passage in passages {
            let chunk_hint = passage
                .metadata
                .chunk_id
                .as_deref()
                .and_then(|id| id.parse::<i64>().ok());
            let (document_id, chunk_id) = db::resolve_citation_refs_tx(
                &mut tx,
                passage.metadata.source.as_deref(),
                passage.metadata.page,
                chunk_hint,
            )
            .await?;

            db::insert_citation_tx(
                &mut tx,
                message.id,
                &NewCitation {
                    document_id,
                    chunk_id,
                    page_number: passage.metadata.page,
                    relevance_score: f64::from(passage.score),
                    content_snippet: truncate_chars(&passage.content, CITATION_SNIPPET_CHARS),
                },
            )
            .await?;
        }

        tx.commit().await?;
        Ok(message.id)
    }
}

fn build_system_prompt(context: &str) -> String {
    format!(
        "You are an intelligent assistant capable of normal conversation, answering general questions, \
         and providing medical information when needed. \
         Use the retrieved context only to support medical or technical questions. \
         For everyday conversation, respond naturally without relying on the context. \
         Do not invent medical facts. If the answer is not in the context, say you don't know. \
         When you use a passage, cite it by its tag, for example [Source 1]. \
         Stay helpful, engaging, and concise.\n\n{context}"
    )
}

pub fn format_context(passages: &[Passage]) -> String {
    if passages.is_empty() {
        return NO_DOCUMENTS_CONTEXT.to_string();
    }

    passages
        .iter()
        .enumerate()
        .map(|(i, passage)| {
            format!(
                "[Source {}] {}\n(Source: {}, Page: {})",
                i + 1,
                passage.content,
                passage.metadata.source.as_deref().unwrap_or("Unknown"),
                passage
                    .metadata
                    .page
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "N/A".to_string())
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn citation_views(passages: &[Passage]) -> Vec<CitationView> {
    passages
        .iter()
        .enumerate()
        .map(|(i, passage)| {
            let source = passage
                .metadata
                .source
                .as_deref()
                .and_then(|path| Path::new(path).file_name())
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "Unknown".to_string());

            let mut preview = truncate_chars(&passage.content, CITATION_PREVIEW_CHARS);
            if passage.content.chars().count() > CITATION_PREVIEW_CHARS {
                preview.push_str("...");
            }

            CitationView {
                id: i as i64 + 1,
                source,
                page: passage.metadata.page,
                preview,
            }
        })
        .collect()
}
