//! In-process doubles for the external services.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::models::Passage;
use crate::providers::{
    ChatModel, Embedder, PayloadFilter, PromptMessage, Providers, VectorRecord, VectorStore,
};

const DIMENSIONS: usize = 64;

/// Bag-of-words vectors: texts sharing words land close together.
#[derive(Default)]
pub struct HashEmbedder;

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; DIMENSIONS];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            vector[(hasher.finish() % DIMENSIONS as u64) as usize] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(vector)
    }
}

#[derive(Default)]
pub struct MemoryVectorStore {
    records: Mutex<Vec<VectorRecord>>,
    fail_upsert: Mutex<bool>,
}

impl MemoryVectorStore {
    pub fn records(&self) -> Vec<VectorRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn insert(&self, record: VectorRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }

    pub fn fail_next_upsert(&self) {
        if let Ok(mut flag) = self.fail_upsert.lock() {
            *flag = true;
        }
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        let should_fail = self
            .fail_upsert
            .lock()
            .map(|mut flag| std::mem::replace(&mut *flag, false))
            .unwrap_or(false);
        if should_fail {
            anyhow::bail!("vector store unavailable");
        }

        self.records
            .lock()
            .map_err(|_| anyhow::anyhow!("lock poisoned"))?
            .extend(records);
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<Passage>> {
        let records = self.records();
        let mut hits: Vec<Passage> = records
            .into_iter()
            .filter(|record| filter.map_or(true, |f| f.matches(&record.metadata)))
            .map(|record| Passage {
                score: cosine(vector, &record.vector),
                content: record.text,
                metadata: record.metadata,
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete_where(&self, filter: &PayloadFilter) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| anyhow::anyhow!("lock poisoned"))?
            .retain(|record| !filter.matches(&record.metadata));
        Ok(())
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Replies in order, then repeats the last one. `"!error: ..."` replies fail.
pub struct ScriptedChatModel {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    calls: Mutex<Vec<Vec<PromptMessage>>>,
}

impl ScriptedChatModel {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            last: Mutex::new("I don't know.".to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Vec<PromptMessage>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    async fn complete(&self, messages: &[PromptMessage]) -> Result<String> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(messages.to_vec());
        }

        let next = self.replies.lock().ok().and_then(|mut r| r.pop_front());
        let reply = match next {
            Some(reply) => {
                if let Ok(mut last) = self.last.lock() {
                    *last = reply.clone();
                }
                reply
            }
            None => self.last.lock().map(|l| l.clone()).unwrap_or_default(),
        };

        match reply.strip_prefix("!error: ") {
            Some(message) => Err(anyhow::anyhow!(message.to_string())),
            None => Ok(reply),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub fn test_providers(vectors: Arc<MemoryVectorStore>, replies: &[&str]) -> Providers {
    Providers::new(
        Arc::new(HashEmbedder),
        vectors,
        Arc::new(ScriptedChatModel::new(replies.iter().copied())),
    )
}

/// Serves `router` on an ephemeral local port and returns its base URL.
pub async fn serve_mock(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// A base URL nothing is listening on.
pub async fn closed_port_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}
