use std::collections::HashSet;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::RetrievalConfig;
use crate::models::Passage;
use crate::providers::{PayloadFilter, Providers};

#[derive(Clone)]
pub struct Retriever {
    providers: Providers,
    global_top_k: usize,
    user_top_k: usize,
}

impl Retriever {
    pub fn new(providers: Providers, config: &RetrievalConfig) -> Self {
        Self {
            providers,
            global_top_k: config.global_top_k,
            user_top_k: config.user_top_k,
        }
    }

    /// Global hits followed by the user's own hits, both owner-filtered. A
    /// passage found by both searches keeps its global position.
    pub async fn retrieve(
        &self,
        user_id: i64,
        include_user_docs: bool,
        query: &str,
    ) -> Result<Vec<Passage>> {
        let embedding = self
            .providers
            .embedder
            .embed(query)
            .await
            .context("failed to embed retrieval query")?;

        let global_hits = self
            .providers
            .vectors
            .search(&embedding, self.global_top_k, None)
            .await?;
        let mut passages = filter_allowed(global_hits, user_id);
        let global_count = passages.len();

        if include_user_docs {
            let filter = PayloadFilter::new("user_id", user_id.to_string());
            let user_hits = self
                .providers
                .vectors
                .search(&embedding, self.user_top_k, Some(&filter))
                .await?;
            passages.extend(filter_allowed(user_hits, user_id));
        }
        let found = passages.len();
        let passages = dedup_passages(passages);

        tracing::debug!(
            "retrieved {} passages for user {} (global {}, user {}, duplicates {})",
            passages.len(),
            user_id,
            global_count,
            found - global_count,
            found - passages.len()
        );

        Ok(passages)
    }

    pub fn scoped(&self, user_id: i64, include_user_docs: bool) -> ScopedRetriever {
        ScopedRetriever {
            retriever: self.clone(),
            user_id,
            include_user_docs,
        }
    }
}

/// Keeps passages tagged with this user, the global corpus, or no owner at all.
pub fn filter_allowed(passages: Vec<Passage>, user_id: i64) -> Vec<Passage> {
    passages
        .into_iter()
        .filter(|passage| passage.metadata.owner().is_visible_to(user_id))
        .collect()
}

/// Drops repeats of an earlier passage with the same source, page and text.
pub fn dedup_passages(passages: Vec<Passage>) -> Vec<Passage> {
    let mut seen = HashSet::new();
    passages
        .into_iter()
        .filter(|p| {
            seen.insert((
                p.metadata.source.clone(),
                p.metadata.page,
                p.content.clone(),
            ))
        })
        .collect()
}

#[async_trait]
pub trait PassageRetriever: Send + Sync {
    async fn retrieve(&self, query: &str) -> Result<Vec<Passage>>;
}

/// A retriever bound to one requesting user.
#[derive(Clone)]
pub struct ScopedRetriever {
    retriever: Retriever,
    user_id: i64,
    include_user_docs: bool,
}

#[async_trait]
impl PassageRetriever for ScopedRetriever {
    async fn retrieve(&self, query: &str) -> Result<Vec<Passage>> {
        self.retriever
            .retrieve(self.user_id, self.include_user_docs, query)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::AppConfig;
    use crate::models::{PassageMetadata, GLOBAL_OWNER};
    use crate::providers::{Embedder, VectorRecord};
    use crate::testing::{test_providers, HashEmbedder, MemoryVectorStore};

    async fn record(owner: Option<&str>, text: &str) -> VectorRecord {
        VectorRecord {
            vector: HashEmbedder.embed(text).await.unwrap(),
            text: text.to_string(),
            metadata: PassageMetadata {
                source: Some(format!("/docs/{}.pdf", owner.unwrap_or("none"))),
                page: Some(0),
                user_id: owner.map(str::to_string),
                document_id: None,
                chunk_id: None,
            },
        }
    }

    fn retriever(vectors: Arc<MemoryVectorStore>) -> Retriever {
        let config = AppConfig::for_data_dir("/tmp/unused");
        Retriever::new(test_providers(vectors, &[]), &config.retrieval)
    }

    fn owner(passage: &Passage) -> Option<&str> {
        passage.metadata.user_id.as_deref()
    }

    #[tokio::test]
    async fn never_returns_another_users_passages() {
        let vectors = Arc::new(MemoryVectorStore::default());
        let text = "beta blockers treat hypertension";
        for owner in [Some("1"), Some("2"), Some(GLOBAL_OWNER), None, Some("2"), Some("2")] {
            vectors.insert(record(owner, text).await);
        }
        let retriever = retriever(vectors);

        for (user_id, foreign) in [(1, "2"), (2, "1")] {
            let passages = retriever.retrieve(user_id, true, text).await.unwrap();
            assert!(!passages.is_empty());
            assert!(passages.iter().all(|p| owner(p) != Some(foreign)));
        }
    }

    #[tokio::test]
    async fn passage_found_by_both_searches_appears_once() {
        let vectors = Arc::new(MemoryVectorStore::default());
        vectors.insert(record(Some(GLOBAL_OWNER), "insulin dosing").await);
        vectors.insert(record(Some("7"), "insulin pump settings").await);
        let retriever = retriever(vectors);

        let without = retriever.retrieve(7, false, "insulin").await.unwrap();
        let with = retriever.retrieve(7, true, "insulin").await.unwrap();

        // The global search is unfiltered, so it already finds the user's passage.
        assert_eq!(without.len(), 2);
        assert_eq!(with.len(), 2);
        assert_eq!(
            with.iter().filter(|p| owner(p) == Some("7")).count(),
            1
        );
    }

    #[tokio::test]
    async fn global_results_come_before_user_results() {
        let vectors = Arc::new(MemoryVectorStore::default());
        for i in 0..6 {
            vectors.insert(record(Some(GLOBAL_OWNER), &format!("asthma inhaler {i}")).await);
        }
        vectors.insert(record(Some("3"), "asthma action plan").await);
        let retriever = retriever(vectors);

        let passages = retriever.retrieve(3, true, "asthma").await.unwrap();
        assert_eq!(passages.len(), 5 + 1);
        assert_eq!(owner(passages.last().unwrap()), Some("3"));
    }

    #[test]
    fn filter_keeps_own_global_and_untagged() {
        let passage = |owner: Option<&str>| Passage {
            content: String::new(),
            metadata: PassageMetadata {
                user_id: owner.map(str::to_string),
                ..PassageMetadata::default()
            },
            score: 1.0,
        };

        let kept = filter_allowed(
            vec![passage(Some("4")), passage(Some("5")), passage(Some("global")), passage(None)],
            4,
        );
        let owners: Vec<Option<&str>> = kept.iter().map(owner).collect();
        assert_eq!(owners, vec![Some("4"), Some("global"), None]);
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let passage = |source: &str, page: i64, text: &str, score: f32| Passage {
            content: text.to_string(),
            metadata: PassageMetadata {
                source: Some(source.to_string()),
                page: Some(page),
                ..PassageMetadata::default()
            },
            score,
        };

        let kept = dedup_passages(vec![
            passage("/a.pdf", 1, "sepsis bundle", 0.9),
            passage("/a.pdf", 2, "sepsis bundle", 0.8),
            passage("/a.pdf", 1, "sepsis bundle", 0.4),
            passage("/b.pdf", 1, "sepsis bundle", 0.3),
        ]);

        let scores: Vec<f32> = kept.iter().map(|p| p.score).collect();
        assert_eq!(scores, vec![0.9, 0.8, 0.3]);
    }

    #[tokio::test]
    async fn scoped_retriever_binds_the_user() {
        let vectors = Arc::new(MemoryVectorStore::default());
        vectors.insert(record(Some("9"), "thyroid hormone").await);
        vectors.insert(record(Some("8"), "thyroid nodules").await);
        let scoped = retriever(vectors).scoped(9, true);

        let passages = scoped.retrieve("thyroid").await.unwrap();
        assert!(passages.iter().all(|p| owner(p) == Some("9")));
        assert!(!passages.is_empty());
    }
}
