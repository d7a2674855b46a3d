use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{Passage, PassageMetadata};
use crate::providers::{PayloadFilter, VectorRecord, VectorStore};

const UPSERT_BATCH: usize = 64;

#[derive(Clone)]
pub struct QdrantStore {
    client: Client,
    base_url: String,
    collection: String,
    known_vector_size: Arc<RwLock<Option<usize>>>,
}

impl QdrantStore {
    pub fn new(base_url: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            collection: collection.into(),
            known_vector_size: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn ensure_collection(&self, vector_size: usize) -> Result<()> {
        {
            let known = self.known_vector_size.read().await;
            if *known == Some(vector_size) {
                return Ok(());
            }
        }

        let collection_url = format!("{}/collections/{}", self.base_url, self.collection);
        let existing = self
            .client
            .get(&collection_url)
            .send()
            .await
            .context("failed to contact qdrant while checking collection")?;

        if !existing.status().is_success() {
            let payload = json!({
                "vectors": {
                    "size": vector_size,
                    "distance": "Cosine"
                }
            });

            self.client
                .put(&collection_url)
                .json(&payload)
                .send()
                .await
                .context("failed to contact qdrant while creating collection")?
                .error_for_status()
                .context("qdrant failed to create collection")?;

            // Owner and document filters run on every chat turn and delete.
            for field in ["user_id", "document_id"] {
                let index_url = format!("{}/index?wait=true", collection_url);
                let response = self
                    .client
                    .put(index_url)
                    .json(&json!({ "field_name": field, "field_schema": "keyword" }))
                    .send()
                    .await;
                if let Err(err) = response {
                    tracing::warn!("could not create qdrant payload index on {field}: {err}");
                }
            }
        }

        *self.known_vector_size.write().await = Some(vector_size);
        Ok(())
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        self.ensure_collection(first.vector.len()).await?;

        let upsert_url = format!(
            "{}/collections/{}/points?wait=true",
            self.base_url, self.collection
        );

        for batch in records.chunks(UPSERT_BATCH) {
            let points: Vec<QdrantPoint> = batch
                .iter()
                .map(|record| QdrantPoint {
                    id: Uuid::new_v4().to_string(),
                    vector: record.vector.clone(),
                    payload: QdrantPayload {
                        text: record.text.clone(),
                        metadata: record.metadata.clone(),
                    },
                })
                .collect();

            self.client
                .put(&upsert_url)
                .json(&json!({ "points": points }))
                .send()
                .await
                .context("failed to contact qdrant during upsert")?
                .error_for_status()
                .context("qdrant upsert returned non-success status")?;
        }

        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<Passage>> {
        if vector.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let url = format!(
            "{}/collections/{}/points/search",
            self.base_url, self.collection
        );

        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(filter) = filter {
            body["filter"] = filter_json(filter);
        }

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .context("failed to contact qdrant during search")?;

        // Nothing has been indexed yet.
        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!("qdrant collection {} does not exist yet", self.collection);
            return Ok(vec![]);
        }

        let response = response
            .error_for_status()
            .context("qdrant search returned non-success status")?
            .json::<QdrantSearchResponse>()
            .await
            .context("failed to decode qdrant search response")?;

        Ok(response
            .result
            .into_iter()
            .filter_map(|point| {
                let payload = point.payload?;
                Some(Passage {
                    content: payload.text,
                    metadata: payload.metadata,
                    score: point.score,
                })
            })
            .collect())
    }

    async fn delete_where(&self, filter: &PayloadFilter) -> Result<()> {
        let url = format!(
            "{}/collections/{}/points/delete?wait=true",
            self.base_url, self.collection
        );

        let response = self
            .client
            .post(url)
            .json(&json!({ "filter": filter_json(filter) }))
            .send()
            .await
            .context("failed to contact qdrant during delete")?;

        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!("qdrant collection {} does not exist, nothing to delete", self.collection);
            return Ok(());
        }

        response
            .error_for_status()
            .context("qdrant delete returned non-success status")?;

        Ok(())
    }
}

fn filter_json(filter: &PayloadFilter) -> Value {
    json!({
        "must": [
            { "key": filter.key, "match": { "value": filter.value } }
        ]
    })
}

#[derive(Debug, Clone, Serialize)]
struct QdrantPoint {
    id: String,
    vector: Vec<f32>,
    payload: QdrantPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QdrantPayload {
    #[serde(default)]
    text: String,
    #[serde(flatten)]
    metadata: PassageMetadata,
}

#[derive(Debug, Deserialize)]
struct QdrantSearchResponse {
    result: Vec<QdrantResultPoint>,
}

#[derive(Debug, Deserialize)]
struct QdrantResultPoint {
    score: f32,
    payload: Option<QdrantPayload>,
}

#[cfg(test)]
mod tests {
    use axum::http::Uri;
    use axum::Json;

    use super::*;
    use crate::testing::serve_mock;

    /// Answers like a Qdrant with no collections, except `broken` which fails.
    async fn qdrant_without_collections() -> String {
        let router = axum::Router::new().fallback(|uri: Uri| async move {
            if uri.path().starts_with("/collections/broken/") {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "status": { "error": "storage failure" } })),
                )
            } else {
                (
                    StatusCode::NOT_FOUND,
                    Json(json!({ "status": { "error": "Not found: Collection doesn't exist!" } })),
                )
            }
        });
        serve_mock(router).await
    }

    #[tokio::test]
    async fn search_on_a_missing_collection_finds_nothing() {
        let store = QdrantStore::new(qdrant_without_collections().await, "medical_docs");
        let filter = PayloadFilter::new("user_id", "7");

        let hits = store.search(&[0.1, 0.2, 0.3], 4, Some(&filter)).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn delete_on_a_missing_collection_succeeds() {
        let store = QdrantStore::new(qdrant_without_collections().await, "medical_docs");

        store
            .delete_where(&PayloadFilter::new("document_id", "12"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn other_failures_still_surface() {
        let store = QdrantStore::new(qdrant_without_collections().await, "broken");

        assert!(store.search(&[0.1, 0.2], 4, None).await.is_err());
        assert!(store
            .delete_where(&PayloadFilter::new("user_id", "7"))
            .await
            .is_err());
    }

    #[test]
    fn filter_is_a_single_must_match() {
        let value = filter_json(&PayloadFilter::new("user_id", "3"));
        assert_eq!(value["must"][0]["key"], "user_id");
        assert_eq!(value["must"][0]["match"]["value"], "3");
    }

    #[test]
    fn payload_flattens_metadata_next_to_text() {
        let payload = QdrantPayload {
            text: "Hypertension is persistently raised blood pressure.".to_string(),
            metadata: PassageMetadata {
                source: Some("/uploads/a.pdf".to_string()),
                page: Some(4),
                user_id: Some("global".to_string()),
                document_id: None,
                chunk_id: None,
            },
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["source"], "/uploads/a.pdf");
        assert_eq!(json["page"], 4);
        assert_eq!(json["user_id"], "global");
        assert!(json.get("document_id").is_none());

        let decoded: QdrantPayload = serde_json::from_value(json!({
            "text": "t",
            "source": "s.pdf",
            "page": 1,
            "unrelated": true
        }))
        .unwrap();
        assert_eq!(decoded.metadata.page, Some(1));
        assert_eq!(decoded.metadata.user_id, None);
    }
}
