pub mod pdf;
pub mod splitter;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::{self, Database, NewDocument};
use crate::models::{
    truncate_chars, Document, PassageMetadata, SourceDocument, GLOBAL_OWNER,
};
use crate::providers::{PayloadFilter, Providers, VectorRecord};

pub use pdf::load_pdf_pages;
pub use splitter::TextSplitter;

const CHUNK_PREVIEW_CHARS: usize = 200;

static DISALLOWED_FILENAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_.-]").expect("filename pattern is valid"));

#[derive(Clone)]
pub struct Ingestor {
    upload_dir: PathBuf,
    db: Database,
    providers: Providers,
    splitter: TextSplitter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedDocument {
    pub document_id: i64,
    pub filename: String,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Indexed(IndexedDocument),
    /// The file parsed but produced no text.
    Empty,
    /// The file could not be read as a PDF.
    Unreadable(String),
}

impl Ingestor {
    pub fn new(config: &AppConfig, db: Database, providers: Providers) -> Self {
        Self {
            upload_dir: config.upload_dir.clone(),
            db,
            providers,
            splitter: TextSplitter::new(config.chunking.chunk_size, config.chunking.chunk_overlap),
        }
    }

    pub async fn ingest_upload(
        &self,
        user_id: i64,
        original_name: &str,
        bytes: &[u8],
    ) -> Result<IngestOutcome> {
        let mut name = secure_filename(original_name);
        if name.is_empty() {
            name = "upload.pdf".to_string();
        }

        tokio::fs::create_dir_all(&self.upload_dir)
            .await
            .with_context(|| format!("failed to create {}", self.upload_dir.display()))?;

        let stored_name = format!("{}_{}", Uuid::new_v4(), name);
        let path = self.upload_dir.join(&stored_name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to store upload at {}", path.display()))?;

        let pages = match load_pdf_pages(&path).await {
            Ok(pages) => pages,
            Err(err) => {
                tracing::warn!("could not read uploaded pdf {}: {err:#}", path.display());
                remove_file_logged(&path).await;
                return Ok(IngestOutcome::Unreadable(err.to_string()));
            }
        };

        let outcome = self
            .ingest_pages(user_id, &stored_name, original_name, &path, bytes.len(), pages)
            .await;

        match outcome {
            Ok(IngestOutcome::Indexed(indexed)) => Ok(IngestOutcome::Indexed(indexed)),
            Ok(other) => {
                remove_file_logged(&path).await;
                Ok(other)
            }
            Err(err) => {
                remove_file_logged(&path).await;
                Err(err)
            }
        }
    }

    /// Splits already-loaded pages and writes rows and vectors for them.
    ///
    /// Embedding runs before any transaction opens. Rows are committed
    /// unindexed, vectors are written, then the document is marked indexed.
    /// A failed vector write removes the rows again.
    async fn ingest_pages(
        &self,
        user_id: i64,
        stored_name: &str,
        original_name: &str,
        path: &Path,
        file_size: usize,
        pages: Vec<SourceDocument>,
    ) -> Result<IngestOutcome> {
        let chunks = self.splitter.split_documents(&filter_to_minimal_docs(pages));
        if chunks.is_empty() {
            return Ok(IngestOutcome::Empty);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.page_content.clone()).collect();
        let vectors = self
            .providers
            .embedder
            .embed_batch(&texts)
            .await
            .with_context(|| format!("failed embedding chunks of {}", original_name))?;

        let file_path = path.display().to_string();
        let mut tx = self.db.begin().await?;

        let document_id = db::insert_document_tx(
            &mut tx,
            &NewDocument {
                user_id,
                filename: stored_name.to_string(),
                original_filename: original_name.to_string(),
                file_path: file_path.clone(),
                file_size: file_size as i64,
            },
        )
        .await?;

        let mut chunk_ids = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.iter().enumerate() {
            let chunk_id = db::insert_chunk_tx(
                &mut tx,
                document_id,
                index as i64,
                chunk.page(),
                &truncate_chars(&chunk.page_content, CHUNK_PREVIEW_CHARS),
            )
            .await?;
            chunk_ids.push(chunk_id);
        }
        tx.commit().await?;

        let records = chunks
            .iter()
            .zip(vectors)
            .zip(&chunk_ids)
            .map(|((chunk, vector), chunk_id)| VectorRecord {
                vector,
                text: chunk.page_content.clone(),
                metadata: PassageMetadata {
                    source: Some(file_path.clone()),
                    page: chunk.page(),
                    user_id: Some(user_id.to_string()),
                    document_id: Some(document_id.to_string()),
                    chunk_id: Some(chunk_id.to_string()),
                },
            })
            .collect();

        if let Err(err) = self.providers.vectors.upsert(records).await {
            self.discard_partial_document(document_id).await;
            return Err(err.context(format!("failed storing vectors of {}", original_name)));
        }

        let mut tx = self.db.begin().await?;
        db::mark_indexed_tx(&mut tx, document_id).await?;
        tx.commit().await?;

        tracing::info!(
            "indexed {} chunks of {} for user {}",
            chunk_ids.len(),
            original_name,
            user_id
        );

        Ok(IngestOutcome::Indexed(IndexedDocument {
            document_id,
            filename: original_name.to_string(),
            chunk_count: chunk_ids.len(),
        }))
    }

    /// Undoes the rows of a document whose vectors never landed.
    async fn discard_partial_document(&self, document_id: i64) {
        let filter = PayloadFilter::new("document_id", document_id.to_string());
        if let Err(err) = self.providers.vectors.delete_where(&filter).await {
            tracing::warn!("failed to delete partial vectors of document {}: {err:#}", document_id);
        }

        let removed = async {
            let mut tx = self.db.begin().await?;
            db::delete_document_tx(&mut tx, document_id).await?;
            tx.commit().await?;
            anyhow::Ok(())
        };
        if let Err(err) = removed.await {
            tracing::error!("failed to remove rows of unindexed document {}: {err:#}", document_id);
        }
    }

    /// Adds a PDF to the shared corpus. No rows are written.
    pub async fn index_global(&self, path: &Path) -> Result<usize> {
        let pages = load_pdf_pages(path).await?;
        self.index_global_pages(pages).await
    }

    async fn index_global_pages(&self, pages: Vec<SourceDocument>) -> Result<usize> {
        let chunks = self.splitter.split_documents(&filter_to_minimal_docs(pages));
        if chunks.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.page_content.clone()).collect();
        let vectors = self.providers.embedder.embed_batch(&texts).await?;

        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| VectorRecord {
                vector,
                text: chunk.page_content.clone(),
                metadata: PassageMetadata {
                    source: chunk.source().map(str::to_string),
                    page: chunk.page(),
                    user_id: Some(GLOBAL_OWNER.to_string()),
                    document_id: None,
                    chunk_id: None,
                },
            })
            .collect();

        let count = records.len();
        self.providers.vectors.upsert(records).await?;
        Ok(count)
    }

    /// Returns false when the user owns no such document.
    pub async fn delete_document(&self, user_id: i64, document_id: i64) -> Result<bool> {
        let Some(document) = self.db.get_document_for_user(document_id, user_id).await? else {
            return Ok(false);
        };

        self.remove_document(&document).await?;
        Ok(true)
    }

    async fn remove_document(&self, document: &Document) -> Result<()> {
        let filter = PayloadFilter::new("document_id", document.id.to_string());
        if let Err(err) = self.providers.vectors.delete_where(&filter).await {
            tracing::warn!("failed to delete vectors of document {}: {err:#}", document.id);
        }

        remove_file_logged(Path::new(&document.file_path)).await;

        let mut tx = self.db.begin().await?;
        db::delete_document_tx(&mut tx, document.id).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Documents whose files still exist, newest first. Vanished files drop their document.
    pub async fn live_documents(&self, user_id: i64) -> Result<Vec<Document>> {
        let mut live = Vec::new();
        for document in self.db.list_documents(user_id).await? {
            let exists = tokio::fs::try_exists(&document.file_path)
                .await
                .unwrap_or(false);
            if exists {
                live.push(document);
            } else {
                tracing::info!(
                    "file for document {} is gone, removing {}",
                    document.id,
                    document.file_path
                );
                if let Err(err) = self.remove_document(&document).await {
                    tracing::warn!("skipping vanished document {}: {err:#}", document.id);
                }
            }
        }
        Ok(live)
    }

    pub async fn purge_user_documents(&self, user_id: i64) -> Result<usize> {
        let filter = PayloadFilter::new("user_id", user_id.to_string());
        self.providers
            .vectors
            .delete_where(&filter)
            .await
            .with_context(|| format!("failed to delete vectors for user {}", user_id))?;

        let documents = self.db.list_documents(user_id).await?;
        for document in &documents {
            remove_file_logged(Path::new(&document.file_path)).await;
        }

        let mut tx = self.db.begin().await?;
        for document in &documents {
            db::delete_document_tx(&mut tx, document.id).await?;
        }
        tx.commit().await?;

        tracing::info!("purged {} documents for user {}", documents.len(), user_id);
        Ok(documents.len())
    }
}

/// Reduces metadata to exactly `{source, page}`. A missing page becomes 0.
pub fn filter_to_minimal_docs(documents: Vec<SourceDocument>) -> Vec<SourceDocument> {
    documents
        .into_iter()
        .map(|document| {
            let source = document.metadata.get("source").cloned().unwrap_or(Value::Null);
            let page = document.metadata.get("page").cloned().unwrap_or_else(|| json!(0));

            let mut metadata = Map::new();
            metadata.insert("source".to_string(), source);
            metadata.insert("page".to_string(), page);
            SourceDocument {
                page_content: document.page_content,
                metadata,
            }
        })
        .collect()
}

/// ASCII-only filename safe to place in the upload directory.
pub fn secure_filename(name: &str) -> String {
    let ascii: String = name
        .chars()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = ascii.split_whitespace().collect::<Vec<_>>().join("_");

    let cleaned = DISALLOWED_FILENAME_CHARS.replace_all(&joined, "");

    cleaned.trim_matches(|c| c == '.' || c == '_').to_string()
}

pub fn is_pdf_filename(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false)
}

async fn remove_file_logged(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("failed to remove {}: {err}", path.display());
        }
    }
}
