use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::models::{
    CitationView, Conversation, ConversationSummary, Document, Feedback, Message, MessageView,
    NewCitation, Rating, Role, User,
};
#[cfg(test)]
use crate::models::{Citation, DocumentChunk};

const MEMORY_URL: &str = "sqlite::memory:";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Columns for a document row before it has an id.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub user_id: i64,
    pub filename: String,
    pub original_filename: String,
    pub file_path: String,
    pub file_size: i64,
}

impl Database {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        if config.database_url == MEMORY_URL {
            return Self::in_memory().await;
        }
        tokio::fs::create_dir_all(&config.data_dir).await?;
        Self::connect(&config.database_url).await
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Every in-memory connection is its own database, so the pool holds exactly one forever.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str(MEMORY_URL)?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                filename TEXT NOT NULL,
                original_filename TEXT NOT NULL,
                file_path TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                uploaded_at TEXT NOT NULL,
                is_indexed INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS document_chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                chunk_index INTEGER NOT NULL,
                page_number INTEGER,
                content_preview TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS citations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                document_id INTEGER REFERENCES documents(id) ON DELETE SET NULL,
                chunk_id INTEGER REFERENCES document_chunks(id) ON DELETE SET NULL,
                page_number INTEGER,
                relevance_score REAL,
                content_snippet TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS feedbacks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                rating TEXT NOT NULL,
                comment TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (user_id, message_id)
            );

            CREATE INDEX IF NOT EXISTS idx_documents_user ON documents(user_id);
            CREATE INDEX IF NOT EXISTS idx_documents_path ON documents(file_path);
            CREATE INDEX IF NOT EXISTS idx_chunks_document_page ON document_chunks(document_id, page_number);
            CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id, updated_at);
            CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);
            CREATE INDEX IF NOT EXISTS idx_citations_message ON citations(message_id);
            CREATE INDEX IF NOT EXISTS idx_citations_document ON citations(document_id);
            CREATE INDEX IF NOT EXISTS idx_citations_chunk ON citations(chunk_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    // -- users and sessions -------------------------------------------------

    pub async fn create_user(&self, username: &str, email: &str, password_hash: &str) -> Result<User> {
        let created_at = Utc::now();
        let id = sqlx::query(
            "INSERT INTO users (username, email, password_hash, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(username)
        .bind(email)
        .bind(password_hash)
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(User {
            id,
            username: username.to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            created_at,
        })
    }

    /// Returns (username taken, email taken).
    pub async fn user_conflicts(&self, username: &str, email: &str) -> Result<(bool, bool)> {
        let row = sqlx::query(
            r#"
            SELECT
                EXISTS(SELECT 1 FROM users WHERE username = ?) AS username_taken,
                EXISTS(SELECT 1 FROM users WHERE email = ?) AS email_taken
            "#,
        )
        .bind(username)
        .bind(email)
        .fetch_one(&self.pool)
        .await?;

        Ok((row.get("username_taken"), row.get("email_taken")))
    }

    pub async fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, username, email, password_hash, created_at FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_user))
    }

    #[cfg(test)]
    pub async fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, username, email, password_hash, created_at FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_user))
    }

    pub async fn delete_user(&self, user_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn create_session(&self, user_id: i64) -> Result<String> {
        let token = Uuid::new_v4().simple().to_string();
        sqlx::query("INSERT INTO sessions (token, user_id, created_at) VALUES (?, ?, ?)")
            .bind(&token)
            .bind(user_id)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;

        Ok(token)
    }

    pub async fn user_for_token(&self, token: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT u.id, u.username, u.email, u.password_hash, u.created_at
            FROM sessions s
            JOIN users u ON u.id = s.user_id
            WHERE s.token = ?
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_user))
    }

    pub async fn delete_session(&self, token: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- documents ----------------------------------------------------------

    pub async fn get_document_for_user(
        &self,
        document_id: i64,
        user_id: i64,
    ) -> Result<Option<Document>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, filename, original_filename, file_path, file_size, uploaded_at, is_indexed
            FROM documents
            WHERE id = ? AND user_id = ?
            "#,
        )
        .bind(document_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_document))
    }

    pub async fn list_documents(&self, user_id: i64) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, filename, original_filename, file_path, file_size, uploaded_at, is_indexed
            FROM documents
            WHERE user_id = ?
            ORDER BY uploaded_at DESC, id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_document).collect())
    }

    pub async fn has_indexed_documents(&self, user_id: i64) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM documents WHERE user_id = ? AND is_indexed = 1) AS present",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("present"))
    }

    #[cfg(test)]
    pub async fn get_chunks(&self, document_id: i64) -> Result<Vec<DocumentChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, chunk_index, page_number, content_preview
            FROM document_chunks
            WHERE document_id = ?
            ORDER BY chunk_index ASC
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_chunk).collect())
    }

    // -- conversations and messages -----------------------------------------

    pub async fn create_conversation(&self, user_id: i64) -> Result<Conversation> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO conversations (user_id, created_at, updated_at) VALUES (?, ?, ?)",
        )
        .bind(user_id)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(Conversation {
            id,
            user_id,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get_conversation_for_user(
        &self,
        conversation_id: i64,
        user_id: i64,
    ) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, created_at, updated_at
            FROM conversations
            WHERE id = ? AND user_id = ?
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Conversation {
            id: r.get("id"),
            user_id: r.get("user_id"),
            created_at: parse_timestamp(&r.get::<String, _>("created_at")),
            updated_at: parse_timestamp(&r.get::<String, _>("updated_at")),
        }))
    }

    #[cfg(test)]
    pub async fn count_conversations(&self, user_id: i64) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM conversations WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("total"))
    }

    pub async fn list_conversation_summaries(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<ConversationSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT
                c.id,
                c.created_at,
                (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id) AS message_count,
                (SELECT m.content FROM messages m WHERE m.conversation_id = c.id ORDER BY m.id ASC LIMIT 1) AS first_content
            FROM conversations c
            WHERE c.user_id = ?
            ORDER BY c.updated_at DESC, c.id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ConversationSummary {
                id: r.get("id"),
                created_at: parse_timestamp(&r.get::<String, _>("created_at")),
                message_count: r.get("message_count"),
                preview: r
                    .get::<Option<String>, _>("first_content")
                    .map(|content| crate::models::truncate_chars(&content, 100))
                    .unwrap_or_default(),
            })
            .collect())
    }

    pub async fn add_message(
        &self,
        conversation_id: i64,
        role: Role,
        content: &str,
    ) -> Result<Message> {
        let mut tx = self.pool.begin().await?;
        let message = insert_message_tx(&mut tx, conversation_id, role, content).await?;
        tx.commit().await?;
        Ok(message)
    }

    pub async fn list_messages(&self, conversation_id: i64) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, role, content, created_at
            FROM messages
            WHERE conversation_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_message).collect())
    }

    /// Messages with citations and feedback attached to assistant turns.
    pub async fn message_views(&self, conversation_id: i64) -> Result<Vec<MessageView>> {
        let messages = self.list_messages(conversation_id).await?;
        let mut out = Vec::with_capacity(messages.len());

        for message in messages {
            let (citations, feedback) = if message.role == Role::Assistant {
                let rows = sqlx::query(
                    r#"
                    SELECT c.id, c.page_number, c.content_snippet, d.original_filename
                    FROM citations c
                    LEFT JOIN documents d ON d.id = c.document_id
                    WHERE c.message_id = ?
                    ORDER BY c.id ASC
                    "#,
                )
                .bind(message.id)
                .fetch_all(&self.pool)
                .await?;

                let citations = rows
                    .into_iter()
                    .map(|r| CitationView {
                        id: r.get("id"),
                        source: r
                            .get::<Option<String>, _>("original_filename")
                            .unwrap_or_else(|| "Unknown".to_string()),
                        page: r.get("page_number"),
                        preview: r.get("content_snippet"),
                    })
                    .collect();

                let rating = sqlx::query(
                    "SELECT rating FROM feedbacks WHERE message_id = ? ORDER BY id ASC LIMIT 1",
                )
                .bind(message.id)
                .fetch_optional(&self.pool)
                .await?
                .and_then(|r| Rating::parse(&r.get::<String, _>("rating")));

                (Some(citations), rating)
            } else {
                (None, None)
            };

            out.push(MessageView {
                id: message.id,
                role: message.role,
                content: message.content,
                created_at: message.created_at,
                citations,
                feedback,
            });
        }

        Ok(out)
    }

    /// Owner of the conversation a message belongs to.
    pub async fn message_owner(&self, message_id: i64) -> Result<Option<i64>> {
        let row = sqlx::query(
            r#"
            SELECT c.user_id
            FROM messages m
            JOIN conversations c ON c.id = m.conversation_id
            WHERE m.id = ?
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get("user_id")))
    }

    // -- citations ----------------------------------------------------------

    #[cfg(test)]
    pub async fn citations_for_message(&self, message_id: i64) -> Result<Vec<Citation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, message_id, document_id, chunk_id, page_number, relevance_score, content_snippet
            FROM citations
            WHERE message_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_citation).collect())
    }

    // -- feedback -----------------------------------------------------------

    pub async fn upsert_feedback(
        &self,
        user_id: i64,
        message_id: i64,
        rating: Rating,
        comment: Option<&str>,
    ) -> Result<Feedback> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO feedbacks (user_id, message_id, rating, comment, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id, message_id) DO UPDATE SET
                rating = excluded.rating,
                comment = excluded.comment
            "#,
        )
        .bind(user_id)
        .bind(message_id)
        .bind(rating.as_str())
        .bind(comment)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            r#"
            SELECT id, user_id, message_id, rating, comment, created_at
            FROM feedbacks
            WHERE user_id = ? AND message_id = ?
            "#,
        )
        .bind(user_id)
        .bind(message_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(row_to_feedback(row))
    }

    #[cfg(test)]
    pub async fn feedback_for_message(&self, message_id: i64) -> Result<Vec<Feedback>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, message_id, rating, comment, created_at
            FROM feedbacks
            WHERE message_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_feedback).collect())
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub async fn insert_document_tx(
    tx: &mut Transaction<'_, Sqlite>,
    document: &NewDocument,
) -> Result<i64> {
    let id = sqlx::query(
        r#"
        INSERT INTO documents (user_id, filename, original_filename, file_path, file_size, uploaded_at, is_indexed)
        VALUES (?, ?, ?, ?, ?, ?, 0)
        "#,
    )
    .bind(document.user_id)
    .bind(&document.filename)
    .bind(&document.original_filename)
    .bind(&document.file_path)
    .bind(document.file_size)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut **tx)
    .await?
    .last_insert_rowid();

    Ok(id)
}

pub async fn insert_chunk_tx(
    tx: &mut Transaction<'_, Sqlite>,
    document_id: i64,
    chunk_index: i64,
    page_number: Option<i64>,
    content_preview: &str,
) -> Result<i64> {
    let id = sqlx::query(
        r#"
        INSERT INTO document_chunks (document_id, chunk_index, page_number, content_preview)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(document_id)
    .bind(chunk_index)
    .bind(page_number)
    .bind(content_preview)
    .execute(&mut **tx)
    .await?
    .last_insert_rowid();

    Ok(id)
}

pub async fn mark_indexed_tx(tx: &mut Transaction<'_, Sqlite>, document_id: i64) -> Result<()> {
    sqlx::query("UPDATE documents SET is_indexed = 1 WHERE id = ?")
        .bind(document_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Chunks go with the document; citation references are nulled by the schema.
pub async fn delete_document_tx(tx: &mut Transaction<'_, Sqlite>, document_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(document_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn insert_message_tx(
    tx: &mut Transaction<'_, Sqlite>,
    conversation_id: i64,
    role: Role,
    content: &str,
) -> Result<Message> {
    let created_at = Utc::now();
    let id = sqlx::query(
        "INSERT INTO messages (conversation_id, role, content, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(conversation_id)
    .bind(role.as_str())
    .bind(content)
    .bind(created_at.to_rfc3339())
    .execute(&mut **tx)
    .await?
    .last_insert_rowid();

    sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
        .bind(created_at.to_rfc3339())
        .bind(conversation_id)
        .execute(&mut **tx)
        .await?;

    Ok(Message {
        id,
        conversation_id,
        role,
        content: content.to_string(),
        created_at,
    })
}

pub async fn insert_citation_tx(
    tx: &mut Transaction<'_, Sqlite>,
    message_id: i64,
    citation: &NewCitation,
) -> Result<i64> {
    let id = sqlx::query(
        r#"
        INSERT INTO citations (message_id, document_id, chunk_id, page_number, relevance_score, content_snippet)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(message_id)
    .bind(citation.document_id)
    .bind(citation.chunk_id)
    .bind(citation.page_number)
    .bind(citation.relevance_score)
    .bind(&citation.content_snippet)
    .execute(&mut **tx)
    .await?
    .last_insert_rowid();

    Ok(id)
}

/// Best-effort mapping of a retrieved passage back to stored rows.
///
/// The document is matched on its stored path. The chunk prefers the id carried
/// in the passage payload and otherwise takes the first chunk on the same page.
pub async fn resolve_citation_refs_tx(
    tx: &mut Transaction<'_, Sqlite>,
    source: Option<&str>,
    page: Option<i64>,
    chunk_hint: Option<i64>,
) -> Result<(Option<i64>, Option<i64>)> {
    let Some(source) = source else {
        return Ok((None, None));
    };

    let document_id: Option<i64> =
        sqlx::query("SELECT id FROM documents WHERE file_path = ? ORDER BY id ASC LIMIT 1")
            .bind(source)
            .fetch_optional(&mut **tx)
            .await?
            .map(|r| r.get("id"));

    let Some(document_id) = document_id else {
        return Ok((None, None));
    };

    if let Some(hint) = chunk_hint {
        let hinted: Option<i64> =
            sqlx::query("SELECT id FROM document_chunks WHERE id = ? AND document_id = ?")
                .bind(hint)
                .bind(document_id)
                .fetch_optional(&mut **tx)
                .await?
                .map(|r| r.get("id"));
        if hinted.is_some() {
            return Ok((Some(document_id), hinted));
        }
    }

    let Some(page) = page else {
        return Ok((Some(document_id), None));
    };

    let chunk_id: Option<i64> = sqlx::query(
        r#"
        SELECT id FROM document_chunks
        WHERE document_id = ? AND page_number = ?
        ORDER BY chunk_index ASC
        LIMIT 1
        "#,
    )
    .bind(document_id)
    .bind(page)
    .fetch_optional(&mut **tx)
    .await?
    .map(|r| r.get("id"));

    Ok((Some(document_id), chunk_id))
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_user(row: SqliteRow) -> User {
    User {
        id: row.get("id"),
        username: row.get("username"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at")),
    }
}

fn row_to_document(row: SqliteRow) -> Document {
    Document {
        id: row.get("id"),
        user_id: row.get("user_id"),
        filename: row.get("filename"),
        original_filename: row.get("original_filename"),
        file_path: row.get("file_path"),
        file_size: row.get("file_size"),
        uploaded_at: parse_timestamp(&row.get::<String, _>("uploaded_at")),
        is_indexed: row.get("is_indexed"),
    }
}

#[cfg(test)]
fn row_to_chunk(row: SqliteRow) -> DocumentChunk {
    DocumentChunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        page_number: row.get("page_number"),
        content_preview: row.get("content_preview"),
    }
}

fn row_to_message(row: SqliteRow) -> Message {
    Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        role: Role::from_db(&row.get::<String, _>("role")),
        content: row.get("content"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at")),
    }
}

#[cfg(test)]
fn row_to_citation(row: SqliteRow) -> Citation {
    Citation {
        id: row.get("id"),
        message_id: row.get("message_id"),
        document_id: row.get("document_id"),
        chunk_id: row.get("chunk_id"),
        page_number: row.get("page_number"),
        relevance_score: row.get("relevance_score"),
        content_snippet: row.get("content_snippet"),
    }
}

fn row_to_feedback(row: SqliteRow) -> Feedback {
    Feedback {
        id: row.get("id"),
        user_id: row.get("user_id"),
        message_id: row.get("message_id"),
        rating: Rating::parse(&row.get::<String, _>("rating")).unwrap_or(Rating::Negative),
        comment: row.get("comment"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed_user(db: &Database, name: &str) -> User {
        db.create_user(name, &format!("{name}@example.com"), "sha256$1$salt$hash")
            .await
            .unwrap()
    }

    async fn seed_document(db: &Database, user_id: i64, path: &str, pages: &[i64]) -> (i64, Vec<i64>) {
        let mut tx = db.begin().await.unwrap();
        let document_id = insert_document_tx(
            &mut tx,
            &NewDocument {
                user_id,
                filename: "uuid_notes.pdf".to_string(),
                original_filename: "notes.pdf".to_string(),
                file_path: path.to_string(),
                file_size: 1024,
            },
        )
        .await
        .unwrap();

        let mut chunk_ids = Vec::new();
        for (index, page) in pages.iter().enumerate() {
            let id = insert_chunk_tx(&mut tx, document_id, index as i64, Some(*page), "preview")
                .await
                .unwrap();
            chunk_ids.push(id);
        }
        mark_indexed_tx(&mut tx, document_id).await.unwrap();
        tx.commit().await.unwrap();
        (document_id, chunk_ids)
    }

    async fn seed_assistant_message(db: &Database, user_id: i64) -> Message {
        let conversation = db.create_conversation(user_id).await.unwrap();
        db.add_message(conversation.id, Role::User, "what is anemia?")
            .await
            .unwrap();
        db.add_message(conversation.id, Role::Assistant, "Anemia is ...")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn deleting_document_nulls_citation_refs_and_keeps_rows() {
        let db = Database::in_memory().await.unwrap();
        let user = seed_user(&db, "alice").await;
        let (document_id, chunk_ids) = seed_document(&db, user.id, "/up/a.pdf", &[0, 1]).await;
        let message = seed_assistant_message(&db, user.id).await;

        let mut tx = db.begin().await.unwrap();
        insert_citation_tx(
            &mut tx,
            message.id,
            &NewCitation {
                document_id: Some(document_id),
                chunk_id: Some(chunk_ids[1]),
                page_number: Some(1),
                relevance_score: 0.8,
                content_snippet: "iron deficiency".to_string(),
            },
        )
        .await
        .unwrap();
        insert_citation_tx(
            &mut tx,
            message.id,
            &NewCitation {
                document_id: Some(document_id),
                chunk_id: None,
                page_number: None,
                relevance_score: 0.5,
                content_snippet: "fatigue".to_string(),
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let mut tx = db.begin().await.unwrap();
        delete_document_tx(&mut tx, document_id).await.unwrap();
        tx.commit().await.unwrap();

        let citations = db.citations_for_message(message.id).await.unwrap();
        assert_eq!(citations.len(), 2);
        assert!(citations
            .iter()
            .all(|c| c.document_id.is_none() && c.chunk_id.is_none()));
        assert_eq!(citations[0].content_snippet, "iron deficiency");
        assert!(db.get_chunks(document_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleting_document_cascades_to_chunks_only_for_that_document() {
        let db = Database::in_memory().await.unwrap();
        let user = seed_user(&db, "bob").await;
        let (first, _) = seed_document(&db, user.id, "/up/a.pdf", &[0, 0, 1]).await;
        let (second, _) = seed_document(&db, user.id, "/up/b.pdf", &[2]).await;

        let mut tx = db.begin().await.unwrap();
        delete_document_tx(&mut tx, first).await.unwrap();
        tx.commit().await.unwrap();

        assert!(db.get_chunks(first).await.unwrap().is_empty());
        assert_eq!(db.get_chunks(second).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let db = Database::in_memory().await.unwrap();
        let user = seed_user(&db, "carol").await;

        {
            let mut tx = db.begin().await.unwrap();
            insert_document_tx(
                &mut tx,
                &NewDocument {
                    user_id: user.id,
                    filename: "f".to_string(),
                    original_filename: "f.pdf".to_string(),
                    file_path: "/up/f.pdf".to_string(),
                    file_size: 1,
                },
            )
            .await
            .unwrap();
        }

        assert!(db.list_documents(user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn feedback_upsert_updates_existing_row() {
        let db = Database::in_memory().await.unwrap();
        let user = seed_user(&db, "dave").await;
        let message = seed_assistant_message(&db, user.id).await;

        let first = db
            .upsert_feedback(user.id, message.id, Rating::Positive, Some("clear"))
            .await
            .unwrap();
        let second = db
            .upsert_feedback(user.id, message.id, Rating::Negative, Some("outdated"))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        let rows = db.feedback_for_message(message.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rating, Rating::Negative);
        assert_eq!(rows[0].comment.as_deref(), Some("outdated"));
    }

    #[tokio::test]
    async fn deleting_user_cascades_to_owned_rows() {
        let db = Database::in_memory().await.unwrap();
        let user = seed_user(&db, "erin").await;
        let other = seed_user(&db, "frank").await;
        seed_document(&db, user.id, "/up/e.pdf", &[0]).await;
        let message = seed_assistant_message(&db, user.id).await;
        db.upsert_feedback(user.id, message.id, Rating::Positive, None)
            .await
            .unwrap();
        let token = db.create_session(user.id).await.unwrap();
        seed_assistant_message(&db, other.id).await;

        db.delete_user(user.id).await.unwrap();

        assert!(db.list_documents(user.id).await.unwrap().is_empty());
        assert_eq!(db.count_conversations(user.id).await.unwrap(), 0);
        assert!(db.feedback_for_message(message.id).await.unwrap().is_empty());
        assert!(db.user_for_token(&token).await.unwrap().is_none());
        assert_eq!(db.count_conversations(other.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn citation_resolution_prefers_chunk_hint_then_page() {
        let db = Database::in_memory().await.unwrap();
        let user = seed_user(&db, "gina").await;
        let (document_id, chunk_ids) = seed_document(&db, user.id, "/up/g.pdf", &[3, 3, 4]).await;

        let mut tx = db.begin().await.unwrap();
        let by_hint = resolve_citation_refs_tx(&mut tx, Some("/up/g.pdf"), Some(3), Some(chunk_ids[1]))
            .await
            .unwrap();
        let by_page = resolve_citation_refs_tx(&mut tx, Some("/up/g.pdf"), Some(3), None)
            .await
            .unwrap();
        let foreign_hint = resolve_citation_refs_tx(&mut tx, Some("/up/g.pdf"), Some(4), Some(9_999))
            .await
            .unwrap();
        let no_page = resolve_citation_refs_tx(&mut tx, Some("/up/g.pdf"), Some(12), None)
            .await
            .unwrap();
        let unknown = resolve_citation_refs_tx(&mut tx, Some("/elsewhere.pdf"), Some(3), None)
            .await
            .unwrap();
        drop(tx);

        assert_eq!(by_hint, (Some(document_id), Some(chunk_ids[1])));
        assert_eq!(by_page, (Some(document_id), Some(chunk_ids[0])));
        assert_eq!(foreign_hint, (Some(document_id), Some(chunk_ids[2])));
        assert_eq!(no_page, (Some(document_id), None));
        assert_eq!(unknown, (None, None));
    }

    #[tokio::test]
    async fn conversation_summaries_carry_count_and_preview() {
        let db = Database::in_memory().await.unwrap();
        let user = seed_user(&db, "hank").await;
        let conversation = db.create_conversation(user.id).await.unwrap();
        let long_question = "x".repeat(150);
        db.add_message(conversation.id, Role::User, &long_question)
            .await
            .unwrap();
        db.add_message(conversation.id, Role::Assistant, "answer")
            .await
            .unwrap();
        db.create_conversation(user.id).await.unwrap();

        let summaries = db.list_conversation_summaries(user.id, 20).await.unwrap();
        assert_eq!(summaries.len(), 2);
        let summary = summaries.iter().find(|s| s.id == conversation.id).unwrap();
        assert_eq!(summary.message_count, 2);
        assert_eq!(summary.preview.len(), 100);
        let empty = summaries.iter().find(|s| s.id != conversation.id).unwrap();
        assert_eq!(empty.message_count, 0);
        assert!(empty.preview.is_empty());
    }

    #[tokio::test]
    async fn message_views_attach_citations_and_feedback() {
        let db = Database::in_memory().await.unwrap();
        let user = seed_user(&db, "ivy").await;
        let (document_id, _) = seed_document(&db, user.id, "/up/i.pdf", &[0]).await;
        let message = seed_assistant_message(&db, user.id).await;

        let mut tx = db.begin().await.unwrap();
        insert_citation_tx(
            &mut tx,
            message.id,
            &NewCitation {
                document_id: Some(document_id),
                chunk_id: None,
                page_number: Some(0),
                relevance_score: 0.9,
                content_snippet: "hemoglobin".to_string(),
            },
        )
        .await
        .unwrap();
        insert_citation_tx(
            &mut tx,
            message.id,
            &NewCitation {
                document_id: None,
                chunk_id: None,
                page_number: None,
                relevance_score: 0.4,
                content_snippet: "global text".to_string(),
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        db.upsert_feedback(user.id, message.id, Rating::Positive, None)
            .await
            .unwrap();

        let views = db.message_views(message.conversation_id).await.unwrap();
        assert_eq!(views.len(), 2);
        assert!(views[0].citations.is_none());
        let citations = views[1].citations.as_ref().unwrap();
        assert_eq!(citations[0].source, "notes.pdf");
        assert_eq!(citations[1].source, "Unknown");
        assert_eq!(views[1].feedback, Some(Rating::Positive));
    }

    #[tokio::test]
    async fn sessions_resolve_to_users() {
        let db = Database::in_memory().await.unwrap();
        let user = seed_user(&db, "jack").await;
        let token = db.create_session(user.id).await.unwrap();

        let resolved = db.user_for_token(&token).await.unwrap().unwrap();
        assert_eq!(resolved.id, user.id);

        db.delete_session(&token).await.unwrap();
        assert!(db.user_for_token(&token).await.unwrap().is_none());
        assert_eq!(db.user_conflicts("jack", "new@example.com").await.unwrap(), (true, false));
    }
}
