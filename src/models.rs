use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Owner tag value for passages in the shared corpus.
pub const GLOBAL_OWNER: &str = "global";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "assistant" => Role::Assistant,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    Positive,
    Negative,
}

impl Rating {
    pub fn as_str(self) -> &'static str {
        match self {
            Rating::Positive => "positive",
            Rating::Negative => "negative",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "positive" => Some(Rating::Positive),
            "negative" => Some(Rating::Negative),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: i64,
    pub user_id: i64,
    pub filename: String,
    pub original_filename: String,
    pub file_path: String,
    pub file_size: i64,
    pub uploaded_at: DateTime<Utc>,
    pub is_indexed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentChunk {
    pub id: i64,
    pub document_id: i64,
    pub chunk_index: i64,
    pub page_number: Option<i64>,
    pub content_preview: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: i64,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    pub id: i64,
    pub message_id: i64,
    pub document_id: Option<i64>,
    pub chunk_id: Option<i64>,
    pub page_number: Option<i64>,
    pub relevance_score: Option<f64>,
    pub content_snippet: String,
}

/// A citation row before it is written, with references already resolved.
#[derive(Debug, Clone)]
pub struct NewCitation {
    pub document_id: Option<i64>,
    pub chunk_id: Option<i64>,
    pub page_number: Option<i64>,
    pub relevance_score: f64,
    pub content_snippet: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Feedback {
    pub id: i64,
    pub user_id: i64,
    pub message_id: i64,
    pub rating: Rating,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A loaded page or split window: text plus free-form metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub page_content: String,
    pub metadata: Map<String, Value>,
}

impl SourceDocument {
    pub fn source(&self) -> Option<&str> {
        self.metadata.get("source").and_then(Value::as_str)
    }

    pub fn page(&self) -> Option<i64> {
        self.metadata.get("page").and_then(Value::as_i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerTag {
    User(String),
    Global,
    Unset,
}

impl OwnerTag {
    pub fn from_payload(value: Option<&str>) -> Self {
        match value {
            None => OwnerTag::Unset,
            Some(GLOBAL_OWNER) => OwnerTag::Global,
            Some(owner) => OwnerTag::User(owner.to_string()),
        }
    }

    pub fn is_visible_to(&self, user_id: i64) -> bool {
        match self {
            OwnerTag::Global | OwnerTag::Unset => true,
            OwnerTag::User(owner) => *owner == user_id.to_string(),
        }
    }
}

/// Payload stored next to every vector and returned with search hits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
}

impl PassageMetadata {
    pub fn owner(&self) -> OwnerTag {
        OwnerTag::from_payload(self.user_id.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Passage {
    pub content: String,
    pub metadata: PassageMetadata,
    pub score: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<i64>,
    #[serde(default)]
    pub use_advanced_rag: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CitationView {
    pub id: i64,
    pub source: String,
    pub page: Option<i64>,
    pub preview: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Heartbeat,
    Token {
        content: String,
    },
    Citations {
        citations: Vec<CitationView>,
        conversation_id: i64,
    },
    Done {
        message_id: i64,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub message_count: i64,
    pub preview: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    pub id: i64,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<CitationView>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Rating>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackRequest {
    #[serde(default)]
    pub message_id: Option<i64>,
    #[serde(default)]
    pub rating: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub confirm_password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: User,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadedDocument {
    pub id: i64,
    pub filename: String,
    pub chunks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub document: UploadedDocument,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupResponse {
    pub success: bool,
    pub message: String,
    pub deleted_count: usize,
}

/// Truncates to at most `max_chars` characters without splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_tag_visibility() {
        assert!(OwnerTag::Global.is_visible_to(7));
        assert!(OwnerTag::Unset.is_visible_to(7));
        assert!(OwnerTag::User("7".to_string()).is_visible_to(7));
        assert!(!OwnerTag::User("8".to_string()).is_visible_to(7));
        assert_eq!(OwnerTag::from_payload(Some("global")), OwnerTag::Global);
    }

    #[test]
    fn stream_events_use_type_tag() {
        let json = serde_json::to_value(StreamEvent::Token {
            content: "fever ".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "token");
        assert_eq!(json["content"], "fever ");

        let json = serde_json::to_value(StreamEvent::Heartbeat).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "heartbeat" }));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("épée", 2), "ép");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
