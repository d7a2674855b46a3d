use std::net::SocketAddr;

use anyhow::Result;
use axum::extract::multipart::MultipartError;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::trace::TraceLayer;

use crate::auth::{hash_password, verify_password, CurrentUser};
use crate::chat::{ChatService, ChatTurn};
use crate::config::AppConfig;
use crate::db::Database;
use crate::ingest::{is_pdf_filename, IngestOutcome, Ingestor};
use crate::models::{
    ChatRequest, CleanupResponse, ConversationSummary, Document, FeedbackRequest, LoginRequest,
    LoginResponse, MessageView, Rating, RegisterRequest, Role, UploadResponse, UploadedDocument,
    User,
};

const CONVERSATION_LIST_LIMIT: i64 = 20;
const MIN_PASSWORD_CHARS: usize = 6;

#[derive(Clone)]
pub struct AppState {
    pub(crate) db: Database,
    pub(crate) chat: ChatService,
    pub(crate) ingestor: Ingestor,
}

impl AppState {
    pub fn new(db: Database, chat: ChatService, ingestor: Ingestor) -> Self {
        Self { db, chat, ingestor }
    }
}

pub fn build_router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/account", delete(delete_account))
        .route("/api/chat/stream", post(chat_stream))
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/:id/messages", get(conversation_messages))
        .route("/api/feedback", post(submit_feedback))
        .route("/api/upload", post(upload_document))
        .route("/api/documents", get(list_documents))
        .route("/api/documents/:id", delete(delete_document))
        .route("/api/cleanup-vectors", post(cleanup_vectors))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(config: AppConfig, state: AppState) -> Result<()> {
    tokio::fs::create_dir_all(&config.upload_dir).await?;

    let app = build_router(state, config.max_upload_bytes);

    let addr: SocketAddr = config.bind_addr.parse()?;
    tracing::info!("listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// -- auth ---------------------------------------------------------------------

async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    let Json(request) = payload?;
    let username = request.username.trim();
    let email = request.email.trim();

    if username.is_empty() || email.is_empty() || request.password.is_empty() {
        return Err(ApiError::bad_request("All fields are required"));
    }
    if request.password.chars().count() < MIN_PASSWORD_CHARS {
        return Err(ApiError::bad_request(format!(
            "Password must be at least {MIN_PASSWORD_CHARS} characters"
        )));
    }
    if request.password != request.confirm_password {
        return Err(ApiError::bad_request("Passwords do not match"));
    }

    match state.db.user_conflicts(username, email).await? {
        (true, _) => return Err(ApiError::conflict("Username already exists")),
        (_, true) => return Err(ApiError::conflict("Email already registered")),
        _ => {}
    }

    let user = state
        .db
        .create_user(username, email, &hash_password(&request.password).await?)
        .await?;
    tracing::info!("registered user {} ({})", user.username, user.id);

    Ok((StatusCode::CREATED, Json(user)))
}

async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, ApiError> {
    let Json(request) = payload?;
    let invalid = || ApiError::unauthorized("Invalid username or password");

    let user = state
        .db
        .find_user_by_username(request.username.trim())
        .await?
        .ok_or_else(invalid)?;
    if !verify_password(&request.password, &user.password_hash).await? {
        return Err(invalid());
    }

    let token = state.db.create_session(user.id).await?;
    Ok(Json(LoginResponse { token, user }))
}

async fn logout(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<Value>, ApiError> {
    state.db.delete_session(&current.token).await?;
    Ok(Json(json!({ "success": true })))
}

async fn delete_account(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<Value>, ApiError> {
    let user_id = current.user.id;
    let removed = state.ingestor.purge_user_documents(user_id).await?;
    state.db.delete_user(user_id).await?;
    tracing::info!("deleted account {} and {} document(s)", user_id, removed);

    Ok(Json(json!({ "success": true })))
}

// -- chat ---------------------------------------------------------------------

async fn chat_stream(
    State(state): State<AppState>,
    current: CurrentUser,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let message = request
        .message
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ApiError::bad_request("Message is required"))?
        .to_string();
    let user_id = current.user.id;

    let conversation = match request.conversation_id {
        Some(id) => state
            .db
            .get_conversation_for_user(id, user_id)
            .await?
            .ok_or_else(|| ApiError::not_found("Conversation not found"))?,
        None => state.db.create_conversation(user_id).await?,
    };

    state
        .db
        .add_message(conversation.id, Role::User, &message)
        .await?;

    let events = state.chat.stream_turn(ChatTurn {
        user_id,
        conversation_id: conversation.id,
        message,
        use_advanced_rag: request.use_advanced_rag,
    });

    let stream = ReceiverStream::new(events).map(|event| Event::default().json_data(&event));

    Ok((
        [(
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        )],
        Sse::new(stream),
    )
        .into_response())
}

// -- conversations and feedback -----------------------------------------------

async fn list_conversations(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    let summaries = state
        .db
        .list_conversation_summaries(current.user.id, CONVERSATION_LIST_LIMIT)
        .await?;
    Ok(Json(summaries))
}

async fn conversation_messages(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(conversation_id): Path<i64>,
) -> Result<Json<Vec<MessageView>>, ApiError> {
    state
        .db
        .get_conversation_for_user(conversation_id, current.user.id)
        .await?
        .ok_or_else(|| ApiError::not_found("Conversation not found"))?;

    Ok(Json(state.db.message_views(conversation_id).await?))
}

async fn submit_feedback(
    State(state): State<AppState>,
    current: CurrentUser,
    payload: Result<Json<FeedbackRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload?;
    let (Some(message_id), Some(rating)) = (
        request.message_id,
        request.rating.as_deref().and_then(Rating::parse),
    ) else {
        return Err(ApiError::bad_request("Invalid request"));
    };

    if state.db.message_owner(message_id).await? != Some(current.user.id) {
        return Err(ApiError::not_found("Message not found"));
    }

    state
        .db
        .upsert_feedback(current.user.id, message_id, rating, request.comment.as_deref())
        .await?;

    Ok(Json(json!({ "success": true })))
}

// -- documents ----------------------------------------------------------------

async fn upload_document(
    State(state): State<AppState>,
    current: CurrentUser,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await?;
        upload = Some((filename, bytes));
        break;
    }

    let Some((filename, bytes)) = upload else {
        return Err(ApiError::bad_request("No file provided"));
    };
    if filename.trim().is_empty() {
        return Err(ApiError::bad_request("No file selected"));
    }
    if !is_pdf_filename(&filename) {
        return Err(ApiError::bad_request("Only PDF files are supported"));
    }

    match state
        .ingestor
        .ingest_upload(current.user.id, &filename, &bytes)
        .await?
    {
        IngestOutcome::Indexed(indexed) => Ok(Json(UploadResponse {
            success: true,
            document: UploadedDocument {
                id: indexed.document_id,
                filename: indexed.filename,
                chunks: indexed.chunk_count,
            },
        })),
        IngestOutcome::Empty => Err(ApiError::bad_request(
            "PDF appears to be empty or could not be processed. Please check the file.",
        )),
        IngestOutcome::Unreadable(reason) => Err(ApiError::bad_request(format!(
            "Could not read PDF: {reason}"
        ))),
    }
}

async fn list_documents(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<Vec<Document>>, ApiError> {
    Ok(Json(state.ingestor.live_documents(current.user.id).await?))
}

async fn delete_document(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(document_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    if !state
        .ingestor
        .delete_document(current.user.id, document_id)
        .await?
    {
        return Err(ApiError::not_found("Document not found"));
    }
    Ok(Json(json!({ "success": true })))
}

async fn cleanup_vectors(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<CleanupResponse>, ApiError> {
    let deleted_count = state
        .ingestor
        .purge_user_documents(current.user.id)
        .await?;

    Ok(Json(CleanupResponse {
        success: true,
        message: format!(
            "Cleaned up vector store and deleted {deleted_count} document(s) from your account."
        ),
        deleted_count,
    }))
}

// -- errors -------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        tracing::error!("request failed: {value:#}");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, value.to_string())
    }
}

/// Malformed bodies keep axum's status but get the `{"error"}` shape.
impl From<JsonRejection> for ApiError {
    fn from(value: JsonRejection) -> Self {
        Self::new(value.status(), value.body_text())
    }
}

impl From<MultipartError> for ApiError {
    fn from(value: MultipartError) -> Self {
        Self::new(value.status(), value.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}
