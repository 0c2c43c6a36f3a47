//! HTTP server for the chat widget and the admin panel.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Chat widget page |
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/api/sessions` | Start a session |
//! | `GET`  | `/api/sessions/{id}` | Session messages and admin flag |
//! | `POST` | `/api/sessions/{id}/messages` | Run one chat turn |
//! | `POST` | `/api/sessions/{id}/admin/unlock` | Password-field unlock |
//! | `POST` | `/api/sessions/{id}/admin/knowledge` | Replace knowledge (multipart) |
//! | `GET`  | `/api/sessions/{id}/export` | Chat log as CSV |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "unauthorized", "message": "admin panel is locked" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `not_found` (404),
//! `no_content` (422), `too_many_attempts` (429), `internal` (500).

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::chat::{ChatLoop, TurnOutcome};
use crate::completion::CompletionClient;
use crate::config::{Config, Secrets, UnlockMethod};
use crate::export::{export_turns_to_string, EXPORT_FILE_NAME};
use crate::ingest::{save_knowledge, IngestError, IngestFailure, IngestReport, Upload};
use crate::knowledge::KnowledgeStore;
use crate::session::{self, Message, Session, SessionStore, UnlockError, UnlockStatus};

const INDEX_HTML: &str = include_str!("../static/index.html");
const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    chat: Arc<ChatLoop>,
    sessions: Arc<SessionStore>,
    greeting: Arc<str>,
    max_history: usize,
}

impl AppState {
    pub fn new(config: &Config, chat: ChatLoop) -> Self {
        Self {
            chat: Arc::new(chat),
            sessions: Arc::new(SessionStore::new()),
            greeting: Arc::from(config.chat.greeting.as_str()),
            max_history: config.chat.max_history,
        }
    }
}

/// Starts the server on `[server].bind` and runs until the process exits.
pub async fn run_server(config: &Config, secrets: Secrets) -> anyhow::Result<()> {
    let client = CompletionClient::from_config(&config.completion, secrets.api_key)?;
    let store = KnowledgeStore::from_config(&config.knowledge);
    let chat = ChatLoop::new(config, store, client, secrets.admin_secret);
    let state = AppState::new(config, chat);

    let idle = config.server.session_idle_secs;
    session::spawn_idle_sweeper(
        state.sessions.clone(),
        chrono::Duration::seconds(idle as i64),
        Duration::from_secs(idle.clamp(1, 60)),
    );
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        knowledge = %config.knowledge.path.display(),
        mode = ?config.chat.mode,
        "chat server listening"
    );
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_index))
        .route("/health", get(handle_health))
        .route("/api/sessions", post(handle_create_session))
        .route("/api/sessions/{id}", get(handle_get_session))
        .route("/api/sessions/{id}/messages", post(handle_message))
        .route("/api/sessions/{id}/admin/unlock", post(handle_unlock))
        .route("/api/sessions/{id}/admin/knowledge", post(handle_upload_knowledge))
        .route("/api/sessions/{id}/export", get(handle_export))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    failures: Vec<IngestFailure>,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    failures: Vec<IngestFailure>,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            failures: Vec::new(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
                failures: self.failures,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

fn internal(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

impl From<UnlockError> for AppError {
    fn from(e: UnlockError) -> Self {
        match e {
            UnlockError::WrongSecret { .. } => unauthorized(e.to_string()),
            UnlockError::LockedOut { .. } => {
                AppError::new(StatusCode::TOO_MANY_REQUESTS, "too_many_attempts", e.to_string())
            }
        }
    }
}

impl From<IngestError> for AppError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::NoContent { failures } => AppError {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                code: "no_content",
                message: "No content to save".to_string(),
                failures,
            },
            IngestError::Store(e) => internal(format!("{:#}", e)),
        }
    }
}

fn lookup(state: &AppState, id: &str) -> Result<Arc<Mutex<Session>>, AppError> {
    let id: Uuid = id
        .parse()
        .map_err(|_| bad_request(format!("invalid session id: {}", id)))?;
    state
        .sessions
        .get(&id)
        .ok_or_else(|| not_found(format!("session not found: {}", id)))
}

// ============ GET / and /health ============

async fn handle_index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Sessions ============

#[derive(Serialize)]
struct SessionView {
    id: Uuid,
    messages: Vec<Message>,
    admin_unlocked: bool,
    unlock_method: &'static str,
}

impl SessionView {
    fn of(session: &Session, method: UnlockMethod) -> Self {
        Self {
            id: session.id(),
            messages: session.messages().to_vec(),
            admin_unlocked: session.admin_unlocked(),
            unlock_method: match method {
                UnlockMethod::Chat => "chat",
                UnlockMethod::Password => "password",
            },
        }
    }
}

async fn handle_create_session(State(state): State<AppState>) -> Json<SessionView> {
    let (_, handle) = state.sessions.create(&state.greeting, state.max_history);
    let session = handle.lock().await;
    Json(SessionView::of(&session, state.chat.unlock_method()))
}

async fn handle_get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, AppError> {
    let handle = lookup(&state, &id)?;
    let session = handle.lock().await;
    Ok(Json(SessionView::of(&session, state.chat.unlock_method())))
}

// ============ POST /api/sessions/{id}/messages ============

#[derive(Deserialize)]
struct MessageRequest {
    content: String,
    /// Set by the admin page; enables inline secret entry.
    #[serde(default)]
    admin: bool,
}

#[derive(Serialize)]
struct MessageResponse {
    outcome: TurnOutcome,
    reply: Option<String>,
    messages: Vec<Message>,
    admin_unlocked: bool,
}

/// Runs one turn while holding the session lock, so a session never has two
/// turns in flight.
async fn handle_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MessageRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    let handle = lookup(&state, &id)?;
    let mut session = handle.lock().await;

    let outcome = state
        .chat
        .handle_input(&mut session, &req.content, req.admin)
        .await;

    Ok(Json(MessageResponse {
        reply: outcome.reply().map(str::to_string),
        outcome,
        messages: session.messages().to_vec(),
        admin_unlocked: session.admin_unlocked(),
    }))
}

// ============ POST /api/sessions/{id}/admin/unlock ============

#[derive(Deserialize)]
struct UnlockRequest {
    password: String,
}

#[derive(Serialize)]
struct UnlockResponse {
    admin_unlocked: bool,
    already_unlocked: bool,
}

async fn handle_unlock(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UnlockRequest>,
) -> Result<Json<UnlockResponse>, AppError> {
    if state.chat.unlock_method() != UnlockMethod::Password {
        return Err(bad_request(
            "password unlock is disabled; type the secret in the admin chat",
        ));
    }

    let handle = lookup(&state, &id)?;
    let mut session = handle.lock().await;
    let status = state.chat.unlock_with_password(&mut session, &req.password)?;

    Ok(Json(UnlockResponse {
        admin_unlocked: true,
        already_unlocked: status == UnlockStatus::AlreadyUnlocked,
    }))
}

// ============ POST /api/sessions/{id}/admin/knowledge ============

/// Accepts repeated `file` parts and an optional `text` part.
async fn handle_upload_knowledge(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<IngestReport>, AppError> {
    let handle = lookup(&state, &id)?;
    if !handle.lock().await.admin_unlocked() {
        return Err(unauthorized("admin panel is locked"));
    }

    let mut uploads = Vec::new();
    let mut pasted: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let content_type = field.content_type().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("failed to read {}: {}", file_name, e)))?;
                if !bytes.is_empty() {
                    uploads.push(Upload::new(file_name, content_type, bytes.to_vec()));
                }
            }
            "text" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| bad_request(format!("failed to read text: {}", e)))?;
                pasted = Some(text);
            }
            _ => {}
        }
    }

    let store = state.chat.knowledge().clone();
    let report = tokio::task::spawn_blocking(move || {
        save_knowledge(&store, &uploads, pasted.as_deref())
    })
    .await
    .map_err(|e| internal(e.to_string()))??;

    Ok(Json(report))
}

// ============ GET /api/sessions/{id}/export ============

async fn handle_export(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let handle = lookup(&state, &id)?;
    let csv = {
        let session = handle.lock().await;
        export_turns_to_string(session.turns()).map_err(|e| internal(e.to_string()))?
    };

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", EXPORT_FILE_NAME),
            ),
        ],
        csv,
    )
        .into_response())
}
