//! JSON HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/documents` | Upload a document and enqueue indexing (202) |
//! | `GET`  | `/documents` | List the caller's documents |
//! | `GET`  | `/documents/{id}` | Fetch one document with status |
//! | `DELETE` | `/documents/{id}` | Enqueue deletion (202) |
//! | `POST` | `/documents/{id}/reindex` | Enqueue reindexing (202) |
//! | `GET`  | `/jobs/{id}` | Job state, progress, attempts |
//! | `POST` | `/search` | Similarity search over the caller's corpus |
//! | `POST` | `/query` | RAG answer with sources |
//! | `POST` | `/query/stream` | RAG answer as SSE events |
//! | `GET`/`POST` | `/profiles` | List / create profiles |
//! | `GET`/`PUT`/`DELETE` | `/profiles/{id}` | Fetch / update / delete a profile |
//! | `GET`  | `/conversations/{id}` | Conversation with its messages |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! All error responses share one schema:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "content must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `not_found`
//! (404), `unavailable` (503), `internal` (500).
//!
//! # Auth
//!
//! Requests carry `Authorization: Bearer <token>`; tokens map to user ids
//! through the configured [`SessionProvider`]. With no tokens configured
//! the server runs in single-user mode and every request acts as `local`.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::chat;
use crate::chunk::ChunkOverride;
use crate::config::AuthConfig;
use crate::error::Error;
use crate::extract::extract_text;
use crate::models::DocumentStatus;
use crate::profiles::{self, ProfileDraft};
use crate::queue::JobPayload;
use crate::rag::{QueryRequest, RagService, SearchRequest};
use crate::store::{self, NewDocument};
use crate::worker::PipelineContext;

// ============ Sessions ============

/// Maps a bearer token to a user id. Stand-in seam for whatever identity
/// system fronts the service.
pub trait SessionProvider: Send + Sync {
    fn user_for_token(&self, token: &str) -> Option<String>;

    /// User to act as when no token is presented. `None` means
    /// authentication is mandatory.
    fn anonymous_user(&self) -> Option<String> {
        None
    }
}

/// Static token table from config. An empty table switches to single-user
/// mode where every request acts as `local`.
pub struct StaticTokenProvider {
    tokens: HashMap<String, String>,
}

impl StaticTokenProvider {
    pub fn new(auth: &AuthConfig) -> Self {
        Self {
            tokens: auth
                .tokens
                .iter()
                .map(|t| (t.token.clone(), t.user_id.clone()))
                .collect(),
        }
    }
}

impl SessionProvider for StaticTokenProvider {
    fn user_for_token(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }

    fn anonymous_user(&self) -> Option<String> {
        self.tokens.is_empty().then(|| "local".to_string())
    }
}

// ============ State and entry point ============

#[derive(Clone)]
struct AppState {
    ctx: Arc<PipelineContext>,
    rag: Arc<RagService>,
    sessions: Arc<dyn SessionProvider>,
}

/// Start the HTTP server. Runs until the process is terminated; workers
/// are expected to be running in the same process.
pub async fn run_server(
    ctx: Arc<PipelineContext>,
    rag: Arc<RagService>,
    sessions: Arc<dyn SessionProvider>,
) -> anyhow::Result<()> {
    let bind_addr = ctx.config.server.bind.clone();
    let state = AppState { ctx, rag, sessions };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/documents", post(handle_create_document).get(handle_list_documents))
        .route("/documents/{id}", get(handle_get_document).delete(handle_delete_document))
        .route("/documents/{id}/reindex", post(handle_reindex_document))
        .route("/jobs/{id}", get(handle_get_job))
        .route("/search", post(handle_search))
        .route("/query", post(handle_query))
        .route("/query/stream", post(handle_query_stream))
        .route("/profiles", get(handle_list_profiles).post(handle_create_profile))
        .route(
            "/profiles/{id}",
            get(handle_get_profile)
                .put(handle_update_profile)
                .delete(handle_delete_profile),
        )
        .route("/conversations/{id}", get(handle_get_conversation))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    info!("listening on http://{}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
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
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        match &err {
            Error::Validation(m) => bad_request(m.clone()),
            Error::NotFound(m) => not_found(m.clone()),
            Error::Unauthorized(m) => unauthorized(m.clone()),
            Error::Transient(m) => AppError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                code: "unavailable".to_string(),
                message: m.clone(),
            },
            _ => AppError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "internal".to_string(),
                message: err.to_string(),
            },
        }
    }
}

/// Resolve the calling user from the Authorization header.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, AppError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match token {
        Some(token) => state
            .sessions
            .user_for_token(token)
            .ok_or_else(|| unauthorized("invalid token")),
        None => state
            .sessions
            .anonymous_user()
            .ok_or_else(|| unauthorized("missing bearer token")),
    }
}

// ============ Documents ============

#[derive(Deserialize)]
struct CreateDocumentRequest {
    title: String,
    /// Plain text body. Mutually exclusive with `content_base64`.
    #[serde(default)]
    content: Option<String>,
    /// Base64-encoded file body; requires `mime_type`.
    #[serde(default)]
    content_base64: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    profile_id: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
    /// Per-document chunking overrides for the index job.
    #[serde(default)]
    chunk_options: Option<ChunkOverride>,
}

#[derive(Serialize)]
struct EnqueuedResponse {
    document_id: String,
    job_id: String,
}

/// Decode and validate the upload body into extracted plain text.
fn upload_text(
    req: &CreateDocumentRequest,
    max_bytes: usize,
    allowed_mime_types: &[String],
) -> Result<String, AppError> {
    if req.title.trim().is_empty() {
        return Err(bad_request("title must not be empty"));
    }

    match (&req.content, &req.content_base64) {
        (Some(_), Some(_)) => Err(bad_request(
            "content and content_base64 are mutually exclusive",
        )),
        (None, None) => Err(bad_request("one of content or content_base64 is required")),
        (Some(text), None) => {
            if text.trim().is_empty() {
                return Err(bad_request("content must not be empty"));
            }
            if text.len() > max_bytes {
                return Err(bad_request(format!(
                    "content exceeds the {} byte limit",
                    max_bytes
                )));
            }
            Ok(text.clone())
        }
        (None, Some(encoded)) => {
            let mime = req
                .mime_type
                .as_deref()
                .ok_or_else(|| bad_request("mime_type is required with content_base64"))?;
            if !allowed_mime_types.iter().any(|m| m == mime) {
                return Err(bad_request(format!("unsupported mime type: {}", mime)));
            }
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|_| bad_request("content_base64 is not valid base64"))?;
            if bytes.is_empty() {
                return Err(bad_request("content must not be empty"));
            }
            if bytes.len() > max_bytes {
                return Err(bad_request(format!(
                    "content exceeds the {} byte limit",
                    max_bytes
                )));
            }
            let text = extract_text(&bytes, mime).map_err(AppError::from)?;
            if text.trim().is_empty() {
                return Err(bad_request("no text could be extracted from the file"));
            }
            Ok(text)
        }
    }
}

async fn handle_create_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateDocumentRequest>,
) -> Result<Response, AppError> {
    let owner = authenticate(&state, &headers)?;
    let text = upload_text(
        &req,
        state.ctx.config.upload.max_bytes,
        &state.ctx.config.upload.allowed_mime_types,
    )?;

    // A bad profile id should fail the request, not the background job.
    if let Some(pid) = req.profile_id.as_deref() {
        profiles::resolve_profile(&state.ctx.pool, &state.ctx.config, &owner, Some(pid)).await?;
    }

    let metadata_json = req
        .metadata
        .map(|m| m.to_string())
        .unwrap_or_else(|| "{}".to_string());
    let doc = store::insert_document(
        &state.ctx.pool,
        NewDocument {
            owner_id: owner,
            profile_id: req.profile_id.clone(),
            title: req.title.clone(),
            content: text,
            source: req.source.clone(),
            metadata_json,
        },
    )
    .await?;

    let job_id = state
        .ctx
        .queue
        .enqueue(&JobPayload::Index {
            document_id: doc.id.clone(),
            profile_id: req.profile_id,
            chunk_options: req.chunk_options,
        })
        .await?;
    // The job is queued, so the document is in flight from the caller's
    // point of view even before a worker claims it.
    store::set_status(&state.ctx.pool, &doc.id, DocumentStatus::Processing).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueuedResponse {
            document_id: doc.id,
            job_id,
        }),
    )
        .into_response())
}

async fn handle_list_documents(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let owner = authenticate(&state, &headers)?;
    let docs = store::list_documents(&state.ctx.pool, &owner).await?;
    // Content bodies can be megabytes; the list view omits them.
    let summaries: Vec<serde_json::Value> = docs
        .iter()
        .map(|d| {
            serde_json::json!({
                "id": d.id,
                "title": d.title,
                "status": d.status,
                "chunk_count": d.chunk_count,
                "profile_id": d.profile_id,
                "source": d.source,
                "error": d.error,
                "created_at": d.created_at,
                "updated_at": d.updated_at,
            })
        })
        .collect();
    Ok(Json(summaries).into_response())
}

async fn handle_get_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let owner = authenticate(&state, &headers)?;
    let doc = store::get_document(&state.ctx.pool, &id)
        .await?
        .filter(|d| d.owner_id == owner)
        .ok_or_else(|| not_found(format!("document {}", id)))?;
    Ok(Json(doc).into_response())
}

async fn handle_delete_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let owner = authenticate(&state, &headers)?;
    store::get_document(&state.ctx.pool, &id)
        .await?
        .filter(|d| d.owner_id == owner)
        .ok_or_else(|| not_found(format!("document {}", id)))?;

    let job_id = state
        .ctx
        .queue
        .enqueue(&JobPayload::Delete {
            document_id: id.clone(),
        })
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueuedResponse {
            document_id: id,
            job_id,
        }),
    )
        .into_response())
}

#[derive(Deserialize, Default)]
struct ReindexRequest {
    #[serde(default)]
    profile_id: Option<String>,
    /// Chunking overrides applied on the re-run.
    #[serde(default)]
    chunk_options: Option<ChunkOverride>,
}

async fn handle_reindex_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<ReindexRequest>>,
) -> Result<Response, AppError> {
    let owner = authenticate(&state, &headers)?;
    let req = body.map(|Json(r)| r).unwrap_or_default();
    store::get_document(&state.ctx.pool, &id)
        .await?
        .filter(|d| d.owner_id == owner)
        .ok_or_else(|| not_found(format!("document {}", id)))?;

    if let Some(pid) = req.profile_id.as_deref() {
        profiles::resolve_profile(&state.ctx.pool, &state.ctx.config, &owner, Some(pid)).await?;
    }

    let job_id = state
        .ctx
        .queue
        .enqueue(&JobPayload::Reindex {
            document_id: id.clone(),
            profile_id: req.profile_id,
            chunk_options: req.chunk_options,
        })
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueuedResponse {
            document_id: id,
            job_id,
        }),
    )
        .into_response())
}

// ============ Jobs ============

async fn handle_get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    authenticate(&state, &headers)?;
    let job = state
        .ctx
        .queue
        .get(&id)
        .await?
        .ok_or_else(|| not_found(format!("job {}", id)))?;
    Ok(Json(serde_json::json!({
        "id": job.id,
        "kind": job.kind,
        "state": job.state,
        "progress": job.progress,
        "attempts_made": job.attempts_made,
        "max_attempts": job.max_attempts,
        "error": job.error,
        "result": job.result_json.and_then(|r| serde_json::from_str::<serde_json::Value>(&r).ok()),
        "created_at": job.created_at,
        "finished_at": job.finished_at,
    }))
    .into_response())
}

// ============ Search and query ============

async fn handle_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SearchRequest>,
) -> Result<Response, AppError> {
    let owner = authenticate(&state, &headers)?;
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let hits = state.rag.search(&owner, &req).await?;
    Ok(Json(hits).into_response())
}

async fn handle_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<QueryRequest>,
) -> Result<Response, AppError> {
    let owner = authenticate(&state, &headers)?;
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    let answer = state.rag.query(&owner, &req).await?;
    Ok(Json(answer).into_response())
}

async fn handle_query_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<QueryRequest>,
) -> Result<Response, AppError> {
    let owner = authenticate(&state, &headers)?;
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    let events = state.rag.query_stream(&owner, &req).await?;
    let sse_stream = events.map(|event| {
        Ok::<Event, Infallible>(
            Event::default()
                .json_data(&event)
                .unwrap_or_else(|_| Event::default().data("{}")),
        )
    });
    Ok(Sse::new(sse_stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

// ============ Profiles ============

async fn handle_list_profiles(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let owner = authenticate(&state, &headers)?;
    let list = profiles::list_profiles(&state.ctx.pool, &owner).await?;
    Ok(Json(list).into_response())
}

async fn handle_create_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(draft): Json<ProfileDraft>,
) -> Result<Response, AppError> {
    let owner = authenticate(&state, &headers)?;
    let profile = profiles::create_profile(&state.ctx.pool, &state.ctx.config, &owner, draft).await?;
    Ok((StatusCode::CREATED, Json(profile)).into_response())
}

async fn handle_get_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let owner = authenticate(&state, &headers)?;
    let profile = profiles::get_profile(&state.ctx.pool, &id)
        .await?
        .filter(|p| p.owner_id == owner)
        .ok_or_else(|| not_found(format!("profile {}", id)))?;
    Ok(Json(profile).into_response())
}

async fn handle_update_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(draft): Json<ProfileDraft>,
) -> Result<Response, AppError> {
    let owner = authenticate(&state, &headers)?;
    let profile = profiles::update_profile(&state.ctx.pool, &id, &owner, draft).await?;
    Ok(Json(profile).into_response())
}

async fn handle_delete_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let owner = authenticate(&state, &headers)?;
    profiles::delete_profile(&state.ctx.pool, &id, &owner).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ============ Conversations ============

async fn handle_get_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let owner = authenticate(&state, &headers)?;
    let conversation = chat::get_conversation(&state.ctx.pool, &id, &owner)
        .await?
        .ok_or_else(|| not_found(format!("conversation {}", id)))?;
    let messages = chat::messages_for_conversation(&state.ctx.pool, &id).await?;
    Ok(Json(serde_json::json!({
        "conversation": conversation,
        "messages": messages,
    }))
    .into_response())
}

// ============ Health ============

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
