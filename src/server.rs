//! HTTP API.
//!
//! Thin request/response mapping over [`RagPipeline`] and [`SessionStore`].
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Liveness message |
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/api/chunk` | Split and embed text |
//! | `POST` | `/api/search/build_index` | Register chunks + vectors under a key |
//! | `POST` | `/api/search/query` | Nearest chunks for a query |
//! | `POST` | `/api/llm/answer` | Grounded answer, JSON or `text/plain` delta stream |
//! | `POST` | `/api/sessions` | Open a session |
//! | `PUT`  | `/api/sessions/{id}/document?name=` | Upload a document (raw body) |
//! | `POST` | `/api/sessions/{id}/ask` | Answer in one piece |
//! | `POST` | `/api/sessions/{id}/ask_stream` | Cumulative answers, each followed by `\x0c` |
//! | `DELETE` | `/api/sessions/{id}` | Close a session |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "index not found for key: doc" } }
//! ```
//!
//! Validation errors map to 400, unknown keys and sessions to 404, and
//! embedding or generation backend failures to 502. Once a streamed response
//! has started, failures are reported in-band as a final
//! `\n\nError during streaming: ...` piece.

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use docqa_core::embedding::Vector;
use docqa_core::stream::TextStream;
use docqa_core::PipelineError;

use crate::answer::GenerationOutput;
use crate::config::Config;
use crate::pipeline::{EmbeddedChunks, QueryResult, RagPipeline};
use crate::session::{Session, SessionStore};

/// Upper bound on uploaded document size.
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Separator after each cumulative answer on `ask_stream`.
pub const ANSWER_SEPARATOR: char = '\x0c';

#[derive(Clone)]
struct AppState {
    pipeline: Arc<RagPipeline>,
    sessions: Arc<SessionStore>,
}

/// Build the pipeline from `config` and serve on `[server].bind` until the
/// process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pipeline = Arc::new(RagPipeline::from_config(config.clone())?);
    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("docqa server listening on http://{}", bind_addr);
    tracing::info!(%bind_addr, "server started");
    axum::serve(listener, router(pipeline)).await?;
    Ok(())
}

/// The full route table over a ready pipeline.
pub fn router(pipeline: Arc<RagPipeline>) -> Router {
    let state = AppState {
        pipeline,
        sessions: Arc::new(SessionStore::new()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/api/chunk", post(handle_chunk))
        .route("/api/search/build_index", post(handle_build_index))
        .route("/api/search/query", post(handle_query))
        .route("/api/llm/answer", post(handle_answer))
        .route("/api/sessions", post(handle_open_session))
        .route("/api/sessions/{id}", axum::routing::delete(handle_close_session))
        .route(
            "/api/sessions/{id}/document",
            put(handle_upload).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/sessions/{id}/ask", post(handle_session_ask))
        .route("/api/sessions/{id}/ask_stream", post(handle_session_ask_stream))
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
}

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

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::IndexNotFound(_) => StatusCode::NOT_FOUND,
            e if e.is_validation() => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            tracing::error!(code = err.code(), error = %err, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
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

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

fn text_stream<S>(body: S) -> Response
where
    S: Stream<Item = String> + Send + 'static,
{
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(body.map(Ok::<_, Infallible>)),
    )
        .into_response()
}

// ============ GET / and /health ============

async fn handle_root() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "API is up!" }))
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

// ============ POST /api/chunk ============

#[derive(Deserialize)]
struct ChunkRequest {
    text: String,
    chunk_size: Option<usize>,
    overlap: Option<usize>,
    model: Option<String>,
}

async fn handle_chunk(
    State(state): State<AppState>,
    Json(req): Json<ChunkRequest>,
) -> Result<Json<EmbeddedChunks>, AppError> {
    let out = state
        .pipeline
        .chunk_and_embed(&req.text, req.chunk_size, req.overlap, req.model.as_deref())
        .await?;
    Ok(Json(out))
}

// ============ POST /api/search/build_index ============

#[derive(Deserialize)]
struct BuildIndexRequest {
    key: String,
    chunks: Vec<String>,
    vectors: Vec<Vector>,
}

#[derive(Serialize)]
struct BuildIndexResponse {
    status: &'static str,
    n_chunks: usize,
}

async fn handle_build_index(
    State(state): State<AppState>,
    Json(req): Json<BuildIndexRequest>,
) -> Result<Json<BuildIndexResponse>, AppError> {
    let n_chunks = state
        .pipeline
        .build_index(&req.key, req.chunks, req.vectors)
        .await?;
    Ok(Json(BuildIndexResponse {
        status: "ok",
        n_chunks,
    }))
}

// ============ POST /api/search/query ============

#[derive(Deserialize)]
struct QueryRequest {
    key: String,
    query: String,
    top_k: Option<usize>,
    model: Option<String>,
}

async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResult>, AppError> {
    let out = state
        .pipeline
        .query_index(&req.key, &req.query, req.top_k, req.model.as_deref())
        .await?;
    Ok(Json(out))
}

// ============ POST /api/llm/answer ============

#[derive(Deserialize)]
struct AnswerRequest {
    #[serde(default)]
    context: String,
    question: String,
    stream: Option<bool>,
}

async fn handle_answer(
    State(state): State<AppState>,
    Json(req): Json<AnswerRequest>,
) -> Result<Response, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    let result = state
        .pipeline
        .generate_answer(&req.context, &req.question, req.stream)
        .await;
    match result.into_output() {
        Ok(GenerationOutput::Text(answer)) => {
            Ok(Json(serde_json::json!({ "answer": answer })).into_response())
        }
        Ok(GenerationOutput::Stream(deltas)) => Ok(text_stream(TextStream::deltas(deltas))),
        Err(message) => Err(PipelineError::GenerationBackend(message).into()),
    }
}

// ============ Sessions ============

#[derive(Serialize)]
struct SessionCreated {
    id: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

async fn handle_open_session(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<SessionCreated>), AppError> {
    let session = state
        .sessions
        .open(Arc::clone(&state.pipeline))
        .map_err(|e| internal(format!("failed to create session directory: {}", e)))?;
    tracing::info!(session = session.id(), open = state.sessions.len(), "session opened");
    Ok((
        StatusCode::CREATED,
        Json(SessionCreated {
            id: session.id().to_string(),
            created_at: session.created_at(),
        }),
    ))
}

fn find_session(state: &AppState, id: &str) -> Result<Arc<Session>, AppError> {
    state
        .sessions
        .get(id)
        .ok_or_else(|| not_found(format!("no session with id: {}", id)))
}

async fn handle_close_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if state.sessions.close(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(format!("no session with id: {}", id)))
    }
}

#[derive(Deserialize)]
struct UploadParams {
    name: Option<String>,
}

async fn handle_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let session = find_session(&state, &id)?;
    if body.is_empty() {
        return Err(bad_request("request body must contain the document"));
    }
    let name = params.name.unwrap_or_else(|| "upload".to_string());
    let status = session.ingest(&name, &body).await;
    Ok(Json(serde_json::json!({ "status": status })))
}

#[derive(Deserialize)]
struct AskRequest {
    question: String,
    top_k: Option<usize>,
}

async fn handle_session_ask(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AskRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let session = find_session(&state, &id)?;
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    let answer = session.ask(&req.question, req.top_k).await;
    Ok(Json(serde_json::json!({ "answer": answer })))
}

async fn handle_session_ask_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AskRequest>,
) -> Result<Response, AppError> {
    let session = find_session(&state, &id)?;
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    let answers = session.ask_stream(&req.question, req.top_k).await;
    Ok(text_stream(answers.map(|mut answer| {
        answer.push(ANSWER_SEPARATOR);
        answer
    })))
}
