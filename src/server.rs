//! HTTP surface.
//!
//! Exposes the retrieval engine as a JSON API. `POST /api/chat` streams
//! Server-Sent Events; everything else is request/response JSON (plus a
//! Prometheus text endpoint).
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | HTML landing page (302 to `/setup/` without a config) |
//! | `GET`  | `/api` | Endpoint catalog |
//! | `GET`  | `/api/health` | Health check |
//! | `GET`  | `/api/stats` | Chunk/vector totals + per-source stats |
//! | `GET`  | `/api/metrics` | Service/DB/request/performance JSON |
//! | `GET`  | `/metrics` | Prometheus text exposition |
//! | `GET`  | `/api/settings` | Generation-API catalog |
//! | `GET`  | `/api/documents` | Tracked files |
//! | `GET`  | `/api/setup` | Raw config JSON (auth) |
//! | `GET`  | `/api/instances` | Live instances from the registry |
//! | `POST` | `/api/authenticate` | Basic credentials → JWT |
//! | `POST` | `/api/setup` | Replace config (auth) |
//! | `POST` | `/api/search` | Semantic search |
//! | `POST` | `/api/embed` | One-off embedding, no storage |
//! | `POST` | `/api/documents` | Chunk + embed + store a document |
//! | `POST` | `/api/update` | Trigger an incremental update |
//! | `POST` | `/api/chat` | Context-augmented chat (SSE) |
//! | `POST` | `/api/fim` | Fill-in-the-middle completion |
//! | `POST` | `/api/shutdown` | Cooperative shutdown (auth or app key) |
//!
//! # Authentication
//!
//! Admin endpoints skip authentication for loopback clients. Everyone else
//! must present `Authorization: Basic` (admin password) or a `Bearer` JWT
//! from `/api/authenticate`; failures get `401` with a `WWW-Authenticate`
//! challenge.

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, Sse},
        Html, IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, UnboundedSender};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::auth::{extract_credential, AdminAuth};
use crate::chunk::Chunker;
use crate::completion::CompletionClient;
use crate::context::{AssembleRequest, Assembler};
use crate::embedding::{EmbeddingClient, EncodeKind};
use crate::ingest::IngestEngine;
use crate::metrics::Metrics;
use crate::models::Attachment;
use crate::registry::InstanceRegistry;
use crate::serve::Shutdown;
use crate::sources::SourceProcessor;

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<IngestEngine>,
    pub auth: Arc<AdminAuth>,
    pub metrics: Arc<Metrics>,
    pub registry: Option<Arc<InstanceRegistry>>,
    pub shutdown: Arc<Shutdown>,
    /// Caller-provided key accepted by `/api/shutdown` in lieu of auth.
    pub app_key: String,
}

/// Build the full router. All origins are permitted so browser-based
/// clients and editor integrations can call the API cross-origin.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_root))
        .route("/api", get(handle_api_catalog))
        .route("/api/health", get(handle_health))
        .route("/api/stats", get(handle_stats))
        .route("/api/metrics", get(handle_api_metrics))
        .route("/metrics", get(handle_prometheus))
        .route("/api/settings", get(handle_settings))
        .route("/api/documents", get(handle_list_documents).post(handle_add_document))
        .route("/api/setup", get(handle_get_setup).post(handle_post_setup))
        .route("/api/instances", get(handle_instances))
        .route("/api/authenticate", post(handle_authenticate))
        .route("/api/search", post(handle_search))
        .route("/api/embed", post(handle_embed))
        .route("/api/update", post(handle_update))
        .route("/api/chat", post(handle_chat))
        .route("/api/fim", post(handle_fim))
        .route("/api/shutdown", post(handle_shutdown))
        .layer(cors)
        .with_state(state)
}

// ============ Errors ============

struct AppError {
    status: StatusCode,
    message: String,
    headers: Vec<(&'static str, &'static str)>,
}

impl AppError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            headers: Vec::new(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            headers: Vec::new(),
        }
    }

    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "Authentication required".to_string(),
            headers: vec![("WWW-Authenticate", "Basic realm=\"Embedder Admin\"")],
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        let mut response = (self.status, Json(body)).into_response();
        for (name, value) in self.headers {
            response
                .headers_mut()
                .insert(name, value.parse().expect("static header value"));
        }
        response
    }
}

/// Auth gate for admin endpoints: loopback bypasses, everyone else needs a
/// valid Basic password or Bearer JWT. Returns the minted/echoed token.
fn require_auth(
    state: &AppState,
    addr: &SocketAddr,
    headers: &HeaderMap,
) -> Result<Option<String>, AppError> {
    if addr.ip().is_loopback() {
        return Ok(None);
    }
    let header = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(AppError::unauthorized)?;
    let (secret, scheme) = extract_credential(header).ok_or_else(AppError::unauthorized)?;
    state
        .auth
        .authenticate(&secret, scheme)
        .map(Some)
        .ok_or_else(AppError::unauthorized)
}

// ============ Basic endpoints ============

async fn handle_root(State(state): State<AppState>) -> Response {
    info!("GET /");
    state.metrics.requests.fetch_add(1, Ordering::Relaxed);
    let settings = state.engine.settings().await;
    if !settings.config_path.exists() {
        return (StatusCode::FOUND, [("Location", "/setup/")]).into_response();
    }
    Html(
        r#"
        <h1>Embedder</h1>
        <p>API is running!</p>
        <ul>
            <li><a href="/api/health">Health Check</a></li>
            <li><a href="/api/stats">Statistics</a></li>
            <li><a href="/api/metrics">Metrics</a></li>
        </ul>
        "#,
    )
    .into_response()
}

async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    info!("GET /api/health");
    state.metrics.requests.fetch_add(1, Ordering::Relaxed);
    Json(serde_json::json!({ "status": "ok" }))
}

async fn handle_api_catalog(State(state): State<AppState>) -> Json<serde_json::Value> {
    info!("GET /api");
    state.metrics.requests.fetch_add(1, Ordering::Relaxed);
    Json(serde_json::json!({
        "name": "Embeddings RAG API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "GET /api/setup": "Fetch setup configuration",
            "GET /api/health": "Health check",
            "GET /api/documents": "Get documents",
            "GET /api/stats": "Database statistics",
            "GET /api/settings": "Available APIs",
            "GET /api/instances": "List of running instances",
            "GET /api/metrics": "Service and database metrics",
            "GET /metrics": "Prometheus-compatible metrics",
            "POST /api/setup": "Setup configuration",
            "POST /api/search": "Semantic search",
            "POST /api/chat": "Chat with context (streaming)",
            "POST /api/fim": "Fill-In-Middle / Auto-complete",
            "POST /api/embed": "Generate embeddings",
            "POST /api/documents": "Add documents",
            "POST /api/update": "Trigger manual update",
            "POST /api/shutdown": "Initiate a shutdown",
        }
    }))
}

async fn handle_stats(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    info!("GET /api/stats");
    state.metrics.requests.fetch_add(1, Ordering::Relaxed);
    let stats = state
        .engine
        .store()
        .get_stats()
        .await
        .map_err(|e| AppError::internal(e.to_string()))?;
    let sources = state
        .engine
        .source_stats()
        .await
        .map_err(|e| AppError::internal(e.to_string()))?;
    Ok(Json(serde_json::json!({
        "total_chunks": stats.total_chunks,
        "vector_count": stats.vector_count,
        "sources": sources,
    })))
}

async fn handle_api_metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    info!("GET /api/metrics");
    state.metrics.requests.fetch_add(1, Ordering::Relaxed);
    let settings = state.engine.settings().await;
    let stats = state.engine.store().get_stats().await.ok();
    let metrics = &state.metrics;

    let database = match &stats {
        Some(stats) => serde_json::json!({
            "total_chunks": stats.total_chunks,
            "vector_count": stats.vector_count,
            "deleted_count": stats.deleted_count,
            "active_count": stats.active_count,
            "db_size_mb": file_size_mb(&settings.database.sqlite_path),
            "index_size_mb": file_size_mb(&settings.database.index_path),
        }),
        None => serde_json::json!({}),
    };

    Json(serde_json::json!({
        "service": {
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": metrics.uptime_seconds(),
            "started_at": metrics.started_at(),
        },
        "database": database,
        "requests": {
            "total": metrics.requests.load(Ordering::Relaxed),
            "search": metrics.searches.load(Ordering::Relaxed),
            "chat": metrics.chats.load(Ordering::Relaxed),
            "embed": metrics.embeds.load(Ordering::Relaxed),
            "errors": metrics.errors.load(Ordering::Relaxed),
        },
        "performance": {
            "avg_search_ms": metrics.avg_search_ms(),
            "avg_embedding_ms": metrics.avg_embed_ms(),
            "avg_chat_ms": metrics.avg_chat_ms(),
        },
        "system": {
            "last_update": state.engine.last_update_timestamp().await,
            "sources_indexed": stats.map(|s| s.sources.len()).unwrap_or(0),
        }
    }))
}

async fn handle_prometheus(State(state): State<AppState>) -> Response {
    info!("GET /metrics");
    state.metrics.requests.fetch_add(1, Ordering::Relaxed);
    let stats = state.engine.store().get_stats().await.ok();
    let body = state.metrics.render_prometheus(stats.as_ref());
    ([("Content-Type", "text/plain; version=0.0.4")], body).into_response()
}

async fn handle_settings(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    info!("GET /api/settings");
    state.metrics.requests.fetch_add(1, Ordering::Relaxed);
    let settings = state.engine.settings().await;
    let current = settings
        .generation_current_api()
        .map_err(|e| AppError::internal(e.to_string()))?;
    let apis: Vec<serde_json::Value> = settings
        .generation
        .apis
        .iter()
        .map(|api| {
            serde_json::json!({
                "id": api.id,
                "name": api.name,
                "url": api.api_url,
                "model": api.model,
                "current": api.id == current.id,
                "combinedPrice": api.combined_price(),
            })
        })
        .collect();
    Ok(Json(serde_json::json!({
        "completionApis": apis,
        "currentApi": current.id,
    })))
}

async fn handle_list_documents(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    info!("GET /api/documents");
    state.metrics.requests.fetch_add(1, Ordering::Relaxed);
    let files = state
        .engine
        .store()
        .get_tracked_files()
        .await
        .map_err(|e| AppError::internal(e.to_string()))?;
    let body: Vec<serde_json::Value> = files
        .iter()
        .map(|file| {
            serde_json::json!({
                "path": file.path,
                "lastModified": file.last_modified,
                "size": file.file_size,
            })
        })
        .collect();
    Ok(Json(serde_json::Value::Array(body)))
}

async fn handle_instances(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    info!("GET /api/instances");
    state.metrics.requests.fetch_add(1, Ordering::Relaxed);
    let Some(registry) = &state.registry else {
        return Err(AppError::internal("Instance registry unavailable"));
    };
    let instances = registry
        .get_active_instances()
        .await
        .map_err(|e| AppError::internal(e.to_string()))?;
    Ok(Json(serde_json::json!({
        "instances": instances,
        "current_instance": registry.instance_id(),
    })))
}

// ============ Auth + setup ============

async fn handle_authenticate(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    info!("POST /api/authenticate");
    state.metrics.requests.fetch_add(1, Ordering::Relaxed);
    let token = require_auth(&state, &addr, &headers)?;
    Ok(Json(serde_json::json!({
        "status": "OK",
        "token": token.unwrap_or_default(),
    })))
}

async fn handle_get_setup(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    info!("GET /api/setup");
    state.metrics.requests.fetch_add(1, Ordering::Relaxed);
    require_auth(&state, &addr, &headers)?;
    let settings = state.engine.settings().await;
    serde_json::to_value(&settings)
        .map(Json)
        .map_err(|e| AppError::internal(e.to_string()))
}

async fn handle_post_setup(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<serde_json::Value>, AppError> {
    info!("POST /api/setup");
    state.metrics.requests.fetch_add(1, Ordering::Relaxed);
    require_auth(&state, &addr, &headers)?;
    let config: serde_json::Value =
        serde_json::from_str(&body).map_err(|e| AppError::bad_request(e.to_string()))?;
    state
        .engine
        .replace_settings(config)
        .await
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": "Configuration generated successfully",
    })))
}

async fn handle_shutdown(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    info!("POST /api/shutdown");
    state.metrics.requests.fetch_add(1, Ordering::Relaxed);
    let app_key = headers
        .get("X-App-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if state.app_key.is_empty() || app_key != state.app_key {
        require_auth(&state, &addr, &headers)?;
    }
    state.shutdown.request();
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": "Shutdown initiated",
    })))
}

// ============ Search / embed / documents / update ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
}

fn default_top_k() -> usize {
    5
}

async fn handle_search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    info!("POST /api/search");
    let start = Instant::now();
    state.metrics.requests.fetch_add(1, Ordering::Relaxed);
    state.metrics.searches.fetch_add(1, Ordering::Relaxed);

    let result = async {
        let settings = state.engine.settings().await;
        let api = settings.embedding_current_api()?;
        let client = EmbeddingClient::new(api, settings.embedding.timeout_ms);
        let query = client
            .generate_one(&request.query, EncodeKind::Query)
            .await?;
        state.engine.store().search(&query, request.top_k).await
    }
    .await;
    state.metrics.record_search_duration(start);

    match result {
        Ok(results) => Ok(Json(serde_json::to_value(&results).unwrap_or_default())),
        Err(e) => {
            state.metrics.errors.fetch_add(1, Ordering::Relaxed);
            Err(AppError::bad_request(e.to_string()))
        }
    }
}

#[derive(Deserialize)]
struct EmbedRequest {
    text: String,
}

async fn handle_embed(
    State(state): State<AppState>,
    Json(request): Json<EmbedRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    info!("POST /api/embed");
    let start = Instant::now();
    state.metrics.requests.fetch_add(1, Ordering::Relaxed);
    state.metrics.embeds.fetch_add(1, Ordering::Relaxed);

    let result = async {
        let settings = state.engine.settings().await;
        let api = settings.embedding_current_api()?;
        let client = EmbeddingClient::new(api, settings.embedding.timeout_ms);
        let chunker = Chunker::new(
            Arc::clone(state.engine.tokenizer()),
            settings.chunking.nof_min_tokens,
            settings.chunking.nof_max_tokens,
            settings.chunking.overlap_percentage,
        );
        let chunks = chunker.chunk_text(&request.text, "api-request", settings.chunking.semantic);
        let texts: Vec<String> = chunks.into_iter().map(|c| c.text).collect();

        let mut response = Vec::new();
        for batch in texts.chunks(settings.embedding.batch_size.max(1)) {
            let vectors = client.generate(batch, EncodeKind::Query).await?;
            for vector in vectors {
                let dimension = vector.len();
                response.push(serde_json::json!({
                    "embedding": vector,
                    "dimension": dimension,
                }));
            }
        }
        anyhow::Ok(serde_json::Value::Array(response))
    }
    .await;
    state.metrics.record_embed_duration(start);

    match result {
        Ok(body) => Ok(Json(body)),
        Err(e) => {
            state.metrics.errors.fetch_add(1, Ordering::Relaxed);
            Err(AppError::bad_request(e.to_string()))
        }
    }
}

#[derive(Deserialize)]
struct AddDocumentRequest {
    content: String,
    source_id: String,
}

async fn handle_add_document(
    State(state): State<AppState>,
    Json(request): Json<AddDocumentRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    info!("POST /api/documents");
    state.metrics.requests.fetch_add(1, Ordering::Relaxed);

    let result = async {
        let settings = state.engine.settings().await;
        let api = settings.embedding_current_api()?;
        let client = EmbeddingClient::new(api, settings.embedding.timeout_ms);
        let chunker = Chunker::new(
            Arc::clone(state.engine.tokenizer()),
            settings.chunking.nof_min_tokens,
            settings.chunking.nof_max_tokens,
            settings.chunking.overlap_percentage,
        );
        let chunks = chunker.chunk_text(&request.content, &request.source_id, settings.chunking.semantic);

        let mut inserted = 0usize;
        for batch in chunks.chunks(settings.embedding.batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = client.generate(&texts, EncodeKind::Document).await?;
            state.engine.store().add_documents(batch, &vectors).await?;
            inserted += batch.len();
        }
        state.engine.store().persist()?;
        anyhow::Ok(inserted)
    }
    .await;

    match result {
        Ok(inserted) => Ok(Json(serde_json::json!({
            "status": "success",
            "chunks_added": inserted,
        }))),
        Err(e) => {
            state.metrics.errors.fetch_add(1, Ordering::Relaxed);
            Err(AppError::bad_request(e.to_string()))
        }
    }
}

async fn handle_update(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    info!("POST /api/update");
    state.metrics.requests.fetch_add(1, Ordering::Relaxed);
    match state.engine.update().await {
        Ok(count) => Ok(Json(serde_json::json!({
            "status": "updated",
            "nof_files": count.to_string(),
        }))),
        Err(e) => {
            state.metrics.errors.fetch_add(1, Ordering::Relaxed);
            Err(AppError::internal(e.to_string()))
        }
    }
}

// ============ Chat (SSE) ============

#[derive(Deserialize)]
struct ChatRequest {
    messages: Vec<serde_json::Value>,
    #[serde(default)]
    attachments: Vec<Attachment>,
    #[serde(default)]
    sourceids: Vec<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<usize>,
    #[serde(default)]
    targetapi: Option<String>,
    #[serde(default = "default_chat_ctx_ratio")]
    ctxratio: f32,
    #[serde(default)]
    attachedonly: bool,
}

fn default_chat_ctx_ratio() -> f32 {
    0.9
}

fn sse_content_frame(content: &str) -> String {
    serde_json::json!({ "content": content }).to_string()
}

fn send_event(tx: &UnboundedSender<String>, payload: String) {
    // A failed send means the client is gone; nothing to do.
    let _ = tx.send(payload);
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, AppError> {
    info!("POST /api/chat");
    let start = Instant::now();
    state.metrics.requests.fetch_add(1, Ordering::Relaxed);
    state.metrics.chats.fetch_add(1, Ordering::Relaxed);

    let last = request
        .messages
        .last()
        .ok_or_else(|| AppError::bad_request("'messages' field required and must be non-empty array"))?;
    let role = last.get("role").and_then(|r| r.as_str()).unwrap_or_default();
    let question = last
        .get("content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| AppError::bad_request("Last message must have 'role' and 'content' fields"))?
        .to_string();
    if role != "user" {
        return Err(AppError::bad_request(format!(
            "Last message role must be 'user', got: {}",
            role
        )));
    }

    let settings = state.engine.settings().await;
    let api = settings
        .generation_api_or_current(request.targetapi.as_deref())
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    let temperature = request
        .temperature
        .unwrap_or(settings.generation.default_temperature);
    let max_tokens = request
        .max_tokens
        .unwrap_or(settings.generation.default_max_tokens);

    let attachments = wrap_attachments(request.attachments);
    let mut pinned = Vec::new();
    for source in request.sourceids {
        if !pinned.contains(&source) {
            pinned.push(source);
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let engine = Arc::clone(&state.engine);
    let metrics = Arc::clone(&state.metrics);
    let messages = request.messages;
    let ctx_ratio = request.ctxratio;
    let attached_only = request.attachedonly;

    tokio::spawn(async move {
        send_event(&tx, sse_content_frame("[meta]Searching for relevant content"));

        let processor = SourceProcessor::new(settings.clone());
        let assembler = Assembler::new(
            engine.store(),
            Arc::clone(engine.tokenizer()),
            &settings,
            &processor,
        );
        let info_tx = tx.clone();
        let mut on_info = move |message: &str| {
            send_event(
                &info_tx,
                sse_content_frame(&format!("[meta]{}", message)),
            );
        };

        let assembled = assembler
            .assemble(
                AssembleRequest {
                    question,
                    attachments,
                    pinned_sources: pinned,
                    api: api.clone(),
                    ctx_ratio,
                    attached_only,
                },
                &mut on_info,
            )
            .await;

        let (ordered, used_tokens) = match assembled {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Context assembly failed");
                metrics.errors.fetch_add(1, Ordering::Relaxed);
                send_event(&tx, serde_json::json!({ "error": e.to_string() }).to_string());
                send_event(&tx, "[DONE]".to_string());
                return;
            }
        };

        let tokenizer = Arc::clone(engine.tokenizer());
        let client = CompletionClient::new(
            api.clone(),
            settings.generation.timeout_ms,
            &tokenizer,
            settings.generation.prepend_label_format.clone(),
        );
        let stream_tx = tx.clone();
        let mut on_stream = move |chunk: &str| {
            send_event(&stream_tx, sse_content_frame(chunk));
        };

        match client
            .chat(&messages, &ordered, temperature, max_tokens, Some(&mut on_stream))
            .await
        {
            Ok(full_response) => {
                let response_tokens = tokenizer.count(&full_response, false);
                on_info(&format!("Response token count {}", response_tokens));

                let cost_in = api.input_tokens_price(used_tokens);
                let cost_out = api.output_tokens_price(response_tokens);
                let total = cost_in + cost_out;
                if total == 0.0 {
                    on_info("Total cost incurred: 0");
                } else {
                    on_info(&format!(
                        "Approx. cost incurred: ${:.4} (input: {:.4}, output: {:.4})",
                        total, cost_in, cost_out
                    ));
                }

                let mut distinct = Vec::new();
                for result in &ordered {
                    if !distinct.contains(&result.source_id) {
                        distinct.push(result.source_id.clone());
                    }
                }
                send_event(
                    &tx,
                    serde_json::json!({
                        "sources": distinct,
                        "type": "context_sources",
                    })
                    .to_string(),
                );
                send_event(&tx, "[DONE]".to_string());
            }
            Err(e) => {
                error!(error = %e, "Completion failed");
                metrics.errors.fetch_add(1, Ordering::Relaxed);
                send_event(&tx, serde_json::json!({ "error": e.to_string() }).to_string());
                send_event(&tx, "[DONE]".to_string());
            }
        }
    });

    state.metrics.record_chat_duration(start);

    let stream = async_stream::stream! {
        while let Some(payload) = rx.recv().await {
            yield Ok::<Event, Infallible>(Event::default().data(payload));
        }
    };
    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    headers.insert("Cache-Control", "no-cache".parse().expect("static header"));
    headers.insert("Connection", "keep-alive".parse().expect("static header"));
    Ok(response)
}

fn wrap_attachments(attachments: Vec<Attachment>) -> Vec<Attachment> {
    attachments
        .into_iter()
        .map(|mut attachment| {
            if !attachment.filename.is_empty() {
                attachment.content = format!(
                    "[Attachment: {}]\n{}\n[/Attachment]",
                    attachment.filename, attachment.content
                );
            }
            attachment
        })
        .collect()
}

// ============ FIM ============

#[derive(Deserialize)]
struct FimRequest {
    prefix: String,
    suffix: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    encoding: String,
    #[serde(default)]
    stop: Vec<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<usize>,
    #[serde(default = "default_fim_ctx_ratio")]
    ctxratio: f32,
    #[serde(default)]
    targetapi: Option<String>,
}

fn default_fim_ctx_ratio() -> f32 {
    0.5
}

async fn handle_fim(
    State(state): State<AppState>,
    Json(request): Json<FimRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    info!("POST /api/fim");
    let start = Instant::now();
    state.metrics.requests.fetch_add(1, Ordering::Relaxed);

    let result = async {
        let mut prefix = request.prefix;
        let mut suffix = request.suffix;
        if request.encoding == "base64" {
            prefix = String::from_utf8(B64.decode(&prefix)?)?;
            suffix = String::from_utf8(B64.decode(&suffix)?)?;
        }
        let filename = normalize_path(&request.filename);

        let settings = state.engine.settings().await;
        let api = settings.generation_api_or_current(request.targetapi.as_deref())?;
        let temperature = request
            .temperature
            .unwrap_or(settings.generation.default_temperature);
        let max_tokens = request
            .max_tokens
            .unwrap_or(settings.generation.default_max_tokens);

        let processor = SourceProcessor::new(settings.clone());
        let assembler = Assembler::new(
            state.engine.store(),
            Arc::clone(state.engine.tokenizer()),
            &settings,
            &processor,
        );
        let pinned = if filename.is_empty() {
            Vec::new()
        } else {
            vec![filename]
        };
        let mut on_info = |_: &str| {};
        let (ordered, _) = assembler
            .assemble(
                AssembleRequest {
                    question: prefix.clone(),
                    attachments: Vec::new(),
                    pinned_sources: pinned,
                    api: api.clone(),
                    ctx_ratio: request.ctxratio,
                    attached_only: false,
                },
                &mut on_info,
            )
            .await?;

        info!(
            prefix_len = prefix.len(),
            suffix_len = suffix.len(),
            "Generating FIM"
        );
        let tokenizer = state.engine.tokenizer();
        let client = CompletionClient::new(
            api,
            settings.generation.timeout_ms,
            tokenizer,
            settings.generation.prepend_label_format.clone(),
        );
        let completion = client
            .fim(&prefix, &suffix, &request.stop, temperature, max_tokens, &ordered)
            .await?;
        anyhow::Ok(completion)
    }
    .await;
    state.metrics.record_chat_duration(start);

    match result {
        Ok(completion) => Ok(Json(serde_json::json!({ "completion": completion }))),
        Err(e) => {
            state.metrics.errors.fetch_add(1, Ordering::Relaxed);
            Err(AppError::bad_request(e.to_string()))
        }
    }
}

fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    let unified = path.replace('\\', "/");
    let absolute = unified.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

fn file_size_mb(path: &str) -> f64 {
    std::fs::metadata(path)
        .map(|m| (m.len() as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_frame_shape() {
        assert_eq!(sse_content_frame("hi"), r#"{"content":"hi"}"#);
    }

    #[test]
    fn attachments_wrapped_when_named() {
        let wrapped = wrap_attachments(vec![
            Attachment {
                filename: "a.rs".to_string(),
                content: "fn a() {}".to_string(),
            },
            Attachment {
                filename: String::new(),
                content: "anonymous".to_string(),
            },
        ]);
        assert!(wrapped[0].content.starts_with("[Attachment: a.rs]\n"));
        assert!(wrapped[0].content.ends_with("\n[/Attachment]"));
        assert_eq!(wrapped[1].content, "anonymous");
    }

    #[test]
    fn normalize_path_strips_dots() {
        assert_eq!(normalize_path("src/./a/../main.rs"), "src/main.rs");
        assert_eq!(normalize_path(""), "");
        assert_eq!(normalize_path("a\\b\\c.rs"), "a/b/c.rs");
    }
}
