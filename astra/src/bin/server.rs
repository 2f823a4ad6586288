//! Astra Server
//!
//! Local chat console: single-page interface plus a JSON/SSE API.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse, Response,
    },
    routing::{get, patch, post},
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use astra::{
    config::Config,
    engine::{self, EngineSnapshot, GenerationEvent, GenerationOptions},
    memory::{MemoryItem, MemoryUpdate, NewMemory},
    persona::{PersonaSettings, PersonaUpdate},
    session::{Session, SessionsSnapshot},
    storage::SqliteStorage,
    ChatService, TurnOutcome,
};

const INDEX_HTML: &str = include_str!("../../static/index.html");

/// Application state shared across handlers
struct AppState {
    chat: ChatService,
    config: Config,
}

type SharedState = Arc<AppState>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;
    config.ensure_dirs()?;
    tracing::info!("Starting Astra on port {}", config.server_port);
    tracing::info!("Data directory: {:?}", config.data_dir);

    // Initialize components
    let storage = Arc::new(SqliteStorage::new(&config)?);
    let loader = engine::loader_from_config(&config.engine)?;
    let chat = ChatService::new(&config, storage, loader);
    let session = chat.sessions().hydrate_initial();
    tracing::info!("Active session: {} ({})", session.title, session.id);

    let state = Arc::new(AppState { chat, config });
    spawn_initialize(state.clone());

    // Build router
    let app = Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        // Engine
        .route("/engine", get(engine_status))
        .route("/engine/init", post(engine_init))
        .route("/engine/options", post(engine_options))
        // Persona
        .route("/persona", get(get_persona).put(update_persona))
        .route("/persona/reset", post(reset_persona))
        // Memories
        .route("/memories", get(list_memories).post(create_memory))
        .route("/memories/export", get(export_memories))
        .route("/memories/import", post(import_memories))
        .route("/memories/:id", patch(update_memory).delete(delete_memory))
        .route("/memories/:id/toggle", post(toggle_memory))
        // Sessions
        .route("/sessions", get(list_sessions).post(create_session))
        .route(
            "/sessions/:id",
            get(get_session).patch(rename_session).delete(delete_session),
        )
        .route("/sessions/:id/select", post(select_session))
        .route("/sessions/:id/export", get(export_session))
        // Chat
        .route("/chat", post(self::chat))
        .route("/chat/stop", post(stop_chat))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state.clone());

    let port = state.config.server_port;
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("Server listening on http://127.0.0.1:{}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.chat.engine().shutdown().await;
    tracing::info!("Server stopped");

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn spawn_initialize(state: SharedState) {
    tokio::spawn(async move {
        if let Err(e) = state.chat.initialize_engine().await {
            tracing::warn!("Engine not available: {}", e);
        }
    });
}

// === Errors ===

struct ApiError(astra::Error);

impl From<astra::Error> for ApiError {
    fn from(e: astra::Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            astra::Error::NotFound(_) => StatusCode::NOT_FOUND,
            astra::Error::InvalidInput(_) | astra::Error::Config(_) => StatusCode::BAD_REQUEST,
            astra::Error::EngineNotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            astra::Error::Engine(_) | astra::Error::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Request failed: {}", self.0);
        }
        let body = serde_json::json!({ "error": self.0.user_message() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn not_found(what: &str, id: Uuid) -> ApiError {
    ApiError(astra::Error::not_found(format!("{} {}", what, id)))
}

// === Handlers ===

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health() -> &'static str {
    "ok"
}

// --- Engine handlers ---

#[derive(Debug, Serialize)]
struct EngineResponse {
    #[serde(flatten)]
    engine: EngineSnapshot,
    status_message: String,
    options: GenerationOptions,
}

async fn engine_response(state: &AppState) -> EngineResponse {
    EngineResponse {
        engine: state.chat.engine().snapshot(),
        status_message: state.chat.status_message(),
        options: state.chat.engine().options().await,
    }
}

async fn engine_status(State(state): State<SharedState>) -> Json<EngineResponse> {
    Json(engine_response(&state).await)
}

async fn engine_init(State(state): State<SharedState>) -> (StatusCode, Json<EngineResponse>) {
    spawn_initialize(state.clone());
    (StatusCode::ACCEPTED, Json(engine_response(&state).await))
}

#[derive(Debug, Deserialize)]
struct OptionsRequest {
    model: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

async fn engine_options(
    State(state): State<SharedState>,
    Json(req): Json<OptionsRequest>,
) -> Json<EngineResponse> {
    let current = state.chat.engine().options().await;
    let model = req
        .model
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| current.model.clone());
    let model_changed = model != current.model;

    state
        .chat
        .engine()
        .set_options(GenerationOptions {
            model,
            temperature: req.temperature.unwrap_or(current.temperature),
            max_tokens: req.max_tokens.unwrap_or(current.max_tokens),
        })
        .await;

    // A different model needs a fresh engine.
    if model_changed {
        spawn_initialize(state.clone());
    }

    Json(engine_response(&state).await)
}

// --- Persona handlers ---

async fn get_persona(State(state): State<SharedState>) -> Json<PersonaSettings> {
    Json(state.chat.persona().get())
}

async fn update_persona(
    State(state): State<SharedState>,
    Json(req): Json<PersonaUpdate>,
) -> Json<PersonaSettings> {
    Json(state.chat.persona().update(req))
}

async fn reset_persona(State(state): State<SharedState>) -> Json<PersonaSettings> {
    Json(state.chat.persona().reset())
}

// --- Memory handlers ---

#[derive(Debug, Serialize)]
struct MemoriesResponse {
    memories: Vec<MemoryItem>,
    selected: Vec<Uuid>,
    limit: usize,
}

async fn list_memories(State(state): State<SharedState>) -> Json<MemoriesResponse> {
    Json(MemoriesResponse {
        memories: state.chat.memories().list(),
        selected: state.chat.selected_memory_ids(),
        limit: state.chat.memories().limit(),
    })
}

async fn create_memory(
    State(state): State<SharedState>,
    Json(req): Json<NewMemory>,
) -> ApiResult<(StatusCode, Json<MemoryItem>)> {
    let memory = state
        .chat
        .add_memory(req)
        .ok_or_else(|| astra::Error::invalid_input("title and details are required"))?;
    Ok((StatusCode::CREATED, Json(memory)))
}

async fn update_memory(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(req): Json<MemoryUpdate>,
) -> ApiResult<Json<MemoryItem>> {
    let memory = state
        .chat
        .update_memory(id, req)
        .ok_or_else(|| not_found("memory", id))?;
    Ok(Json(memory))
}

async fn delete_memory(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if state.chat.remove_memory(id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("memory", id))
    }
}

#[derive(Debug, Serialize)]
struct ToggleResponse {
    id: Uuid,
    selected: bool,
}

async fn toggle_memory(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ToggleResponse>> {
    let selected = state.chat.toggle_memory(id)?;
    Ok(Json(ToggleResponse { id, selected }))
}

#[derive(Debug, Serialize)]
struct TransferResponse {
    path: PathBuf,
    count: usize,
}

async fn export_memories(State(state): State<SharedState>) -> ApiResult<Json<TransferResponse>> {
    let path = state.config.exports_dir().join(format!(
        "memories-{}.jsonl",
        chrono::Utc::now().format("%Y%m%d-%H%M%S")
    ));
    let count = state.chat.memories().export_jsonl(&path)?;
    tracing::info!("Exported {} memories to {:?}", count, path);
    Ok(Json(TransferResponse { path, count }))
}

#[derive(Debug, Deserialize)]
struct ImportRequest {
    path: PathBuf,
}

async fn import_memories(
    State(state): State<SharedState>,
    Json(req): Json<ImportRequest>,
) -> ApiResult<Json<TransferResponse>> {
    let count = state.chat.memories().import_jsonl(&req.path)?;
    tracing::info!("Imported {} memories from {:?}", count, req.path);
    Ok(Json(TransferResponse {
        path: req.path,
        count,
    }))
}

// --- Session handlers ---

async fn list_sessions(State(state): State<SharedState>) -> Json<SessionsSnapshot> {
    Json(state.chat.sessions().snapshot())
}

#[derive(Debug, Default, Deserialize)]
struct CreateSessionRequest {
    title: Option<String>,
}

async fn create_session(
    State(state): State<SharedState>,
    body: Option<Json<CreateSessionRequest>>,
) -> (StatusCode, Json<Session>) {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let title = req.title.as_deref().map(str::trim).filter(|t| !t.is_empty());
    let session = state.chat.sessions().create(title);
    (StatusCode::CREATED, Json(session))
}

async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Session>> {
    let session = state
        .chat
        .sessions()
        .get(id)
        .ok_or_else(|| not_found("session", id))?;
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
struct RenameRequest {
    title: String,
}

async fn rename_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RenameRequest>,
) -> ApiResult<Json<Session>> {
    state.chat.sessions().rename(id, &req.title);
    get_session(State(state), Path(id)).await
}

async fn delete_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SessionsSnapshot>> {
    if !state.chat.sessions().remove(id) {
        return Err(not_found("session", id));
    }
    Ok(Json(state.chat.sessions().snapshot()))
}

async fn select_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Session>> {
    if !state.chat.sessions().select(id) {
        return Err(not_found("session", id));
    }
    get_session(State(state), Path(id)).await
}

async fn export_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<TransferResponse>> {
    let path = state.config.exports_dir().join(format!("session-{}.json", id));
    state.chat.sessions().export(id, &path)?;
    tracing::info!("Exported session {} to {:?}", id, path);
    Ok(Json(TransferResponse { path, count: 1 }))
}

// --- Chat handlers ---

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
}

enum ChatUpdate {
    Event(GenerationEvent),
    Done(astra::Result<Option<TurnOutcome>>),
}

/// Run one turn and stream it as SSE: `token`, `complete`, `error`, `done`.
///
/// The turn runs in its own task, so a dropped connection does not abandon
/// the assistant message half-written.
async fn chat(
    State(state): State<SharedState>,
    Json(req): Json<ChatRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let turn_state = state.clone();
    tokio::spawn(async move {
        let events = tx.clone();
        let result = turn_state
            .chat
            .send_with(&req.message, move |event| {
                let _ = events.send(ChatUpdate::Event(event.clone()));
            })
            .await;
        let _ = tx.send(ChatUpdate::Done(result));
    });

    let sse_stream = async_stream::stream! {
        while let Some(update) = rx.recv().await {
            match update {
                ChatUpdate::Event(GenerationEvent::Token(text)) => {
                    let data = serde_json::json!({ "text": text });
                    yield Ok::<_, Infallible>(Event::default().event("token").data(data.to_string()));
                }
                ChatUpdate::Event(GenerationEvent::Completed(content)) => {
                    let data = serde_json::json!({ "content": content });
                    yield Ok(Event::default().event("complete").data(data.to_string()));
                }
                ChatUpdate::Event(GenerationEvent::Failed(message)) => {
                    let data = serde_json::json!({ "message": message });
                    yield Ok(Event::default().event("error").data(data.to_string()));
                }
                ChatUpdate::Done(Ok(outcome)) => {
                    let data = serde_json::to_string(&outcome).unwrap_or_else(|_| "null".into());
                    yield Ok(Event::default().event("done").data(data));
                    break;
                }
                ChatUpdate::Done(Err(e)) => {
                    tracing::error!("Chat turn failed: {}", e);
                    let data = serde_json::json!({ "message": e.user_message() });
                    yield Ok(Event::default().event("error").data(data.to_string()));
                    yield Ok(Event::default().event("done").data("null"));
                    break;
                }
            }
        }
    };

    Sse::new(sse_stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

async fn stop_chat(State(state): State<SharedState>) -> StatusCode {
    state.chat.stop().await;
    StatusCode::NO_CONTENT
}
