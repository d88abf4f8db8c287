//! HTTP server implementation using Axum.

use crate::conversation::Turn;
use crate::error::SessionError;
use crate::service::{ChatService, ModelListing};
use crate::session::SessionInfo;
use axum::{
    extract::{Path, State},
    http::{HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub service: ChatService,
}

impl AppState {
    pub fn new(service: ChatService) -> Self {
        Self { service }
    }
}

/// Server-level knobs that are not part of session semantics.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub idle_ttl: Duration,
    pub reap_interval: Duration,
    /// Empty means any origin.
    pub cors_origins: Vec<String>,
}

// Request/Response types
#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: String,
}

#[derive(Deserialize)]
struct SetModelRequest {
    model: String,
}

#[derive(Deserialize)]
struct MessageRequest {
    text: String,
}

#[derive(Serialize)]
struct MessageResponse {
    session_id: String,
    text: String,
}

#[derive(Serialize)]
struct SessionDetail {
    #[serde(flatten)]
    info: SessionInfo,
    conversation: Vec<Turn>,
}

#[derive(Serialize)]
struct CancelResponse {
    cancelled: bool,
}

#[derive(Serialize)]
struct NewChatResponse {
    chat_key: Option<String>,
}

#[derive(Serialize)]
struct CompressResponse {
    compressed: bool,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

/// `SessionError` rendered as a JSON error response.
pub struct ApiError(SessionError);

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            error: self.0.to_string(),
            kind: self.0.kind(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the router without binding a socket.
pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        // Session management
        .route("/sessions", post(create_session).get(list_sessions))
        .route(
            "/sessions/:id",
            put(get_or_create_session)
                .get(get_session)
                .delete(delete_session),
        )
        .route("/sessions/:id/model", put(set_model))
        // Generation
        .route("/sessions/:id/messages", post(send_message))
        .route("/sessions/:id/messages/stream", post(stream_message))
        .route("/sessions/:id/cancel", post(cancel))
        // Chat history
        .route("/sessions/:id/chats", post(new_chat))
        .route("/sessions/:id/chats/:chat_key", post(load_chat))
        .route("/sessions/:id/compress", post(compress))
        .route("/models", get(list_models))
        // Health check
        .route("/health", get(health))
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState, options: ServerOptions) -> std::io::Result<()> {
    // Spawn cleanup task
    let reaper = state
        .service
        .registry()
        .spawn_reaper(options.reap_interval, options.idle_ttl);

    let app = router(state, &options.cors_origins);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    reaper.abort();
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down HTTP server");
}

async fn health() -> &'static str {
    "OK"
}

async fn list_models(State(state): State<AppState>) -> ApiResult<Json<ModelListing>> {
    Ok(Json(state.service.list_models().await?))
}

async fn create_session(State(state): State<AppState>) -> (StatusCode, Json<CreateSessionResponse>) {
    let session_id = state.service.create_session().await;
    (StatusCode::CREATED, Json(CreateSessionResponse { session_id }))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.service.list_sessions().await)
}

async fn get_or_create_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<SessionInfo> {
    Json(state.service.get_or_create_session(&id).await.info())
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionDetail>> {
    let session = state.service.session(&id).await?;
    Ok(Json(SessionDetail {
        info: session.info(),
        conversation: session.conversation().as_prompt().to_vec(),
    }))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.service.unload_session(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SetModelRequest>,
) -> ApiResult<StatusCode> {
    state.service.set_model(&id, &req.model).await?;
    Ok(StatusCode::OK)
}

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MessageRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let text = state.service.send_message(&id, &req.text).await?;
    Ok(Json(MessageResponse { session_id: id, text }))
}

async fn stream_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MessageRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let mut fragments = state.service.stream_message(&id, &req.text).await?;
    let events = async_stream::stream! {
        let mut failed = false;
        while let Some(item) = fragments.next().await {
            match item {
                Ok(fragment) => yield Ok::<_, Infallible>(fragment_event(&fragment)),
                Err(e) => {
                    failed = true;
                    yield Ok(error_event(&e));
                    break;
                }
            }
        }
        if !failed {
            yield Ok(Event::default().event("done").data("[DONE]"));
        }
    };
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// SSE fields cannot carry `\r`; line breaks become `\n`, which the
/// encoder splits into consecutive `data:` lines.
fn fragment_event(fragment: &str) -> Event {
    let data = fragment.replace("\r\n", "\n").replace('\r', "\n");
    Event::default().event("fragment").data(data)
}

fn error_event(err: &SessionError) -> Event {
    let body = ErrorBody {
        error: err.to_string(),
        kind: err.kind(),
    };
    Event::default()
        .event("error")
        .json_data(&body)
        .unwrap_or_else(|_| Event::default().event("error").data(err.to_string()))
}

async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let cancelled = state.service.cancel(&id).await?;
    Ok(Json(CancelResponse { cancelled }))
}

async fn new_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<NewChatResponse>> {
    let chat_key = state.service.new_chat(&id).await?;
    Ok(Json(NewChatResponse { chat_key }))
}

async fn load_chat(
    State(state): State<AppState>,
    Path((id, chat_key)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.service.load_chat(&id, &chat_key).await?;
    Ok(StatusCode::OK)
}

async fn compress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<CompressResponse>> {
    let compressed = state.service.compress(&id).await?;
    Ok(Json(CompressResponse { compressed }))
}
