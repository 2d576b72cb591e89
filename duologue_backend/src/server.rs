use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::archive::{
    is_valid_archive_name, ArchiveContent, ArchiveInfo, ArchiveManager, ArchiveOutcome,
    ArchiveReason,
};
use crate::conversation::ConversationState;
use crate::events::{ConversationEvent, EventHub};
use crate::imagery::gallery::{GalleryIndex, ImageArtifact};
use crate::memory::MemorySummary;
use crate::scheduler::TurnScheduler;

const MEMORY_SUMMARY_RECENT: usize = 10;

#[derive(Clone)]
pub struct ServerState {
    pub scheduler: Arc<TurnScheduler>,
    pub archives: Arc<ArchiveManager>,
    pub gallery: Arc<GalleryIndex>,
    pub hub: EventHub,
    pub admin_code: Option<String>,
    pub keepalive: Duration,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    running: bool,
    viewers: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StateResponse {
    #[serde(flatten)]
    state: ConversationState,
    viewers: usize,
    personas: PersonaNames,
}

#[derive(Debug, Serialize)]
struct PersonaNames {
    a: String,
    b: String,
}

#[derive(Debug, Default, Deserialize)]
struct AdminRequest {
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AdminResponse {
    ok: bool,
    changed: bool,
    is_running: bool,
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

pub fn router(state: Arc<ServerState>) -> Router {
    let admin = Router::new()
        .route("/start", post(admin_start))
        .route("/stop", post(admin_stop))
        .route("/reset", post(admin_reset))
        .route("/archive", post(admin_archive));

    let api = Router::new()
        .route("/state", get(get_state))
        .route("/events", get(ws_events_route))
        .route("/archives", get(list_archives))
        .route("/archives/:filename", get(get_archive))
        .route("/gallery", get(list_gallery))
        .route("/gallery/recent", get(recent_gallery))
        .route("/gallery/:id", get(get_gallery_item))
        .route("/personas/:id/memory", get(get_persona_memory))
        .nest("/admin", admin);

    Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .with_state(state)
}

/// Serve until `shutdown` resolves. A failing listener surfaces as an error.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<ServerState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .context("Listener has no local address")?;
    tracing::info!("Duologue listening on http://{}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;
    Ok(())
}

/// Exact match against the configured secret. No secret, or an empty code, never passes.
fn authorize_code(configured: Option<&str>, supplied: Option<&str>) -> Result<(), (StatusCode, String)> {
    let Some(expected) = configured.filter(|code| !code.is_empty()) else {
        return Err(unauthorized());
    };
    let Some(code) = supplied.filter(|code| !code.is_empty()) else {
        return Err(unauthorized());
    };
    if code != expected {
        return Err(unauthorized());
    }
    Ok(())
}

fn authorize_admin(
    state: &ServerState,
    body: Option<Json<AdminRequest>>,
    action: &str,
) -> Result<(), (StatusCode, String)> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    authorize_code(state.admin_code.as_deref(), request.code.as_deref()).map_err(|e| {
        tracing::warn!("Rejected admin '{}' request", action);
        e
    })
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        running: state.scheduler.is_active(),
        viewers: state.hub.viewer_count(),
    })
}

async fn get_state(State(state): State<Arc<ServerState>>) -> Json<StateResponse> {
    let personas = state.scheduler.personas();
    Json(StateResponse {
        state: state.scheduler.snapshot().await,
        viewers: state.hub.viewer_count(),
        personas: PersonaNames {
            a: personas.a.name.clone(),
            b: personas.b.name.clone(),
        },
    })
}

async fn admin_start(
    State(state): State<Arc<ServerState>>,
    body: Option<Json<AdminRequest>>,
) -> Result<Json<AdminResponse>, (StatusCode, String)> {
    authorize_admin(&state, body, "start")?;
    let changed = state.scheduler.start().await;
    Ok(Json(AdminResponse {
        ok: true,
        changed,
        is_running: true,
    }))
}

async fn admin_stop(
    State(state): State<Arc<ServerState>>,
    body: Option<Json<AdminRequest>>,
) -> Result<Json<AdminResponse>, (StatusCode, String)> {
    authorize_admin(&state, body, "stop")?;
    let changed = state.scheduler.stop().await;
    Ok(Json(AdminResponse {
        ok: true,
        changed,
        is_running: false,
    }))
}

async fn admin_reset(
    State(state): State<Arc<ServerState>>,
    body: Option<Json<AdminRequest>>,
) -> Result<Json<AdminResponse>, (StatusCode, String)> {
    authorize_admin(&state, body, "reset")?;
    state.scheduler.reset().await;
    Ok(Json(AdminResponse {
        ok: true,
        changed: true,
        is_running: false,
    }))
}

async fn admin_archive(
    State(state): State<Arc<ServerState>>,
    body: Option<Json<AdminRequest>>,
) -> Result<Json<ArchiveOutcome>, (StatusCode, String)> {
    authorize_admin(&state, body, "archive")?;
    if !state.archives.has_sinks() {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "no archive destination configured".to_string(),
        ));
    }
    let snapshot = state.scheduler.snapshot().await;
    let outcome = state.archives.archive(&snapshot, ArchiveReason::Manual).await;
    if !outcome.any_succeeded() {
        return Err((
            StatusCode::BAD_GATEWAY,
            format!("archive {} failed on every destination", outcome.filename),
        ));
    }
    Ok(Json(outcome))
}

async fn list_archives(State(state): State<Arc<ServerState>>) -> Json<Vec<ArchiveInfo>> {
    Json(state.archives.list().await)
}

async fn get_archive(
    State(state): State<Arc<ServerState>>,
    Path(filename): Path<String>,
) -> Result<Json<ArchiveContent>, (StatusCode, String)> {
    if !is_valid_archive_name(&filename) {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("invalid archive name '{}'", filename),
        ));
    }
    state
        .archives
        .fetch(&filename)
        .await
        .map_err(internal_error)?
        .map(Json)
        .ok_or_else(|| not_found(format!("archive '{}' not found", filename)))
}

async fn list_gallery(State(state): State<Arc<ServerState>>) -> Json<Vec<ImageArtifact>> {
    Json(state.gallery.list())
}

async fn recent_gallery(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<RecentQuery>,
) -> Json<Vec<ImageArtifact>> {
    let limit = clamp_limit(query.limit, 12, 1, 100);
    Json(state.gallery.recent(limit))
}

async fn get_gallery_item(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<ImageArtifact>, (StatusCode, String)> {
    state
        .gallery
        .get(&id)
        .map(Json)
        .ok_or_else(|| not_found(format!("image '{}' not found", id)))
}

async fn get_persona_memory(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<MemorySummary>, (StatusCode, String)> {
    let persona = state
        .scheduler
        .personas()
        .find(&id)
        .ok_or_else(|| not_found(format!("persona '{}' not found", id)))?;
    let memory = state.scheduler.memory().ok_or_else(|| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "persona memory is unavailable".to_string(),
        )
    })?;
    memory
        .summary(&persona.name, MEMORY_SUMMARY_RECENT)
        .map(Json)
        .map_err(internal_error)
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(state, socket))
}

async fn send_event(socket: &mut WebSocket, event: &ConversationEvent) -> bool {
    let payload = match serde_json::to_string(event) {
        Ok(serialized) => serialized,
        Err(error) => {
            tracing::warn!("Failed to serialize websocket event: {}", error);
            return true;
        }
    };
    socket.send(WsMessage::Text(payload)).await.is_ok()
}

async fn handle_events_socket(state: Arc<ServerState>, mut socket: WebSocket) {
    let mut rx = state.hub.subscribe();
    let _viewer = state.hub.connect_viewer();

    let greeting = [
        ConversationEvent::Status {
            is_running: state.scheduler.is_active(),
        },
        ConversationEvent::Viewers {
            count: state.hub.viewer_count(),
        },
    ];
    for event in &greeting {
        if !send_event(&mut socket, event).await {
            return;
        }
    }

    let mut keepalive = tokio::time::interval(state.keepalive);
    keepalive.tick().await;

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !send_event(&mut socket, &event).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Viewer lagged; skipped {} events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = keepalive.tick() => {
                if socket.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

fn clamp_limit(value: Option<usize>, default: usize, min: usize, max: usize) -> usize {
    value.unwrap_or(default).clamp(min, max)
}

fn unauthorized() -> (StatusCode, String) {
    (StatusCode::UNAUTHORIZED, "invalid admin code".to_string())
}

fn not_found(message: String) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, message)
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", error))
}
