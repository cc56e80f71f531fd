//! Service runner and HTTP control surface
//!
//! Wires the store, gate, caches, section pool and fan-out hub together,
//! then serves two surfaces on one listener: the `/ws` realtime endpoint
//! and a token-guarded admin API for canvas reconfiguration, bans,
//! privileged fills, history reads and batch-job triggers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::cache::SnapshotCache;
use crate::config::{CanvasConfig, PaletteColor, RuntimeConfig, SharedRuntime};
use crate::database::Database;
use crate::economy::Economy;
use crate::error::Result;
use crate::fanout::{start_presence_task, ConnId, ConnectionHub};
use crate::gate::{AdmissionGate, Outcome, Session, UndoOutcome};
use crate::jobs::{JobScheduler, LoggingBatchJobs};
use crate::protocol::{ClientMsg, ServerMsg};
use crate::sections::{SectionGeometry, SectionPool};

/// User id placements from the privileged fill endpoint are attributed to.
const FILL_USER: &str = "admin";

/// Everything the runner needs to come up; assembled from CLI/env in main.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub database_url: String,
    pub listen_addr: SocketAddr,
    pub admin_token: Option<String>,
    pub palette: Vec<PaletteColor>,
    pub canvas: CanvasConfig,
}

#[derive(Clone)]
pub struct AppState {
    db: Arc<Database>,
    runtime: Arc<SharedRuntime>,
    gate: Arc<AdmissionGate>,
    snapshot: Arc<SnapshotCache>,
    sections: Arc<SectionPool>,
    hub: Arc<ConnectionHub>,
    scheduler: Arc<JobScheduler>,
    canvas: CanvasConfig,
    admin_token: Option<String>,
}

pub struct ServiceRunner {
    config: ServiceConfig,
}

impl ServiceRunner {
    pub fn new(config: ServiceConfig) -> Self {
        Self { config }
    }

    /// Connect, recover, spawn the background tasks and serve until the
    /// listener fails or the process is shut down.
    pub async fn run(self) -> Result<()> {
        let state = self.build_state().await?;

        start_presence_task(
            state.hub.clone(),
            state.db.clone(),
            StdDuration::from_secs(state.canvas.heartbeat_secs),
        );
        state
            .scheduler
            .clone()
            .start(StdDuration::from_secs(state.canvas.heatmap_interval_secs));

        let listen_addr = self.config.listen_addr;
        let app = router(state);

        info!("Listening on {}", listen_addr);
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(anyhow::Error::from)?;
        axum::serve(listener, app)
            .await
            .map_err(anyhow::Error::from)?;
        Ok(())
    }

    async fn build_state(&self) -> Result<AppState> {
        let canvas = self.config.canvas.clone();
        let db = Arc::new(Database::new(&self.config.database_url).await?);
        db.ensure_schema().await?;

        let (width, height) = db
            .canvas_size(canvas.default_width, canvas.default_height)
            .await?;
        let frozen = db.canvas_frozen().await?;
        let runtime = Arc::new(SharedRuntime::new(RuntimeConfig {
            palette: self.config.palette.clone(),
            width,
            height,
            frozen,
            revision: 0,
        }));

        let economy = Economy::new(
            Duration::seconds(canvas.base_cooldown_secs as i64),
            canvas.max_stack,
        );
        let gate = Arc::new(AdmissionGate::new(
            db.clone(),
            runtime.clone(),
            economy,
            Duration::seconds(canvas.undo_window_secs as i64),
            canvas.max_stack,
        ));

        let snapshot = Arc::new(SnapshotCache::new(
            db.clone(),
            StdDuration::from_secs(canvas.snapshot_ttl_secs),
            canvas.default_width,
            canvas.default_height,
        ));

        let sections = SectionPool::new(
            db.clone(),
            SectionGeometry::new(width, height, canvas.section_edge),
            canvas.worker_count,
            StdDuration::from_secs(canvas.snapshot_ttl_secs),
        );
        let replayed = sections.recover_pending().await?;
        if replayed > 0 {
            info!("Replayed {} pending section patches", replayed);
        }

        let scheduler = JobScheduler::new(
            Arc::new(LoggingBatchJobs),
            StdDuration::from_secs(canvas.heatmap_interval_secs),
        );

        Ok(AppState {
            db,
            runtime,
            gate,
            snapshot,
            sections,
            hub: ConnectionHub::new(),
            scheduler,
            canvas,
            admin_token: self.config.admin_token.clone(),
        })
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/history", get(history_handler))
        .route(
            "/admin/canvas-size",
            get(get_canvas_size).put(put_canvas_size),
        )
        .route("/admin/frozen", put(put_frozen))
        .route("/admin/fill", post(post_fill))
        .route("/admin/ban", post(post_ban))
        .route("/admin/unban", post(post_unban))
        .route("/admin/stack", post(post_stack))
        .route("/admin/heatmap", post(post_heatmap))
        .route("/admin/istop", post(post_istop))
        .with_state(state)
}

// ----------------------------------------------------------------------
// Realtime endpoint

#[derive(Debug, Deserialize)]
struct WsQuery {
    user: Option<String>,
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let session = session_from_request(&query, &headers);
    ws.on_upgrade(move |socket| handle_socket(state, socket, session))
}

/// Identity is transport-level: the upgrade request carries the user id
/// (query param or header, the reverse proxy's business) and the serving
/// domain.
fn session_from_request(query: &WsQuery, headers: &HeaderMap) -> Session {
    let user_id = query.user.clone().or_else(|| {
        headers
            .get("x-canvas-user")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });
    let domain = headers
        .get("x-forwarded-host")
        .and_then(|v| v.to_str().ok())
        .map(|host| host.split(':').next().unwrap_or(host).to_string());
    Session { user_id, domain }
}

async fn handle_socket(state: AppState, socket: WebSocket, session: Session) {
    let (conn_id, mut rx) = state.hub.register(session.user_id.clone());
    let (mut sink, mut stream) = socket.split();

    // Writer drains the hub's per-connection channel onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("Failed to encode server message: {}", e),
            }
        }
        let _ = sink.close().await;
    });

    if let Err(e) = push_connect_state(&state, conn_id, &session).await {
        error!("Failed to push connect state to {}: {}", conn_id, e);
    }

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        match serde_json::from_str::<ClientMsg>(&text) {
            Ok(ClientMsg::Place { x, y, color_id }) => {
                handle_place(&state, conn_id, &session, x, y, color_id).await;
            }
            Ok(ClientMsg::Undo) => {
                handle_undo(&state, conn_id, &session).await;
            }
            Err(e) => {
                debug!("Unparseable client message on {}: {}", conn_id, e);
                state.hub.send_to(
                    conn_id,
                    ServerMsg::Error {
                        code: "bad_message".into(),
                        message: "could not parse message".into(),
                    },
                );
            }
        }
    }

    state.hub.unregister(conn_id);
    writer.abort();
}

/// Connect-time push: config, full canvas, then the user's own economy,
/// undo-window and standing state.
async fn push_connect_state(state: &AppState, conn_id: ConnId, session: &Session) -> Result<()> {
    let runtime = state.runtime.current().await;
    state.hub.send_to(
        conn_id,
        ServerMsg::Config {
            palette: runtime.palette.clone(),
            width: runtime.width,
            height: runtime.height,
            base_cooldown_secs: state.canvas.base_cooldown_secs,
            max_stack: state.canvas.max_stack,
        },
    );

    let snapshot = state.snapshot.get_snapshot().await?;
    state.hub.send_to(
        conn_id,
        ServerMsg::Canvas {
            cells: runtime.render_cells(&snapshot.cells),
        },
    );

    let Some(user_id) = session.user_id.as_deref() else {
        return Ok(());
    };

    let (count, next_refill_at) = state.gate.availability(user_id).await?;
    state.hub.send_to(
        conn_id,
        ServerMsg::AvailablePixels {
            count,
            next_refill_at,
        },
    );
    if let Some(placed_at) = state.db.last_placed_at(user_id).await? {
        state
            .hub
            .send_to(conn_id, ServerMsg::PixelLastPlaced { placed_at });
    }
    if let Some(user) = state.db.load_user(user_id).await? {
        let window_expires_at = user.undo_expires_at.filter(|t| *t > Utc::now());
        state
            .hub
            .send_to(conn_id, ServerMsg::Undo { window_expires_at });
    }
    let standing = state.gate.standing(session).await?;
    if standing.banned {
        state.hub.send_to(
            conn_id,
            ServerMsg::Standing {
                banned: standing.banned,
                until: standing.until,
                reason: standing.reason,
            },
        );
    }
    Ok(())
}

async fn handle_place(
    state: &AppState,
    conn_id: ConnId,
    session: &Session,
    x: i32,
    y: i32,
    color_id: i32,
) {
    match state.gate.try_place(session, x, y, color_id).await {
        Ok(Outcome::Accepted(accepted)) => {
            if let Err(e) = state.sections.submit_patch(x, y, color_id).await {
                error!("Failed to hand placement at ({}, {}) to its section worker: {}", x, y, e);
            }
            if let Err(e) = state.snapshot.patch_at(x, y, color_id).await {
                error!("Failed to patch snapshot at ({}, {}): {}", x, y, e);
            }
            state
                .hub
                .broadcast(&ServerMsg::Pixel { x, y, color_id }, Some(conn_id));
            state.hub.send_to(
                conn_id,
                ServerMsg::PlaceAck {
                    accepted: true,
                    x,
                    y,
                    color_id,
                    reason: None,
                },
            );
            if let Some(user_id) = session.user_id.as_deref() {
                state.hub.unicast_user(
                    user_id,
                    &ServerMsg::AvailablePixels {
                        count: accepted.available,
                        next_refill_at: accepted.next_refill_at,
                    },
                );
                state.hub.unicast_user(
                    user_id,
                    &ServerMsg::PixelLastPlaced {
                        placed_at: accepted.placement.placed_at,
                    },
                );
                state.hub.unicast_user(
                    user_id,
                    &ServerMsg::Undo {
                        window_expires_at: Some(accepted.undo_expires_at),
                    },
                );
            }
        }
        Ok(Outcome::Rejected(reason)) => {
            debug!("Placement at ({}, {}) rejected on {}: {:?}", x, y, conn_id, reason);
            state.hub.send_to(
                conn_id,
                ServerMsg::PlaceAck {
                    accepted: false,
                    x,
                    y,
                    color_id,
                    reason: Some(reason),
                },
            );
        }
        Err(e) => {
            error!("Placement at ({}, {}) failed: {}", x, y, e);
            state.hub.send_to(
                conn_id,
                ServerMsg::Error {
                    code: "place_failed".into(),
                    message: "placement could not be processed".into(),
                },
            );
        }
    }
}

async fn handle_undo(state: &AppState, conn_id: ConnId, session: &Session) {
    match state.gate.try_undo(session).await {
        Ok(UndoOutcome::Accepted(undo)) => {
            let (x, y) = (undo.tombstone.x, undo.tombstone.y);
            let color_id = undo.tombstone.color_id;
            if let Err(e) = state.sections.submit_patch(x, y, color_id).await {
                error!("Failed to hand undo at ({}, {}) to its section worker: {}", x, y, e);
            }
            if let Err(e) = state.snapshot.patch_at(x, y, color_id).await {
                error!("Failed to patch snapshot at ({}, {}): {}", x, y, e);
            }
            // The restored color goes to everyone, the undoer included,
            // since their optimistic state still shows the reverted pixel.
            state.hub.broadcast(&ServerMsg::Pixel { x, y, color_id }, None);
            state
                .hub
                .send_to(conn_id, ServerMsg::UndoAck { accepted: true });
            if let Some(user_id) = session.user_id.as_deref() {
                state.hub.unicast_user(
                    user_id,
                    &ServerMsg::AvailablePixels {
                        count: undo.available,
                        next_refill_at: undo.next_refill_at,
                    },
                );
                state.hub.unicast_user(
                    user_id,
                    &ServerMsg::Undo {
                        window_expires_at: None,
                    },
                );
            }
        }
        Ok(UndoOutcome::Rejected) => {
            state
                .hub
                .send_to(conn_id, ServerMsg::UndoAck { accepted: false });
        }
        Err(e) => {
            error!("Undo failed on {}: {}", conn_id, e);
            state.hub.send_to(
                conn_id,
                ServerMsg::Error {
                    code: "undo_failed".into(),
                    message: "undo could not be processed".into(),
                },
            );
        }
    }
}

// ----------------------------------------------------------------------
// Admin surface

fn authorize(state: &AppState, headers: &HeaderMap) -> std::result::Result<(), StatusCode> {
    let Some(expected) = state.admin_token.as_deref() else {
        // No token configured means the admin surface is closed.
        return Err(StatusCode::FORBIDDEN);
    };
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected) {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

fn internal(e: crate::error::CanvasError) -> StatusCode {
    error!("Admin request failed: {}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}

#[derive(Debug, Serialize, Deserialize)]
struct CanvasSizeBody {
    width: u32,
    height: u32,
}

async fn get_canvas_size(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Json<CanvasSizeBody>, StatusCode> {
    authorize(&state, &headers)?;
    let runtime = state.runtime.current().await;
    Ok(Json(CanvasSizeBody {
        width: runtime.width,
        height: runtime.height,
    }))
}

/// Resize the canvas: persist the new size, publish a new runtime config,
/// drop every derived cache and tell all clients to reload.
async fn put_canvas_size(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CanvasSizeBody>,
) -> std::result::Result<StatusCode, StatusCode> {
    authorize(&state, &headers)?;
    if body.width == 0 || body.height == 0 {
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }
    state
        .db
        .set_canvas_size(body.width, body.height)
        .await
        .map_err(internal)?;

    let current = state.runtime.current().await;
    let next = state
        .runtime
        .replace(RuntimeConfig {
            palette: current.palette.clone(),
            width: body.width,
            height: body.height,
            frozen: current.frozen,
            revision: current.revision,
        })
        .await;
    state.snapshot.invalidate().await;
    state.sections.reconfigure(SectionGeometry::new(
        body.width,
        body.height,
        state.canvas.section_edge,
    ));
    info!("Canvas resized to {}x{}", body.width, body.height);
    broadcast_config(&state, &next).await.map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct FrozenBody {
    frozen: bool,
}

async fn put_frozen(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<FrozenBody>,
) -> std::result::Result<StatusCode, StatusCode> {
    authorize(&state, &headers)?;
    state
        .db
        .set_canvas_frozen(body.frozen)
        .await
        .map_err(internal)?;
    let current = state.runtime.current().await;
    state
        .runtime
        .replace(RuntimeConfig {
            palette: current.palette.clone(),
            width: current.width,
            height: current.height,
            frozen: body.frozen,
            revision: current.revision,
        })
        .await;
    info!("Canvas frozen = {}", body.frozen);
    Ok(StatusCode::NO_CONTENT)
}

/// Push refreshed client configuration and the (possibly resized) canvas
/// to every live connection.
async fn broadcast_config(state: &AppState, runtime: &RuntimeConfig) -> Result<()> {
    state.hub.broadcast(
        &ServerMsg::Config {
            palette: runtime.palette.clone(),
            width: runtime.width,
            height: runtime.height,
            base_cooldown_secs: state.canvas.base_cooldown_secs,
            max_stack: state.canvas.max_stack,
        },
        None,
    );
    let snapshot = state.snapshot.get_snapshot().await?;
    state.hub.broadcast(
        &ServerMsg::Canvas {
            cells: runtime.render_cells(&snapshot.cells),
        },
        None,
    );
    Ok(())
}

#[derive(Debug, Deserialize)]
struct FillBody {
    x0: i32,
    y0: i32,
    x1: i32,
    y1: i32,
    color_id: i32,
}

#[derive(Debug, Serialize)]
struct FillResponse {
    filled: u64,
}

/// Privileged rectangle fill, bypassing the economy. Appends a placement
/// row per cell so history and the fold stay consistent, then rebuilds the
/// derived caches once.
async fn post_fill(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<FillBody>,
) -> std::result::Result<Json<FillResponse>, StatusCode> {
    authorize(&state, &headers)?;
    let runtime = state.runtime.current().await;
    if runtime.color(body.color_id).is_none() {
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }
    let x0 = body.x0.min(body.x1).max(0);
    let y0 = body.y0.min(body.y1).max(0);
    let x1 = body.x0.max(body.x1).min(runtime.width as i32 - 1);
    let y1 = body.y0.max(body.y1).min(runtime.height as i32 - 1);
    if x0 > x1 || y0 > y1 {
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }

    let now = Utc::now();
    state
        .db
        .ensure_user(FILL_USER, 0, now)
        .await
        .map_err(internal)?;
    let mut filled = 0u64;
    for y in y0..=y1 {
        for x in x0..=x1 {
            state
                .db
                .insert_placement(FILL_USER, x, y, body.color_id, now, None)
                .await
                .map_err(internal)?;
            filled += 1;
        }
    }

    state.snapshot.invalidate().await;
    state.sections.reconfigure(state.sections.geometry());
    warn!(
        "Admin fill: {} cells ({}, {})..({}, {}) with color {}",
        filled, x0, y0, x1, y1, body.color_id
    );
    broadcast_config(&state, &runtime).await.map_err(internal)?;
    Ok(Json(FillResponse { filled }))
}

#[derive(Debug, Deserialize)]
struct BanBody {
    user: Option<String>,
    domain: Option<String>,
    duration_secs: Option<u64>,
    reason: Option<String>,
}

async fn post_ban(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BanBody>,
) -> std::result::Result<StatusCode, StatusCode> {
    authorize(&state, &headers)?;
    let expires_at = body
        .duration_secs
        .map(|secs| Utc::now() + Duration::seconds(secs as i64));
    match (&body.user, &body.domain) {
        (Some(user), _) => {
            state
                .db
                .set_user_ban(user, expires_at.or(Some(Utc::now() + Duration::days(3650))))
                .await
                .map_err(internal)?;
            state
                .db
                .upsert_ban(
                    &format!("user:{user}"),
                    true,
                    expires_at,
                    body.reason.clone(),
                )
                .await
                .map_err(internal)?;
            info!("Banned user {} (expires {:?})", user, expires_at);
            state.hub.unicast_user(
                user,
                &ServerMsg::Standing {
                    banned: true,
                    until: expires_at,
                    reason: body.reason,
                },
            );
        }
        (None, Some(domain)) => {
            state
                .db
                .upsert_ban(&format!("domain:{domain}"), true, expires_at, body.reason)
                .await
                .map_err(internal)?;
            info!("Banned domain {} (expires {:?})", domain, expires_at);
        }
        (None, None) => return Err(StatusCode::UNPROCESSABLE_ENTITY),
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Unbans write an explicit banned = false row; for domains that row
/// overrides any ban inherited from a parent domain.
async fn post_unban(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BanBody>,
) -> std::result::Result<StatusCode, StatusCode> {
    authorize(&state, &headers)?;
    match (&body.user, &body.domain) {
        (Some(user), _) => {
            state.db.set_user_ban(user, None).await.map_err(internal)?;
            state
                .db
                .upsert_ban(&format!("user:{user}"), false, None, None)
                .await
                .map_err(internal)?;
            info!("Unbanned user {}", user);
            state.hub.unicast_user(
                user,
                &ServerMsg::Standing {
                    banned: false,
                    until: None,
                    reason: None,
                },
            );
        }
        (None, Some(domain)) => {
            state
                .db
                .upsert_ban(&format!("domain:{domain}"), false, None, None)
                .await
                .map_err(internal)?;
            info!("Unbanned domain {}", domain);
        }
        (None, None) => return Err(StatusCode::UNPROCESSABLE_ENTITY),
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct StackBody {
    user: String,
    delta: u32,
}

#[derive(Debug, Serialize)]
struct StackResponse {
    available: u32,
}

async fn post_stack(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<StackBody>,
) -> std::result::Result<Json<StackResponse>, StatusCode> {
    authorize(&state, &headers)?;
    let (available, next_refill_at) = state
        .gate
        .grant_stack(&body.user, body.delta)
        .await
        .map_err(internal)?;
    state.hub.unicast_user(
        &body.user,
        &ServerMsg::AvailablePixels {
            count: available,
            next_refill_at,
        },
    );
    Ok(Json(StackResponse { available }))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    x: i32,
    y: i32,
    limit: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryEntry {
    user_id: String,
    color_id: i32,
    placed_at: chrono::DateTime<Utc>,
    undo_of: Option<i64>,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    total: u64,
    placements: Vec<HistoryEntry>,
}

async fn history_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> std::result::Result<Json<HistoryResponse>, StatusCode> {
    authorize(&state, &headers)?;
    let (rows, total) = state
        .db
        .cell_history(query.x, query.y, query.limit.unwrap_or(50))
        .await
        .map_err(internal)?;
    Ok(Json(HistoryResponse {
        total,
        placements: rows
            .into_iter()
            .map(|row| HistoryEntry {
                user_id: row.user_id,
                color_id: row.color_id,
                placed_at: row.placed_at,
                undo_of: row.undo_of,
            })
            .collect(),
    }))
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    triggered: bool,
}

async fn post_heatmap(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Json<TriggerResponse>, StatusCode> {
    authorize(&state, &headers)?;
    let triggered = state.scheduler.trigger_heatmap().await.map_err(internal)?;
    Ok(Json(TriggerResponse { triggered }))
}

async fn post_istop(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<StatusCode, StatusCode> {
    authorize(&state, &headers)?;
    state.scheduler.trigger_is_top().await.map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_prefers_query_user() {
        let query = WsQuery {
            user: Some("alice".into()),
        };
        let mut headers = HeaderMap::new();
        headers.insert("x-canvas-user", "bob".parse().unwrap());
        headers.insert("x-forwarded-host", "chat.aftermath.gg:8080".parse().unwrap());

        let session = session_from_request(&query, &headers);
        assert_eq!(session.user_id.as_deref(), Some("alice"));
        assert_eq!(session.domain.as_deref(), Some("chat.aftermath.gg"));
    }

    #[test]
    fn session_falls_back_to_header_user() {
        let query = WsQuery { user: None };
        let mut headers = HeaderMap::new();
        headers.insert("x-canvas-user", "bob".parse().unwrap());

        let session = session_from_request(&query, &headers);
        assert_eq!(session.user_id.as_deref(), Some("bob"));
        assert_eq!(session.domain, None);
    }
}
