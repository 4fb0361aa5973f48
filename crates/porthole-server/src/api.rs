//! The HTTP surface: `POST /sync` plus a health probe.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use porthole_shared::protocol::Request;

use crate::error::ServerError;
use crate::handler::SyncHandler;
use crate::poller::PollerMap;

#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<SyncHandler>,
    pub poller_map: Arc<PollerMap>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/sync", post(sync))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Default, Deserialize)]
struct SyncParams {
    pos: Option<String>,
    session: Option<String>,
}

async fn sync(
    State(state): State<AppState>,
    Query(params): Query<SyncParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServerError> {
    let credential = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ServerError::BadRequest("missing Authorization header".into()))?
        .to_string();

    let pos = match &params.pos {
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .filter(|p| *p >= 0)
            .ok_or_else(|| ServerError::BadRequest(format!("invalid position: {raw}")))?,
        None => 0,
    };

    let req: Request = if body.is_empty() {
        Request::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ServerError::BadRequest(format!("malformed body: {e}")))?
    };
    for list in &req.lists {
        list.validate().map_err(ServerError::BadRequest)?;
    }

    let conn = state
        .handler
        .setup_connection(&state.poller_map, &credential, params.session.clone())
        .await?;

    let response = conn.on_incoming_request(pos, &req).await?;
    info!(conn_id = %conn.conn_id, pos = response.pos, "served sync response");

    let headers = [
        ("X-Sync3-Position", response.pos.to_string()),
        ("X-Sync3-Session", conn.conn_id.session_id.clone()),
    ];
    Ok((headers, Json(response)))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
