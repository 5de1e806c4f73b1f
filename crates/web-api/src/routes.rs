use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::Response,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use application::{ConnectionSession, MessageFrame};
use domain::{MessageId, UserId};

use crate::{error::ApiError, identity::AuthenticatedUser, state::AppState, transport::WsTransport};

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    to: Option<String>,
    #[serde(rename = "beforeId")]
    before_id: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/chat/ws", get(websocket_upgrade))
        .route("/chat/messages", get(get_history))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn get_history(
    State(state): State<AppState>,
    AuthenticatedUser(caller): AuthenticatedUser,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<MessageFrame>>, ApiError> {
    let peer = query
        .to
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("missing `to`"))?
        .parse::<UserId>()
        .map_err(|_| ApiError::bad_request("invalid `to`"))?;
    let before_id = query
        .before_id
        .as_deref()
        .map(|raw| raw.trim().parse::<u64>().map(MessageId))
        .transpose()
        .map_err(|_| ApiError::bad_request("invalid `beforeId`"))?;

    let page = state.history.list(caller, peer, before_id).await?;
    Ok(Json(page.iter().map(MessageFrame::from).collect()))
}

/// 先为调用方建立会话资源，成功后才升级连接
async fn websocket_upgrade(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let session = ConnectionSession::connect(state.gateway.clone(), user_id)
        .await
        .map_err(|err| {
            tracing::error!(user_id = %user_id, error = %err, "failed to open session");
            ApiError::internal_server_error("failed to open session")
        })?;

    let sessions = state.gateway.sessions.clone();
    Ok(ws.on_upgrade(move |socket| {
        sessions.track_future(async move {
            let reason = session.run(WsTransport::new(socket)).await;
            tracing::info!(user_id = %user_id, reason = %reason, "connection closed");
        })
    }))
}
