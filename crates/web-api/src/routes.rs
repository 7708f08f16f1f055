use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{HeaderValue, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use application::ApplicationError;
use domain::{ChatId, ChatMessage, ChatSummary};

use crate::{error::ApiError, state::AppState, ws_connection::WebSocketConnection};

#[derive(Debug, Serialize)]
struct CloseChatResponse {
    message: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ActiveChatsResponse {
    active_chats: Vec<ChatSummary>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EndedChatsResponse {
    ended_chats: Vec<ChatSummary>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndedChatsQuery {
    user_status: Option<String>,
}

impl EndedChatsQuery {
    fn is_admin(&self) -> bool {
        self.user_status
            .as_deref()
            .is_some_and(|status| status.eq_ignore_ascii_case("admin"))
    }
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.cors_origins);

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(websocket_upgrade))
        .route("/closeChat/{chat_id}", post(close_chat))
        .route("/chat/history/{chat_id}", get(chat_history))
        .route("/getActiveChats", get(active_chats))
        .route("/user/activeChats/{user_email}", get(user_active_chats))
        .route("/user/endedChats/{user_email}", get(user_ended_chats))
        .route(
            "/user/endedChats/{user_email}/{user_status}",
            get(user_ended_chats_by_status),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(origin = %origin, error = %err, "忽略无效的跨域来源");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

fn parse_chat_id(raw: String) -> Result<ChatId, ApiError> {
    ChatId::parse(raw).map_err(|err| ApiError::from(ApplicationError::from(err)))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn websocket_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| WebSocketConnection::new(socket, state).run())
}

async fn close_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<Json<CloseChatResponse>, ApiError> {
    let chat_id = parse_chat_id(chat_id)?;
    let report = state.lifecycle_service.close(&chat_id).await?;
    tracing::info!(
        chat_id = %chat_id,
        outcome = ?report.outcome,
        disconnected = report.disconnected,
        "收到关闭会话请求"
    );

    Ok(Json(CloseChatResponse {
        message: "Chat closed successfully",
    }))
}

async fn chat_history(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    let chat_id = parse_chat_id(chat_id)?;
    let chat = state.history_service.history(&chat_id).await?;
    Ok(Json(chat.messages))
}

async fn active_chats(
    State(state): State<AppState>,
) -> Result<Json<ActiveChatsResponse>, ApiError> {
    let active_chats = state.history_service.active_chats(None).await?;
    Ok(Json(ActiveChatsResponse { active_chats }))
}

async fn user_active_chats(
    State(state): State<AppState>,
    Path(user_email): Path<String>,
) -> Result<Json<ActiveChatsResponse>, ApiError> {
    let active_chats = state
        .history_service
        .active_chats(Some(user_email))
        .await?;
    Ok(Json(ActiveChatsResponse { active_chats }))
}

async fn user_ended_chats(
    State(state): State<AppState>,
    Path(user_email): Path<String>,
    Query(query): Query<EndedChatsQuery>,
) -> Result<Json<EndedChatsResponse>, ApiError> {
    ended_chats_for(&state, user_email, &query).await
}

/// 旧客户端把身份状态放在路径里
async fn user_ended_chats_by_status(
    State(state): State<AppState>,
    Path((user_email, user_status)): Path<(String, String)>,
) -> Result<Json<EndedChatsResponse>, ApiError> {
    let query = EndedChatsQuery {
        user_status: Some(user_status),
    };
    ended_chats_for(&state, user_email, &query).await
}

async fn ended_chats_for(
    state: &AppState,
    user_email: String,
    query: &EndedChatsQuery,
) -> Result<Json<EndedChatsResponse>, ApiError> {
    let owner = if query.is_admin() { None } else { Some(user_email) };
    let ended_chats = state.history_service.ended_chats(owner).await?;
    Ok(Json(EndedChatsResponse { ended_chats }))
}
