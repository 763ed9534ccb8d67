use super::{auth::CurrentUser, error::ApiError, AppState};
use crate::chat::{ChatMessage, ChatRoom};
use crate::entity::UserId;
use crate::session;
use axum::{
    extract::{rejection::JsonRejection, ws::WebSocketUpgrade, Path, Query, State},
    response::Response,
    Json,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Default, Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Pagination {
    /// Out-of-range limits fall back to the default page size.
    pub fn resolve(&self) -> (i64, i64) {
        let limit = match self.limit {
            Some(limit) if limit > 0 && limit <= MAX_PAGE_SIZE => limit,
            _ => DEFAULT_PAGE_SIZE,
        };
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

#[derive(Debug, Deserialize)]
pub struct SendMessage {
    pub content: String,
}

pub async fn health() -> &'static str {
    "ok"
}

/// GET /chat/ws
pub async fn ws_handler(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    ws: WebSocketUpgrade,
) -> Response {
    info!("WebSocket upgrade request from user {}", user_id);

    ws.on_upgrade(move |socket| async move {
        let (writer, reader) = socket.split();
        match session::start(&state.ctx, user_id.clone(), reader, writer).await {
            Ok(tasks) => tasks.join().await,
            Err(e) => error!("Failed to start session for user {}: {}", user_id, e),
        }
    })
}

/// GET /chat/rooms
pub async fn list_rooms(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<Vec<ChatRoom>>, ApiError> {
    Ok(Json(state.ctx.store.rooms_for_user(&user_id).await?))
}

/// GET /chat/online
pub async fn online_users(
    State(state): State<AppState>,
    CurrentUser(_): CurrentUser,
) -> Result<Json<Vec<UserId>>, ApiError> {
    Ok(Json(state.ctx.hub.online_users().await?))
}

/// GET /chat/users/:user_id/online
pub async fn presence(
    State(state): State<AppState>,
    CurrentUser(_): CurrentUser,
    Path(user_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let user_id = UserId::new(user_id);
    let online = state.ctx.hub.is_online(&user_id).await?;
    Ok(Json(json!({
        "user_id": user_id,
        "online": online,
    })))
}

async fn ensure_participant(state: &AppState, room_id: &str, user_id: &UserId) -> Result<(), ApiError> {
    if state.ctx.store.is_participant(room_id, user_id).await? {
        Ok(())
    } else {
        Err(ApiError::forbidden("Access denied to this chat room"))
    }
}

/// GET /chat/rooms/:room_id/messages
pub async fn list_messages(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(room_id): Path<String>,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    ensure_participant(&state, &room_id, &user_id).await?;

    let (limit, offset) = page.resolve();
    let messages = state.ctx.store.list_messages(&room_id, limit, offset).await?;

    // Reading the history counts as reading the room.
    let store = state.ctx.store.clone();
    tokio::spawn(async move {
        if let Err(e) = store.mark_read(&room_id, &user_id).await {
            error!(
                "Error marking messages as read for user {} in room {}: {:#}",
                user_id, room_id, e
            );
        }
    });

    Ok(Json(messages))
}

/// POST /chat/rooms/:room_id/read
pub async fn mark_read(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(room_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    ensure_participant(&state, &room_id, &user_id).await?;

    let updated = state.ctx.store.mark_read(&room_id, &user_id).await?;
    Ok(Json(json!({
        "message": "Messages marked as read",
        "updated": updated,
    })))
}

/// POST /chat/rooms/:room_id/messages
///
/// Same delivery path as a socket frame: persist, then publish to both
/// participants.
pub async fn send_message(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(room_id): Path<String>,
    request: Result<Json<SendMessage>, JsonRejection>,
) -> Result<Json<ChatMessage>, ApiError> {
    let Json(request) = request?;
    ensure_participant(&state, &room_id, &user_id).await?;

    let Some(room) = state.ctx.store.room(&room_id).await? else {
        return Err(ApiError::forbidden("Access denied to this chat room"));
    };
    let recipient = room.other_participant(&user_id).clone();

    let message = state
        .ctx
        .store
        .create_message(&room_id, &user_id, &request.content)
        .await?;

    session::deliver(
        state.ctx.bus.as_ref(),
        &state.ctx.config.channel_prefix,
        &message,
        &recipient,
    )
    .await;

    Ok(Json(message))
}
