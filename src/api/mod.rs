//! HTTP surface: the socket upgrade plus the chat history endpoints.

mod auth;
mod error;
mod handlers;

use crate::session::SessionContext;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub ctx: SessionContext,
}

pub fn router(ctx: SessionContext) -> Router {
    let state = AppState { ctx };

    Router::new()
        .route("/health", get(handlers::health))
        .route("/chat/ws", get(handlers::ws_handler))
        .route("/chat/online", get(handlers::online_users))
        .route("/chat/users/:user_id/online", get(handlers::presence))
        .route("/chat/rooms", get(handlers::list_rooms))
        .route(
            "/chat/rooms/:room_id/messages",
            get(handlers::list_messages).post(handlers::send_message),
        )
        .route("/chat/rooms/:room_id/read", post(handlers::mark_read))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
