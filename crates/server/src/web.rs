use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use huddle_protocol::{HuddleConfig, Member, RoomId};
use serde_json::{Value, json};

use crate::registry::Registry;
use crate::ws;

/// Shared application state.
pub struct AppState {
    pub config: HuddleConfig,
    pub registry: Registry,
    pub started_at: std::time::Instant,
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/rooms", get(list_rooms))
        .route("/api/rooms/{room_id}", get(get_room))
        .route("/api/health", get(health_check))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| ws::handle_socket(socket, state))
}

async fn list_rooms(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut snapshot = state.registry.rooms_snapshot();
    snapshot.sort_by(|a, b| a.0.cmp(&b.0));
    let rooms: Vec<Value> = snapshot
        .iter()
        .map(|(id, members)| room_json(id, members))
        .collect();
    Json(json!({ "rooms": rooms, "count": rooms.len() }))
}

async fn get_room(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let room_id = RoomId::from(room_id);
    match state.registry.room_snapshot(&room_id) {
        Some(members) => Ok(Json(room_json(&room_id, &members))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "rooms": state.registry.room_count(),
    }))
}

fn room_json(room_id: &RoomId, members: &[Member]) -> Value {
    json!({
        "roomId": room_id,
        "participantCount": members.len(),
        "participants": members
            .iter()
            .map(|m| json!({ "userId": m.user_id, "nickname": m.nickname }))
            .collect::<Vec<Value>>(),
    })
}
