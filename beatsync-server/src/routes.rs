use axum::{response::IntoResponse, Json};
use beatsync_core::RoomSummary;
use serde::Serialize;
use utoipa::ToSchema;

use crate::context::ServerContext;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub uptime_seconds: u64,
    pub room_count: usize,
    pub active_room_count: usize,
    pub connected_client_count: usize,
    pub session_count: usize,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRoomCount {
    pub count: usize,
}

#[utoipa::path(
    get,
    path = "/",
    tag = "discovery",
    responses(
        (status = 200, description = "The server is up")
    )
)]
pub async fn healthcheck() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[utoipa::path(
    get,
    path = "/stats",
    tag = "discovery",
    responses(
        (status = 200, body = Stats)
    )
)]
pub async fn stats(context: ServerContext) -> Json<Stats> {
    Json(Stats {
        uptime_seconds: context.started_at.elapsed().as_secs(),
        room_count: context.core.rooms.list_all().len(),
        active_room_count: context.core.rooms.active_rooms().len(),
        connected_client_count: context.core.rooms.connected_client_count(),
        session_count: context.sessions.count(),
    })
}

#[utoipa::path(
    get,
    path = "/discover",
    tag = "discovery",
    responses(
        (status = 200, description = "Rooms with at least one connected client")
    )
)]
pub async fn discover(context: ServerContext) -> Json<Vec<RoomSummary>> {
    Json(context.core.rooms.active_rooms())
}

#[utoipa::path(
    get,
    path = "/active-rooms",
    tag = "discovery",
    responses(
        (status = 200, body = ActiveRoomCount)
    )
)]
pub async fn active_rooms(context: ServerContext) -> Json<ActiveRoomCount> {
    Json(ActiveRoomCount {
        count: context.core.rooms.active_rooms().len(),
    })
}

#[utoipa::path(
    get,
    path = "/default",
    tag = "discovery",
    responses(
        (status = 200, description = "The configured default track urls")
    )
)]
pub async fn default_tracks(context: ServerContext) -> Json<Vec<String>> {
    Json(context.core.context().config.default_tracks.clone())
}
