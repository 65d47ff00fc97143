use axum::{response::IntoResponse, Json};
use utoipa::OpenApi;
use utoipauto::utoipauto;

#[utoipauto(paths = "./beatsync-server/src")]
#[derive(OpenApi)]
#[openapi(info(
    description = "beatsync-server exposes room discovery, stats, and upload coordination for this beatsync instance"
))]
pub struct ApiDoc;

pub async fn docs() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}
