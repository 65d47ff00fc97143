use axum::Json;
use beatsync_core::PresignedUpload;
use log::info;

use crate::{
    context::ServerContext,
    errors::ServerResult,
    schemas::{PresignSchema, UploadCompleteSchema, ValidatedJson},
};

#[utoipa::path(
    post,
    path = "/upload/get-presigned-url",
    tag = "uploads",
    request_body = PresignSchema,
    responses(
        (status = 200, description = "An upload slot under the room's prefix"),
        (status = 502, description = "The storage gateway is unavailable")
    )
)]
pub async fn get_presigned_url(
    context: ServerContext,
    ValidatedJson(body): ValidatedJson<PresignSchema>,
) -> ServerResult<Json<PresignedUpload>> {
    let upload = context
        .core
        .context()
        .storage
        .presign_upload(&body.room_id, &body.file_name)
        .await?;

    Ok(Json(upload))
}

#[utoipa::path(
    post,
    path = "/upload/complete",
    tag = "uploads",
    request_body = UploadCompleteSchema,
    responses(
        (status = 200, description = "The upload was queued in the room"),
        (status = 404, description = "The room does not exist")
    )
)]
pub async fn upload_complete(
    context: ServerContext,
    ValidatedJson(body): ValidatedJson<UploadCompleteSchema>,
) -> ServerResult<()> {
    let room = context.core.rooms.room_by_id(&body.room_id)?;

    info!("Upload finished for room {}: {}", body.room_id, body.url);

    room.add_audio_source(&body.url);

    Ok(())
}
