//! Routes validated frames to room handlers, applying the permission gates.

use beatsync_core::{ClientRequest, OutboundFrame, ServerMessage};
use log::{info, warn};

use crate::{context::ServerContext, gateway::Session};

/// Operations that mutate room state: admins always may, everyone else only
/// while the room permission mode allows it.
fn requires_can_mutate(request: &ClientRequest) -> bool {
    matches!(
        request,
        ClientRequest::Play { .. }
            | ClientRequest::Pause { .. }
            | ClientRequest::StartSpatialAudio
            | ClientRequest::StopSpatialAudio
            | ClientRequest::ReorderClient { .. }
            | ClientRequest::SetListeningSource { .. }
            | ClientRequest::SetPlaybackControls { .. }
            | ClientRequest::SetGlobalVolume { .. }
            | ClientRequest::LoadDefaultTracks
            | ClientRequest::DeleteAudioSources { .. }
            | ClientRequest::StreamMusic { .. }
    )
}

/// Operations reserved for admins regardless of the permission mode.
fn requires_admin(request: &ClientRequest) -> bool {
    matches!(request, ClientRequest::SetAdmin { .. })
}

/// Handles one inbound frame. `t1` is the pre-parse receive timestamp.
///
/// Validation failures answer with an ERROR frame; authorization failures
/// log and drop; handler failures never close the socket.
pub async fn handle_frame(context: &ServerContext, session: &Session, text: &str, t1: f64) {
    let core = context.core.context();

    let request = match beatsync_core::decode_request(text) {
        Ok(request) => request,
        Err(e) => {
            warn!("Client {} sent a malformed frame: {e}", session.client_id);
            let _ = session
                .outbox
                .send(OutboundFrame::Message(ServerMessage::invalid_format()));
            return;
        }
    };

    if let Err(e) = request.validate(&core.config) {
        warn!("Client {} sent an invalid frame: {e}", session.client_id);
        let _ = session
            .outbox
            .send(OutboundFrame::Message(ServerMessage::invalid_format()));
        return;
    }

    // Time sync is answered before anything else can delay it. The probe
    // doubles as the heartbeat.
    if let ClientRequest::NtpRequest { t0, rtt } = &request {
        if let Ok(room) = context.core.rooms.room_by_id(&session.room_id) {
            room.observe_ntp(&session.client_id, *rtt);
        }

        let _ = session
            .outbox
            .send(OutboundFrame::Message(ServerMessage::NtpResponse {
                t0: *t0,
                t1,
                t2: core.clock.now_precise_ms(),
            }));

        return;
    }

    let Ok(room) = context.core.rooms.room_by_id(&session.room_id) else {
        warn!(
            "Dropping frame from {}: room {} is gone",
            session.client_id, session.room_id
        );
        return;
    };

    if requires_can_mutate(&request) && !room.can_mutate(&session.client_id) {
        warn!(
            "Client {} may not mutate room {}",
            session.client_id, session.room_id
        );
        return;
    }

    if requires_admin(&request) && !room.is_admin(&session.client_id) {
        warn!(
            "Client {} is not an admin of room {}",
            session.client_id, session.room_id
        );
        return;
    }

    match request {
        // Answered above.
        ClientRequest::NtpRequest { .. } => {}

        ClientRequest::Play {
            audio_source,
            track_time_seconds,
        } => room.handle_play(&session.client_id, &audio_source, track_time_seconds),
        ClientRequest::Pause {
            audio_source,
            track_time_seconds,
        } => room.handle_pause(&audio_source, track_time_seconds),
        ClientRequest::Sync => room.handle_sync(&session.client_id),

        ClientRequest::StartSpatialAudio => room.start_spatial_audio(),
        ClientRequest::StopSpatialAudio => room.stop_spatial_audio(),
        ClientRequest::ReorderClient { client_id } => room.reorder_client(&client_id),
        ClientRequest::SetListeningSource { x, y } => room.set_listening_source(x, y),
        ClientRequest::MoveClient { x, y } => room.move_client(&session.client_id, x, y),

        ClientRequest::SetAdmin {
            client_id,
            is_admin,
        } => room.set_admin(&client_id, is_admin),
        ClientRequest::SetPlaybackControls { permissions } => room.set_permissions(permissions),
        ClientRequest::SetGlobalVolume { volume } => room.set_global_volume(volume),

        ClientRequest::SendChatMessage { text } => room.send_chat(&session.client_id, &text),

        ClientRequest::SendIp { ip } => match core.geo.lookup(&ip).await {
            Ok(location) => room.set_location(&session.client_id, location),
            Err(e) => info!("Geo lookup for {} failed: {e}", session.client_id),
        },

        ClientRequest::AudioSourceLoaded { url } => {
            room.confirm_loaded(&session.client_id, &url)
        }

        ClientRequest::LoadDefaultTracks => room.load_default_tracks(&core.config.default_tracks),
        ClientRequest::DeleteAudioSources { urls } => room.delete_audio_sources(urls).await,

        ClientRequest::SearchMusic { query } => match core.provider.search(&query).await {
            Ok(results) => {
                let _ = session
                    .outbox
                    .send(OutboundFrame::Message(ServerMessage::SearchResponse {
                        results,
                    }));
            }
            Err(e) => {
                warn!("Search for {} failed: {e}", session.client_id);
                let _ = session
                    .outbox
                    .send(OutboundFrame::Message(ServerMessage::Error {
                        message: "Search failed".to_string(),
                    }));
            }
        },
        ClientRequest::StreamMusic { track_id } => room.stream_music(&track_id),
    }
}
