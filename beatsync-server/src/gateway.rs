use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query,
    },
    http::StatusCode,
    response::IntoResponse,
};
use beatsync_core::{encode_message, is_valid_room_id, Id, Outbox, OutboundFrame};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use log::info;
use serde::Deserialize;
use tokio::sync::mpsc::unbounded_channel;

use crate::{context::ServerContext, dispatch};

pub type SessionId = Id<Session>;

/// A connected device's channel into the coordinator. The session owns no
/// room state; the room holds its outbox by client id.
pub struct Session {
    pub id: SessionId,
    pub client_id: String,
    pub username: String,
    pub room_id: String,
    pub outbox: Outbox,
}

/// Tracks live sessions for the stats surface.
#[derive(Default)]
pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    fn register(&self, session: Arc<Session>) {
        self.sessions.insert(session.id, session);
    }

    fn unregister(&self, id: SessionId) {
        self.sessions.remove(&id);
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectQuery {
    pub room_id: String,
    pub client_id: String,
    pub username: String,
}

#[utoipa::path(
    get,
    path = "/ws",
    tag = "gateway",
    responses(
        (status = 101, description = "Upgrades to the room WebSocket"),
        (status = 400, description = "Malformed room id, client id, or username")
    )
)]
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    context: ServerContext,
    Query(query): Query<ConnectQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let valid = is_valid_room_id(&query.room_id)
        && !query.client_id.is_empty()
        && !query.username.trim().is_empty();

    if !valid {
        return Err(StatusCode::BAD_REQUEST);
    }

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, context, query)))
}

async fn handle_socket(socket: WebSocket, context: ServerContext, query: ConnectQuery) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = unbounded_channel();

    let session = Arc::new(Session {
        id: Id::new(),
        client_id: query.client_id.clone(),
        username: query.username.clone(),
        room_id: query.room_id.clone(),
        outbox: tx.clone(),
    });

    context.sessions.register(session.clone());

    let room = context.core.rooms.get_or_create(&query.room_id);
    room.add_client(&query.client_id, &query.username, tx);

    // Single writer per socket: everything outbound goes through the outbox.
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                OutboundFrame::Message(message) => {
                    let encoded = encode_message(&message);

                    if sink.send(Message::Text(encoded)).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;

                    break;
                }
            }
        }
    });

    let recv_context = context.clone();
    let recv_session = session.clone();

    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            // The receive timestamp is stamped before any parsing work, so
            // time-sync samples stay unbiased under load.
            let t1 = recv_context.core.context().clock.now_precise_ms();

            match message {
                Ok(Message::Text(text)) => {
                    dispatch::handle_frame(&recv_context, &recv_session, &text, t1).await
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    // Whichever half finishes first tears down the other.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    };

    if let Ok(room) = context.core.rooms.room_by_id(&query.room_id) {
        room.remove_client(&query.client_id);
    }

    context.sessions.unregister(session.id);

    info!(
        "Session {} for client {} closed",
        session.id, session.client_id
    );
}
