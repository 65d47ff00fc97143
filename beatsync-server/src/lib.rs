use axum::{
    routing::{get, post},
    Router as AxumRouter,
};
use std::{
    net::{Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Instant,
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use beatsync_core::Beatsync;

mod context;
mod dispatch;
mod docs;
mod errors;
mod gateway;
mod routes;
mod schemas;
mod uploads;

pub use context::ServerContext;
pub use gateway::SessionManager;

/// The default port the server will listen on.
pub const DEFAULT_PORT: u16 = 8080;

type Router = AxumRouter<ServerContext>;

/// Starts the beatsync server. Runs until the listener fails or the process
/// shuts down.
pub async fn run_server(core: Arc<Beatsync>, port: u16) -> std::io::Result<()> {
    let context = ServerContext {
        core,
        sessions: SessionManager::new(),
        started_at: Instant::now(),
    };

    let addr: SocketAddr = (Ipv6Addr::UNSPECIFIED, port).into();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = Router::new()
        .route("/", get(routes::healthcheck))
        .route("/stats", get(routes::stats))
        .route("/discover", get(routes::discover))
        .route("/active-rooms", get(routes::active_rooms))
        .route("/default", get(routes::default_tracks))
        .route("/upload/get-presigned-url", post(uploads::get_presigned_url))
        .route("/upload/complete", post(uploads::upload_complete))
        .route("/ws", get(gateway::websocket_handler))
        .route("/api.json", get(docs::docs))
        .with_state(context)
        .layer(cors);

    let listener = TcpListener::bind(&addr).await?;

    axum::serve(listener, router.into_make_service()).await
}
