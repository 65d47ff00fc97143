use std::{convert::Infallible, sync::Arc, time::Instant};

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use beatsync_core::Beatsync;

use crate::gateway::SessionManager;

#[derive(Clone)]
pub struct ServerContext {
    pub core: Arc<Beatsync>,
    pub sessions: Arc<SessionManager>,
    pub started_at: Instant,
}

#[async_trait]
impl FromRequestParts<ServerContext> for ServerContext {
    type Rejection = Infallible;

    async fn from_request_parts(
        _parts: &mut Parts,
        state: &ServerContext,
    ) -> Result<Self, Self::Rejection> {
        let context = ServerContext::from_ref(state);

        Ok(context)
    }
}
