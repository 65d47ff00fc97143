use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use beatsync_core::{RoomError, StorageError};
use log::error;
use thiserror::Error;

pub type ServerResult<T> = Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{resource}:{identifier} not found")]
    NotFound {
        resource: &'static str,
        identifier: String,
    },
    #[error("Storage is unavailable: {0}")]
    StorageUnavailable(String),
    #[error("Unknown internal error: {0}")]
    Unknown(String),
}

impl ServerError {
    fn as_status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::StorageUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.as_status_code();

        // Log server errors when they happen
        if status.as_u16() >= 500 {
            error!("Request failed: {}", self);
            return (status, "Internal Server Error".to_string()).into_response();
        }

        (status, self.to_string()).into_response()
    }
}

impl From<RoomError> for ServerError {
    fn from(value: RoomError) -> Self {
        match value {
            RoomError::RoomNotFound(identifier) => Self::NotFound {
                resource: "room",
                identifier,
            },
        }
    }
}

impl From<StorageError> for ServerError {
    fn from(value: StorageError) -> Self {
        Self::StorageUnavailable(value.to_string())
    }
}
