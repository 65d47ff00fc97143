use axum::{
    async_trait,
    extract::{FromRequest, Request},
    http::StatusCode,
    Json,
};

use beatsync_core::is_valid_room_id;
use serde::{de::DeserializeOwned, Deserialize};
use utoipa::ToSchema;
use validator::{Validate, ValidationError};

fn validate_room_id(value: &str) -> Result<(), ValidationError> {
    if is_valid_room_id(value) {
        Ok(())
    } else {
        Err(ValidationError::new("room_id"))
    }
}

#[derive(Debug, ToSchema, Validate, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PresignSchema {
    #[validate(custom = "validate_room_id")]
    pub room_id: String,
    #[validate(length(min = 1, max = 256))]
    pub file_name: String,
}

#[derive(Debug, ToSchema, Validate, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UploadCompleteSchema {
    #[validate(custom = "validate_room_id")]
    pub room_id: String,
    #[validate(length(min = 1, max = 2048))]
    pub url: String,
}

pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Validate,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let extracted_json: Json<T> = Json::from_request(req, state)
            .await
            .map_err(|_| (StatusCode::BAD_REQUEST, "JSON parse failed"))?;

        extracted_json
            .0
            .validate()
            .map_err(|_| (StatusCode::BAD_REQUEST, "Request body is invalid"))?;

        Ok(Self(extracted_json.0))
    }
}
