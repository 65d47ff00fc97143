use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::Location;

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("Lookup request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Lookup returned status {0}")]
    Status(u16),
}

/// Resolves a client IP into a coarse location for the presence view.
/// Lookups are best-effort; a failure just leaves the client unlocated.
#[async_trait]
pub trait GeoLocator: Send + Sync {
    async fn lookup(&self, ip: &str) -> Result<Location, GeoError>;
}

pub struct HttpGeoLocator {
    base_url: String,
    http: reqwest::Client,
}

impl HttpGeoLocator {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl GeoLocator for HttpGeoLocator {
    async fn lookup(&self, ip: &str) -> Result<Location, GeoError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct LookupResponse {
            city: String,
            region: String,
            country: String,
            country_code: String,
        }

        let response = self
            .http
            .get(format!("{}/{}", self.base_url, ip))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GeoError::Status(response.status().as_u16()));
        }

        let body: LookupResponse = response.json().await?;
        let flag_svg_url = format!(
            "https://flagcdn.com/{}.svg",
            body.country_code.to_lowercase()
        );

        Ok(Location {
            city: body.city,
            region: body.region,
            country: body.country,
            country_code: body.country_code,
            flag_svg_url,
        })
    }
}

/// A locator that never resolves anything, for deployments without a
/// geo service configured.
pub struct NullGeoLocator;

#[async_trait]
impl GeoLocator for NullGeoLocator {
    async fn lookup(&self, _ip: &str) -> Result<Location, GeoError> {
        Err(GeoError::Status(404))
    }
}
