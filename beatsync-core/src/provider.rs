use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Provider returned status {0}")]
    Status(u16),
    #[error("Track {0} is not available")]
    Unavailable(String),
}

/// The third-party music catalog, reached over HTTP. Search results are
/// passed through to clients untouched; streaming resolves a track id into
/// a url the room can queue.
#[async_trait]
pub trait MusicProvider: Send + Sync {
    async fn search(&self, query: &str) -> Result<serde_json::Value, ProviderError>;

    async fn stream_url(&self, track_id: &str) -> Result<String, ProviderError>;
}

pub struct HttpMusicProvider {
    base_url: String,
    http: reqwest::Client,
}

impl HttpMusicProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl MusicProvider for HttpMusicProvider {
    async fn search(&self, query: &str) -> Result<serde_json::Value, ProviderError> {
        let response = self
            .http
            .get(format!("{}/search", self.base_url))
            .query(&[("q", query)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status().as_u16()));
        }

        Ok(response.json().await?)
    }

    async fn stream_url(&self, track_id: &str) -> Result<String, ProviderError> {
        #[derive(Deserialize)]
        struct StreamTarget {
            url: String,
        }

        let response = self
            .http
            .get(format!("{}/stream/{}", self.base_url, track_id))
            .send()
            .await?;

        if response.status().as_u16() == 404 {
            return Err(ProviderError::Unavailable(track_id.to_string()));
        }

        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status().as_u16()));
        }

        let target: StreamTarget = response.json().await?;

        Ok(target.url)
    }
}

/// A provider with no catalog, for rooms that only use uploads.
pub struct NullMusicProvider;

#[async_trait]
impl MusicProvider for NullMusicProvider {
    async fn search(&self, _query: &str) -> Result<serde_json::Value, ProviderError> {
        Ok(serde_json::json!([]))
    }

    async fn stream_url(&self, track_id: &str) -> Result<String, ProviderError> {
        Err(ProviderError::Unavailable(track_id.to_string()))
    }
}
