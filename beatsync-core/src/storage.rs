use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    /// The storage gateway could not be reached
    #[error("Storage request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The storage gateway rejected the request
    #[error("Storage returned status {0}")]
    Status(u16),
}

/// A minted upload slot: the client PUTs the blob to `upload_url` and the
/// room queues `public_url` afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUpload {
    pub upload_url: String,
    pub public_url: String,
}

/// Represents the object store audio blobs live in. The coordinator only
/// ever sees opaque urls and delete capabilities.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Mints an upload slot under the room's prefix.
    async fn presign_upload(&self, room_id: &str, file_name: &str) -> Result<PresignedUpload>;

    /// Deletes a single blob by its public url. Idempotent.
    async fn delete(&self, url: &str) -> Result<()>;

    /// Deletes every blob under a prefix, returning how many were removed. Idempotent.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;
}

/// Talks to a storage gateway over HTTP. The gateway owns credentials and
/// bucket layout; this adapter only forwards intents.
pub struct HttpBlobStore {
    base_url: String,
    http: reqwest::Client,
}

impl HttpBlobStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn presign_upload(&self, room_id: &str, file_name: &str) -> Result<PresignedUpload> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct PresignBody<'a> {
            room_id: &'a str,
            file_name: &'a str,
        }

        let response = self
            .http
            .post(format!("{}/presign", self.base_url))
            .json(&PresignBody { room_id, file_name })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StorageError::Status(response.status().as_u16()));
        }

        Ok(response.json().await?)
    }

    async fn delete(&self, url: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/objects", self.base_url))
            .query(&[("url", url)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StorageError::Status(response.status().as_u16()));
        }

        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        #[derive(Deserialize)]
        struct Deleted {
            deleted: usize,
        }

        let response = self
            .http
            .delete(format!("{}/objects", self.base_url))
            .query(&[("prefix", prefix)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StorageError::Status(response.status().as_u16()));
        }

        let body: Deleted = response.json().await?;

        Ok(body.deleted)
    }
}

/// Keeps blobs as plain url strings. Lets the coordinator run without an
/// object store, and serves as the test double.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashSet<String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.objects.lock().contains(url)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn presign_upload(&self, room_id: &str, file_name: &str) -> Result<PresignedUpload> {
        let public_url = format!("memory://blobs/room-{room_id}/{file_name}");

        self.objects.lock().insert(public_url.clone());

        Ok(PresignedUpload {
            upload_url: format!("{public_url}?upload"),
            public_url,
        })
    }

    async fn delete(&self, url: &str) -> Result<()> {
        self.objects.lock().remove(url);

        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut objects = self.objects.lock();
        let before = objects.len();

        objects.retain(|url| !url.contains(prefix));

        Ok(before - objects.len())
    }
}
