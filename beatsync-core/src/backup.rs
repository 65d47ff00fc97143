use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{AudioSource, ChatMessage, ClientData, PlaybackState, Timestamp};

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Snapshot is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// A full, self-contained copy of coordinator state at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: Timestamp,
    pub data: SnapshotData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SnapshotData {
    pub rooms: HashMap<String, RoomSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub client_datas: Vec<ClientData>,
    pub audio_sources: Vec<AudioSource>,
    pub global_volume: f64,
    pub playback_state: PlaybackState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat: Option<ChatSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSnapshot {
    pub messages: Vec<ChatMessage>,
    pub next_message_id: u64,
}

/// Where snapshots are persisted. The medium is opaque to the coordinator;
/// it only ever loads the most recent one and saves new ones.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load_latest(&self) -> Result<Option<Snapshot>>;

    async fn save(&self, snapshot: &Snapshot) -> Result<()>;
}

/// Persists snapshots as a single JSON file, written atomically via a
/// temporary file and rename.
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load_latest(&self) -> Result<Option<Snapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let bytes = serde_json::to_vec(snapshot)?;
        let staging = self.path.with_extension("tmp");

        tokio::fs::write(&staging, bytes).await?;
        tokio::fs::rename(&staging, &self.path).await?;

        Ok(())
    }
}

/// Holds the latest snapshot in memory. The test double, and the fallback
/// when no snapshot path is configured.
#[derive(Default)]
pub struct MemorySnapshotStore {
    slot: Mutex<Option<Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load_latest(&self) -> Result<Option<Snapshot>> {
        Ok(self.slot.lock().clone())
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        *self.slot.lock() = Some(snapshot.clone());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PlaybackKind;

    fn sample_snapshot() -> Snapshot {
        let room = RoomSnapshot {
            client_datas: vec![],
            audio_sources: vec![AudioSource {
                url: "https://cdn/room-123456/a.mp3".to_string(),
            }],
            global_volume: 0.8,
            playback_state: PlaybackState {
                kind: PlaybackKind::Playing,
                audio_source: "https://cdn/room-123456/a.mp3".to_string(),
                server_time_to_execute: 1000,
                track_position_seconds: 12.5,
            },
            chat: Some(ChatSnapshot {
                messages: vec![],
                next_message_id: 7,
            }),
        };

        Snapshot {
            timestamp: 1234,
            data: SnapshotData {
                rooms: HashMap::from([("123456".to_string(), room)]),
            },
        }
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemorySnapshotStore::new();

        assert!(store.load_latest().await.unwrap().is_none());

        let snapshot = sample_snapshot();
        store.save(&snapshot).await.unwrap();

        let restored = store.load_latest().await.unwrap().unwrap();
        assert_eq!(restored, snapshot);
    }

    #[test]
    fn test_snapshot_wire_shape() {
        let snapshot = sample_snapshot();
        let encoded = serde_json::to_string(&snapshot).unwrap();

        assert!(encoded.contains(r#""clientDatas""#));
        assert!(encoded.contains(r#""audioSources""#));
        assert!(encoded.contains(r#""globalVolume""#));
        assert!(encoded.contains(r#""playbackState""#));
        assert!(encoded.contains(r#""nextMessageId""#));
    }
}
