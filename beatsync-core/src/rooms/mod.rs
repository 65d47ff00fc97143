mod chat;
mod client;
mod room;

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

pub use chat::*;
pub use client::*;
pub use room::*;

use crate::backup::SnapshotData;
use crate::{CoreContext, ServerMessage};

pub type RoomId = String;

/// A frame on its way to one session's socket.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Message(ServerMessage),
    Close { code: u16, reason: &'static str },
}

/// The sending half of a session's outbound queue. Unbounded, so a room can
/// fan out without ever blocking on a slow socket.
pub type Outbox = UnboundedSender<OutboundFrame>;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("Room {0} does not exist")]
    RoomNotFound(String),
}

/// The discovery view of one active room.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub client_count: usize,
    pub playing: bool,
}

/// The process-wide map of rooms. Rooms own their timers; the registry owns
/// nothing but the map itself.
pub struct RoomRegistry {
    context: CoreContext,
}

impl RoomRegistry {
    pub fn new(context: &CoreContext) -> Self {
        Self {
            context: context.clone(),
        }
    }

    /// Resolves a room, creating it on first join.
    pub fn get_or_create(&self, id: &str) -> Arc<Room> {
        self.context
            .rooms
            .entry(id.to_string())
            .or_insert_with(|| Room::new(&self.context, id))
            .clone()
    }

    pub fn room_by_id(&self, id: &str) -> Result<Arc<Room>, RoomError> {
        self.context
            .rooms
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| RoomError::RoomNotFound(id.to_string()))
    }

    /// Tears a room down immediately, skipping the grace period.
    pub async fn delete_room(&self, id: &str) -> Result<(), RoomError> {
        let room = self.room_by_id(id)?;

        room.cleanup().await;

        Ok(())
    }

    pub fn list_all(&self) -> Vec<Arc<Room>> {
        self.context.rooms.iter().map(|r| r.clone()).collect()
    }

    /// Rooms with at least one connected client, serialized for discovery.
    pub fn active_rooms(&self) -> Vec<RoomSummary> {
        self.context
            .rooms
            .iter()
            .filter(|r| r.connected_count() > 0)
            .map(|r| RoomSummary {
                room_id: r.id().to_string(),
                client_count: r.connected_count(),
                playing: r.is_playing(),
            })
            .collect()
    }

    pub fn connected_client_count(&self) -> usize {
        self.context.rooms.iter().map(|r| r.connected_count()).sum()
    }

    /// Serializes every room for the snapshot store.
    pub fn create_snapshot(&self) -> SnapshotData {
        SnapshotData {
            rooms: self
                .context
                .rooms
                .iter()
                .map(|r| (r.id().to_string(), r.create_backup()))
                .collect(),
        }
    }

    /// Rebuilds rooms from a snapshot. Rooms that already exist in memory
    /// win over their snapshot copy.
    pub fn restore_snapshot(&self, data: SnapshotData) {
        for (id, room_snapshot) in data.rooms {
            if self.context.rooms.contains_key(&id) {
                continue;
            }

            let room = Room::restore(&self.context, &id, room_snapshot);

            self.context.rooms.insert(id, room);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let context = testing::context();
        let registry = RoomRegistry::new(&context);

        let first = registry.get_or_create("123456");
        let second = registry.get_or_create("123456");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.list_all().len(), 1);

        assert!(registry.room_by_id("123456").is_ok());
        assert!(registry.room_by_id("654321").is_err());
    }

    #[tokio::test]
    async fn test_active_rooms_require_a_connection() {
        let context = testing::context();
        let registry = RoomRegistry::new(&context);

        let room = registry.get_or_create("123456");
        registry.get_or_create("654321");

        assert!(registry.active_rooms().is_empty());

        let (tx, _rx) = unbounded_channel();
        room.add_client("A", "alice", tx);

        let active = registry.active_rooms();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].room_id, "123456");
        assert_eq!(active[0].client_count, 1);
        assert_eq!(registry.connected_client_count(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_skips_live_rooms() {
        let context = testing::context();
        let registry = RoomRegistry::new(&context);

        let room = registry.get_or_create("123456");
        room.set_global_volume(0.5);

        let snapshot = registry.create_snapshot();

        // The live room wins over its snapshot copy.
        room.set_global_volume(0.9);
        registry.restore_snapshot(snapshot.clone());
        assert_eq!(registry.get_or_create("123456").global_volume(), 0.9);

        // In a fresh registry the snapshot is authoritative.
        let fresh = testing::context();
        let fresh_registry = RoomRegistry::new(&fresh);

        fresh_registry.restore_snapshot(snapshot);
        assert_eq!(fresh_registry.get_or_create("123456").global_volume(), 0.5);
    }

    #[tokio::test]
    async fn test_delete_room_removes_it() {
        let context = testing::context();
        let registry = RoomRegistry::new(&context);

        registry.get_or_create("123456");
        registry.delete_room("123456").await.unwrap();

        assert!(registry.room_by_id("123456").is_err());
        assert!(registry.delete_room("123456").await.is_err());
    }
}
