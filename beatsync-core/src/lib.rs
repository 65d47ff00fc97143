mod clock;
mod config;
mod geo;
mod protocol;
mod provider;
mod rooms;
mod storage;
mod util;

pub mod backup;
pub mod spatial;

use std::sync::Arc;

use dashmap::DashMap;

pub use clock::*;
pub use config::*;
pub use geo::*;
pub use protocol::*;
pub use provider::*;
pub use rooms::*;
pub use storage::*;
pub use util::*;

use backup::Snapshot;

// Reduces verbosity
pub type Store<Id, T> = Arc<DashMap<Id, T>>;
pub type ArcedStore<Id, T> = Store<Id, Arc<T>>;

/// A type passed to various components of the coordinator, to access shared
/// state and the external collaborators.
#[derive(Clone)]
pub struct CoreContext {
    pub config: Config,
    pub clock: Clock,

    pub rooms: ArcedStore<RoomId, Room>,

    pub storage: Arc<dyn BlobStore>,
    pub provider: Arc<dyn MusicProvider>,
    pub geo: Arc<dyn GeoLocator>,
}

/// The playback coordinator, facilitating room management, time sync, and
/// scheduled playback across devices.
pub struct Beatsync {
    context: CoreContext,

    pub rooms: RoomRegistry,
}

impl Beatsync {
    pub fn new(
        config: Config,
        storage: Arc<dyn BlobStore>,
        provider: Arc<dyn MusicProvider>,
        geo: Arc<dyn GeoLocator>,
    ) -> Self {
        let context = CoreContext {
            config,
            clock: Clock::new(),
            rooms: Default::default(),
            storage,
            provider,
            geo,
        };

        let rooms = RoomRegistry::new(&context);

        Self { context, rooms }
    }

    pub fn context(&self) -> &CoreContext {
        &self.context
    }

    /// A full snapshot of coordinator state, for the snapshot store.
    pub fn create_snapshot(&self) -> Snapshot {
        Snapshot {
            timestamp: self.context.clock.now_ms(),
            data: self.rooms.create_snapshot(),
        }
    }

    /// Rebuilds registry state from a snapshot, without any live sessions.
    pub fn restore_snapshot(&self, snapshot: Snapshot) {
        self.rooms.restore_snapshot(snapshot.data);
    }
}
