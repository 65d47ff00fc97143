use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;

use crate::backup::RoomSnapshot;
use crate::{
    spatial, AudioSource, ClientData, CoreContext, GainParams, Location, Permissions,
    PlaybackKind, PlaybackState, Position, RoomEvent, ScheduledAction, ServerMessage, Timestamp,
};

use super::{ChatLog, ClientRecord, Outbox, OutboundFrame, RoomId};

/// A play request waiting for every connected client to confirm decoding.
struct LoadBarrier {
    audio_source: String,
    track_time_seconds: f64,
    loaded: HashSet<String>,
    deadline: JoinHandle<()>,
}

/// A client that currently has a live session in this room.
struct ConnectedClient {
    record: ClientRecord,
    outbox: Outbox,
}

/// A listening session: the clients in it, what they are playing, and the
/// timers that keep them in lockstep.
///
/// Every handler-visible method takes `&self` and serializes on the field
/// mutexes; none of them holds a lock across an await or a send.
pub struct Room {
    id: RoomId,
    context: CoreContext,
    me: Weak<Room>,

    /// Clients with a live session, in circle order.
    connected: Mutex<Vec<ConnectedClient>>,
    /// Records of clients that dropped, kept for reconnection.
    cache: Mutex<HashMap<String, ClientRecord>>,

    queue: Mutex<Vec<AudioSource>>,
    playback: Mutex<PlaybackState>,
    listening_source: Mutex<Position>,
    permissions: Mutex<Permissions>,
    global_volume: Mutex<f64>,
    chat: Mutex<ChatLog>,

    barrier: Mutex<Option<LoadBarrier>>,
    spatial_loop: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    cleanup_timer: Mutex<Option<JoinHandle<()>>>,

    active_jobs: AtomicUsize,
}

impl Room {
    pub fn new(context: &CoreContext, id: &str) -> Arc<Self> {
        let config = &context.config;

        Arc::new_cyclic(|me| Self {
            id: id.to_string(),
            context: context.clone(),
            me: me.clone(),
            connected: Default::default(),
            cache: Default::default(),
            queue: Default::default(),
            playback: Default::default(),
            listening_source: Mutex::new(Position {
                x: config.origin_x,
                y: config.origin_y,
            }),
            permissions: Mutex::new(Permissions::Everyone),
            global_volume: Mutex::new(1.),
            chat: Mutex::new(ChatLog::new(config.chat_history_limit)),
            barrier: Default::default(),
            spatial_loop: Default::default(),
            heartbeat: Default::default(),
            cleanup_timer: Default::default(),
            active_jobs: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connected_count(&self) -> usize {
        self.connected.lock().len()
    }

    pub fn active_job_count(&self) -> usize {
        self.active_jobs.load(Ordering::SeqCst)
    }

    pub fn is_playing(&self) -> bool {
        self.playback.lock().kind == PlaybackKind::Playing
    }

    /// The presence view: connected clients only.
    pub fn client_datas(&self) -> Vec<ClientData> {
        self.connected
            .lock()
            .iter()
            .map(|c| c.record.to_data())
            .collect()
    }

    pub fn audio_sources(&self) -> Vec<AudioSource> {
        self.queue.lock().clone()
    }

    pub fn permissions(&self) -> Permissions {
        *self.permissions.lock()
    }

    // ---- membership ----------------------------------------------------

    /// Enrolls a session. A record cached from a previous session under the
    /// same client id is restored, so admin status and join time survive
    /// reconnects.
    pub fn add_client(&self, client_id: &str, username: &str, outbox: Outbox) {
        self.cancel_cleanup();

        let now = self.context.clock.now_ms();

        {
            let mut connected = self.connected.lock();

            // A reconnect can race the old session's close; the newest wins.
            connected.retain(|c| c.record.client_id != client_id);

            let mut record = self
                .cache
                .lock()
                .remove(client_id)
                .unwrap_or_else(|| ClientRecord::new(client_id, username, now, &self.context.config));

            if connected.is_empty() && !record.is_admin {
                record.is_admin = true;
            }

            record.last_heartbeat_at = now;
            connected.push(ConnectedClient {
                record,
                outbox: outbox.clone(),
            });

            self.reposition(&mut connected);
        }

        self.start_heartbeat();

        info!("Client {client_id} ({username}) joined room {}", self.id);

        self.broadcast_client_change();

        // Bring the joiner up to date with everything broadcasts won't repeat.
        self.unicast(
            client_id,
            ServerMessage::RoomEvent {
                event: RoomEvent::SetAudioSources {
                    sources: self.audio_sources(),
                    current_audio_source: None,
                },
            },
        );
        self.unicast(
            client_id,
            ServerMessage::RoomEvent {
                event: RoomEvent::SetPlaybackControls {
                    permissions: self.permissions(),
                },
            },
        );

        let chat = self.chat.lock();
        let full_sync = RoomEvent::ChatUpdate {
            messages: chat.messages(),
            is_full_sync: true,
            newest_id: chat.newest_id(),
        };
        drop(chat);

        self.unicast(client_id, ServerMessage::RoomEvent { event: full_sync });
    }

    /// Removes a session, keeping the record for reconnection. Promotes a
    /// new admin when the last connected one leaves, and re-evaluates any
    /// pending load barrier without the leaver.
    pub fn remove_client(&self, client_id: &str) {
        let remaining = {
            let mut connected = self.connected.lock();

            let Some(index) = connected
                .iter()
                .position(|c| c.record.client_id == client_id)
            else {
                return;
            };

            let removed = connected.remove(index);
            self.cache
                .lock()
                .insert(removed.record.client_id.clone(), removed.record);

            if !connected.is_empty() && !connected.iter().any(|c| c.record.is_admin) {
                let chosen = rand::thread_rng().gen_range(0..connected.len());
                connected[chosen].record.is_admin = true;

                info!(
                    "Promoted {} to admin of room {}",
                    connected[chosen].record.client_id, self.id
                );
            }

            self.reposition(&mut connected);

            connected.len()
        };

        info!("Client {client_id} left room {}", self.id);

        // The barrier must not wait on a client that can no longer confirm.
        if remaining == 0 {
            if let Some(barrier) = self.barrier.lock().take() {
                barrier.deadline.abort();
            }
        } else {
            let mut completed = false;

            if let Some(barrier) = self.barrier.lock().as_mut() {
                barrier.loaded.remove(client_id);
                completed = self.barrier_satisfied(&barrier.loaded);
            }

            if completed {
                self.commit_play();
            }
        }

        self.broadcast_client_change();

        if remaining == 0 {
            if let Some(handle) = self.heartbeat.lock().take() {
                handle.abort();
            }

            self.schedule_cleanup();
        }
    }

    /// Whether the client may mutate room state.
    pub fn can_mutate(&self, client_id: &str) -> bool {
        *self.permissions.lock() == Permissions::Everyone || self.is_admin(client_id)
    }

    pub fn is_admin(&self, client_id: &str) -> bool {
        self.connected
            .lock()
            .iter()
            .any(|c| c.record.client_id == client_id && c.record.is_admin)
    }

    fn reposition(&self, connected: &mut [ConnectedClient]) {
        let positions = spatial::circle_positions(connected.len(), &self.context.config);

        for (client, position) in connected.iter_mut().zip(positions) {
            client.record.position = position;
        }
    }

    // ---- time sync & heartbeats ----------------------------------------

    /// Called for every time-sync probe: refreshes liveness and folds the
    /// reported round-trip into the smoothed estimate.
    pub fn observe_ntp(&self, client_id: &str, rtt: Option<f64>) {
        let now = self.context.clock.now_ms();
        let smoothing = self.context.config.rtt_smoothing;

        let mut connected = self.connected.lock();

        if let Some(client) = connected
            .iter_mut()
            .find(|c| c.record.client_id == client_id)
        {
            client.record.touch(now);

            if let Some(sample) = rtt.filter(|r| *r > 0.) {
                client.record.observe_rtt(sample, smoothing);
            }
        }
    }

    fn start_heartbeat(&self) {
        let mut heartbeat = self.heartbeat.lock();

        if heartbeat.is_some() {
            return;
        }

        let weak = self.me.clone();
        let interval_ms = self.context.config.heartbeat_interval_ms;

        *heartbeat = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));

            loop {
                interval.tick().await;

                let Some(room) = weak.upgrade() else { break };
                room.sweep_heartbeats();
            }
        }));
    }

    fn sweep_heartbeats(&self) {
        let now = self.context.clock.now_ms();
        let timeout = self.context.config.response_timeout_ms;

        let expired: Vec<(String, Outbox)> = self
            .connected
            .lock()
            .iter()
            .filter(|c| now.saturating_sub(c.record.last_heartbeat_at) > timeout)
            .map(|c| (c.record.client_id.clone(), c.outbox.clone()))
            .collect();

        for (client_id, outbox) in expired {
            warn!(
                "Client {client_id} in room {} missed heartbeats, disconnecting",
                self.id
            );

            let _ = outbox.send(OutboundFrame::Close {
                code: 1000,
                reason: "Connection timeout",
            });

            self.remove_client(&client_id);
        }
    }

    // ---- scheduling ----------------------------------------------------

    fn max_rtt(&self) -> f64 {
        self.connected
            .lock()
            .iter()
            .map(|c| c.record.rtt)
            .fold(0., f64::max)
    }

    /// A server timestamp far enough out that every connected client will
    /// have received the broadcast and can act on it simultaneously.
    pub fn scheduled_execution_time(&self, extra_ms: u64) -> Timestamp {
        let delay = self.context.config.schedule_delay_ms(self.max_rtt());

        self.context.clock.now_ms() + delay + extra_ms
    }

    // ---- playback ------------------------------------------------------

    /// Starts a play: tells every client to decode the track, then waits on
    /// a load barrier before broadcasting the scheduled start.
    pub fn handle_play(&self, initiator: &str, audio_source: &str, track_time_seconds: f64) {
        if !self.queue_contains(audio_source) {
            warn!(
                "Ignoring play for {audio_source}: not in the queue of room {}",
                self.id
            );
            return;
        }

        self.broadcast(ServerMessage::RoomEvent {
            event: RoomEvent::LoadAudioSource {
                audio_source_to_play: audio_source.to_string(),
            },
        });

        let weak = self.me.clone();
        let timeout = self.context.config.load_barrier_timeout_ms;

        let deadline = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout)).await;

            if let Some(room) = weak.upgrade() {
                info!("Load barrier deadline fired in room {}", room.id);
                room.commit_play();
            }
        });

        {
            let mut barrier = self.barrier.lock();

            if let Some(previous) = barrier.take() {
                previous.deadline.abort();
            }

            *barrier = Some(LoadBarrier {
                audio_source: audio_source.to_string(),
                track_time_seconds,
                loaded: HashSet::from([initiator.to_string()]),
                deadline,
            });
        }

        self.try_commit_if_loaded();
    }

    /// Records a client's confirmation that the pending track is decoded.
    pub fn confirm_loaded(&self, client_id: &str, url: &str) {
        {
            let mut barrier = self.barrier.lock();

            let Some(barrier) = barrier.as_mut() else { return };

            // A confirm for some other track is stale; ignore it.
            if barrier.audio_source != url {
                return;
            }

            debug!("Client {client_id} confirmed {url} in room {}", self.id);
            barrier.loaded.insert(client_id.to_string());
        }

        self.try_commit_if_loaded();
    }

    fn barrier_satisfied(&self, loaded: &HashSet<String>) -> bool {
        self.connected
            .lock()
            .iter()
            .all(|c| loaded.contains(&c.record.client_id))
    }

    fn try_commit_if_loaded(&self) {
        let completed = self
            .barrier
            .lock()
            .as_ref()
            .map(|b| self.barrier_satisfied(&b.loaded))
            .unwrap_or(false);

        if completed {
            self.commit_play();
        }
    }

    /// Resolves the pending barrier into a scheduled PLAY broadcast. Called
    /// when every client has confirmed, or when the deadline fires with
    /// whatever set is present.
    fn commit_play(&self) {
        let Some(barrier) = self.barrier.lock().take() else { return };
        barrier.deadline.abort();

        if !self.queue_contains(&barrier.audio_source) {
            warn!(
                "Aborting play: {} left the queue of room {} before commit",
                barrier.audio_source, self.id
            );
            return;
        }

        let server_time_to_execute = self.scheduled_execution_time(0);

        *self.playback.lock() = PlaybackState {
            kind: PlaybackKind::Playing,
            audio_source: barrier.audio_source.clone(),
            server_time_to_execute,
            track_position_seconds: barrier.track_time_seconds,
        };

        info!(
            "Room {} plays {} at {server_time_to_execute}",
            self.id, barrier.audio_source
        );

        self.broadcast(ServerMessage::ScheduledAction {
            server_time_to_execute,
            scheduled_action: ScheduledAction::Play {
                audio_source: barrier.audio_source,
                track_time_seconds: barrier.track_time_seconds,
            },
        });
    }

    /// Schedules a pause. An empty url is accepted, since the current track
    /// may have been deleted out from under the pause.
    pub fn handle_pause(&self, audio_source: &str, track_time_seconds: f64) {
        if let Some(barrier) = self.barrier.lock().take() {
            barrier.deadline.abort();
        }

        let server_time_to_execute = self.scheduled_execution_time(0);

        *self.playback.lock() = PlaybackState {
            kind: PlaybackKind::Paused,
            audio_source: audio_source.to_string(),
            server_time_to_execute,
            track_position_seconds: track_time_seconds,
        };

        self.broadcast(ServerMessage::ScheduledAction {
            server_time_to_execute,
            scheduled_action: ScheduledAction::Pause,
        });
    }

    /// Catches a late joiner up with an ongoing play. The extra headroom
    /// gives the client time to fetch and decode before the deadline.
    pub fn handle_sync(&self, client_id: &str) {
        let message = {
            let playback = self.playback.lock();

            if playback.kind == PlaybackKind::Paused {
                return;
            }

            let server_time_to_execute =
                self.scheduled_execution_time(self.context.config.sync_extra_ms);

            // If the scheduled start is still ahead of the sync deadline,
            // the joiner simply starts with everyone else.
            let (server_time_to_execute, track_time_seconds) =
                if server_time_to_execute <= playback.server_time_to_execute {
                    (
                        playback.server_time_to_execute,
                        playback.track_position_seconds,
                    )
                } else {
                    let elapsed_ms =
                        server_time_to_execute - playback.server_time_to_execute;

                    (
                        server_time_to_execute,
                        playback.track_position_seconds + elapsed_ms as f64 / 1000.,
                    )
                };

            ServerMessage::ScheduledAction {
                server_time_to_execute,
                scheduled_action: ScheduledAction::Play {
                    audio_source: playback.audio_source.clone(),
                    track_time_seconds,
                },
            }
        };

        self.unicast(client_id, message);
    }

    // ---- queue ---------------------------------------------------------

    fn queue_contains(&self, url: &str) -> bool {
        self.queue.lock().iter().any(|s| s.url == url)
    }

    /// Replaces the queue wholesale, deduplicating while preserving order.
    pub fn set_audio_sources(&self, urls: Vec<String>, current: Option<String>) {
        let mut seen = HashSet::new();
        let sources: Vec<AudioSource> = urls
            .into_iter()
            .filter(|url| seen.insert(url.clone()))
            .map(|url| AudioSource { url })
            .collect();

        *self.queue.lock() = sources.clone();

        self.reset_playback_if_track_gone();

        self.broadcast(ServerMessage::RoomEvent {
            event: RoomEvent::SetAudioSources {
                sources,
                current_audio_source: current,
            },
        });
    }

    /// Appends a single url if it is not queued yet.
    pub fn add_audio_source(&self, url: &str) {
        let sources = {
            let mut queue = self.queue.lock();

            if queue.iter().any(|s| s.url == url) {
                return;
            }

            queue.push(AudioSource {
                url: url.to_string(),
            });

            queue.clone()
        };

        self.broadcast(ServerMessage::RoomEvent {
            event: RoomEvent::SetAudioSources {
                sources,
                current_audio_source: None,
            },
        });
    }

    /// Appends the default tracks that are not queued yet, with a single
    /// broadcast for the batch.
    pub fn load_default_tracks(&self, urls: &[String]) {
        let sources = {
            let mut queue = self.queue.lock();
            let before = queue.len();

            for url in urls {
                if !queue.iter().any(|s| &s.url == url) {
                    queue.push(AudioSource { url: url.clone() });
                }
            }

            if queue.len() == before {
                return;
            }

            queue.clone()
        };

        self.broadcast(ServerMessage::RoomEvent {
            event: RoomEvent::SetAudioSources {
                sources,
                current_audio_source: None,
            },
        });
    }

    /// Removes the given urls from the queue. Removing the current track
    /// resets playback to its initial state. Broadcasts only when the queue
    /// actually changed.
    pub fn remove_audio_sources(&self, urls: &[String]) {
        let sources = {
            let mut queue = self.queue.lock();
            let before = queue.len();

            queue.retain(|s| !urls.contains(&s.url));

            if queue.len() == before {
                return;
            }

            queue.clone()
        };

        self.reset_playback_if_track_gone();

        self.broadcast(ServerMessage::RoomEvent {
            event: RoomEvent::SetAudioSources {
                sources,
                current_audio_source: None,
            },
        });
    }

    /// Deletes blobs for room-owned urls, then removes from the queue the
    /// urls whose delete succeeded or that were never blob-owned. A failed
    /// delete keeps the url queued so the client view stays truthful.
    pub async fn delete_audio_sources(&self, urls: Vec<String>) {
        let mut removable = Vec::new();

        for url in urls {
            if self.owns_blob(&url) {
                match self.context.storage.delete(&url).await {
                    Ok(()) => removable.push(url),
                    Err(e) => {
                        warn!("Keeping {url} in room {}: blob delete failed: {e}", self.id)
                    }
                }
            } else {
                removable.push(url);
            }
        }

        if !removable.is_empty() {
            self.remove_audio_sources(&removable);
        }
    }

    fn owns_blob(&self, url: &str) -> bool {
        url.contains(&format!("/room-{}/", self.id))
    }

    fn reset_playback_if_track_gone(&self) {
        let mut cancel_barrier = false;

        {
            let mut playback = self.playback.lock();

            if !playback.audio_source.is_empty() && !self.queue_contains(&playback.audio_source) {
                *playback = PlaybackState::default();
                cancel_barrier = true;
            }
        }

        let mut stale = false;

        if let Some(barrier) = self.barrier.lock().as_ref() {
            stale = !self.queue_contains(&barrier.audio_source);
        }

        if cancel_barrier || stale {
            if let Some(barrier) = self.barrier.lock().take() {
                barrier.deadline.abort();
            }
        }
    }

    // ---- spatial audio -------------------------------------------------

    /// Starts the spatial gain loop. Idempotent.
    pub fn start_spatial_audio(&self) {
        let mut spatial_loop = self.spatial_loop.lock();

        if spatial_loop.is_some() {
            return;
        }

        info!("Starting spatial audio in room {}", self.id);

        let weak = self.me.clone();
        let tick_ms = self.context.config.spatial_tick_ms;

        *spatial_loop = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(tick_ms));
            let mut tick: u64 = 0;

            loop {
                interval.tick().await;

                let Some(room) = weak.upgrade() else { break };

                debug!("Spatial tick {tick} in room {}", room.id);

                *room.listening_source.lock() =
                    spatial::orbit_position(tick, &room.context.config);
                room.emit_spatial_config();

                tick += 1;
            }
        }));
    }

    /// Stops the loop and tells clients to fall back to global volume.
    pub fn stop_spatial_audio(&self) {
        if let Some(handle) = self.spatial_loop.lock().take() {
            handle.abort();
            info!("Stopped spatial audio in room {}", self.id);
        }

        self.broadcast(ServerMessage::ScheduledAction {
            server_time_to_execute: self.scheduled_execution_time(0),
            scheduled_action: ScheduledAction::StopSpatialAudio,
        });
    }

    /// Publishes gains for the current scene. Also used as a one-shot after
    /// geometry changes while the loop is off, so static scenes respond.
    fn emit_spatial_config(&self) {
        let listening_source = *self.listening_source.lock();
        let ramp_time = self.context.config.spatial_ramp_time;

        let gains: HashMap<String, GainParams> = self
            .connected
            .lock()
            .iter()
            .map(|c| {
                let distance = spatial::distance(c.record.position, listening_source);

                (
                    c.record.client_id.clone(),
                    GainParams {
                        gain: spatial::gain_for_distance(distance, &self.context.config),
                        ramp_time,
                    },
                )
            })
            .collect();

        self.broadcast(ServerMessage::ScheduledAction {
            server_time_to_execute: self.scheduled_execution_time(0),
            scheduled_action: ScheduledAction::SpatialConfig {
                listening_source,
                gains,
                ramp_time,
            },
        });
    }

    /// Moves a client on the grid. Only ever called for the session's own
    /// client id.
    pub fn move_client(&self, client_id: &str, x: f64, y: f64) {
        let grid = self.context.config.grid_size;

        {
            let mut connected = self.connected.lock();

            let Some(client) = connected
                .iter_mut()
                .find(|c| c.record.client_id == client_id)
            else {
                return;
            };

            client.record.position = Position {
                x: x.clamp(0., grid),
                y: y.clamp(0., grid),
            };
        }

        self.broadcast_client_change();
        self.emit_spatial_config();
    }

    pub fn set_listening_source(&self, x: f64, y: f64) {
        *self.listening_source.lock() = Position { x, y };

        self.emit_spatial_config();
    }

    /// Rotates the named client to the front of the circle ordering and
    /// repositions everyone.
    pub fn reorder_client(&self, client_id: &str) {
        {
            let mut connected = self.connected.lock();

            let Some(index) = connected
                .iter()
                .position(|c| c.record.client_id == client_id)
            else {
                return;
            };

            connected.rotate_left(index);
            self.reposition(&mut connected);
        }

        self.broadcast_client_change();
        self.emit_spatial_config();
    }

    // ---- volume, permissions, admin ------------------------------------

    pub fn set_global_volume(&self, volume: f64) {
        let volume = volume.clamp(0., 1.);

        *self.global_volume.lock() = volume;

        self.broadcast(ServerMessage::ScheduledAction {
            server_time_to_execute: self.context.clock.now_ms(),
            scheduled_action: ScheduledAction::GlobalVolumeConfig {
                volume,
                ramp_time: self.context.config.volume_ramp_time,
            },
        });
    }

    pub fn global_volume(&self) -> f64 {
        *self.global_volume.lock()
    }

    /// Grants or revokes admin. Refuses to demote the last connected admin.
    pub fn set_admin(&self, client_id: &str, is_admin: bool) {
        {
            let mut connected = self.connected.lock();

            if !is_admin {
                let admins = connected.iter().filter(|c| c.record.is_admin).count();
                let target_is_admin = connected
                    .iter()
                    .any(|c| c.record.client_id == client_id && c.record.is_admin);

                if target_is_admin && admins == 1 {
                    warn!(
                        "Refusing to demote {client_id}: last admin of room {}",
                        self.id
                    );
                    return;
                }
            }

            if let Some(client) = connected
                .iter_mut()
                .find(|c| c.record.client_id == client_id)
            {
                client.record.is_admin = is_admin;
            } else if let Some(record) = self.cache.lock().get_mut(client_id) {
                record.is_admin = is_admin;
            } else {
                return;
            }
        }

        self.broadcast_client_change();
    }

    pub fn set_permissions(&self, permissions: Permissions) {
        *self.permissions.lock() = permissions;

        self.broadcast(ServerMessage::RoomEvent {
            event: RoomEvent::SetPlaybackControls { permissions },
        });
    }

    pub fn set_location(&self, client_id: &str, location: Location) {
        {
            let mut connected = self.connected.lock();

            if let Some(client) = connected
                .iter_mut()
                .find(|c| c.record.client_id == client_id)
            {
                client.record.location = Some(location);
            } else {
                return;
            }
        }

        self.broadcast_client_change();
    }

    // ---- chat ----------------------------------------------------------

    pub fn send_chat(&self, client_id: &str, text: &str) {
        let (username, country_code) = {
            let connected = self.connected.lock();

            let Some(client) = connected.iter().find(|c| c.record.client_id == client_id)
            else {
                return;
            };

            (
                client.record.username.clone(),
                client
                    .record
                    .location
                    .as_ref()
                    .map(|l| l.country_code.clone()),
            )
        };

        let now = self.context.clock.now_ms();

        let update = {
            let mut chat = self.chat.lock();

            let Some(message) = chat.push(client_id, &username, country_code, text, now) else {
                return;
            };

            RoomEvent::ChatUpdate {
                newest_id: message.id,
                messages: vec![message],
                is_full_sync: false,
            }
        };

        self.broadcast(ServerMessage::RoomEvent { event: update });
    }

    // ---- stream jobs ---------------------------------------------------

    /// Resolves a provider track into a queued url in the background, with
    /// job-count broadcasts on start and finish.
    pub fn stream_music(&self, track_id: &str) {
        let count = self.active_jobs.fetch_add(1, Ordering::SeqCst) + 1;

        self.broadcast(ServerMessage::StreamJobUpdate {
            active_job_count: count,
        });

        let weak = self.me.clone();
        let provider = self.context.provider.clone();
        let track_id = track_id.to_string();

        tokio::spawn(async move {
            let result = provider.stream_url(&track_id).await;

            let Some(room) = weak.upgrade() else { return };

            match result {
                Ok(url) => room.add_audio_source(&url),
                Err(e) => warn!("Stream job for {track_id} failed: {e}"),
            }

            let count = room.active_jobs.fetch_sub(1, Ordering::SeqCst) - 1;

            room.broadcast(ServerMessage::StreamJobUpdate {
                active_job_count: count,
            });
        });
    }

    // ---- lifecycle -----------------------------------------------------

    fn cancel_cleanup(&self) {
        if let Some(handle) = self.cleanup_timer.lock().take() {
            handle.abort();
        }
    }

    /// Arms the grace-period timer that reclaims an empty room. Any join
    /// before it fires cancels it.
    pub fn schedule_cleanup(&self) {
        let weak = self.me.clone();
        let grace = self.context.config.cleanup_grace_ms;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(grace)).await;

            let Some(room) = weak.upgrade() else { return };

            // Clear our own slot so cleanup does not cancel the running task.
            room.cleanup_timer.lock().take();
            room.cleanup().await;
        });

        if let Some(previous) = self.cleanup_timer.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Tears the room down: unregisters it, cancels every timer, and asks
    /// the blob store to drop everything under the room's prefix.
    pub async fn cleanup(&self) {
        info!("Cleaning up room {}", self.id);

        self.context.rooms.remove(&self.id);

        for slot in [&self.spatial_loop, &self.heartbeat, &self.cleanup_timer] {
            if let Some(handle) = slot.lock().take() {
                handle.abort();
            }
        }

        if let Some(barrier) = self.barrier.lock().take() {
            barrier.deadline.abort();
        }

        match self
            .context
            .storage
            .delete_prefix(&format!("room-{}", self.id))
            .await
        {
            Ok(deleted) if deleted > 0 => {
                info!("Deleted {deleted} blobs for room {}", self.id)
            }
            Ok(_) => {}
            Err(e) => warn!("Blob cleanup for room {} failed: {e}", self.id),
        }
    }

    // ---- backup --------------------------------------------------------

    /// A self-contained copy of the room for the snapshot store. Connected
    /// and cached records are both included, so a restart behaves like a
    /// mass reconnect.
    pub fn create_backup(&self) -> RoomSnapshot {
        let mut client_datas: Vec<ClientData> = self
            .connected
            .lock()
            .iter()
            .map(|c| c.record.to_data())
            .collect();

        {
            let cache = self.cache.lock();
            let connected_ids: HashSet<String> =
                client_datas.iter().map(|c| c.client_id.clone()).collect();

            client_datas.extend(
                cache
                    .values()
                    .filter(|r| !connected_ids.contains(&r.client_id))
                    .map(|r| r.to_data()),
            );
        }

        let chat = self.chat.lock();

        RoomSnapshot {
            client_datas,
            audio_sources: self.queue.lock().clone(),
            global_volume: *self.global_volume.lock(),
            playback_state: self.playback.lock().clone(),
            chat: (!chat.is_empty() || chat.newest_id() > 0).then(|| chat.snapshot()),
        }
    }

    /// Rebuilds a room from a snapshot without enrolling any live session.
    /// All records land in the reconnect cache; the cleanup timer is armed
    /// in case nobody ever comes back.
    pub fn restore(context: &CoreContext, id: &str, snapshot: RoomSnapshot) -> Arc<Self> {
        let room = Self::new(context, id);

        {
            let mut cache = room.cache.lock();

            for data in snapshot.client_datas {
                cache.insert(data.client_id.clone(), ClientRecord::from_data(data));
            }
        }

        *room.queue.lock() = snapshot.audio_sources;
        *room.global_volume.lock() = snapshot.global_volume.clamp(0., 1.);
        *room.playback.lock() = snapshot.playback_state;

        if let Some(chat) = snapshot.chat {
            *room.chat.lock() = ChatLog::restore(chat, context.config.chat_history_limit);
        }

        room.schedule_cleanup();

        room
    }

    // ---- plumbing ------------------------------------------------------

    fn broadcast_client_change(&self) {
        self.broadcast(ServerMessage::RoomEvent {
            event: RoomEvent::ClientChange {
                clients: self.client_datas(),
            },
        });
    }

    /// Fans a message out to every connected session. Outboxes are cloned
    /// out of the lock first, so a slow session can never stall the room.
    pub fn broadcast(&self, message: ServerMessage) {
        let outboxes: Vec<Outbox> = self
            .connected
            .lock()
            .iter()
            .map(|c| c.outbox.clone())
            .collect();

        for outbox in outboxes {
            let _ = outbox.send(OutboundFrame::Message(message.clone()));
        }
    }

    pub fn unicast(&self, client_id: &str, message: ServerMessage) {
        let outbox = self
            .connected
            .lock()
            .iter()
            .find(|c| c.record.client_id == client_id)
            .map(|c| c.outbox.clone());

        if let Some(outbox) = outbox {
            let _ = outbox.send(OutboundFrame::Message(message));
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_heartbeat(&self, client_id: &str, ms: u64) {
        let mut connected = self.connected.lock();

        if let Some(client) = connected
            .iter_mut()
            .find(|c| c.record.client_id == client_id)
        {
            client.record.last_heartbeat_at = client.record.last_heartbeat_at.saturating_sub(ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn join(room: &Room, client_id: &str, username: &str) -> UnboundedReceiver<OutboundFrame> {
        let (tx, rx) = unbounded_channel();
        room.add_client(client_id, username, tx);

        rx
    }

    fn drain(rx: &mut UnboundedReceiver<OutboundFrame>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();

        while let Ok(frame) = rx.try_recv() {
            if let OutboundFrame::Message(message) = frame {
                messages.push(message);
            }
        }

        messages
    }

    fn scheduled_plays(messages: &[ServerMessage]) -> Vec<(Timestamp, String, f64)> {
        messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::ScheduledAction {
                    server_time_to_execute,
                    scheduled_action:
                        ScheduledAction::Play {
                            audio_source,
                            track_time_seconds,
                        },
                } => Some((*server_time_to_execute, audio_source.clone(), *track_time_seconds)),
                _ => None,
            })
            .collect()
    }

    fn latest_clients(messages: &[ServerMessage]) -> Option<Vec<ClientData>> {
        messages
            .iter()
            .rev()
            .find_map(|m| match m {
                ServerMessage::RoomEvent {
                    event: RoomEvent::ClientChange { clients },
                } => Some(clients.clone()),
                _ => None,
            })
    }

    fn latest_sources(messages: &[ServerMessage]) -> Option<Vec<String>> {
        messages
            .iter()
            .rev()
            .find_map(|m| match m {
                ServerMessage::RoomEvent {
                    event: RoomEvent::SetAudioSources { sources, .. },
                } => Some(sources.iter().map(|s| s.url.clone()).collect()),
                _ => None,
            })
    }

    #[tokio::test]
    async fn test_first_joiner_is_admin() {
        let context = testing::context();
        let room = Room::new(&context, "123456");

        let mut a = join(&room, "A", "alice");

        let clients = latest_clients(&drain(&mut a)).unwrap();
        assert_eq!(clients.len(), 1);
        assert!(clients[0].is_admin, "first joiner is admin");

        let mut b = join(&room, "B", "bob");

        let clients = latest_clients(&drain(&mut b)).unwrap();
        let bob = clients.iter().find(|c| c.client_id == "B").unwrap();
        assert!(!bob.is_admin, "second joiner is not admin");
    }

    #[tokio::test]
    async fn test_admin_promotion_on_leave() {
        let context = testing::context();
        let room = Room::new(&context, "123456");

        let _a = join(&room, "A", "alice");
        let mut b = join(&room, "B", "bob");
        drain(&mut b);

        room.remove_client("A");

        let clients = latest_clients(&drain(&mut b)).unwrap();
        assert_eq!(clients.len(), 1);
        assert!(clients[0].is_admin, "remaining client was promoted");
    }

    #[tokio::test]
    async fn test_rejoin_restores_admin_and_join_time() {
        let context = testing::context();
        let room = Room::new(&context, "123456");

        let mut a = join(&room, "A", "alice");
        let joined_at = latest_clients(&drain(&mut a)).unwrap()[0].joined_at;

        let mut b = join(&room, "B", "bob");
        room.remove_client("A");
        drain(&mut b);

        // B got promoted; A comes back and is an admin again. Two admins
        // are allowed after a rejoin.
        let mut a = join(&room, "A", "alice");

        let clients = latest_clients(&drain(&mut a)).unwrap();
        let alice = clients.iter().find(|c| c.client_id == "A").unwrap();
        let bob = clients.iter().find(|c| c.client_id == "B").unwrap();

        assert!(alice.is_admin);
        assert!(bob.is_admin);
        assert_eq!(alice.joined_at, joined_at, "join time survives reconnects");
    }

    #[tokio::test]
    async fn test_play_commits_once_all_loaded() {
        let context = testing::context();
        let room = Room::new(&context, "123456");

        let mut a = join(&room, "A", "alice");
        let mut b = join(&room, "B", "bob");

        room.set_audio_sources(vec!["u1".to_string()], None);
        drain(&mut a);
        drain(&mut b);

        room.handle_play("A", "u1", 0.);

        // The load instruction went out, but the play is still pending.
        let messages = drain(&mut a);
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::RoomEvent {
                event: RoomEvent::LoadAudioSource { .. }
            }
        )));
        assert!(scheduled_plays(&messages).is_empty());

        let before = context.clock.now_ms();
        room.confirm_loaded("B", "u1");

        let plays = scheduled_plays(&drain(&mut b));
        assert_eq!(plays.len(), 1, "exactly one play broadcast");

        let (tte, url, _) = &plays[0];
        assert_eq!(url, "u1");

        // The scheduled instant respects the floor and the cap.
        let config = &context.config;
        assert!(*tte >= before + config.min_schedule_ms);
        assert!(*tte <= context.clock.now_ms() + config.cap_schedule_ms);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_barrier_deadline_commits_with_partial_set() {
        let context = testing::context();
        let room = Room::new(&context, "123456");

        let mut a = join(&room, "A", "alice");
        let _b = join(&room, "B", "bob");
        let _c = join(&room, "C", "carol");

        room.set_audio_sources(vec!["u1".to_string()], None);
        room.handle_play("A", "u1", 0.);
        room.confirm_loaded("B", "u1");
        drain(&mut a);

        // C never confirms; the deadline commits with whoever is present.
        tokio::time::sleep(Duration::from_millis(
            context.config.load_barrier_timeout_ms + 100,
        ))
        .await;

        let plays = scheduled_plays(&drain(&mut a));
        assert_eq!(plays.len(), 1, "deadline produced exactly one play");

        // The barrier is gone: a stray confirm cannot commit again.
        room.confirm_loaded("C", "u1");
        assert!(scheduled_plays(&drain(&mut a)).is_empty());
    }

    #[tokio::test]
    async fn test_play_unknown_track_is_dropped() {
        let context = testing::context();
        let room = Room::new(&context, "123456");

        let mut a = join(&room, "A", "alice");
        drain(&mut a);

        room.handle_play("A", "not-queued", 0.);

        let messages = drain(&mut a);
        assert!(messages.is_empty(), "nothing is broadcast for unknown urls");
    }

    #[tokio::test]
    async fn test_pause_after_play_references_track() {
        let context = testing::context();
        let room = Room::new(&context, "123456");

        let mut a = join(&room, "A", "alice");
        room.set_audio_sources(vec!["u1".to_string()], None);
        room.handle_play("A", "u1", 0.);
        drain(&mut a);

        room.handle_pause("u1", 4.2);

        let messages = drain(&mut a);
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::ScheduledAction {
                scheduled_action: ScheduledAction::Pause,
                ..
            }
        )));

        let playback = room.playback.lock().clone();
        assert_eq!(playback.kind, PlaybackKind::Paused);
        assert_eq!(playback.audio_source, "u1");
        assert_eq!(playback.track_position_seconds, 4.2);
    }

    #[tokio::test]
    async fn test_sync_unicasts_resume_position() {
        let context = testing::context();
        let room = Room::new(&context, "123456");

        let mut a = join(&room, "A", "alice");
        room.set_audio_sources(vec!["u1".to_string()], None);
        room.handle_play("A", "u1", 10.);
        drain(&mut a);

        let started_at = room.playback.lock().server_time_to_execute;

        let mut b = join(&room, "B", "bob");
        drain(&mut b);

        room.handle_sync("B");

        let plays = scheduled_plays(&drain(&mut b));
        assert_eq!(plays.len(), 1);

        let (tte, url, resume) = &plays[0];
        assert_eq!(url, "u1");

        let config = &context.config;
        let now = context.clock.now_ms();
        assert!(*tte >= started_at);
        assert!(*tte <= now + config.cap_schedule_ms + config.sync_extra_ms);

        // The resume position accounts for the time already played.
        let expected = 10. + (*tte as f64 - started_at as f64) / 1000.;
        assert!((resume - expected).abs() < 1e-9);

        // Nothing is sent to the other client.
        assert!(scheduled_plays(&drain(&mut a)).is_empty());
    }

    #[tokio::test]
    async fn test_sync_is_noop_while_paused() {
        let context = testing::context();
        let room = Room::new(&context, "123456");

        let mut a = join(&room, "A", "alice");
        drain(&mut a);

        room.handle_sync("A");
        assert!(drain(&mut a).is_empty());
    }

    #[tokio::test]
    async fn test_queue_deduplicates() {
        let context = testing::context();
        let room = Room::new(&context, "123456");

        let mut a = join(&room, "A", "alice");
        drain(&mut a);

        room.set_audio_sources(
            vec!["u1".to_string(), "u2".to_string(), "u1".to_string()],
            None,
        );

        let sources = latest_sources(&drain(&mut a)).unwrap();
        assert_eq!(sources, vec!["u1", "u2"]);

        room.add_audio_source("u2");
        assert!(drain(&mut a).is_empty(), "duplicate adds are silent");
    }

    #[tokio::test]
    async fn test_delete_current_track_resets_playback() {
        let context = testing::context();
        let room = Room::new(&context, "123456");

        let mut a = join(&room, "A", "alice");

        // u1 is owned by this room's blob prefix, u2 is foreign.
        let u1 = "memory://blobs/room-123456/a.mp3".to_string();
        room.set_audio_sources(vec![u1.clone(), "u2".to_string()], None);
        room.handle_play("A", &u1, 0.);
        drain(&mut a);

        room.delete_audio_sources(vec![u1.clone()]).await;

        let sources = latest_sources(&drain(&mut a)).unwrap();
        assert_eq!(sources, vec!["u2"]);

        let playback = room.playback.lock().clone();
        assert_eq!(playback, PlaybackState::default());

        // Deleting the same urls again changes nothing and stays silent.
        room.delete_audio_sources(vec![u1]).await;
        assert!(drain(&mut a).is_empty());
    }

    #[tokio::test]
    async fn test_failed_blob_delete_keeps_url_queued() {
        use crate::storage::{BlobStore, PresignedUpload, StorageError};
        use async_trait::async_trait;

        struct BrokenStore;

        #[async_trait]
        impl BlobStore for BrokenStore {
            async fn presign_upload(
                &self,
                _room_id: &str,
                _file_name: &str,
            ) -> crate::storage::Result<PresignedUpload> {
                Err(StorageError::Status(500))
            }

            async fn delete(&self, _url: &str) -> crate::storage::Result<()> {
                Err(StorageError::Status(500))
            }

            async fn delete_prefix(&self, _prefix: &str) -> crate::storage::Result<usize> {
                Err(StorageError::Status(500))
            }
        }

        let mut context = testing::context();
        context.storage = Arc::new(BrokenStore);

        let room = Room::new(&context, "123456");
        let mut a = join(&room, "A", "alice");

        let u1 = "memory://blobs/room-123456/a.mp3".to_string();
        room.set_audio_sources(vec![u1.clone()], None);
        drain(&mut a);

        room.delete_audio_sources(vec![u1.clone()]).await;

        assert!(room.queue_contains(&u1), "url survives a failed delete");
        assert!(drain(&mut a).is_empty(), "no removal is broadcast");
    }

    #[tokio::test]
    async fn test_global_volume_is_clamped() {
        let context = testing::context();
        let room = Room::new(&context, "123456");

        let mut a = join(&room, "A", "alice");
        drain(&mut a);

        room.set_global_volume(1.5);
        assert_eq!(room.global_volume(), 1.);

        let messages = drain(&mut a);
        let volume = messages.iter().find_map(|m| match m {
            ServerMessage::ScheduledAction {
                scheduled_action: ScheduledAction::GlobalVolumeConfig { volume, .. },
                ..
            } => Some(*volume),
            _ => None,
        });

        assert_eq!(volume, Some(1.));
    }

    #[tokio::test]
    async fn test_last_admin_cannot_be_demoted() {
        let context = testing::context();
        let room = Room::new(&context, "123456");

        let mut a = join(&room, "A", "alice");
        drain(&mut a);

        room.set_admin("A", false);
        assert!(room.is_admin("A"), "last admin stays admin");

        let mut b = join(&room, "B", "bob");
        room.set_admin("B", true);
        room.set_admin("A", false);
        drain(&mut b);

        assert!(!room.is_admin("A"));
        assert!(room.is_admin("B"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_eviction() {
        let context = testing::context();
        let room = Room::new(&context, "123456");

        let mut a = join(&room, "A", "alice");
        let mut b = join(&room, "B", "bob");
        drain(&mut b);

        room.backdate_heartbeat("A", context.config.response_timeout_ms + 1000);

        tokio::time::sleep(Duration::from_millis(
            context.config.heartbeat_interval_ms * 2,
        ))
        .await;

        // A was told to close, and the presence view no longer has it.
        let mut closed = false;

        while let Ok(frame) = a.try_recv() {
            if matches!(frame, OutboundFrame::Close { code: 1000, .. }) {
                closed = true;
            }
        }

        assert!(closed, "expired session receives a close frame");

        let clients = latest_clients(&drain(&mut b)).unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].client_id, "B");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_grace_is_cancelled_by_rejoin() {
        let context = testing::context();
        let room = Room::new(&context, "123456");
        context.rooms.insert("123456".to_string(), room.clone());

        let _a = join(&room, "A", "alice");
        room.remove_client("A");

        // A comes back before the grace period elapses.
        tokio::time::sleep(Duration::from_millis(context.config.cleanup_grace_ms / 2)).await;
        let _a = join(&room, "A", "alice");

        tokio::time::sleep(Duration::from_millis(context.config.cleanup_grace_ms * 2)).await;
        assert!(
            context.rooms.contains_key("123456"),
            "rejoin cancelled the cleanup"
        );

        // Now leave for good.
        room.remove_client("A");
        tokio::time::sleep(Duration::from_millis(context.config.cleanup_grace_ms + 1000)).await;
        assert!(!context.rooms.contains_key("123456"), "room was reclaimed");
    }

    #[tokio::test]
    async fn test_spatial_one_shot_on_move() {
        let context = testing::context();
        let room = Room::new(&context, "123456");

        let mut a = join(&room, "A", "alice");
        drain(&mut a);

        room.move_client("A", 10., 10.);

        let messages = drain(&mut a);
        let gains = messages.iter().find_map(|m| match m {
            ServerMessage::ScheduledAction {
                scheduled_action: ScheduledAction::SpatialConfig { gains, .. },
                ..
            } => Some(gains.clone()),
            _ => None,
        });

        let gains = gains.expect("a one-shot spatial config is emitted");
        let gain = gains.get("A").unwrap().gain;

        assert!(gain >= context.config.gain_low && gain <= context.config.gain_high);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spatial_loop_ticks_and_stops() {
        let context = testing::context();
        let room = Room::new(&context, "123456");

        let mut a = join(&room, "A", "alice");
        drain(&mut a);

        room.start_spatial_audio();
        room.start_spatial_audio(); // idempotent

        tokio::time::sleep(Duration::from_millis(context.config.spatial_tick_ms * 5)).await;

        let configs = drain(&mut a)
            .iter()
            .filter(|m| {
                matches!(
                    m,
                    ServerMessage::ScheduledAction {
                        scheduled_action: ScheduledAction::SpatialConfig { .. },
                        ..
                    }
                )
            })
            .count();

        assert!(configs >= 2, "the loop publishes continuously");

        room.stop_spatial_audio();

        let messages = drain(&mut a);
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::ScheduledAction {
                scheduled_action: ScheduledAction::StopSpatialAudio,
                ..
            }
        )));

        tokio::time::sleep(Duration::from_millis(context.config.spatial_tick_ms * 5)).await;
        let late = drain(&mut a);
        assert!(late.is_empty(), "no ticks after stop");
    }

    #[tokio::test]
    async fn test_chat_broadcast_and_full_sync() {
        let context = testing::context();
        let room = Room::new(&context, "123456");

        let mut a = join(&room, "A", "alice");
        drain(&mut a);

        room.send_chat("A", "hello there");

        let messages = drain(&mut a);
        let update = messages.iter().find_map(|m| match m {
            ServerMessage::RoomEvent {
                event:
                    RoomEvent::ChatUpdate {
                        messages,
                        is_full_sync,
                        newest_id,
                    },
            } => Some((messages.clone(), *is_full_sync, *newest_id)),
            _ => None,
        });

        let (chat_messages, is_full_sync, newest_id) = update.unwrap();
        assert!(!is_full_sync);
        assert_eq!(chat_messages.len(), 1);
        assert_eq!(chat_messages[0].text, "hello there");
        assert_eq!(newest_id, chat_messages[0].id);

        // A new joiner gets the full log.
        let mut b = join(&room, "B", "bob");
        let full = drain(&mut b).iter().find_map(|m| match m {
            ServerMessage::RoomEvent {
                event:
                    RoomEvent::ChatUpdate {
                        messages,
                        is_full_sync: true,
                        ..
                    },
            } => Some(messages.clone()),
            _ => None,
        });

        assert_eq!(full.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backup_roundtrip() {
        let context = testing::context();
        let room = Room::new(&context, "123456");

        let mut a = join(&room, "A", "alice");
        drain(&mut a);

        room.set_audio_sources(vec!["u1".to_string()], None);
        room.set_global_volume(0.7);
        room.send_chat("A", "snapshot me");
        room.handle_play("A", "u1", 3.);

        let backup = room.create_backup();

        let restored = Room::restore(&context, "123456", backup.clone());
        let second = restored.create_backup();

        assert_eq!(backup, second, "backup/restore/backup is stable");
        assert_eq!(restored.global_volume(), 0.7);
        assert!(restored.connected_count() == 0, "no live sessions restored");

        // The record is in the cache: a rejoin restores identity.
        let mut a = join(&restored, "A", "alice");
        let clients = latest_clients(&drain(&mut a)).unwrap();
        assert!(clients[0].is_admin);
    }

    #[tokio::test]
    async fn test_stream_music_queues_track_and_counts_jobs() {
        use crate::provider::{MusicProvider, ProviderError};
        use async_trait::async_trait;

        struct StubProvider;

        #[async_trait]
        impl MusicProvider for StubProvider {
            async fn search(
                &self,
                _query: &str,
            ) -> Result<serde_json::Value, ProviderError> {
                Ok(serde_json::json!([]))
            }

            async fn stream_url(&self, track_id: &str) -> Result<String, ProviderError> {
                Ok(format!("https://cdn/tracks/{track_id}.mp3"))
            }
        }

        let mut context = testing::context();
        context.provider = Arc::new(StubProvider);

        let room = Room::new(&context, "123456");
        let mut a = join(&room, "A", "alice");
        drain(&mut a);

        room.stream_music("t1");
        assert_eq!(room.active_job_count(), 1);

        // Let the background job resolve.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(room.active_job_count(), 0);
        assert!(room.queue_contains("https://cdn/tracks/t1.mp3"));

        let messages = drain(&mut a);

        // One job-count broadcast on start, one on finish.
        let counts: Vec<usize> = messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::StreamJobUpdate { active_job_count } => Some(*active_job_count),
                _ => None,
            })
            .collect();
        assert_eq!(counts, vec![1, 0]);

        let sources = latest_sources(&messages).unwrap();
        assert_eq!(sources, vec!["https://cdn/tracks/t1.mp3"]);
    }

    #[tokio::test]
    async fn test_stream_music_failure_still_settles_job_count() {
        let context = testing::context();
        let room = Room::new(&context, "123456");

        let mut a = join(&room, "A", "alice");
        drain(&mut a);

        // The null provider has no catalog, so the job fails.
        room.stream_music("t1");

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(room.active_job_count(), 0);

        let messages = drain(&mut a);
        let counts: Vec<usize> = messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::StreamJobUpdate { active_job_count } => Some(*active_job_count),
                _ => None,
            })
            .collect();
        assert_eq!(counts, vec![1, 0]);

        assert!(latest_sources(&messages).is_none(), "nothing was queued");
    }

    #[tokio::test]
    async fn test_location_reaches_presence_and_chat() {
        let context = testing::context();
        let room = Room::new(&context, "123456");

        let mut a = join(&room, "A", "alice");
        drain(&mut a);

        let location = Location {
            city: "Oslo".to_string(),
            region: "Oslo".to_string(),
            country: "Norway".to_string(),
            country_code: "NO".to_string(),
            flag_svg_url: "https://flags/no.svg".to_string(),
        };

        room.set_location("A", location.clone());

        let clients = latest_clients(&drain(&mut a)).unwrap();
        let restored = clients[0].location.as_ref().unwrap();
        assert_eq!(restored.country_code, "NO");

        // Chat messages carry the sender's country code once located.
        room.send_chat("A", "hei");

        let country = drain(&mut a).iter().find_map(|m| match m {
            ServerMessage::RoomEvent {
                event: RoomEvent::ChatUpdate { messages, .. },
            } => messages.first().and_then(|m| m.country_code.clone()),
            _ => None,
        });
        assert_eq!(country, Some("NO".to_string()));

        // A location for an unknown client changes nothing.
        room.set_location("Z", location);
        assert!(drain(&mut a).is_empty());
    }

    #[tokio::test]
    async fn test_load_default_tracks_appends_without_duplicates() {
        let context = testing::context();
        let room = Room::new(&context, "123456");

        let mut a = join(&room, "A", "alice");
        room.add_audio_source("u1");
        drain(&mut a);

        let defaults = vec!["u1".to_string(), "d1".to_string(), "d2".to_string()];
        room.load_default_tracks(&defaults);

        // Already-queued urls are skipped; the batch goes out as one update.
        let messages = drain(&mut a);
        let sources = latest_sources(&messages).unwrap();
        assert_eq!(sources, vec!["u1", "d1", "d2"]);

        let updates = messages
            .iter()
            .filter(|m| {
                matches!(
                    m,
                    ServerMessage::RoomEvent {
                        event: RoomEvent::SetAudioSources { .. }
                    }
                )
            })
            .count();
        assert_eq!(updates, 1);

        // A second load finds nothing new and stays silent.
        room.load_default_tracks(&defaults);
        assert!(drain(&mut a).is_empty());
    }
}
