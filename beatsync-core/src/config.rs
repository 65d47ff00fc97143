/// The configuration of the playback coordinator
#[derive(Debug, Clone)]
pub struct Config {
    /// The minimum delay in milliseconds between a broadcast and its scheduled execution
    pub min_schedule_ms: u64,
    /// The maximum delay a scheduled execution can be pushed out by slow peers
    pub cap_schedule_ms: u64,
    /// Extra headroom in milliseconds given to late joiners so they can decode before the deadline
    pub sync_extra_ms: u64,
    /// The weight of a new round-trip sample in the exponential moving average
    pub rtt_smoothing: f64,
    /// How long a play waits for clients to confirm decoding before committing anyway
    pub load_barrier_timeout_ms: u64,
    /// How often the heartbeat sweeper looks for dead sessions
    pub heartbeat_interval_ms: u64,
    /// How long a session may go without a time-sync probe before it is disconnected
    pub response_timeout_ms: u64,
    /// How long an empty room lingers before its resources are reclaimed
    pub cleanup_grace_ms: u64,
    /// How often a full state snapshot is handed to the snapshot store
    pub backup_interval_ms: u64,
    /// The period of the spatial gain loop
    pub spatial_tick_ms: u64,
    /// Gain ramp time in seconds for spatial updates
    pub spatial_ramp_time: f64,
    /// Gain ramp time in seconds for global volume updates
    pub volume_ramp_time: f64,
    /// The side length of the square grid clients are placed on
    pub grid_size: f64,
    /// The center of the grid
    pub origin_x: f64,
    pub origin_y: f64,
    /// The radius of the circle clients are arranged on
    pub placement_radius: f64,
    /// The gain floor, so distant speakers never go fully silent
    pub gain_low: f64,
    /// The gain ceiling
    pub gain_high: f64,
    /// Distance at or under which a client receives full gain
    pub gain_near_radius: f64,
    /// Distance at or over which a client receives the gain floor
    pub gain_far_radius: f64,
    /// How many chat messages a room retains
    pub chat_history_limit: usize,
    /// The longest accepted chat message, in characters
    pub chat_max_message_length: usize,
    /// Tracks loaded into a room on request, when no uploads exist yet
    pub default_tracks: Vec<String>,
}

impl Config {
    /// Returns the delay in milliseconds to schedule an action ahead of now,
    /// given the worst observed round-trip among connected clients.
    ///
    /// 1.5x the round-trip buffers jitter, and the flat 200ms absorbs
    /// handler and processing lag on the client.
    pub fn schedule_delay_ms(&self, max_rtt_ms: f64) -> u64 {
        let wanted = (1.5 * max_rtt_ms + 200.0).ceil() as u64;

        wanted.clamp(self.min_schedule_ms, self.cap_schedule_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_schedule_ms: 400,
            cap_schedule_ms: 3000,
            sync_extra_ms: 1500,
            rtt_smoothing: 0.2,
            load_barrier_timeout_ms: 3000,
            heartbeat_interval_ms: 5000,
            response_timeout_ms: 15_000,
            cleanup_grace_ms: 30_000,
            backup_interval_ms: 60_000,
            spatial_tick_ms: 100,
            spatial_ramp_time: 0.25,
            volume_ramp_time: 0.1,
            grid_size: 100.,
            origin_x: 50.,
            origin_y: 50.,
            placement_radius: 25.,
            gain_low: 0.15,
            gain_high: 1.,
            gain_near_radius: 15.,
            gain_far_radius: 45.,
            chat_history_limit: 300,
            chat_max_message_length: 500,
            default_tracks: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_delay_bounds() {
        let config = Config::default();

        // A perfect network still gets the floor.
        assert_eq!(config.schedule_delay_ms(0.), 400);

        // A terrible peer cannot push the delay past the cap.
        assert_eq!(config.schedule_delay_ms(10_000.), 3000);

        // In between, the delay tracks 1.5x the round-trip plus margin.
        assert_eq!(config.schedule_delay_ms(400.), 800);
    }
}
