use crate::{ClientData, Config, Location, Position, Timestamp};

/// Everything a room knows about one client.
///
/// Records outlive their connection: when a client drops, the record moves
/// to the room's reconnect cache so admin status, identity, and location
/// survive a rejoin under the same client id.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub client_id: String,
    pub username: String,
    pub joined_at: Timestamp,
    pub last_heartbeat_at: Timestamp,
    pub last_ntp_response: Timestamp,
    pub rtt: f64,
    pub is_admin: bool,
    pub position: Position,
    pub location: Option<Location>,
}

impl ClientRecord {
    pub fn new(client_id: &str, username: &str, now: Timestamp, config: &Config) -> Self {
        Self {
            client_id: client_id.to_string(),
            username: username.to_string(),
            joined_at: now,
            last_heartbeat_at: now,
            last_ntp_response: now,
            rtt: 0.,
            is_admin: false,
            position: Position {
                x: config.origin_x,
                y: config.origin_y - config.placement_radius,
            },
            location: None,
        }
    }

    /// Folds a reported round-trip sample into the smoothed estimate.
    /// The first sample replaces the estimate outright.
    pub fn observe_rtt(&mut self, sample: f64, smoothing: f64) {
        if self.rtt == 0. {
            self.rtt = sample;
        } else {
            self.rtt = smoothing * sample + (1. - smoothing) * self.rtt;
        }
    }

    pub fn touch(&mut self, now: Timestamp) {
        self.last_heartbeat_at = now;
        self.last_ntp_response = now;
    }

    pub fn to_data(&self) -> ClientData {
        ClientData {
            username: self.username.clone(),
            client_id: self.client_id.clone(),
            rtt: self.rtt,
            position: self.position,
            last_ntp_response: self.last_ntp_response,
            is_admin: self.is_admin,
            location: self.location.clone(),
            joined_at: self.joined_at,
        }
    }

    /// Rebuilds a record from a restored presence view.
    pub fn from_data(data: ClientData) -> Self {
        Self {
            client_id: data.client_id,
            username: data.username,
            joined_at: data.joined_at,
            last_heartbeat_at: data.last_ntp_response,
            last_ntp_response: data.last_ntp_response,
            rtt: data.rtt,
            is_admin: data.is_admin,
            position: data.position,
            location: data.location,
        }
    }
}
