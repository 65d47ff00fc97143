//! Gain computation for the spatial audio loop.
//!
//! Gains are a continuous function of distance so clients never pop when the
//! listening source moves between ticks.

use std::f64::consts::PI;

use crate::{Config, Position};

pub fn distance(a: Position, b: Position) -> f64 {
    ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt()
}

/// The gain for a client at the given distance from the listening source.
///
/// Full gain inside the near radius, a linear ramp down to the floor at the
/// far radius, and the floor beyond it. Monotone nonincreasing in distance.
pub fn gain_for_distance(distance: f64, config: &Config) -> f64 {
    let near = config.gain_near_radius;
    let far = config.gain_far_radius;

    if distance <= near {
        return config.gain_high;
    }

    if distance >= far {
        return config.gain_low;
    }

    let progress = (distance - near) / (far - near);

    config.gain_high - progress * (config.gain_high - config.gain_low)
}

/// Where the listening source sits on its slow orbit at the given tick.
pub fn orbit_position(tick: u64, config: &Config) -> Position {
    let angle = tick as f64 * PI / 30.;

    Position {
        x: config.origin_x + config.placement_radius * angle.cos(),
        y: config.origin_y + config.placement_radius * angle.sin(),
    }
}

/// Positions for `count` clients arranged around the grid center.
///
/// A single client sits exactly at the center. Multiple clients are spread
/// on a circle starting at the top, which keeps the arrangement stable as
/// clients join and leave.
pub fn circle_positions(count: usize, config: &Config) -> Vec<Position> {
    if count == 1 {
        return vec![Position {
            x: config.origin_x,
            y: config.origin_y,
        }];
    }

    (0..count)
        .map(|i| {
            let angle = 2. * PI * i as f64 / count as f64 - PI / 2.;

            Position {
                x: config.origin_x + config.placement_radius * angle.cos(),
                y: config.origin_y + config.placement_radius * angle.sin(),
            }
        })
        .collect()
}
