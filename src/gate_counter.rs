// src/gate_counter.rs
//
// Band-based gate crossing counter.
//
// The gate is a thick band, not a thin line. A crossing is only counted on
// the INSIDE→OUTSIDE transition, and only when the track entered from the
// opposite side, dwelled inside for enough frames, and actually travelled.
// That defeats the three classic failure modes: thin-line jitter
// (oscillation across the line), detector flicker (track-id churn), and
// loiterers brushing the line.

use chrono::{DateTime, Duration};
use chrono_tz::Tz;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::config::{DirectionMapping, GateConfig, GateMode};
use crate::types::Direction;

// ============================================================================
// TYPES
// ============================================================================

/// Which side of the band a point sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Top,
    Bottom,
    Left,
    Right,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Top => "TOP",
            Side::Bottom => "BOTTOM",
            Side::Left => "LEFT",
            Side::Right => "RIGHT",
        }
    }
}

/// A validated directional crossing.
#[derive(Debug, Clone)]
pub struct GateCrossing {
    pub track_id: u64,
    pub timestamp: DateTime<Tz>,
    pub direction: Direction,
    pub entry_side: Side,
    pub exit_side: Side,
    pub frames_in_gate: u32,
    pub travel_px: f32,
}

/// Per-track state, discarded on track loss.
#[derive(Debug, Clone, Default)]
struct TrackState {
    inside: bool,
    entry_side: Option<Side>,
    entry_point: (f32, f32),
    frames_in_gate: u32,
    last_side: Option<Side>,
}

/// Band geometry, resolved once from config.
#[derive(Debug, Clone)]
enum Band {
    Horizontal {
        y: f32,
        half_height: f32,
        x_min: Option<f32>,
        x_max: Option<f32>,
    },
    Line {
        p1: (f32, f32),
        vec: (f32, f32),
        len_sq: f32,
        half_thickness: f32,
    },
}

impl Band {
    fn from_config(config: &GateConfig) -> anyhow::Result<Self> {
        match config.mode {
            GateMode::HorizontalBand => Ok(Band::Horizontal {
                y: config.gate_y,
                half_height: config.gate_height / 2.0,
                x_min: config.gate_x_min,
                x_max: config.gate_x_max,
            }),
            GateMode::LineBand => {
                let (p1, p2) = match (config.gate_p1, config.gate_p2) {
                    (Some(p1), Some(p2)) => (p1, p2),
                    _ => anyhow::bail!("gate_p1 and gate_p2 are required for LINE_BAND mode"),
                };
                let vec = (p2.0 - p1.0, p2.1 - p1.1);
                let len_sq = vec.0 * vec.0 + vec.1 * vec.1;
                if len_sq <= f32::EPSILON {
                    anyhow::bail!("gate_p1 and gate_p2 must be distinct for LINE_BAND mode");
                }
                Ok(Band::Line {
                    p1,
                    vec,
                    len_sq,
                    half_thickness: config.gate_thickness / 2.0,
                })
            }
        }
    }

    fn side_of(&self, point: (f32, f32)) -> Side {
        match self {
            Band::Horizontal { y, .. } => {
                if point.1 < *y {
                    Side::Top
                } else {
                    Side::Bottom
                }
            }
            Band::Line { p1, vec, .. } => {
                // Sign of the cross product of the gate vector and p1→point.
                let cross = vec.0 * (point.1 - p1.1) - vec.1 * (point.0 - p1.0);
                if cross > 0.0 {
                    Side::Left
                } else {
                    Side::Right
                }
            }
        }
    }

    fn contains(&self, point: (f32, f32)) -> bool {
        match self {
            Band::Horizontal {
                y,
                half_height,
                x_min,
                x_max,
            } => {
                if (point.1 - y).abs() > *half_height {
                    return false;
                }
                if let Some(min) = x_min {
                    if point.0 < *min {
                        return false;
                    }
                }
                if let Some(max) = x_max {
                    if point.0 > *max {
                        return false;
                    }
                }
                true
            }
            Band::Line {
                p1,
                vec,
                len_sq,
                half_thickness,
            } => {
                let rel = (point.0 - p1.0, point.1 - p1.1);
                let t = (rel.0 * vec.0 + rel.1 * vec.1) / len_sq;
                if !(0.0..=1.0).contains(&t) {
                    return false;
                }
                let closest = (p1.0 + t * vec.0, p1.1 + t * vec.1);
                distance(point, closest) <= *half_thickness
            }
        }
    }
}

fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

// ============================================================================
// GATE COUNTER
// ============================================================================

pub struct GateCounter {
    band: Band,
    mapping: DirectionMapping,
    cooldown: Duration,
    min_frames_in_gate: u32,
    min_travel_px: f32,

    track_states: HashMap<u64, TrackState>,
    /// Count suppression survives track loss: a tracker may drop and
    /// immediately re-issue the same id for one physical person.
    last_counted: HashMap<u64, DateTime<Tz>>,

    count_in: u64,
    count_out: u64,
}

impl GateCounter {
    pub fn new(config: &GateConfig) -> anyhow::Result<Self> {
        let band = Band::from_config(config)?;
        info!(
            "Gate counter ready: mode={}, cooldown={}s, min_frames={}, min_travel={}px",
            config.mode.as_str(),
            config.cooldown_sec,
            config.min_frames_in_gate,
            config.min_travel_px
        );
        Ok(Self {
            band,
            mapping: config.direction_mapping,
            cooldown: Duration::milliseconds((config.cooldown_sec * 1000.0) as i64),
            min_frames_in_gate: config.min_frames_in_gate,
            min_travel_px: config.min_travel_px,
            track_states: HashMap::new(),
            last_counted: HashMap::new(),
            count_in: 0,
            count_out: 0,
        })
    }

    /// Feed one track observation (the bbox bottom-center point). Returns a
    /// crossing when the track exits the band and every validation holds.
    pub fn update(
        &mut self,
        track_id: u64,
        point: (f32, f32),
        now: DateTime<Tz>,
    ) -> Option<GateCrossing> {
        let side = self.band.side_of(point);
        let inside = self.band.contains(point);
        let mut state = self.track_states.remove(&track_id).unwrap_or_default();

        let mut crossing = None;
        match (state.inside, inside) {
            (false, false) => {
                state.entry_side = None;
                state.frames_in_gate = 0;
            }
            (false, true) => {
                // Entry side is where the point was last seen outside the
                // band; fall back to the band half for tracks born inside.
                state.entry_side = Some(state.last_side.unwrap_or(side));
                state.entry_point = point;
                state.frames_in_gate = 1;
            }
            (true, true) => {
                state.frames_in_gate += 1;
            }
            (true, false) => {
                let exit_side = side;
                if let Some(entry_side) = state.entry_side {
                    let travel = distance(state.entry_point, point);
                    let cooled = match self.last_counted.get(&track_id) {
                        Some(last) => now.signed_duration_since(*last) > self.cooldown,
                        None => true,
                    };

                    if exit_side == entry_side {
                        debug!(
                            "Track {} left the band on its entry side ({}), not a crossing",
                            track_id,
                            entry_side.as_str()
                        );
                    } else if state.frames_in_gate < self.min_frames_in_gate {
                        debug!(
                            "Track {} crossed in {} frame(s), below dwell minimum {}",
                            track_id, state.frames_in_gate, self.min_frames_in_gate
                        );
                    } else if travel < self.min_travel_px {
                        debug!(
                            "Track {} travelled {:.1}px, below minimum {:.1}px",
                            track_id, travel, self.min_travel_px
                        );
                    } else if !cooled {
                        debug!("Track {} still in cooldown, crossing suppressed", track_id);
                    } else if let Some(direction) = map_direction(&self.mapping, entry_side, exit_side)
                    {
                        match direction {
                            Direction::In => self.count_in += 1,
                            Direction::Out => self.count_out += 1,
                        }
                        crossing = Some(GateCrossing {
                            track_id,
                            timestamp: now,
                            direction,
                            entry_side,
                            exit_side,
                            frames_in_gate: state.frames_in_gate,
                            travel_px: travel,
                        });
                        self.last_counted.insert(track_id, now);
                        info!(
                            "🚶 Crossing: track={} {} ({}→{}, {} frames, {:.0}px) totals in={} out={}",
                            track_id,
                            direction,
                            entry_side.as_str(),
                            exit_side.as_str(),
                            state.frames_in_gate,
                            travel,
                            self.count_in,
                            self.count_out
                        );
                    }
                }
                state.entry_side = None;
                state.frames_in_gate = 0;
            }
        }

        state.inside = inside;
        state.last_side = Some(side);
        self.track_states.insert(track_id, state);

        if self.last_counted.len() > 256 {
            self.prune_cooldowns(now);
        }
        crossing
    }

    /// Drop a lost track's pending state so nothing leaks across id reuse.
    /// The cooldown record for the id is deliberately retained.
    pub fn drop_track(&mut self, track_id: u64) {
        self.track_states.remove(&track_id);
    }

    /// In-memory tallies since process start. Diagnostic only; the store
    /// is authoritative.
    pub fn counts(&self) -> (u64, u64) {
        (self.count_in, self.count_out)
    }

    pub fn live_tracks(&self) -> usize {
        self.track_states.len()
    }

    fn prune_cooldowns(&mut self, now: DateTime<Tz>) {
        let cooldown = self.cooldown;
        self.last_counted
            .retain(|_, t| now.signed_duration_since(*t) <= cooldown);
    }
}

fn map_direction(mapping: &DirectionMapping, entry: Side, exit: Side) -> Option<Direction> {
    match (entry, exit) {
        (Side::Top, Side::Bottom) => Some(mapping.top_to_bottom),
        (Side::Bottom, Side::Top) => Some(mapping.bottom_to_top),
        (Side::Left, Side::Right) => Some(mapping.left_to_right),
        (Side::Right, Side::Left) => Some(mapping.right_to_left),
        _ => None,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GateConfig;
    use chrono::TimeZone;
    use chrono_tz::Asia::Ho_Chi_Minh;

    fn horizontal_config() -> GateConfig {
        // Band spans y in [220, 260]
        GateConfig {
            gate_y: 240.0,
            gate_height: 40.0,
            cooldown_sec: 1.0,
            min_frames_in_gate: 2,
            min_travel_px: 15.0,
            ..Default::default()
        }
    }

    fn at_ms(ms: i64) -> DateTime<Tz> {
        Ho_Chi_Minh.with_ymd_and_hms(2026, 3, 9, 9, 0, 0).unwrap() + Duration::milliseconds(ms)
    }

    /// Walk a track through the band top→bottom, one observation per frame.
    fn walk_through(counter: &mut GateCounter, track_id: u64, start_ms: i64) -> Vec<GateCrossing> {
        let ys = [200.0, 228.0, 238.0, 250.0, 280.0];
        ys.iter()
            .enumerate()
            .filter_map(|(i, &y)| {
                counter.update(track_id, (320.0, y), at_ms(start_ms + i as i64 * 33))
            })
            .collect()
    }

    #[test]
    fn test_single_clean_crossing_counts_once() {
        let mut counter = GateCounter::new(&horizontal_config()).unwrap();
        let events = walk_through(&mut counter, 7, 0);

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.direction, Direction::Out); // TOP→BOTTOM default
        assert_eq!(event.entry_side, Side::Top);
        assert_eq!(event.exit_side, Side::Bottom);
        assert_eq!(event.frames_in_gate, 3);
        assert!(event.travel_px >= 15.0);
        assert_eq!(counter.counts(), (0, 1));
    }

    #[test]
    fn test_bottom_to_top_maps_to_in() {
        let mut counter = GateCounter::new(&horizontal_config()).unwrap();
        let ys = [280.0, 252.0, 240.0, 230.0, 200.0];
        let events: Vec<_> = ys
            .iter()
            .enumerate()
            .filter_map(|(i, &y)| counter.update(3, (320.0, y), at_ms(i as i64 * 33)))
            .collect();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].direction, Direction::In);
        assert_eq!(counter.counts(), (1, 0));
    }

    #[test]
    fn test_long_dwell_still_counts_once() {
        // A slow walker: 40 frames inside the band, then a clean exit.
        let mut counter = GateCounter::new(&horizontal_config()).unwrap();
        let mut events = Vec::new();
        let mut ms = 0;

        if let Some(e) = counter.update(7, (320.0, 200.0), at_ms(ms)) {
            events.push(e);
        }
        for i in 0..40 {
            ms += 33;
            let y = 222.0 + i as f32 * 0.9; // drifting down inside the band
            if let Some(e) = counter.update(7, (320.0, y), at_ms(ms)) {
                events.push(e);
            }
        }
        ms += 33;
        if let Some(e) = counter.update(7, (320.0, 320.0), at_ms(ms)) {
            events.push(e);
        }

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].direction, Direction::Out);
        assert_eq!(events[0].frames_in_gate, 40);
    }

    #[test]
    fn test_reactivated_track_id_suppressed_by_cooldown() {
        let mut counter = GateCounter::new(&horizontal_config()).unwrap();
        let events = walk_through(&mut counter, 7, 0);
        assert_eq!(events.len(), 1);

        // Tracker drops id 7 and immediately re-issues it for the same
        // person; the second pass lands inside cooldown_sec.
        counter.drop_track(7);
        let events = walk_through(&mut counter, 7, 300);
        assert!(events.is_empty());
        assert_eq!(counter.counts(), (0, 1));
    }

    #[test]
    fn test_cooldown_expires() {
        let mut counter = GateCounter::new(&horizontal_config()).unwrap();
        assert_eq!(walk_through(&mut counter, 7, 0).len(), 1);
        // Well past cooldown_sec = 1.0
        assert_eq!(walk_through(&mut counter, 7, 5000).len(), 1);
        assert_eq!(counter.counts(), (0, 2));
    }

    #[test]
    fn test_jitter_on_one_side_never_counts() {
        // Oscillation across the band edge: enters and leaves on TOP.
        let mut counter = GateCounter::new(&horizontal_config()).unwrap();
        let ys = [210.0, 225.0, 228.0, 215.0, 226.0, 230.0, 212.0];
        for (i, &y) in ys.iter().enumerate() {
            assert!(counter.update(9, (320.0, y), at_ms(i as i64 * 33)).is_none());
        }
        assert_eq!(counter.counts(), (0, 0));
    }

    #[test]
    fn test_single_frame_flicker_rejected_by_dwell() {
        // One frame inside then straight through: below min_frames_in_gate.
        let mut counter = GateCounter::new(&horizontal_config()).unwrap();
        let ys = [200.0, 240.0, 280.0];
        let events: Vec<_> = ys
            .iter()
            .enumerate()
            .filter_map(|(i, &y)| counter.update(4, (320.0, y), at_ms(i as i64 * 33)))
            .collect();
        assert!(events.is_empty());
    }

    #[test]
    fn test_short_travel_rejected() {
        let mut config = horizontal_config();
        config.min_travel_px = 80.0;
        let mut counter = GateCounter::new(&config).unwrap();
        let events = walk_through(&mut counter, 2, 0); // travel ≈ 52px
        assert!(events.is_empty());
    }

    #[test]
    fn test_x_bounds_exclude_crossings() {
        let mut config = horizontal_config();
        config.gate_x_min = Some(100.0);
        config.gate_x_max = Some(200.0);
        let mut counter = GateCounter::new(&config).unwrap();

        // Walking through at x=320 never enters the bounded band.
        let events = walk_through(&mut counter, 5, 0);
        assert!(events.is_empty());

        // Inside the x range it counts normally.
        let ys = [200.0, 228.0, 238.0, 250.0, 280.0];
        let events: Vec<_> = ys
            .iter()
            .enumerate()
            .filter_map(|(i, &y)| counter.update(6, (150.0, y), at_ms(i as i64 * 33)))
            .collect();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_track_loss_clears_pending_state() {
        let mut counter = GateCounter::new(&horizontal_config()).unwrap();
        counter.update(8, (320.0, 200.0), at_ms(0));
        counter.update(8, (320.0, 238.0), at_ms(33)); // inside the band
        counter.drop_track(8);
        assert_eq!(counter.live_tracks(), 0);

        // Same id reappears below the band: no phantom crossing.
        assert!(counter.update(8, (320.0, 280.0), at_ms(66)).is_none());
        assert_eq!(counter.counts(), (0, 0));
    }

    #[test]
    fn test_line_band_crossing() {
        let config = GateConfig {
            mode: GateMode::LineBand,
            gate_p1: Some((0.0, 240.0)),
            gate_p2: Some((640.0, 240.0)),
            gate_thickness: 40.0,
            cooldown_sec: 1.0,
            min_frames_in_gate: 2,
            min_travel_px: 15.0,
            ..Default::default()
        };
        let mut counter = GateCounter::new(&config).unwrap();

        // Downward walk across the horizontal line: RIGHT→LEFT in cross
        // product terms, which the default mapping counts as OUT.
        let ys = [200.0, 228.0, 238.0, 250.0, 280.0];
        let events: Vec<_> = ys
            .iter()
            .enumerate()
            .filter_map(|(i, &y)| counter.update(1, (320.0, y), at_ms(i as i64 * 33)))
            .collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].direction, Direction::Out);
    }

    #[test]
    fn test_line_band_requires_endpoints() {
        let config = GateConfig {
            mode: GateMode::LineBand,
            gate_p1: None,
            gate_p2: None,
            ..Default::default()
        };
        assert!(GateCounter::new(&config).is_err());
    }

    #[test]
    fn test_custom_direction_mapping() {
        let mut config = horizontal_config();
        config.direction_mapping.top_to_bottom = Direction::In;
        config.direction_mapping.bottom_to_top = Direction::Out;
        let mut counter = GateCounter::new(&config).unwrap();

        let events = walk_through(&mut counter, 11, 0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].direction, Direction::In);
    }
}
