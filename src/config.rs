// src/config.rs
//
// Configuration surface for the whole service. Every field has a default so
// the monitor can start with an empty or partial config file; the YAML file
// only needs to name what differs from the defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::types::Direction;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraConfig,
    pub gate: GateConfig,
    pub phases: PhaseConfig,
    pub alerts: AlertConfig,
    pub email: EmailConfig,
    pub storage: StorageConfig,
    pub export: ExportConfig,
}

impl Config {
    /// Load configuration from a YAML file. A missing file is not an error:
    /// the monitor starts with defaults so a bare deployment still runs.
    pub fn load(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            warn!("Config file {} not found, using defaults", path);
            return Ok(Config::default());
        }
        let contents =
            fs::read_to_string(path).with_context(|| format!("reading config file {path}"))?;
        let config: Config =
            serde_yaml::from_str(&contents).with_context(|| format!("parsing config file {path}"))?;
        info!("Configuration loaded from {}", path);
        Ok(config)
    }
}

// ============================================================================
// Camera
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Stream URL or device index ("0" = first local camera)
    pub url: String,
    pub camera_id: String,
    /// Seconds to wait before reconnecting a dropped stream
    pub reconnect_delay_sec: f64,
    pub max_reconnect_attempts: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            url: "0".to_string(),
            camera_id: "camera_01".to_string(),
            reconnect_delay_sec: 5.0,
            max_reconnect_attempts: 10,
        }
    }
}

// ============================================================================
// Gate geometry and anti-jitter
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateMode {
    #[serde(rename = "HORIZONTAL_BAND")]
    HorizontalBand,
    #[serde(rename = "LINE_BAND")]
    LineBand,
}

impl GateMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateMode::HorizontalBand => "HORIZONTAL_BAND",
            GateMode::LineBand => "LINE_BAND",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub mode: GateMode,

    // HORIZONTAL_BAND geometry
    /// Band center Y in pixels
    pub gate_y: f32,
    /// Band thickness in pixels
    pub gate_height: f32,
    pub gate_x_min: Option<f32>,
    pub gate_x_max: Option<f32>,

    // LINE_BAND geometry
    pub gate_p1: Option<(f32, f32)>,
    pub gate_p2: Option<(f32, f32)>,
    pub gate_thickness: f32,

    // Anti-jitter
    /// Per-track suppression after a count, in seconds
    pub cooldown_sec: f64,
    /// Frames a track must dwell inside the band before its exit can count
    pub min_frames_in_gate: u32,
    /// Minimum Euclidean travel from band entry to exit, in pixels
    pub min_travel_px: f32,

    pub direction_mapping: DirectionMapping,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            mode: GateMode::HorizontalBand,
            gate_y: 240.0,
            gate_height: 40.0,
            gate_x_min: None,
            gate_x_max: None,
            gate_p1: None,
            gate_p2: None,
            gate_thickness: 40.0,
            cooldown_sec: 1.0,
            min_frames_in_gate: 2,
            min_travel_px: 15.0,
            direction_mapping: DirectionMapping::default(),
        }
    }
}

/// Effect of each traversal on the head-count. The defaults suit an
/// entrance camera looking along the walking axis: walking away from the
/// camera (top of frame) leaves the monitored area.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectionMapping {
    pub top_to_bottom: Direction,
    pub bottom_to_top: Direction,
    pub left_to_right: Direction,
    pub right_to_left: Direction,
}

impl Default for DirectionMapping {
    fn default() -> Self {
        Self {
            top_to_bottom: Direction::Out,
            bottom_to_top: Direction::In,
            left_to_right: Direction::In,
            right_to_left: Direction::Out,
        }
    }
}

// ============================================================================
// Phases
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    /// IANA timezone the whole service runs in
    pub timezone: String,
    /// Daily reset and start of the morning count (HH:MM)
    pub reset_time: String,
    /// End of the morning count; the baseline freezes here (HH:MM)
    pub morning_end: String,
    /// End of morning monitoring / start of lunch (HH:MM)
    pub realtime_morning_end: String,
    /// End of lunch / start of afternoon monitoring (HH:MM)
    pub lunch_end: String,
    /// Day close (HH:MM)
    pub day_close: String,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            timezone: "Asia/Ho_Chi_Minh".to_string(),
            reset_time: "06:00".to_string(),
            morning_end: "08:30".to_string(),
            realtime_morning_end: "11:55".to_string(),
            lunch_end: "13:15".to_string(),
            day_close: "23:59".to_string(),
        }
    }
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Alert evaluation cadence in minutes
    pub check_interval_minutes: u64,
    /// Minimum age of a missing period before the first mail. The extra 30
    /// seconds past the half hour debounces transient undercounts at the
    /// moment a shortfall begins.
    pub first_alert_delay_sec: u64,
    /// Minimum spacing between two sent alerts on the same date, in minutes
    pub cooldown_minutes: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            check_interval_minutes: 30,
            first_alert_delay_sec: 30 * 60 + 30,
            cooldown_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub from_address: String,
    pub password: String,
    /// One or more recipients, comma-separated
    pub to_addresses: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: "smtp.gmail.com".to_string(),
            smtp_port: 587,
            from_address: String::new(),
            password: String::new(),
            to_addresses: String::new(),
        }
    }
}

// ============================================================================
// Storage and exports
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    /// Directory for fallback JSONL event capture when SQLite is unreachable
    pub backup_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "data/occupancy.db".to_string(),
            backup_dir: "backup".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub daily_dir: String,
    pub summary_dir: String,
    /// How many per-day workbooks the rolling summary merges
    pub rolling_days: u32,
    /// Per-day workbooks older than this many days are swept
    pub retention_days: u32,
    pub export_interval_minutes: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            daily_dir: "exports/daily".to_string(),
            summary_dir: "exports/summary".to_string(),
            rolling_days: 5,
            retention_days: 5,
            export_interval_minutes: 30,
        }
    }
}
