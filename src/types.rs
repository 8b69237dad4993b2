// src/types.rs

use anyhow::bail;
use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};

// ============================================================================
// Crossing Direction
// ============================================================================

/// Direction of a gate crossing. The store only ever persists the canonical
/// upper-case form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "OUT")]
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
        }
    }

    /// Parse a direction, normalizing case. Anything that is not IN/OUT is
    /// rejected at the write boundary.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "IN" => Ok(Direction::In),
            "OUT" => Ok(Direction::Out),
            other => bail!("invalid direction {other:?}, must be IN or OUT"),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Persistent Records
// ============================================================================

/// One gate crossing, as read back from the events table.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub id: i64,
    pub event_time: DateTime<FixedOffset>,
    pub direction: Direction,
    pub camera_id: String,
    pub track_id: Option<i64>,
}

/// One row per calendar date.
#[derive(Debug, Clone)]
pub struct DailyState {
    pub date: NaiveDate,
    pub total_morning: i64,
    pub is_frozen: bool,
    pub realtime_in: i64,
    pub realtime_out: i64,
    pub updated_at: DateTime<FixedOffset>,
}

/// Field-patch for `Store::upsert_daily_state`. Unset fields are left as-is
/// (or take the schema default on first insert).
#[derive(Debug, Clone, Copy, Default)]
pub struct DailyStatePatch {
    pub total_morning: Option<i64>,
    pub is_frozen: Option<bool>,
    pub realtime_in: Option<i64>,
    pub realtime_out: Option<i64>,
}

/// A maximal contiguous interval during which live occupancy fell short of
/// the frozen morning baseline.
#[derive(Debug, Clone)]
pub struct MissingPeriod {
    pub id: i64,
    pub date: NaiveDate,
    pub session: Session,
    pub start_time: DateTime<FixedOffset>,
    pub end_time: Option<DateTime<FixedOffset>>,
    pub duration_minutes: Option<i64>,
    /// Latest witnessed shortfall while the period was open.
    pub missing_observed: i64,
}

impl MissingPeriod {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Which half of the working day a missing period belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Session {
    #[serde(rename = "morning")]
    Morning,
    #[serde(rename = "afternoon")]
    Afternoon,
}

impl Session {
    pub fn as_str(&self) -> &'static str {
        match self {
            Session::Morning => "morning",
            Session::Afternoon => "afternoon",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "morning" => Ok(Session::Morning),
            "afternoon" => Ok(Session::Afternoon),
            other => bail!("invalid session {other:?}"),
        }
    }
}

impl std::fmt::Display for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Alert Log
// ============================================================================

/// Outcome of one alert attempt. Every tick decision is recorded, including
/// skips, so operators can audit why no mail went out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertStatus {
    Sent,
    Failed,
    Skipped,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Sent => "sent",
            AlertStatus::Failed => "failed",
            AlertStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "sent" => Ok(AlertStatus::Sent),
            "failed" => Ok(AlertStatus::Failed),
            "skipped" => Ok(AlertStatus::Skipped),
            other => bail!("invalid alert status {other:?}"),
        }
    }
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One attempted alert, as read back from alert_logs.
#[derive(Debug, Clone)]
pub struct AlertRecord {
    pub id: i64,
    pub alert_time: DateTime<FixedOffset>,
    pub date: NaiveDate,
    pub expected_total: i64,
    pub current_total: i64,
    pub missing: i64,
    pub status: AlertStatus,
    pub reason: Option<String>,
}
