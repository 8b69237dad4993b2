// src/phase_clock.rs
//
// Deterministic phase from wall clock + configured bounds. The clock holds
// no state: every caller recomputes from the current time, so missed ticks
// and clock jumps self-heal.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::config::PhaseConfig;
use crate::types::Session;

/// Named wall-clock window with well-defined alerting and
/// baseline-writability rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Accumulating the morning baseline
    MorningCount,
    /// Monitoring against the frozen baseline, before lunch
    RealtimeMorning,
    /// Monitoring paused
    LunchBreak,
    /// Monitoring against the frozen baseline, after lunch
    AfternoonMonitoring,
    /// Day closed, idle until the next reset
    DayClose,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::MorningCount => "MORNING_COUNT",
            Phase::RealtimeMorning => "REALTIME_MORNING",
            Phase::LunchBreak => "LUNCH_BREAK",
            Phase::AfternoonMonitoring => "AFTERNOON_MONITORING",
            Phase::DayClose => "DAY_CLOSE",
        }
    }

    /// Shortfall tracking and alerting only happen in monitoring phases.
    pub fn is_monitoring(&self) -> bool {
        matches!(self, Phase::RealtimeMorning | Phase::AfternoonMonitoring)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct PhaseClock {
    tz: Tz,
    reset_time: NaiveTime,
    morning_end: NaiveTime,
    realtime_morning_end: NaiveTime,
    lunch_end: NaiveTime,
    day_close: NaiveTime,
}

impl PhaseClock {
    pub fn from_config(config: &PhaseConfig) -> Result<Self> {
        let tz: Tz = config
            .timezone
            .parse()
            .ok()
            .with_context(|| format!("unknown timezone {:?}", config.timezone))?;
        Ok(Self {
            tz,
            reset_time: parse_hhmm(&config.reset_time)?,
            morning_end: parse_hhmm(&config.morning_end)?,
            realtime_morning_end: parse_hhmm(&config.realtime_morning_end)?,
            lunch_end: parse_hhmm(&config.lunch_end)?,
            day_close: parse_hhmm(&config.day_close)?,
        })
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.tz)
    }

    /// The phase a given instant falls in. Times before the daily reset
    /// belong to the closed previous day.
    pub fn phase_at(&self, t: DateTime<Tz>) -> Phase {
        let tod = t.time();
        if tod < self.reset_time {
            Phase::DayClose
        } else if tod < self.morning_end {
            Phase::MorningCount
        } else if tod < self.realtime_morning_end {
            Phase::RealtimeMorning
        } else if tod < self.lunch_end {
            Phase::LunchBreak
        } else if tod < self.day_close {
            Phase::AfternoonMonitoring
        } else {
            Phase::DayClose
        }
    }

    /// Which half of the day a monitoring instant belongs to.
    pub fn session_at(&self, t: DateTime<Tz>) -> Option<Session> {
        match self.phase_at(t) {
            Phase::RealtimeMorning => Some(Session::Morning),
            Phase::AfternoonMonitoring => Some(Session::Afternoon),
            _ => None,
        }
    }

    /// When a monitoring session opens on a given date.
    pub fn session_start(&self, date: NaiveDate, session: Session) -> DateTime<Tz> {
        match session {
            Session::Morning => self.at(date, self.morning_end),
            Session::Afternoon => self.at(date, self.lunch_end),
        }
    }

    pub fn reset_at(&self, date: NaiveDate) -> DateTime<Tz> {
        self.at(date, self.reset_time)
    }

    pub fn morning_end_at(&self, date: NaiveDate) -> DateTime<Tz> {
        self.at(date, self.morning_end)
    }

    pub fn day_close_at(&self, date: NaiveDate) -> DateTime<Tz> {
        self.at(date, self.day_close)
    }

    fn at(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Tz> {
        self.tz
            .from_local_datetime(&date.and_time(time))
            .earliest()
            // A DST gap can swallow a local time; interpreting it as UTC
            // keeps the bound usable rather than panicking.
            .unwrap_or_else(|| self.tz.from_utc_datetime(&date.and_time(time)))
    }
}

fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").with_context(|| format!("parsing time of day {s:?}"))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PhaseConfig;

    fn clock() -> PhaseClock {
        PhaseClock::from_config(&PhaseConfig::default()).unwrap()
    }

    fn at(h: u32, m: u32) -> DateTime<Tz> {
        clock()
            .timezone()
            .with_ymd_and_hms(2026, 3, 9, h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_phase_boundaries() {
        let clock = clock();
        assert_eq!(clock.phase_at(at(5, 59)), Phase::DayClose);
        assert_eq!(clock.phase_at(at(6, 0)), Phase::MorningCount);
        assert_eq!(clock.phase_at(at(8, 29)), Phase::MorningCount);
        assert_eq!(clock.phase_at(at(8, 30)), Phase::RealtimeMorning);
        assert_eq!(clock.phase_at(at(11, 54)), Phase::RealtimeMorning);
        assert_eq!(clock.phase_at(at(11, 55)), Phase::LunchBreak);
        assert_eq!(clock.phase_at(at(13, 14)), Phase::LunchBreak);
        assert_eq!(clock.phase_at(at(13, 15)), Phase::AfternoonMonitoring);
        assert_eq!(clock.phase_at(at(23, 58)), Phase::AfternoonMonitoring);
        assert_eq!(clock.phase_at(at(23, 59)), Phase::DayClose);
    }

    #[test]
    fn test_sessions() {
        let clock = clock();
        assert_eq!(clock.session_at(at(9, 0)), Some(Session::Morning));
        assert_eq!(clock.session_at(at(14, 0)), Some(Session::Afternoon));
        assert_eq!(clock.session_at(at(12, 0)), None);
        assert_eq!(clock.session_at(at(7, 0)), None);
    }

    #[test]
    fn test_session_start_bounds() {
        let clock = clock();
        let date = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
        assert_eq!(
            clock.session_start(date, Session::Morning).time(),
            NaiveTime::from_hms_opt(8, 30, 0).unwrap()
        );
        assert_eq!(
            clock.session_start(date, Session::Afternoon).time(),
            NaiveTime::from_hms_opt(13, 15, 0).unwrap()
        );
    }

    #[test]
    fn test_rejects_unknown_timezone() {
        let config = PhaseConfig {
            timezone: "Mars/Olympus_Mons".to_string(),
            ..Default::default()
        };
        assert!(PhaseClock::from_config(&config).is_err());
    }

    #[test]
    fn test_is_monitoring() {
        assert!(Phase::RealtimeMorning.is_monitoring());
        assert!(Phase::AfternoonMonitoring.is_monitoring());
        assert!(!Phase::MorningCount.is_monitoring());
        assert!(!Phase::LunchBreak.is_monitoring());
        assert!(!Phase::DayClose.is_monitoring());
    }
}
