// src/phase_manager.rs
//
// Applies phase transitions on a one-minute tick: daily reset, morning
// baseline accumulation and freeze, shortfall (missing period) tracking,
// and day close. Every tick recomputes from the store, so a missed or
// repeated tick is harmless.

use anyhow::Result;
use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;
use std::sync::Arc;
use tracing::{info, warn};

use crate::phase_clock::{Phase, PhaseClock};
use crate::store::Store;
use crate::types::DailyStatePatch;

/// State changes worth acting on outside the manager (workbook creation,
/// finalization, retention). Returned from `tick` and routed by the
/// scheduler, in the spirit of a pipeline event bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseTransition {
    /// A fresh DailyState row was created for the date.
    DailyReset { date: NaiveDate },
    /// The morning baseline froze.
    BaselineFrozen { date: NaiveDate, total_morning: i64 },
    /// A phase boundary not already covered above (lunch start/end etc.);
    /// the exporters refresh at every boundary.
    PhaseChanged { date: NaiveDate, phase: Phase },
    /// The day closed; artefacts for the date should be finalized.
    DayClosed { date: NaiveDate },
}

pub struct PhaseManager {
    store: Arc<Store>,
    clock: PhaseClock,
    /// False until the first monitoring-phase tick this process has run.
    /// A shortfall witnessed on that very first tick predates the restart,
    /// so its period start aligns to the session start instead of `now`.
    seen_monitoring_tick: bool,
    /// Advisory guard against re-announcing DayClosed every minute after
    /// 23:59. The store-side effects are idempotent regardless.
    announced_close: Option<NaiveDate>,
    /// Last phase observed, for boundary detection.
    last_phase: Option<Phase>,
}

impl PhaseManager {
    pub fn new(store: Arc<Store>, clock: PhaseClock) -> Self {
        Self {
            store,
            clock,
            seen_monitoring_tick: false,
            announced_close: None,
            last_phase: None,
        }
    }

    /// One scheduler tick. Idempotent: running it twice back-to-back with
    /// no new events leaves the store unchanged.
    pub fn tick(&mut self, now: DateTime<Tz>) -> Result<Vec<PhaseTransition>> {
        let date = now.date_naive();
        let phase = self.clock.phase_at(now);
        let mut transitions = Vec::new();

        // Before the daily reset the date has no state of its own yet.
        if now < self.clock.reset_at(date) {
            return Ok(transitions);
        }

        // Daily reset: the first tick at or after reset_time creates a
        // fresh row for today.
        if self.store.daily_state(date)?.is_none() {
            self.store.upsert_daily_state(
                date,
                DailyStatePatch {
                    total_morning: Some(0),
                    is_frozen: Some(false),
                    realtime_in: Some(0),
                    realtime_out: Some(0),
                },
                now,
            )?;
            info!("🌅 Daily reset: fresh state for {}", date);
            transitions.push(PhaseTransition::DailyReset { date });
        }

        match phase {
            Phase::MorningCount => {
                let (ins, outs) = self
                    .store
                    .counts_in_window(self.clock.reset_at(date), now)?;
                self.store.upsert_daily_state(
                    date,
                    DailyStatePatch {
                        total_morning: Some((ins - outs).max(0)),
                        realtime_in: Some(ins),
                        realtime_out: Some(outs),
                        ..Default::default()
                    },
                    now,
                )?;
            }
            Phase::RealtimeMorning | Phase::AfternoonMonitoring => {
                self.freeze_if_due(date, now, &mut transitions)?;
                self.track_missing(date, now)?;
            }
            Phase::LunchBreak => {
                // A service started during lunch still owes the freeze.
                // An open morning period is left untouched: lunch neither
                // closes it nor advances its observed shortfall.
                self.freeze_if_due(date, now, &mut transitions)?;
            }
            Phase::DayClose => {
                if let Some(open) = self.store.active_missing_period(date)? {
                    self.store.close_missing_period(open.id, now)?;
                    info!(
                        "Missing period {} closed at day close (shortfall never recovered)",
                        open.id
                    );
                }
                if self.announced_close != Some(date) {
                    transitions.push(PhaseTransition::DayClosed { date });
                    self.announced_close = Some(date);
                }
            }
        }

        if let Some(previous) = self.last_phase {
            if previous != phase {
                info!("Phase changed: {} -> {}", previous, phase);
                // Reset, freeze and close already announce themselves; the
                // remaining boundaries still refresh the artefacts.
                if transitions.is_empty() {
                    transitions.push(PhaseTransition::PhaseChanged { date, phase });
                }
            }
        }
        self.last_phase = Some(phase);

        if phase.is_monitoring() {
            self.seen_monitoring_tick = true;
        }
        Ok(transitions)
    }

    /// Freeze the baseline on the first tick at or after morning_end.
    fn freeze_if_due(
        &mut self,
        date: NaiveDate,
        now: DateTime<Tz>,
        transitions: &mut Vec<PhaseTransition>,
    ) -> Result<()> {
        let state = self.store.daily_state(date)?;
        if state.map_or(false, |s| s.is_frozen) {
            return Ok(());
        }
        let (ins, outs) = self.store.counts_in_window(
            self.clock.reset_at(date),
            self.clock.morning_end_at(date),
        )?;
        let total_morning = (ins - outs).max(0);
        self.store.upsert_daily_state(
            date,
            DailyStatePatch {
                total_morning: Some(total_morning),
                is_frozen: Some(true),
                ..Default::default()
            },
            now,
        )?;
        info!("🧊 Morning baseline frozen for {}: {}", date, total_morning);
        transitions.push(PhaseTransition::BaselineFrozen {
            date,
            total_morning,
        });
        Ok(())
    }

    /// Shortfall bookkeeping for a monitoring tick.
    fn track_missing(&mut self, date: NaiveDate, now: DateTime<Tz>) -> Result<()> {
        let baseline = effective_baseline(&self.store, &self.clock, date)?;
        let (ins, outs) = self.store.counts_for_date(date)?;
        self.store.upsert_daily_state(
            date,
            DailyStatePatch {
                realtime_in: Some(ins),
                realtime_out: Some(outs),
                ..Default::default()
            },
            now,
        )?;

        let present = (ins - outs).max(0);
        let missing = (baseline - present).max(0);
        let open = self.store.active_missing_period(date)?;

        match (missing > 0, open) {
            (true, Some(period)) => {
                // Never reset start_time or duration; only the witnessed
                // shortfall rolls forward.
                self.store.update_missing_period(period.id, missing)?;
            }
            (true, None) => {
                let Some(session) = self.clock.session_at(now) else {
                    return Ok(());
                };
                let start = if self.seen_monitoring_tick {
                    now
                } else {
                    // Shortfall already present at the first tick after a
                    // restart: it predates us, so date it from the session
                    // start rather than from our own boot time.
                    self.clock.session_start(date, session)
                };
                let id = self.store.open_missing_period(date, session, start)?;
                self.store.update_missing_period(id, missing)?;
                warn!(
                    "Missing period opened: session={}, missing={} (baseline={}, present={})",
                    session, missing, baseline, present
                );
            }
            (false, Some(period)) => {
                // Shortfall returned to zero; a mere decrease keeps the
                // period open.
                self.store.close_missing_period(period.id, now)?;
                info!("Missing period {} closed: occupancy recovered", period.id);
            }
            (false, None) => {}
        }
        Ok(())
    }
}

/// The reference head-count for shortfall math: the frozen morning total
/// when it is non-zero, else a recomputation over the morning window. The
/// recomputation recovers from a crash that happened before the freeze.
pub fn effective_baseline(store: &Store, clock: &PhaseClock, date: NaiveDate) -> Result<i64> {
    if let Some(state) = store.daily_state(date)? {
        if state.is_frozen && state.total_morning > 0 {
            return Ok(state.total_morning);
        }
    }
    let (ins, outs) = store.counts_in_window(clock.reset_at(date), clock.morning_end_at(date))?;
    Ok((ins - outs).max(0))
}

// ============================================================================
// TESTS
// ============================================================================
