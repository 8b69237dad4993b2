// src/export/daily.rs
//
// Per-day workbook: people_counter_YYYY-MM-DD.xlsx, built entirely from
// store reads so it always reflects durable state, never in-memory
// counters. Written via the atomic temp-then-rename protocol.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rust_xlsxwriter::Workbook;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::export::workbook::{
    daily_filename, daily_tmp_filename, swap_into_place, Cell, ExportOutcome, SheetBuilder,
};
use crate::phase_clock::PhaseClock;
use crate::phase_manager::effective_baseline;
use crate::store::Store;
use crate::types::AlertStatus;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct DailyExporter {
    store: Arc<Store>,
    clock: PhaseClock,
    daily_dir: PathBuf,
}

impl DailyExporter {
    pub fn new(store: Arc<Store>, clock: PhaseClock, daily_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            clock,
            daily_dir: daily_dir.into(),
        }
    }

    /// Build and swap in the workbook for one date.
    pub fn run(&self, date: NaiveDate) -> Result<ExportOutcome> {
        fs::create_dir_all(&self.daily_dir)
            .with_context(|| format!("creating {}", self.daily_dir.display()))?;

        let mut workbook = Workbook::new();
        self.write_summary(&mut workbook, date)?;
        self.write_missing_periods(&mut workbook, date)?;
        self.write_alerts(&mut workbook, date)?;
        self.write_events(&mut workbook, date)?;

        let tmp = self.daily_dir.join(daily_tmp_filename(date));
        let dest = self.daily_dir.join(daily_filename(date));
        workbook
            .save(&tmp)
            .with_context(|| format!("writing {}", tmp.display()))?;

        let outcome = swap_into_place(&tmp, &dest)?;
        if matches!(outcome, ExportOutcome::Written) {
            info!("📄 Daily workbook exported: {}", dest.display());
        }
        Ok(outcome)
    }

    fn write_summary(&self, workbook: &mut Workbook, date: NaiveDate) -> Result<()> {
        let baseline = effective_baseline(&self.store, &self.clock, date)?;
        let (ins, outs) = self.store.counts_for_date(date)?;
        let present = (ins - outs).max(0);
        let missing = (baseline - present).max(0);
        let last_updated = match self.store.daily_state(date)? {
            Some(state) => state.updated_at.format(TIME_FORMAT).to_string(),
            None => self.clock.now().format(TIME_FORMAT).to_string(),
        };

        let mut sheet = SheetBuilder::new(
            workbook.add_worksheet(),
            "SUMMARY",
            &[
                "Date",
                "Total Morning",
                "Current Realtime",
                "Current Missing",
                "Last Updated",
            ],
        )?;
        sheet.append_row(&[
            Cell::Text(date.to_string()),
            Cell::Int(baseline),
            Cell::Int(present),
            Cell::Int(missing),
            Cell::Text(last_updated),
        ])?;
        sheet.finish()
    }

    fn write_missing_periods(&self, workbook: &mut Workbook, date: NaiveDate) -> Result<()> {
        let mut sheet = SheetBuilder::new(
            workbook.add_worksheet(),
            "MISSING_PERIODS",
            &["Start Time", "End Time", "Duration (minutes)"],
        )?;
        for period in self.store.missing_periods_for_date(date)? {
            sheet.append_row(&[
                Cell::Text(period.start_time.format(TIME_FORMAT).to_string()),
                match period.end_time {
                    Some(end) => Cell::Text(end.format(TIME_FORMAT).to_string()),
                    None => Cell::Empty,
                },
                match period.duration_minutes {
                    Some(minutes) => Cell::Int(minutes),
                    None => Cell::Empty,
                },
            ])?;
        }
        sheet.finish()
    }

    fn write_alerts(&self, workbook: &mut Workbook, date: NaiveDate) -> Result<()> {
        let mut sheet = SheetBuilder::new(
            workbook.add_worksheet(),
            "ALERTS",
            &["Alert Time", "Total Morning", "Realtime", "Missing"],
        )?;
        for alert in self.store.alerts_for_date(date)? {
            if alert.status != AlertStatus::Sent {
                continue;
            }
            sheet.append_row(&[
                Cell::Text(alert.alert_time.format(TIME_FORMAT).to_string()),
                Cell::Int(alert.expected_total),
                Cell::Int(alert.current_total),
                Cell::Int(alert.missing),
            ])?;
        }
        sheet.finish()
    }

    fn write_events(&self, workbook: &mut Workbook, date: NaiveDate) -> Result<()> {
        let mut sheet = SheetBuilder::new(
            workbook.add_worksheet(),
            "EVENTS",
            &["Event Time", "Direction", "Camera"],
        )?;
        for event in self.store.events_for_date(date)? {
            sheet.append_row(&[
                Cell::Text(event.event_time.format(TIME_FORMAT).to_string()),
                Cell::Text(event.direction.as_str().to_string()),
                Cell::Text(event.camera_id),
            ])?;
        }
        sheet.finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PhaseConfig;
    use crate::types::{DailyStatePatch, Session};
    use calamine::{open_workbook, Data, DataType, Reader, Xlsx};
    use chrono::{DateTime, TimeZone};
    use chrono_tz::Tz;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<Store>, PhaseClock, DailyExporter) {
        let dir = TempDir::new().unwrap();
        let store =
            Arc::new(Store::open(dir.path().join("test.db"), dir.path().join("backup")).unwrap());
        let clock = PhaseClock::from_config(&PhaseConfig::default()).unwrap();
        let exporter = DailyExporter::new(store.clone(), clock.clone(), dir.path().join("daily"));
        (dir, store, clock, exporter)
    }

    fn at(clock: &PhaseClock, h: u32, m: u32) -> DateTime<Tz> {
        clock
            .timezone()
            .with_ymd_and_hms(2026, 3, 9, h, m, 0)
            .unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 9).unwrap()
    }

    fn seed(store: &Store, clock: &PhaseClock) {
        for i in 0..5 {
            store.append_event(at(clock, 7, i), "IN", "camera_01", Some(i as i64)).unwrap();
        }
        store.append_event(at(clock, 8, 0), "OUT", "camera_01", Some(9)).unwrap();
        store
            .upsert_daily_state(
                date(),
                DailyStatePatch {
                    total_morning: Some(4),
                    is_frozen: Some(true),
                    realtime_in: Some(5),
                    realtime_out: Some(1),
                },
                at(clock, 8, 30),
            )
            .unwrap();
        store.append_event(at(clock, 9, 0), "OUT", "camera_01", Some(2)).unwrap();
        let id = store
            .open_missing_period(date(), Session::Morning, at(clock, 9, 0))
            .unwrap();
        store.update_missing_period(id, 1).unwrap();
        store
            .append_alert(at(clock, 9, 30), date(), 4, 3, 1, AlertStatus::Skipped, Some("cooldown"))
            .unwrap();
        store
            .append_alert(at(clock, 10, 0), date(), 4, 3, 1, AlertStatus::Sent, None)
            .unwrap();
    }

    fn int_cell(row: &[Data], idx: usize) -> i64 {
        row[idx]
            .get_float()
            .map(|f| f.round() as i64)
            .or_else(|| row[idx].get_int())
            .unwrap()
    }

    #[test]
    fn test_export_produces_all_sheets_with_expected_values() {
        let (dir, store, clock, exporter) = setup();
        seed(&store, &clock);

        let outcome = exporter.run(date()).unwrap();
        assert!(matches!(outcome, ExportOutcome::Written));

        let path = dir.path().join("daily").join("people_counter_2026-03-09.xlsx");
        let mut workbook: Xlsx<_> = open_workbook(&path).unwrap();
        assert_eq!(
            workbook.sheet_names(),
            vec!["SUMMARY", "MISSING_PERIODS", "ALERTS", "EVENTS"]
        );

        let summary = workbook.worksheet_range("SUMMARY").unwrap();
        let rows: Vec<_> = summary.rows().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][0].to_string(), "2026-03-09");
        assert_eq!(int_cell(rows[1], 1), 4); // Total Morning (frozen)
        assert_eq!(int_cell(rows[1], 2), 3); // Current Realtime
        assert_eq!(int_cell(rows[1], 3), 1); // Current Missing

        let periods = workbook.worksheet_range("MISSING_PERIODS").unwrap();
        let rows: Vec<_> = periods.rows().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][0].to_string(), "2026-03-09 09:00:00");
        assert!(rows[1][1].is_empty()); // still open

        // Only the sent alert appears, not the skip.
        let alerts = workbook.worksheet_range("ALERTS").unwrap();
        assert_eq!(alerts.rows().count(), 2);

        let events = workbook.worksheet_range("EVENTS").unwrap();
        let rows: Vec<_> = events.rows().collect();
        assert_eq!(rows.len(), 8); // header + 7 events
        assert_eq!(rows[1][1].to_string(), "IN");
        assert_eq!(rows[7][1].to_string(), "OUT");
    }

    #[test]
    fn test_summary_recomputes_unfrozen_baseline_from_events() {
        let (dir, store, clock, exporter) = setup();
        // Morning events exist but the state row never froze (crash shape).
        for i in 0..3 {
            store.append_event(at(&clock, 7, i), "IN", "camera_01", None).unwrap();
        }
        exporter.run(date()).unwrap();

        let path = dir.path().join("daily").join("people_counter_2026-03-09.xlsx");
        let mut workbook: Xlsx<_> = open_workbook(&path).unwrap();
        let summary = workbook.worksheet_range("SUMMARY").unwrap();
        let rows: Vec<_> = summary.rows().collect();
        assert_eq!(int_cell(rows[1], 1), 3);
    }

    #[test]
    fn test_export_twice_is_stable() {
        let (dir, store, clock, exporter) = setup();
        seed(&store, &clock);

        exporter.run(date()).unwrap();
        let outcome = exporter.run(date()).unwrap();
        assert!(matches!(outcome, ExportOutcome::Written));

        let daily = dir.path().join("daily");
        let entries: Vec<_> = std::fs::read_dir(&daily)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        // Second run replaced the file and left no temp behind.
        assert_eq!(entries, vec!["people_counter_2026-03-09.xlsx"]);
    }

    #[test]
    fn test_empty_date_still_exports() {
        let (dir, _store, _clock, exporter) = setup();
        exporter.run(date()).unwrap();

        let path = dir.path().join("daily").join("people_counter_2026-03-09.xlsx");
        let mut workbook: Xlsx<_> = open_workbook(&path).unwrap();
        let summary = workbook.worksheet_range("SUMMARY").unwrap();
        let rows: Vec<_> = summary.rows().collect();
        assert_eq!(int_cell(rows[1], 1), 0);
        assert_eq!(int_cell(rows[1], 3), 0);
        assert_eq!(workbook.worksheet_range("EVENTS").unwrap().rows().count(), 1);
    }
}
