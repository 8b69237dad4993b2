// src/export/rolling.rs
//
// Rolling multi-day summary: people_counter_LAST_N_DAYS.xlsx, merged from
// the per-day workbooks already on disk. The per-day files are the
// attested, operator-visible artefacts; rebuilding from them (never from
// the store) keeps the summary in agreement with what operators see.

use anyhow::{Context, Result};
use calamine::{open_workbook, Data, DataType, Reader, Xlsx};
use chrono::NaiveDate;
use rust_xlsxwriter::Workbook;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::export::workbook::{
    parse_daily_filename, rolling_filename, rolling_tmp_filename, swap_into_place, Cell,
    ExportOutcome, SheetBuilder,
};

pub struct RollingExporter {
    daily_dir: PathBuf,
    summary_dir: PathBuf,
    rolling_days: u32,
}

/// Everything the rolling summary needs from one per-day workbook.
#[derive(Debug)]
struct DailyData {
    date: String,
    total_morning: i64,
    current_realtime: i64,
    current_missing: i64,
    last_updated: String,
    /// Highest and lowest net occupancy replayed from the EVENTS sheet.
    max_realtime: i64,
    min_realtime: i64,
    alerts: Vec<(String, i64, i64, i64)>,
    missing_periods: Vec<(String, String, Option<i64>)>,
}

impl RollingExporter {
    pub fn new(
        daily_dir: impl Into<PathBuf>,
        summary_dir: impl Into<PathBuf>,
        rolling_days: u32,
    ) -> Self {
        Self {
            daily_dir: daily_dir.into(),
            summary_dir: summary_dir.into(),
            rolling_days,
        }
    }

    pub fn run(&self) -> Result<Option<ExportOutcome>> {
        let files = list_daily_workbooks(&self.daily_dir, self.rolling_days as usize);
        if files.is_empty() {
            warn!("No per-day workbooks found, rolling summary not built");
            return Ok(None);
        }

        let mut days = Vec::with_capacity(files.len());
        for (date, path) in &files {
            match read_daily_workbook(path, *date) {
                Ok(data) => days.push(data),
                Err(err) => {
                    // One unreadable file must not block the others.
                    error!("Skipping unreadable workbook {}: {:#}", path.display(), err);
                }
            }
        }
        if days.is_empty() {
            warn!("No readable per-day workbooks, rolling summary not built");
            return Ok(None);
        }

        fs::create_dir_all(&self.summary_dir)
            .with_context(|| format!("creating {}", self.summary_dir.display()))?;

        let mut workbook = Workbook::new();
        self.write_daily_summary(&mut workbook, &days)?;
        self.write_daily_alerts(&mut workbook, &days)?;
        self.write_daily_missing_periods(&mut workbook, &days)?;

        let tmp = self.summary_dir.join(rolling_tmp_filename(self.rolling_days));
        let dest = self.summary_dir.join(rolling_filename(self.rolling_days));
        workbook
            .save(&tmp)
            .with_context(|| format!("writing {}", tmp.display()))?;

        let outcome = swap_into_place(&tmp, &dest)?;
        if matches!(outcome, ExportOutcome::Written) {
            info!(
                "📊 Rolling summary exported: {} ({} day(s))",
                dest.display(),
                days.len()
            );
        }
        Ok(Some(outcome))
    }

    fn write_daily_summary(&self, workbook: &mut Workbook, days: &[DailyData]) -> Result<()> {
        let mut sheet = SheetBuilder::new(
            workbook.add_worksheet(),
            "DAILY_SUMMARY",
            &[
                "Date",
                "Total Morning",
                "Current Realtime",
                "Current Missing",
                "Max Realtime",
                "Min Realtime",
                "Last Updated",
            ],
        )?;
        for day in days {
            sheet.append_row(&[
                Cell::Text(day.date.clone()),
                Cell::Int(day.total_morning),
                Cell::Int(day.current_realtime),
                Cell::Int(day.current_missing),
                Cell::Int(day.max_realtime),
                Cell::Int(day.min_realtime),
                Cell::Text(day.last_updated.clone()),
            ])?;
        }
        sheet.finish()
    }

    fn write_daily_alerts(&self, workbook: &mut Workbook, days: &[DailyData]) -> Result<()> {
        let mut sheet = SheetBuilder::new(
            workbook.add_worksheet(),
            "DAILY_ALERTS",
            &["Date", "Alert Time", "Total Morning", "Realtime", "Missing"],
        )?;
        for day in days {
            for (alert_time, total, realtime, missing) in &day.alerts {
                sheet.append_row(&[
                    Cell::Text(day.date.clone()),
                    Cell::Text(alert_time.clone()),
                    Cell::Int(*total),
                    Cell::Int(*realtime),
                    Cell::Int(*missing),
                ])?;
            }
        }
        sheet.finish()
    }

    fn write_daily_missing_periods(&self, workbook: &mut Workbook, days: &[DailyData]) -> Result<()> {
        let mut sheet = SheetBuilder::new(
            workbook.add_worksheet(),
            "DAILY_MISSING_PERIODS",
            &["Date", "Start Time", "End Time", "Duration (minutes)"],
        )?;
        for day in days {
            for (start, end, duration) in &day.missing_periods {
                sheet.append_row(&[
                    Cell::Text(day.date.clone()),
                    Cell::Text(start.clone()),
                    Cell::Text(end.clone()),
                    match duration {
                        Some(minutes) => Cell::Int(*minutes),
                        None => Cell::Empty,
                    },
                ])?;
            }
        }
        sheet.finish()
    }
}

/// The most recent `limit` per-day workbooks, date ascending. Temp files
/// and the rolling summary itself never qualify.
pub fn list_daily_workbooks(daily_dir: &Path, limit: usize) -> Vec<(NaiveDate, PathBuf)> {
    let mut files: Vec<(NaiveDate, PathBuf)> = WalkDir::new(daily_dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let date = parse_daily_filename(&entry.file_name().to_string_lossy())?;
            Some((date, entry.into_path()))
        })
        .collect();
    files.sort_by_key(|(date, _)| *date);
    if files.len() > limit {
        files.drain(..files.len() - limit);
    }
    files
}

fn read_daily_workbook(path: &Path, date: NaiveDate) -> Result<DailyData> {
    let mut workbook: Xlsx<_> =
        open_workbook(path).with_context(|| format!("opening {}", path.display()))?;

    let summary = workbook
        .worksheet_range("SUMMARY")
        .context("reading SUMMARY sheet")?;
    let summary_row = summary
        .rows()
        .nth(1)
        .context("SUMMARY sheet has no data row")?
        .to_vec();

    let mut data = DailyData {
        date: cell_text(&summary_row, 0, &date.to_string()),
        total_morning: cell_int(&summary_row, 1).unwrap_or(0),
        current_realtime: cell_int(&summary_row, 2).unwrap_or(0),
        current_missing: cell_int(&summary_row, 3).unwrap_or(0),
        last_updated: cell_text(&summary_row, 4, ""),
        max_realtime: 0,
        min_realtime: 0,
        alerts: Vec::new(),
        missing_periods: Vec::new(),
    };

    let alerts = workbook
        .worksheet_range("ALERTS")
        .context("reading ALERTS sheet")?;
    for row in alerts.rows().skip(1) {
        data.alerts.push((
            cell_text(row, 0, ""),
            cell_int(row, 1).unwrap_or(0),
            cell_int(row, 2).unwrap_or(0),
            cell_int(row, 3).unwrap_or(0),
        ));
    }

    let periods = workbook
        .worksheet_range("MISSING_PERIODS")
        .context("reading MISSING_PERIODS sheet")?;
    for row in periods.rows().skip(1) {
        data.missing_periods.push((
            cell_text(row, 0, ""),
            cell_text(row, 1, ""),
            cell_int(row, 2),
        ));
    }

    // Replay the event tape to recover the day's occupancy envelope.
    let events = workbook
        .worksheet_range("EVENTS")
        .context("reading EVENTS sheet")?;
    let mut net: i64 = 0;
    for row in events.rows().skip(1) {
        match cell_text(row, 1, "").as_str() {
            "IN" => net += 1,
            "OUT" => net -= 1,
            _ => continue,
        }
        data.max_realtime = data.max_realtime.max(net);
        data.min_realtime = data.min_realtime.min(net);
    }

    Ok(data)
}

fn cell_text(row: &[Data], idx: usize, fallback: &str) -> String {
    match row.get(idx) {
        None => fallback.to_string(),
        Some(cell) if cell.is_empty() => fallback.to_string(),
        Some(cell) => cell.to_string(),
    }
}

fn cell_int(row: &[Data], idx: usize) -> Option<i64> {
    let cell = row.get(idx)?;
    cell.get_float()
        .map(|f| f.round() as i64)
        .or_else(|| cell.get_int())
}

// ============================================================================
// TESTS
// ============================================================================
