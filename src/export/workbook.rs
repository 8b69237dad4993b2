// src/export/workbook.rs
//
// Shared workbook plumbing for the exporters: header styling, capped
// column auto-fit, the atomic temp-then-rename protocol, and the daily
// filename convention.

use anyhow::Result;
use chrono::NaiveDate;
use rust_xlsxwriter::{Color, Format, FormatAlign, Worksheet};
use std::fs;
use std::io;
use std::path::Path;
use tracing::warn;

const HEADER_FILL: u32 = 0x366092;
const MAX_COLUMN_WIDTH: f64 = 50.0;

/// Result of one export attempt.
#[derive(Debug)]
pub enum ExportOutcome {
    Written,
    /// The destination is open in a spreadsheet app; the temp file was
    /// kept so the next cadence (or an operator) can finish the swap.
    SkippedLocked,
}

/// Outcome of the temp-then-rename swap.
#[derive(Debug)]
pub enum ReplaceOutcome {
    Ok,
    Locked,
    IoError(io::Error),
}

/// Replace `dest` with `tmp` as close to atomically as the platform
/// allows. A destination held open by an operator's spreadsheet app shows
/// up as `Locked`, which is a recoverable condition, not an error.
pub fn try_replace(tmp: &Path, dest: &Path) -> ReplaceOutcome {
    if dest.exists() {
        if let Err(err) = fs::remove_file(dest) {
            return match err.kind() {
                io::ErrorKind::PermissionDenied => ReplaceOutcome::Locked,
                _ => ReplaceOutcome::IoError(err),
            };
        }
    }
    match fs::rename(tmp, dest) {
        Ok(()) => ReplaceOutcome::Ok,
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => ReplaceOutcome::Locked,
        Err(err) => ReplaceOutcome::IoError(err),
    }
}

pub fn daily_filename(date: NaiveDate) -> String {
    format!("people_counter_{date}.xlsx")
}

pub fn daily_tmp_filename(date: NaiveDate) -> String {
    format!("people_counter_{date}.tmp.xlsx")
}

pub fn rolling_filename(days: u32) -> String {
    format!("people_counter_LAST_{days}_DAYS.xlsx")
}

pub fn rolling_tmp_filename(days: u32) -> String {
    format!("people_counter_LAST_{days}_DAYS.tmp.xlsx")
}

/// Parse the date embedded in a per-day workbook filename. Temp files and
/// the rolling summary never parse.
pub fn parse_daily_filename(name: &str) -> Option<NaiveDate> {
    let stem = name.strip_suffix(".xlsx")?;
    if stem.ends_with(".tmp") {
        return None;
    }
    let date_part = stem.strip_prefix("people_counter_")?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

/// One workbook cell.
#[derive(Debug, Clone)]
pub enum Cell {
    Text(String),
    Int(i64),
    Empty,
}

/// Incrementally fills a worksheet and applies the shared formatting
/// contract on finish: bold white-on-dark header, frozen header row,
/// autofilter over the data, column widths fit to content (capped).
pub struct SheetBuilder<'a> {
    worksheet: &'a mut Worksheet,
    widths: Vec<f64>,
    next_row: u32,
}

impl<'a> SheetBuilder<'a> {
    pub fn new(worksheet: &'a mut Worksheet, name: &str, headers: &[&str]) -> Result<Self> {
        worksheet.set_name(name)?;
        let header_format = Format::new()
            .set_bold()
            .set_font_color(Color::White)
            .set_background_color(Color::RGB(HEADER_FILL))
            .set_align(FormatAlign::Center);
        let mut widths = Vec::with_capacity(headers.len());
        for (col, header) in headers.iter().enumerate() {
            worksheet.write_string_with_format(0, col as u16, *header, &header_format)?;
            widths.push(header.len() as f64);
        }
        Ok(Self {
            worksheet,
            widths,
            next_row: 1,
        })
    }

    pub fn append_row(&mut self, cells: &[Cell]) -> Result<()> {
        for (col, cell) in cells.iter().enumerate() {
            let width = match cell {
                Cell::Text(s) => {
                    self.worksheet
                        .write_string(self.next_row, col as u16, s.as_str())?;
                    s.len() as f64
                }
                Cell::Int(v) => {
                    self.worksheet
                        .write_number(self.next_row, col as u16, *v as f64)?;
                    v.to_string().len() as f64
                }
                Cell::Empty => 0.0,
            };
            if col < self.widths.len() && width > self.widths[col] {
                self.widths[col] = width;
            }
        }
        self.next_row += 1;
        Ok(())
    }

    pub fn finish(self) -> Result<()> {
        let last_col = self.widths.len().saturating_sub(1) as u16;
        let last_row = self.next_row.saturating_sub(1);
        for (col, width) in self.widths.iter().enumerate() {
            self.worksheet
                .set_column_width(col as u16, (width + 2.0).min(MAX_COLUMN_WIDTH))?;
        }
        self.worksheet.set_freeze_panes(1, 0)?;
        self.worksheet.autofilter(0, 0, last_row, last_col)?;
        Ok(())
    }
}

/// Shared tail of both exporters: swap the finished temp file in, keeping
/// it around when the destination is locked.
pub fn swap_into_place(tmp: &Path, dest: &Path) -> Result<ExportOutcome> {
    match try_replace(tmp, dest) {
        ReplaceOutcome::Ok => Ok(ExportOutcome::Written),
        ReplaceOutcome::Locked => {
            warn!(
                "Export skipped (locked): {} is open elsewhere, temp file kept at {}",
                dest.display(),
                tmp.display()
            );
            Ok(ExportOutcome::SkippedLocked)
        }
        ReplaceOutcome::IoError(err) => {
            Err(anyhow::Error::new(err).context(format!("replacing {}", dest.display())))
        }
    }
}
