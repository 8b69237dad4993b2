// src/export/retention.rs
//
// Deletes per-day workbooks that have aged out of the retention window.
// Temp files are left alone so a failed export can still be investigated,
// and the rolling summary is never touched.

use anyhow::Result;
use chrono::{Duration, NaiveDate};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::export::workbook::parse_daily_filename;

pub struct RetentionSweeper {
    daily_dir: PathBuf,
    retention_days: u32,
}

impl RetentionSweeper {
    pub fn new(daily_dir: impl Into<PathBuf>, retention_days: u32) -> Self {
        Self {
            daily_dir: daily_dir.into(),
            retention_days,
        }
    }

    /// Delete per-day workbooks with embedded date < today − retention.
    /// Returns the deleted filenames.
    pub fn run(&self, today: NaiveDate) -> Result<Vec<String>> {
        if !self.daily_dir.exists() {
            debug!("Daily export directory does not exist yet, nothing to sweep");
            return Ok(Vec::new());
        }
        let cutoff = today - Duration::days(self.retention_days as i64);
        let mut deleted = Vec::new();

        for entry in WalkDir::new(&self.daily_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(date) = parse_daily_filename(&name) else {
                continue;
            };
            if date >= cutoff {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    info!("Retention: deleted {} (cutoff {})", name, cutoff);
                    deleted.push(name);
                }
                Err(err) => warn!("Retention: could not delete {}: {}", name, err),
            }
        }
        if deleted.is_empty() {
            debug!("Retention: nothing older than {} day(s)", self.retention_days);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &TempDir, name: &str) {
        fs::write(dir.path().join(name), b"x").unwrap();
    }

    #[test]
    fn test_sweeps_only_expired_daily_workbooks() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "people_counter_2026-03-01.xlsx"); // expired
        touch(&dir, "people_counter_2026-03-03.xlsx"); // expired
        touch(&dir, "people_counter_2026-03-04.xlsx"); // on the cutoff, kept
        touch(&dir, "people_counter_2026-03-08.xlsx"); // recent
        touch(&dir, "people_counter_2026-03-01.tmp.xlsx"); // temp, kept
        touch(&dir, "people_counter_LAST_5_DAYS.xlsx"); // rolling, kept
        touch(&dir, "unrelated.xlsx");

        let sweeper = RetentionSweeper::new(dir.path(), 5);
        let today = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
        let mut deleted = sweeper.run(today).unwrap();
        deleted.sort();
        assert_eq!(
            deleted,
            vec![
                "people_counter_2026-03-01.xlsx",
                "people_counter_2026-03-03.xlsx"
            ]
        );

        assert!(dir.path().join("people_counter_2026-03-04.xlsx").exists());
        assert!(dir.path().join("people_counter_2026-03-08.xlsx").exists());
        assert!(dir.path().join("people_counter_2026-03-01.tmp.xlsx").exists());
        assert!(dir.path().join("people_counter_LAST_5_DAYS.xlsx").exists());
        assert!(dir.path().join("unrelated.xlsx").exists());
    }

    #[test]
    fn test_missing_directory_is_fine() {
        let dir = TempDir::new().unwrap();
        let sweeper = RetentionSweeper::new(dir.path().join("nowhere"), 5);
        let today = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
        assert!(sweeper.run(today).unwrap().is_empty());
    }

    #[test]
    fn test_idempotent_sweep() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "people_counter_2026-02-01.xlsx");
        let sweeper = RetentionSweeper::new(dir.path(), 5);
        let today = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
        assert_eq!(sweeper.run(today).unwrap().len(), 1);
        assert!(sweeper.run(today).unwrap().is_empty());
    }
}
