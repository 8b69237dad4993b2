// src/store.rs
//
// Durable SQLite storage for events, daily state, missing periods and alert
// logs. The store is the single source of truth: in-memory counters anywhere
// else in the process are advisory and must be refuted by a read here before
// any consequential decision.
//
// Write path is single-writer behind a mutex; WAL mode keeps concurrent
// reads cheap. Every write commits before the call returns.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate};
use chrono_tz::Tz;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::types::{
    AlertRecord, AlertStatus, DailyState, DailyStatePatch, Direction, EventRecord, MissingPeriod,
    Session,
};

const REQUIRED_TABLES: [&str; 4] = ["events", "daily_state", "missing_periods", "alert_logs"];

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    event_time  TEXT NOT NULL,
    direction   TEXT NOT NULL CHECK(direction IN ('IN','OUT')),
    camera_id   TEXT NOT NULL,
    track_id    INTEGER,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS daily_state (
    date           TEXT PRIMARY KEY,
    total_morning  INTEGER NOT NULL DEFAULT 0,
    is_frozen      INTEGER NOT NULL DEFAULT 0,
    realtime_in    INTEGER NOT NULL DEFAULT 0,
    realtime_out   INTEGER NOT NULL DEFAULT 0,
    updated_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS missing_periods (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    date              TEXT NOT NULL,
    session           TEXT NOT NULL CHECK(session IN ('morning','afternoon')),
    start_time        TEXT NOT NULL,
    end_time          TEXT,
    duration_minutes  INTEGER,
    missing_observed  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS alert_logs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    alert_time      TEXT NOT NULL,
    date            TEXT NOT NULL,
    expected_total  INTEGER NOT NULL,
    current_total   INTEGER NOT NULL,
    missing         INTEGER NOT NULL,
    status          TEXT NOT NULL,
    reason          TEXT,
    created_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_event_time ON events(event_time);
CREATE INDEX IF NOT EXISTS idx_missing_periods_date ON missing_periods(date);
CREATE INDEX IF NOT EXISTS idx_alert_logs_date ON alert_logs(date);
"#;

pub struct Store {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
    backup_dir: PathBuf,
}

impl Store {
    /// Open (creating if necessary) the database, run schema init and the
    /// startup verification. A failure here is fatal for the service.
    pub fn open(db_path: impl AsRef<Path>, backup_dir: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let backup_dir = backup_dir.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {}", parent.display()))?;
            }
        }
        fs::create_dir_all(&backup_dir)
            .with_context(|| format!("creating backup directory {}", backup_dir.display()))?;

        let conn = Connection::open(&db_path)
            .with_context(|| format!("opening database {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL mode")?;
        conn.execute_batch(SCHEMA).context("initializing schema")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
            backup_dir,
        };
        store.verify()?;
        Ok(store)
    }

    /// Startup verification: every required table must exist. Logs the
    /// absolute storage path and per-table row counts for diagnostics.
    fn verify(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        let absolute = self
            .db_path
            .canonicalize()
            .unwrap_or_else(|_| self.db_path.clone());
        info!("Database path: {}", absolute.display());

        for table in REQUIRED_TABLES {
            let exists: bool = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name = ?1")?
                .exists(params![table])?;
            if !exists {
                bail!("required table {table:?} is missing, refusing to start");
            }
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            info!("Table {}: {} row(s)", table, count);
        }
        info!("✓ Database verification passed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Append one gate crossing. The direction is normalized to upper case;
    /// anything other than IN/OUT is rejected. Returns the assigned id.
    pub fn append_event(
        &self,
        event_time: DateTime<Tz>,
        direction: &str,
        camera_id: &str,
        track_id: Option<i64>,
    ) -> Result<i64> {
        let direction = Direction::parse(direction)?;
        let timestamp = event_time.to_rfc3339();

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO events (event_time, direction, camera_id, track_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![timestamp, direction.as_str(), camera_id, track_id, timestamp],
        )?;
        let id = conn.last_insert_rowid();
        debug!(
            "Event appended: id={}, direction={}, camera={}, track={:?}",
            id, direction, camera_id, track_id
        );
        Ok(id)
    }

    /// Total number of events ever recorded.
    pub fn event_count(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Write-path probe: if no event has ever been recorded, insert a
    /// synthetic IN marker under camera_id "self_test". Run once, shortly
    /// after startup, so the end-to-end write path is proven without
    /// waiting for the first real crossing.
    pub fn insert_self_test_marker(&self, now: DateTime<Tz>) -> Result<bool> {
        if self.event_count()? > 0 {
            return Ok(false);
        }
        self.append_event(now, "IN", "self_test", None)?;
        info!("🔎 Self-test marker inserted (events table was empty)");
        Ok(true)
    }

    /// All events for a local calendar date, ordered by time.
    pub fn events_for_date(&self, date: NaiveDate) -> Result<Vec<EventRecord>> {
        let date_str = date.format("%Y-%m-%d").to_string();
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, event_time, direction, camera_id, track_id
             FROM events
             WHERE substr(event_time, 1, 10) = ?1
             ORDER BY event_time ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![date_str], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, ts, dir, camera_id, track_id)| {
                Ok(EventRecord {
                    id,
                    event_time: parse_ts(&ts)?,
                    direction: Direction::parse(&dir)?,
                    camera_id,
                    track_id,
                })
            })
            .collect()
    }

    /// (IN, OUT) counts over a local calendar date.
    pub fn counts_for_date(&self, date: NaiveDate) -> Result<(i64, i64)> {
        let date_str = date.format("%Y-%m-%d").to_string();
        let conn = self.conn.lock().unwrap();
        let counts = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN direction = 'IN' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN direction = 'OUT' THEN 1 ELSE 0 END), 0)
             FROM events
             WHERE substr(event_time, 1, 10) = ?1",
            params![date_str],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(counts)
    }

    /// (IN, OUT) counts over a half-open time window `[start, end)`.
    ///
    /// Timestamps are stored as RFC-3339 with the service offset, so string
    /// comparison is chronological within one deployment.
    pub fn counts_in_window(&self, start: DateTime<Tz>, end: DateTime<Tz>) -> Result<(i64, i64)> {
        let conn = self.conn.lock().unwrap();
        let counts = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN direction = 'IN' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN direction = 'OUT' THEN 1 ELSE 0 END), 0)
             FROM events
             WHERE event_time >= ?1 AND event_time < ?2",
            params![start.to_rfc3339(), end.to_rfc3339()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(counts)
    }

    /// Fallback JSONL capture for an event the database refused. Operators
    /// can replay the backup file by hand; the loss marker in the log points
    /// them at it.
    pub fn write_backup_event(
        &self,
        event_time: DateTime<Tz>,
        direction: &str,
        camera_id: &str,
        track_id: Option<i64>,
    ) -> Result<()> {
        let timestamp = event_time.to_rfc3339();
        let backup_file = self
            .backup_dir
            .join(format!("events_{}.jsonl", &timestamp[..10]));
        let line = serde_json::json!({
            "event_time": timestamp,
            "direction": direction,
            "camera_id": camera_id,
            "track_id": track_id,
        });
        use std::io::Write;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&backup_file)
            .with_context(|| format!("opening backup file {}", backup_file.display()))?;
        writeln!(file, "{line}")?;
        warn!("Event written to backup file: {}", backup_file.display());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Daily state
    // ------------------------------------------------------------------

    /// Merge a patch into the date's row, creating it if needed.
    ///
    /// Frozen freeze: once `is_frozen` is set for a date, writes to
    /// `total_morning` are silently ignored and the flag cannot be cleared
    /// until the row is replaced by the next day's reset.
    pub fn upsert_daily_state(
        &self,
        date: NaiveDate,
        patch: DailyStatePatch,
        now: DateTime<Tz>,
    ) -> Result<()> {
        let date_str = date.format("%Y-%m-%d").to_string();
        let updated_at = now.to_rfc3339();
        let conn = self.conn.lock().unwrap();

        let existing = query_daily_state(&conn, &date_str)?;
        match existing {
            Some(state) => {
                let total_morning = if state.is_frozen {
                    if patch.total_morning.is_some() {
                        debug!(
                            "Ignoring total_morning write for {}: baseline is frozen",
                            date_str
                        );
                    }
                    state.total_morning
                } else {
                    patch.total_morning.unwrap_or(state.total_morning)
                };
                let is_frozen = state.is_frozen || patch.is_frozen.unwrap_or(false);
                let realtime_in = patch.realtime_in.unwrap_or(state.realtime_in);
                let realtime_out = patch.realtime_out.unwrap_or(state.realtime_out);
                conn.execute(
                    "UPDATE daily_state
                     SET total_morning = ?1, is_frozen = ?2, realtime_in = ?3,
                         realtime_out = ?4, updated_at = ?5
                     WHERE date = ?6",
                    params![
                        total_morning,
                        is_frozen as i64,
                        realtime_in,
                        realtime_out,
                        updated_at,
                        date_str
                    ],
                )?;
            }
            None => {
                conn.execute(
                    "INSERT INTO daily_state
                     (date, total_morning, is_frozen, realtime_in, realtime_out, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        date_str,
                        patch.total_morning.unwrap_or(0),
                        patch.is_frozen.unwrap_or(false) as i64,
                        patch.realtime_in.unwrap_or(0),
                        patch.realtime_out.unwrap_or(0),
                        updated_at
                    ],
                )?;
            }
        }
        Ok(())
    }

    pub fn daily_state(&self, date: NaiveDate) -> Result<Option<DailyState>> {
        let date_str = date.format("%Y-%m-%d").to_string();
        let conn = self.conn.lock().unwrap();
        query_daily_state(&conn, &date_str)
    }

    // ------------------------------------------------------------------
    // Missing periods
    // ------------------------------------------------------------------

    /// Open a shortfall interval. Errors if the date already has one open:
    /// the caller must update or close the existing period instead.
    pub fn open_missing_period(
        &self,
        date: NaiveDate,
        session: Session,
        start_time: DateTime<Tz>,
    ) -> Result<i64> {
        if let Some(open) = self.active_missing_period(date)? {
            bail!(
                "missing period {} is already open for {}, refusing to open another",
                open.id,
                date
            );
        }
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO missing_periods (date, session, start_time, missing_observed)
             VALUES (?1, ?2, ?3, 0)",
            params![
                date.format("%Y-%m-%d").to_string(),
                session.as_str(),
                start_time.to_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Refresh the rolling witnessed shortfall of an open period.
    pub fn update_missing_period(&self, id: i64, missing_observed: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE missing_periods SET missing_observed = ?1
             WHERE id = ?2 AND end_time IS NULL",
            params![missing_observed, id],
        )?;
        Ok(())
    }

    /// Close a period: sets `end_time` and freezes the derived duration.
    pub fn close_missing_period(&self, id: i64, end_time: DateTime<Tz>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let start: String = conn
            .query_row(
                "SELECT start_time FROM missing_periods WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .with_context(|| format!("missing period {id} not found"))?;
        let start = parse_ts(&start)?;
        let duration_minutes = end_time.signed_duration_since(start).num_minutes().max(0);
        conn.execute(
            "UPDATE missing_periods SET end_time = ?1, duration_minutes = ?2
             WHERE id = ?3 AND end_time IS NULL",
            params![end_time.to_rfc3339(), duration_minutes, id],
        )?;
        Ok(())
    }

    /// The open period for a date, if any. At most one can exist.
    pub fn active_missing_period(&self, date: NaiveDate) -> Result<Option<MissingPeriod>> {
        let date_str = date.format("%Y-%m-%d").to_string();
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, date, session, start_time, end_time, duration_minutes, missing_observed
                 FROM missing_periods
                 WHERE date = ?1 AND end_time IS NULL
                 ORDER BY id DESC LIMIT 1",
                params![date_str],
                map_period_row,
            )
            .optional()?;
        row.map(build_period).transpose()
    }

    pub fn missing_periods_for_date(&self, date: NaiveDate) -> Result<Vec<MissingPeriod>> {
        let date_str = date.format("%Y-%m-%d").to_string();
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, date, session, start_time, end_time, duration_minutes, missing_observed
             FROM missing_periods
             WHERE date = ?1
             ORDER BY start_time ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![date_str], map_period_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(build_period).collect()
    }

    // ------------------------------------------------------------------
    // Alert log
    // ------------------------------------------------------------------

    /// Record one alert attempt. Called for every decision, skips included.
    #[allow(clippy::too_many_arguments)]
    pub fn append_alert(
        &self,
        alert_time: DateTime<Tz>,
        date: NaiveDate,
        expected_total: i64,
        current_total: i64,
        missing: i64,
        status: AlertStatus,
        reason: Option<&str>,
    ) -> Result<i64> {
        let timestamp = alert_time.to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alert_logs
             (alert_time, date, expected_total, current_total, missing, status, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                timestamp,
                date.format("%Y-%m-%d").to_string(),
                expected_total,
                current_total,
                missing,
                status.as_str(),
                reason,
                timestamp
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The most recent successfully-sent alert for a date, for cooldown
    /// decisions. Skipped and failed attempts do not restart the cooldown.
    pub fn last_sent_alert(&self, date: NaiveDate) -> Result<Option<AlertRecord>> {
        let date_str = date.format("%Y-%m-%d").to_string();
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, alert_time, date, expected_total, current_total, missing, status, reason
                 FROM alert_logs
                 WHERE date = ?1 AND status = 'sent'
                 ORDER BY id DESC LIMIT 1",
                params![date_str],
                map_alert_row,
            )
            .optional()?;
        row.map(build_alert).transpose()
    }

    pub fn alerts_for_date(&self, date: NaiveDate) -> Result<Vec<AlertRecord>> {
        let date_str = date.format("%Y-%m-%d").to_string();
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, alert_time, date, expected_total, current_total, missing, status, reason
             FROM alert_logs
             WHERE date = ?1
             ORDER BY alert_time ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![date_str], map_alert_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(build_alert).collect()
    }
}

// ============================================================================
// Row mapping helpers
// ============================================================================

type PeriodRow = (i64, String, String, String, Option<String>, Option<i64>, i64);
type AlertRow = (i64, String, String, i64, i64, i64, String, Option<String>);

fn map_period_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PeriodRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn build_period(row: PeriodRow) -> Result<MissingPeriod> {
    let (id, date, session, start_time, end_time, duration_minutes, missing_observed) = row;
    Ok(MissingPeriod {
        id,
        date: parse_date(&date)?,
        session: Session::parse(&session)?,
        start_time: parse_ts(&start_time)?,
        end_time: end_time.as_deref().map(parse_ts).transpose()?,
        duration_minutes,
        missing_observed,
    })
}

fn map_alert_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlertRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn build_alert(row: AlertRow) -> Result<AlertRecord> {
    let (id, alert_time, date, expected_total, current_total, missing, status, reason) = row;
    Ok(AlertRecord {
        id,
        alert_time: parse_ts(&alert_time)?,
        date: parse_date(&date)?,
        expected_total,
        current_total,
        missing,
        status: AlertStatus::parse(&status)?,
        reason,
    })
}

fn query_daily_state(conn: &Connection, date_str: &str) -> Result<Option<DailyState>> {
    let row = conn
        .query_row(
            "SELECT date, total_morning, is_frozen, realtime_in, realtime_out, updated_at
             FROM daily_state WHERE date = ?1",
            params![date_str],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?;
    row.map(
        |(date, total_morning, is_frozen, realtime_in, realtime_out, updated_at)| {
            Ok(DailyState {
                date: parse_date(&date)?,
                total_morning,
                is_frozen: is_frozen != 0,
                realtime_in,
                realtime_out,
                updated_at: parse_ts(&updated_at)?,
            })
        },
    )
    .transpose()
}

fn parse_ts(s: &str) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s).with_context(|| format!("parsing timestamp {s:?}"))
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("parsing date {s:?}"))
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("db_path", &self.db_path)
            .finish()
    }
}

// Surfacing write failures is the caller's job; the store itself never
// retries. See pipeline::EventSink for the retry/backup policy.
pub fn log_loss_marker(err: &anyhow::Error, camera_id: &str, track_id: u64) {
    error!(
        "EVENT NOT PERSISTED: camera={}, track={}: {:#}",
        camera_id, track_id, err
    );
}

// ============================================================================
// TESTS
// ============================================================================
