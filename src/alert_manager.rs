// src/alert_manager.rs
//
// Duration-gated, cooldown-limited alert decisions. Runs on a 30-minute
// tick; every decision (skips included) lands in the alert log so
// operators can audit why a mail did or did not go out.

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate};
use chrono_tz::Tz;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::AlertConfig;
use crate::notifier::EmailSender;
use crate::phase_clock::{Phase, PhaseClock};
use crate::phase_manager::effective_baseline;
use crate::store::Store;
use crate::types::AlertStatus;

pub struct AlertManager {
    store: Arc<Store>,
    clock: PhaseClock,
    sender: Arc<dyn EmailSender>,
    camera_id: String,
    /// Minimum age of a missing period before the first mail. Carries a
    /// 30-second tail past the half hour to debounce the moment a
    /// shortfall begins.
    first_alert_delay: Duration,
    /// Minimum spacing between two sent mails on one date.
    cooldown: Duration,
}

impl AlertManager {
    pub fn new(
        store: Arc<Store>,
        clock: PhaseClock,
        sender: Arc<dyn EmailSender>,
        config: &AlertConfig,
        camera_id: String,
    ) -> Self {
        Self {
            store,
            clock,
            sender,
            camera_id,
            first_alert_delay: Duration::seconds(config.first_alert_delay_sec as i64),
            cooldown: Duration::minutes(config.cooldown_minutes as i64),
        }
    }

    /// One scheduler tick. Idempotent with respect to the store: the
    /// decision is recomputed from scratch every time.
    pub fn tick(&self, now: DateTime<Tz>) -> Result<()> {
        let date = now.date_naive();
        let phase = self.clock.phase_at(now);

        // Overnight (closed-day) ticks are not alert attempts; don't fill
        // the audit log with them.
        if phase == Phase::DayClose {
            debug!("Alert tick outside the working day, nothing to do");
            return Ok(());
        }

        let baseline = effective_baseline(&self.store, &self.clock, date)?;
        let (ins, outs) = self.store.counts_for_date(date)?;
        let present = (ins - outs).max(0);
        let missing = (baseline - present).max(0);

        if !phase.is_monitoring() {
            self.record_skip(now, date, baseline, present, missing, "phase")?;
            return Ok(());
        }

        let Some(period) = self.store.active_missing_period(date)? else {
            self.record_skip(now, date, baseline, present, missing, "no_missing")?;
            return Ok(());
        };
        if missing == 0 {
            // Open period but the shortfall has already recovered between
            // phase ticks; nothing worth mailing.
            self.record_skip(now, date, baseline, present, missing, "no_missing")?;
            return Ok(());
        }

        let period_age = now.signed_duration_since(period.start_time);
        if period_age < self.first_alert_delay {
            self.record_skip(now, date, baseline, present, missing, "duration<30.5m")?;
            return Ok(());
        }

        if let Some(last) = self.store.last_sent_alert(date)? {
            let since_last = now.signed_duration_since(last.alert_time);
            if since_last <= self.cooldown && last.missing == missing {
                // An increased or decreased count never sends out of band;
                // it just rides the next eligible slot.
                self.record_skip(now, date, baseline, present, missing, "cooldown")?;
                return Ok(());
            }
        }

        if !self.sender.is_enabled() {
            self.record_skip(now, date, baseline, present, missing, "disabled")?;
            return Ok(());
        }

        let duration_minutes = period_age.num_minutes();
        let subject = format!("People Missing Alert - {date} ({missing} missing)");
        let body = format!(
            "Date: {date}\n\
             Time: {}\n\
             Total Morning: {baseline}\n\
             Current Realtime: {present}\n\
             Current Missing: {missing}\n\
             Missing Since: {}\n\
             Duration: {duration_minutes} minutes\n\
             Camera: {}",
            now.format("%Y-%m-%d %H:%M:%S %Z"),
            period.start_time.format("%Y-%m-%d %H:%M:%S"),
            self.camera_id,
        );

        match self.sender.send(&subject, &body) {
            Ok(()) => {
                self.store.append_alert(
                    now,
                    date,
                    baseline,
                    present,
                    missing,
                    AlertStatus::Sent,
                    None,
                )?;
                info!(
                    "🚨 Alert sent: missing={}, shortfall running {} minutes",
                    missing, duration_minutes
                );
            }
            Err(err) => {
                let reason = format!("{err:#}");
                error!("Alert email failed: {}", reason);
                self.store.append_alert(
                    now,
                    date,
                    baseline,
                    present,
                    missing,
                    AlertStatus::Failed,
                    Some(&reason),
                )?;
            }
        }
        Ok(())
    }

    fn record_skip(
        &self,
        now: DateTime<Tz>,
        date: NaiveDate,
        baseline: i64,
        present: i64,
        missing: i64,
        reason: &str,
    ) -> Result<()> {
        debug!("Alert skipped: {}", reason);
        self.store.append_alert(
            now,
            date,
            baseline,
            present,
            missing,
            AlertStatus::Skipped,
            Some(reason),
        )?;
        Ok(())
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
    use chrono::TimeZone;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct MockSender {
        enabled: bool,
        fail: bool,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl MockSender {
        fn new(enabled: bool, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                enabled,
                fail,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    impl EmailSender for MockSender {
        fn is_enabled(&self) -> bool {
            self.enabled
        }

        fn send(&self, subject: &str, body: &str) -> Result<()> {
            if self.fail {
                anyhow::bail!("connection refused");
            }
            self.sent
                .lock()
                .unwrap()
                .push((subject.to_string(), body.to_string()));
            Ok(())
        }
    }

    fn setup(sender: Arc<MockSender>) -> (TempDir, Arc<Store>, PhaseClock, AlertManager) {
        let dir = TempDir::new().unwrap();
        let store =
            Arc::new(Store::open(dir.path().join("test.db"), dir.path().join("backup")).unwrap());
        let clock = PhaseClock::from_config(&PhaseConfig::default()).unwrap();
        let manager = AlertManager::new(
            store.clone(),
            clock.clone(),
            sender,
            &crate::config::AlertConfig::default(),
            "camera_01".to_string(),
        );
        (dir, store, clock, manager)
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

    /// Frozen baseline 4, one person short since 09:00.
    fn seed_shortfall(store: &Store, clock: &PhaseClock) {
        store
            .upsert_daily_state(
                date(),
                DailyStatePatch {
                    total_morning: Some(4),
                    is_frozen: Some(true),
                    ..Default::default()
                },
                at(clock, 8, 30),
            )
            .unwrap();
        for i in 0..5 {
            store.append_event(at(clock, 7, i), "IN", "camera_01", None).unwrap();
        }
        store.append_event(at(clock, 8, 0), "OUT", "camera_01", None).unwrap();
        store.append_event(at(clock, 9, 0), "OUT", "camera_01", None).unwrap();
        let id = store
            .open_missing_period(date(), Session::Morning, at(clock, 9, 0))
            .unwrap();
        store.update_missing_period(id, 1).unwrap();
    }

    fn last_alert(store: &Store) -> crate::types::AlertRecord {
        store.alerts_for_date(date()).unwrap().pop().unwrap()
    }

    #[test]
    fn test_s2_alert_cadence() {
        let sender = MockSender::new(true, false);
        let (_dir, store, clock, manager) = setup(sender.clone());
        seed_shortfall(&store, &clock);

        // 09:30: period is 30 minutes old, below the 30.5-minute gate.
        manager.tick(at(&clock, 9, 30)).unwrap();
        let alert = last_alert(&store);
        assert_eq!(alert.status, AlertStatus::Skipped);
        assert_eq!(alert.reason.as_deref(), Some("duration<30.5m"));
        assert_eq!(sender.sent_count(), 0);

        // 10:00: 60 minutes in, first send.
        manager.tick(at(&clock, 10, 0)).unwrap();
        let alert = last_alert(&store);
        assert_eq!(alert.status, AlertStatus::Sent);
        assert_eq!(alert.missing, 1);
        assert_eq!(sender.sent_count(), 1);

        // 10:30: cooldown, unchanged shortfall.
        manager.tick(at(&clock, 10, 30)).unwrap();
        let alert = last_alert(&store);
        assert_eq!(alert.status, AlertStatus::Skipped);
        assert_eq!(alert.reason.as_deref(), Some("cooldown"));
        assert_eq!(sender.sent_count(), 1);

        // 11:00: last send was an hour ago.
        manager.tick(at(&clock, 11, 0)).unwrap();
        assert_eq!(last_alert(&store).status, AlertStatus::Sent);
        assert_eq!(sender.sent_count(), 2);
    }

    #[test]
    fn test_changed_missing_rides_next_slot() {
        let sender = MockSender::new(true, false);
        let (_dir, store, clock, manager) = setup(sender.clone());
        seed_shortfall(&store, &clock);

        manager.tick(at(&clock, 10, 0)).unwrap();
        assert_eq!(sender.sent_count(), 1);

        // Shortfall worsens; the 10:30 slot carries the new count.
        store.append_event(at(&clock, 10, 10), "OUT", "camera_01", None).unwrap();
        let period = store.active_missing_period(date()).unwrap().unwrap();
        store.update_missing_period(period.id, 2).unwrap();

        manager.tick(at(&clock, 10, 30)).unwrap();
        let alert = last_alert(&store);
        assert_eq!(alert.status, AlertStatus::Sent);
        assert_eq!(alert.missing, 2);
        assert_eq!(sender.sent_count(), 2);
    }

    #[test]
    fn test_no_missing_period_skips() {
        let sender = MockSender::new(true, false);
        let (_dir, store, clock, manager) = setup(sender.clone());

        manager.tick(at(&clock, 10, 0)).unwrap();
        let alert = last_alert(&store);
        assert_eq!(alert.status, AlertStatus::Skipped);
        assert_eq!(alert.reason.as_deref(), Some("no_missing"));
        assert_eq!(sender.sent_count(), 0);
    }

    #[test]
    fn test_lunch_phase_skips_even_with_due_alert() {
        // A due alert during lunch is held until the afternoon.
        let sender = MockSender::new(true, false);
        let (_dir, store, clock, manager) = setup(sender.clone());
        store
            .upsert_daily_state(
                date(),
                DailyStatePatch {
                    total_morning: Some(4),
                    is_frozen: Some(true),
                    ..Default::default()
                },
                at(&clock, 8, 30),
            )
            .unwrap();
        for i in 0..4 {
            store.append_event(at(&clock, 7, i), "IN", "camera_01", None).unwrap();
        }
        store.append_event(at(&clock, 11, 30), "OUT", "camera_01", None).unwrap();
        let id = store
            .open_missing_period(date(), Session::Morning, at(&clock, 11, 30))
            .unwrap();
        store.update_missing_period(id, 1).unwrap();

        manager.tick(at(&clock, 12, 30)).unwrap();
        let alert = last_alert(&store);
        assert_eq!(alert.status, AlertStatus::Skipped);
        assert_eq!(alert.reason.as_deref(), Some("phase"));
        assert_eq!(sender.sent_count(), 0);

        // 13:30: afternoon monitoring, gate met, cooldown clear.
        manager.tick(at(&clock, 13, 30)).unwrap();
        assert_eq!(last_alert(&store).status, AlertStatus::Sent);
        assert_eq!(sender.sent_count(), 1);
    }

    #[test]
    fn test_disabled_sender_records_skip() {
        let sender = MockSender::new(false, false);
        let (_dir, store, clock, manager) = setup(sender.clone());
        seed_shortfall(&store, &clock);

        manager.tick(at(&clock, 10, 0)).unwrap();
        let alert = last_alert(&store);
        assert_eq!(alert.status, AlertStatus::Skipped);
        assert_eq!(alert.reason.as_deref(), Some("disabled"));
        assert_eq!(sender.sent_count(), 0);
    }

    #[test]
    fn test_smtp_failure_records_failed_attempt() {
        let sender = MockSender::new(true, true);
        let (_dir, store, clock, manager) = setup(sender.clone());
        seed_shortfall(&store, &clock);

        manager.tick(at(&clock, 10, 0)).unwrap();
        let alert = last_alert(&store);
        assert_eq!(alert.status, AlertStatus::Failed);
        assert!(alert.reason.as_deref().unwrap().contains("connection refused"));

        // The failure does not start a cooldown; the next tick retries.
        manager.tick(at(&clock, 10, 30)).unwrap();
        assert_eq!(last_alert(&store).status, AlertStatus::Failed);
    }

    #[test]
    fn test_message_contents() {
        let sender = MockSender::new(true, false);
        let (_dir, store, clock, manager) = setup(sender.clone());
        seed_shortfall(&store, &clock);

        manager.tick(at(&clock, 10, 0)).unwrap();
        let sent = sender.sent.lock().unwrap();
        let (subject, body) = &sent[0];
        assert!(subject.contains("2026-03-09"));
        assert!(subject.contains("1 missing"));
        assert!(body.contains("Total Morning: 4"));
        assert!(body.contains("Current Realtime: 3"));
        assert!(body.contains("Current Missing: 1"));
        assert!(body.contains("Duration: 60 minutes"));
        assert!(body.contains("Missing Since: 2026-03-09 09:00:00"));
    }

    #[test]
    fn test_overnight_tick_writes_nothing() {
        let sender = MockSender::new(true, false);
        let (_dir, store, clock, manager) = setup(sender.clone());

        manager.tick(at(&clock, 2, 0)).unwrap();
        assert!(store.alerts_for_date(date()).unwrap().is_empty());
    }
}
