// src/scheduler.rs
//
// Timer-driven background workers. Each tick is idempotent and recomputes
// from the store, so the tick itself, not the timer, is the unit of
// correctness: missed or doubled firings self-heal on the next one.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::alert_manager::AlertManager;
use crate::export::{DailyExporter, RetentionSweeper, RollingExporter};
use crate::phase_clock::PhaseClock;
use crate::phase_manager::{PhaseManager, PhaseTransition};
use crate::store::Store;

/// Work orders for the exporter worker, which serializes all filesystem
/// artefact production on a single task.
#[derive(Debug, Clone)]
pub enum ExportRequest {
    /// Refresh one date's workbook (plus the rolling summary).
    Daily(chrono::NaiveDate),
    /// Finalize a closing day: workbook, rolling summary, retention sweep.
    DayClose(chrono::NaiveDate),
}

/// PhaseManager tick, once per minute. Transitions fan out to the
/// exporter worker.
pub async fn phase_worker(
    mut manager: PhaseManager,
    clock: PhaseClock,
    export_tx: mpsc::Sender<ExportRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut timer = interval(Duration::from_secs(60));
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!("Phase worker started (1-minute tick)");
    loop {
        tokio::select! {
            _ = timer.tick() => {
                let now = clock.now();
                match manager.tick(now) {
                    Ok(transitions) => {
                        for transition in transitions {
                            route_transition(&export_tx, transition).await;
                        }
                    }
                    Err(err) => error!("Phase tick failed: {:#}", err),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("Phase worker stopped");
}

async fn route_transition(export_tx: &mpsc::Sender<ExportRequest>, transition: PhaseTransition) {
    match transition {
        PhaseTransition::DailyReset { date } => {
            // Today's workbook gets created; yesterday's gets its final
            // refresh in case the day-close export never ran.
            if let Some(yesterday) = date.pred_opt() {
                let _ = export_tx.send(ExportRequest::Daily(yesterday)).await;
            }
            let _ = export_tx.send(ExportRequest::Daily(date)).await;
        }
        PhaseTransition::BaselineFrozen { date, total_morning } => {
            info!("Baseline for {} frozen at {}", date, total_morning);
            let _ = export_tx.send(ExportRequest::Daily(date)).await;
        }
        PhaseTransition::PhaseChanged { date, .. } => {
            let _ = export_tx.send(ExportRequest::Daily(date)).await;
        }
        PhaseTransition::DayClosed { date } => {
            let _ = export_tx.send(ExportRequest::DayClose(date)).await;
        }
    }
}

/// AlertManager tick on the configured cadence (30 minutes).
pub async fn alert_worker(
    manager: AlertManager,
    check_interval_minutes: u64,
    clock: PhaseClock,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut timer = interval(Duration::from_secs(check_interval_minutes.max(1) * 60));
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!("Alert worker started ({}-minute tick)", check_interval_minutes);
    loop {
        tokio::select! {
            _ = timer.tick() => {
                if let Err(err) = manager.tick(clock.now()) {
                    error!("Alert tick failed: {:#}", err);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("Alert worker stopped");
}

/// Single-task exporter: daily workbook, rolling summary and retention
/// never race each other on the filesystem. Runs on a timer (the first
/// tick fires immediately, which is the startup export) and on explicit
/// requests from phase transitions. When the request channel closes
/// (main arranges that only after the frame path has drained) it
/// produces one final forced export and stops.
pub async fn export_worker(
    daily: DailyExporter,
    rolling: RollingExporter,
    retention: RetentionSweeper,
    clock: PhaseClock,
    mut requests: mpsc::Receiver<ExportRequest>,
    export_interval_minutes: u64,
) {
    let mut timer = interval(Duration::from_secs(export_interval_minutes.max(1) * 60));
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!("Export worker started ({}-minute cadence)", export_interval_minutes);
    loop {
        tokio::select! {
            _ = timer.tick() => {
                run_export_cycle(&daily, &rolling, &retention, &clock, clock.now().date_naive());
            }
            request = requests.recv() => {
                match request {
                    Some(ExportRequest::Daily(date)) => {
                        run_export_cycle(&daily, &rolling, &retention, &clock, date);
                    }
                    Some(ExportRequest::DayClose(date)) => {
                        info!("Finalizing artefacts for closing day {}", date);
                        run_export_cycle(&daily, &rolling, &retention, &clock, date);
                    }
                    None => {
                        info!("Final export before shutdown");
                        run_export_cycle(&daily, &rolling, &retention, &clock, clock.now().date_naive());
                        break;
                    }
                }
            }
        }
    }
    info!("Export worker stopped");
}

fn run_export_cycle(
    daily: &DailyExporter,
    rolling: &RollingExporter,
    retention: &RetentionSweeper,
    clock: &PhaseClock,
    date: chrono::NaiveDate,
) {
    if let Err(err) = daily.run(date) {
        error!("Daily export for {} failed: {:#}", date, err);
    }
    // Sweep before merging so the rolling summary never includes a
    // workbook that retention is about to delete.
    if let Err(err) = retention.run(clock.now().date_naive()) {
        error!("Retention sweep failed: {:#}", err);
    }
    if let Err(err) = rolling.run() {
        error!("Rolling export failed: {:#}", err);
    }
}

/// One-shot write-path probe, 60 seconds after boot.
pub async fn self_test_worker(
    store: Arc<Store>,
    clock: PhaseClock,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(60)) => {
            if let Err(err) = store.insert_self_test_marker(clock.now()) {
                error!("Self-test marker insert failed: {:#}", err);
            }
        }
        _ = shutdown.changed() => {}
    }
}
