mod alert_manager;
mod config;
mod export;
mod gate_counter;
mod notifier;
mod phase_clock;
mod phase_manager;
mod pipeline;
mod scheduler;
mod store;
mod types;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::alert_manager::AlertManager;
use crate::export::{DailyExporter, RetentionSweeper, RollingExporter};
use crate::gate_counter::GateCounter;
use crate::notifier::{EmailSender, SmtpMailer};
use crate::phase_clock::PhaseClock;
use crate::phase_manager::PhaseManager;
use crate::pipeline::{EventSink, FrameUpdate};
use crate::store::Store;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("occupancy_monitor=info")
        .init();

    info!("👁 Gate occupancy monitor starting");

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    let config = config::Config::load(&config_path)?;

    let clock = PhaseClock::from_config(&config.phases)?;
    let store = Arc::new(Store::open(&config.storage.db_path, &config.storage.backup_dir)?);
    let gate_counter = GateCounter::new(&config.gate)?;
    let mailer: Arc<dyn EmailSender> = Arc::new(SmtpMailer::from_config(&config.email));

    info!(
        "Current phase: {} ({})",
        clock.phase_at(clock.now()),
        config.phases.timezone
    );

    let phase_manager = PhaseManager::new(store.clone(), clock.clone());
    let alert_manager = AlertManager::new(
        store.clone(),
        clock.clone(),
        mailer,
        &config.alerts,
        config.camera.camera_id.clone(),
    );
    let daily_exporter = DailyExporter::new(store.clone(), clock.clone(), &config.export.daily_dir);
    let rolling_exporter = RollingExporter::new(
        &config.export.daily_dir,
        &config.export.summary_dir,
        config.export.rolling_days,
    );
    let retention_sweeper =
        RetentionSweeper::new(&config.export.daily_dir, config.export.retention_days);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (export_tx, export_rx) = mpsc::channel(16);
    let (sink, sink_rx) = EventSink::new(store.clone(), 256);

    // The camera/detector/tracker integration publishes FrameUpdate values
    // here; see pipeline::FrameUpdate for the producer contract. Dropping
    // the sender at shutdown lets the frame worker drain and stop.
    let (frame_tx, frame_rx) = mpsc::channel::<FrameUpdate>(64);

    let frame_worker: JoinHandle<()> = tokio::spawn(pipeline::run_frame_worker(
        frame_rx,
        gate_counter,
        sink,
        clock.clone(),
        config.camera.camera_id.clone(),
        shutdown_rx.clone(),
    ));
    let store_writer = tokio::spawn(pipeline::run_store_writer(store.clone(), sink_rx));
    let phase_worker = tokio::spawn(scheduler::phase_worker(
        phase_manager,
        clock.clone(),
        export_tx.clone(),
        shutdown_rx.clone(),
    ));
    let alert_worker = tokio::spawn(scheduler::alert_worker(
        alert_manager,
        config.alerts.check_interval_minutes,
        clock.clone(),
        shutdown_rx.clone(),
    ));
    let export_worker = tokio::spawn(scheduler::export_worker(
        daily_exporter,
        rolling_exporter,
        retention_sweeper,
        clock.clone(),
        export_rx,
        config.export.export_interval_minutes,
    ));
    let self_test_worker = tokio::spawn(scheduler::self_test_worker(
        store.clone(),
        clock.clone(),
        shutdown_rx,
    ));

    info!("✓ All workers running");
    wait_for_shutdown_signal().await;
    info!("Shutdown signal received, stopping workers");

    // Frame path drains first so every witnessed crossing is durable
    // before the exporter produces its final artefacts; stragglers are
    // abandoned after the grace period; every store write was already
    // durable, so the store stays consistent regardless.
    let _ = shutdown_tx.send(true);
    drop(frame_tx);

    let drain_first: [(&str, JoinHandle<()>); 4] = [
        ("frame", frame_worker),
        ("store-writer", store_writer),
        ("phase", phase_worker),
        ("alert", alert_worker),
    ];
    for (name, handle) in drain_first {
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            warn!("Worker {} did not stop within grace period, abandoning", name);
        }
    }

    // Closing the request channel asks the exporter for one final daily +
    // rolling export; it stops on its own afterwards.
    drop(export_tx);
    let finishers: [(&str, JoinHandle<()>); 2] = [
        ("export", export_worker),
        ("self-test", self_test_worker),
    ];
    for (name, handle) in finishers {
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            warn!("Worker {} did not stop within grace period, abandoning", name);
        }
    }

    info!("🎉 Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
