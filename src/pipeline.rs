// src/pipeline.rs
//
// Frame-side plumbing. The detector and tracker are external: they publish
// FrameUpdate values (tracked rectangles plus departed track ids) into a
// channel, and the frame worker here drives the gate counter and hands
// resolved crossings to the store.
//
// Crossings must never be dropped silently. The EventSink tries a bounded
// queue first (so the frame loop never stalls on a slow disk), falls back
// to a direct synchronous write when the queue is saturated, and as a last
// resort captures the event to a backup JSONL file with a loss marker in
// the log.

use chrono::DateTime;
use chrono_tz::Tz;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::gate_counter::GateCounter;
use crate::phase_clock::PhaseClock;
use crate::store::Store;
use crate::types::Direction;

/// One tracked person in one frame, in pixel coordinates.
#[derive(Debug, Clone)]
pub struct TrackObservation {
    pub track_id: u64,
    /// [x1, y1, x2, y2]
    pub bbox: [f32; 4],
}

impl TrackObservation {
    /// The point the gate logic follows: where the person touches the
    /// floor, approximately.
    pub fn bottom_center(&self) -> (f32, f32) {
        ((self.bbox[0] + self.bbox[2]) * 0.5, self.bbox[3])
    }
}

/// What the external tracker publishes per processed frame.
#[derive(Debug, Clone, Default)]
pub struct FrameUpdate {
    /// Capture timestamp; the worker stamps arrival time when absent.
    pub timestamp: Option<DateTime<Tz>>,
    pub tracks: Vec<TrackObservation>,
    /// Track ids the tracker has dropped since the previous frame.
    pub departed: Vec<u64>,
}

/// A crossing awaiting persistence.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub event_time: DateTime<Tz>,
    pub direction: Direction,
    pub camera_id: String,
    pub track_id: u64,
}

// ============================================================================
// EVENT SINK
// ============================================================================

#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<PendingEvent>,
    store: Arc<Store>,
}

impl EventSink {
    pub fn new(store: Arc<Store>, capacity: usize) -> (Self, mpsc::Receiver<PendingEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, store }, rx)
    }

    /// Hand a crossing off for persistence without suspending the caller.
    pub fn submit(&self, event: PendingEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) | Err(TrySendError::Closed(event)) => {
                warn!(
                    "Event queue unavailable, writing track {} directly",
                    event.track_id
                );
                self.write_direct(&event);
            }
        }
    }

    fn write_direct(&self, event: &PendingEvent) {
        if let Err(err) = self.store.append_event(
            event.event_time,
            event.direction.as_str(),
            &event.camera_id,
            Some(event.track_id as i64),
        ) {
            self.capture_to_backup(event, &err);
        }
    }

    fn capture_to_backup(&self, event: &PendingEvent, err: &anyhow::Error) {
        crate::store::log_loss_marker(err, &event.camera_id, event.track_id);
        if let Err(backup_err) = self.store.write_backup_event(
            event.event_time,
            event.direction.as_str(),
            &event.camera_id,
            Some(event.track_id as i64),
        ) {
            error!(
                "Backup capture also failed for track {}: {:#}",
                event.track_id, backup_err
            );
        }
    }
}

/// Drains the sink queue into the store. Transient write errors get a
/// bounded retry with backoff; exhaustion ends in the backup file, never a
/// silent drop.
pub async fn run_store_writer(store: Arc<Store>, mut rx: mpsc::Receiver<PendingEvent>) {
    const ATTEMPTS: u32 = 3;
    while let Some(event) = rx.recv().await {
        for attempt in 1..=ATTEMPTS {
            match store.append_event(
                event.event_time,
                event.direction.as_str(),
                &event.camera_id,
                Some(event.track_id as i64),
            ) {
                Ok(_) => break,
                Err(err) => {
                    warn!(
                        "Event write attempt {}/{} failed for track {}: {:#}",
                        attempt, ATTEMPTS, event.track_id, err
                    );
                    if attempt < ATTEMPTS {
                        tokio::time::sleep(std::time::Duration::from_millis(
                            200 * attempt as u64,
                        ))
                        .await;
                    } else {
                        crate::store::log_loss_marker(&err, &event.camera_id, event.track_id);
                        if let Err(backup_err) = store.write_backup_event(
                            event.event_time,
                            event.direction.as_str(),
                            &event.camera_id,
                            Some(event.track_id as i64),
                        ) {
                            error!(
                                "Backup capture also failed for track {}: {:#}",
                                event.track_id, backup_err
                            );
                        }
                    }
                }
            }
        }
    }
    info!("Store writer stopped");
}

// ============================================================================
// FRAME WORKER
// ============================================================================

/// Consumes frame updates until the channel closes or shutdown fires,
/// draining anything already queued before stopping.
pub async fn run_frame_worker(
    mut frames: mpsc::Receiver<FrameUpdate>,
    mut counter: GateCounter,
    sink: EventSink,
    clock: PhaseClock,
    camera_id: String,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            update = frames.recv() => {
                match update {
                    Some(update) => process_frame(&mut counter, &sink, &clock, &camera_id, update),
                    None => break,
                }
            }
            _ = shutdown.changed() => {
                while let Ok(update) = frames.try_recv() {
                    process_frame(&mut counter, &sink, &clock, &camera_id, update);
                }
                break;
            }
        }
    }
    let (ins, outs) = counter.counts();
    info!("Frame worker stopped (session tallies: in={}, out={})", ins, outs);
}

fn process_frame(
    counter: &mut GateCounter,
    sink: &EventSink,
    clock: &PhaseClock,
    camera_id: &str,
    update: FrameUpdate,
) {
    let now = update.timestamp.unwrap_or_else(|| clock.now());
    for track_id in update.departed {
        counter.drop_track(track_id);
    }
    for track in update.tracks {
        if let Some(crossing) = counter.update(track.track_id, track.bottom_center(), now) {
            sink.submit(PendingEvent {
                event_time: crossing.timestamp,
                direction: crossing.direction,
                camera_id: camera_id.to_string(),
                track_id: crossing.track_id,
            });
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
