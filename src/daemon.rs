//! Producer cadence loop and daemon lifecycle
//!
//! The main task sleeps in short intervals and fires on wall-clock cadence
//! points ("every 5 minutes on the minute"). Each firing reads one
//! measurement and fans it out to two queue messages with identical blobs:
//! `save_locally` is enqueued before `post_data`, so the measurement reaches
//! local storage even if remote delivery keeps failing.
//!
//! Shutdown is cooperative: the first interrupt drains the queue before
//! stopping the worker, a second interrupt lets the in-flight task finish
//! and stops immediately after.

use crate::config::Config;
use crate::measurement::Measurement;
use crate::queue::{Message, Queue, QueueOptions, Route};
use crate::sensor::Vpf730;
use crate::tasks::builtin_registry;
use crate::util::retry;
use crate::worker::{Worker, DEFAULT_POLL_INTERVAL};
use anyhow::{Context, Result};
use chrono::{DateTime, Timelike, Utc};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Minutes between measurements
pub const DEFAULT_CADENCE_MIN: u32 = 5;

/// Acknowledged messages retained between prune passes
const KEEP_MSG: usize = 1_000;
/// Queue puts between prune passes
const PRUNE_INTERVAL: u32 = 100;

/// True on the exact second a measurement is due
fn cadence_due(now: DateTime<Utc>, cadence_min: u32) -> bool {
    now.minute() % cadence_min == 0 && now.second() == 0
}

/// Fan one measurement out to both sinks, local persistence first
fn enqueue_measurement(queue: &Queue, measurement: Measurement) -> Result<()> {
    let local = Message::new("save_locally", measurement.clone());
    let post = Message::new("post_data", measurement);
    queue.put(&local, Route::Queue)?;
    queue.put(&post, Route::Queue)?;
    tracing::info!(local_id = %local.id, post_id = %post.id, "measurement enqueued");
    Ok(())
}

/// One cadence firing: read the sensor and enqueue.
///
/// Every failure is contained to this tick; the next cadence point starts
/// fresh.
fn tick(sensor: &Vpf730, queue: &Queue) {
    // one extra attempt covers a transiently busy serial port
    match retry(1, || sensor.measure(true)) {
        Ok(Some(measurement)) => {
            if let Err(err) = enqueue_measurement(queue, measurement) {
                tracing::error!("failed to enqueue measurement: {err:#}");
            }
        }
        Ok(None) => tracing::warn!("sensor read timed out, no measurement this tick"),
        Err(err) => tracing::error!("sensor read failed: {err:#}"),
    }
}

/// Run the daemon until interrupted
pub async fn main_loop(cfg: Config, cadence_min: u32) -> Result<()> {
    let queue = Arc::new(Queue::open(
        &cfg.queue_db,
        QueueOptions {
            keep_msg: KEEP_MSG,
            prune_interval: PRUNE_INTERVAL,
            ..QueueOptions::default()
        },
    )?);
    let sensor = Vpf730::new(cfg.serial_port.clone());
    let registry = Arc::new(builtin_registry());
    tracing::debug!(handlers = ?registry.names().collect::<Vec<_>>(), "handler registry built");

    let dead = queue.deadletter_qsize()?;
    if dead > 0 {
        tracing::warn!(dead, "dead letter messages awaiting manual requeue");
    }

    let worker = Worker::spawn(queue.clone(), registry, cfg.clone(), DEFAULT_POLL_INTERVAL)?;
    tracing::info!(
        queue_db = %cfg.queue_db.display(),
        serial_port = %cfg.serial_port,
        cadence_min,
        "daemon started"
    );

    let sigint = tokio::signal::ctrl_c();
    tokio::pin!(sigint);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(DEFAULT_POLL_INTERVAL) => {
                if cadence_due(Utc::now(), cadence_min) {
                    tick(&sensor, &queue);
                    // stay clear of the firing second so a fast tick cannot
                    // enqueue twice
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
            res = &mut sigint => {
                res.context("failed to listen for shutdown signal")?;
                break;
            }
        }
    }

    tracing::info!("waiting for worker to finish all tasks (interrupt again to stop now)");
    let running = worker.running_flag();
    let mut drain = tokio::task::spawn_blocking(move || worker.finish_and_join());
    tokio::select! {
        res = &mut drain => {
            res.context("worker drain task failed")?;
        }
        sig = tokio::signal::ctrl_c() => {
            sig.context("failed to listen for shutdown signal")?;
            tracing::info!("worker finishing current task");
            running.store(false, Ordering::Relaxed);
            drain.await.context("worker drain task failed")?;
        }
    }
    let stats = queue.metrics();
    tracing::info!(
        puts = stats.puts,
        prune_runs = stats.prune_runs,
        pruned_rows = stats.pruned_rows,
        "shutdown complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::test_measurement;
    use chrono::TimeZone;

    #[test]
    fn test_cadence_due_every_five_minutes() {
        let due = Utc.with_ymd_and_hms(2022, 7, 25, 23, 0, 0).unwrap();
        assert!(cadence_due(due, 5));
        let also_due = Utc.with_ymd_and_hms(2022, 7, 25, 22, 55, 0).unwrap();
        assert!(cadence_due(also_due, 5));

        // wrong minute
        let off_minute = Utc.with_ymd_and_hms(2022, 7, 25, 22, 56, 0).unwrap();
        assert!(!cadence_due(off_minute, 5));
        // right minute, wrong second
        let off_second = Utc.with_ymd_and_hms(2022, 7, 25, 23, 0, 30).unwrap();
        assert!(!cadence_due(off_second, 5));
    }

    #[test]
    fn test_cadence_due_other_intervals() {
        let now = Utc.with_ymd_and_hms(2022, 7, 25, 22, 56, 0).unwrap();
        assert!(cadence_due(now, 1));
        assert!(cadence_due(now, 2));
        assert!(!cadence_due(now, 10));
    }

    #[test]
    fn test_enqueue_measurement_local_before_remote() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Queue::open(dir.path().join("queue.db"), QueueOptions::default()).unwrap();
        let measurement = test_measurement();
        enqueue_measurement(&queue, measurement.clone()).unwrap();

        assert_eq!(queue.qsize().unwrap(), 2);
        let first = queue.get(Route::Queue).unwrap().unwrap();
        let second = queue.get(Route::Queue).unwrap().unwrap();
        assert_eq!(first.task, "save_locally");
        assert_eq!(second.task, "post_data");
        // identical blob, distinct ids
        assert_eq!(first.blob, measurement);
        assert_eq!(second.blob, measurement);
        assert_ne!(first.id, second.id);
    }
}
