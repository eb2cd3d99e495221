//! Durable FIFO task queue backed by SQLite
//!
//! The queue database is the only resource shared between the producer loop
//! and the worker thread. Every operation opens its own scoped connection and
//! runs inside a single transaction; SQLite's file locking serializes the two
//! threads.
//!
//! # Architecture
//!
//! ```text
//! producer ──put──→ [queue] ──get (lease)──→ worker
//!                      │                        │
//!                      │◄── task_failed ────────┤ (retries < max: back to pending)
//!                      │                        │
//!                 [deadletter] ◄────────────────┘ (retries exhausted)
//!                      │
//!                      └── deadletter_requeue ──→ [queue] (retries = 0)
//! ```
//!
//! A row is *pending* while `fetched IS NULL` (and its `eta`, if any, has
//! passed), *leased* between `get` and `task_done`/`task_failed`, and *done*
//! once `acked` is set. Done rows are retained for inspection until `prune`
//! trims them down to the configured retention count.

use crate::measurement::Measurement;
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Milliseconds since the Unix epoch (UTC)
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Open the database at `db_path` and run `f` inside a single transaction.
///
/// The transaction commits when `f` returns `Ok` and rolls back when it
/// returns `Err`; the connection is closed either way. Connections are never
/// shared between threads.
pub fn with_connection<T>(
    db_path: &Path,
    f: impl FnOnce(&Transaction<'_>) -> Result<T>,
) -> Result<T> {
    let mut conn = Connection::open(db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    conn.busy_timeout(Duration::from_millis(5000))?;
    let tx = conn.transaction()?;
    let val = f(&tx)?;
    tx.commit()?;
    Ok(val)
}

/// Which of the two structurally twin tables an operation addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Queue,
    Deadletter,
}

/// The unit of queue work: a named task wrapping one measurement
///
/// In-memory values are read-only snapshots of a row; all mutation goes
/// through the [`Queue`] methods that write the row.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Uuid,
    /// Handler name, resolved against the registry at dispatch time
    pub task: String,
    pub blob: Measurement,
    pub retries: u32,
    /// Earliest wall-clock time (ms) at which the message becomes eligible
    pub eta: Option<i64>,
}

impl Message {
    /// A fresh message for `task` with zero retries and no eta
    pub fn new(task: impl Into<String>, blob: Measurement) -> Message {
        Message {
            id: Uuid::new_v4(),
            task: task.into(),
            blob,
            retries: 0,
            eta: None,
        }
    }

    /// The id as stored in the `id VARCHAR(36)` column: 32 hex chars
    pub fn id_hex(&self) -> String {
        self.id.as_simple().to_string()
    }

    /// Serialize to the persisted row shape `(id, task, blob, retries, eta)`
    pub fn to_row(&self) -> Result<(String, String, String, u32, Option<i64>)> {
        let blob = serde_json::to_string(&self.blob).context("failed to serialize measurement")?;
        Ok((self.id_hex(), self.task.clone(), blob, self.retries, self.eta))
    }

    /// Inverse of [`Message::to_row`]
    pub fn from_row(
        id: &str,
        task: String,
        blob: &str,
        retries: u32,
        eta: Option<i64>,
    ) -> Result<Message> {
        Ok(Message {
            id: Uuid::parse_str(id).with_context(|| format!("invalid message id {id:?}"))?,
            task,
            blob: serde_json::from_str(blob).context("failed to deserialize measurement blob")?,
            retries,
            eta,
        })
    }
}

/// Construction parameters for [`Queue`]
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Failures after which a message is routed to the dead letter table
    pub max_retries: u32,
    /// Acknowledged rows retained by a prune pass
    pub keep_msg: usize,
    /// Successful puts between prune passes
    pub prune_interval: u32,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            keep_msg: 10_000,
            prune_interval: 1_000,
        }
    }
}

/// Counters for observability of the queue itself
#[derive(Debug, Default)]
pub struct QueueMetrics {
    /// Messages enqueued on the active queue
    pub puts: AtomicU64,
    /// Prune passes executed
    pub prune_runs: AtomicU64,
    /// Acknowledged rows deleted by pruning
    pub pruned_rows: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub puts: u64,
    pub prune_runs: u64,
    pub pruned_rows: u64,
}

impl QueueMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            puts: self.puts.load(Ordering::Relaxed),
            prune_runs: self.prune_runs.load(Ordering::Relaxed),
            pruned_rows: self.pruned_rows.load(Ordering::Relaxed),
        }
    }
}

/// Durable at-least-once FIFO queue over two SQLite tables
pub struct Queue {
    db_path: PathBuf,
    opts: QueueOptions,
    /// Queue-route puts since the last prune
    put_count: AtomicU32,
    metrics: QueueMetrics,
}

impl Queue {
    /// Open (and bootstrap) the queue database at `db_path`.
    ///
    /// The schema bootstrap is idempotent and re-run on every process start.
    pub fn open(db_path: impl Into<PathBuf>, opts: QueueOptions) -> Result<Queue> {
        let db_path = db_path.into();
        let conn = Connection::open(&db_path)
            .with_context(|| format!("failed to open queue database {}", db_path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=5000;

            CREATE TABLE IF NOT EXISTS queue(
                id VARCHAR(36) PRIMARY KEY,
                task TEXT NOT NULL,
                enqueued INT NOT NULL,
                fetched INT,
                acked INT,
                blob JSON NOT NULL,
                retries INT DEFAULT 0 NOT NULL,
                eta INT
            );
            CREATE INDEX IF NOT EXISTS idx_queue_enqueued ON queue(enqueued);

            -- orig_enqueued keeps the first enqueue time for forensics; the
            -- enqueued column is rewritten to the routing time
            CREATE TABLE IF NOT EXISTS deadletter(
                id VARCHAR(36) PRIMARY KEY,
                task TEXT NOT NULL,
                enqueued INT NOT NULL,
                orig_enqueued INT,
                fetched INT,
                acked INT,
                blob JSON NOT NULL,
                retries INT DEFAULT 0 NOT NULL,
                eta INT
            );
            CREATE INDEX IF NOT EXISTS idx_deadletter_enqueued ON deadletter(enqueued);
            "#,
        )
        .context("failed to bootstrap queue schema")?;

        Ok(Queue {
            db_path,
            opts,
            put_count: AtomicU32::new(0),
            metrics: QueueMetrics::default(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Insert `msg` into the chosen table with `enqueued` set to now.
    ///
    /// Returns the message id. Only queue-route puts count towards the prune
    /// interval.
    pub fn put(&self, msg: &Message, route: Route) -> Result<Uuid> {
        let (id, task, blob, retries, eta) = msg.to_row()?;
        let enqueued = now_ms();
        match route {
            Route::Queue => {
                with_connection(&self.db_path, |tx| {
                    tx.execute(
                        "INSERT INTO queue(id, task, enqueued, blob, retries, eta)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![id, task, enqueued, blob, retries, eta],
                    )?;
                    Ok(())
                })?;
                self.put_count.fetch_add(1, Ordering::Relaxed);
                self.metrics.puts.fetch_add(1, Ordering::Relaxed);
            }
            Route::Deadletter => {
                with_connection(&self.db_path, |tx| {
                    tx.execute(
                        "INSERT INTO deadletter(id, task, enqueued, blob, retries, eta)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![id, task, enqueued, blob, retries, eta],
                    )?;
                    Ok(())
                })?;
            }
        }
        Ok(msg.id)
    }

    /// Lease the oldest eligible message, or return `None`.
    ///
    /// On the queue route the select and the lease stamp run in one
    /// transaction, so two concurrent calls can never lease the same row.
    /// Dead letter rows are returned without being leased; they are consumed
    /// by [`Queue::deadletter_requeue`], not by workers.
    pub fn get(&self, route: Route) -> Result<Option<Message>> {
        let now = now_ms();
        let raw = with_connection(&self.db_path, |tx| {
            let raw: Option<(String, String, String, u32, Option<i64>)> = match route {
                Route::Queue => tx
                    .query_row(
                        "SELECT id, task, blob, retries, eta FROM queue
                         WHERE fetched IS NULL AND (eta IS NULL OR eta <= ?1)
                         ORDER BY enqueued LIMIT 1",
                        params![now],
                        |row| {
                            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                        },
                    )
                    .optional()?,
                Route::Deadletter => tx
                    .query_row(
                        "SELECT id, task, blob, retries, eta FROM deadletter
                         WHERE fetched IS NULL ORDER BY enqueued LIMIT 1",
                        [],
                        |row| {
                            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                        },
                    )
                    .optional()?,
            };
            if route == Route::Queue {
                if let Some((id, ..)) = &raw {
                    tx.execute(
                        "UPDATE queue SET fetched = ?1 WHERE id = ?2",
                        params![now, id],
                    )?;
                }
            }
            Ok(raw)
        })?;

        raw.map(|(id, task, blob, retries, eta)| Message::from_row(&id, task, &blob, retries, eta))
            .transpose()
    }

    /// Acknowledge a leased message and trigger a prune pass when due
    pub fn task_done(&self, msg: &Message) -> Result<()> {
        let id = msg.id_hex();
        with_connection(&self.db_path, |tx| {
            tx.execute(
                "UPDATE queue SET acked = ?1 WHERE id = ?2",
                params![now_ms(), id],
            )?;
            Ok(())
        })?;

        if self.put_count.load(Ordering::Relaxed) >= self.opts.prune_interval {
            self.prune()?;
        }
        Ok(())
    }

    /// Record a failed attempt on a leased message.
    ///
    /// Below the retry limit the lease is released and `retries` incremented,
    /// making the row eligible again on the next tick. At the limit the row
    /// moves to the dead letter table in one transaction, preserving its
    /// retry count and original enqueue time.
    pub fn task_failed(&self, msg: &Message) -> Result<()> {
        let id = msg.id_hex();
        if msg.retries >= self.opts.max_retries {
            let (_, task, blob, retries, eta) = msg.to_row()?;
            let now = now_ms();
            with_connection(&self.db_path, |tx| {
                let orig_enqueued: Option<i64> = tx
                    .query_row(
                        "SELECT enqueued FROM queue WHERE id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                tx.execute("DELETE FROM queue WHERE id = ?1", params![id])?;
                tx.execute(
                    "INSERT INTO deadletter(id, task, enqueued, orig_enqueued, blob, retries, eta)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![id, task, now, orig_enqueued, blob, retries, eta],
                )?;
                Ok(())
            })?;
            tracing::warn!(
                id = %msg.id,
                task = %msg.task,
                retries = msg.retries,
                "retries exhausted, message routed to dead letter"
            );
        } else {
            with_connection(&self.db_path, |tx| {
                // an acknowledged row can never become pending again
                tx.execute(
                    "UPDATE queue SET retries = ?1, fetched = NULL
                     WHERE id = ?2 AND acked IS NULL",
                    params![msg.retries + 1, id],
                )?;
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Drain the dead letter table back into the queue with retries reset
    #[allow(dead_code)] // operator maintenance entry point
    pub fn deadletter_requeue(&self) -> Result<()> {
        while let Some(msg) = self.get(Route::Deadletter)? {
            let msg = Message { retries: 0, ..msg };
            self.put(&msg, Route::Queue)?;
            with_connection(&self.db_path, |tx| {
                tx.execute("DELETE FROM deadletter WHERE id = ?1", params![msg.id_hex()])?;
                Ok(())
            })?;
            tracing::info!(id = %msg.id, task = %msg.task, "dead letter message requeued");
        }
        Ok(())
    }

    /// Number of messages currently eligible for lease
    pub fn qsize(&self) -> Result<u64> {
        let now = now_ms();
        with_connection(&self.db_path, |tx| {
            Ok(tx.query_row(
                "SELECT count(1) FROM queue
                 WHERE fetched IS NULL AND (eta IS NULL OR eta <= ?1)",
                params![now],
                |row| row.get(0),
            )?)
        })
    }

    /// Number of dead letter messages awaiting requeue
    pub fn deadletter_qsize(&self) -> Result<u64> {
        with_connection(&self.db_path, |tx| {
            Ok(tx.query_row(
                "SELECT count(1) FROM deadletter WHERE fetched IS NULL",
                [],
                |row| row.get(0),
            )?)
        })
    }

    pub fn empty(&self) -> Result<bool> {
        Ok(self.qsize()? == 0)
    }

    #[allow(dead_code)] // operator maintenance entry point
    pub fn deadletter_empty(&self) -> Result<bool> {
        Ok(self.deadletter_qsize()? == 0)
    }

    /// Delete acknowledged rows beyond the `keep_msg` most recent, then
    /// compact the database file.
    fn prune(&self) -> Result<()> {
        let deleted = with_connection(&self.db_path, |tx| {
            Ok(tx.execute(
                "DELETE FROM queue WHERE acked IS NOT NULL AND id NOT IN (
                     SELECT id FROM queue WHERE acked IS NOT NULL
                     ORDER BY enqueued DESC LIMIT ?1
                 )",
                params![self.opts.keep_msg as i64],
            )?)
        })?;

        // VACUUM requires autocommit mode, so it runs on its own connection
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("VACUUM")?;

        self.put_count.store(0, Ordering::Relaxed);
        self.metrics.prune_runs.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .pruned_rows
            .fetch_add(deleted as u64, Ordering::Relaxed);
        tracing::debug!(deleted, keep = self.opts.keep_msg, "pruned acknowledged queue rows");
        Ok(())
    }
}
