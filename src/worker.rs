//! Background worker: drains the queue and dispatches messages to handlers
//!
//! The worker is a dedicated OS thread so handlers are free to block on
//! network and database I/O. It processes one message at a time:
//!
//! ```text
//! loop: queue.empty()? ──yes──→ sleep(poll_interval)
//!          │no
//!          ▼
//!       queue.get() → registry lookup → handler(msg, cfg)
//!          │                               │
//!          │ Ok: queue.task_done           │ Err: log + queue.task_failed
//! ```
//!
//! Handlers are looked up by the persisted task name, so tasks survive
//! process restarts. The registry is built once at startup and read-only
//! afterwards; closures are accepted so tests can register doubles.

use crate::config::Config;
use crate::queue::{Message, Queue, Route};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long the worker sleeps when the queue is empty
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A task handler: receives the message and the runtime configuration.
///
/// Any error routes the message through the retry / dead letter path.
pub type Handler = Arc<dyn Fn(&Message, &Config) -> Result<()> + Send + Sync>;

/// Immutable name → handler table, built once at startup
pub struct Registry {
    handlers: HashMap<String, Handler>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            handlers: HashMap::new(),
        }
    }

    pub fn get(&self, task: &str) -> Option<&Handler> {
        self.handlers.get(task)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

pub struct RegistryBuilder {
    handlers: HashMap<String, Handler>,
}

impl RegistryBuilder {
    /// Register `handler` under `name`; later registrations win
    pub fn register<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Message, &Config) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            handlers: self.handlers,
        }
    }
}

/// Long-running worker thread draining the queue
pub struct Worker {
    queue: Arc<Queue>,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start the worker thread.
    ///
    /// The thread keeps running until [`Worker::finish_and_join`] or
    /// [`Worker::stop`] is called (or the `running` flag is cleared).
    pub fn spawn(
        queue: Arc<Queue>,
        registry: Arc<Registry>,
        cfg: Config,
        poll_interval: Duration,
    ) -> Result<Worker> {
        let running = Arc::new(AtomicBool::new(true));
        let thread_queue = queue.clone();
        let thread_running = running.clone();
        let handle = thread::Builder::new()
            .name("vpf730-worker".into())
            .spawn(move || {
                run_loop(thread_queue, registry, cfg, thread_running, poll_interval);
            })?;

        Ok(Worker {
            queue,
            poll_interval,
            running,
            handle: Some(handle),
        })
    }

    #[allow(dead_code)] // exercised by the test suite
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Shared stop flag; clearing it downgrades a graceful drain to an
    /// abrupt stop (the in-flight message still completes)
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Wait until the queue is drained, then stop the thread and join.
    ///
    /// The wait is abandoned early when the `running` flag is cleared
    /// externally or when the queue cannot be polled anymore.
    pub fn finish_and_join(mut self) {
        while self.running.load(Ordering::Relaxed) {
            match self.queue.empty() {
                Ok(true) => break,
                Ok(false) => thread::sleep(self.poll_interval),
                Err(err) => {
                    tracing::error!("queue poll failed while draining: {err:#}");
                    break;
                }
            }
        }
        self.running.store(false, Ordering::Relaxed);
        self.join();
    }

    /// Stop without draining; the message currently being processed completes
    pub fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.join();
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.join();
    }
}

fn run_loop(
    queue: Arc<Queue>,
    registry: Arc<Registry>,
    cfg: Config,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    tracing::debug!(poll_interval_ms = poll_interval.as_millis() as u64, "worker started");
    while running.load(Ordering::Relaxed) {
        let empty = match queue.empty() {
            Ok(empty) => empty,
            Err(err) => {
                // transient store failure: the tick is retried on the next poll
                tracing::error!("queue poll failed: {err:#}");
                thread::sleep(poll_interval);
                continue;
            }
        };
        if empty {
            thread::sleep(poll_interval);
            continue;
        }

        let msg = match queue.get(Route::Queue) {
            Ok(Some(msg)) => msg,
            // raced with an eta boundary; re-check on the next iteration
            Ok(None) => continue,
            Err(err) => {
                tracing::error!("queue fetch failed: {err:#}");
                thread::sleep(poll_interval);
                continue;
            }
        };
        dispatch(&queue, &registry, &cfg, &msg);
    }
    tracing::debug!("worker stopped");
}

fn dispatch(queue: &Queue, registry: &Registry, cfg: &Config, msg: &Message) {
    let result = match registry.get(&msg.task) {
        Some(handler) => handler(msg, cfg),
        None => Err(anyhow!("no handler registered for task {:?}", msg.task)),
    };

    match result {
        Ok(()) => {
            if let Err(err) = queue.task_done(msg) {
                tracing::error!(id = %msg.id, "failed to acknowledge message: {err:#}");
            }
        }
        Err(err) => {
            tracing::error!(
                id = %msg.id,
                task = %msg.task,
                retries = msg.retries,
                "task failed: {err:#}"
            );
            if let Err(err) = queue.task_failed(msg) {
                tracing::error!(id = %msg.id, "failed to record task failure: {err:#}");
            }
        }
    }
}
