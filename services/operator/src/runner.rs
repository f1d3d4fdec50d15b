//! Controller runner.
//!
//! Feeds resource identities from store watch events and a periodic resync
//! into a work queue, and runs reconciliation passes on a pool of workers.
//! The queue guarantees one identity is never reconciled by two workers at
//! once. The runner owns retry policy:
//!
//! - success: re-add after the requested delay, if any, and reset backoff
//! - error with a requeue hint: re-add after the hint
//! - terminal error: not retried until the next change or resync
//! - other errors and pass timeouts: per-identity exponential backoff

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use mvm_reconcile::{Action, Backoff, WorkQueue, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::api::ObjectKey;
use crate::controller::{MicrovmReconciler, ReconcileError};

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers.
    pub workers: usize,

    /// Interval between full resyncs of every stored resource.
    pub resync_interval: Duration,

    /// Upper bound on one reconciliation pass.
    pub pass_timeout: Duration,

    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval: Duration::from_secs(600),
            pass_timeout: Duration::from_secs(120),
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }
}

/// Result of one pass as seen by the runner.
#[derive(Debug)]
pub enum PassOutcome {
    Completed(Action),
    Failed(ReconcileError),
    TimedOut,
}

/// Decide when `key` should be reconciled again. `None` means only on the
/// next change notification or resync.
pub fn next_attempt(
    outcome: &PassOutcome,
    key: &ObjectKey,
    backoff: &mut Backoff<ObjectKey>,
) -> Option<Duration> {
    match outcome {
        PassOutcome::Completed(action) => {
            backoff.forget(key);
            action.requeue_after
        }
        PassOutcome::Failed(e) if e.is_terminal() => {
            backoff.forget(key);
            None
        }
        PassOutcome::Failed(e) => match e.requeue_after() {
            Some(delay) => {
                backoff.forget(key);
                Some(delay)
            }
            None => Some(backoff.next_delay(key)),
        },
        PassOutcome::TimedOut => Some(backoff.next_delay(key)),
    }
}

struct Shared {
    reconciler: MicrovmReconciler,
    queue: WorkQueue<ObjectKey>,
    backoff: Mutex<Backoff<ObjectKey>>,
    config: ControllerConfig,
}

/// Drives `MicrovmReconciler` from store notifications.
pub struct Controller {
    shared: Arc<Shared>,
}

impl Controller {
    pub fn new(reconciler: MicrovmReconciler, config: ControllerConfig) -> Self {
        let backoff = Backoff::new(config.backoff_base, config.backoff_max);
        Self {
            shared: Arc::new(Shared {
                reconciler,
                queue: WorkQueue::new(),
                backoff: Mutex::new(backoff),
                config,
            }),
        }
    }

    /// Queue `key` for reconciliation.
    pub fn enqueue(&self, key: ObjectKey) {
        self.shared.queue.add(key);
    }

    /// Run until `shutdown` flips to true, then drain the workers.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let config = &self.shared.config;
        info!(
            workers = config.workers,
            resync_interval_secs = config.resync_interval.as_secs(),
            pass_timeout_secs = config.pass_timeout.as_secs(),
            "Starting microvm controller"
        );

        let mut events = self.shared.reconciler.store().watch();
        let workers: Vec<JoinHandle<()>> = (0..config.workers.max(1))
            .map(|id| tokio::spawn(worker(id, Arc::clone(&self.shared))))
            .collect();

        // The first tick fires immediately and performs the initial sync.
        let mut resync = tokio::time::interval(config.resync_interval);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = resync.tick() => {
                    self.resync().await;
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        debug!(key = %event.key(), "Watch event");
                        self.shared.queue.add(event.key().clone());
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Watch stream lagged, resyncing");
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Watch stream closed");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Microvm controller shutting down");
                        break;
                    }
                }
            }
        }

        self.shared.queue.shutdown();
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Microvm controller stopped");
    }

    async fn resync(&self) {
        match self.shared.reconciler.store().list().await {
            Ok(keys) => {
                debug!(count = keys.len(), "Resyncing microvms");
                for key in keys {
                    self.shared.queue.add(key);
                }
            }
            Err(e) => error!(error = %e, "Failed to list microvms for resync"),
        }
    }
}

#[instrument(skip(shared))]
async fn worker(id: usize, shared: Arc<Shared>) {
    debug!("Worker started");

    while let Some(key) = shared.queue.get().await {
        let outcome = match tokio::time::timeout(
            shared.config.pass_timeout,
            shared.reconciler.reconcile(&key),
        )
        .await
        {
            Ok(Ok(action)) => PassOutcome::Completed(action),
            Ok(Err(e)) => PassOutcome::Failed(e),
            Err(_) => PassOutcome::TimedOut,
        };

        let next = {
            let mut backoff = shared.backoff.lock().unwrap_or_else(PoisonError::into_inner);
            next_attempt(&outcome, &key, &mut backoff)
        };

        match &outcome {
            PassOutcome::Completed(_) => {}
            PassOutcome::Failed(e) if e.is_terminal() => {
                error!(key = %key, error = %e, "Reconciliation failed, not retrying");
            }
            PassOutcome::Failed(e) => {
                warn!(key = %key, error = %e, "Reconciliation failed");
            }
            PassOutcome::TimedOut => {
                warn!(key = %key, timeout_secs = shared.config.pass_timeout.as_secs(), "Reconciliation timed out");
            }
        }

        if let Some(delay) = next {
            debug!(key = %key, ?delay, "Requeueing");
            shared.queue.add_after(key.clone(), delay);
        }
        shared.queue.done(&key);
    }

    debug!("Worker stopped");
}
