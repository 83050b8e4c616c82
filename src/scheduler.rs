//! # Autosync Scheduler
//!
//! Two background loops sharing one shutdown token:
//!
//! - the sweep loop sleeps a jittered interval, then runs a pool of workers that
//!   claim and run queued pipes until every worker finds the queue empty;
//! - the enqueue loop sleeps a jittered multiple of the sweep interval, then queues
//!   every automatic pipe.

use std::sync::Arc;

use metrics::{counter, histogram};
use rand::Rng;
use serde_json::json;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::queue::{JobQueue, QueueEntry, QueueError};
use crate::sync::SyncOrchestrator;
use crate::telemetry::ErrorNotifier;

pub struct AutosyncScheduler {
    orchestrator: Arc<SyncOrchestrator>,
    queue: JobQueue,
    notifier: Arc<dyn ErrorNotifier>,
    config: SchedulerConfig,
    instance_id: String,
}

impl AutosyncScheduler {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        notifier: Arc<dyn ErrorNotifier>,
        config: SchedulerConfig,
    ) -> Self {
        let queue = orchestrator.queue().clone();
        Self {
            orchestrator,
            queue,
            notifier,
            config,
            instance_id: Uuid::new_v4().simple().to_string(),
        }
    }

    /// Run both loops until the provided shutdown token fires.
    #[instrument(skip_all, fields(instance_id = %self.instance_id))]
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            workers = self.config.worker_count,
            sweep_interval_seconds = self.config.sweep_interval_seconds,
            "Starting autosync scheduler"
        );
        tokio::join!(
            self.sweep_loop(shutdown.clone()),
            self.enqueue_loop(shutdown)
        );
        info!("Autosync scheduler stopped");
    }

    async fn sweep_loop(&self, shutdown: CancellationToken) {
        let base = self.config.sweep_interval_seconds;
        loop {
            let delay = base + sample_jitter_seconds(base, self.config.sweep_jitter_pct);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(Duration::from_secs(delay)) => {
                    self.sweep_once(&shutdown).await;
                }
            }
        }
        debug!("Sweep loop stopped");
    }

    async fn enqueue_loop(&self, shutdown: CancellationToken) {
        let base =
            self.config.sweep_interval_seconds * u64::from(self.config.enqueue_interval_multiplier);
        loop {
            let delay = base + sample_jitter_seconds(base, self.config.sweep_jitter_pct);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(Duration::from_secs(delay)) => {
                    self.enqueue_once().await;
                }
            }
        }
        debug!("Enqueue loop stopped");
    }

    /// Runs the worker pool until every worker reports idle.
    ///
    /// Returns the number of queue entries processed.
    pub async fn sweep_once(&self, shutdown: &CancellationToken) -> u64 {
        let started = Instant::now();
        let mut workers = JoinSet::new();
        for index in 0..self.config.worker_count {
            let worker = Worker {
                id: format!("{}-{}", self.instance_id, index),
                orchestrator: Arc::clone(&self.orchestrator),
                queue: self.queue.clone(),
                notifier: Arc::clone(&self.notifier),
                config: self.config.clone(),
                shutdown: shutdown.clone(),
            };
            workers.spawn(worker.run());
        }

        let mut processed = 0;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(count) => processed += count,
                Err(err) => error!(error = ?err, "Sweep worker panicked"),
            }
        }

        histogram!("pipes_sweep_duration_ms").record(started.elapsed().as_secs_f64() * 1_000.0);
        if processed > 0 {
            info!(processed, "Sweep finished");
        }
        processed
    }

    /// Queues automatic pipes once. Returns the number queued, or `None` on failure.
    pub async fn enqueue_once(&self) -> Option<u64> {
        match self.queue.enqueue_automatic().await {
            Ok(inserted) => Some(inserted),
            Err(err) if err.is_duplicate() => {
                debug!("Automatic enqueue raced another instance");
                None
            }
            Err(err) => {
                error!(error = ?err, "Automatic enqueue failed");
                self.notifier
                    .notify(&err, json!({ "instance_id": self.instance_id, "loop": "enqueue" }));
                None
            }
        }
    }
}

struct Worker {
    id: String,
    orchestrator: Arc<SyncOrchestrator>,
    queue: JobQueue,
    notifier: Arc<dyn ErrorNotifier>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) -> u64 {
        let mut processed = 0;
        let mut empty_claims = 0;

        while !self.shutdown.is_cancelled() {
            match self.queue.claim_batch(&self.id).await {
                Ok(entries) if !entries.is_empty() => {
                    empty_claims = 0;
                    for entry in entries {
                        self.process(entry).await;
                        processed += 1;
                    }
                    continue;
                }
                Ok(_) => {}
                Err(err) => {
                    counter!("pipes_claim_errors_total").increment(1);
                    error!(worker = %self.id, error = ?err, "Claim failed");
                }
            }

            empty_claims += 1;
            if empty_claims >= self.config.empty_claims_before_idle {
                break;
            }
            self.backoff().await;
        }

        debug!(worker = %self.id, processed, "Worker idle");
        processed
    }

    async fn process(&self, entry: QueueEntry) {
        match self.orchestrator.run_queued(&entry).await {
            Ok(status) => {
                debug!(
                    worker = %self.id,
                    workspace_id = entry.workspace_id,
                    pipe = %entry.pipe,
                    state = status.state.as_str(),
                    "Queued run finished"
                );
            }
            Err(err) => {
                error!(
                    worker = %self.id,
                    workspace_id = entry.workspace_id,
                    pipe = %entry.pipe,
                    error = ?err,
                    "Queued run failed"
                );
                self.notifier.notify(
                    &err,
                    json!({
                        "workspace_id": entry.workspace_id,
                        "pipe": entry.pipe.key(),
                        "queue_entry_id": entry.id.to_string(),
                    }),
                );
            }
        }

        // Completed even after a failed run so the entry cannot be retried forever.
        self.complete(&entry).await;
    }

    async fn complete(&self, entry: &QueueEntry) {
        let attempts = self.config.complete_retry_attempts.max(1);
        for attempt in 1..=attempts {
            match self.queue.mark_complete(entry.id, &self.id).await {
                Ok(()) => return,
                Err(err @ QueueError::NotClaimed { .. }) => {
                    warn!(worker = %self.id, error = %err, "Queue entry no longer held");
                    return;
                }
                Err(err) => {
                    warn!(worker = %self.id, attempt, error = %err, "Marking queue entry complete failed");
                    if attempt < attempts {
                        self.backoff().await;
                    }
                }
            }
        }
        error!(worker = %self.id, entry_id = %entry.id, "Giving up on completing queue entry");
    }

    async fn backoff(&self) {
        let delay = {
            let mut rng = rand::thread_rng();
            compute_backoff_ms(
                self.config.idle_backoff_ms_min,
                self.config.idle_backoff_ms_max,
                &mut rng,
            )
        };
        sleep(Duration::from_millis(delay)).await;
    }
}

fn sample_jitter_seconds(base_interval_seconds: u64, jitter_pct: f64) -> u64 {
    let mut rng = rand::thread_rng();
    compute_jitter_seconds(base_interval_seconds, jitter_pct, &mut rng)
}

/// Random extra delay of up to `jitter_pct` of the base interval.
fn compute_jitter_seconds<R: Rng + ?Sized>(
    base_interval_seconds: u64,
    jitter_pct: f64,
    rng: &mut R,
) -> u64 {
    let max = jitter_pct.clamp(0.0, 1.0);
    if max == 0.0 {
        return 0;
    }
    (base_interval_seconds as f64 * rng.gen_range(0.0..=max)).round() as u64
}

fn compute_backoff_ms<R: Rng + ?Sized>(min: u64, max: u64, rng: &mut R) -> u64 {
    if max <= min {
        return min;
    }
    rng.gen_range(min..=max)
}
