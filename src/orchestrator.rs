//! The orchestrator: drives one full run.
//!
//! Submits scheduled jobs into the pool at a paced rate, collects
//! result envelopes into statistics and sinks, re-schedules deferred
//! destinations in follow-up rounds, and shuts the pool down
//! gracefully on completion or cancellation.

use crate::domain::destination::Destination;
use crate::pool::ModemPool;
use crate::scheduler::{OperatorMap, SequenceSource, schedule};
use crate::sinks::SinkSet;
use crate::summary::RunStats;
use crate::time_provider::SharedTimeProvider;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Floor for the pacing delay between job submissions.
const MIN_SUBMISSION_DELAY: Duration = Duration::from_millis(50);

/// Outcome of a full run.
pub struct RunReport {
    pub stats: RunStats,
    pub cancelled: bool,
}

/// Top-level run driver.
pub struct Orchestrator {
    pool: ModemPool,
    sinks: Arc<SinkSet>,
    operator_map: Arc<OperatorMap>,
    time: SharedTimeProvider,
    token: CancellationToken,
    /// The configured pause between tests; divided across workers
    /// for submission pacing.
    overall_pause: Duration,
}

impl Orchestrator {
    pub fn new(
        pool: ModemPool,
        sinks: Arc<SinkSet>,
        operator_map: Arc<OperatorMap>,
        time: SharedTimeProvider,
        token: CancellationToken,
        overall_pause: Duration,
    ) -> Self {
        Self {
            pool,
            sinks,
            operator_map,
            time,
            token,
            overall_pause,
        }
    }

    /// Pacing between submissions: the overall pause spread across
    /// the workers, floored so a large pool cannot busy-spin.
    fn submission_delay(&self) -> Duration {
        let workers = u32::try_from(self.pool.worker_count().max(1)).unwrap_or(1);
        (self.overall_pause / workers).max(MIN_SUBMISSION_DELAY)
    }

    /// Runs the full test: initial round plus deferred re-scheduling
    /// rounds, until no deferrals remain or the run is cancelled.
    pub async fn run(mut self, destinations: Vec<Destination>) -> RunReport {
        info!(
            destinations = destinations.len(),
            workers = self.pool.worker_count(),
            pacing_ms = self.submission_delay().as_millis(),
            "starting test session"
        );
        for operator in self.operator_map.default_operators() {
            info!(operator = %operator, "configured operator");
        }

        let stats = Arc::new(Mutex::new(RunStats::new()));
        let deferred: Arc<Mutex<Vec<Destination>>> = Arc::new(Mutex::new(Vec::new()));
        let (completed_tx, mut completed_rx) = watch::channel(0u64);

        self.pool.start();
        let results = self.pool.take_results();
        let collector = tokio::spawn(collect_results(
            results,
            self.sinks.clone(),
            stats.clone(),
            deferred.clone(),
            completed_tx,
        ));

        let sequence = Arc::new(SequenceSource::new());
        let submission_delay = self.submission_delay();
        let mut submitted_total: u64 = 0;
        let mut round_destinations = destinations;
        let mut round = 0u32;

        loop {
            round += 1;
            if round > 1 {
                info!(round, deferred = round_destinations.len(), "re-scheduling deferred destinations");
            }

            let jobs = schedule(
                self.token.clone(),
                round_destinations,
                self.operator_map.clone(),
                sequence.clone(),
                self.time.clone(),
            );

            while let Ok(job) = jobs.recv_async().await {
                if self.token.is_cancelled() {
                    break;
                }
                if !self.pool.submit_job(&self.token, job).await {
                    warn!("job submission failed, stopping submissions");
                    break;
                }
                stats.lock().await.record_submitted();
                submitted_total += 1;
                if !self
                    .time
                    .sleep_cancellable(submission_delay, &self.token)
                    .await
                {
                    break;
                }
            }

            // Wait for every submitted job to produce its final
            // envelope, or for cancellation.
            loop {
                if *completed_rx.borrow() >= submitted_total {
                    break;
                }
                tokio::select! {
                    changed = completed_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    () = self.token.cancelled() => break,
                }
            }

            if self.token.is_cancelled() {
                break;
            }

            let next: Vec<Destination> = std::mem::take(&mut *deferred.lock().await);
            if next.is_empty() {
                break;
            }
            round_destinations = next;
        }

        let cancelled = self.token.is_cancelled();
        if cancelled {
            self.pool.cancel();
        }
        self.pool.stop().await;
        if let Err(e) = collector.await {
            warn!(error = %e, "result collector join failed");
        }
        self.sinks.close_all().await;

        let stats = std::mem::take(&mut *stats.lock().await);
        RunReport { stats, cancelled }
    }
}

/// Drains the result channel: statistics, sinks, and the deferred
/// set for re-scheduling.
async fn collect_results(
    mut results: tokio::sync::mpsc::Receiver<crate::domain::job::ResultEnvelope>,
    sinks: Arc<SinkSet>,
    stats: Arc<Mutex<RunStats>>,
    deferred: Arc<Mutex<Vec<Destination>>>,
    completed_tx: watch::Sender<u64>,
) {
    let mut completed: u64 = 0;
    while let Some(envelope) = results.recv().await {
        sinks.write_all(&envelope).await;

        let is_final = stats.lock().await.record(&envelope);
        if is_final && envelope.window_closed {
            deferred.lock().await.push(envelope.destination.clone());
        }
        if is_final {
            completed += 1;
            let _ = completed_tx.send(completed);
        }
    }
    info!(completed, "result collector finished");
}
