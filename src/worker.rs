//! A modem worker: the long-lived agent bound to one physical modem.
//!
//! Owns its device exclusively for the process lifetime and drives
//! jobs strictly serially — the device is not thread-safe and the
//! ordering guarantees (dial before handshake before hangup before
//! stats before result) fall out of this single loop.

use crate::config::ModemInstanceConfig;
use crate::coordinator::PhoneCoordinator;
use crate::dialer::{AttemptObserver, DialEngine};
use crate::domain::destination::Destination;
use crate::domain::job::{Job, ResultEnvelope, RetryAttempt, TestOutcome};
use crate::domain::operator::Operator;
use crate::domain_types::{ModemName, TestNumber};
use crate::failover::run_test_with_failover;
use crate::modem::{ModemError, ModemFactory, ModemPort};
use crate::operator_cache::OperatorCache;
use crate::time_provider::SharedTimeProvider;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

/// How long to wait for a USB device node to reappear after a
/// cable-level reset.
const DEVICE_REAPPEAR_TIMEOUT: Duration = Duration::from_secs(10);
const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Emits intermediate envelopes for one job in flight.
struct EnvelopeObserver<'a> {
    modem: &'a ModemName,
    destination: &'a Destination,
    test_num: TestNumber,
    results: &'a mpsc::Sender<ResultEnvelope>,
}

impl EnvelopeObserver<'_> {
    async fn emit(&self, outcome: TestOutcome, operator: Operator) {
        let envelope = ResultEnvelope::new(
            self.modem.clone(),
            self.destination.clone(),
            operator,
            self.test_num,
            outcome,
            true,
        );
        if self.results.send(envelope).await.is_err() {
            warn!("result channel closed while emitting intermediate result");
        }
    }
}

#[async_trait]
impl AttemptObserver for EnvelopeObserver<'_> {
    async fn on_retry_attempt(&self, attempt: RetryAttempt) {
        let operator = attempt.operator.unwrap_or_else(Operator::direct);
        let mut outcome = attempt.outcome;
        outcome.message = format!("attempt {}: {} ({})", attempt.attempt, outcome.message, attempt.reason);
        self.emit(outcome, operator).await;
    }

    async fn on_operator_result(&self, outcome: TestOutcome, operator: Operator) {
        self.emit(outcome, operator).await;
    }
}

/// Opens the modem, retrying once through a USB-level reset when the
/// device is USB-attached.
pub async fn open_with_recovery(
    factory: &dyn ModemFactory,
    config: &ModemInstanceConfig,
) -> Result<Box<dyn ModemPort>, ModemError> {
    match factory.open(config).await {
        Ok(port) => Ok(port),
        Err(first) => {
            if config.usb.is_none() {
                return Err(first);
            }
            warn!(
                device = %config.device,
                error = %first,
                "modem open failed, attempting USB reset"
            );
            factory.usb_reset(config).await?;
            wait_for_device(&config.device).await;
            factory.open(config).await
        }
    }
}

async fn wait_for_device(device: &str) {
    let deadline = tokio::time::Instant::now() + DEVICE_REAPPEAR_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if std::path::Path::new(device).exists() {
            return;
        }
        tokio::time::sleep(DEVICE_POLL_INTERVAL).await;
    }
}

/// One worker: a modem port, a dial engine, and the shared channels.
pub struct ModemWorker {
    name: ModemName,
    port: Box<dyn ModemPort>,
    engine: DialEngine,
    coordinator: Arc<PhoneCoordinator>,
    cache: Arc<OperatorCache>,
    jobs: flume::Receiver<Job>,
    results: mpsc::Sender<ResultEnvelope>,
    token: CancellationToken,
    inter_test_delay: Duration,
    time: SharedTimeProvider,
}

impl ModemWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: ModemName,
        port: Box<dyn ModemPort>,
        engine: DialEngine,
        coordinator: Arc<PhoneCoordinator>,
        cache: Arc<OperatorCache>,
        jobs: flume::Receiver<Job>,
        results: mpsc::Sender<ResultEnvelope>,
        token: CancellationToken,
        inter_test_delay: Duration,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            name,
            port,
            engine,
            coordinator,
            cache,
            jobs,
            results,
            token,
            inter_test_delay,
            time,
        }
    }

    /// Service loop: consume jobs until the channel closes or the
    /// pool is cancelled, then release the device.
    pub async fn run(mut self) {
        let span = info_span!("worker", modem = %self.name);
        async {
            info!("worker started");
            loop {
                tokio::select! {
                    () = self.token.cancelled() => break,
                    received = self.jobs.recv_async() => match received {
                        Err(_) => break,
                        Ok(job) => {
                            self.handle_job(job).await;
                            // Pause between tests only when more work is
                            // queued; an idle worker must not sleep.
                            if !self.jobs.is_empty()
                                && !self
                                    .time
                                    .sleep_cancellable(self.inter_test_delay, &self.token)
                                    .await
                            {
                                break;
                            }
                        }
                    }
                }
            }
            self.port.close().await;
            info!("worker stopped");
        }
        .instrument(span)
        .await;
    }

    async fn handle_job(&mut self, job: Job) {
        let phone = job.destination.phone.clone();

        if !self.coordinator.acquire(&self.token, &phone, &self.name).await {
            self.emit_final(&job, Operator::direct(), TestOutcome::aborted())
                .await;
            return;
        }

        let observer = EnvelopeObserver {
            modem: &self.name,
            destination: &job.destination,
            test_num: job.test_num,
            results: &self.results,
        };

        let failover = run_test_with_failover(
            &self.engine,
            &self.token,
            &job,
            &self.cache,
            &observer,
            &self.time,
            self.port.as_mut(),
        )
        .await;

        let operator = failover.attributed_operator();
        self.emit_final(&job, operator, failover.outcome).await;

        self.coordinator.release(&phone).await;
    }

    async fn emit_final(&self, job: &Job, operator: Operator, outcome: TestOutcome) {
        let envelope = ResultEnvelope::new(
            self.name.clone(),
            job.destination.clone(),
            operator,
            job.test_num,
            outcome,
            false,
        );
        if self.results.send(envelope).await.is_err() {
            warn!(test = job.test_num.as_u64(), "result channel closed before final result");
        }
    }
}
