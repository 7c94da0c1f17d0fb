//! The modem pool: constructs one worker per enabled modem, owns the
//! shared job and result channels, and performs drain-then-stop
//! shutdown so no in-flight result is lost.

use crate::cdr::{CdrLookup, VoipCdrLookup};
use crate::config::Config;
use crate::coordinator::PhoneCoordinator;
use crate::dialer::{DialEngine, DialSettings};
use crate::domain::job::{Job, ResultEnvelope};
use crate::domain_types::ModemName;
use crate::handshake::Handshaker;
use crate::modem::ModemFactory;
use crate::operator_cache::OperatorCache;
use crate::stats::parser_for_profile;
use crate::time_provider::SharedTimeProvider;
use crate::worker::{ModemWorker, open_with_recovery};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Job queue depth; decouples producer pacing from worker completion
/// jitter.
const JOB_CHANNEL_CAPACITY: usize = 128;

/// Errors from pool construction.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no modem could be opened")]
    NoWorkers,

    #[error("invalid modem name {0:?}")]
    BadModemName(String),
}

/// Shared collaborators handed to every worker.
pub struct PoolDeps {
    pub factory: Arc<dyn ModemFactory>,
    pub handshaker: Arc<dyn Handshaker>,
    pub cdr: Option<Arc<dyn CdrLookup>>,
    pub voip_cdr: Option<Arc<dyn VoipCdrLookup>>,
    pub cache: Arc<OperatorCache>,
    pub coordinator: Arc<PhoneCoordinator>,
    pub time: SharedTimeProvider,
}

/// Worker pool around the shared job/result channels.
pub struct ModemPool {
    workers: Vec<ModemWorker>,
    handles: Vec<JoinHandle<()>>,
    job_tx: Option<flume::Sender<Job>>,
    result_tx: Option<mpsc::Sender<ResultEnvelope>>,
    result_rx: Option<mpsc::Receiver<ResultEnvelope>>,
    token: CancellationToken,
    worker_count: usize,
}

impl ModemPool {
    /// Builds workers for every enabled modem. A modem that fails to
    /// open is logged and skipped; construction fails only when none
    /// opens.
    pub async fn build(
        config: &Config,
        deps: PoolDeps,
        parent: &CancellationToken,
    ) -> Result<Self, PoolError> {
        let token = parent.child_token();
        let (job_tx, job_rx) = flume::bounded::<Job>(JOB_CHANNEL_CAPACITY);

        let mut workers = Vec::new();
        for modem_config in config.enabled_modems() {
            let name = ModemName::try_new(modem_config.name.clone())
                .map_err(|_| PoolError::BadModemName(modem_config.name.clone()))?;

            let port = match open_with_recovery(deps.factory.as_ref(), modem_config).await {
                Ok(port) => port,
                Err(e) => {
                    error!(modem = %name, device = %modem_config.device, error = %e,
                        "modem open failed, skipping");
                    continue;
                }
            };

            let stats_parser = modem_config.stats_profile.as_deref().and_then(|profile| {
                let parser = parser_for_profile(profile);
                if parser.is_none() {
                    warn!(modem = %name, profile, "unknown stats profile, stats disabled");
                }
                parser
            });

            let engine = DialEngine::new(
                deps.handshaker.clone(),
                deps.cdr.clone(),
                deps.voip_cdr.clone(),
                stats_parser,
                DialSettings {
                    retry_count: config.test.retry_count,
                    retry_delay: config.test.retry_delay(),
                    cdr_lookup_delay: config.test.cdr_lookup_delay(),
                    post_disconnect_commands: modem_config.post_disconnect_commands.clone(),
                    post_disconnect_delay: modem_config.timings.post_disconnect_delay(),
                },
                deps.time.clone(),
            );

            workers.push((name, port, engine));
        }

        if workers.is_empty() {
            return Err(PoolError::NoWorkers);
        }

        let worker_count = workers.len();
        let (result_tx, result_rx) = mpsc::channel::<ResultEnvelope>(worker_count * 2);

        let workers = workers
            .into_iter()
            .map(|(name, port, engine)| {
                ModemWorker::new(
                    name,
                    port,
                    engine,
                    deps.coordinator.clone(),
                    deps.cache.clone(),
                    job_rx.clone(),
                    result_tx.clone(),
                    token.clone(),
                    config.test.inter_test_delay(),
                    deps.time.clone(),
                )
            })
            .collect();

        Ok(Self {
            workers,
            handles: Vec::new(),
            job_tx: Some(job_tx),
            result_tx: Some(result_tx),
            result_rx: Some(result_rx),
            token,
            worker_count,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Takes the result receiver; the collector task owns it for the
    /// run. Panics if taken twice.
    pub fn take_results(&mut self) -> mpsc::Receiver<ResultEnvelope> {
        self.result_rx.take().expect("result receiver already taken")
    }

    /// Spawns all workers.
    pub fn start(&mut self) {
        info!(workers = self.worker_count, "starting modem pool");
        for worker in self.workers.drain(..) {
            self.handles.push(tokio::spawn(worker.run()));
        }
    }

    /// Blocking submit; returns `false` when `token` or the pool
    /// itself is cancelled or the pool is already stopping.
    pub async fn submit_job(&self, token: &CancellationToken, job: Job) -> bool {
        let Some(job_tx) = self.job_tx.as_ref() else {
            return false;
        };
        tokio::select! {
            sent = job_tx.send_async(job) => sent.is_ok(),
            () = token.cancelled() => false,
            () = self.token.cancelled() => false,
        }
    }

    /// Pre-emptive cancellation: workers finish their in-flight job
    /// and exit without draining the queue.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Graceful shutdown: close the job channel first (no more
    /// work), wait for workers to finish in-flight jobs, then cancel
    /// and close the result channel. The ordering guarantees every
    /// envelope for an accepted job is emitted before the result
    /// channel closes.
    pub async fn stop(&mut self) {
        drop(self.job_tx.take());
        let handles = std::mem::take(&mut self.handles);
        for joined in futures::future::join_all(handles).await {
            if let Err(e) = joined {
                warn!(error = %e, "worker task join failed");
            }
        }
        self.token.cancel();
        drop(self.result_tx.take());
        info!("modem pool stopped");
    }
}
