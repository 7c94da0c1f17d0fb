//! The dial attempt engine: one complete call against one
//! destination through one operator on one modem.
//!
//! Drives dial → handshake → hangup → stats → CDR enrichment as a
//! value-returning state machine. Nothing here unwinds on call
//! failure; the outcome tells the whole story and the retry loop
//! decides what happens next.

use crate::cdr::{CdrLookup, VoipCdrLookup, lookup_or_none, lookup_voip_or_none};
use crate::domain::availability::AvailabilityRule;
use crate::domain::cdr::{is_user_busy, should_retry};
use crate::domain::job::{RetryAttempt, TestOutcome};
use crate::domain::operator::Operator;
use crate::domain_types::{PhoneNumber, TestNumber};
use crate::handshake::Handshaker;
use crate::modem::{DialResultCode, ModemPort};
use crate::stats::StatsParser;
use crate::time_provider::SharedTimeProvider;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives intermediate results so every physical dial attempt is
/// durably recorded before the final envelope.
#[async_trait]
pub trait AttemptObserver: Send + Sync {
    /// A retry is about to fire; `attempt` carries the failed
    /// attempt's own timing and outcome.
    async fn on_retry_attempt(&self, attempt: RetryAttempt);

    /// A non-final operator in a failover sequence has finished.
    async fn on_operator_result(&self, outcome: TestOutcome, operator: Operator);
}

/// Observer that drops everything; used on paths with no failover
/// layer and in tests.
pub struct NullObserver;

#[async_trait]
impl AttemptObserver for NullObserver {
    async fn on_retry_attempt(&self, _attempt: RetryAttempt) {}
    async fn on_operator_result(&self, _outcome: TestOutcome, _operator: Operator) {}
}

/// Per-run settings the engine needs.
#[derive(Debug, Clone)]
pub struct DialSettings {
    /// Maximum dial attempts per operator (at least 1).
    pub retry_count: u32,
    pub retry_delay: Duration,
    /// Wait before CDR lookups, covering the switch's asynchronous
    /// write.
    pub cdr_lookup_delay: Duration,
    /// Commands issued after disconnect to collect line statistics.
    pub post_disconnect_commands: Vec<String>,
    /// Settle time before the first post-disconnect command.
    pub post_disconnect_delay: Duration,
}

enum Verdict {
    Final,
    RetryBusy,
    RetryCdr,
}

/// One engine per worker; the modem port is passed per call so the
/// engine itself stays free of device state.
pub struct DialEngine {
    handshaker: Arc<dyn Handshaker>,
    cdr: Option<Arc<dyn CdrLookup>>,
    voip_cdr: Option<Arc<dyn VoipCdrLookup>>,
    stats_parser: Option<Box<dyn StatsParser>>,
    settings: DialSettings,
    time: SharedTimeProvider,
}

impl DialEngine {
    pub fn new(
        handshaker: Arc<dyn Handshaker>,
        cdr: Option<Arc<dyn CdrLookup>>,
        voip_cdr: Option<Arc<dyn VoipCdrLookup>>,
        stats_parser: Option<Box<dyn StatsParser>>,
        settings: DialSettings,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            handshaker,
            cdr,
            voip_cdr,
            stats_parser,
            settings,
            time,
        }
    }

    /// Runs one test call with intra-call retries.
    ///
    /// The returned outcome reflects the final attempt; earlier
    /// attempts surface through `observer`.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_test(
        &self,
        token: &CancellationToken,
        test_num: TestNumber,
        dial_string: &str,
        phone: &PhoneNumber,
        availability: Option<&AvailabilityRule>,
        observer: &dyn AttemptObserver,
        port: &mut dyn ModemPort,
    ) -> TestOutcome {
        let max_attempts = self.settings.retry_count.max(1);

        for attempt in 1..=max_attempts {
            if token.is_cancelled() {
                return TestOutcome::aborted();
            }
            if let Some(rule) = availability {
                if !rule.callable_at(self.time.now()) {
                    return TestOutcome::deferred("call window closed before dial");
                }
            }

            let call_time = self.time.now();
            let (mut outcome, verdict) = self
                .single_attempt(token, call_time, dial_string, phone, port)
                .await;

            // BUSY decides to retry on its own; the CDR lookup that
            // follows is diagnostic (and R2 enrichment on the final
            // attempt), never part of the decision.
            if matches!(verdict, Verdict::RetryBusy) {
                self.enrich_with_cdr(token, phone, call_time, &mut outcome)
                    .await;
                if is_user_busy(outcome.switch_cdr.as_ref()) {
                    info!(%phone, "destination user-busy (Q.850 cause 17)");
                }
            }

            let retry_reason = match verdict {
                Verdict::Final => return outcome,
                _ if attempt == max_attempts => return outcome,
                Verdict::RetryBusy => "line busy".to_string(),
                Verdict::RetryCdr => format!("switch advises retry ({})", outcome.message),
            };

            info!(
                test = test_num.as_u64(),
                attempt,
                max = max_attempts,
                reason = %retry_reason,
                "retrying dial"
            );
            observer
                .on_retry_attempt(RetryAttempt {
                    attempt: attempt as usize,
                    reason: retry_reason,
                    operator: None,
                    outcome: outcome.clone(),
                })
                .await;

            // Edge case: the switch may report NO ANSWER while the
            // modem actually saw CONNECT; never redial in data mode.
            if port.in_data_mode().await.unwrap_or(false) {
                if port.hangup().await.is_err() {
                    let _ = port.reset().await;
                }
            }

            if !self
                .time
                .sleep_cancellable(self.settings.retry_delay, token)
                .await
            {
                return TestOutcome::aborted();
            }
        }

        // retry_count >= 1 means the loop always returns
        TestOutcome::aborted()
    }

    async fn single_attempt(
        &self,
        token: &CancellationToken,
        call_time: chrono::DateTime<chrono::Utc>,
        dial_string: &str,
        phone: &PhoneNumber,
        port: &mut dyn ModemPort,
    ) -> (TestOutcome, Verdict) {
        let dial_started = self.time.instant();

        let dialed = match port.dial(dial_string).await {
            Ok(dialed) => dialed,
            Err(e) => {
                warn!(%phone, error = %e, "dial failed at device level, recovering");
                if let Err(reset_err) = port.recover().await {
                    warn!(%phone, error = %reset_err, "modem recovery failed");
                }
                let mut outcome = TestOutcome::failure(format!("dial error: {e}"));
                outcome.dial_time = dial_started.elapsed();
                self.enrich_with_cdr(token, phone, call_time, &mut outcome)
                    .await;
                return (outcome, Verdict::Final);
            }
        };

        let dial_time = dial_started.elapsed();

        if dialed.code.is_busy() {
            let outcome = TestOutcome {
                dial_time,
                ..TestOutcome::failure("BUSY")
            };
            return (outcome, Verdict::RetryBusy);
        }

        if !dialed.code.is_connect() {
            let mut outcome = TestOutcome::failure(dialed.code.as_str());
            outcome.dial_time = dial_time;
            self.enrich_with_cdr(token, phone, call_time, &mut outcome)
                .await;
            let verdict = if should_retry(outcome.switch_cdr.as_ref()) {
                Verdict::RetryCdr
            } else {
                Verdict::Final
            };
            return (outcome, verdict);
        }

        // CONNECTED
        let mut outcome = TestOutcome {
            dial_time,
            connect_speed: dialed.connect_speed,
            ..TestOutcome::default()
        };
        debug!(%phone, speed = ?outcome.connect_speed, "carrier up, starting handshake");

        let handshake_started = self.time.instant();
        match self.handshaker.handshake(port, token).await {
            Ok(peer) => {
                outcome.success = true;
                outcome.message = match &peer.address {
                    Some(addr) => format!("handshake with {addr}"),
                    None => "handshake complete".to_string(),
                };
                outcome.peer = Some(peer);
            }
            Err(e) => {
                outcome.message = format!("connected, handshake failed: {e}");
            }
        }
        outcome.handshake_time = handshake_started.elapsed();

        // A successful CONNECT always attempts a hangup.
        if port.hangup().await.is_err() {
            let _ = port.reset().await;
        } else if port.in_data_mode().await.unwrap_or(false) {
            let _ = port.reset().await;
        }

        self.collect_stats(token, port, &mut outcome).await;
        self.enrich_with_cdr(token, phone, call_time, &mut outcome)
            .await;

        (outcome, Verdict::Final)
    }

    /// Post-disconnect statistics: settle, drain, run each command,
    /// keep the first successful parse.
    async fn collect_stats(
        &self,
        token: &CancellationToken,
        port: &mut dyn ModemPort,
        outcome: &mut TestOutcome,
    ) {
        let Some(parser) = self.stats_parser.as_deref() else {
            return;
        };
        if self.settings.post_disconnect_commands.is_empty() {
            return;
        }
        if !self
            .time
            .sleep_cancellable(self.settings.post_disconnect_delay, token)
            .await
        {
            return;
        }
        if let Ok(residual) = port.drain_input().await {
            if !residual.is_empty() {
                debug!(bytes = residual.len(), "drained residual modem output");
            }
        }
        for command in &self.settings.post_disconnect_commands {
            match port.command(command).await {
                Ok(text) => {
                    if let Some(stats) = parser.parse(&text) {
                        outcome.line_stats = Some(stats);
                        break;
                    }
                }
                Err(e) => {
                    warn!(command = %command, error = %e, "post-disconnect command failed");
                }
            }
        }
    }

    /// Waits out the CDR write-propagation delay and attaches both
    /// CDR views. Lookup failures degrade to absent records.
    async fn enrich_with_cdr(
        &self,
        token: &CancellationToken,
        phone: &PhoneNumber,
        call_time: chrono::DateTime<chrono::Utc>,
        outcome: &mut TestOutcome,
    ) {
        if self.cdr.is_none() && self.voip_cdr.is_none() {
            return;
        }
        if !self
            .time
            .sleep_cancellable(self.settings.cdr_lookup_delay, token)
            .await
        {
            return;
        }
        outcome.switch_cdr =
            lookup_or_none(self.cdr.as_deref(), token, phone, call_time).await;
        outcome.voip_cdr =
            lookup_voip_or_none(self.voip_cdr.as_deref(), token, phone, call_time).await;
    }
}
