//! Operator failover: apply a job's operator list to one call,
//! biased by the operator cache.

use crate::dialer::{AttemptObserver, DialEngine};
use crate::domain::job::{FailoverOutcome, Job, RetryAttempt, TestOutcome};
use crate::domain::operator::{Operator, find_operator_by_name, reorder_with_cached};
use crate::modem::ModemPort;
use crate::operator_cache::OperatorCache;
use crate::time_provider::SharedTimeProvider;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Annotates retry attempts with the operator currently being tried
/// so intermediate envelopes carry correct attribution.
struct OperatorScoped<'a> {
    inner: &'a dyn AttemptObserver,
    operator: Operator,
}

#[async_trait]
impl AttemptObserver for OperatorScoped<'_> {
    async fn on_retry_attempt(&self, mut attempt: RetryAttempt) {
        if !self.operator.name.is_empty() {
            attempt.reason = format!("{} via {}", attempt.reason, self.operator.name);
        }
        attempt.operator = Some(self.operator.clone());
        self.inner.on_retry_attempt(attempt).await;
    }

    async fn on_operator_result(&self, outcome: TestOutcome, operator: Operator) {
        self.inner.on_operator_result(outcome, operator).await;
    }
}

fn window_closed_outcome(job: &Job, tried: usize, last: Option<Operator>) -> FailoverOutcome {
    FailoverOutcome {
        outcome: TestOutcome::deferred(format!(
            "call window for {} closed, deferring",
            job.destination.phone
        )),
        succeeded_operator: None,
        last_operator: last,
        operators_tried: tried,
        all_operators_failed: false,
        window_closed: true,
    }
}

/// Runs one job through its operator list.
///
/// With an empty list this is a single direct dial. Otherwise the
/// cached last-working operator (when still configured) is tried
/// first, then the rest in configured order; success refreshes the
/// cache and exhaustion invalidates it.
#[allow(clippy::too_many_arguments)]
pub async fn run_test_with_failover(
    engine: &DialEngine,
    token: &CancellationToken,
    job: &Job,
    cache: &OperatorCache,
    observer: &dyn AttemptObserver,
    time: &SharedTimeProvider,
    port: &mut dyn ModemPort,
) -> FailoverOutcome {
    let phone = &job.destination.phone;

    if job.operators.is_empty() {
        let outcome = engine
            .run_test(
                token,
                job.test_num,
                phone.as_ref(),
                phone,
                job.destination.availability.as_ref(),
                observer,
                port,
            )
            .await;
        let window_closed = outcome.window_closed;
        let failed = !outcome.success && !window_closed && !outcome.cancelled;
        return FailoverOutcome {
            outcome,
            succeeded_operator: None,
            last_operator: None,
            operators_tried: 1,
            all_operators_failed: failed,
            window_closed,
        };
    }

    let operators = match cache.get(phone).await {
        Some(cached) => {
            if find_operator_by_name(&job.operators, &cached.operator_name).is_some() {
                info!(%phone, operator = %cached.operator_name, "trying cached operator first");
                reorder_with_cached(&job.operators, &cached)
            } else {
                warn!(
                    %phone,
                    operator = %cached.operator_name,
                    "cached operator no longer configured, ignoring"
                );
                job.operators.clone()
            }
        }
        None => job.operators.clone(),
    };

    if let Some(rule) = job.destination.availability.as_ref() {
        if !rule.callable_at(time.now()) {
            return window_closed_outcome(job, 0, None);
        }
    }

    let total = operators.len();
    let mut last_outcome = TestOutcome::failure("no operators tried");

    for (index, operator) in operators.iter().enumerate() {
        if token.is_cancelled() {
            return FailoverOutcome {
                outcome: TestOutcome::aborted(),
                succeeded_operator: None,
                last_operator: Some(operator.clone()),
                operators_tried: index,
                all_operators_failed: false,
                window_closed: false,
            };
        }

        if index == 0 {
            info!(%phone, operator = %operator, "trying operator");
        } else {
            info!(%phone, operator = %operator, "failover to operator");
        }

        let scoped = OperatorScoped {
            inner: observer,
            operator: operator.clone(),
        };
        let dial_string = operator.dial_string(phone.as_ref());
        let outcome = engine
            .run_test(
                token,
                job.test_num,
                &dial_string,
                phone,
                job.destination.availability.as_ref(),
                &scoped,
                port,
            )
            .await;

        if outcome.window_closed {
            return window_closed_outcome(job, index + 1, Some(operator.clone()));
        }

        if outcome.success {
            if let Err(e) = cache.set(phone, operator).await {
                warn!(%phone, error = %e, "operator cache write failed");
            }
            return FailoverOutcome {
                outcome,
                succeeded_operator: Some(operator.clone()),
                last_operator: Some(operator.clone()),
                operators_tried: index + 1,
                all_operators_failed: false,
                window_closed: false,
            };
        }

        if outcome.cancelled {
            return FailoverOutcome {
                outcome,
                succeeded_operator: None,
                last_operator: Some(operator.clone()),
                operators_tried: index + 1,
                all_operators_failed: false,
                window_closed: false,
            };
        }

        last_outcome = outcome;

        let is_last = index + 1 == total;
        if !is_last {
            if let Some(rule) = job.destination.availability.as_ref() {
                if !rule.callable_at(time.now()) {
                    return window_closed_outcome(job, index + 1, Some(operator.clone()));
                }
            }
            // record the failed operator's result before moving on
            observer
                .on_operator_result(last_outcome.clone(), operator.clone())
                .await;
        }
    }

    let last_operator = operators.last().cloned();
    if let Err(e) = cache.delete(phone).await {
        warn!(%phone, error = %e, "operator cache invalidation failed");
    }
    info!(%phone, operators = total, "all operators failed");

    FailoverOutcome {
        outcome: last_outcome,
        succeeded_operator: None,
        last_operator,
        operators_tried: total,
        all_operators_failed: true,
        window_closed: false,
    }
}
