//! Pool lifecycle and envelope accounting: every accepted job yields
//! exactly one final envelope, intermediates come first, and
//! graceful shutdown closes the result channel only after all
//! in-flight envelopes are out.

mod support;

use modem_test::coordinator::PhoneCoordinator;
use modem_test::domain::destination::Destination;
use modem_test::domain::job::{Job, ResultEnvelope};
use modem_test::domain_types::TestNumber;
use modem_test::operator_cache::OperatorCache;
use modem_test::orchestrator::Orchestrator;
use modem_test::pool::{ModemPool, PoolDeps};
use modem_test::scheduler::OperatorMap;
use modem_test::sinks::SinkSet;
use modem_test::time_provider::skipping_time_provider;
use std::collections::HashMap;
use std::sync::Arc;
use support::*;
use tokio_util::sync::CancellationToken;

fn deps(factory: MockModemFactory) -> PoolDeps {
    PoolDeps {
        factory: Arc::new(factory),
        handshaker: Arc::new(MockHandshaker::ok()),
        cdr: None,
        voip_cdr: None,
        cache: Arc::new(OperatorCache::disabled()),
        coordinator: Arc::new(PhoneCoordinator::new()),
        time: skipping_time_provider(),
    }
}

fn direct_job(n: u64, phone_digits: &str) -> Job {
    Job {
        destination: Destination::bare(phone(phone_digits)),
        operators: Vec::new(),
        test_num: TestNumber::from(n),
    }
}

async fn drain(mut rx: tokio::sync::mpsc::Receiver<ResultEnvelope>) -> Vec<ResultEnvelope> {
    let mut all = Vec::new();
    while let Some(envelope) = rx.recv().await {
        all.push(envelope);
    }
    all
}

/// Every submitted job produces exactly one final envelope, and the
/// result channel closes only after `stop()` has let workers finish.
#[tokio::test]
async fn graceful_shutdown_accounts_for_every_job() {
    let token = CancellationToken::new();
    let mut pool = ModemPool::build(&config_with_modems(2), deps(MockModemFactory::new()), &token)
        .await
        .unwrap();
    assert_eq!(pool.worker_count(), 2);

    let results = pool.take_results();
    let collector = tokio::spawn(drain(results));
    pool.start();

    for n in 0..5 {
        let accepted = pool
            .submit_job(&token, direct_job(n, &format!("749500011{n:02}")))
            .await;
        assert!(accepted);
    }

    pool.stop().await;
    let envelopes = collector.await.unwrap();

    let finals: Vec<_> = envelopes.iter().filter(|e| !e.intermediate).collect();
    assert_eq!(finals.len(), 5, "one final envelope per job");

    let mut seen: HashMap<u64, usize> = HashMap::new();
    for envelope in &finals {
        *seen.entry(envelope.test_num.as_u64()).or_default() += 1;
        assert!(envelope.outcome.success);
    }
    assert!(seen.values().all(|&count| count == 1), "{seen:?}");
}

/// Intermediate envelopes for a job precede its final envelope in
/// channel order.
#[tokio::test]
async fn intermediates_precede_finals() {
    let token = CancellationToken::new();
    // BUSY first, so every job produces one retry intermediate
    let factory = MockModemFactory::with_script(vec![busy(), connect()]);
    let mut config = config_with_modems(1);
    config.test.retry_count = 2;
    let mut pool = ModemPool::build(&config, deps(factory), &token).await.unwrap();

    let results = pool.take_results();
    let collector = tokio::spawn(drain(results));
    pool.start();

    assert!(pool.submit_job(&token, direct_job(1, "74950001122")).await);
    pool.stop().await;

    let envelopes = collector.await.unwrap();
    assert_eq!(envelopes.len(), 2);
    assert!(envelopes[0].intermediate, "retry attempt comes first");
    assert!(!envelopes[1].intermediate);
    assert_eq!(envelopes[0].test_num, envelopes[1].test_num);
    assert!(envelopes[1].outcome.success);
}

/// After stop() the job channel no longer accepts submissions.
#[tokio::test]
async fn submissions_after_stop_are_rejected() {
    let token = CancellationToken::new();
    let mut pool = ModemPool::build(&config_with_modems(1), deps(MockModemFactory::new()), &token)
        .await
        .unwrap();
    let results = pool.take_results();
    let collector = tokio::spawn(drain(results));
    pool.start();
    pool.stop().await;
    collector.await.unwrap();

    assert!(!pool.submit_job(&token, direct_job(9, "74950001199")).await);
}

/// A modem that fails to open is skipped; the pool still builds with
/// the remaining workers. With no workers at all, construction
/// fails.
#[tokio::test]
async fn failed_modems_are_skipped_but_not_all() {
    let token = CancellationToken::new();

    let mut partial = MockModemFactory::new();
    partial.fail_devices.push("/dev/mock0".to_string());
    let pool = ModemPool::build(&config_with_modems(2), deps(partial), &token)
        .await
        .unwrap();
    assert_eq!(pool.worker_count(), 1);

    let mut total = MockModemFactory::new();
    total.fail_devices.push("/dev/mock0".to_string());
    let result = ModemPool::build(&config_with_modems(1), deps(total), &token).await;
    assert!(result.is_err());
}

/// Full-run scenario: one modem, one destination, empty operator
/// list. One successful final envelope, no intermediates, totals
/// reflect one success.
#[tokio::test]
async fn single_destination_direct_dial_run() {
    let token = CancellationToken::new();
    let config = config_with_modems(1);
    let pool = ModemPool::build(&config, deps(MockModemFactory::new()), &token)
        .await
        .unwrap();

    let orchestrator = Orchestrator::new(
        pool,
        Arc::new(SinkSet::new(Vec::new())),
        Arc::new(OperatorMap::from_config(&config.test)),
        skipping_time_provider(),
        token.clone(),
        std::time::Duration::ZERO,
    );

    let destinations = vec![Destination::bare(phone("74950001122"))];
    let report = orchestrator.run(destinations).await;

    assert!(!report.cancelled);
    assert_eq!(report.stats.submitted, 1);
    assert_eq!(report.stats.completed, 1);
    assert_eq!(report.stats.success, 1);
    assert_eq!(report.stats.failure, 0);
    assert_eq!(report.stats.intermediate_attempts, 0);
}

/// Cancellation mid-run still stops the pool cleanly and the
/// orchestrator reports a cancelled run.
#[tokio::test]
async fn cancellation_stops_run_cleanly() {
    let token = CancellationToken::new();
    let config = config_with_modems(1);
    let pool = ModemPool::build(&config, deps(MockModemFactory::new()), &token)
        .await
        .unwrap();

    let orchestrator = Orchestrator::new(
        pool,
        Arc::new(SinkSet::new(Vec::new())),
        Arc::new(OperatorMap::from_config(&config.test)),
        skipping_time_provider(),
        token.clone(),
        std::time::Duration::ZERO,
    );

    token.cancel();
    let destinations = vec![Destination::bare(phone("74950001122"))];
    let report = orchestrator.run(destinations).await;
    assert!(report.cancelled);
}
