//! Time abstraction so the many pacing delays in this crate (retry
//! waits, inter-test pauses, CDR write-propagation delays, window
//! waits) can be skipped in tests.
//!
//! Every wait in the scheduling path goes through
//! [`TimeProvider::sleep_cancellable`], which returns early when the
//! run is cancelled; callers check the return value and unwind with
//! a cancelled outcome.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Clock and sleep provider.
#[async_trait]
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// Sleep for `duration`, or until `token` is cancelled.
    /// Returns `true` if the full duration elapsed, `false` on
    /// cancellation.
    async fn sleep_cancellable(&self, duration: Duration, token: &CancellationToken) -> bool;

    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic instant for measuring elapsed spans.
    fn instant(&self) -> Instant;
}

/// Production provider over the tokio clock.
#[derive(Debug, Clone, Default)]
pub struct RealTimeProvider;

#[async_trait]
impl TimeProvider for RealTimeProvider {
    async fn sleep_cancellable(&self, duration: Duration, token: &CancellationToken) -> bool {
        tokio::select! {
            () = tokio::time::sleep(duration) => true,
            () = token.cancelled() => false,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// Test provider that collapses sleeps to a single yield so suites
/// exercising retry and pacing logic run at full speed. Cancellation
/// is still honored first, so promptness tests remain meaningful.
#[derive(Debug, Clone, Default)]
pub struct SkippingTimeProvider;

#[async_trait]
impl TimeProvider for SkippingTimeProvider {
    async fn sleep_cancellable(&self, _duration: Duration, token: &CancellationToken) -> bool {
        if token.is_cancelled() {
            return false;
        }
        tokio::task::yield_now().await;
        !token.is_cancelled()
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// Shared handle used throughout the crate.
pub type SharedTimeProvider = Arc<dyn TimeProvider>;

/// Provider for production wiring.
pub fn real_time_provider() -> SharedTimeProvider {
    Arc::new(RealTimeProvider)
}

/// Provider for tests that must not wait out real delays.
pub fn skipping_time_provider() -> SharedTimeProvider {
    Arc::new(SkippingTimeProvider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn real_sleep_returns_false_on_cancel() {
        let provider = RealTimeProvider;
        let token = CancellationToken::new();
        token.cancel();
        let start = Instant::now();
        let completed = provider
            .sleep_cancellable(Duration::from_secs(30), &token)
            .await;
        assert!(!completed);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn skipping_sleep_is_fast_but_reports_completion() {
        let provider = SkippingTimeProvider;
        let token = CancellationToken::new();
        let start = Instant::now();
        let completed = provider
            .sleep_cancellable(Duration::from_secs(3600), &token)
            .await;
        assert!(completed);
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
