//! The job scheduler: turns a destination set into a time-ordered
//! stream of jobs that honors call-window rules.
//!
//! Immediately-callable destinations are emitted first; deferred
//! destinations wait (cancellably) for their window to open. The
//! orchestrator feeds window-closed destinations back through a
//! fresh scheduling round, so sequence numbers come from a counter
//! shared across rounds.

use crate::config::TestConfig;
use crate::domain::availability::call_schedule;
use crate::domain::destination::Destination;
use crate::domain::job::Job;
use crate::domain::operator::Operator;
use crate::domain_types::{PhoneNumber, TestNumber};
use crate::time_provider::SharedTimeProvider;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-phone operator resolution: a global default list plus
/// longest-prefix overrides.
#[derive(Debug, Clone, Default)]
pub struct OperatorMap {
    default: Vec<Operator>,
    /// Prefixes stored `+`-stripped.
    overrides: Vec<(String, Vec<Operator>)>,
}

impl OperatorMap {
    pub fn from_config(test: &TestConfig) -> Self {
        let default = test.operators.iter().map(Operator::from).collect();
        let overrides = test
            .prefix_operators
            .iter()
            .map(|(prefix, ops)| {
                (
                    prefix.trim_start_matches('+').to_string(),
                    ops.iter().map(Operator::from).collect(),
                )
            })
            .collect();
        Self { default, overrides }
    }

    /// The global default list, used for the session header log.
    pub fn default_operators(&self) -> Vec<Operator> {
        self.default.clone()
    }

    /// Operator list for `phone`: the override with the longest
    /// matching prefix, else the global default.
    pub fn operators_for(&self, phone: &PhoneNumber) -> Vec<Operator> {
        let digits = phone.without_plus();
        self.overrides
            .iter()
            .filter(|(prefix, _)| digits.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map_or_else(|| self.default.clone(), |(_, ops)| ops.clone())
    }
}

/// Monotonic sequence source shared by all scheduling rounds of one
/// run.
#[derive(Debug, Default)]
pub struct SequenceSource {
    next: AtomicU64,
}

impl SequenceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> TestNumber {
        TestNumber::from(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Sorts destinations for one round: callable-now first (stable),
/// then deferred by earliest window start; deferred destinations
/// with no computable window go last.
fn order_for_round(
    destinations: Vec<Destination>,
    time: &SharedTimeProvider,
) -> Vec<(Destination, bool, Option<chrono::DateTime<chrono::Utc>>)> {
    let now = time.now();
    let mut annotated: Vec<_> = destinations
        .into_iter()
        .map(|dest| {
            let schedule = call_schedule(dest.availability.as_ref(), now);
            (dest, schedule.callable_now, schedule.next_window_start)
        })
        .collect();
    annotated.sort_by_key(|(_, callable_now, next_start)| {
        (
            !callable_now,
            next_start.map_or(i64::MAX, |t| t.timestamp()),
        )
    });
    annotated
}

/// Produces the job stream for one round of `destinations`.
///
/// The returned channel closes when every destination has been
/// emitted or the run is cancelled.
pub fn schedule(
    token: CancellationToken,
    destinations: Vec<Destination>,
    operator_map: Arc<OperatorMap>,
    sequence: Arc<SequenceSource>,
    time: SharedTimeProvider,
) -> flume::Receiver<Job> {
    let (tx, rx) = flume::bounded::<Job>(16);

    tokio::spawn(async move {
        let ordered = order_for_round(destinations, &time);
        info!(destinations = ordered.len(), "scheduling round");

        for (destination, callable_now, next_start) in ordered {
            if token.is_cancelled() {
                break;
            }

            if !callable_now {
                match next_start {
                    Some(opens_at) => {
                        let now = time.now();
                        if opens_at > now {
                            let wait = (opens_at - now)
                                .to_std()
                                .unwrap_or(std::time::Duration::ZERO);
                            debug!(
                                destination = %destination.label(),
                                opens_at = %opens_at.format("%H:%M:%S UTC"),
                                "waiting for call window"
                            );
                            if !time.sleep_cancellable(wait, &token).await {
                                break;
                            }
                        }
                    }
                    None => {
                        warn!(
                            destination = %destination.label(),
                            "window closed and next opening unknown, calling anyway"
                        );
                    }
                }
            }

            let operators = operator_map.operators_for(&destination.phone);
            let job = Job {
                destination,
                operators,
                test_num: sequence.next(),
            };
            if tx.send_async(job).await.is_err() {
                break;
            }
        }
        // sender drops here, closing the stream
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperatorConfig;
    use crate::domain::availability::{AvailabilityRule, TimeWindow};
    use crate::time_provider::real_time_provider;

    fn phone(s: &str) -> PhoneNumber {
        PhoneNumber::try_new(s).unwrap()
    }

    fn test_config_with_operators() -> TestConfig {
        TestConfig {
            operators: vec![
                OperatorConfig {
                    name: "global".to_string(),
                    prefix: "10".to_string(),
                },
            ],
            prefix_operators: [
                (
                    "7495".to_string(),
                    vec![OperatorConfig {
                        name: "moscow".to_string(),
                        prefix: "20".to_string(),
                    }],
                ),
                (
                    "74951".to_string(),
                    vec![OperatorConfig {
                        name: "moscow-center".to_string(),
                        prefix: "30".to_string(),
                    }],
                ),
            ]
            .into_iter()
            .collect(),
            ..TestConfig::default()
        }
    }

    #[test]
    fn longest_prefix_override_wins() {
        let map = OperatorMap::from_config(&test_config_with_operators());
        assert_eq!(map.operators_for(&phone("74951002233"))[0].name, "moscow-center");
        assert_eq!(map.operators_for(&phone("74950002233"))[0].name, "moscow");
        assert_eq!(map.operators_for(&phone("78120002233"))[0].name, "global");
    }

    #[test]
    fn plus_is_stripped_for_matching() {
        let map = OperatorMap::from_config(&test_config_with_operators());
        assert_eq!(map.operators_for(&phone("+74950002233"))[0].name, "moscow");
    }

    #[test]
    fn callable_now_destinations_sort_first() {
        // a zero-length window is never open
        let closed_rule = AvailabilityRule::new(vec![TimeWindow {
            start: chrono::NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
            end: chrono::NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
        }]);

        let mut closed = Destination::bare(phone("111"));
        closed.availability = Some(closed_rule);
        let unrestricted_a = Destination::bare(phone("222"));
        let unrestricted_b = Destination::bare(phone("333"));

        let time = real_time_provider();
        let ordered = order_for_round(vec![closed, unrestricted_a, unrestricted_b], &time);
        let phones: Vec<_> = ordered.iter().map(|(d, _, _)| d.phone.to_string()).collect();
        // callable destinations keep their relative order, deferred goes last
        assert_eq!(phones, vec!["222", "333", "111"]);
        assert!(!ordered.last().unwrap().1);
    }

    #[test]
    fn sequence_numbers_are_monotonic() {
        let seq = SequenceSource::new();
        let a = seq.next();
        let b = seq.next();
        assert!(b > a);
    }
}
