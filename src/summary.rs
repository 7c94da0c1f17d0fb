//! End-of-run statistics: overall, per-phone, per-operator, and
//! per-modem aggregation over final result envelopes.

use crate::domain::job::ResultEnvelope;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Success/failure tally with average dial time.
#[derive(Debug, Default, Clone)]
pub struct Tally {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    dial_time_sum: Duration,
}

impl Tally {
    fn record(&mut self, success: bool, dial_time: Duration) {
        self.total += 1;
        if success {
            self.success += 1;
        } else {
            self.failure += 1;
        }
        self.dial_time_sum += dial_time;
    }

    /// Mean dial time across counted attempts.
    pub fn avg_dial_time(&self) -> Duration {
        if self.total == 0 {
            Duration::ZERO
        } else {
            self.dial_time_sum / u32::try_from(self.total).unwrap_or(u32::MAX)
        }
    }
}

/// Accumulated run statistics. Window-closed finals are deferred,
/// not counted as success or failure; intermediate envelopes only
/// bump the attempt counter.
#[derive(Debug, Default)]
pub struct RunStats {
    pub submitted: u64,
    pub completed: u64,
    pub success: u64,
    pub failure: u64,
    pub deferred: u64,
    pub cancelled: u64,
    pub intermediate_attempts: u64,
    per_phone: BTreeMap<String, Tally>,
    per_operator: BTreeMap<String, Tally>,
    per_modem: BTreeMap<String, Tally>,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&mut self) {
        self.submitted += 1;
    }

    /// Folds one envelope into the totals. Returns `true` when the
    /// envelope was a final one (completes a job).
    pub fn record(&mut self, envelope: &ResultEnvelope) -> bool {
        if envelope.intermediate {
            self.intermediate_attempts += 1;
            return false;
        }
        self.completed += 1;

        if envelope.window_closed {
            self.deferred += 1;
            return true;
        }
        if envelope.outcome.cancelled {
            self.cancelled += 1;
            return true;
        }

        let success = envelope.outcome.success;
        let dial_time = envelope.outcome.dial_time;
        if success {
            self.success += 1;
        } else {
            self.failure += 1;
        }

        self.per_phone
            .entry(envelope.destination.phone.to_string())
            .or_default()
            .record(success, dial_time);
        let operator = if envelope.operator.name.is_empty() {
            "direct".to_string()
        } else {
            envelope.operator.name.clone()
        };
        self.per_operator
            .entry(operator)
            .or_default()
            .record(success, dial_time);
        self.per_modem
            .entry(envelope.modem.to_string())
            .or_default()
            .record(success, dial_time);
        true
    }
}

fn write_section(
    f: &mut fmt::Formatter<'_>,
    title: &str,
    entries: &BTreeMap<String, Tally>,
) -> fmt::Result {
    if entries.is_empty() {
        return Ok(());
    }
    writeln!(f, "\n{title}:")?;
    for (key, tally) in entries {
        writeln!(
            f,
            "  {key:<24} total {:>4}  ok {:>4}  fail {:>4}  avg dial {:>6.1}s",
            tally.total,
            tally.success,
            tally.failure,
            tally.avg_dial_time().as_secs_f64()
        )?;
    }
    Ok(())
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run summary:")?;
        writeln!(
            f,
            "  submitted {}  completed {}  success {}  failure {}  deferred {}  cancelled {}  retry/failover attempts {}",
            self.submitted,
            self.completed,
            self.success,
            self.failure,
            self.deferred,
            self.cancelled,
            self.intermediate_attempts
        )?;
        write_section(f, "Per phone", &self.per_phone)?;
        write_section(f, "Per operator", &self.per_operator)?;
        write_section(f, "Per modem", &self.per_modem)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::destination::Destination;
    use crate::domain::job::TestOutcome;
    use crate::domain::operator::Operator;
    use crate::domain_types::{ModemName, PhoneNumber, TestNumber};

    fn envelope(success: bool, intermediate: bool, window_closed: bool) -> ResultEnvelope {
        let outcome = if window_closed {
            TestOutcome::deferred("window")
        } else {
            TestOutcome {
                success,
                ..TestOutcome::default()
            }
        };
        ResultEnvelope::new(
            ModemName::try_new("m1").unwrap(),
            Destination::bare(PhoneNumber::try_new("111").unwrap()),
            Operator::direct(),
            TestNumber::from(1),
            outcome,
            intermediate,
        )
    }

    #[test]
    fn finals_update_counters_and_intermediates_do_not() {
        let mut stats = RunStats::new();
        assert!(!stats.record(&envelope(false, true, false)));
        assert!(stats.record(&envelope(true, false, false)));
        assert_eq!(stats.intermediate_attempts, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.failure, 0);
    }

    #[test]
    fn window_closed_final_counts_as_deferred_only() {
        let mut stats = RunStats::new();
        assert!(stats.record(&envelope(false, false, true)));
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.deferred, 1);
        assert_eq!(stats.success + stats.failure, 0);
        // no per-phone bookkeeping for deferred destinations
        assert!(stats.per_phone.is_empty());
    }

    #[test]
    fn display_renders_all_sections() {
        let mut stats = RunStats::new();
        stats.record_submitted();
        stats.record(&envelope(true, false, false));
        let text = stats.to_string();
        assert!(text.contains("Run summary"));
        assert!(text.contains("Per phone"));
        assert!(text.contains("Per modem"));
        assert!(text.contains("direct"));
    }
}
