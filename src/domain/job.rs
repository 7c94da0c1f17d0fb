//! Jobs and call results: the values that travel on the pool's
//! channels.

use crate::domain::cdr::{CdrRecord, VoipCdrRecord};
use crate::domain::destination::Destination;
use crate::domain::operator::Operator;
use crate::domain_types::{ModemName, TestNumber};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// One unit of work: dial a destination through an ordered list of
/// operators. An empty operator list means direct dial with no
/// failover layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub destination: Destination,
    pub operators: Vec<Operator>,
    pub test_num: TestNumber,
}

/// Session-layer peer identity captured during a successful handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub address: Option<String>,
    pub system_name: Option<String>,
    pub sysop: Option<String>,
    pub location: Option<String>,
    pub mailer: Option<String>,
}

/// Line quality figures parsed from the modem's post-disconnect
/// statistics output. All fields optional; chipsets report different
/// subsets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineStats {
    pub rx_speed_bps: Option<u32>,
    pub tx_speed_bps: Option<u32>,
    pub snr_db: Option<f32>,
    pub rx_level_dbm: Option<f32>,
    pub retrains: Option<u32>,
    /// Name of the stats profile that produced this parse.
    pub profile: String,
}

/// The result of one dial attempt at one operator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub success: bool,
    /// Human-readable one-line account of the attempt.
    pub message: String,
    /// Duration of the final dial, not cumulative across retries.
    pub dial_time: Duration,
    pub handshake_time: Duration,
    /// Modem CONNECT string, e.g. `"33600/V34"`.
    pub connect_speed: Option<String>,
    pub peer: Option<PeerInfo>,
    pub line_stats: Option<LineStats>,
    pub voip_cdr: Option<VoipCdrRecord>,
    pub switch_cdr: Option<CdrRecord>,
    /// The destination's call window closed during the attempt;
    /// defer, do not count.
    pub window_closed: bool,
    /// The run was cancelled while this attempt was in flight.
    pub cancelled: bool,
}

impl TestOutcome {
    /// A plain failure with a reason.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// Attempt aborted because the call window closed.
    pub fn deferred(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            window_closed: true,
            ..Self::default()
        }
    }

    /// Attempt aborted by run cancellation.
    pub fn aborted() -> Self {
        Self {
            message: "cancelled".to_string(),
            cancelled: true,
            ..Self::default()
        }
    }
}

/// The result of running one job through the failover driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverOutcome {
    pub outcome: TestOutcome,
    /// Operator that succeeded, if any.
    pub succeeded_operator: Option<Operator>,
    /// Last operator tried, successful or not.
    pub last_operator: Option<Operator>,
    pub operators_tried: usize,
    pub all_operators_failed: bool,
    pub window_closed: bool,
}

impl FailoverOutcome {
    /// Operator to attribute the final envelope to: the successful
    /// one when there is one, else the last one tried.
    pub fn attributed_operator(&self) -> Operator {
        self.succeeded_operator
            .clone()
            .or_else(|| self.last_operator.clone())
            .unwrap_or_else(Operator::direct)
    }
}

/// A retry or per-operator intermediate attempt, surfaced so every
/// physical dial is durably recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-based attempt index within the current operator.
    pub attempt: usize,
    pub reason: String,
    /// Filled in by the failover driver when an operator list is in
    /// play; `None` on the direct-dial path.
    pub operator: Option<Operator>,
    pub outcome: TestOutcome,
}

/// What a worker publishes on the result channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub id: Uuid,
    pub modem: ModemName,
    pub destination: Destination,
    /// Operator this envelope is attributed to.
    pub operator: Operator,
    pub test_num: TestNumber,
    pub timestamp: DateTime<Utc>,
    pub outcome: TestOutcome,
    pub window_closed: bool,
    /// Intermediate envelopes record retry attempts and non-final
    /// operators; exactly one non-intermediate envelope exists per
    /// job.
    pub intermediate: bool,
}

impl ResultEnvelope {
    pub fn new(
        modem: ModemName,
        destination: Destination,
        operator: Operator,
        test_num: TestNumber,
        outcome: TestOutcome,
        intermediate: bool,
    ) -> Self {
        let window_closed = outcome.window_closed;
        Self {
            id: Uuid::new_v4(),
            modem,
            destination,
            operator,
            test_num,
            timestamp: Utc::now(),
            outcome,
            window_closed,
            intermediate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::{ModemName, PhoneNumber};

    #[test]
    fn attributed_operator_prefers_success_then_last() {
        let a = Operator {
            name: "a".to_string(),
            prefix: "1".to_string(),
        };
        let b = Operator {
            name: "b".to_string(),
            prefix: "2".to_string(),
        };

        let won = FailoverOutcome {
            outcome: TestOutcome::default(),
            succeeded_operator: Some(a.clone()),
            last_operator: Some(b.clone()),
            operators_tried: 2,
            all_operators_failed: false,
            window_closed: false,
        };
        assert_eq!(won.attributed_operator(), a);

        let lost = FailoverOutcome {
            succeeded_operator: None,
            ..won
        };
        assert_eq!(lost.attributed_operator(), b);
    }

    #[test]
    fn envelope_serializes_round_trip() {
        let dest = Destination::bare(PhoneNumber::try_new("74950001122").unwrap());
        let env = ResultEnvelope::new(
            ModemName::try_new("m1").unwrap(),
            dest,
            Operator {
                name: "mtt".to_string(),
                prefix: "1#".to_string(),
            },
            TestNumber::from(5),
            TestOutcome {
                success: true,
                message: "handshake with 2:5020/1042".to_string(),
                connect_speed: Some("33600/V34".to_string()),
                ..TestOutcome::default()
            },
            false,
        );
        let json = serde_json::to_string(&env).unwrap();
        let back: ResultEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn envelope_mirrors_window_closed_flag() {
        let dest = Destination::bare(PhoneNumber::try_new("123").unwrap());
        let env = ResultEnvelope::new(
            ModemName::try_new("m1").unwrap(),
            dest,
            Operator::direct(),
            TestNumber::from(7),
            TestOutcome::deferred("window closed"),
            false,
        );
        assert!(env.window_closed);
        assert!(!env.intermediate);
    }
}
