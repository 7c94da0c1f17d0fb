//! Switch call detail records and the pure rules the dial engine
//! applies to them.
//!
//! The switch writes its CDR asynchronously after a call ends; the
//! correlator in [`crate::cdr`] finds the row, and the functions here
//! decide what it means for retry and failover policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Q.850 cause code for "user busy".
pub const CAUSE_USER_BUSY: i32 = 17;

/// Symbolic call disposition as reported by the switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Disposition {
    Answered,
    NoAnswer,
    Busy,
    Failed,
    Congestion,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl Disposition {
    /// Parses the switch's textual disposition column.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().replace(' ', "_").as_str() {
            "ANSWERED" => Self::Answered,
            "NO_ANSWER" | "NOANSWER" => Self::NoAnswer,
            "BUSY" | "USER_BUSY" => Self::Busy,
            "FAILED" | "FAILURE" => Self::Failed,
            "CONGESTION" => Self::Congestion,
            "CANCELLED" | "CANCEL" | "ORIGINATOR_CANCEL" => Self::Cancelled,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Answered => "answered",
            Self::NoAnswer => "no-answer",
            Self::Busy => "busy",
            Self::Failed => "failed",
            Self::Congestion => "congestion",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

/// One call record as observed in the switch's CDR table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdrRecord {
    /// When the switch saw the call start.
    pub call_start: DateTime<Utc>,
    /// Destination number as the switch dialed it.
    pub dst_number: String,
    pub disposition: Disposition,
    /// Q.850 hangup cause, when the switch recorded one.
    pub hangup_cause: Option<i32>,
    /// Billable seconds; zero means the call never supervised.
    pub billsec: i64,
    /// Total seconds from setup to teardown.
    pub duration: i64,
    /// Peer or trunk the call was routed through.
    pub trunk: Option<String>,
    /// Which side hung up first, if recorded.
    pub hangup_side: Option<String>,
    /// Whether early media was received before answer/fail.
    pub early_media: bool,
}

/// A record from the VoIP gateway's own CDR store, kept opaque apart
/// from the fields we display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoipCdrRecord {
    pub call_start: DateTime<Utc>,
    pub dst_number: String,
    pub status: String,
    pub duration: i64,
    pub gateway: Option<String>,
}

/// Whether a failed dial should be retried, judging by the switch's
/// view of the call.
///
/// A retry is advised only when the call never supervised (zero
/// billable seconds) and the disposition is one the network may
/// resolve on a second attempt.
pub fn should_retry(cdr: Option<&CdrRecord>) -> bool {
    match cdr {
        Some(rec) => {
            rec.billsec == 0
                && matches!(
                    rec.disposition,
                    Disposition::NoAnswer
                        | Disposition::Busy
                        | Disposition::Failed
                        | Disposition::Congestion
                )
        }
        None => false,
    }
}

/// Whether the destination itself was busy, as opposed to a routing
/// or operator problem.
///
/// Only Q.850 cause 17 counts. A "busy" disposition without cause 17
/// typically means a trunk rejected the call, which a different
/// operator may route around.
pub fn is_user_busy(cdr: Option<&CdrRecord>) -> bool {
    matches!(cdr, Some(rec) if rec.hangup_cause == Some(CAUSE_USER_BUSY))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(disposition: Disposition, billsec: i64, cause: Option<i32>) -> CdrRecord {
        CdrRecord {
            call_start: Utc::now(),
            dst_number: "74950001122".to_string(),
            disposition,
            hangup_cause: cause,
            billsec,
            duration: billsec + 5,
            trunk: Some("trunk-a".to_string()),
            hangup_side: None,
            early_media: false,
        }
    }

    #[test]
    fn retry_advised_for_unsupervised_transient_dispositions() {
        for d in [
            Disposition::NoAnswer,
            Disposition::Busy,
            Disposition::Failed,
            Disposition::Congestion,
        ] {
            assert!(should_retry(Some(&record(d, 0, None))), "{d:?}");
        }
    }

    #[test]
    fn retry_not_advised_when_billed_or_answered() {
        assert!(!should_retry(Some(&record(Disposition::Busy, 3, None))));
        assert!(!should_retry(Some(&record(Disposition::Answered, 0, None))));
        assert!(!should_retry(Some(&record(Disposition::Cancelled, 0, None))));
        assert!(!should_retry(None));
    }

    #[test]
    fn user_busy_requires_cause_17() {
        assert!(is_user_busy(Some(&record(Disposition::Busy, 0, Some(17)))));
        // disposition busy with a different cause is a routing problem
        assert!(!is_user_busy(Some(&record(Disposition::Busy, 0, Some(34)))));
        assert!(!is_user_busy(Some(&record(Disposition::Busy, 0, None))));
        assert!(!is_user_busy(None));
        // cause 17 alone is decisive regardless of disposition text
        assert!(is_user_busy(Some(&record(Disposition::Failed, 0, Some(17)))));
    }

    #[test]
    fn disposition_parsing_covers_switch_variants() {
        assert_eq!(Disposition::parse("NO ANSWER"), Disposition::NoAnswer);
        assert_eq!(Disposition::parse("ANSWERED"), Disposition::Answered);
        assert_eq!(Disposition::parse("ORIGINATOR_CANCEL"), Disposition::Cancelled);
        assert_eq!(Disposition::parse("weird"), Disposition::Unknown);
    }
}
