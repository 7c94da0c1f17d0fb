//! Core domain values: destinations, operators, jobs, call outcomes,
//! CDR records, and availability rules.
//!
//! Everything here is plain data plus pure functions; I/O lives in
//! the modules that own it (cache, correlator, sinks, modem driver).

pub mod availability;
pub mod cdr;
pub mod destination;
pub mod job;
pub mod operator;

pub use availability::{AvailabilityRule, CallSchedule, TimeWindow, call_schedule};
pub use cdr::{CdrRecord, Disposition, VoipCdrRecord, is_user_busy, should_retry};
pub use destination::{Destination, NodeMetadata};
pub use job::{
    FailoverOutcome, Job, LineStats, PeerInfo, ResultEnvelope, RetryAttempt, TestOutcome,
};
pub use operator::{CachedOperator, Operator, find_operator_by_name, reorder_with_cached};
