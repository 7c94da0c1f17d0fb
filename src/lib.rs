//! # modem-test — multi-modem PSTN connectivity tester
//!
//! Dials a population of telephone destinations from a pool of
//! physical dial-up modems, negotiates a session-layer handshake
//! over the audio connection, records per-call outcomes and
//! line-quality metrics, and produces durable per-call records for
//! later analysis.
//!
//! ## Architecture
//!
//! The scheduling core is a set of cooperating tokio tasks:
//!
//! ```text
//! Scheduler -> job channel -> Pool -> Worker -> Coordinator (acquire)
//!     -> Failover Driver -> Dial Engine -> modem + CDR correlator
//!     -> result channel -> Orchestrator -> statistics + Sinks
//! ```
//!
//! Workers own their modem devices exclusively; destination phone
//! numbers are mutually excluded across workers by the
//! [`coordinator::PhoneCoordinator`]; every physical dial attempt is
//! durably recorded through intermediate result envelopes.

pub mod cdr;
pub mod config;
pub mod coordinator;
pub mod dialer;
pub mod directory;
pub mod domain;
pub mod domain_types;
pub mod error;
pub mod failover;
pub mod handshake;
pub mod modem;
pub mod operator_cache;
pub mod orchestrator;
pub mod pidfile;
pub mod pool;
pub mod scheduler;
pub mod serial;
pub mod sinks;
pub mod stats;
pub mod summary;
pub mod time_provider;
pub mod worker;

pub use config::Config;
pub use coordinator::PhoneCoordinator;
pub use dialer::{AttemptObserver, DialEngine, DialSettings, NullObserver};
pub use domain::{
    Destination, FailoverOutcome, Job, Operator, ResultEnvelope, TestOutcome,
};
pub use domain_types::{ModemName, PhoneNumber, TestNumber};
pub use error::StartupError;
pub use operator_cache::OperatorCache;
pub use orchestrator::{Orchestrator, RunReport};
pub use pool::{ModemPool, PoolDeps};
pub use scheduler::{OperatorMap, SequenceSource};
pub use summary::RunStats;
pub use time_provider::{SharedTimeProvider, real_time_provider, skipping_time_provider};
