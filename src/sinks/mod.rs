//! Result sinks: uniform appenders for per-call records.
//!
//! Sinks are independent; a failing sink is logged and skipped,
//! never aborting the run or the other sinks. There is no two-phase
//! commit — each record is written to every enabled sink on a
//! best-effort basis.

pub mod csv;
pub mod http;
pub mod sql;

use crate::domain::job::ResultEnvelope;
use async_trait::async_trait;
use thiserror::Error;
use tracing::error;

pub use csv::CsvSink;
pub use http::HttpSink;
pub use sql::{SqlBackend, SqlSink};

/// Errors from sink writes; non-fatal per record.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("sink database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("sink HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sink write timed out")]
    Timeout,

    #[error("incompatible file header: expected {expected:?}, found {found:?}")]
    HeaderMismatch { expected: String, found: String },
}

/// One record appender.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool {
        true
    }

    async fn write_record(&self, record: &ResultEnvelope) -> Result<(), SinkError>;

    async fn close(&self) -> Result<(), SinkError>;
}

/// A record flattened to the column set shared by the tabular and
/// SQL sinks.
pub struct FlatRecord {
    pub timestamp: String,
    pub modem: String,
    pub phone: String,
    pub address: String,
    pub test_num: i64,
    pub intermediate: bool,
    pub operator_name: String,
    pub operator_prefix: String,
    pub success: bool,
    pub window_closed: bool,
    pub message: String,
    pub dial_ms: i64,
    pub handshake_ms: i64,
    pub connect_speed: String,
    pub peer_address: String,
    pub peer_system: String,
    pub peer_mailer: String,
    pub rx_speed_bps: Option<i64>,
    pub tx_speed_bps: Option<i64>,
    pub snr_db: Option<f64>,
    pub cdr_disposition: String,
    pub cdr_hangup_cause: Option<i64>,
    pub cdr_billsec: Option<i64>,
    pub cdr_duration: Option<i64>,
    pub cdr_trunk: String,
    pub voip_status: String,
}

impl From<&ResultEnvelope> for FlatRecord {
    fn from(rec: &ResultEnvelope) -> Self {
        let outcome = &rec.outcome;
        let peer = outcome.peer.as_ref();
        let stats = outcome.line_stats.as_ref();
        let cdr = outcome.switch_cdr.as_ref();
        Self {
            timestamp: rec.timestamp.to_rfc3339(),
            modem: rec.modem.to_string(),
            phone: rec.destination.phone.to_string(),
            address: rec.destination.metadata.address.clone().unwrap_or_default(),
            test_num: i64::try_from(rec.test_num.as_u64()).unwrap_or(i64::MAX),
            intermediate: rec.intermediate,
            operator_name: rec.operator.name.clone(),
            operator_prefix: rec.operator.prefix.clone(),
            success: outcome.success,
            window_closed: rec.window_closed,
            message: outcome.message.clone(),
            dial_ms: i64::try_from(outcome.dial_time.as_millis()).unwrap_or(i64::MAX),
            handshake_ms: i64::try_from(outcome.handshake_time.as_millis()).unwrap_or(i64::MAX),
            connect_speed: outcome.connect_speed.clone().unwrap_or_default(),
            peer_address: peer.and_then(|p| p.address.clone()).unwrap_or_default(),
            peer_system: peer.and_then(|p| p.system_name.clone()).unwrap_or_default(),
            peer_mailer: peer.and_then(|p| p.mailer.clone()).unwrap_or_default(),
            rx_speed_bps: stats.and_then(|s| s.rx_speed_bps).map(i64::from),
            tx_speed_bps: stats.and_then(|s| s.tx_speed_bps).map(i64::from),
            snr_db: stats.and_then(|s| s.snr_db).map(f64::from),
            cdr_disposition: cdr.map(|c| c.disposition.as_str().to_string()).unwrap_or_default(),
            cdr_hangup_cause: cdr.and_then(|c| c.hangup_cause).map(i64::from),
            cdr_billsec: cdr.map(|c| c.billsec),
            cdr_duration: cdr.map(|c| c.duration),
            cdr_trunk: cdr.and_then(|c| c.trunk.clone()).unwrap_or_default(),
            voip_status: outcome
                .voip_cdr
                .as_ref()
                .map(|v| v.status.clone())
                .unwrap_or_default(),
        }
    }
}

/// The enabled sinks for a run.
pub struct SinkSet {
    sinks: Vec<Box<dyn ResultSink>>,
}

impl SinkSet {
    pub fn new(sinks: Vec<Box<dyn ResultSink>>) -> Self {
        Self { sinks }
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Writes `record` to every enabled sink; failures are logged
    /// and do not affect the remaining sinks.
    pub async fn write_all(&self, record: &ResultEnvelope) {
        for sink in &self.sinks {
            if !sink.is_enabled() {
                continue;
            }
            if let Err(e) = sink.write_record(record).await {
                error!(sink = sink.name(), error = %e, "sink write failed");
            }
        }
    }

    pub async fn close_all(&self) {
        for sink in &self.sinks {
            if let Err(e) = sink.close().await {
                error!(sink = sink.name(), error = %e, "sink close failed");
            }
        }
    }
}
