//! CDR correlation: finding the switch's record of a call we just
//! placed.
//!
//! The switch writes records asynchronously, so callers pause for the
//! configured write-propagation delay before the first lookup. The
//! lookup itself matches on a destination-number suffix within a
//! bounded time window and picks the record closest to our own call
//! timestamp.

use crate::domain::cdr::{CdrRecord, Disposition, VoipCdrRecord};
use crate::domain_types::PhoneNumber;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use sqlx::{MySqlPool, PgPool, Row};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Digits of the destination number used for suffix matching. The
/// switch may store numbers with or without trunk prefixes; the
/// trailing digits are stable across both.
const SUFFIX_DIGITS: usize = 7;

/// Hard ceiling on a single lookup round-trip.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from CDR lookups. All are non-fatal to a call: the engine
/// logs and proceeds without enrichment.
#[derive(Debug, Error)]
pub enum CdrError {
    #[error("CDR query: {0}")]
    Query(#[from] sqlx::Error),

    #[error("CDR lookup timed out after {0:?}")]
    Timeout(Duration),

    #[error("CDR lookup cancelled")]
    Cancelled,

    #[error("unsupported CDR driver {0:?}")]
    Driver(String),
}

/// SQL driver for a CDR source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CdrDriver {
    Postgres,
    Mysql,
}

/// Connection settings for one CDR source.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CdrSourceConfig {
    pub driver: CdrDriver,
    pub dsn: String,
    pub table: String,
    /// Half-width of the correlation window around our call time.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_window_secs() -> u64 {
    120
}

/// Switch-side CDR lookup seam; the engine only sees this trait.
#[async_trait]
pub trait CdrLookup: Send + Sync {
    async fn lookup(
        &self,
        token: &CancellationToken,
        phone: &PhoneNumber,
        call_time: DateTime<Utc>,
    ) -> Result<Option<CdrRecord>, CdrError>;
}

/// VoIP-gateway CDR lookup seam.
#[async_trait]
pub trait VoipCdrLookup: Send + Sync {
    async fn lookup(
        &self,
        token: &CancellationToken,
        phone: &PhoneNumber,
        call_time: DateTime<Utc>,
    ) -> Result<Option<VoipCdrRecord>, CdrError>;
}

/// Picks the record whose start time is nearest to `call_time`.
fn pick_closest<T>(records: Vec<T>, call_time: DateTime<Utc>, start_of: impl Fn(&T) -> DateTime<Utc>) -> Option<T> {
    records.into_iter().min_by_key(|r| {
        let delta = start_of(r).signed_duration_since(call_time);
        delta.num_milliseconds().abs()
    })
}

enum CdrPool {
    Postgres(PgPool),
    Mysql(MySqlPool),
}

/// Read-only correlator over an external switch's CDR table.
pub struct SqlCdrCorrelator {
    pool: CdrPool,
    table: String,
    window: ChronoDuration,
}

impl SqlCdrCorrelator {
    /// Connects to the configured CDR database. The table name comes
    /// from trusted configuration and is interpolated into queries.
    pub async fn connect(config: &CdrSourceConfig) -> Result<Self, CdrError> {
        let pool = match config.driver {
            CdrDriver::Postgres => CdrPool::Postgres(
                PgPoolOptions::new()
                    .max_connections(4)
                    .connect(&config.dsn)
                    .await?,
            ),
            CdrDriver::Mysql => CdrPool::Mysql(
                MySqlPoolOptions::new()
                    .max_connections(4)
                    .connect(&config.dsn)
                    .await?,
            ),
        };
        Ok(Self {
            pool,
            table: config.table.clone(),
            window: ChronoDuration::seconds(i64::try_from(config.window_secs).unwrap_or(120)),
        })
    }

    fn pg_query(&self) -> String {
        format!(
            "SELECT call_start, dst_number, disposition, \
                    CAST(hangup_cause AS BIGINT) AS hangup_cause, \
                    CAST(billsec AS BIGINT) AS billsec, \
                    CAST(duration AS BIGINT) AS duration, \
                    trunk, hangup_side, early_media \
             FROM {} WHERE dst_number LIKE $1 AND call_start BETWEEN $2 AND $3",
            self.table
        )
    }

    fn mysql_query(&self) -> String {
        format!(
            "SELECT call_start, dst_number, disposition, \
                    CAST(hangup_cause AS SIGNED) AS hangup_cause, \
                    CAST(billsec AS SIGNED) AS billsec, \
                    CAST(duration AS SIGNED) AS duration, \
                    trunk, hangup_side, early_media \
             FROM {} WHERE dst_number LIKE ? AND call_start BETWEEN ? AND ?",
            self.table
        )
    }

    async fn fetch(
        &self,
        phone: &PhoneNumber,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CdrRecord>, CdrError> {
        let pattern = format!("%{}", phone.suffix(SUFFIX_DIGITS));
        let records = match &self.pool {
            CdrPool::Postgres(pool) => {
                let rows = sqlx::query(&self.pg_query())
                    .bind(&pattern)
                    .bind(from)
                    .bind(to)
                    .fetch_all(pool)
                    .await?;
                rows.iter().map(pg_record).collect()
            }
            CdrPool::Mysql(pool) => {
                let rows = sqlx::query(&self.mysql_query())
                    .bind(&pattern)
                    .bind(from.naive_utc())
                    .bind(to.naive_utc())
                    .fetch_all(pool)
                    .await?;
                rows.iter().map(mysql_record).collect()
            }
        };
        Ok(records)
    }
}

fn pg_record(row: &sqlx::postgres::PgRow) -> CdrRecord {
    let disposition: String = row.try_get("disposition").unwrap_or_default();
    CdrRecord {
        call_start: row
            .try_get::<DateTime<Utc>, _>("call_start")
            .unwrap_or_else(|_| Utc::now()),
        dst_number: row.try_get("dst_number").unwrap_or_default(),
        disposition: Disposition::parse(&disposition),
        hangup_cause: row
            .try_get::<Option<i64>, _>("hangup_cause")
            .ok()
            .flatten()
            .and_then(|v| i32::try_from(v).ok()),
        billsec: row.try_get::<i64, _>("billsec").unwrap_or(0),
        duration: row.try_get::<i64, _>("duration").unwrap_or(0),
        trunk: row.try_get("trunk").unwrap_or(None),
        hangup_side: row.try_get("hangup_side").unwrap_or(None),
        early_media: row.try_get("early_media").unwrap_or(false),
    }
}

fn mysql_record(row: &sqlx::mysql::MySqlRow) -> CdrRecord {
    let disposition: String = row.try_get("disposition").unwrap_or_default();
    CdrRecord {
        call_start: row
            .try_get::<chrono::NaiveDateTime, _>("call_start")
            .map(|t| t.and_utc())
            .unwrap_or_else(|_| Utc::now()),
        dst_number: row.try_get("dst_number").unwrap_or_default(),
        disposition: Disposition::parse(&disposition),
        hangup_cause: row
            .try_get::<Option<i64>, _>("hangup_cause")
            .ok()
            .flatten()
            .and_then(|v| i32::try_from(v).ok()),
        billsec: row.try_get::<i64, _>("billsec").unwrap_or(0),
        duration: row.try_get::<i64, _>("duration").unwrap_or(0),
        trunk: row.try_get("trunk").unwrap_or(None),
        hangup_side: row.try_get("hangup_side").unwrap_or(None),
        early_media: row.try_get("early_media").unwrap_or(false),
    }
}

#[async_trait]
impl CdrLookup for SqlCdrCorrelator {
    async fn lookup(
        &self,
        token: &CancellationToken,
        phone: &PhoneNumber,
        call_time: DateTime<Utc>,
    ) -> Result<Option<CdrRecord>, CdrError> {
        let from = call_time - self.window;
        let to = call_time + self.window;
        let fetch = self.fetch(phone, from, to);
        let records = tokio::select! {
            result = tokio::time::timeout(LOOKUP_TIMEOUT, fetch) => {
                result.map_err(|_| CdrError::Timeout(LOOKUP_TIMEOUT))??
            }
            () = token.cancelled() => return Err(CdrError::Cancelled),
        };
        Ok(pick_closest(records, call_time, |r| r.call_start))
    }
}

/// VoIP gateway correlator over a second, simpler CDR table with
/// columns `call_start, dst_number, status, duration, gateway`.
pub struct SqlVoipCdrCorrelator {
    inner: SqlCdrCorrelator,
}

impl SqlVoipCdrCorrelator {
    pub async fn connect(config: &CdrSourceConfig) -> Result<Self, CdrError> {
        Ok(Self {
            inner: SqlCdrCorrelator::connect(config).await?,
        })
    }

    fn query(&self, mysql: bool) -> String {
        let placeholders: [&str; 3] = if mysql {
            ["?", "?", "?"]
        } else {
            ["$1", "$2", "$3"]
        };
        format!(
            "SELECT call_start, dst_number, status, \
                    CAST(duration AS {int_type}) AS duration, gateway \
             FROM {table} WHERE dst_number LIKE {p0} AND call_start BETWEEN {p1} AND {p2}",
            int_type = if mysql { "SIGNED" } else { "BIGINT" },
            table = self.inner.table,
            p0 = placeholders[0],
            p1 = placeholders[1],
            p2 = placeholders[2],
        )
    }

    async fn fetch(
        &self,
        phone: &PhoneNumber,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<VoipCdrRecord>, CdrError> {
        let pattern = format!("%{}", phone.suffix(SUFFIX_DIGITS));
        let records = match &self.inner.pool {
            CdrPool::Postgres(pool) => {
                let rows = sqlx::query(&self.query(false))
                    .bind(&pattern)
                    .bind(from)
                    .bind(to)
                    .fetch_all(pool)
                    .await?;
                rows.iter()
                    .map(|row| VoipCdrRecord {
                        call_start: row
                            .try_get::<DateTime<Utc>, _>("call_start")
                            .unwrap_or_else(|_| Utc::now()),
                        dst_number: row.try_get("dst_number").unwrap_or_default(),
                        status: row.try_get("status").unwrap_or_default(),
                        duration: row.try_get::<i64, _>("duration").unwrap_or(0),
                        gateway: row.try_get("gateway").unwrap_or(None),
                    })
                    .collect()
            }
            CdrPool::Mysql(pool) => {
                let rows = sqlx::query(&self.query(true))
                    .bind(&pattern)
                    .bind(from.naive_utc())
                    .bind(to.naive_utc())
                    .fetch_all(pool)
                    .await?;
                rows.iter()
                    .map(|row| VoipCdrRecord {
                        call_start: row
                            .try_get::<chrono::NaiveDateTime, _>("call_start")
                            .map(|t| t.and_utc())
                            .unwrap_or_else(|_| Utc::now()),
                        dst_number: row.try_get("dst_number").unwrap_or_default(),
                        status: row.try_get("status").unwrap_or_default(),
                        duration: row.try_get::<i64, _>("duration").unwrap_or(0),
                        gateway: row.try_get("gateway").unwrap_or(None),
                    })
                    .collect()
            }
        };
        Ok(records)
    }
}

#[async_trait]
impl VoipCdrLookup for SqlVoipCdrCorrelator {
    async fn lookup(
        &self,
        token: &CancellationToken,
        phone: &PhoneNumber,
        call_time: DateTime<Utc>,
    ) -> Result<Option<VoipCdrRecord>, CdrError> {
        let from = call_time - self.inner.window;
        let to = call_time + self.inner.window;
        let fetch = self.fetch(phone, from, to);
        let records = tokio::select! {
            result = tokio::time::timeout(LOOKUP_TIMEOUT, fetch) => {
                result.map_err(|_| CdrError::Timeout(LOOKUP_TIMEOUT))??
            }
            () = token.cancelled() => return Err(CdrError::Cancelled),
        };
        Ok(pick_closest(records, call_time, |r| r.call_start))
    }
}

/// Convenience wrapper for call sites that tolerate lookup failure:
/// logs the error and degrades to `None`.
pub async fn lookup_or_none(
    lookup: Option<&dyn CdrLookup>,
    token: &CancellationToken,
    phone: &PhoneNumber,
    call_time: DateTime<Utc>,
) -> Option<CdrRecord> {
    let source = lookup?;
    match source.lookup(token, phone, call_time).await {
        Ok(record) => record,
        Err(CdrError::Cancelled) => None,
        Err(e) => {
            warn!(%phone, error = %e, "switch CDR lookup failed");
            None
        }
    }
}

/// Same degradation for the VoIP gateway source.
pub async fn lookup_voip_or_none(
    lookup: Option<&dyn VoipCdrLookup>,
    token: &CancellationToken,
    phone: &PhoneNumber,
    call_time: DateTime<Utc>,
) -> Option<VoipCdrRecord> {
    let source = lookup?;
    match source.lookup(token, phone, call_time).await {
        Ok(record) => record,
        Err(CdrError::Cancelled) => None,
        Err(e) => {
            warn!(%phone, error = %e, "voip gateway CDR lookup failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn closest_record_wins() {
        let base = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let times = [
            base - ChronoDuration::seconds(90),
            base + ChronoDuration::seconds(10),
            base + ChronoDuration::seconds(40),
        ];
        let picked = pick_closest(times.to_vec(), base, |t| *t).unwrap();
        assert_eq!(picked, times[1]);
    }

    #[test]
    fn empty_set_yields_none() {
        let base = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        assert_eq!(pick_closest(Vec::<DateTime<Utc>>::new(), base, |t| *t), None);
    }
}
